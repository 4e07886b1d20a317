//! Tool orchestration
//!
//! Every invocation validates its input, creates a fresh workspace, runs its
//! stages strictly in order and removes the workspace on the way out, whether
//! it finished, failed or was cancelled by the deadline.

use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::archive;
use crate::auth::{CredentialStore, Token};
use crate::client::{GmailConnector, MailConnector};
use crate::config::{Config, ServerConfig};
use crate::error::{PipelineError, Result};
use crate::grant::ConsolePrompt;
use crate::mail::MailGateway;
use crate::models::{Provider, SendConfirmation, UploadDescriptor};
use crate::storage::{remote_path_for, GraphDriveClient, StorageApi, StorageGateway};
use crate::tools::ToolRequest;
use crate::workspace::Workspace;

const DEFAULT_BODY: &str = "See attached zip.";

/// Stage names attached to failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Search,
    Download,
    Upload,
    Archive,
    Send,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Search => write!(f, "search"),
            Stage::Download => write!(f, "download"),
            Stage::Upload => write!(f, "upload"),
            Stage::Archive => write!(f, "archive"),
            Stage::Send => write!(f, "send"),
        }
    }
}

/// Lifecycle of one invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Start,
    WorkspaceReady,
    Searched,
    Downloaded,
    Uploaded,
    Archived,
    Sent,
    Done,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Start => "START",
            PipelineState::WorkspaceReady => "WORKSPACE_READY",
            PipelineState::Searched => "SEARCHED",
            PipelineState::Downloaded => "DOWNLOADED",
            PipelineState::Uploaded => "UPLOADED",
            PipelineState::Archived => "ARCHIVED",
            PipelineState::Sent => "SENT",
            PipelineState::Done => "DONE",
            PipelineState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Tracks the state of a single invocation
#[derive(Debug)]
struct Run {
    state: PipelineState,
}

impl Run {
    fn new() -> Self {
        Self {
            state: PipelineState::Start,
        }
    }

    fn advance(&mut self, next: PipelineState) {
        if self.state.is_terminal() {
            return;
        }
        debug!(from = %self.state, to = %next, "State transition");
        self.state = next;
    }

    fn fail(&mut self, error: &PipelineError) {
        if self.state.is_terminal() {
            return;
        }
        warn!(from = %self.state, "Invocation failed: {}", error);
        self.state = PipelineState::Failed;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    NoMessagesFound,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadOutput {
    pub status: RunStatus,
    pub downloaded_files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadOutput {
    pub uploaded: Vec<UploadDescriptor>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompressOutput {
    pub zip_path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct SendOutput {
    pub result: SendConfirmation,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutput {
    pub status: RunStatus,
    pub downloaded_files: Vec<PathBuf>,
    pub uploaded: Vec<UploadDescriptor>,
    pub zip_path: Option<PathBuf>,
    pub send_result: Option<SendConfirmation>,
}

/// Result of a successful invocation, serialized as the tool's output
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ToolOutput {
    Download(DownloadOutput),
    Upload(UploadOutput),
    Compress(CompressOutput),
    Send(SendOutput),
    Pipeline(PipelineOutput),
}

/// Workspace and deadline settings for invocations
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub workspace_root: Option<PathBuf>,
    pub workspace_prefix: String,
    pub invocation_timeout: Duration,
}

impl PipelineSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            workspace_root: config.workspace_root.clone(),
            workspace_prefix: config.workspace_prefix.clone(),
            invocation_timeout: Duration::from_secs(config.invocation_timeout_secs),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}

/// Runs tool invocations against the mail and storage providers
pub struct Orchestrator {
    credentials: Arc<CredentialStore>,
    mail: Arc<dyn MailConnector>,
    storage: StorageGateway,
    settings: PipelineSettings,
}

impl Orchestrator {
    pub fn new(
        credentials: Arc<CredentialStore>,
        mail: Arc<dyn MailConnector>,
        storage: Arc<dyn StorageApi>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            credentials,
            mail,
            storage: StorageGateway::new(storage),
            settings,
        }
    }

    /// Wire the production Gmail and Graph clients from configuration
    pub fn from_config(config: &Config) -> Self {
        let http = reqwest::Client::new();
        let credentials = Arc::new(CredentialStore::from_config(
            config,
            http.clone(),
            Arc::new(ConsolePrompt),
        ));

        Self::new(
            credentials,
            Arc::new(GmailConnector),
            Arc::new(GraphDriveClient::from_config(http, &config.storage)),
            PipelineSettings::from_config(&config.server),
        )
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Validate and execute one tool call under the invocation deadline
    pub async fn run(&self, tool: &str, input: &Value) -> Result<ToolOutput> {
        let request = ToolRequest::parse(tool, input)?;
        self.run_with_deadline(request, self.settings.invocation_timeout)
            .await
    }

    pub async fn run_with_deadline(
        &self,
        request: ToolRequest,
        deadline: Duration,
    ) -> Result<ToolOutput> {
        let tool = request.tool();
        match tokio::time::timeout(deadline, self.execute(request)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(tool = %tool, "Invocation exceeded its deadline of {:?}", deadline);
                Err(PipelineError::Timeout(deadline))
            }
        }
    }

    /// Execute a validated request without a deadline
    pub async fn execute(&self, request: ToolRequest) -> Result<ToolOutput> {
        let span = info_span!(
            "invocation",
            id = %uuid::Uuid::new_v4(),
            tool = %request.tool()
        );

        async move {
            let mut run = Run::new();
            let result = self.dispatch(request, &mut run).await;
            match &result {
                Ok(_) => {
                    run.advance(PipelineState::Done);
                    info!("Invocation completed");
                }
                Err(e) => run.fail(e),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn dispatch(&self, request: ToolRequest, run: &mut Run) -> Result<ToolOutput> {
        let workspace = Workspace::create(
            self.settings.workspace_root.as_deref(),
            &self.settings.workspace_prefix,
        )?;
        run.advance(PipelineState::WorkspaceReady);

        let output = match request {
            ToolRequest::SearchAndDownload {
                query,
                max_results,
                download_dir,
            } => {
                let dir = match download_dir {
                    Some(dir) => resolve_local(&dir)?,
                    None => workspace.path().to_path_buf(),
                };
                self.search_and_download(&query, max_results, &dir, run)
                    .await
                    .map(ToolOutput::Download)
            }
            ToolRequest::Upload {
                local_paths,
                remote_folder_path,
            } => self
                .upload(&local_paths, &remote_folder_path, run)
                .await
                .map(|uploaded| ToolOutput::Upload(UploadOutput { uploaded })),
            ToolRequest::Compress {
                local_paths,
                output_zip,
            } => {
                let sources = local_paths
                    .iter()
                    .map(|path| resolve_local(path))
                    .collect::<Result<Vec<_>>>()?;
                let output = workspace.resolve(&output_zip);
                self.compress(&sources, &output, run)
                    .await
                    .map(|zip_path| ToolOutput::Compress(CompressOutput { zip_path }))
            }
            ToolRequest::SendZip {
                to,
                subject,
                body,
                zip_path,
            } => {
                let zip_path = resolve_local(&zip_path)?;
                self.send(&to, &subject, &body, &zip_path, run)
                    .await
                    .map(|result| ToolOutput::Send(SendOutput { result }))
            }
            ToolRequest::FullPipeline {
                query,
                max_results,
                onedrive_folder,
                recipient_email,
                zip_name,
                subject,
                body,
            } => {
                let subject = subject.unwrap_or_else(|| format!("Files: {}", zip_name));
                let body = body.unwrap_or_else(|| DEFAULT_BODY.to_string());
                self.full_pipeline(
                    &workspace,
                    FullPipelineParams {
                        query: &query,
                        max_results,
                        onedrive_folder: &onedrive_folder,
                        recipient_email: &recipient_email,
                        zip_name: &zip_name,
                        subject: &subject,
                        body: &body,
                    },
                    run,
                )
                .await
                .map(ToolOutput::Pipeline)
            }
        };

        workspace.close();
        output
    }

    async fn token(&self, provider: Provider, stage: Stage) -> Result<Token> {
        self.credentials
            .acquire(provider)
            .await
            .map_err(|e| e.in_stage(stage))
    }

    async fn mail_gateway(&self, stage: Stage) -> Result<MailGateway> {
        let token = self.token(Provider::Mail, stage).await?;
        let api = self.mail.connect(&token).map_err(|e| e.in_stage(stage))?;
        Ok(MailGateway::new(api))
    }

    async fn search_and_download(
        &self,
        query: &str,
        max_results: u32,
        dir: &Path,
        run: &mut Run,
    ) -> Result<DownloadOutput> {
        let mail = self.mail_gateway(Stage::Search).await?;
        let messages = mail
            .search(query, max_results)
            .await
            .map_err(|e| e.in_stage(Stage::Search))?;
        run.advance(PipelineState::Searched);

        if messages.is_empty() {
            info!("No messages with attachments matched '{}'", query);
            return Ok(DownloadOutput {
                status: RunStatus::NoMessagesFound,
                downloaded_files: Vec::new(),
            });
        }

        let downloaded_files = mail
            .download_attachments(&messages, dir)
            .await
            .map_err(|e| e.in_stage(Stage::Download))?;
        run.advance(PipelineState::Downloaded);

        Ok(DownloadOutput {
            status: RunStatus::Completed,
            downloaded_files,
        })
    }

    async fn upload(
        &self,
        local_paths: &[PathBuf],
        folder: &str,
        run: &mut Run,
    ) -> Result<Vec<UploadDescriptor>> {
        let paths = local_paths
            .iter()
            .map(|path| resolve_local(path))
            .collect::<Result<Vec<_>>>()?;

        if let Some(missing) = paths.iter().find(|path| !path.is_file()) {
            return Err(PipelineError::LocalFileNotFound(missing.clone()).in_stage(Stage::Upload));
        }

        let uploaded = self.upload_files(&paths, folder).await?;
        run.advance(PipelineState::Uploaded);
        Ok(uploaded)
    }

    async fn upload_files(&self, paths: &[PathBuf], folder: &str) -> Result<Vec<UploadDescriptor>> {
        let token = self.token(Provider::Storage, Stage::Upload).await?;

        let mut uploaded = Vec::with_capacity(paths.len());
        for path in paths {
            let remote_path = remote_path_for(folder, path);
            let descriptor = self
                .storage
                .upload(&token.access_token, path, &remote_path)
                .await
                .map_err(|e| e.in_stage(Stage::Upload))?;
            uploaded.push(descriptor);
        }

        info!("Uploaded {} files to '{}'", uploaded.len(), folder);
        Ok(uploaded)
    }

    async fn compress(&self, sources: &[PathBuf], output: &Path, run: &mut Run) -> Result<PathBuf> {
        let zip_path = archive::compress(sources, output)
            .await
            .map_err(|e| e.in_stage(Stage::Archive))?;
        run.advance(PipelineState::Archived);
        Ok(zip_path)
    }

    async fn send(
        &self,
        to: &str,
        subject: &str,
        body: &str,
        zip_path: &Path,
        run: &mut Run,
    ) -> Result<SendConfirmation> {
        if !zip_path.is_file() {
            return Err(PipelineError::AttachmentMissing(zip_path.to_path_buf()).in_stage(Stage::Send));
        }

        let mail = self.mail_gateway(Stage::Send).await?;
        let confirmation = mail
            .send(to, subject, body, zip_path)
            .await
            .map_err(|e| e.in_stage(Stage::Send))?;
        run.advance(PipelineState::Sent);
        Ok(confirmation)
    }

    async fn full_pipeline(
        &self,
        workspace: &Workspace,
        params: FullPipelineParams<'_>,
        run: &mut Run,
    ) -> Result<PipelineOutput> {
        let download = self
            .search_and_download(params.query, params.max_results, workspace.path(), run)
            .await?;

        if download.status == RunStatus::NoMessagesFound {
            return Ok(PipelineOutput {
                status: RunStatus::NoMessagesFound,
                downloaded_files: Vec::new(),
                uploaded: Vec::new(),
                zip_path: None,
                send_result: None,
            });
        }

        let files = download.downloaded_files;
        let uploaded = self.upload_files(&files, params.onedrive_folder).await?;
        run.advance(PipelineState::Uploaded);

        let zip_path = self
            .compress(&files, &workspace.resolve(zip_file_name(params.zip_name)), run)
            .await?;

        let send_result = self
            .send(params.recipient_email, params.subject, params.body, &zip_path, run)
            .await?;

        Ok(PipelineOutput {
            status: RunStatus::Completed,
            downloaded_files: files,
            uploaded,
            zip_path: Some(zip_path),
            send_result: Some(send_result),
        })
    }
}

struct FullPipelineParams<'a> {
    query: &'a str,
    max_results: u32,
    onedrive_folder: &'a str,
    recipient_email: &'a str,
    zip_name: &'a str,
    subject: &'a str,
    body: &'a str,
}

/// `zip_name` with a `.zip` extension appended when absent
pub fn zip_file_name(zip_name: &str) -> String {
    if zip_name.to_ascii_lowercase().ends_with(".zip") {
        zip_name.to_string()
    } else {
        format!("{}.zip", zip_name)
    }
}

/// Resolve a caller path against the process working directory
fn resolve_local(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir()?.join(path))
}
