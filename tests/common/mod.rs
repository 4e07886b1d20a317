//! Common test utilities and fixtures
#![allow(dead_code)]

use async_trait::async_trait;
use attachment_relay::auth::{CredentialStore, ProviderCredentials, Token};
use attachment_relay::client::{MailApi, MailConnector};
use attachment_relay::error::{PipelineError, Result};
use attachment_relay::grant::{GrantKind, GrantStrategy};
use attachment_relay::models::{MailMessage, MessagePart, Provider, SendConfirmation};
use attachment_relay::pipeline::{Orchestrator, PipelineSettings};
use attachment_relay::storage::StorageApi;
use chrono::{Duration as ChronoDuration, Utc};
use mockall::mock;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

mock! {
    pub MailApi {}

    #[async_trait]
    impl MailApi for MailApi {
        async fn list_message_ids(&self, query: &str, max_results: u32) -> Result<Vec<String>>;
        async fn get_message(&self, id: &str) -> Result<MailMessage>;
        async fn get_attachment(&self, message_id: &str, attachment_id: &str) -> Result<Vec<u8>>;
        async fn send_raw(&self, raw: Vec<u8>) -> Result<SendConfirmation>;
    }
}

mock! {
    pub StorageApi {}

    #[async_trait]
    impl StorageApi for StorageApi {
        async fn put_content(&self, token: &str, remote_path: &str, bytes: Vec<u8>) -> Result<Value>;
    }
}

/// Hands out the same session for every token and counts connections
pub struct FixedConnector {
    api: Arc<dyn MailApi>,
    connects: AtomicUsize,
}

impl FixedConnector {
    pub fn new(api: Arc<dyn MailApi>) -> Self {
        Self {
            api,
            connects: AtomicUsize::new(0),
        }
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl MailConnector for FixedConnector {
    fn connect(&self, _token: &Token) -> Result<Arc<dyn MailApi>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::clone(&self.api))
    }
}

/// Grant strategy that never leaves the process
pub struct StaticGrant {
    provider: Provider,
    grants: AtomicUsize,
    fail: bool,
}

impl StaticGrant {
    pub fn new(provider: Provider) -> Arc<Self> {
        Arc::new(Self {
            provider,
            grants: AtomicUsize::new(0),
            fail: false,
        })
    }

    pub fn failing(provider: Provider) -> Arc<Self> {
        Arc::new(Self {
            provider,
            grants: AtomicUsize::new(0),
            fail: true,
        })
    }

    pub fn count(&self) -> usize {
        self.grants.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GrantStrategy for StaticGrant {
    fn kind(&self) -> GrantKind {
        GrantKind::ClientCredentials
    }

    async fn grant(&self, scopes: &[String]) -> Result<Token> {
        self.grants.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(PipelineError::GrantFailed {
                provider: self.provider,
                message: "authorization_declined".to_string(),
            });
        }
        Ok(Token {
            access_token: format!("{}-token", self.provider),
            refresh_token: None,
            expires_at: Some(Utc::now() + ChronoDuration::hours(1)),
            scopes: scopes.to_vec(),
        })
    }

    async fn refresh(&self, _token: &Token, _scopes: &[String]) -> Result<Token> {
        Err(PipelineError::RefreshFailed {
            provider: self.provider,
            message: "not supported".to_string(),
        })
    }
}

/// Orchestrator wired to doubles, with its directories kept alive
pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub connector: Arc<FixedConnector>,
    pub mail_grant: Arc<StaticGrant>,
    pub storage_grant: Arc<StaticGrant>,
    pub workspace_root: TempDir,
    pub files: TempDir,
}

impl Harness {
    pub fn new(mail: MockMailApi, storage: MockStorageApi) -> Self {
        Self::build(
            Arc::new(mail),
            Arc::new(storage),
            StaticGrant::new(Provider::Mail),
            StaticGrant::new(Provider::Storage),
        )
    }

    pub fn build(
        mail: Arc<dyn MailApi>,
        storage: Arc<dyn StorageApi>,
        mail_grant: Arc<StaticGrant>,
        storage_grant: Arc<StaticGrant>,
    ) -> Self {
        let workspace_root = TempDir::new().unwrap();
        let files = TempDir::new().unwrap();

        let credentials = CredentialStore::new(
            ProviderCredentials::new(
                Provider::Mail,
                files.path().join("token.json"),
                vec!["https://www.googleapis.com/auth/gmail.send".to_string()],
                Arc::clone(&mail_grant) as Arc<dyn GrantStrategy>,
            ),
            ProviderCredentials::new(
                Provider::Storage,
                files.path().join("msal_token.json"),
                vec!["Files.ReadWrite.All".to_string()],
                Arc::clone(&storage_grant) as Arc<dyn GrantStrategy>,
            ),
        );

        let connector = Arc::new(FixedConnector::new(mail));
        let settings = PipelineSettings {
            workspace_root: Some(workspace_root.path().to_path_buf()),
            workspace_prefix: "mcp_work_".to_string(),
            invocation_timeout: Duration::from_secs(30),
        };

        let orchestrator = Arc::new(Orchestrator::new(
            Arc::new(credentials),
            Arc::clone(&connector) as Arc<dyn MailConnector>,
            storage,
            settings,
        ));

        Self {
            orchestrator,
            connector,
            mail_grant,
            storage_grant,
            workspace_root,
            files,
        }
    }

    /// Workspaces still present under the root
    pub fn workspace_entries(&self) -> usize {
        std::fs::read_dir(self.workspace_root.path()).unwrap().count()
    }

    /// Write a file in the scratch directory and return its absolute path
    pub fn file(&self, name: &str, content: &[u8]) -> PathBuf {
        let path = self.files.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }
}

/// A multipart message with one attachment fetched by id
pub fn message_with_attachment(id: &str, filename: &str, attachment_id: &str) -> MailMessage {
    MailMessage {
        id: id.to_string(),
        thread_id: Some(format!("thread_{}", id)),
        payload: Some(MessagePart {
            mime_type: Some("multipart/mixed".to_string()),
            parts: vec![
                MessagePart {
                    part_id: Some("0".to_string()),
                    mime_type: Some("text/plain".to_string()),
                    filename: Some(String::new()),
                    data: Some(b"See attachment".to_vec()),
                    ..Default::default()
                },
                MessagePart {
                    part_id: Some("1".to_string()),
                    mime_type: Some("application/octet-stream".to_string()),
                    filename: Some(filename.to_string()),
                    attachment_id: Some(attachment_id.to_string()),
                    size: 1024,
                    ..Default::default()
                },
            ],
            ..Default::default()
        }),
    }
}

/// A message whose single attachment arrived inline
pub fn message_with_inline(id: &str, filename: &str, data: &[u8]) -> MailMessage {
    MailMessage {
        id: id.to_string(),
        thread_id: Some(format!("thread_{}", id)),
        payload: Some(MessagePart {
            mime_type: Some("multipart/mixed".to_string()),
            parts: vec![MessagePart {
                part_id: Some("1".to_string()),
                filename: Some(filename.to_string()),
                data: Some(data.to_vec()),
                size: data.len() as u64,
                ..Default::default()
            }],
            ..Default::default()
        }),
    }
}

pub fn message_without_attachment(id: &str) -> MailMessage {
    MailMessage {
        id: id.to_string(),
        thread_id: None,
        payload: Some(MessagePart {
            mime_type: Some("text/plain".to_string()),
            data: Some(b"just text".to_vec()),
            ..Default::default()
        }),
    }
}

/// Drive item JSON as returned by Graph after an upload
pub fn drive_item(name: &str, size: usize) -> Value {
    json!({
        "id": format!("item-{}", name),
        "name": name,
        "size": size,
        "webUrl": format!("https://onedrive.example/{}", name)
    })
}
