use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::models::Provider;
use crate::pipeline::Stage;

/// Type alias for Result with PipelineError
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Every failure the relay can surface to a caller
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A required tool input was absent
    #[error("Missing required input: {0}")]
    MissingInput(String),

    /// A tool input was present but unusable
    #[error("Invalid input '{field}': {reason}")]
    InvalidInput { field: String, reason: String },

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// No client configuration exists to start a grant flow
    #[error("Credentials unavailable for {provider}: {message}")]
    CredentialUnavailable { provider: Provider, message: String },

    /// The interactive or non-interactive grant flow failed or was abandoned
    #[error("Grant flow failed for {provider}: {message}")]
    GrantFailed { provider: Provider, message: String },

    /// Silent refresh failed; the credential store falls back to a new grant
    #[error("Token refresh failed for {provider}: {message}")]
    RefreshFailed { provider: Provider, message: String },

    #[error("Mail search failed: {0}")]
    SearchFailed(String),

    #[error("Attachment download failed: {0}")]
    DownloadFailed(String),

    #[error("Upload failed: {}", upload_detail(.status, .body))]
    UploadFailed { status: Option<u16>, body: String },

    #[error("Local file not found: {}", .0.display())]
    LocalFileNotFound(PathBuf),

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Attachment not found: {}", .0.display())]
    AttachmentMissing(PathBuf),

    #[error("File does not exist: {}", .0.display())]
    SourceMissing(PathBuf),

    #[error("Invocation exceeded its deadline of {0:?}")]
    Timeout(Duration),

    /// A stage failure, carrying the stage name alongside the original error
    #[error("{stage} stage failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<PipelineError>,
    },

    /// Gmail API returned an error
    #[error("Gmail API error: {0}")]
    ApiError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Unhandled error: {0}")]
    Unhandled(String),
}

fn upload_detail(status: &Option<u16>, body: &str) -> String {
    match status {
        Some(status) => format!("HTTP {} - {}", status, body),
        None => body.to_string(),
    }
}

/// Failure category reported at the boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    MissingInput,
    InvalidInput,
    UnknownTool,
    CredentialUnavailable,
    GrantFailed,
    RefreshFailed,
    SearchFailed,
    DownloadFailed,
    UploadFailed,
    LocalFileNotFound,
    SendFailed,
    AttachmentMissing,
    SourceMissing,
    Timeout,
    Config,
    Unhandled,
}

impl ErrorCategory {
    /// Caller errors are detected without touching either provider
    pub fn is_caller_error(self) -> bool {
        matches!(
            self,
            ErrorCategory::MissingInput
                | ErrorCategory::InvalidInput
                | ErrorCategory::UnknownTool
                | ErrorCategory::LocalFileNotFound
                | ErrorCategory::AttachmentMissing
                | ErrorCategory::SourceMissing
        )
    }

    pub fn is_auth_error(self) -> bool {
        matches!(
            self,
            ErrorCategory::CredentialUnavailable
                | ErrorCategory::GrantFailed
                | ErrorCategory::RefreshFailed
        )
    }
}

/// Structured error returned across the tool boundary
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub category: ErrorCategory,
    pub stage: Option<Stage>,
    pub message: String,
}

impl PipelineError {
    /// Attribute this error to a pipeline stage, unless it already is
    pub fn in_stage(self, stage: Stage) -> Self {
        match self {
            PipelineError::Stage { .. } => self,
            other => PipelineError::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// The stage the error was raised in, if any
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineError::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// The innermost error, with stage wrappers removed
    pub fn root(&self) -> &PipelineError {
        match self {
            PipelineError::Stage { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self.root() {
            PipelineError::MissingInput(_) => ErrorCategory::MissingInput,
            PipelineError::InvalidInput { .. } => ErrorCategory::InvalidInput,
            PipelineError::UnknownTool(_) => ErrorCategory::UnknownTool,
            PipelineError::CredentialUnavailable { .. } => ErrorCategory::CredentialUnavailable,
            PipelineError::GrantFailed { .. } => ErrorCategory::GrantFailed,
            PipelineError::RefreshFailed { .. } => ErrorCategory::RefreshFailed,
            PipelineError::SearchFailed(_) => ErrorCategory::SearchFailed,
            PipelineError::DownloadFailed(_) => ErrorCategory::DownloadFailed,
            PipelineError::UploadFailed { .. } => ErrorCategory::UploadFailed,
            PipelineError::LocalFileNotFound(_) => ErrorCategory::LocalFileNotFound,
            PipelineError::SendFailed(_) => ErrorCategory::SendFailed,
            PipelineError::AttachmentMissing(_) => ErrorCategory::AttachmentMissing,
            PipelineError::SourceMissing(_) => ErrorCategory::SourceMissing,
            PipelineError::Timeout(_) => ErrorCategory::Timeout,
            PipelineError::ConfigError(_) => ErrorCategory::Config,
            PipelineError::Stage { .. }
            | PipelineError::ApiError(_)
            | PipelineError::IoError(_)
            | PipelineError::SerializationError(_)
            | PipelineError::Unhandled(_) => ErrorCategory::Unhandled,
        }
    }

    pub fn to_error_body(&self) -> ErrorBody {
        ErrorBody {
            category: self.category(),
            stage: self.stage(),
            message: self.to_string(),
        }
    }
}

impl From<google_gmail1::Error> for PipelineError {
    fn from(error: google_gmail1::Error) -> Self {
        match error {
            google_gmail1::Error::Failure(ref response) => {
                let status = response.status();
                PipelineError::ApiError(format!(
                    "HTTP {}: {}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("Unknown")
                ))
            }
            google_gmail1::Error::BadRequest(ref err) => {
                PipelineError::ApiError(format!("Bad request: {}", err))
            }
            google_gmail1::Error::HttpError(ref err) => {
                PipelineError::ApiError(format!("Connection error: {}", err))
            }
            google_gmail1::Error::Io(err) => PipelineError::ApiError(err.to_string()),
            _ => PipelineError::ApiError(error.to_string()),
        }
    }
}
