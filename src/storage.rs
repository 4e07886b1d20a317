//! OneDrive uploads through Microsoft Graph

use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::StorageConfig;
use crate::error::{PipelineError, Result};
use crate::models::UploadDescriptor;

/// Remote drive operations needed by the relay
#[async_trait]
pub trait StorageApi: Send + Sync {
    /// Create or replace the file at `remote_path`, returning the drive item
    async fn put_content(&self, token: &str, remote_path: &str, bytes: Vec<u8>) -> Result<Value>;
}

/// Simple upload against the Graph `/content` endpoint
pub struct GraphDriveClient {
    http: reqwest::Client,
    graph_base: String,
    drive: String,
}

impl GraphDriveClient {
    pub fn new(http: reqwest::Client, graph_base: impl Into<String>, drive: impl Into<String>) -> Self {
        Self {
            http,
            graph_base: graph_base.into(),
            drive: drive.into(),
        }
    }

    pub fn from_config(http: reqwest::Client, config: &StorageConfig) -> Self {
        Self::new(http, config.graph_base.clone(), config.drive.clone())
    }

    /// `{graph_base}/{drive}/root:/{remote_path}:/content`, path segments encoded
    pub fn content_url(&self, remote_path: &str) -> String {
        let encoded: Vec<String> = remote_path
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();

        format!(
            "{}/{}/root:/{}:/content",
            self.graph_base.trim_end_matches('/'),
            self.drive.trim_matches('/'),
            encoded.join("/")
        )
    }
}

#[async_trait]
impl StorageApi for GraphDriveClient {
    async fn put_content(&self, token: &str, remote_path: &str, bytes: Vec<u8>) -> Result<Value> {
        let url = self.content_url(remote_path);
        debug!("PUT {} ({} bytes)", url, bytes.len());

        let response = self
            .http
            .put(&url)
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes)
            .send()
            .await
            .map_err(|e| PipelineError::UploadFailed {
                status: None,
                body: e.to_string(),
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| PipelineError::UploadFailed {
            status: Some(status.as_u16()),
            body: e.to_string(),
        })?;

        if status.as_u16() != 200 && status.as_u16() != 201 {
            return Err(PipelineError::UploadFailed {
                status: Some(status.as_u16()),
                body,
            });
        }

        serde_json::from_str(&body).map_err(|e| PipelineError::UploadFailed {
            status: Some(status.as_u16()),
            body: format!("Unreadable drive item: {}", e),
        })
    }
}

/// Uploads local files and describes what the drive stored
pub struct StorageGateway {
    api: Arc<dyn StorageApi>,
}

impl StorageGateway {
    pub fn new(api: Arc<dyn StorageApi>) -> Self {
        Self { api }
    }

    pub async fn upload(
        &self,
        token: &str,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<UploadDescriptor> {
        if !local_path.is_file() {
            return Err(PipelineError::LocalFileNotFound(local_path.to_path_buf()));
        }

        let bytes = tokio::fs::read(local_path).await?;
        let size = bytes.len();
        let item = self.api.put_content(token, remote_path, bytes).await?;

        info!("Uploaded {} to {} ({} bytes)", local_path.display(), remote_path, size);
        Ok(UploadDescriptor {
            local_path: local_path.to_path_buf(),
            remote_path: remote_path.to_string(),
            id: item.get("id").and_then(Value::as_str).map(str::to_string),
            name: item.get("name").and_then(Value::as_str).map(str::to_string),
            size: item.get("size").and_then(Value::as_u64),
            web_url: item.get("webUrl").and_then(Value::as_str).map(str::to_string),
        })
    }
}

/// Remote path for a local file inside `folder`
pub fn remote_path_for(folder: &str, local_path: &Path) -> String {
    let name = local_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    folder
        .replace('\\', "/")
        .split('/')
        .chain(std::iter::once(name.as_str()))
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}
