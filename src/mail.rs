//! Mail gateway: search, attachment download and zip delivery

use mail_builder::MessageBuilder;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::client::MailApi;
use crate::error::{PipelineError, Result};
use crate::models::{AttachmentPart, MailMessage, SendConfirmation};

const FALLBACK_FILENAME: &str = "attachment";

/// Stage-level mail operations over one authenticated session
pub struct MailGateway {
    api: Arc<dyn MailApi>,
}

impl MailGateway {
    pub fn new(api: Arc<dyn MailApi>) -> Self {
        Self { api }
    }

    /// Messages matching `query` that carry at least one attachment
    pub async fn search(&self, query: &str, limit: u32) -> Result<Vec<MailMessage>> {
        let ids = self
            .api
            .list_message_ids(query, limit)
            .await
            .map_err(|e| PipelineError::SearchFailed(e.to_string()))?;

        let mut messages = Vec::with_capacity(ids.len());
        for id in &ids {
            let message = self
                .api
                .get_message(id)
                .await
                .map_err(|e| PipelineError::SearchFailed(e.to_string()))?;
            if message.has_attachments() {
                messages.push(message);
            } else {
                debug!("Message {} has no attachments, skipping", id);
            }
        }

        info!(
            "Search matched {} messages, {} with attachments",
            ids.len(),
            messages.len()
        );
        Ok(messages)
    }

    /// Write every attachment of `messages` into `dir`, never overwriting
    pub async fn download_attachments(
        &self,
        messages: &[MailMessage],
        dir: &Path,
    ) -> Result<Vec<PathBuf>> {
        tokio::fs::create_dir_all(dir).await.map_err(|e| {
            PipelineError::DownloadFailed(format!("Cannot create {}: {}", dir.display(), e))
        })?;

        let mut saved = Vec::new();
        for message in messages {
            for attachment in message.attachments() {
                let Some(bytes) = self.fetch_payload(&attachment).await? else {
                    warn!(
                        "Attachment '{}' in message {} has no data or attachment id, skipping",
                        attachment.filename, attachment.message_id
                    );
                    continue;
                };

                let path = write_unique(dir, &attachment.filename, &bytes).await?;
                debug!("Saved {} ({} bytes)", path.display(), bytes.len());
                saved.push(path);
            }
        }

        info!("Downloaded {} attachments to {}", saved.len(), dir.display());
        Ok(saved)
    }

    async fn fetch_payload(&self, attachment: &AttachmentPart) -> Result<Option<Vec<u8>>> {
        if let Some(data) = &attachment.data {
            return Ok(Some(data.clone()));
        }
        let Some(attachment_id) = &attachment.attachment_id else {
            return Ok(None);
        };

        self.api
            .get_attachment(&attachment.message_id, attachment_id)
            .await
            .map(Some)
            .map_err(|e| {
                PipelineError::DownloadFailed(format!(
                    "Attachment '{}' of message {}: {}",
                    attachment.filename, attachment.message_id, e
                ))
            })
    }

    /// Mail `file_path` to `to` as a single attachment
    pub async fn send(
        &self,
        to: &str,
        subject: &str,
        body: &str,
        file_path: &Path,
    ) -> Result<SendConfirmation> {
        let raw = compose_message(to, subject, body, file_path).await?;

        let confirmation = self
            .api
            .send_raw(raw)
            .await
            .map_err(|e| PipelineError::SendFailed(e.to_string()))?;

        info!(
            "Sent {} to {} (id: {})",
            file_path.display(),
            to,
            confirmation.id.as_deref().unwrap_or("unknown")
        );
        Ok(confirmation)
    }
}

/// Build the RFC 822 bytes for a plain-text message with one attachment
pub async fn compose_message(
    to: &str,
    subject: &str,
    body: &str,
    file_path: &Path,
) -> Result<Vec<u8>> {
    if !file_path.is_file() {
        return Err(PipelineError::AttachmentMissing(file_path.to_path_buf()));
    }

    let content = tokio::fs::read(file_path)
        .await
        .map_err(|e| PipelineError::SendFailed(format!("Cannot read attachment: {}", e)))?;
    let filename = file_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| FALLBACK_FILENAME.to_string());

    MessageBuilder::new()
        .to(to)
        .subject(subject)
        .text_body(body)
        .attachment("application/octet-stream", filename, content)
        .write_to_vec()
        .map_err(|e| PipelineError::SendFailed(format!("Cannot build message: {}", e)))
}

/// Reduce a provider-supplied filename to a safe final path component
pub fn sanitize_filename(name: &str) -> String {
    let last = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    match last {
        "" | "." | ".." => FALLBACK_FILENAME.to_string(),
        other => other.to_string(),
    }
}

/// Name tried on the `n`th collision: `name.ext`, `name_1.ext`, `name_2.ext`, ...
pub fn candidate_name(stem: &str, extension: Option<&str>, n: usize) -> String {
    let stem = if n == 0 {
        stem.to_string()
    } else {
        format!("{}_{}", stem, n)
    };
    match extension {
        Some(ext) => format!("{}.{}", stem, ext),
        None => stem,
    }
}

/// Split a filename into stem and extension the way collision names are built
pub fn split_filename(name: &str) -> (&str, Option<&str>) {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    }
}

/// Create a new file under `dir`, stepping past existing names
async fn write_unique(dir: &Path, filename: &str, bytes: &[u8]) -> Result<PathBuf> {
    use tokio::io::AsyncWriteExt;

    let name = sanitize_filename(filename);
    let (stem, extension) = split_filename(&name);

    let mut n = 0;
    loop {
        let path = dir.join(candidate_name(stem, extension, n));
        let opened = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await;

        match opened {
            Ok(mut file) => {
                let written = async {
                    file.write_all(bytes).await?;
                    file.flush().await
                }
                .await;
                return match written {
                    Ok(()) => Ok(path),
                    Err(e) => Err(PipelineError::DownloadFailed(format!(
                        "Cannot write {}: {}",
                        path.display(),
                        e
                    ))),
                };
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => n += 1,
            Err(e) => {
                return Err(PipelineError::DownloadFailed(format!(
                    "Cannot create {}: {}",
                    path.display(),
                    e
                )))
            }
        }
    }
}
