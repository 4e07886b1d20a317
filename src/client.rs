//! Gmail API client
//!
//! `MailApi` is the per-session surface the mail gateway talks to. A session
//! is opened from a bearer token by a `MailConnector`, so every invocation
//! sees the token the credential store just handed out.

use async_trait::async_trait;
use google_gmail1::{
    api::{Message, MessagePart as ApiMessagePart},
    hyper_rustls, hyper_util, Gmail,
};
use std::io::Cursor;
use std::sync::Arc;
use tracing::debug;

use crate::auth::Token;
use crate::error::{PipelineError, Result};
use crate::models::{MailMessage, MessagePart, SendConfirmation};

/// Type alias for Gmail Hub to simplify type signatures
pub type GmailHub =
    Gmail<hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>>;

/// Gmail's page size ceiling for `messages.list`
const MAX_PAGE_SIZE: u32 = 500;

/// One authenticated mail session
#[async_trait]
pub trait MailApi: Send + Sync {
    /// List up to `max_results` message ids matching a Gmail search query
    async fn list_message_ids(&self, query: &str, max_results: u32) -> Result<Vec<String>>;

    /// Fetch a message with its full MIME tree
    async fn get_message(&self, id: &str) -> Result<MailMessage>;

    async fn get_attachment(&self, message_id: &str, attachment_id: &str) -> Result<Vec<u8>>;

    /// Submit an RFC 822 message
    async fn send_raw(&self, raw: Vec<u8>) -> Result<SendConfirmation>;
}

/// Opens mail sessions from bearer tokens
pub trait MailConnector: Send + Sync {
    fn connect(&self, token: &Token) -> Result<Arc<dyn MailApi>>;
}

/// Production mail session backed by the Gmail hub
pub struct GmailClient {
    hub: GmailHub,
}

impl GmailClient {
    pub fn new(hub: GmailHub) -> Self {
        Self { hub }
    }

    pub fn hub(&self) -> &GmailHub {
        &self.hub
    }
}

#[async_trait]
impl MailApi for GmailClient {
    async fn list_message_ids(&self, query: &str, max_results: u32) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;

        while (ids.len() as u32) < max_results {
            let remaining = (max_results - ids.len() as u32).min(MAX_PAGE_SIZE);
            let mut call = self
                .hub
                .users()
                .messages_list("me")
                .q(query)
                .max_results(remaining);

            if let Some(token) = page_token.as_ref() {
                call = call.page_token(token);
            }

            let (_, response) = call.doit().await?;

            ids.extend(
                response
                    .messages
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|message| message.id),
            );

            page_token = response.next_page_token;
            if page_token.is_none() {
                break;
            }
        }

        ids.truncate(max_results as usize);
        debug!("Listed {} message ids for query '{}'", ids.len(), query);
        Ok(ids)
    }

    async fn get_message(&self, id: &str) -> Result<MailMessage> {
        let (_, message) = self
            .hub
            .users()
            .messages_get("me", id)
            .format("full")
            .doit()
            .await?;

        convert_message(id, message)
    }

    async fn get_attachment(&self, message_id: &str, attachment_id: &str) -> Result<Vec<u8>> {
        let (_, body) = self
            .hub
            .users()
            .messages_attachments_get("me", message_id, attachment_id)
            .doit()
            .await?;

        body.data.ok_or_else(|| {
            PipelineError::ApiError(format!(
                "Attachment {} of message {} returned no data",
                attachment_id, message_id
            ))
        })
    }

    async fn send_raw(&self, raw: Vec<u8>) -> Result<SendConfirmation> {
        let content_type: mime::Mime = "message/rfc822"
            .parse()
            .map_err(|e| PipelineError::Unhandled(format!("Invalid MIME type: {}", e)))?;

        let (_, sent) = self
            .hub
            .users()
            .messages_send(Message::default(), "me")
            .upload(Cursor::new(raw), content_type)
            .await?;

        Ok(SendConfirmation { id: sent.id })
    }
}

fn convert_message(requested_id: &str, message: Message) -> Result<MailMessage> {
    Ok(MailMessage {
        id: message.id.unwrap_or_else(|| requested_id.to_string()),
        thread_id: message.thread_id,
        payload: message.payload.map(convert_part),
    })
}

fn convert_part(part: ApiMessagePart) -> MessagePart {
    let (attachment_id, data, size) = match part.body {
        Some(body) => (
            body.attachment_id,
            body.data,
            body.size.unwrap_or_default().max(0) as u64,
        ),
        None => (None, None, 0),
    };

    MessagePart {
        part_id: part.part_id,
        mime_type: part.mime_type,
        filename: part.filename,
        attachment_id,
        data,
        size,
        parts: part
            .parts
            .unwrap_or_default()
            .into_iter()
            .map(convert_part)
            .collect(),
    }
}

/// Builds a Gmail hub per session, authenticated with the bearer string
pub struct GmailConnector;

impl MailConnector for GmailConnector {
    fn connect(&self, token: &Token) -> Result<Arc<dyn MailApi>> {
        let client =
            hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
                .build(
                    hyper_rustls::HttpsConnectorBuilder::new()
                        .with_native_roots()
                        .map_err(|e| {
                            PipelineError::Unhandled(format!("Failed to load TLS roots: {}", e))
                        })?
                        .https_or_http()
                        .enable_http1()
                        .build(),
                );

        let hub = Gmail::new(client, token.access_token.clone());
        Ok(Arc::new(GmailClient::new(hub)))
    }
}
