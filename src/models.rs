use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// The two remote identities the relay authenticates as
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Mail,
    Storage,
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provider::Mail => write!(f, "mail"),
            Provider::Storage => write!(f, "storage"),
        }
    }
}

/// A message as returned by the mail provider in full format
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MailMessage {
    pub id: String,
    pub thread_id: Option<String>,
    pub payload: Option<MessagePart>,
}

/// One node of a message's MIME tree
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessagePart {
    pub part_id: Option<String>,
    pub mime_type: Option<String>,
    pub filename: Option<String>,
    pub attachment_id: Option<String>,
    /// Body bytes the provider returned inline (small parts only)
    pub data: Option<Vec<u8>>,
    pub size: u64,
    pub parts: Vec<MessagePart>,
}

/// A named attachment found somewhere in a message's MIME tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentPart {
    pub message_id: String,
    pub part_id: Option<String>,
    pub filename: String,
    pub attachment_id: Option<String>,
    pub data: Option<Vec<u8>>,
    pub size: u64,
}

impl MailMessage {
    /// Every part carrying a non-empty filename, nested multiparts included
    pub fn attachments(&self) -> Vec<AttachmentPart> {
        let mut found = Vec::new();
        if let Some(payload) = &self.payload {
            collect_attachments(&self.id, payload, &mut found);
        }
        found
    }

    pub fn has_attachments(&self) -> bool {
        self.payload.as_ref().is_some_and(part_has_attachment)
    }
}

fn part_has_attachment(part: &MessagePart) -> bool {
    part.filename.as_deref().is_some_and(|name| !name.is_empty())
        || part.parts.iter().any(part_has_attachment)
}

fn collect_attachments(message_id: &str, part: &MessagePart, found: &mut Vec<AttachmentPart>) {
    if let Some(filename) = part.filename.as_deref().filter(|name| !name.is_empty()) {
        found.push(AttachmentPart {
            message_id: message_id.to_string(),
            part_id: part.part_id.clone(),
            filename: filename.to_string(),
            attachment_id: part.attachment_id.clone(),
            data: part.data.clone(),
            size: part.size,
        });
    }
    for child in &part.parts {
        collect_attachments(message_id, child, found);
    }
}

/// Confirmation returned by the mail provider after sending
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendConfirmation {
    pub id: Option<String>,
}

/// What the storage provider reported for one uploaded file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadDescriptor {
    pub local_path: PathBuf,
    pub remote_path: String,
    pub id: Option<String>,
    pub name: Option<String>,
    pub size: Option<u64>,
    pub web_url: Option<String>,
}
