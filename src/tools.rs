//! Tool registry: names, input schemas and typed request parsing

use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Number, Value};
use std::fmt;
use std::path::PathBuf;

use crate::error::{PipelineError, Result};

/// Upper bound accepted for `max_results`
pub const MAX_RESULTS_LIMIT: u32 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolName {
    SearchAndDownloadAttachments,
    UploadToOnedrive,
    CompressFiles,
    SendZipViaEmail,
    OrchestrateFullPipeline,
}

impl ToolName {
    pub const ALL: [ToolName; 5] = [
        ToolName::SearchAndDownloadAttachments,
        ToolName::UploadToOnedrive,
        ToolName::CompressFiles,
        ToolName::SendZipViaEmail,
        ToolName::OrchestrateFullPipeline,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ToolName::SearchAndDownloadAttachments => "search_and_download_attachments",
            ToolName::UploadToOnedrive => "upload_to_onedrive",
            ToolName::CompressFiles => "compress_files",
            ToolName::SendZipViaEmail => "send_zip_via_email",
            ToolName::OrchestrateFullPipeline => "orchestrate_full_pipeline",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|tool| tool.as_str() == name)
            .ok_or_else(|| PipelineError::UnknownTool(name.to_string()))
    }

    pub fn title(self) -> &'static str {
        match self {
            ToolName::SearchAndDownloadAttachments => "Search Gmail and download attachments",
            ToolName::UploadToOnedrive => "Upload files to OneDrive",
            ToolName::CompressFiles => "Compress files into zip",
            ToolName::SendZipViaEmail => "Send zip via Gmail",
            ToolName::OrchestrateFullPipeline => "Full pipeline: search -> upload -> zip -> send",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            ToolName::SearchAndDownloadAttachments => {
                "Searches Gmail for messages matching a query and downloads their attachments."
            }
            ToolName::UploadToOnedrive => "Uploads local files to a OneDrive folder.",
            ToolName::CompressFiles => "Compresses a list of local files into a zip archive.",
            ToolName::SendZipViaEmail => "Sends a zip file as an attachment via Gmail.",
            ToolName::OrchestrateFullPipeline => {
                "Searches Gmail, downloads attachments, uploads them to OneDrive, compresses them and mails the zip."
            }
        }
    }

    /// Required inputs, in the order they are validated
    pub fn required(self) -> &'static [&'static str] {
        match self {
            ToolName::SearchAndDownloadAttachments => &["query", "max_results"],
            ToolName::UploadToOnedrive => &["local_paths", "remote_folder_path"],
            ToolName::CompressFiles => &["local_paths", "output_zip"],
            ToolName::SendZipViaEmail => &["to", "subject", "body", "zip_path"],
            ToolName::OrchestrateFullPipeline => &[
                "query",
                "max_results",
                "onedrive_folder",
                "recipient_email",
                "zip_name",
            ],
        }
    }

    /// JSON schema generated from the tool's input struct
    pub fn input_schema(self) -> Value {
        let schema = match self {
            ToolName::SearchAndDownloadAttachments => schema_for!(SearchInput),
            ToolName::UploadToOnedrive => schema_for!(UploadInput),
            ToolName::CompressFiles => schema_for!(CompressInput),
            ToolName::SendZipViaEmail => schema_for!(SendZipInput),
            ToolName::OrchestrateFullPipeline => schema_for!(FullPipelineInput),
        };
        schema.to_value()
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata advertised for every tool, keyed by name
pub fn definitions() -> Value {
    let tools: Map<String, Value> = ToolName::ALL
        .into_iter()
        .map(|tool| {
            (
                tool.as_str().to_string(),
                json!({
                    "title": tool.title(),
                    "description": tool.description(),
                    "input_schema": tool.input_schema(),
                }),
            )
        })
        .collect();
    Value::Object(tools)
}

/// A count given as a JSON integer or a string holding one
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum Count {
    Number(Number),
    Text(String),
}

impl Count {
    fn as_i64(&self) -> Option<i64> {
        match self {
            Count::Number(number) => number.as_i64(),
            Count::Text(text) => text.trim().parse().ok(),
        }
    }
}

/// Input: search Gmail and download attachments
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct SearchInput {
    /// Gmail search query (e.g. `has:attachment from:someone@example.com`)
    pub query: String,
    /// Messages to inspect (1..500)
    pub max_results: Count,
    /// Directory that keeps the files after the call; relative paths resolve
    /// against the server working directory
    #[serde(default)]
    pub download_dir: Option<PathBuf>,
}

/// Input: upload local files to a OneDrive folder
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct UploadInput {
    /// Local files to upload
    pub local_paths: Vec<PathBuf>,
    /// Folder in OneDrive (e.g. `MyFolder/Sub`)
    pub remote_folder_path: String,
}

/// Input: compress local files into a zip
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct CompressInput {
    /// Files to add, one entry each
    pub local_paths: Vec<PathBuf>,
    /// Output zip path; relative paths resolve inside the invocation workspace
    pub output_zip: PathBuf,
}

/// Input: mail a zip as a single attachment
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct SendZipInput {
    /// Recipient address
    pub to: String,
    pub subject: String,
    pub body: String,
    /// Zip file to attach
    pub zip_path: PathBuf,
}

/// Input: search, download, upload, compress and mail in one call
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct FullPipelineInput {
    /// Gmail search query
    pub query: String,
    /// Messages to inspect (1..500)
    pub max_results: Count,
    /// OneDrive folder receiving every attachment
    pub onedrive_folder: String,
    /// Address the zip is mailed to
    pub recipient_email: String,
    /// Zip file name; `.zip` is appended when missing
    pub zip_name: String,
    /// Defaults to `Files: <zip_name>`
    #[serde(default)]
    pub subject: Option<String>,
    /// Defaults to `See attached zip.`
    #[serde(default)]
    pub body: Option<String>,
}

/// A validated tool invocation
#[derive(Debug, Clone, PartialEq)]
pub enum ToolRequest {
    SearchAndDownload {
        query: String,
        max_results: u32,
        download_dir: Option<PathBuf>,
    },
    Upload {
        local_paths: Vec<PathBuf>,
        remote_folder_path: String,
    },
    Compress {
        local_paths: Vec<PathBuf>,
        output_zip: PathBuf,
    },
    SendZip {
        to: String,
        subject: String,
        body: String,
        zip_path: PathBuf,
    },
    FullPipeline {
        query: String,
        max_results: u32,
        onedrive_folder: String,
        recipient_email: String,
        zip_name: String,
        subject: Option<String>,
        body: Option<String>,
    },
}

impl ToolRequest {
    /// Check the tool name and its inputs without touching any provider
    pub fn parse(tool: &str, input: &Value) -> Result<Self> {
        let tool = ToolName::from_name(tool)?;

        let empty = Map::new();
        let fields = match input {
            Value::Object(fields) => fields,
            Value::Null => &empty,
            _ => {
                return Err(PipelineError::InvalidInput {
                    field: "input".to_string(),
                    reason: "expected a JSON object".to_string(),
                })
            }
        };

        if let Some(missing) = tool
            .required()
            .iter()
            .find(|name| fields.get(**name).map_or(true, Value::is_null))
        {
            return Err(PipelineError::MissingInput(missing.to_string()));
        }

        let request = match tool {
            ToolName::SearchAndDownloadAttachments => {
                let input: SearchInput = decode(fields)?;
                ToolRequest::SearchAndDownload {
                    query: input.query,
                    max_results: max_results(&input.max_results)?,
                    download_dir: input.download_dir,
                }
            }
            ToolName::UploadToOnedrive => {
                let input: UploadInput = decode(fields)?;
                ToolRequest::Upload {
                    local_paths: non_empty_paths("local_paths", input.local_paths)?,
                    remote_folder_path: input.remote_folder_path,
                }
            }
            ToolName::CompressFiles => {
                let input: CompressInput = decode(fields)?;
                ToolRequest::Compress {
                    local_paths: non_empty_paths("local_paths", input.local_paths)?,
                    output_zip: non_empty_path("output_zip", input.output_zip)?,
                }
            }
            ToolName::SendZipViaEmail => {
                let input: SendZipInput = decode(fields)?;
                ToolRequest::SendZip {
                    to: non_empty("to", input.to)?,
                    subject: input.subject,
                    body: input.body,
                    zip_path: non_empty_path("zip_path", input.zip_path)?,
                }
            }
            ToolName::OrchestrateFullPipeline => {
                let input: FullPipelineInput = decode(fields)?;
                ToolRequest::FullPipeline {
                    query: input.query,
                    max_results: max_results(&input.max_results)?,
                    onedrive_folder: input.onedrive_folder,
                    recipient_email: non_empty("recipient_email", input.recipient_email)?,
                    zip_name: non_empty("zip_name", input.zip_name)?,
                    subject: input.subject,
                    body: input.body,
                }
            }
        };
        Ok(request)
    }

    pub fn tool(&self) -> ToolName {
        match self {
            ToolRequest::SearchAndDownload { .. } => ToolName::SearchAndDownloadAttachments,
            ToolRequest::Upload { .. } => ToolName::UploadToOnedrive,
            ToolRequest::Compress { .. } => ToolName::CompressFiles,
            ToolRequest::SendZip { .. } => ToolName::SendZipViaEmail,
            ToolRequest::FullPipeline { .. } => ToolName::OrchestrateFullPipeline,
        }
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> PipelineError {
    PipelineError::InvalidInput {
        field: field.to_string(),
        reason: reason.into(),
    }
}

fn decode<T: DeserializeOwned>(fields: &Map<String, Value>) -> Result<T> {
    serde_json::from_value(Value::Object(fields.clone())).map_err(|e| invalid("input", e.to_string()))
}

fn non_empty(field: &str, value: String) -> Result<String> {
    if value.trim().is_empty() {
        return Err(invalid(field, "must not be empty"));
    }
    Ok(value)
}

fn non_empty_path(field: &str, path: PathBuf) -> Result<PathBuf> {
    if path.as_os_str().is_empty() {
        return Err(invalid(field, "must not be empty"));
    }
    Ok(path)
}

fn non_empty_paths(field: &str, paths: Vec<PathBuf>) -> Result<Vec<PathBuf>> {
    if paths.iter().any(|path| path.as_os_str().is_empty()) {
        return Err(invalid(field, "expected an array of non-empty paths"));
    }
    Ok(paths)
}

/// Integers, or strings holding one, within 1..=500
fn max_results(count: &Count) -> Result<u32> {
    let value = count
        .as_i64()
        .ok_or_else(|| invalid("max_results", "expected an integer"))?;

    if !(1..=i64::from(MAX_RESULTS_LIMIT)).contains(&value) {
        return Err(invalid(
            "max_results",
            format!("must be between 1 and {}", MAX_RESULTS_LIMIT),
        ));
    }
    Ok(value as u32)
}
