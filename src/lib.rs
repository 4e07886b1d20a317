//! Attachment Relay
//!
//! A small tool server that moves files between Gmail and OneDrive: it
//! searches a mailbox, downloads matching attachments, uploads them to a
//! OneDrive folder, compresses them into a zip and mails the zip back.
//!
//! # Overview
//!
//! - **Credentials**: per-provider OAuth2 token cache with refresh and grant fallback
//! - **Mail**: Gmail search, attachment download and sending
//! - **Storage**: OneDrive uploads through Microsoft Graph
//! - **Archive**: deflate zip creation
//! - **Pipeline**: tool validation, per-invocation workspaces and stage sequencing
//!
//! # Example Usage
//!
//! ```no_run
//! use attachment_relay::{config::Config, pipeline::Orchestrator};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml".as_ref()).await?;
//!     let orchestrator = Orchestrator::from_config(&config);
//!
//!     let output = orchestrator
//!         .run(
//!             "search_and_download_attachments",
//!             &json!({"query": "has:attachment newer_than:7d", "max_results": 10}),
//!         )
//!         .await?;
//!     println!("{}", serde_json::to_string_pretty(&output)?);
//!     Ok(())
//! }
//! ```
//!
//! # Module Organization
//!
//! - [`auth`] - Token model and the per-provider credential store
//! - [`grant`] - Installed-app, device-code and client-credentials flows
//! - [`client`] - Gmail API session trait and production client
//! - [`mail`] - Search, download and send operations
//! - [`storage`] - OneDrive uploads via Microsoft Graph
//! - [`archive`] - Zip creation
//! - [`workspace`] - Per-invocation scratch directories
//! - [`tools`] - Tool names, schemas and input validation
//! - [`pipeline`] - Invocation orchestration
//! - [`server`] - HTTP boundary
//! - [`cli`] - Command-line interface
//! - [`config`] - Configuration management
//! - [`error`] - Error types and result aliases
//! - [`models`] - Core data structures

pub mod archive;
pub mod auth;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod grant;
pub mod mail;
pub mod models;
pub mod pipeline;
pub mod server;
pub mod storage;
pub mod tools;
pub mod workspace;

// Re-export commonly used types for convenience
pub use error::{ErrorBody, ErrorCategory, PipelineError, Result};

// Core data models
pub use models::{AttachmentPart, MailMessage, MessagePart, Provider, SendConfirmation, UploadDescriptor};

// Config types
pub use config::{Config, MailConfig, ServerConfig, StorageConfig};

// Credentials
pub use auth::{CredentialStore, ProviderCredentials, Token};
pub use grant::{DevicePrompt, GrantKind, GrantStrategy};

// Provider seams
pub use client::{GmailClient, GmailConnector, MailApi, MailConnector};
pub use storage::{GraphDriveClient, StorageApi, StorageGateway};

// Orchestration
pub use pipeline::{Orchestrator, PipelineSettings, RunStatus, Stage, ToolOutput};
pub use tools::{ToolName, ToolRequest};
