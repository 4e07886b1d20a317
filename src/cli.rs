//! Command-line interface

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::path::PathBuf;

use crate::error::{PipelineError, Result};
use crate::models::Provider;
use crate::pipeline::ToolOutput;

#[derive(Parser, Debug)]
#[command(name = "attachment-relay")]
#[command(version)]
#[command(
    about = "Relays Gmail attachments to OneDrive and mails them back as a zip",
    long_about = None
)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,

    /// Verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve the tool endpoints over HTTP
    Serve {
        /// Bind address (overrides server.host)
        #[arg(long)]
        host: Option<String>,

        /// Port (overrides server.port and PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Print tool definitions and their input schemas
    Tools,

    /// Run a single tool and print its JSON output
    Run {
        /// Tool name, e.g. orchestrate_full_pipeline
        tool: String,

        /// Tool input as a JSON object
        #[arg(short, long, default_value = "{}")]
        input: String,
    },

    /// Obtain and cache a token for one provider
    Auth {
        #[arg(value_enum)]
        provider: AuthProvider,

        /// Discard the cached token and run the grant flow again
        #[arg(long)]
        force: bool,
    },

    /// Generate example configuration file
    InitConfig {
        /// Output path for config file
        #[arg(short, long, default_value = "config.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthProvider {
    /// Gmail
    Mail,
    /// OneDrive
    Storage,
}

impl From<AuthProvider> for Provider {
    fn from(provider: AuthProvider) -> Self {
        match provider {
            AuthProvider::Mail => Provider::Mail,
            AuthProvider::Storage => Provider::Storage,
        }
    }
}

/// Parse the `--input` argument
pub fn parse_input(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).map_err(|e| PipelineError::InvalidInput {
        field: "input".to_string(),
        reason: format!("not valid JSON: {}", e),
    })
}

/// JSON printed by `run`, for success and failure alike
pub fn render_outcome(outcome: &Result<ToolOutput>) -> Value {
    match outcome {
        Ok(output) => serde_json::to_value(output)
            .unwrap_or_else(|e| json!({ "error": PipelineError::from(e).to_error_body() })),
        Err(error) => json!({ "error": error.to_error_body() }),
    }
}
