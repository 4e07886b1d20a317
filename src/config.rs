use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub mail: MailConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// Gmail client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailConfig {
    /// OAuth2 client secrets downloaded from the Google Cloud Console
    #[serde(default = "default_credentials_file")]
    pub credentials_file: PathBuf,
    #[serde(default = "default_mail_token_file")]
    pub token_file: PathBuf,
    #[serde(default = "default_mail_scopes")]
    pub scopes: Vec<String>,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            credentials_file: default_credentials_file(),
            token_file: default_mail_token_file(),
            scopes: default_mail_scopes(),
        }
    }
}

/// Microsoft Graph / OneDrive configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub client_id: String,
    /// When set, the app authenticates as itself with the client-credentials grant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default = "default_tenant_id")]
    pub tenant_id: String,
    #[serde(default = "default_storage_token_file")]
    pub token_file: PathBuf,
    #[serde(default = "default_authority")]
    pub authority: String,
    #[serde(default = "default_graph_base")]
    pub graph_base: String,
    /// Drive addressed by uploads, relative to the Graph base
    #[serde(default = "default_drive")]
    pub drive: String,
    /// Overrides the scopes implied by the grant flow
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: None,
            tenant_id: default_tenant_id(),
            token_file: default_storage_token_file(),
            authority: default_authority(),
            graph_base: default_graph_base(),
            drive: default_drive(),
            scopes: Vec::new(),
        }
    }
}

impl StorageConfig {
    pub fn has_client_secret(&self) -> bool {
        self.client_secret
            .as_deref()
            .is_some_and(|secret| !secret.is_empty())
    }

    /// App-only tokens use the `.default` scope; delegated tokens name their permissions
    pub fn effective_scopes(&self) -> Vec<String> {
        if !self.scopes.is_empty() {
            return self.scopes.clone();
        }
        if self.has_client_secret() {
            vec!["https://graph.microsoft.com/.default".to_string()]
        } else {
            vec![
                "Files.ReadWrite.All".to_string(),
                "offline_access".to_string(),
                "User.Read".to_string(),
            ]
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_invocation_timeout_secs")]
    pub invocation_timeout_secs: u64,
    #[serde(default = "default_workspace_prefix")]
    pub workspace_prefix: String,
    /// Parent directory for workspaces; the system temp dir when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_root: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            invocation_timeout_secs: default_invocation_timeout_secs(),
            workspace_prefix: default_workspace_prefix(),
            workspace_root: None,
        }
    }
}

fn default_credentials_file() -> PathBuf {
    PathBuf::from("credentials.json")
}

fn default_mail_token_file() -> PathBuf {
    PathBuf::from("token.json")
}

fn default_mail_scopes() -> Vec<String> {
    vec![
        "https://www.googleapis.com/auth/gmail.readonly".to_string(),
        "https://www.googleapis.com/auth/gmail.send".to_string(),
    ]
}

fn default_tenant_id() -> String {
    "common".to_string()
}

fn default_storage_token_file() -> PathBuf {
    PathBuf::from("msal_token.json")
}

fn default_authority() -> String {
    "https://login.microsoftonline.com".to_string()
}

fn default_graph_base() -> String {
    "https://graph.microsoft.com/v1.0".to_string()
}

fn default_drive() -> String {
    "me/drive".to_string()
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_invocation_timeout_secs() -> u64 {
    600
}

fn default_workspace_prefix() -> String {
    "mcp_work_".to_string()
}

impl Config {
    /// Load from a TOML file, then apply environment overrides and validate
    pub async fn load(path: &Path) -> Result<Self> {
        Self::load_with_env(path, |key| std::env::var(key).ok()).await
    }

    pub async fn load_with_env<F>(path: &Path, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = if path.exists() {
            let content = tokio::fs::read_to_string(path).await.map_err(|e| {
                PipelineError::ConfigError(format!("Failed to read config file: {}", e))
            })?;
            let config: Self = toml::from_str(&content).map_err(|e| {
                PipelineError::ConfigError(format!("Failed to parse config file: {}", e))
            })?;
            tracing::info!("Loaded configuration from {:?}", path);
            config
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Self::default()
        };

        config.apply_env_overrides(lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply the deployment's environment variables over file values
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("GOOGLE_CREDENTIALS_FILE") {
            self.mail.credentials_file = PathBuf::from(value);
        }
        if let Some(value) = lookup("GOOGLE_TOKEN_FILE") {
            self.mail.token_file = PathBuf::from(value);
        }
        if let Some(value) = lookup("MSFT_CLIENT_ID") {
            self.storage.client_id = value;
        }
        if let Some(value) = lookup("MSFT_CLIENT_SECRET") {
            self.storage.client_secret = Some(value).filter(|secret| !secret.is_empty());
        }
        if let Some(value) = lookup("MSFT_TENANT_ID") {
            self.storage.tenant_id = value;
        }
        if let Some(value) = lookup("MSAL_TOKEN_FILE") {
            self.storage.token_file = PathBuf::from(value);
        }
        if let Some(value) = lookup("PORT") {
            self.server.port = value.parse().map_err(|_| {
                PipelineError::ConfigError(format!("PORT must be a port number, got '{}'", value))
            })?;
        }
        Ok(())
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                PipelineError::ConfigError(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self).map_err(|e| {
            PipelineError::ConfigError(format!("Failed to serialize config: {}", e))
        })?;

        tokio::fs::write(path, content).await.map_err(|e| {
            PipelineError::ConfigError(format!("Failed to write config file: {}", e))
        })?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.mail.scopes.is_empty() {
            return Err(PipelineError::ConfigError(
                "mail.scopes must name at least one scope".to_string(),
            ));
        }

        if self.storage.has_client_secret() && self.storage.client_id.is_empty() {
            return Err(PipelineError::ConfigError(
                "storage.client_secret is set but storage.client_id is empty".to_string(),
            ));
        }
        if self.storage.graph_base.trim().is_empty() {
            return Err(PipelineError::ConfigError(
                "storage.graph_base cannot be empty".to_string(),
            ));
        }
        if self.storage.tenant_id.trim().is_empty() {
            return Err(PipelineError::ConfigError(
                "storage.tenant_id cannot be empty".to_string(),
            ));
        }

        if self.server.port == 0 {
            return Err(PipelineError::ConfigError(
                "server.port must be greater than 0".to_string(),
            ));
        }
        if self.server.invocation_timeout_secs == 0 {
            return Err(PipelineError::ConfigError(
                "server.invocation_timeout_secs must be greater than 0".to_string(),
            ));
        }

        tracing::debug!("Configuration validation passed");
        Ok(())
    }

    /// Create an example configuration file
    pub async fn create_example(path: &Path) -> Result<()> {
        let config = Self::default();
        config.save(path).await
    }
}
