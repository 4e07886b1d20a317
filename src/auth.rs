//! Per-provider OAuth2 token lifecycle: cache, persistence, refresh and grant

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::grant::{
    ClientCredentialsGrant, DeviceCodeGrant, DevicePrompt, GrantKind, GrantStrategy,
    InstalledAppGrant, MicrosoftIdentity,
};
use crate::models::Provider;

/// Tokens expiring within this window are treated as already expired
const EXPIRY_SKEW_SECS: i64 = 60;

/// OpenID scopes that identity providers leave out of the granted list
const IMPLICIT_SCOPES: &[&str] = &["offline_access", "openid", "profile", "email"];

/// Graph reports delegated scopes without their resource prefix
const GRAPH_RESOURCE: &str = "https://graph.microsoft.com/";

fn scope_key(scope: &str) -> &str {
    scope.strip_prefix(GRAPH_RESOURCE).unwrap_or(scope)
}

/// A bearer credential as persisted per provider
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Token {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Scopes this token was granted for
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .finish()
    }
}

impl Token {
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|at| at <= Utc::now() + Duration::seconds(EXPIRY_SKEW_SECS))
    }

    /// Whether the granted scopes include every scope in `scopes`
    pub fn covers(&self, scopes: &[String]) -> bool {
        scopes.iter().all(|wanted| {
            IMPLICIT_SCOPES.contains(&wanted.as_str())
                || self
                    .scopes
                    .iter()
                    .any(|granted| scope_key(granted).eq_ignore_ascii_case(scope_key(wanted)))
        })
    }

    pub fn can_refresh(&self) -> bool {
        self.refresh_token
            .as_deref()
            .is_some_and(|token| !token.is_empty())
    }

    fn is_usable(&self, scopes: &[String]) -> bool {
        !self.access_token.is_empty() && !self.is_expired() && self.covers(scopes)
    }
}

/// Everything the store keeps for one provider
pub struct ProviderCredentials {
    provider: Provider,
    token_path: PathBuf,
    scopes: Vec<String>,
    strategy: Arc<dyn GrantStrategy>,
    cached: Mutex<Option<Token>>,
}

impl ProviderCredentials {
    pub fn new(
        provider: Provider,
        token_path: impl Into<PathBuf>,
        scopes: Vec<String>,
        strategy: Arc<dyn GrantStrategy>,
    ) -> Self {
        Self {
            provider,
            token_path: token_path.into(),
            scopes,
            strategy,
            cached: Mutex::new(None),
        }
    }

    pub fn token_path(&self) -> &Path {
        &self.token_path
    }

    pub fn grant_kind(&self) -> GrantKind {
        self.strategy.kind()
    }

    async fn acquire(&self) -> Result<Token> {
        // Held for the whole acquisition so concurrent callers never start a
        // second grant flow or race the token file.
        let mut cached = self.cached.lock().await;

        if let Some(token) = cached.as_ref().filter(|t| t.is_usable(&self.scopes)) {
            debug!(provider = %self.provider, "Using cached token");
            return Ok(token.clone());
        }

        let stored = match cached.take() {
            Some(token) => Some(token),
            None => self.load().await,
        };

        if let Some(token) = stored {
            if token.is_usable(&self.scopes) {
                debug!(provider = %self.provider, "Using persisted token");
                *cached = Some(token.clone());
                return Ok(token);
            }

            if token.is_expired() && token.can_refresh() && token.covers(&self.scopes) {
                match self.strategy.refresh(&token, &self.scopes).await {
                    Ok(refreshed) => {
                        info!(provider = %self.provider, "Refreshed access token");
                        self.persist(&refreshed).await?;
                        *cached = Some(refreshed.clone());
                        return Ok(refreshed);
                    }
                    Err(e) => {
                        warn!(provider = %self.provider, "{}; starting a new grant", e);
                    }
                }
            }
        }

        info!(
            provider = %self.provider,
            flow = %self.strategy.kind(),
            "Requesting new token"
        );
        let token = self.strategy.grant(&self.scopes).await?;
        self.persist(&token).await?;
        *cached = Some(token.clone());
        Ok(token)
    }

    /// Forget the cached token and delete its file
    async fn invalidate(&self) -> Result<()> {
        let mut cached = self.cached.lock().await;
        *cached = None;
        if self.token_path.exists() {
            tokio::fs::remove_file(&self.token_path).await?;
            info!(provider = %self.provider, "Removed token cache {:?}", self.token_path);
        }
        Ok(())
    }

    async fn load(&self) -> Option<Token> {
        match load_token(&self.token_path).await {
            Ok(token) => token,
            Err(e) => {
                warn!(
                    provider = %self.provider,
                    "Ignoring unreadable token file {:?}: {}",
                    self.token_path,
                    e
                );
                None
            }
        }
    }

    async fn persist(&self, token: &Token) -> Result<()> {
        save_token(&self.token_path, token).await?;
        debug!(provider = %self.provider, "Persisted token to {:?}", self.token_path);
        Ok(())
    }
}

/// Owns both providers' tokens; the two never share state
pub struct CredentialStore {
    mail: ProviderCredentials,
    storage: ProviderCredentials,
}

impl CredentialStore {
    pub fn new(mail: ProviderCredentials, storage: ProviderCredentials) -> Self {
        Self { mail, storage }
    }

    /// Build the store, selecting each provider's grant strategy once
    pub fn from_config(
        config: &Config,
        http: reqwest::Client,
        prompt: Arc<dyn DevicePrompt>,
    ) -> Self {
        let mail_strategy: Arc<dyn GrantStrategy> = Arc::new(InstalledAppGrant::new(
            config.mail.credentials_file.clone(),
            Arc::clone(&prompt),
        ));

        let identity = MicrosoftIdentity::from_config(&config.storage);
        let storage_strategy: Arc<dyn GrantStrategy> = match config
            .storage
            .client_secret
            .as_deref()
            .filter(|secret| !secret.is_empty())
        {
            Some(secret) => Arc::new(ClientCredentialsGrant::new(
                http,
                identity,
                secret.to_string(),
            )),
            None => Arc::new(DeviceCodeGrant::new(http, identity, prompt)),
        };

        Self::new(
            ProviderCredentials::new(
                Provider::Mail,
                config.mail.token_file.clone(),
                config.mail.scopes.clone(),
                mail_strategy,
            ),
            ProviderCredentials::new(
                Provider::Storage,
                config.storage.token_file.clone(),
                config.storage.effective_scopes(),
                storage_strategy,
            ),
        )
    }

    pub fn provider(&self, provider: Provider) -> &ProviderCredentials {
        match provider {
            Provider::Mail => &self.mail,
            Provider::Storage => &self.storage,
        }
    }

    /// Return a non-expired token covering the provider's scopes
    pub async fn acquire(&self, provider: Provider) -> Result<Token> {
        self.provider(provider).acquire().await
    }

    pub async fn invalidate(&self, provider: Provider) -> Result<()> {
        self.provider(provider).invalidate().await
    }
}

/// Read a persisted token; a missing file is not an error
pub async fn load_token(path: &Path) -> Result<Option<Token>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = tokio::fs::read_to_string(path).await?;
    let token = serde_json::from_str(&content)?;
    Ok(Some(token))
}

pub async fn save_token(path: &Path, token: &Token) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_string_pretty(token)?;

    // Permissions are tightened before any secret reaches the file
    let mut file = open_token_file(path).await?;
    secure_token_file(path).await?;
    file.write_all(json.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

#[cfg(unix)]
async fn open_token_file(path: &Path) -> std::io::Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .await
}

#[cfg(windows)]
async fn open_token_file(path: &Path) -> std::io::Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .await
}

/// Secure token file permissions on Unix systems
///
/// Sets file permissions to 0600 (read/write for owner only)
/// to prevent unauthorized access to OAuth2 tokens
#[cfg(unix)]
pub async fn secure_token_file(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = tokio::fs::metadata(path).await?.permissions();
    perms.set_mode(0o600);
    tokio::fs::set_permissions(path, perms).await?;
    Ok(())
}

/// Windows uses ACLs instead of Unix permissions
#[cfg(windows)]
pub async fn secure_token_file(_path: &Path) -> Result<()> {
    Ok(())
}
