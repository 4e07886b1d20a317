//! OAuth2 grant flows used by the credential store
//!
//! Each provider gets exactly one strategy, chosen when the store is built:
//! the mail provider uses yup-oauth2's installed-app flow with a loopback
//! redirect, the storage provider uses client credentials when a secret is
//! configured and the device-code flow otherwise.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};
use yup_oauth2::authenticator_delegate::InstalledFlowDelegate;
use yup_oauth2::storage::{TokenInfo, TokenStorage, TokenStorageError};
use yup_oauth2::{ApplicationSecret, InstalledFlowAuthenticator, InstalledFlowReturnMethod};

use crate::auth::Token;
use crate::config::StorageConfig;
use crate::error::{PipelineError, Result};
use crate::models::Provider;

const DEVICE_CODE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";
const SLOW_DOWN_STEP_SECS: u64 = 5;
const MIN_POLL_INTERVAL_SECS: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantKind {
    InstalledApp,
    DeviceCode,
    ClientCredentials,
}

impl fmt::Display for GrantKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GrantKind::InstalledApp => write!(f, "installed-app"),
            GrantKind::DeviceCode => write!(f, "device-code"),
            GrantKind::ClientCredentials => write!(f, "client-credentials"),
        }
    }
}

/// A way of obtaining and renewing tokens for one provider
#[async_trait]
pub trait GrantStrategy: Send + Sync {
    fn kind(&self) -> GrantKind;

    /// Run the full grant flow, blocking until it completes or fails
    async fn grant(&self, scopes: &[String]) -> Result<Token>;

    /// Exchange the token's refresh credential for a new access token
    async fn refresh(&self, token: &Token, scopes: &[String]) -> Result<Token>;
}

/// Device authorization returned by the identity provider
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    #[serde(alias = "verification_url")]
    pub verification_uri: String,
    pub expires_in: u64,
    #[serde(default = "default_poll_interval")]
    pub interval: u64,
    #[serde(default)]
    pub message: Option<String>,
}

fn default_poll_interval() -> u64 {
    5
}

/// Surfaces user-facing steps of the interactive flows
pub trait DevicePrompt: Send + Sync {
    fn device_code(&self, authorization: &DeviceAuthorization);

    fn authorization_url(&self, url: &str);
}

/// Prints verification instructions to stderr, leaving stdout for tool output
pub struct ConsolePrompt;

impl DevicePrompt for ConsolePrompt {
    fn device_code(&self, authorization: &DeviceAuthorization) {
        info!(
            verification_uri = %authorization.verification_uri,
            "Waiting for device code verification"
        );
        eprintln!(
            "To authenticate, visit {} and enter code: {}",
            authorization.verification_uri, authorization.user_code
        );
    }

    fn authorization_url(&self, url: &str) {
        info!("Waiting for browser authorization");
        eprintln!("Open this URL in your browser to authorize mail access:\n\n{}\n", url);
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    /// Space-separated scopes actually granted, when the provider reports them
    #[serde(default)]
    scope: Option<String>,
}

impl TokenResponse {
    fn into_token(self, scopes: &[String], previous_refresh: Option<&str>) -> Token {
        let granted = match self.scope.as_deref().map(str::trim) {
            Some(scope) if !scope.is_empty() => {
                scope.split_whitespace().map(str::to_string).collect()
            }
            _ => scopes.to_vec(),
        };

        Token {
            access_token: self.access_token,
            refresh_token: self
                .refresh_token
                .or_else(|| previous_refresh.map(str::to_string)),
            expires_at: self
                .expires_in
                .map(|secs| Utc::now() + ChronoDuration::seconds(secs)),
            scopes: granted,
        }
    }
}

/// Reject a token whose granted scopes fall short of the request
fn require_scopes(
    token: Token,
    scopes: &[String],
    failed: impl FnOnce(String) -> PipelineError,
) -> Result<Token> {
    if token.covers(scopes) {
        return Ok(token);
    }
    Err(failed(format!(
        "granted scopes [{}] do not cover requested [{}]",
        token.scopes.join(" "),
        scopes.join(" ")
    )))
}

#[derive(Debug, Deserialize)]
struct OAuthErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug)]
enum OAuthFailure {
    Rejected {
        error: String,
        description: Option<String>,
    },
    Transport(String),
}

impl fmt::Display for OAuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OAuthFailure::Rejected {
                error,
                description: Some(description),
            } => write!(f, "{}: {}", error, description),
            OAuthFailure::Rejected { error, .. } => write!(f, "{}", error),
            OAuthFailure::Transport(message) => write!(f, "{}", message),
        }
    }
}

/// POST a form to an OAuth endpoint and decode the JSON reply
async fn post_form<T>(
    http: &reqwest::Client,
    url: &str,
    form: &[(&str, &str)],
) -> std::result::Result<T, OAuthFailure>
where
    T: for<'de> Deserialize<'de>,
{
    let response = http
        .post(url)
        .form(form)
        .send()
        .await
        .map_err(|e| OAuthFailure::Transport(e.to_string()))?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| OAuthFailure::Transport(e.to_string()))?;

    if status.is_success() {
        return serde_json::from_str(&body)
            .map_err(|e| OAuthFailure::Transport(format!("Unexpected response: {}", e)));
    }

    Err(match serde_json::from_str::<OAuthErrorResponse>(&body) {
        Ok(rejection) => OAuthFailure::Rejected {
            error: rejection.error,
            description: rejection.error_description,
        },
        Err(_) => OAuthFailure::Rejected {
            error: format!("http_{}", status.as_u16()),
            description: Some(body),
        },
    })
}

/// Microsoft identity platform coordinates for one app registration
#[derive(Debug, Clone)]
pub struct MicrosoftIdentity {
    pub authority: String,
    pub tenant_id: String,
    pub client_id: String,
}

impl MicrosoftIdentity {
    pub fn from_config(config: &StorageConfig) -> Self {
        Self {
            authority: config.authority.clone(),
            tenant_id: config.tenant_id.clone(),
            client_id: config.client_id.clone(),
        }
    }

    pub fn token_url(&self) -> String {
        format!("{}/oauth2/v2.0/token", self.tenant_base())
    }

    pub fn device_code_url(&self) -> String {
        format!("{}/oauth2/v2.0/devicecode", self.tenant_base())
    }

    fn tenant_base(&self) -> String {
        format!("{}/{}", self.authority.trim_end_matches('/'), self.tenant_id)
    }

    fn require_client_id(&self) -> Result<&str> {
        if self.client_id.trim().is_empty() {
            return Err(PipelineError::CredentialUnavailable {
                provider: Provider::Storage,
                message: "MSFT_CLIENT_ID is not configured".to_string(),
            });
        }
        Ok(&self.client_id)
    }

    async fn refresh(&self, http: &reqwest::Client, token: &Token, scopes: &[String]) -> Result<Token> {
        let client_id = self.require_client_id()?;
        let refresh_token = token.refresh_token.as_deref().unwrap_or_default();
        let scope = scopes.join(" ");

        let response: TokenResponse = post_form(
            http,
            &self.token_url(),
            &[
                ("grant_type", "refresh_token"),
                ("client_id", client_id),
                ("refresh_token", refresh_token),
                ("scope", scope.as_str()),
            ],
        )
        .await
        .map_err(|e| PipelineError::RefreshFailed {
            provider: Provider::Storage,
            message: e.to_string(),
        })?;

        require_scopes(
            response.into_token(scopes, Some(refresh_token)),
            scopes,
            |message| PipelineError::RefreshFailed {
                provider: Provider::Storage,
                message,
            },
        )
    }
}

/// App-only tokens for a confidential client
pub struct ClientCredentialsGrant {
    http: reqwest::Client,
    identity: MicrosoftIdentity,
    client_secret: String,
}

impl ClientCredentialsGrant {
    pub fn new(http: reqwest::Client, identity: MicrosoftIdentity, client_secret: String) -> Self {
        Self {
            http,
            identity,
            client_secret,
        }
    }
}

#[async_trait]
impl GrantStrategy for ClientCredentialsGrant {
    fn kind(&self) -> GrantKind {
        GrantKind::ClientCredentials
    }

    async fn grant(&self, scopes: &[String]) -> Result<Token> {
        let client_id = self.identity.require_client_id()?;
        let scope = scopes.join(" ");

        let response: TokenResponse = post_form(
            &self.http,
            &self.identity.token_url(),
            &[
                ("grant_type", "client_credentials"),
                ("client_id", client_id),
                ("client_secret", self.client_secret.as_str()),
                ("scope", scope.as_str()),
            ],
        )
        .await
        .map_err(|e| PipelineError::GrantFailed {
            provider: Provider::Storage,
            message: e.to_string(),
        })?;

        debug!("Client credentials grant succeeded");
        require_scopes(response.into_token(scopes, None), scopes, |message| {
            PipelineError::GrantFailed {
                provider: Provider::Storage,
                message,
            }
        })
    }

    async fn refresh(&self, token: &Token, scopes: &[String]) -> Result<Token> {
        if !token.can_refresh() {
            return Err(PipelineError::RefreshFailed {
                provider: Provider::Storage,
                message: "app-only tokens carry no refresh credential".to_string(),
            });
        }
        self.identity.refresh(&self.http, token, scopes).await
    }
}

/// Delegated tokens obtained by having the user enter a code on another device
pub struct DeviceCodeGrant {
    http: reqwest::Client,
    identity: MicrosoftIdentity,
    prompt: Arc<dyn DevicePrompt>,
}

impl DeviceCodeGrant {
    pub fn new(
        http: reqwest::Client,
        identity: MicrosoftIdentity,
        prompt: Arc<dyn DevicePrompt>,
    ) -> Self {
        Self {
            http,
            identity,
            prompt,
        }
    }

    fn failed(message: impl Into<String>) -> PipelineError {
        PipelineError::GrantFailed {
            provider: Provider::Storage,
            message: message.into(),
        }
    }
}

#[async_trait]
impl GrantStrategy for DeviceCodeGrant {
    fn kind(&self) -> GrantKind {
        GrantKind::DeviceCode
    }

    async fn grant(&self, scopes: &[String]) -> Result<Token> {
        let client_id = self.identity.require_client_id()?;
        let scope = scopes.join(" ");

        let authorization: DeviceAuthorization = post_form(
            &self.http,
            &self.identity.device_code_url(),
            &[("client_id", client_id), ("scope", scope.as_str())],
        )
        .await
        .map_err(|e| Self::failed(format!("Failed to start device flow: {}", e)))?;

        self.prompt.device_code(&authorization);

        let deadline = Instant::now() + Duration::from_secs(authorization.expires_in);
        let mut interval = authorization.interval.max(MIN_POLL_INTERVAL_SECS);

        loop {
            tokio::time::sleep(Duration::from_secs(interval)).await;
            if Instant::now() >= deadline {
                return Err(Self::failed("device code expired before verification"));
            }

            let poll = post_form::<TokenResponse>(
                &self.http,
                &self.identity.token_url(),
                &[
                    ("grant_type", DEVICE_CODE_GRANT_TYPE),
                    ("client_id", client_id),
                    ("device_code", authorization.device_code.as_str()),
                ],
            )
            .await;

            match poll {
                Ok(response) => {
                    info!("Device code verified");
                    return require_scopes(response.into_token(scopes, None), scopes, |message| {
                        Self::failed(message)
                    });
                }
                Err(OAuthFailure::Rejected { error, .. }) if error == "authorization_pending" => {
                    debug!("Device code verification pending");
                }
                Err(OAuthFailure::Rejected { error, .. }) if error == "slow_down" => {
                    interval += SLOW_DOWN_STEP_SECS;
                    debug!(interval, "Identity provider asked to slow down polling");
                }
                Err(other) => return Err(Self::failed(other.to_string())),
            }
        }
    }

    async fn refresh(&self, token: &Token, scopes: &[String]) -> Result<Token> {
        self.identity.refresh(&self.http, token, scopes).await
    }
}

/// Shows the consent URL through the prompt instead of stdout
struct PromptDelegate(Arc<dyn DevicePrompt>);

impl InstalledFlowDelegate for PromptDelegate {
    fn present_user_url<'a>(
        &'a self,
        url: &'a str,
        _need_code: bool,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<String, String>> + Send + 'a>> {
        self.0.authorization_url(url);
        Box::pin(async { Ok(String::new()) })
    }
}

/// Storage handed to the authenticator for a single flow
///
/// It offers at most one seed token and captures whatever the authenticator
/// issues, so the credential store keeps owning the token file and its lock.
struct IssuedToken {
    seed: Option<TokenInfo>,
    issued: Arc<Mutex<Option<TokenInfo>>>,
}

#[async_trait]
impl TokenStorage for IssuedToken {
    async fn set(
        &self,
        _scopes: &[&str],
        token: TokenInfo,
    ) -> std::result::Result<(), TokenStorageError> {
        *self.issued.lock().await = Some(token);
        Ok(())
    }

    async fn get(&self, _scopes: &[&str]) -> Option<TokenInfo> {
        self.seed.clone()
    }
}

/// Google installed-app flow, run by yup-oauth2 with a loopback redirect
pub struct InstalledAppGrant {
    credentials_file: PathBuf,
    prompt: Arc<dyn DevicePrompt>,
}

impl InstalledAppGrant {
    pub fn new(credentials_file: PathBuf, prompt: Arc<dyn DevicePrompt>) -> Self {
        Self {
            credentials_file,
            prompt,
        }
    }

    fn failed(message: String) -> PipelineError {
        PipelineError::GrantFailed {
            provider: Provider::Mail,
            message,
        }
    }

    fn refresh_failed(message: String) -> PipelineError {
        PipelineError::RefreshFailed {
            provider: Provider::Mail,
            message,
        }
    }

    async fn read_secret(&self) -> Result<ApplicationSecret> {
        if !self.credentials_file.exists() {
            return Err(PipelineError::CredentialUnavailable {
                provider: Provider::Mail,
                message: format!(
                    "credentials file {} not found",
                    self.credentials_file.display()
                ),
            });
        }

        yup_oauth2::read_application_secret(&self.credentials_file)
            .await
            .map_err(|e| PipelineError::CredentialUnavailable {
                provider: Provider::Mail,
                message: format!("Failed to read credentials: {}", e),
            })
    }

    /// Drive one authenticator call and return the token it stored
    ///
    /// With a seed carrying a refresh token, `force_refreshed_token` refreshes
    /// it; yup-oauth2 falls back to a new consent if the refresh is rejected.
    async fn run_flow(
        &self,
        secret: ApplicationSecret,
        seed: Option<TokenInfo>,
        scopes: &[String],
        failed: fn(String) -> PipelineError,
    ) -> Result<TokenInfo> {
        let refreshing = seed.is_some();
        let issued = Arc::new(Mutex::new(None));

        let authenticator =
            InstalledFlowAuthenticator::builder(secret, InstalledFlowReturnMethod::HTTPRedirect)
                .flow_delegate(Box::new(PromptDelegate(Arc::clone(&self.prompt))))
                .with_storage(Box::new(IssuedToken {
                    seed,
                    issued: Arc::clone(&issued),
                }))
                .build()
                .await
                .map_err(|e| failed(format!("Failed to build authenticator: {}", e)))?;

        let outcome = if refreshing {
            authenticator.force_refreshed_token(scopes).await
        } else {
            authenticator.token(scopes).await
        };
        outcome.map_err(|e| failed(e.to_string()))?;

        let token = issued.lock().await.take();
        token.ok_or_else(|| failed("authenticator issued no token".to_string()))
    }
}

/// Convert what yup-oauth2 issued into the persisted token shape
fn token_from_info(info: TokenInfo, scopes: &[String], previous_refresh: Option<&str>) -> Option<Token> {
    Some(Token {
        access_token: info.access_token?,
        refresh_token: info
            .refresh_token
            .or_else(|| previous_refresh.map(str::to_string)),
        expires_at: info
            .expires_at
            .and_then(|at| DateTime::from_timestamp(at.unix_timestamp(), 0)),
        scopes: scopes.to_vec(),
    })
}

#[async_trait]
impl GrantStrategy for InstalledAppGrant {
    fn kind(&self) -> GrantKind {
        GrantKind::InstalledApp
    }

    async fn grant(&self, scopes: &[String]) -> Result<Token> {
        let secret = self.read_secret().await?;
        let info = self.run_flow(secret, None, scopes, Self::failed).await?;
        debug!("Installed-app flow issued a token");

        token_from_info(info, scopes, None)
            .ok_or_else(|| Self::failed("token response carried no access token".to_string()))
    }

    async fn refresh(&self, token: &Token, scopes: &[String]) -> Result<Token> {
        let secret = self
            .read_secret()
            .await
            .map_err(|e| Self::refresh_failed(e.to_string()))?;
        if !token.can_refresh() {
            return Err(Self::refresh_failed(
                "token carries no refresh credential".to_string(),
            ));
        }

        let seed = TokenInfo {
            access_token: Some(token.access_token.clone()),
            refresh_token: token.refresh_token.clone(),
            expires_at: None,
            id_token: None,
        };
        let info = self
            .run_flow(secret, Some(seed), scopes, Self::refresh_failed)
            .await?;

        token_from_info(info, scopes, token.refresh_token.as_deref()).ok_or_else(|| {
            Self::refresh_failed("token response carried no access token".to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Url;
    use serde_json::json;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct RecordingPrompt {
        codes: Mutex<Vec<String>>,
    }

    impl DevicePrompt for RecordingPrompt {
        fn device_code(&self, authorization: &DeviceAuthorization) {
            self.codes
                .lock()
                .unwrap()
                .push(authorization.user_code.clone());
        }

        fn authorization_url(&self, _url: &str) {}
    }

    /// Plays the browser: follows the consent URL's redirect with a code
    struct BrowserPrompt {
        code: &'static str,
        urls: Mutex<Vec<String>>,
    }

    impl BrowserPrompt {
        fn new(code: &'static str) -> Self {
            Self {
                code,
                urls: Mutex::new(Vec::new()),
            }
        }
    }

    impl DevicePrompt for BrowserPrompt {
        fn device_code(&self, _authorization: &DeviceAuthorization) {}

        fn authorization_url(&self, url: &str) {
            self.urls.lock().unwrap().push(url.to_string());

            let url = Url::parse(url).unwrap();
            let redirect = url
                .query_pairs()
                .find(|(key, _)| key == "redirect_uri")
                .map(|(_, value)| value.into_owned())
                .unwrap();
            let mut callback = Url::parse(&redirect).unwrap();
            callback.set_host(Some("127.0.0.1")).unwrap();
            callback.query_pairs_mut().append_pair("code", self.code);

            tokio::spawn(async move {
                let _ = reqwest::get(callback).await;
            });
        }
    }

    fn identity(server: &MockServer, client_id: &str) -> MicrosoftIdentity {
        MicrosoftIdentity {
            authority: server.uri(),
            tenant_id: "common".to_string(),
            client_id: client_id.to_string(),
        }
    }

    fn storage_scopes() -> Vec<String> {
        vec!["Files.ReadWrite.All".to_string(), "offline_access".to_string()]
    }

    async fn mount_device_code(server: &MockServer, expires_in: u64, interval: u64) {
        Mock::given(method("POST"))
            .and(path("/common/oauth2/v2.0/devicecode"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "device_code": "device-123",
                "user_code": "WXYZ-1234",
                "verification_uri": "https://microsoft.com/devicelogin",
                "expires_in": expires_in,
                "interval": interval,
                "message": "To sign in, use a web browser"
            })))
            .expect(1)
            .mount(server)
            .await;
    }

    async fn write_credentials(dir: &TempDir, token_uri: &str) -> PathBuf {
        let path = dir.path().join("credentials.json");
        let content = json!({
            "installed": {
                "client_id": "google-client",
                "project_id": "relay",
                "auth_uri": "https://accounts.google.com/o/oauth2/auth",
                "token_uri": token_uri,
                "auth_provider_x509_cert_url": "https://www.googleapis.com/oauth2/v1/certs",
                "client_secret": "google-secret",
                "redirect_uris": ["http://localhost"]
            }
        });
        tokio::fs::write(&path, content.to_string()).await.unwrap();
        path
    }

    #[test]
    fn test_microsoft_endpoints() {
        let identity = MicrosoftIdentity {
            authority: "https://login.microsoftonline.com/".to_string(),
            tenant_id: "contoso".to_string(),
            client_id: "app".to_string(),
        };
        assert_eq!(
            identity.token_url(),
            "https://login.microsoftonline.com/contoso/oauth2/v2.0/token"
        );
        assert_eq!(
            identity.device_code_url(),
            "https://login.microsoftonline.com/contoso/oauth2/v2.0/devicecode"
        );
    }

    #[test]
    fn test_device_authorization_accepts_url_alias() {
        let authorization: DeviceAuthorization = serde_json::from_value(json!({
            "device_code": "dc",
            "user_code": "ABCD-EFGH",
            "verification_url": "https://microsoft.com/devicelogin",
            "expires_in": 900
        }))
        .unwrap();
        assert_eq!(authorization.verification_uri, "https://microsoft.com/devicelogin");
        assert_eq!(authorization.interval, 5);
    }

    #[test]
    fn test_token_response_keeps_previous_refresh() {
        let response = TokenResponse {
            access_token: "new".to_string(),
            refresh_token: None,
            expires_in: Some(3600),
            scope: None,
        };
        let token = response.into_token(&storage_scopes(), Some("kept"));
        assert_eq!(token.refresh_token.as_deref(), Some("kept"));
        assert!(!token.is_expired());
        assert_eq!(token.scopes, storage_scopes());
    }

    #[test]
    fn test_token_response_records_granted_scopes() {
        let response: TokenResponse = serde_json::from_value(json!({
            "access_token": "t",
            "expires_in": 3600,
            "scope": "User.Read  Files.Read"
        }))
        .unwrap();

        let token = response.into_token(&storage_scopes(), None);

        assert_eq!(token.scopes, vec!["User.Read", "Files.Read"]);
        assert!(!token.covers(&storage_scopes()));
    }

    #[test]
    fn test_token_from_info() {
        let info = TokenInfo {
            access_token: Some("gmail-token".to_string()),
            refresh_token: None,
            expires_at: None,
            id_token: None,
        };
        let token = token_from_info(info, &["gmail.send".to_string()], Some("kept")).unwrap();
        assert_eq!(token.access_token, "gmail-token");
        assert_eq!(token.refresh_token.as_deref(), Some("kept"));
        assert!(token.expires_at.is_none());

        let empty = TokenInfo {
            access_token: None,
            refresh_token: None,
            expires_at: None,
            id_token: None,
        };
        assert!(token_from_info(empty, &[], None).is_none());
    }

    #[tokio::test]
    async fn test_client_credentials_grant() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/common/oauth2/v2.0/token"))
            .and(body_string_contains("grant_type=client_credentials"))
            .and(body_string_contains("client_secret=s3cret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "app-token",
                "token_type": "Bearer",
                "expires_in": 3599
            })))
            .expect(1)
            .mount(&server)
            .await;

        let grant = ClientCredentialsGrant::new(
            reqwest::Client::new(),
            identity(&server, "app"),
            "s3cret".to_string(),
        );
        let token = grant
            .grant(&["https://graph.microsoft.com/.default".to_string()])
            .await
            .unwrap();

        assert_eq!(token.access_token, "app-token");
        assert!(token.refresh_token.is_none());
        assert!(token.expires_at.is_some());
    }

    #[tokio::test]
    async fn test_client_credentials_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/common/oauth2/v2.0/token"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": "invalid_client",
                "error_description": "bad secret"
            })))
            .mount(&server)
            .await;

        let grant = ClientCredentialsGrant::new(
            reqwest::Client::new(),
            identity(&server, "app"),
            "wrong".to_string(),
        );
        let err = grant.grant(&storage_scopes()).await.unwrap_err();

        assert!(matches!(err, PipelineError::GrantFailed { .. }));
        assert!(err.to_string().contains("invalid_client: bad secret"));
    }

    #[tokio::test]
    async fn test_narrower_grant_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/common/oauth2/v2.0/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "partial",
                "expires_in": 3600,
                "scope": "User.Read"
            })))
            .mount(&server)
            .await;

        let grant = ClientCredentialsGrant::new(
            reqwest::Client::new(),
            identity(&server, "app"),
            "s3cret".to_string(),
        );
        let wanted = vec!["Files.ReadWrite.All".to_string(), "User.Read".to_string()];
        let err = grant.grant(&wanted).await.unwrap_err();

        assert!(matches!(
            err,
            PipelineError::GrantFailed {
                provider: Provider::Storage,
                ..
            }
        ));
        assert!(err.to_string().contains("do not cover"));
    }

    #[tokio::test]
    async fn test_missing_client_id_is_unavailable() {
        let server = MockServer::start().await;
        let grant = DeviceCodeGrant::new(
            reqwest::Client::new(),
            identity(&server, ""),
            Arc::new(RecordingPrompt::default()),
        );

        let err = grant.grant(&storage_scopes()).await.unwrap_err();

        assert!(matches!(err, PipelineError::CredentialUnavailable { .. }));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_code_polls_until_verified() {
        let server = MockServer::start().await;
        mount_device_code(&server, 900, 0).await;
        Mock::given(method("POST"))
            .and(path("/common/oauth2/v2.0/token"))
            .and(body_string_contains("device_code=device-123"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "authorization_pending"
            })))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/common/oauth2/v2.0/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "user-token",
                "refresh_token": "user-refresh",
                "expires_in": 3600,
                "scope": "Files.ReadWrite.All User.Read profile openid email"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let prompt = Arc::new(RecordingPrompt::default());
        let grant = DeviceCodeGrant::new(
            reqwest::Client::new(),
            identity(&server, "app"),
            Arc::clone(&prompt) as Arc<dyn DevicePrompt>,
        );
        let started = Instant::now();
        let token = grant.grant(&storage_scopes()).await.unwrap();

        assert_eq!(token.access_token, "user-token");
        assert_eq!(token.refresh_token.as_deref(), Some("user-refresh"));
        assert!(token.scopes.contains(&"User.Read".to_string()));
        assert_eq!(*prompt.codes.lock().unwrap(), vec!["WXYZ-1234".to_string()]);
        // A zero interval still waits a second between polls
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_code_narrower_grant_is_rejected() {
        let server = MockServer::start().await;
        mount_device_code(&server, 900, 1).await;
        Mock::given(method("POST"))
            .and(path("/common/oauth2/v2.0/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "user-token",
                "expires_in": 3600,
                "scope": "User.Read"
            })))
            .mount(&server)
            .await;

        let grant = DeviceCodeGrant::new(
            reqwest::Client::new(),
            identity(&server, "app"),
            Arc::new(RecordingPrompt::default()),
        );
        let err = grant.grant(&storage_scopes()).await.unwrap_err();

        assert!(matches!(err, PipelineError::GrantFailed { .. }));
        assert!(err.to_string().contains("Files.ReadWrite.All"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_code_denied() {
        let server = MockServer::start().await;
        mount_device_code(&server, 900, 0).await;
        Mock::given(method("POST"))
            .and(path("/common/oauth2/v2.0/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "authorization_declined"
            })))
            .mount(&server)
            .await;

        let grant = DeviceCodeGrant::new(
            reqwest::Client::new(),
            identity(&server, "app"),
            Arc::new(RecordingPrompt::default()),
        );
        let err = grant.grant(&storage_scopes()).await.unwrap_err();

        assert!(matches!(err, PipelineError::GrantFailed { .. }));
        assert!(err.to_string().contains("authorization_declined"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_code_expiry() {
        let server = MockServer::start().await;
        mount_device_code(&server, 0, 0).await;
        Mock::given(method("POST"))
            .and(path("/common/oauth2/v2.0/token"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let grant = DeviceCodeGrant::new(
            reqwest::Client::new(),
            identity(&server, "app"),
            Arc::new(RecordingPrompt::default()),
        );
        let err = grant.grant(&storage_scopes()).await.unwrap_err();

        assert!(err.to_string().contains("expired"));
    }

    #[tokio::test]
    async fn test_device_code_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/common/oauth2/v2.0/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=old-refresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "renewed",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let grant = DeviceCodeGrant::new(
            reqwest::Client::new(),
            identity(&server, "app"),
            Arc::new(RecordingPrompt::default()),
        );
        let stale = Token {
            access_token: "stale".to_string(),
            refresh_token: Some("old-refresh".to_string()),
            expires_at: Some(Utc::now() - ChronoDuration::hours(1)),
            scopes: storage_scopes(),
        };
        let token = grant.refresh(&stale, &storage_scopes()).await.unwrap();

        assert_eq!(token.access_token, "renewed");
        assert_eq!(token.refresh_token.as_deref(), Some("old-refresh"));
    }

    #[tokio::test]
    async fn test_refresh_rejection_is_refresh_failed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/common/oauth2/v2.0/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "invalid_grant"
            })))
            .mount(&server)
            .await;

        let grant = DeviceCodeGrant::new(
            reqwest::Client::new(),
            identity(&server, "app"),
            Arc::new(RecordingPrompt::default()),
        );
        let stale = Token {
            access_token: "stale".to_string(),
            refresh_token: Some("revoked".to_string()),
            expires_at: None,
            scopes: storage_scopes(),
        };
        let err = grant.refresh(&stale, &storage_scopes()).await.unwrap_err();

        assert!(matches!(err, PipelineError::RefreshFailed { .. }));
    }

    #[tokio::test]
    async fn test_installed_app_missing_credentials() {
        let dir = TempDir::new().unwrap();
        let grant = InstalledAppGrant::new(
            dir.path().join("credentials.json"),
            Arc::new(RecordingPrompt::default()),
        );

        let err = grant.grant(&["gmail.readonly".to_string()]).await.unwrap_err();

        assert!(matches!(
            err,
            PipelineError::CredentialUnavailable {
                provider: Provider::Mail,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_installed_app_loopback_exchange() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=auth-code-1"))
            .and(body_string_contains("client_secret=google-secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "gmail-token",
                "refresh_token": "gmail-refresh",
                "token_type": "Bearer",
                "expires_in": 3599
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let credentials = write_credentials(&dir, &format!("{}/token", server.uri())).await;
        let browser = Arc::new(BrowserPrompt::new("auth-code-1"));
        let grant = InstalledAppGrant::new(credentials, Arc::clone(&browser) as Arc<dyn DevicePrompt>);

        let scopes = vec!["https://www.googleapis.com/auth/gmail.send".to_string()];
        let token = grant.grant(&scopes).await.unwrap();

        assert_eq!(token.access_token, "gmail-token");
        assert_eq!(token.refresh_token.as_deref(), Some("gmail-refresh"));
        assert!(!token.is_expired());
        assert_eq!(token.scopes, scopes);

        let urls = browser.urls.lock().unwrap();
        assert_eq!(urls.len(), 1);
        assert!(urls[0].starts_with("https://accounts.google.com/o/oauth2/auth"));
        assert!(urls[0].contains("client_id=google-client"));
        assert!(urls[0].contains("gmail.send"));
    }

    #[tokio::test]
    async fn test_installed_app_rejected_exchange() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "invalid_grant",
                "error_description": "Bad Request"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let credentials = write_credentials(&dir, &format!("{}/token", server.uri())).await;
        let grant = InstalledAppGrant::new(credentials, Arc::new(BrowserPrompt::new("stale-code")));

        let err = grant.grant(&["gmail.send".to_string()]).await.unwrap_err();

        assert!(matches!(
            err,
            PipelineError::GrantFailed {
                provider: Provider::Mail,
                ..
            }
        ));
        assert!(err.to_string().contains("invalid_grant"));
    }

    #[tokio::test]
    async fn test_installed_app_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=gmail-refresh"))
            .and(body_string_contains("client_secret=google-secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "gmail-renewed",
                "expires_in": 3599
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let credentials = write_credentials(&dir, &format!("{}/token", server.uri())).await;
        let grant = InstalledAppGrant::new(credentials, Arc::new(RecordingPrompt::default()));
        let stale = Token {
            access_token: "old".to_string(),
            refresh_token: Some("gmail-refresh".to_string()),
            expires_at: Some(Utc::now() - ChronoDuration::minutes(1)),
            scopes: vec!["gmail.send".to_string()],
        };

        let token = grant
            .refresh(&stale, &["gmail.send".to_string()])
            .await
            .unwrap();
        assert_eq!(token.access_token, "gmail-renewed");
        assert_eq!(token.refresh_token.as_deref(), Some("gmail-refresh"));
        assert!(token.expires_at.is_some());
    }

    #[tokio::test]
    async fn test_installed_app_refresh_needs_refresh_token() {
        let dir = TempDir::new().unwrap();
        let credentials = write_credentials(&dir, "http://127.0.0.1:9/token").await;
        let grant = InstalledAppGrant::new(credentials, Arc::new(RecordingPrompt::default()));
        let stale = Token {
            access_token: "old".to_string(),
            refresh_token: None,
            expires_at: None,
            scopes: Vec::new(),
        };

        let err = grant.refresh(&stale, &[]).await.unwrap_err();
        assert!(matches!(err, PipelineError::RefreshFailed { .. }));
    }
}
