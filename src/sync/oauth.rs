//! Google OAuth for an installed application.
//!
//! Flow:
//! 1. Bind a loopback listener on an ephemeral port
//! 2. Open the consent page in the browser (PKCE + random state)
//! 3. Google redirects to `http://127.0.0.1:<port>/` with an authorization code
//! 4. The code is exchanged for an access token and a refresh token
//!
//! The resulting [`Credential`] is cached on disk by [`CredentialStore`] and
//! refreshed in place when it expires.

use super::callback::{CallbackListener, CALLBACK_TIMEOUT};
use crate::error::{Result, SyncError};
use crate::utils::open_browser;
use chrono::{DateTime, Duration, Utc};
use oauth2::basic::{BasicClient, BasicTokenResponse};
use oauth2::url::Url;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, CsrfToken, EndpointNotSet, EndpointSet,
    PkceCodeChallenge, PkceCodeVerifier, RedirectUrl, RefreshToken, Scope, TokenResponse,
    TokenUrl,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Google OAuth endpoints
const DEFAULT_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/auth";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Full Drive scope, needed to see a folder created by an earlier install
pub const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive";

/// Tokens are treated as expired this long before their real expiry
const EXPIRY_SKEW_SECS: i64 = 60;

/// Cached OAuth credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl Credential {
    /// Expired (or about to expire) at `now`. Credentials without expiry never expire.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at
            .map(|at| now + Duration::seconds(EXPIRY_SKEW_SECS) >= at)
            .unwrap_or(false)
    }

    pub fn is_refreshable(&self) -> bool {
        self.refresh_token
            .as_deref()
            .map(|t| !t.is_empty())
            .unwrap_or(false)
    }
}

/// Where a cached credential stands before binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenState {
    /// No cached credential
    Missing,
    /// Usable as is
    Valid(Credential),
    /// Expired but carries a refresh token
    Refreshable(Credential),
    /// Expired and cannot be refreshed
    NeedsReauth,
}

impl TokenState {
    pub fn classify(cached: Option<Credential>, now: DateTime<Utc>) -> Self {
        match cached {
            None => TokenState::Missing,
            Some(c) if !c.is_expired(now) => TokenState::Valid(c),
            Some(c) if c.is_refreshable() => TokenState::Refreshable(c),
            Some(_) => TokenState::NeedsReauth,
        }
    }
}

/// Result of trying to refresh an expired credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed(Credential),
    /// Refresh failed; the reason is only logged
    NeedsReauth(String),
}

/// Produces credentials, interactively or by refresh.
pub trait Authorizer: Send + Sync {
    /// Run the interactive consent flow.
    fn authorize(&self) -> Result<Credential>;

    /// Exchange the refresh token of `credential` for a new access token.
    fn refresh(&self, credential: &Credential) -> Result<Credential>;

    /// Explicit `Refreshable -> {Refreshed | NeedsReauth}` transition.
    fn try_refresh(&self, credential: &Credential) -> RefreshOutcome {
        match self.refresh(credential) {
            Ok(refreshed) => RefreshOutcome::Refreshed(refreshed),
            Err(e) => RefreshOutcome::NeedsReauth(e.to_string()),
        }
    }
}

/// Persists the credential as JSON at a fixed path.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the cached credential. An unreadable token file counts as absent.
    pub fn load(&self) -> Result<Option<Credential>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let bytes = std::fs::read(&self.path).map_err(|e| SyncError::fs(&self.path, e))?;
        match serde_json::from_slice(&bytes) {
            Ok(credential) => Ok(Some(credential)),
            Err(e) => {
                warn!(
                    "Ignoring unreadable token file {}: {}",
                    self.path.display(),
                    e
                );
                Ok(None)
            }
        }
    }

    /// Save credential, overwriting any stale one.
    pub fn save(&self, credential: &Credential) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SyncError::fs(parent, e))?;
        }
        let json = serde_json::to_string_pretty(credential)?;
        std::fs::write(&self.path, json).map_err(|e| SyncError::fs(&self.path, e))?;
        debug!("Token saved to {}", self.path.display());
        Ok(())
    }

    /// Delete the cached credential. Deleting a missing file is not an error.
    pub fn delete(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                info!("Deleted cached token {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SyncError::fs(&self.path, e)),
        }
    }
}

/// Credential of a bound session.
///
/// Shared by the Drive client and every worker thread. Hands out the current
/// access token, refreshing and persisting it first once it has expired.
pub struct SessionCredential {
    current: Mutex<Credential>,
    store: CredentialStore,
    authorizer: Arc<dyn Authorizer>,
}

impl fmt::Debug for SessionCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCredential")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl SessionCredential {
    pub fn new(
        credential: Credential,
        store: CredentialStore,
        authorizer: Arc<dyn Authorizer>,
    ) -> Self {
        Self {
            current: Mutex::new(credential),
            store,
            authorizer,
        }
    }

    /// Copy of the credential currently in use.
    pub fn current(&self) -> Credential {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Access token to send with the next request.
    pub fn access_token(&self) -> Result<String> {
        self.access_token_at(Utc::now())
    }

    /// Access token valid at `now`. Never starts an interactive authorization:
    /// a credential that cannot be refreshed asks for a rebind instead.
    pub fn access_token_at(&self, now: DateTime<Utc>) -> Result<String> {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if !current.is_expired(now) {
            return Ok(current.access_token.clone());
        }

        if !current.is_refreshable() {
            return Err(SyncError::Auth(
                "Access token expired and has no refresh token, rebind Google Drive".to_string(),
            ));
        }

        debug!("Access token expired, refreshing");
        match self.authorizer.try_refresh(&current) {
            RefreshOutcome::Refreshed(fresh) => {
                self.store.save(&fresh)?;
                *current = fresh;
                Ok(current.access_token.clone())
            }
            RefreshOutcome::NeedsReauth(reason) => Err(SyncError::Auth(format!(
                "Token refresh failed ({}), rebind Google Drive",
                reason
            ))),
        }
    }
}

/// OAuth client registration, as downloaded from the Google Cloud console.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientSecret {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_auth_uri")]
    pub auth_uri: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_auth_uri() -> String {
    DEFAULT_AUTH_URI.to_string()
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

#[derive(Deserialize)]
struct ClientSecretFile {
    installed: Option<ClientSecret>,
    web: Option<ClientSecret>,
}

impl ClientSecret {
    /// Parse the `installed` (or `web`) section of a `credentials.json`.
    pub fn from_json(json: &str) -> Result<Self> {
        let file: ClientSecretFile = serde_json::from_str(json)
            .map_err(|e| SyncError::Auth(format!("Malformed client secret file: {}", e)))?;
        file.installed.or(file.web).ok_or_else(|| {
            SyncError::Auth(
                "Client secret file has neither an 'installed' nor a 'web' section".to_string(),
            )
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Auth(format!(
                "Cannot read client secret file {}: {}. Download OAuth client credentials \
                 (Desktop app) from the Google Cloud console and save them there.",
                path.display(),
                e
            ))
        })?;
        Self::from_json(&json)
    }
}

/// Google client with the authorization and token endpoints configured
type GoogleClient =
    BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

impl ClientSecret {
    fn oauth_client(&self) -> Result<GoogleClient> {
        let auth_url = AuthUrl::new(self.auth_uri.clone())
            .map_err(|e| SyncError::Auth(format!("Invalid auth_uri '{}': {}", self.auth_uri, e)))?;
        let token_url = TokenUrl::new(self.token_uri.clone()).map_err(|e| {
            SyncError::Auth(format!("Invalid token_uri '{}': {}", self.token_uri, e))
        })?;

        Ok(BasicClient::new(ClientId::new(self.client_id.clone()))
            .set_client_secret(oauth2::ClientSecret::new(self.client_secret.clone()))
            .set_auth_uri(auth_url)
            .set_token_uri(token_url))
    }
}

/// Consent page to open, plus what the callback and code exchange need.
struct ConsentRequest {
    url: Url,
    state: CsrfToken,
    verifier: PkceCodeVerifier,
}

/// Offline access with a forced consent prompt, so Google always returns a
/// refresh token.
fn consent_request(client: &GoogleClient) -> ConsentRequest {
    let (challenge, verifier) = PkceCodeChallenge::new_random_sha256();
    let (url, state) = client
        .authorize_url(CsrfToken::new_random)
        .add_scope(Scope::new(DRIVE_SCOPE.to_string()))
        .add_extra_param("access_type", "offline")
        .add_extra_param("prompt", "consent")
        .set_pkce_challenge(challenge)
        .url();
    ConsentRequest {
        url,
        state,
        verifier,
    }
}

/// Convert a token response into a credential. `previous_refresh` is kept
/// when Google does not rotate the refresh token.
fn credential_from_token(
    token: &BasicTokenResponse,
    previous_refresh: Option<&str>,
    now: DateTime<Utc>,
) -> Credential {
    let scope = token
        .scopes()
        .map(|scopes| {
            scopes
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_else(|| DRIVE_SCOPE.to_string());

    Credential {
        access_token: token.access_token().secret().clone(),
        refresh_token: token
            .refresh_token()
            .map(|t| t.secret().clone())
            .or_else(|| previous_refresh.map(str::to_string)),
        token_type: default_token_type(),
        scope,
        expires_at: token
            .expires_in()
            .and_then(|d| Duration::from_std(d).ok())
            .map(|d| now + d),
    }
}

/// Installed-app flow against Google's OAuth endpoints.
///
/// The client secret file is read on each use, so a missing file only
/// matters once an interactive authorization or a refresh is needed.
pub struct InstalledAppFlow {
    http: reqwest::blocking::Client,
    secret_path: PathBuf,
    open_browser: bool,
}

impl InstalledAppFlow {
    pub fn new(secret_path: impl Into<PathBuf>) -> Self {
        // Token endpoints must not be followed through redirects
        let http = reqwest::blocking::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_else(|_| reqwest::blocking::Client::new());
        Self {
            http,
            secret_path: secret_path.into(),
            open_browser: true,
        }
    }

    /// Only log the consent URL instead of launching a browser.
    pub fn without_browser(mut self) -> Self {
        self.open_browser = false;
        self
    }

    fn secret(&self) -> Result<ClientSecret> {
        ClientSecret::load(&self.secret_path)
    }
}

impl Authorizer for InstalledAppFlow {
    fn authorize(&self) -> Result<Credential> {
        let listener = CallbackListener::bind()?;
        let redirect_uri = RedirectUrl::new(listener.redirect_uri())
            .map_err(|e| SyncError::Auth(format!("Invalid redirect URI: {}", e)))?;
        let client = self.secret()?.oauth_client()?.set_redirect_uri(redirect_uri);
        let consent = consent_request(&client);

        info!("Open this URL to authorize Google Drive access: {}", consent.url);
        if self.open_browser && !open_browser(consent.url.as_str()) {
            warn!("Could not launch a browser, open the URL above manually");
        }

        let callback = listener.wait(CALLBACK_TIMEOUT)?;
        if callback.state != *consent.state.secret() {
            return Err(SyncError::Auth(
                "OAuth state mismatch, ignoring callback".to_string(),
            ));
        }

        let token = client
            .exchange_code(AuthorizationCode::new(callback.code))
            .set_pkce_verifier(consent.verifier)
            .request(&self.http)
            .map_err(|e| SyncError::Auth(format!("Token exchange failed: {}", e)))?;

        info!("Google Drive authorization complete");
        Ok(credential_from_token(&token, None, Utc::now()))
    }

    fn refresh(&self, credential: &Credential) -> Result<Credential> {
        let refresh_token = credential
            .refresh_token
            .as_deref()
            .ok_or_else(|| SyncError::Auth("Credential has no refresh token".to_string()))?;
        let client = self.secret()?.oauth_client()?;

        let token = client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request(&self.http)
            .map_err(|e| SyncError::Auth(format!("Token refresh failed: {}", e)))?;

        info!("Access token refreshed");
        Ok(credential_from_token(&token, Some(refresh_token), Utc::now()))
    }
}
