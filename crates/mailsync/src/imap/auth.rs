//! Credentials handed to the session factory
//!
//! Acquiring and refreshing OAuth2 tokens happens elsewhere; this module only
//! consumes a bearer token and throws it away when the server rejects it.

use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Tokens this close to expiry are treated as already expired
const EXPIRY_BUFFER_SECS: i64 = 300;

/// Supplies bearer tokens for OAuth2 logins
pub trait TokenSource: Send + Sync {
    /// Return a token that is currently believed to be valid
    fn bearer_token(&self) -> Result<String>;

    /// Forget any cached token after the server rejected it
    fn invalidate(&self);
}

/// A fixed token, typically injected by the host process
pub struct StaticToken {
    token: String,
}

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl TokenSource for StaticToken {
    fn bearer_token(&self) -> Result<String> {
        Ok(self.token.clone())
    }

    fn invalidate(&self) {
        warn!("Static bearer token was rejected; a new token must be supplied");
    }
}

/// Stored token data
#[derive(Debug, Serialize, Deserialize)]
struct StoredToken {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_at: Option<i64>,
}

/// Token cache kept as JSON on disk by the credential collaborator
pub struct TokenFile {
    path: PathBuf,
}

impl TokenFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Token cache in the default config directory (`~/.config/mailsync/tokens.json`)
    pub fn default_location() -> Result<Self> {
        let path = config::config_path("tokens.json").context("Could not determine config directory")?;
        Ok(Self::new(path))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<StoredToken> {
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("No cached token at {}", self.path.display()))?;
        serde_json::from_str(&content).context("Failed to parse cached token")
    }
}

impl TokenSource for TokenFile {
    fn bearer_token(&self) -> Result<String> {
        let token = self.load()?;
        if let Some(expires_at) = token.expires_at {
            let now = chrono::Utc::now().timestamp();
            if expires_at <= now + EXPIRY_BUFFER_SECS {
                anyhow::bail!("Cached token expired at {}; refresh required", expires_at);
            }
        }
        token
            .access_token
            .context("No access token cached; refresh required")
    }

    /// Drop the access token but keep the refresh token for the collaborator
    fn invalidate(&self) {
        if !self.path.exists() {
            return;
        }
        let refresh_token = match self.load() {
            Ok(stored) => stored.refresh_token,
            Err(e) => {
                warn!("Discarding unreadable token cache: {:#}", e);
                None
            }
        };

        let result = match refresh_token {
            Some(refresh_token) => {
                let kept = StoredToken {
                    access_token: None,
                    refresh_token: Some(refresh_token),
                    expires_at: None,
                };
                config::save_json_file(&self.path, &kept)
            }
            None => fs::remove_file(&self.path).map_err(anyhow::Error::from),
        };
        match result {
            Ok(()) => info!("Invalidated cached access token in {}", self.path.display()),
            Err(e) => warn!("Failed to invalidate token cache {}: {:#}", self.path.display(), e),
        }
    }
}

/// Login credentials for one mailbox account
#[derive(Clone)]
pub enum Credentials {
    Password {
        username: String,
        password: String,
    },
    OAuth2 {
        username: String,
        tokens: Arc<dyn TokenSource>,
    },
}

impl Credentials {
    pub fn password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials::Password {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn oauth2(username: impl Into<String>, tokens: Arc<dyn TokenSource>) -> Self {
        Credentials::OAuth2 {
            username: username.into(),
            tokens,
        }
    }

    pub fn username(&self) -> &str {
        match self {
            Credentials::Password { username, .. } | Credentials::OAuth2 { username, .. } => {
                username
            }
        }
    }

    /// Drop cached tokens so the next login cannot reuse a rejected one
    pub fn invalidate(&self) {
        if let Credentials::OAuth2 { tokens, .. } = self {
            tokens.invalidate();
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Credentials::Password { .. } => "Password",
            Credentials::OAuth2 { .. } => "OAuth2",
        };
        f.debug_struct(kind)
            .field("username", &self.username())
            .finish_non_exhaustive()
    }
}

/// SASL XOAUTH2 initial response
pub struct XOAuth2 {
    user: String,
    access_token: String,
}

impl XOAuth2 {
    pub fn new(user: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            access_token: access_token.into(),
        }
    }

    pub fn response(&self) -> String {
        format!(
            "user={}\x01auth=Bearer {}\x01\x01",
            self.user, self.access_token
        )
    }
}

impl imap::Authenticator for XOAuth2 {
    type Response = String;

    fn process(&self, _challenge: &[u8]) -> Self::Response {
        self.response()
    }
}
