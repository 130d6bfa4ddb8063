use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::Result;

/// Bearer credential attached to backend requests.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub access_token: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Expiring within the next minute counts as stale.
    pub fn needs_refresh(&self) -> bool {
        match self.expires_at {
            Some(exp) => Utc::now() + Duration::minutes(1) >= exp,
            None => false,
        }
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredTokens {
    #[serde(default)]
    credential: Option<Credential>,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Holds the session tokens, optionally mirrored to a JSON file.
///
/// Clones share the same state.
#[derive(Clone)]
pub struct CredentialStore {
    tokens: Arc<RwLock<StoredTokens>>,
    path: Option<PathBuf>,
}

impl CredentialStore {
    pub fn in_memory() -> Self {
        Self {
            tokens: Arc::new(RwLock::new(StoredTokens::default())),
            path: None,
        }
    }

    /// Opens a file-backed store, loading whatever a previous run left behind.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let tokens = match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(tokens) => tokens,
                Err(err) => {
                    warn!(error = %err, path = %path.display(), "discarding unreadable credentials file");
                    StoredTokens::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => StoredTokens::default(),
            Err(err) => return Err(err.into()),
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self {
            tokens: Arc::new(RwLock::new(tokens)),
            path: Some(path),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn credential(&self) -> Option<Credential> {
        self.tokens.read().credential.clone()
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.tokens.read().refresh_token.clone()
    }

    pub fn set(&self, credential: Credential) {
        let mut tokens = self.tokens.write();
        tokens.credential = Some(credential);
        self.persist(&tokens);
    }

    pub fn set_refresh_token(&self, refresh_token: Option<String>) {
        let mut tokens = self.tokens.write();
        tokens.refresh_token = refresh_token;
        self.persist(&tokens);
    }

    /// Drops both the access credential and the refresh credential.
    pub fn clear(&self) {
        let mut tokens = self.tokens.write();
        *tokens = StoredTokens::default();
        self.persist(&tokens);
        debug!("credentials cleared");
    }

    /// Clears the session only if `credential` is still the stored one.
    pub fn clear_if_current(&self, credential: &Credential) -> bool {
        let mut tokens = self.tokens.write();
        if tokens.credential.as_ref() != Some(credential) {
            return false;
        }
        *tokens = StoredTokens::default();
        self.persist(&tokens);
        true
    }

    fn persist(&self, tokens: &StoredTokens) {
        let Some(path) = &self.path else {
            return;
        };
        let result = serde_json::to_vec_pretty(tokens)
            .map_err(std::io::Error::from)
            .and_then(|bytes| fs::write(path, bytes));
        if let Err(err) = result {
            warn!(error = %err, path = %path.display(), "failed to persist credentials");
        }
    }
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore")
            .field("path", &self.path)
            .field("has_credential", &self.tokens.read().credential.is_some())
            .finish()
    }
}
