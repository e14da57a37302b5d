//! Authentication configuration
//!
//! `AuthOptions` is produced by the configuration loader (or built in code)
//! and consumed verbatim by the server. It is never mutated once applied;
//! a reload hands the server a new value.

use crate::auth::{Authenticator, PublicKeyIdentity, PublicKeyUser, RoutePermissions, User};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("password configured without a username")]
    PasswordWithoutUsername,

    #[error("shared token cannot be empty")]
    EmptyToken,

    #[error("user entry with an empty username")]
    EmptyUsername,

    #[error("invalid public key '{key}': {reason}")]
    InvalidPublicKey { key: String, reason: String },

    #[error("cluster password configured without a cluster username")]
    ClusterPasswordWithoutUsername,
}

/// Credentials and permissions for inter-broker routes
#[derive(Clone, Default, Deserialize)]
pub struct ClusterAuth {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub permissions: Option<RoutePermissions>,
}

impl fmt::Debug for ClusterAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterAuth")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("permissions", &self.permissions)
            .finish()
    }
}

/// Server authentication options
#[derive(Clone, Default, Deserialize)]
pub struct AuthOptions {
    /// Per-user credentials
    #[serde(default)]
    pub users: Vec<User>,

    /// Public-key identities
    #[serde(default, rename = "nkeys")]
    pub public_keys: Vec<PublicKeyUser>,

    /// Shared token accepted from any client
    #[serde(default)]
    pub token: Option<String>,

    /// Shared username/password pair
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub cluster: ClusterAuth,

    /// Decides every client connection when set
    #[serde(skip)]
    pub custom_client_auth: Option<Arc<dyn Authenticator>>,

    /// Decides every route connection when set
    #[serde(skip)]
    pub custom_route_auth: Option<Arc<dyn Authenticator>>,
}

impl AuthOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let opts: AuthOptions = serde_json::from_str(json)?;
        opts.validate()?;
        Ok(opts)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&contents)
    }

    pub fn with_users(mut self, users: impl IntoIterator<Item = User>) -> Self {
        self.users.extend(users);
        self
    }

    pub fn with_public_keys(mut self, keys: impl IntoIterator<Item = PublicKeyUser>) -> Self {
        self.public_keys.extend(keys);
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_user_password(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_cluster(mut self, cluster: ClusterAuth) -> Self {
        self.cluster = cluster;
        self
    }

    pub fn with_custom_client_auth(mut self, auth: Arc<dyn Authenticator>) -> Self {
        self.custom_client_auth = Some(auth);
        self
    }

    pub fn with_custom_route_auth(mut self, auth: Arc<dyn Authenticator>) -> Self {
        self.custom_route_auth = Some(auth);
        self
    }

    /// True iff at least one client authentication strategy is configured
    pub fn auth_required(&self) -> bool {
        self.custom_client_auth.is_some()
            || !self.public_keys.is_empty()
            || !self.users.is_empty()
            || self.token.is_some()
            || self.username.is_some()
    }

    /// True if any shared or per-user password is stored in plaintext
    pub fn has_plaintext_passwords(&self) -> bool {
        let shared = self
            .password
            .as_deref()
            .is_some_and(|p| !crate::auth::is_hashed(p));
        shared || self.users.iter().any(|u| !crate::auth::is_hashed(&u.password))
    }

    /// Reject malformed or contradictory settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.password.is_some() && self.username.is_none() {
            return Err(ConfigError::PasswordWithoutUsername);
        }
        if self.username.as_deref() == Some("") {
            return Err(ConfigError::EmptyUsername);
        }
        if self.token.as_deref() == Some("") {
            return Err(ConfigError::EmptyToken);
        }
        if self.users.iter().any(|u| u.username.is_empty()) {
            return Err(ConfigError::EmptyUsername);
        }
        for key in &self.public_keys {
            PublicKeyIdentity::parse(&key.public_key).map_err(|e| {
                ConfigError::InvalidPublicKey {
                    key: key.public_key.clone(),
                    reason: e.to_string(),
                }
            })?;
        }
        if self.cluster.password.is_some() && self.cluster.username.is_none() {
            return Err(ConfigError::ClusterPasswordWithoutUsername);
        }
        Ok(())
    }
}

impl fmt::Debug for AuthOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthOptions")
            .field("users", &self.users)
            .field("public_keys", &self.public_keys)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("cluster", &self.cluster)
            .field("custom_client_auth", &self.custom_client_auth.is_some())
            .field("custom_route_auth", &self.custom_route_auth.is_some())
            .finish()
    }
}
