//! Greeting, connect options and server notices
//!
//! The wire parser hands us `ConnectOptions` already decoded; we hand back
//! `ServerInfo` for the greeting and `ServerMessage` notices for the
//! connection's writer. Framing is not our concern.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Generic rejection text sent on any failed authentication
pub const AUTHORIZATION_VIOLATION: &str = "Authorization Violation";

/// Credentials and flags a client sends after the greeting
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectOptions {
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub pedantic: bool,
    #[serde(default, rename = "user", skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, rename = "pass", skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(default, rename = "nkey", skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(default, rename = "sig", skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

// Empty strings count as "not presented".
impl ConnectOptions {
    pub fn username(&self) -> Option<&str> {
        present(&self.username)
    }

    pub fn password(&self) -> Option<&str> {
        present(&self.password)
    }

    pub fn auth_token(&self) -> Option<&str> {
        present(&self.auth_token)
    }

    pub fn public_key(&self) -> Option<&str> {
        present(&self.public_key)
    }

    pub fn signature(&self) -> Option<&str> {
        present(&self.signature)
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_user(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_public_key(mut self, public_key: impl Into<String>, signature: impl Into<String>) -> Self {
        self.public_key = Some(public_key.into());
        self.signature = Some(signature.into());
        self
    }
}

/// Greeting payload sent to every new connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub server_id: String,
    pub client_id: String,
    pub auth_required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

/// Messages from server to connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Info(ServerInfo),
    Ok,
    Error { message: String },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }
}

/// A publish or subscribe refused by the connection's permissions
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PermissionViolation {
    #[error("Permissions Violation for Publish to {subject:?}")]
    Publish { subject: String },

    #[error("Permissions Violation for Subscription to {subject:?} (sid {sid})")]
    Subscription { subject: String, sid: String },
}
