//! Wire envelopes exchanged between relaychat clients and the server.
//!
//! Every envelope is a JSON object tagged by its `type` field. Tag and field
//! names match the deployed desktop client, so `auth-result` travels as
//! `"auth"` and carries the identity under `email`.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Authentication outcome carried by `auth` and `auth_request` envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStatus {
    Success,
    Failed,
    LoginRequired,
}

/// A text message. `sender` and `timestamp` are set by the server when relaying.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// A file (voice note, sticker, ...) with base64 text content.
///
/// The relay never decodes `content`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatFile {
    pub filename: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// One structured message unit on a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Envelope {
    /// Server asks the client to log in.
    #[serde(rename = "auth_request")]
    AuthRequest { status: AuthStatus },

    /// Client presents a bearer token.
    #[serde(rename = "auth_token", alias = "google_token")]
    AuthToken { token: String },

    /// Server reports the authentication outcome.
    #[serde(rename = "auth")]
    AuthResult {
        status: AuthStatus,
        #[serde(
            rename = "email",
            alias = "identity",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        identity: Option<String>,
    },

    #[serde(rename = "message")]
    ChatMessage(ChatMessage),

    #[serde(rename = "file")]
    ChatFile(ChatFile),
}

impl Envelope {
    /// Build an `auth` envelope granting `identity`.
    pub fn auth_success(identity: impl Into<String>) -> Self {
        Envelope::AuthResult {
            status: AuthStatus::Success,
            identity: Some(identity.into()),
        }
    }

    /// Build an `auth` envelope reporting a failed login.
    pub fn auth_failed() -> Self {
        Envelope::AuthResult {
            status: AuthStatus::Failed,
            identity: None,
        }
    }

    /// Build an `auth` envelope asking the client for a token.
    pub fn login_required() -> Self {
        Envelope::AuthResult {
            status: AuthStatus::LoginRequired,
            identity: None,
        }
    }

    /// Build an outbound text message (unstamped).
    pub fn message(content: impl Into<String>) -> Self {
        Envelope::ChatMessage(ChatMessage {
            content: content.into(),
            sender: None,
            timestamp: None,
        })
    }

    /// Build an outbound file message from already-encoded base64 content.
    pub fn file(filename: impl Into<String>, content: impl Into<String>) -> Self {
        Envelope::ChatFile(ChatFile {
            filename: filename.into(),
            content: content.into(),
            sender: None,
            timestamp: None,
        })
    }

    /// Wire tag of this envelope, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::AuthRequest { .. } => "auth_request",
            Envelope::AuthToken { .. } => "auth_token",
            Envelope::AuthResult { .. } => "auth",
            Envelope::ChatMessage(_) => "message",
            Envelope::ChatFile(_) => "file",
        }
    }

    /// Whether this envelope is chat traffic that the relay fans out.
    pub fn is_relayable(&self) -> bool {
        matches!(self, Envelope::ChatMessage(_) | Envelope::ChatFile(_))
    }

    /// Overwrite sender and timestamp on chat traffic.
    ///
    /// Returns `None` for envelopes that are not relayable.
    pub fn stamped(self, sender: &str, timestamp: String) -> Option<Self> {
        match self {
            Envelope::ChatMessage(mut m) => {
                m.sender = Some(sender.to_string());
                m.timestamp = Some(timestamp);
                Some(Envelope::ChatMessage(m))
            }
            Envelope::ChatFile(mut f) => {
                f.sender = Some(sender.to_string());
                f.timestamp = Some(timestamp);
                Some(Envelope::ChatFile(f))
            }
            _ => None,
        }
    }
}

/// Current time as an RFC 3339 UTC string, e.g. `2026-10-19T08:15:02.431Z`.
pub fn utc_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
