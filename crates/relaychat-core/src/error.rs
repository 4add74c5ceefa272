use thiserror::Error;

/// Errors produced by the relaychat protocol layer.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("codec error: {0}")]
    Codec(String),

    /// Unexpected envelope type or shape. Always terminates the session.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("duplicate session id: {0}")]
    DuplicateSession(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl ChatError {
    /// Whether this error is a protocol violation by the peer.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, ChatError::InvalidMessage(_))
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(e: serde_json::Error) -> Self {
        ChatError::Codec(e.to_string())
    }
}

pub type ChatResult<T> = Result<T, ChatError>;
