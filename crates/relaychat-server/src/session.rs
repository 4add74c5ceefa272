//! Per-connection session state.
//!
//! A session starts `Connected`, may be asked for a token (`Pending`), and
//! ends either `Authenticated` or `Rejected`. Transitions are checked; an
//! illegal one is reported as an error value.

use relaychat_core::{ChatError, ChatResult};
use std::fmt;

/// Authentication state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Connected,
    /// `login_required` sent, waiting for `auth_token`.
    Pending,
    Authenticated,
    Rejected,
}

/// Server-side state for one live connection.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub conn_id: u64,
    identity: Option<String>,
    state: AuthState,
}

impl Session {
    pub fn new(id: impl Into<String>, conn_id: u64) -> Self {
        Self {
            id: id.into(),
            conn_id,
            identity: None,
            state: AuthState::Connected,
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    /// `Connected → Pending`.
    pub fn request_login(&mut self) -> ChatResult<()> {
        self.transition(AuthState::Pending, &[AuthState::Connected])
    }

    /// `Connected | Pending → Authenticated`.
    pub fn authenticate(&mut self, identity: impl Into<String>) -> ChatResult<()> {
        self.transition(
            AuthState::Authenticated,
            &[AuthState::Connected, AuthState::Pending],
        )?;
        self.identity = Some(identity.into());
        Ok(())
    }

    /// `Connected | Pending → Rejected`.
    pub fn reject(&mut self) -> ChatResult<()> {
        self.transition(AuthState::Rejected, &[AuthState::Connected, AuthState::Pending])
    }

    fn transition(&mut self, to: AuthState, allowed_from: &[AuthState]) -> ChatResult<()> {
        if !allowed_from.contains(&self.state) {
            return Err(ChatError::Other(format!(
                "session {}: illegal transition {:?} -> {:?}",
                self.id, self.state, to
            )));
        }
        self.state = to;
        Ok(())
    }
}

/// Why a session's connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// Peer closed the socket or sent a close frame.
    PeerClosed,
    /// Unexpected envelope type or shape.
    ProtocolViolation(String),
    /// Read failure on the socket.
    Transport(String),
    /// Removed from the registry by another task (e.g. failed delivery).
    Evicted,
    /// Server is shutting down.
    Shutdown,
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEnd::PeerClosed => write!(f, "peer closed"),
            SessionEnd::ProtocolViolation(why) => write!(f, "protocol violation: {why}"),
            SessionEnd::Transport(why) => write!(f, "transport failure: {why}"),
            SessionEnd::Evicted => write!(f, "evicted"),
            SessionEnd::Shutdown => write!(f, "server shutdown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_path() {
        let mut s = Session::new("x", 1);
        assert_eq!(s.state(), AuthState::Connected);
        s.authenticate("first_user").unwrap();
        assert_eq!(s.state(), AuthState::Authenticated);
        assert_eq!(s.identity(), Some("first_user"));
    }

    #[test]
    fn token_path() {
        let mut s = Session::new("y", 2);
        s.request_login().unwrap();
        assert_eq!(s.state(), AuthState::Pending);
        assert_eq!(s.identity(), None);
        s.authenticate("y@example.com").unwrap();
        assert_eq!(s.identity(), Some("y@example.com"));
    }

    #[test]
    fn rejected_is_terminal() {
        let mut s = Session::new("z", 3);
        s.request_login().unwrap();
        s.reject().unwrap();
        assert_eq!(s.state(), AuthState::Rejected);
        assert!(s.authenticate("z@example.com").is_err());
        assert!(s.request_login().is_err());
        assert!(s.reject().is_err());
        assert_eq!(s.identity(), None);
    }

    #[test]
    fn authenticated_cannot_be_rejected() {
        let mut s = Session::new("a", 4);
        s.authenticate("a@example.com").unwrap();
        assert!(s.reject().is_err());
        assert!(s.request_login().is_err());
        assert_eq!(s.state(), AuthState::Authenticated);
    }

    #[test]
    fn end_reason_display() {
        assert_eq!(SessionEnd::PeerClosed.to_string(), "peer closed");
        assert_eq!(
            SessionEnd::ProtocolViolation("unexpected auth_token".into()).to_string(),
            "protocol violation: unexpected auth_token"
        );
    }
}
