//! Authentication handshake for a freshly accepted connection.
//!
//! Flow:
//! 1. If the bootstrap slot is free, admit immediately with the bootstrap
//!    identity and send `auth{success}`.
//! 2. Otherwise send `auth{login_required}` and wait for exactly one
//!    `auth_token` envelope.
//! 3. Verify the token; admit and send `auth{success}`, or send
//!    `auth{failed}` and reject.

use crate::auth::IdentityVerifier;
use crate::config::AuthConfig;
use crate::relay::{SessionHandle, SessionRegistry};
use crate::session::Session;
use crate::transport::websocket::{queue_envelope, recv_envelope, OutboundFrame};
use futures_util::Stream;
use relaychat_core::{ChatError, ChatResult, Envelope};
use std::fmt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

/// Shared dependencies of the handshake.
pub struct HandshakeContext<'a> {
    pub registry: &'a SessionRegistry,
    pub verifier: &'a dyn IdentityVerifier,
    pub auth: &'a AuthConfig,
}

/// Why a connection was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// The verifier did not accept the token.
    InvalidToken,
    /// Another live session already holds the id.
    DuplicateSession,
    /// Something other than `auth_token` arrived while pending.
    ProtocolViolation(String),
    /// Peer went away before finishing the login.
    Disconnected,
    /// No token within `auth.login_timeout_secs`.
    LoginTimeout,
    /// Socket read or write failed.
    Transport(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::InvalidToken => write!(f, "token rejected by verifier"),
            RejectReason::DuplicateSession => write!(f, "duplicate session id"),
            RejectReason::ProtocolViolation(why) => write!(f, "protocol violation: {why}"),
            RejectReason::Disconnected => write!(f, "disconnected during login"),
            RejectReason::LoginTimeout => write!(f, "login timed out"),
            RejectReason::Transport(why) => write!(f, "transport failure: {why}"),
        }
    }
}

/// Result of the handshake.
#[derive(Debug)]
pub enum HandshakeOutcome {
    /// Admitted into the registry.
    Authenticated(SessionHandle),
    Rejected(RejectReason),
}

/// Drive `session` through authentication.
///
/// `inbound` is the read half of the connection, `tx` its outbound queue.
/// On success the returned handle is already a registry member. Errors are
/// reserved for internal faults (illegal state transitions, encoding).
pub async fn authenticate<S>(
    ctx: &HandshakeContext<'_>,
    session: &mut Session,
    inbound: &mut S,
    tx: &mpsc::Sender<OutboundFrame>,
) -> ChatResult<HandshakeOutcome>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    // Bootstrap: the first session ever admitted skips the token exchange.
    let bootstrap = SessionHandle::new(
        session.id.clone(),
        ctx.auth.bootstrap_identity.clone(),
        session.conn_id,
        tx.clone(),
    );
    match ctx.registry.admit_bootstrap(bootstrap.clone()).await {
        Ok(true) => {
            session.authenticate(ctx.auth.bootstrap_identity.clone())?;
            warn!(
                session_id = %session.id,
                identity = %ctx.auth.bootstrap_identity,
                "bootstrap session admitted without token"
            );
            return Ok(confirm(session, bootstrap));
        }
        Ok(false) => {}
        Err(e) => return admission_failed(session, tx, e).await,
    }

    session.request_login()?;
    if let Err(e) = queue_envelope(tx, &Envelope::login_required()).await {
        session.reject()?;
        return Ok(HandshakeOutcome::Rejected(RejectReason::Transport(
            e.to_string(),
        )));
    }
    debug!(session_id = %session.id, "login required");

    let next = match ctx.auth.login_timeout {
        Some(limit) => match tokio::time::timeout(limit, recv_envelope(inbound)).await {
            Ok(r) => r,
            Err(_) => {
                session.reject()?;
                return Ok(HandshakeOutcome::Rejected(RejectReason::LoginTimeout));
            }
        },
        None => recv_envelope(inbound).await,
    };

    let token = match next {
        Ok(Some(Envelope::AuthToken { token })) => token,
        Ok(Some(other)) => {
            session.reject()?;
            return Ok(HandshakeOutcome::Rejected(RejectReason::ProtocolViolation(
                format!("expected auth_token, got {}", other.kind()),
            )));
        }
        Ok(None) => {
            session.reject()?;
            return Ok(HandshakeOutcome::Rejected(RejectReason::Disconnected));
        }
        Err(e) if e.is_protocol_violation() => {
            session.reject()?;
            return Ok(HandshakeOutcome::Rejected(RejectReason::ProtocolViolation(
                e.to_string(),
            )));
        }
        Err(e) => {
            session.reject()?;
            return Ok(HandshakeOutcome::Rejected(RejectReason::Transport(
                e.to_string(),
            )));
        }
    };

    let Some(identity) = ctx.verifier.verify(&token).await else {
        return refuse(session, tx, RejectReason::InvalidToken).await;
    };

    let handle = SessionHandle::new(
        session.id.clone(),
        identity.clone(),
        session.conn_id,
        tx.clone(),
    );
    match ctx.registry.admit(handle.clone()).await {
        Ok(()) => {
            session.authenticate(identity)?;
            Ok(confirm(session, handle))
        }
        Err(e) => admission_failed(session, tx, e).await,
    }
}

/// The registry has admitted `handle` and queued its `auth{success}`.
fn confirm(session: &Session, handle: SessionHandle) -> HandshakeOutcome {
    info!(
        session_id = %session.id,
        identity = %handle.identity,
        "session authenticated"
    );
    HandshakeOutcome::Authenticated(handle)
}

/// Map a failed admission to a rejection.
async fn admission_failed(
    session: &mut Session,
    tx: &mpsc::Sender<OutboundFrame>,
    err: ChatError,
) -> ChatResult<HandshakeOutcome> {
    match err {
        ChatError::DuplicateSession(_) => {
            refuse(session, tx, RejectReason::DuplicateSession).await
        }
        ChatError::Delivery(why) => {
            session.reject()?;
            Ok(HandshakeOutcome::Rejected(RejectReason::Transport(why)))
        }
        other => Err(other),
    }
}

/// Send `auth{failed}` and mark the session rejected.
async fn refuse(
    session: &mut Session,
    tx: &mpsc::Sender<OutboundFrame>,
    reason: RejectReason,
) -> ChatResult<HandshakeOutcome> {
    session.reject()?;
    // The connection closes right after; a failed send changes nothing.
    let _ = queue_envelope(tx, &Envelope::auth_failed()).await;
    Ok(HandshakeOutcome::Rejected(reason))
}
