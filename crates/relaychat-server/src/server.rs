//! Core server: accepts connections, runs the login handshake and the
//! per-session relay loop.
//!
//! Each connection gets its own task. Tasks share nothing but the session
//! registry, so a failing connection never affects the others or the
//! accept loop.

use crate::auth::IdentityVerifier;
use crate::config::ServerConfig;
use crate::handshake::{self, HandshakeContext, HandshakeOutcome};
use crate::relay::{RelayBroker, SessionHandle, SessionRegistry};
use crate::session::{Session, SessionEnd};
use crate::transport::websocket::{self, OutboundFrame, WebSocketConnection};
use futures_util::{Stream, StreamExt};
use relaychat_core::ChatResult;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, warn};

/// The relaychat server instance.
pub struct ChatServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    broker: RelayBroker,
    verifier: Arc<dyn IdentityVerifier>,
    /// Broadcast sender for server shutdown notification.
    shutdown_tx: broadcast::Sender<()>,
}

impl ChatServer {
    /// Create a new server instance.
    pub fn new(config: ServerConfig, verifier: Arc<dyn IdentityVerifier>) -> Self {
        if config.auth.allow_bootstrap {
            warn!(
                identity = %config.auth.bootstrap_identity,
                "bootstrap enabled: the first connection is trusted without a token"
            );
        }
        let registry = Arc::new(SessionRegistry::new(
            config.auth.allow_bootstrap,
            config.send_timeout,
        ));
        let broker = RelayBroker::new(registry.clone());
        Self {
            config,
            registry,
            broker,
            verifier,
            shutdown_tx: broadcast::channel(1).0,
        }
    }

    /// Access the session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Accept connections on `listener` until `shutdown` resolves.
    ///
    /// On shutdown every session is closed before returning.
    pub async fn run<F>(self, listener: TcpListener, shutdown: F) -> ChatResult<()>
    where
        F: Future<Output = ()>,
    {
        let server = Arc::new(self);
        let local = listener.local_addr()?;
        let mut ws_rx = websocket::start_listener(listener);

        info!(
            addr = %local,
            bootstrap = server.config.auth.allow_bootstrap,
            "relaychat-server ready"
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                maybe_conn = ws_rx.recv() => {
                    let Some(conn) = maybe_conn else {
                        info!("listener closed, shutting down");
                        break;
                    };
                    let srv = server.clone();
                    tokio::spawn(async move {
                        srv.handle_websocket(conn).await;
                    });
                }
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
            }
        }

        info!("closing connected sessions");
        let _ = server.shutdown_tx.send(());
        server.registry.close_all().await;
        Ok(())
    }

    /// Drive one accepted WebSocket from handshake to teardown.
    async fn handle_websocket(&self, conn: WebSocketConnection) {
        let WebSocketConnection {
            ws_stream,
            remote_addr,
            session_id,
        } = conn;
        let conn_id = self.registry.next_conn_id();
        info!(
            remote = %remote_addr,
            session_id = %session_id,
            conn_id,
            "handling WebSocket connection"
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let (sink, mut inbound) = ws_stream.split();
        let (tx, rx) = mpsc::channel::<OutboundFrame>(self.config.outbound_queue);
        let writer = websocket::spawn_writer(sink, rx);

        let mut session = Session::new(session_id, conn_id);
        let ctx = HandshakeContext {
            registry: &self.registry,
            verifier: self.verifier.as_ref(),
            auth: &self.config.auth,
        };
        let outcome = handshake::authenticate(&ctx, &mut session, &mut inbound, &tx).await;
        // From here on only the registered handle keeps the writer alive.
        drop(tx);

        match outcome {
            Ok(HandshakeOutcome::Authenticated(handle)) => {
                let end = self
                    .session_loop_ws(&handle, &mut inbound, &mut shutdown_rx)
                    .await;
                self.registry.release(&handle).await;
                match &end {
                    SessionEnd::PeerClosed | SessionEnd::Shutdown | SessionEnd::Evicted => {
                        info!(session_id = %handle.session_id, reason = %end, "session ended");
                    }
                    SessionEnd::ProtocolViolation(_) | SessionEnd::Transport(_) => {
                        warn!(session_id = %handle.session_id, reason = %end, "session terminated");
                    }
                }
            }
            Ok(HandshakeOutcome::Rejected(reason)) => {
                info!(
                    remote = %remote_addr,
                    session_id = %session.id,
                    reason = %reason,
                    "connection rejected"
                );
            }
            Err(e) => {
                error!(session_id = %session.id, error = %e, "handshake failed");
            }
        }

        // Every sender is gone; the writer drains and closes, or is cut off.
        if !websocket::finish_writer(writer, self.config.send_timeout).await {
            warn!(session_id = %session.id, conn_id, "writer stalled, connection dropped");
        }
    }

    /// Post-auth relay loop over WebSocket.
    async fn session_loop_ws<S>(
        &self,
        handle: &SessionHandle,
        inbound: &mut S,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> SessionEnd
    where
        S: Stream<Item = Result<Message, WsError>> + Unpin,
    {
        loop {
            tokio::select! {
                _ = handle.closed() => return SessionEnd::Evicted,

                _ = shutdown_rx.recv() => {
                    debug!(session_id = %handle.session_id, "shutdown signal received");
                    return SessionEnd::Shutdown;
                }

                next = websocket::recv_envelope(inbound) => match next {
                    Ok(Some(envelope)) => {
                        if let Err(e) = self.broker.relay(handle, envelope).await {
                            if e.is_protocol_violation() {
                                return SessionEnd::ProtocolViolation(e.to_string());
                            }
                            error!(session_id = %handle.session_id, error = %e, "relay failed");
                        }
                    }
                    Ok(None) => return SessionEnd::PeerClosed,
                    Err(e) if e.is_protocol_violation() => {
                        return SessionEnd::ProtocolViolation(e.to_string());
                    }
                    Err(e) => return SessionEnd::Transport(e.to_string()),
                },
            }
        }
    }
}
