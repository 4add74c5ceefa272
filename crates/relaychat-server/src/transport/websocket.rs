//! WebSocket listener using tokio-tungstenite.
//!
//! Clients connect to `/ws/{session_id}`; the id is taken from the upgrade
//! request path. Each accepted socket is split: the read half stays with the
//! connection task, the write half is owned by a writer task draining the
//! session's bounded outbound queue.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use relaychat_core::{decode, encode, ChatError, ChatResult, Envelope};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, warn};

/// A serialized envelope queued for one connection. Shared across recipients.
pub type OutboundFrame = Arc<str>;

/// Path prefix clients connect under.
const SESSION_PATH_PREFIX: &str = "/ws/";

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
    /// Session id taken from the request path.
    pub session_id: String,
}

/// Bind the TCP listener.
pub async fn bind(addr: SocketAddr) -> ChatResult<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| ChatError::Transport(format!("WS bind failed on {addr}: {e}")))
}

/// Start accepting WebSocket connections on `tcp_listener`.
///
/// Returns a receiver that yields upgraded connections. Handshakes run on
/// their own tasks so a slow client never stalls the accept loop.
pub fn start_listener(tcp_listener: TcpListener) -> mpsc::Receiver<WebSocketConnection> {
    if let Ok(addr) = tcp_listener.local_addr() {
        info!(addr = %addr, "WebSocket listener started");
    }

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        if let Some(conn) = upgrade(stream, addr).await {
                            if tx.send(conn).await.is_err() {
                                warn!("WebSocket connection channel closed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
            if tx.is_closed() {
                debug!("connection receiver dropped, stopping accept loop");
                break;
            }
        }
    });

    rx
}

/// Perform the HTTP upgrade, capturing the session id from the path.
async fn upgrade(stream: TcpStream, addr: SocketAddr) -> Option<WebSocketConnection> {
    let mut session_id = None;
    let callback = |req: &Request, response: Response| {
        match parse_session_path(req.uri().path()) {
            Some(id) => {
                session_id = Some(id);
                Ok(response)
            }
            None => {
                let mut reject = ErrorResponse::new(Some(format!(
                    "expected {SESSION_PATH_PREFIX}{{session_id}}"
                )));
                *reject.status_mut() = StatusCode::NOT_FOUND;
                Err(reject)
            }
        }
    };

    let accepted = tokio_tungstenite::accept_hdr_async(stream, callback).await;
    match (accepted, session_id) {
        (Ok(ws_stream), Some(session_id)) => {
            debug!(remote = %addr, session_id = %session_id, "WebSocket connection accepted");
            Some(WebSocketConnection {
                ws_stream,
                remote_addr: addr,
                session_id,
            })
        }
        (Ok(_), None) => {
            warn!(remote = %addr, "WebSocket upgraded without a session id");
            None
        }
        (Err(e), _) => {
            warn!(remote = %addr, error = %e, "WebSocket handshake failed");
            None
        }
    }
}

/// Extract the session id from `/ws/{session_id}`.
///
/// The id must be non-empty and must not contain further path segments.
pub fn parse_session_path(path: &str) -> Option<String> {
    let id = path.strip_prefix(SESSION_PATH_PREFIX)?;
    if id.is_empty() || id.contains('/') {
        return None;
    }
    Some(id.to_string())
}

/// Spawn the writer task for one connection.
///
/// Drains `rx` into the socket until every sender is dropped or a write
/// fails, then closes the socket. Dropping `rx` on failure turns later
/// enqueues into delivery failures.
pub fn spawn_writer<S>(mut sink: S, mut rx: mpsc::Receiver<OutboundFrame>) -> JoinHandle<()>
where
    S: Sink<Message, Error = WsError> + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = sink.send(Message::Text(frame.to_string().into())).await {
                debug!(error = %e, "WebSocket write failed");
                return;
            }
        }
        let _ = sink.close().await;
    })
}

/// Wait up to `grace` for the writer to flush and close the socket.
///
/// A writer still stuck on a peer that stopped reading is aborted, which
/// drops the write half. Returns whether the writer finished on its own.
pub async fn finish_writer(mut writer: JoinHandle<()>, grace: Duration) -> bool {
    match tokio::time::timeout(grace, &mut writer).await {
        Ok(_) => true,
        Err(_) => {
            writer.abort();
            false
        }
    }
}

/// Encode and enqueue an envelope on a connection's own outbound queue.
pub async fn queue_envelope(
    tx: &mpsc::Sender<OutboundFrame>,
    envelope: &Envelope,
) -> ChatResult<()> {
    let frame: OutboundFrame = Arc::from(encode(envelope)?);
    tx.send(frame)
        .await
        .map_err(|_| ChatError::Transport("connection writer closed".into()))
}

/// Receive the next envelope from the read half of a WebSocket.
///
/// Returns `None` when the peer closes. Ping/pong frames are skipped.
/// Binary frames and undecodable text are protocol violations.
pub async fn recv_envelope<S>(stream: &mut S) -> ChatResult<Option<Envelope>>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => return decode(&text).map(Some),
            Some(Ok(Message::Binary(_))) => {
                return Err(ChatError::InvalidMessage(
                    "binary frames are not accepted".into(),
                ));
            }
            Some(Ok(Message::Close(_))) => return Ok(None),
            Some(Ok(_)) => {
                // Ping/pong are answered by tungstenite itself.
                continue;
            }
            Some(Err(e)) => {
                return Err(ChatError::Transport(format!("WS recv failed: {e}")));
            }
            None => return Ok(None),
        }
    }
}
