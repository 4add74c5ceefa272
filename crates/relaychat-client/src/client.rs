//! WebSocket chat client.

use crate::file::encode_file_content;
use futures_util::{SinkExt, StreamExt};
use relaychat_core::{decode, encode, AuthStatus, ChatError, ChatResult, Envelope};
use std::future::Future;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

/// Build the connection URL for `session_id` under `base_url`.
///
/// `ws://host:8000` + `abc` → `ws://host:8000/ws/abc`.
pub fn session_url(base_url: &str, session_id: &str) -> String {
    format!("{}/ws/{}", base_url.trim_end_matches('/'), session_id)
}

/// A connected relaychat client.
pub struct ChatClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    session_id: String,
    identity: Option<String>,
}

impl ChatClient {
    /// Open a connection for `session_id`.
    pub async fn connect(base_url: &str, session_id: &str) -> ChatResult<Self> {
        let url = session_url(base_url, session_id);
        let (ws, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| ChatError::Transport(format!("connect to {url} failed: {e}")))?;
        debug!(url = %url, "connected");
        Ok(Self {
            ws,
            session_id: session_id.to_string(),
            identity: None,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Identity granted by the server, once logged in.
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    /// Complete the login exchange.
    ///
    /// If the server grants the session outright, `token_source` is never
    /// called. On `login_required` it is awaited for a bearer token, which is
    /// sent as `auth_token`. Returns the identity granted by the server.
    pub async fn login<F, Fut>(&mut self, token_source: F) -> ChatResult<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ChatResult<String>>,
    {
        match self.recv_auth().await? {
            (AuthStatus::Success, Some(identity)) => return Ok(self.granted(identity)),
            (AuthStatus::LoginRequired, _) => {}
            (status, _) => {
                return Err(ChatError::AuthFailed(format!("server answered {status:?}")));
            }
        }

        let token = token_source().await?;
        self.send_token(&token).await?;

        match self.recv_auth().await? {
            (AuthStatus::Success, Some(identity)) => Ok(self.granted(identity)),
            (status, _) => Err(ChatError::AuthFailed(format!("server answered {status:?}"))),
        }
    }

    fn granted(&mut self, identity: String) -> String {
        info!(session_id = %self.session_id, identity = %identity, "logged in");
        self.identity = Some(identity.clone());
        identity
    }

    async fn recv_auth(&mut self) -> ChatResult<(AuthStatus, Option<String>)> {
        match self.recv().await? {
            Some(Envelope::AuthResult { status, identity }) => Ok((status, identity)),
            Some(Envelope::AuthRequest { status }) => Ok((status, None)),
            Some(other) => Err(ChatError::InvalidMessage(format!(
                "expected auth, got {}",
                other.kind()
            ))),
            None => Err(ChatError::Transport("connection closed during login".into())),
        }
    }

    /// Send any envelope.
    pub async fn send(&mut self, envelope: &Envelope) -> ChatResult<()> {
        let text = encode(envelope)?;
        self.ws
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| ChatError::Transport(format!("WS send failed: {e}")))
    }

    pub async fn send_token(&mut self, token: &str) -> ChatResult<()> {
        self.send(&Envelope::AuthToken {
            token: token.to_string(),
        })
        .await
    }

    pub async fn send_message(&mut self, content: &str) -> ChatResult<()> {
        self.send(&Envelope::message(content)).await
    }

    /// Send raw file bytes; they are base64-encoded into a `file` envelope.
    pub async fn send_file(&mut self, filename: &str, bytes: &[u8]) -> ChatResult<()> {
        self.send(&Envelope::file(filename, encode_file_content(bytes)))
            .await
    }

    /// Receive the next envelope. Returns `None` once the server closes.
    pub async fn recv(&mut self) -> ChatResult<Option<Envelope>> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => return decode(&text).map(Some),
                Some(Ok(Message::Binary(_))) => {
                    return Err(ChatError::InvalidMessage("unexpected binary frame".into()));
                }
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Err(ChatError::Transport(format!("WS recv failed: {e}")));
                }
            }
        }
    }

    /// Close the connection.
    pub async fn close(&mut self) -> ChatResult<()> {
        self.ws
            .close(None)
            .await
            .map_err(|e| ChatError::Transport(format!("WS close failed: {e}")))
    }
}
