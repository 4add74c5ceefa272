//! Registry of authenticated sessions.
//!
//! The membership map is the only shared mutable state in the server. Every
//! admit/remove takes the write lock; broadcast takes the read lock just long
//! enough to snapshot the recipients and then enqueues outside of it, so a slow
//! recipient never holds up admissions or removals.

use crate::transport::websocket::OutboundFrame;
use futures_util::future::join_all;
use relaychat_core::{encode, ChatError, ChatResult, Envelope};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{debug, info, warn};

/// Handle to one admitted session: its identity, outbound queue and close signal.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    /// Caller-chosen session id (unique among members).
    pub session_id: String,
    /// Display identity stamped on everything this session sends.
    pub identity: String,
    /// Server-assigned connection number, unique for the process lifetime.
    pub conn_id: u64,
    tx: mpsc::Sender<OutboundFrame>,
    close: Arc<Notify>,
}

impl SessionHandle {
    pub fn new(
        session_id: impl Into<String>,
        identity: impl Into<String>,
        conn_id: u64,
        tx: mpsc::Sender<OutboundFrame>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            identity: identity.into(),
            conn_id,
            tx,
            close: Arc::new(Notify::new()),
        }
    }

    /// Ask the owning connection to shut down.
    pub fn close(&self) {
        self.close.notify_one();
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        self.close.notified().await;
    }

    /// Enqueue one frame, waiting at most `timeout` for queue space.
    async fn deliver(&self, frame: OutboundFrame, timeout: Duration) -> ChatResult<()> {
        match tokio::time::timeout(timeout, self.tx.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ChatError::Delivery(format!(
                "session {} connection closed",
                self.session_id
            ))),
            Err(_) => Err(ChatError::Delivery(format!(
                "session {} outbound queue stalled",
                self.session_id
            ))),
        }
    }
}

/// Outcome of one broadcast.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Recipients whose queue accepted the frame.
    pub delivered: usize,
    /// Recipients removed because delivery failed.
    pub removed: Vec<String>,
}

struct Members {
    sessions: HashMap<String, SessionHandle>,
    /// Sessions ever admitted. Never decremented.
    ever_admitted: u64,
}

/// Concurrent-safe set of authenticated sessions.
pub struct SessionRegistry {
    members: RwLock<Members>,
    allow_bootstrap: bool,
    send_timeout: Duration,
    next_conn_id: AtomicU64,
}

impl SessionRegistry {
    /// Create an empty registry.
    ///
    /// `send_timeout` bounds each per-recipient enqueue during broadcast.
    pub fn new(allow_bootstrap: bool, send_timeout: Duration) -> Self {
        Self {
            members: RwLock::new(Members {
                sessions: HashMap::new(),
                ever_admitted: 0,
            }),
            allow_bootstrap,
            send_timeout,
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Allocate a connection number.
    pub fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Whether the next admitted session would be the bootstrap session.
    ///
    /// True until the first admission ever, false forever after.
    pub async fn next_is_bootstrap(&self) -> bool {
        self.allow_bootstrap && self.members.read().await.ever_admitted == 0
    }

    /// Admit `handle` as the bootstrap session if the slot is still free.
    ///
    /// Check and insert happen under one write lock. Returns `Ok(false)`
    /// without admitting when the slot is taken or bootstrap is disabled.
    /// On success the `auth{success}` frame is already queued, as with
    /// [`admit`](Self::admit).
    pub async fn admit_bootstrap(&self, handle: SessionHandle) -> ChatResult<bool> {
        if !self.allow_bootstrap {
            return Ok(false);
        }
        let mut members = self.members.write().await;
        if members.ever_admitted > 0 {
            return Ok(false);
        }
        Self::insert(&mut members, handle)?;
        Ok(true)
    }

    /// Admit an authenticated session. Fails if the id is already a member.
    ///
    /// The session's `auth{success}` frame is queued before the insert, under
    /// the same write lock, so no broadcast can reach the session ahead of it.
    pub async fn admit(&self, handle: SessionHandle) -> ChatResult<()> {
        let mut members = self.members.write().await;
        Self::insert(&mut members, handle)
    }

    fn insert(members: &mut Members, handle: SessionHandle) -> ChatResult<()> {
        if members.sessions.contains_key(&handle.session_id) {
            warn!(session_id = %handle.session_id, "rejected duplicate session id");
            return Err(ChatError::DuplicateSession(handle.session_id));
        }
        let greeting: OutboundFrame = Arc::from(encode(&Envelope::auth_success(
            handle.identity.clone(),
        ))?);
        handle.tx.try_send(greeting).map_err(|e| {
            ChatError::Delivery(format!(
                "session {}: cannot queue auth result: {e}",
                handle.session_id
            ))
        })?;
        info!(
            session_id = %handle.session_id,
            identity = %handle.identity,
            conn_id = handle.conn_id,
            "session admitted"
        );
        members.ever_admitted += 1;
        members.sessions.insert(handle.session_id.clone(), handle);
        Ok(())
    }

    /// Remove a session by id and signal its connection to close. No-op if absent.
    pub async fn remove(&self, session_id: &str) {
        let removed = self.members.write().await.sessions.remove(session_id);
        if let Some(handle) = removed {
            handle.close();
            debug!(session_id, conn_id = handle.conn_id, "session removed");
        }
    }

    /// Remove `handle` only if it is still the member registered under its id.
    ///
    /// Used by a connection tearing itself down, so a stale connection never
    /// evicts a newer session that reused the id.
    pub async fn release(&self, handle: &SessionHandle) -> bool {
        let mut members = self.members.write().await;
        let owned = members
            .sessions
            .get(&handle.session_id)
            .is_some_and(|h| h.conn_id == handle.conn_id);
        if owned {
            members.sessions.remove(&handle.session_id);
            drop(members);
            handle.close();
            debug!(session_id = %handle.session_id, conn_id = handle.conn_id, "session released");
        }
        owned
    }

    /// Deliver `envelope` to every member except `excluding`.
    ///
    /// The envelope is serialized once. Deliveries run concurrently, each
    /// bounded by the send timeout; a failed recipient is removed and closed
    /// without affecting the others.
    pub async fn broadcast(
        &self,
        excluding: &str,
        envelope: &Envelope,
    ) -> ChatResult<BroadcastReport> {
        let frame: OutboundFrame = Arc::from(encode(envelope)?);

        let recipients: Vec<SessionHandle> = {
            let members = self.members.read().await;
            members
                .sessions
                .values()
                .filter(|h| h.session_id != excluding)
                .cloned()
                .collect()
        };

        let timeout = self.send_timeout;
        let outcomes = join_all(recipients.iter().map(|h| {
            let frame = Arc::clone(&frame);
            async move { h.deliver(frame, timeout).await }
        }))
        .await;

        let mut report = BroadcastReport::default();
        for (handle, outcome) in recipients.iter().zip(outcomes) {
            match outcome {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(
                        session_id = %handle.session_id,
                        error = %e,
                        "delivery failed, removing recipient"
                    );
                    if self.release(handle).await {
                        report.removed.push(handle.session_id.clone());
                    }
                }
            }
        }

        debug!(
            kind = envelope.kind(),
            from = excluding,
            delivered = report.delivered,
            removed = report.removed.len(),
            "broadcast"
        );
        Ok(report)
    }

    /// Whether `session_id` is currently a member.
    pub async fn contains(&self, session_id: &str) -> bool {
        self.members.read().await.sessions.contains_key(session_id)
    }

    /// Number of current members.
    pub async fn len(&self) -> usize {
        self.members.read().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of sessions ever admitted.
    pub async fn ever_admitted(&self) -> u64 {
        self.members.read().await.ever_admitted
    }

    /// Close every member and clear the map (server shutdown).
    pub async fn close_all(&self) {
        let drained: Vec<SessionHandle> = {
            let mut members = self.members.write().await;
            members.sessions.drain().map(|(_, h)| h).collect()
        };
        for handle in &drained {
            handle.close();
        }
        if !drained.is_empty() {
            info!(count = drained.len(), "closed all sessions");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaychat_core::decode;
    use std::time::Instant;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(true, Duration::from_millis(100))
    }

    fn session(
        reg: &SessionRegistry,
        id: &str,
        identity: &str,
        capacity: usize,
    ) -> (SessionHandle, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (SessionHandle::new(id, identity, reg.next_conn_id(), tx), rx)
    }

    /// Admit a session and consume its `auth{success}` frame.
    async fn admitted(
        reg: &SessionRegistry,
        id: &str,
        identity: &str,
        capacity: usize,
    ) -> (SessionHandle, mpsc::Receiver<OutboundFrame>) {
        let (handle, mut rx) = session(reg, id, identity, capacity);
        reg.admit(handle.clone()).await.unwrap();
        let greeting = rx.try_recv().unwrap();
        assert_eq!(decode(&greeting).unwrap(), Envelope::auth_success(identity));
        (handle, rx)
    }

    #[tokio::test]
    async fn duplicate_id_rejected_without_eviction() {
        let reg = registry();
        let (a, _rx_a) = session(&reg, "x", "a@example.com", 4);
        let (b, _rx_b) = session(&reg, "x", "b@example.com", 4);

        reg.admit(a.clone()).await.unwrap();
        let err = reg.admit(b).await.unwrap_err();
        assert!(matches!(err, ChatError::DuplicateSession(ref id) if id == "x"));
        assert!(reg.contains("x").await);
        assert_eq!(reg.len().await, 1);
        assert_eq!(reg.ever_admitted().await, 1);
    }

    #[tokio::test]
    async fn bootstrap_only_once_even_after_disconnect() {
        let reg = registry();
        assert!(reg.next_is_bootstrap().await);

        let (first, _rx1) = session(&reg, "first", "first_user", 4);
        assert!(reg.admit_bootstrap(first).await.unwrap());
        assert!(!reg.next_is_bootstrap().await);

        reg.remove("first").await;
        assert!(reg.is_empty().await);
        assert!(!reg.next_is_bootstrap().await);

        let (second, _rx2) = session(&reg, "second", "first_user", 4);
        assert!(!reg.admit_bootstrap(second).await.unwrap());
        assert!(!reg.contains("second").await);
    }

    #[tokio::test]
    async fn token_admission_consumes_bootstrap_slot() {
        let reg = registry();
        let (y, _rx) = session(&reg, "y", "y@example.com", 4);
        reg.admit(y).await.unwrap();
        assert!(!reg.next_is_bootstrap().await);
    }

    #[tokio::test]
    async fn bootstrap_disabled() {
        let reg = SessionRegistry::new(false, Duration::from_millis(100));
        assert!(!reg.next_is_bootstrap().await);
        let (first, _rx) = session(&reg, "first", "first_user", 4);
        assert!(!reg.admit_bootstrap(first).await.unwrap());
        assert!(reg.is_empty().await);
    }

    #[tokio::test]
    async fn concurrent_bootstrap_claims_single_winner() {
        let reg = Arc::new(registry());
        let mut tasks = Vec::new();
        let mut receivers = Vec::new();
        for i in 0..32 {
            let (h, rx) = session(&reg, &format!("s{i}"), "first_user", 1);
            receivers.push(rx);
            let reg = reg.clone();
            tasks.push(tokio::spawn(async move { reg.admit_bootstrap(h).await.unwrap() }));
        }
        let mut winners = 0;
        for t in tasks {
            if t.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(reg.len().await, 1);
    }

    #[tokio::test]
    async fn admission_queues_auth_result_first() {
        let reg = registry();
        let (_a, _rx_a) = admitted(&reg, "a", "a@example.com", 4).await;
        let (b, mut rx_b) = session(&reg, "b", "b@example.com", 4);
        reg.admit(b).await.unwrap();
        reg.broadcast("a", &Envelope::message("early")).await.unwrap();

        assert_eq!(
            decode(&rx_b.try_recv().unwrap()).unwrap(),
            Envelope::auth_success("b@example.com")
        );
        assert_eq!(
            decode(&rx_b.try_recv().unwrap()).unwrap(),
            Envelope::message("early")
        );
    }

    #[tokio::test]
    async fn admission_fails_when_queue_closed() {
        let reg = registry();
        let (a, rx_a) = session(&reg, "a", "a@example.com", 4);
        drop(rx_a);
        let err = reg.admit(a).await.unwrap_err();
        assert!(matches!(err, ChatError::Delivery(_)));
        assert!(reg.is_empty().await);
        assert_eq!(reg.ever_admitted().await, 0);
    }

    #[tokio::test]
    async fn broadcast_skips_sender() {
        let reg = registry();
        let (_a, mut rx_a) = admitted(&reg, "a", "a@example.com", 4).await;
        let (_b, mut rx_b) = admitted(&reg, "b", "b@example.com", 4).await;
        let (_c, mut rx_c) = admitted(&reg, "c", "c@example.com", 4).await;

        let report = reg.broadcast("a", &Envelope::message("hi")).await.unwrap();
        assert_eq!(report.delivered, 2);
        assert!(report.removed.is_empty());

        for rx in [&mut rx_b, &mut rx_c] {
            let frame = rx.try_recv().unwrap();
            assert_eq!(decode(&frame).unwrap(), Envelope::message("hi"));
        }
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn stalled_recipient_does_not_block_others() {
        let reg = registry();
        // Capacity 1: the undrained auth result fills the queue.
        let (stalled, _rx_stalled) = session(&reg, "stalled", "s@example.com", 1);
        reg.admit(stalled.clone()).await.unwrap();
        let (_fast, mut rx_fast) = admitted(&reg, "fast", "f@example.com", 4).await;
        let (_sender, _rx_sender) = admitted(&reg, "sender", "x@example.com", 4).await;

        let started = Instant::now();
        let report = reg
            .broadcast("sender", &Envelope::message("ping"))
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(report.delivered, 1);
        assert_eq!(report.removed, vec!["stalled".to_string()]);
        assert!(rx_fast.try_recv().is_ok());
        assert!(!reg.contains("stalled").await);

        // Removal fires the close signal.
        tokio::time::timeout(Duration::from_secs(1), stalled.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn closed_recipient_removed() {
        let reg = registry();
        let (_gone, rx_gone) = admitted(&reg, "gone", "g@example.com", 4).await;
        let (_live, mut rx_live) = admitted(&reg, "live", "l@example.com", 4).await;
        drop(rx_gone);

        let report = reg.broadcast("nobody", &Envelope::message("m")).await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(report.removed, vec!["gone".to_string()]);
        assert!(rx_live.try_recv().is_ok());
        assert_eq!(reg.len().await, 1);
    }

    #[tokio::test]
    async fn per_sender_order_preserved() {
        let reg = registry();
        let (_a, _rx_a) = admitted(&reg, "a", "a@example.com", 16).await;
        let (_b, mut rx_b) = admitted(&reg, "b", "b@example.com", 16).await;

        for i in 0..10 {
            reg.broadcast("a", &Envelope::message(i.to_string()))
                .await
                .unwrap();
        }
        for i in 0..10 {
            let frame = rx_b.recv().await.unwrap();
            assert_eq!(decode(&frame).unwrap(), Envelope::message(i.to_string()));
        }
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let reg = registry();
        let (a, _rx) = session(&reg, "a", "a@example.com", 4);
        reg.admit(a).await.unwrap();
        reg.remove("a").await;
        reg.remove("a").await;
        reg.remove("never").await;
        assert!(reg.is_empty().await);
    }

    #[tokio::test]
    async fn stale_release_keeps_newer_session() {
        let reg = registry();
        let (old, _rx_old) = session(&reg, "x", "old@example.com", 4);
        reg.admit(old.clone()).await.unwrap();
        reg.remove("x").await;

        let (new, _rx_new) = session(&reg, "x", "new@example.com", 4);
        reg.admit(new.clone()).await.unwrap();

        assert!(!reg.release(&old).await);
        assert!(reg.contains("x").await);
        assert!(reg.release(&new).await);
        assert!(!reg.contains("x").await);
    }

    #[tokio::test]
    async fn close_all_signals_members() {
        let reg = registry();
        let (a, _rx) = session(&reg, "a", "a@example.com", 4);
        reg.admit(a.clone()).await.unwrap();
        reg.close_all().await;
        assert!(reg.is_empty().await);
        tokio::time::timeout(Duration::from_secs(1), a.closed())
            .await
            .unwrap();
    }
}
