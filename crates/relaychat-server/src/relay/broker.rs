//! Relay broker: stamps chat traffic and fans it out to the other sessions.

use super::registry::{BroadcastReport, SessionHandle, SessionRegistry};
use relaychat_core::{utc_timestamp, ChatError, ChatResult, Envelope};
use std::sync::Arc;
use tracing::debug;

/// Routes envelopes from one authenticated session to all the others.
pub struct RelayBroker {
    registry: Arc<SessionRegistry>,
}

impl RelayBroker {
    /// Create a new relay broker backed by a session registry.
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Relay one inbound envelope from `from`.
    ///
    /// `message` and `file` envelopes are stamped with the sender's identity
    /// and the current UTC time, then broadcast to every other member. The
    /// file content is passed through untouched. Any other envelope is a
    /// protocol violation and nothing is sent.
    pub async fn relay(
        &self,
        from: &SessionHandle,
        envelope: Envelope,
    ) -> ChatResult<BroadcastReport> {
        let kind = envelope.kind();
        let stamped = envelope
            .stamped(&from.identity, utc_timestamp())
            .ok_or_else(|| {
                ChatError::InvalidMessage(format!("unexpected {kind} envelope after login"))
            })?;

        let report = self.registry.broadcast(&from.session_id, &stamped).await?;
        debug!(
            session_id = %from.session_id,
            kind,
            recipients = report.delivered,
            "relayed"
        );
        Ok(report)
    }
}
