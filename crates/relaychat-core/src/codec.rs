//! JSON text codec for relaychat envelopes.
//!
//! Wire format: one JSON object per WebSocket text frame.

use crate::error::{ChatError, ChatResult};
use crate::messages::Envelope;

/// Encode an envelope into a JSON text frame.
pub fn encode(envelope: &Envelope) -> ChatResult<String> {
    Ok(serde_json::to_string(envelope)?)
}

/// Decode a JSON text frame into an envelope.
///
/// Unknown `type` tags, missing required fields and non-JSON input are all
/// reported as [`ChatError::InvalidMessage`].
pub fn decode(text: &str) -> ChatResult<Envelope> {
    serde_json::from_str(text).map_err(|e| ChatError::InvalidMessage(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{AuthStatus, ChatMessage};

    #[test]
    fn decode_chat_message() {
        let env = decode(r#"{"type":"message","content":"hi"}"#).unwrap();
        assert_eq!(
            env,
            Envelope::ChatMessage(ChatMessage {
                content: "hi".into(),
                sender: None,
                timestamp: None,
            })
        );
    }

    #[test]
    fn decode_ignores_unknown_fields() {
        let env = decode(r#"{"type":"auth","status":"failed","extra":1}"#).unwrap();
        assert_eq!(
            env,
            Envelope::AuthResult {
                status: AuthStatus::Failed,
                identity: None,
            }
        );
    }

    #[test]
    fn unknown_tag_is_protocol_violation() {
        let err = decode(r#"{"type":"typing","content":"..."}"#).unwrap_err();
        assert!(matches!(err, ChatError::InvalidMessage(_)));
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn missing_field_is_protocol_violation() {
        let err = decode(r#"{"type":"file","filename":"a.png"}"#).unwrap_err();
        assert!(matches!(err, ChatError::InvalidMessage(_)));
    }

    #[test]
    fn missing_tag_is_protocol_violation() {
        assert!(decode(r#"{"content":"hi"}"#).is_err());
        assert!(decode("not json").is_err());
    }

    #[test]
    fn encode_file_envelope() {
        let text = encode(&Envelope::file("s.png", "iVBORw0K")).unwrap();
        let back: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(back["type"], "file");
        assert_eq!(back["filename"], "s.png");
        assert_eq!(back["content"], "iVBORw0K");
    }
}
