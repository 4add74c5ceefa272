//! Base64 helpers for `file` envelopes.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use relaychat_core::{ChatError, ChatFile, ChatResult};

/// Encode raw file bytes for a `file` envelope.
pub fn encode_file_content(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode the content of a received `file` envelope.
pub fn decode_file_content(file: &ChatFile) -> ChatResult<Vec<u8>> {
    STANDARD
        .decode(file.content.as_bytes())
        .map_err(|e| {
            ChatError::InvalidMessage(format!("file {:?}: bad base64: {e}", file.filename))
        })
}
