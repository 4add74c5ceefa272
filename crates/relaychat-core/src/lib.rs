//! relaychat-core: Shared protocol library for relaychat.
//!
//! Provides the wire envelope types, the JSON text codec, the error taxonomy
//! shared by server and client, and UTC timestamping for relayed messages.

pub mod codec;
pub mod error;
pub mod messages;

// Re-export commonly used items at crate root.
pub use codec::{decode, encode};
pub use error::{ChatError, ChatResult};
pub use messages::{utc_timestamp, AuthStatus, ChatFile, ChatMessage, Envelope};
