//! relaychat-client: client library for the relaychat server.
//!
//! The presentation layer drives a [`ChatClient`]: connect with a session id,
//! answer the login challenge, then send and receive chat envelopes.

pub mod client;
pub mod file;

pub use client::{session_url, ChatClient};
pub use file::{decode_file_content, encode_file_content};
