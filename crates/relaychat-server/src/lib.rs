//! relaychat-server: authenticated WebSocket chat relay.
//!
//! Accepts WebSocket connections at `/ws/{session_id}`, gates each one
//! behind a token login (or the one-time bootstrap trust), and relays
//! chat messages and files from every authenticated session to all others.

pub mod auth;
pub mod config;
pub mod handshake;
pub mod relay;
pub mod server;
pub mod session;
pub mod transport;

pub use config::ServerConfig;
pub use server::ChatServer;
