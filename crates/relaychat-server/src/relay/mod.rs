//! Chat relay: session registry and message broker.

pub mod broker;
pub mod registry;

pub use broker::RelayBroker;
pub use registry::{BroadcastReport, SessionHandle, SessionRegistry};
