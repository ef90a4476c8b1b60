//! # crann-transport
//!
//! The message channel between one store and its agents.
//!
//! [`link`] defines what the store and agent need from a transport:
//! addressed posting, lifecycle events and (store side) agent lookup.
//! [`local`] implements it in-process on tokio channels, including
//! interrupt/resume so reconnects can be exercised without a real socket.

pub mod link;
pub mod local;

pub use link::{
    AgentConnector, AgentEvent, AgentLink, AgentSender, StoreConnector, StoreEvent, StoreLink,
    StoreSender,
};
pub use local::LocalHub;
