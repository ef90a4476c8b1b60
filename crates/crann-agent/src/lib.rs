//! # crann-agent
//!
//! The client side of Crann. An [`Agent`] connects to one store by name,
//! mirrors its state locally, and calls the store's actions by name.
//!
//! Reads are served from the local copy and never block. Writes are applied
//! locally first and corrected by whatever the store sends back.

pub mod agent;
pub mod rpc;

pub use agent::{Agent, AgentStatus, DisconnectCallback, SnapshotCallback, StateCallback};
pub use rpc::ActionStub;
