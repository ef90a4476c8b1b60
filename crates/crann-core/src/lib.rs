//! # crann-core
//!
//! Shared vocabulary for Crann: one authoritative store, many agents, state
//! replicated over an asynchronous message channel.
//! This crate defines the config schema, the wire protocol, action
//! definitions and the error taxonomy used by every other crate.

pub mod action;
pub mod config;
pub mod error;
pub mod listener;
pub mod protocol;
pub mod types;

pub use action::{ActionContext, ActionDef, ActionHandler, ActionValidator, StateWriter};
pub use config::{Persist, Scope, StateItem, StoreConfig, StoreConfigBuilder, UnknownKeys};
pub use error::{CrannError, Result};
pub use listener::ListenerSet;
pub use protocol::{CallId, Envelope, RpcResponse};
pub use types::*;
