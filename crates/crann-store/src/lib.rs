//! # crann-store
//!
//! The authoritative side of Crann. A [`Store`] owns shared state and
//! every connection's scoped state, persists flagged keys, runs remote
//! actions and tells agents what changed.
//!
//! The pieces are usable on their own:
//! - [`StateManager`]: canonical state and change sets.
//! - [`Persistence`]: the `crann:{name}:v{version}:{key}` key layout.
//! - [`ConnectionRegistry`]: who is connected.
//! - [`ActionExecutor`]: validation and execution of named actions.

pub mod executor;
pub mod persistence;
pub mod registry;
pub mod state;
pub mod store;

pub use executor::ActionExecutor;
pub use persistence::{Persistence, StoreMeta, StoreNameClaims, meta_key, value_key};
pub use registry::ConnectionRegistry;
pub use state::{ClearOutcome, StateManager};
pub use store::{DestroyOptions, Store, StoreStatus};
