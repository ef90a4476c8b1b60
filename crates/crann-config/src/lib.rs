//! # crann-config
//!
//! File configuration for Crann. Reads `crann.toml`, then applies
//! environment variable overrides, in that precedence order.
//!
//! The file describes store identity, state items, storage, transport and
//! logging. Remote actions are code, so they are added to the builder
//! returned by [`CrannConfig::store_builder`].

pub mod loader;
pub mod logging;
pub mod schema;

pub use loader::ConfigLoader;
pub use logging::init_tracing;
pub use schema::CrannConfig;
pub use schema::{
    ConfigWarning, LoggingConfig, StorageBackend, StorageConfig, StoreSection, TransportConfig,
    WarningSeverity,
};
