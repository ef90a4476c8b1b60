//! # crann-storage
//!
//! The key-value collaborator Crann persists shared state into:
//!
//! - **Durable tier**: survives restart (SQLite file).
//! - **Session tier**: lives as long as the process (in memory).
//!
//! Both implement [`KvArea`], so tests can swap in any area they like.

pub mod area;
pub mod memory;
pub mod sqlite;
pub mod tiers;

pub use area::{KvArea, KvMap};
pub use memory::MemoryArea;
pub use sqlite::SqliteArea;
pub use tiers::{DURABLE_AREA, SESSION_AREA, StorageTiers};
