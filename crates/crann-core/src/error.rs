use thiserror::Error;

/// Unified error type shared by the store, the agent and their collaborators.
#[derive(Error, Debug)]
pub enum CrannError {
    // ── Config errors ──────────────────────────────────────────
    #[error("config error: {0}")]
    Config(String),

    #[error("config validation failed: {field}: {reason}")]
    ConfigValidation { field: String, reason: String },

    // ── Lifecycle errors ───────────────────────────────────────
    #[error("{component} is {state}")]
    Lifecycle { component: String, state: String },

    // ── Action errors ──────────────────────────────────────────
    #[error("unknown action '{action}' on store '{store}'")]
    UnknownAction { action: String, store: String },

    #[error("validation failed for action '{action}': {reason}")]
    Validation { action: String, reason: String },

    #[error("action '{action}' failed in store '{store}': {message}")]
    Action {
        action: String,
        store: String,
        message: String,
    },

    /// An RPC failure as seen by the calling agent.
    #[error("remote action '{action}' failed: {message}")]
    Remote { action: String, message: String },

    // ── State errors ───────────────────────────────────────────
    #[error("unknown state keys: {}", keys.join(", "))]
    UnknownKeys { keys: Vec<String> },

    // ── Storage errors ─────────────────────────────────────────
    #[error("storage error: {0}")]
    Storage(String),

    #[error("storage collision: {0}")]
    StorageCollision(String),

    // ── Transport / connection errors ──────────────────────────
    #[error("transport error: {0}")]
    Transport(String),

    #[error("disconnected: {0}")]
    Disconnected(String),

    #[error("connection already registered: {0}")]
    DuplicateConnection(String),

    // ── Generic wrappers ───────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl CrannError {
    /// Build a lifecycle error for a component in a terminal state.
    pub fn lifecycle(component: impl Into<String>, state: impl Into<String>) -> Self {
        CrannError::Lifecycle {
            component: component.into(),
            state: state.into(),
        }
    }

    /// Whether this error came from a use-after-destroy / use-after-disconnect.
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, CrannError::Lifecycle { .. })
    }
}

pub type Result<T> = std::result::Result<T, CrannError>;
