use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crann_core::{Scope, StateItem, StoreConfig, StoreConfigBuilder, UnknownKeys};

/// Root configuration, as read from `crann.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CrannConfig {
    pub store: StoreSection,
    /// Declared state keys, one table per key.
    pub state: BTreeMap<String, StateItem>,
    pub storage: StorageConfig,
    pub transport: TransportConfig,
    pub logging: LoggingConfig,
}

// ── Store identity ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// Store name; drives the persisted key range and connection routing.
    pub name: String,
    /// Schema version. Bumping it orphans every previously persisted key.
    pub version: u32,
    /// What a write naming undeclared keys does.
    pub unknown_keys: UnknownKeys,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            name: "crann".into(),
            version: 1,
            unknown_keys: UnknownKeys::Ignore,
        }
    }
}

// ── Storage ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Durable tier in a SQLite file.
    Sqlite,
    /// Both tiers in memory; nothing survives the process.
    #[default]
    Memory,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Database file for the `sqlite` backend.
    pub path: Option<PathBuf>,
}

impl StorageConfig {
    /// The database file to open, or `None` when storage stays in memory.
    pub fn sqlite_path(&self) -> Option<&Path> {
        match self.backend {
            StorageBackend::Sqlite => self.path.as_deref(),
            StorageBackend::Memory => None,
        }
    }
}

// ── Transport ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Capacity of every in-process message channel.
    pub channel_buffer: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            channel_buffer: 256,
        }
    }
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Output format: "pretty", "json", "compact".
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

// ── Validation ─────────────────────────────────────────────────

/// A single config validation issue.
#[derive(Debug)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
    pub severity: WarningSeverity,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSeverity {
    Error,
    Warning,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self.severity {
            WarningSeverity::Error => "error",
            WarningSeverity::Warning => "warning",
        };
        write!(f, "{}: {}: {}", label, self.field, self.message)?;
        if let Some(ref h) = self.hint {
            write!(f, " ({})", h)?;
        }
        Ok(())
    }
}

impl CrannConfig {
    /// Parse a TOML document.
    pub fn from_toml(raw: &str) -> crann_core::Result<Self> {
        toml::from_str(raw).map_err(|e| crann_core::CrannError::Config(e.to_string()))
    }

    /// Validate the config and return a list of warnings.
    /// Returns `Err` with all messages joined if any severity is Error.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, String> {
        let mut warnings = Vec::new();

        // ── Store identity ───
        if let Err(e) = crann_core::config::validate_name(&self.store.name) {
            warnings.push(ConfigWarning {
                field: "store.name".into(),
                message: e.to_string(),
                severity: WarningSeverity::Error,
                hint: None,
            });
        }
        if self.store.version == 0 {
            warnings.push(ConfigWarning {
                field: "store.version".into(),
                message: "version must be a positive integer".into(),
                severity: WarningSeverity::Error,
                hint: Some("Versions start at 1".into()),
            });
        }

        // ── State items ───
        for (key, item) in &self.state {
            if item.scope == Scope::Agent && item.persist.is_persisted() {
                warnings.push(ConfigWarning {
                    field: format!("state.{}.persist", key),
                    message: "agent-scoped keys are never persisted".into(),
                    severity: WarningSeverity::Error,
                    hint: Some("Remove `persist` or make the key shared".into()),
                });
            }
        }

        // ── Storage ───
        if self.storage.backend == StorageBackend::Sqlite && self.storage.path.is_none() {
            warnings.push(ConfigWarning {
                field: "storage.path".into(),
                message: "sqlite backend needs a database path".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set storage.path or CRANN_STORAGE_PATH".into()),
            });
        }
        if self.storage.backend == StorageBackend::Memory && self.storage.path.is_some() {
            warnings.push(ConfigWarning {
                field: "storage.path".into(),
                message: "path is ignored by the memory backend".into(),
                severity: WarningSeverity::Warning,
                hint: None,
            });
        }

        // ── Transport ───
        if self.transport.channel_buffer == 0 {
            warnings.push(ConfigWarning {
                field: "transport.channel_buffer".into(),
                message: "channel buffer must be at least 1".into(),
                severity: WarningSeverity::Error,
                hint: None,
            });
        }

        // ── Logging format ───
        let valid_formats = ["pretty", "json", "compact"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.format".into(),
                message: format!("unknown log format '{}'", self.logging.format),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_formats.join(", "))),
            });
        }

        // ── Logging level ───
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.level".into(),
                message: format!("unknown log level '{}'", self.logging.level),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_levels.join(", "))),
            });
        }

        let errors: Vec<String> = warnings
            .iter()
            .filter(|w| w.severity == WarningSeverity::Error)
            .map(|w| format!("{}: {}", w.field, w.message))
            .collect();

        if !errors.is_empty() {
            return Err(format!("configuration errors: {}", errors.join("; ")));
        }

        Ok(warnings)
    }

    /// A store builder seeded with the identity and state items of this file.
    /// Add actions to it, then `build()`.
    pub fn store_builder(&self) -> StoreConfigBuilder {
        let builder = StoreConfig::builder(self.store.name.clone())
            .version(self.store.version)
            .unknown_keys(self.store.unknown_keys);
        self.state
            .iter()
            .fold(builder, |b, (key, item)| b.item(key.clone(), item.clone()))
    }
}
