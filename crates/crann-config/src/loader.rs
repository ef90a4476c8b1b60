use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::schema::{CrannConfig, StorageBackend};

/// Loads the Crann configuration once. Store identity is fixed for the
/// life of a store, so there is no reload.
pub struct ConfigLoader {
    config: CrannConfig,
    config_path: PathBuf,
}

impl ConfigLoader {
    /// Resolve the config path: explicit path > CRANN_CONFIG env > ~/.crann/crann.toml
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        Self::locate(explicit).0
    }

    /// The resolved path and whether someone asked for it by name.
    fn locate(explicit: Option<&Path>) -> (PathBuf, bool) {
        if let Some(p) = explicit {
            return (p.to_path_buf(), true);
        }
        if let Ok(p) = std::env::var("CRANN_CONFIG") {
            return (PathBuf::from(p), true);
        }
        let default = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".crann")
            .join("crann.toml");
        (default, false)
    }

    /// Load the config from disk. A missing default file yields defaults;
    /// a missing file that was named explicitly is an error.
    pub fn load(path: Option<&Path>) -> crann_core::Result<Self> {
        let (config_path, explicit) = Self::locate(path);
        let config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            let raw = std::fs::read_to_string(&config_path)?;
            toml::from_str::<CrannConfig>(&raw).map_err(|e| {
                crann_core::CrannError::Config(format!(
                    "failed to parse {}: {}",
                    config_path.display(),
                    e
                ))
            })?
        } else if explicit {
            return Err(crann_core::CrannError::Config(format!(
                "config file not found: {}",
                config_path.display()
            )));
        } else {
            warn!(?config_path, "config file not found, using defaults");
            CrannConfig::default()
        };

        let config = Self::apply_overrides(config, |name| std::env::var(name).ok());

        match config.validate() {
            Ok(warnings) => {
                for w in &warnings {
                    warn!("{}", w);
                }
            }
            Err(e) => {
                return Err(crann_core::CrannError::Config(e));
            }
        }

        Ok(Self {
            config,
            config_path,
        })
    }

    /// Get a copy of the loaded config.
    pub fn get(&self) -> CrannConfig {
        self.config.clone()
    }

    /// Path the config was resolved to (it may not exist).
    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Apply CRANN_LOG_LEVEL and CRANN_STORAGE_PATH, read through `lookup`.
    /// A storage path override also selects the sqlite backend.
    pub fn apply_overrides(
        mut config: CrannConfig,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> CrannConfig {
        if let Some(v) = lookup("CRANN_LOG_LEVEL") {
            config.logging.level = v;
        }
        if let Some(v) = lookup("CRANN_STORAGE_PATH") {
            config.storage.backend = StorageBackend::Sqlite;
            config.storage.path = Some(PathBuf::from(v));
        }
        config
    }
}
