//! fleetd.toml configuration parser.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use fleetset_controller::ControllerConfig;

/// Log filter used when neither `RUST_LOG` nor `[logging] filter` is set.
pub const DEFAULT_LOG_FILTER: &str = "info,fleetd=debug,fleetset=debug";

/// Default data directory for the store and manifests.
pub const DEFAULT_DATA_DIR: &str = "/var/lib/fleetset";

/// Name of the redb file inside the data directory.
pub const STORE_FILE: &str = "fleetset.redb";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub store: StoreConfig,
    pub controller: ControllerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: Path::new(DEFAULT_DATA_DIR).join(STORE_FILE),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directives; `RUST_LOG` takes precedence.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl DaemonConfig {
    /// Parse a fleetd.toml file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DaemonConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load from `path` if given, otherwise use defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    /// Point the store at `<data_dir>/fleetset.redb`.
    pub fn with_data_dir(mut self, data_dir: &Path) -> Self {
        self.store.path = data_dir.join(STORE_FILE);
        self
    }

    pub fn log_filter(&self) -> &str {
        self.logging.filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
