//! Tool configuration, read from a TOML or JSON file.

use kvcli_storage::{DEFAULT_BUFFER_SIZE, MIN_BUFFER_SIZE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Which emulated driver backs device names.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// Devices are directories under `device_root`.
    #[default]
    Dir,
    /// A fresh in-memory device per run.
    Memory,
}

/// kvcli configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KvcliConfig {
    /// Device driver.
    pub driver: DriverKind,
    /// Parent directory of directory-backed devices.
    pub device_root: PathBuf,
    /// Transfer buffer size in bytes.
    pub buffer_size: usize,
    /// Log filter used when `RUST_LOG` is not set.
    pub log_filter: String,
}

impl Default for KvcliConfig {
    fn default() -> Self {
        Self {
            driver: DriverKind::Dir,
            device_root: PathBuf::from("/var/lib/kvcli"),
            buffer_size: DEFAULT_BUFFER_SIZE,
            log_filter: String::from("error"),
        }
    }
}

impl KvcliConfig {
    /// Reads a `.toml` or `.json` config file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: KvcliConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reads `path` if given, otherwise returns the defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::from_file(path)
                .map_err(|e| e.context(format!("Could not load config {}", path.display()))),
            None => Ok(Self::default()),
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.buffer_size < MIN_BUFFER_SIZE {
            anyhow::bail!(
                "buffer_size must be at least {} bytes, got {}",
                MIN_BUFFER_SIZE,
                self.buffer_size
            );
        }
        Ok(())
    }
}
