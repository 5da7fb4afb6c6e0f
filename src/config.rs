use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::store::{DatabaseOptions, GcPolicy};

/// Environment variable that points tally at a different data directory.
pub const DATA_ENV: &str = "TALLYDATA";

fn default_data_location() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("~/.local/share"))
        .join("tally")
}

pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("~/.config"))
        .join("tally")
        .join("config.json")
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct TallyConfig {
    pub data_location: PathBuf,
    pub locking: bool,
    pub lock_timeout_ms: u64,
    pub gc: bool,
    pub gc_policy: GcPolicy,
    pub debug_logging: bool,
}

impl Default for TallyConfig {
    fn default() -> Self {
        Self {
            data_location: default_data_location(),
            locking: true,
            lock_timeout_ms: 10_000,
            gc: true,
            gc_policy: GcPolicy::Archive,
            debug_logging: false,
        }
    }
}

impl TallyConfig {
    /// Read the user's config file, then apply `TALLYDATA`.
    pub fn load() -> Self {
        let mut config = Self::load_from(&config_path());
        config.override_data_location(std::env::var_os(DATA_ENV).map(PathBuf::from));
        config
    }

    /// A missing file means defaults; so does a broken one, with a warning.
    pub fn load_from(path: &Path) -> Self {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                log::warn!("Failed to read {}: {}", path.display(), e);
                return Self::default();
            }
        };
        match serde_json::from_str(&content) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("Ignoring invalid config {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn save_to(&self, path: &Path) -> crate::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn override_data_location(&mut self, location: Option<PathBuf>) {
        if let Some(location) = location.filter(|l| !l.as_os_str().is_empty()) {
            log::debug!("Data location overridden to {}", location.display());
            self.data_location = location;
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Ensure the data directory exists.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_location)
    }

    pub fn database_options(&self) -> DatabaseOptions {
        DatabaseOptions {
            location: self.data_location.clone(),
            locking: self.locking,
            lock_timeout: self.lock_timeout(),
            gc: self.gc,
            gc_policy: self.gc_policy,
        }
    }
}
