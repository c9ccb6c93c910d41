use color_eyre::Result;
use color_eyre::eyre::{WrapErr, eyre};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Inactivity budget before the session locks (in milliseconds)
    pub inactivity_timeout_ms: u64,

    /// Minimum spacing between accepted activity pulses (in milliseconds)
    pub activity_debounce_ms: u64,

    /// Minimum spacing between server activity heartbeats (in milliseconds)
    pub heartbeat_interval_ms: u64,

    /// How often the PIN status is polled while no PIN is configured (in milliseconds)
    pub pin_poll_interval_ms: u64,

    /// Shortest accepted PIN
    pub min_pin_length: usize,

    /// Longest accepted PIN
    pub max_pin_length: usize,

    /// Where the last-activity timestamp is persisted
    pub store_path: PathBuf,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_ms: 5 * 60 * 1000, // 5 minutes
            activity_debounce_ms: 1000,
            heartbeat_interval_ms: 60 * 1000,
            pin_poll_interval_ms: 2000,
            min_pin_length: 4,
            max_pin_length: 6,
            store_path: default_data_dir().join("activity.json"),
        }
    }
}

impl GuardConfig {
    /// Loads a configuration from a JSON file, or the defaults if the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed, or if the
    /// resulting configuration fails [`GuardConfig::validate`].
    pub fn load(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content =
                std::fs::read_to_string(path).wrap_err_with(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&content).wrap_err("Failed to parse guard configuration")?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Writes the configuration as pretty-printed JSON, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the timeout or poll interval is zero, or the PIN length
    /// bounds are empty or inverted.
    pub fn validate(&self) -> Result<()> {
        if self.inactivity_timeout_ms == 0 {
            return Err(eyre!("inactivity_timeout_ms must be greater than zero"));
        }
        if self.pin_poll_interval_ms == 0 {
            return Err(eyre!("pin_poll_interval_ms must be greater than zero"));
        }
        if self.min_pin_length == 0 || self.min_pin_length > self.max_pin_length {
            return Err(eyre!(
                "invalid PIN length bounds {}..={}",
                self.min_pin_length,
                self.max_pin_length
            ));
        }
        Ok(())
    }

    #[must_use]
    pub const fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout_ms)
    }

    #[must_use]
    pub const fn activity_debounce(&self) -> Duration {
        Duration::from_millis(self.activity_debounce_ms)
    }

    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    #[must_use]
    pub const fn pin_poll_interval(&self) -> Duration {
        Duration::from_millis(self.pin_poll_interval_ms)
    }
}

/// `~/.config/idlelock` on Linux, the platform equivalent elsewhere.
#[must_use]
pub fn default_data_dir() -> PathBuf {
    dirs::config_dir().unwrap_or_else(|| PathBuf::from(".")).join("idlelock")
}

#[must_use]
pub fn default_config_path() -> PathBuf {
    default_data_dir().join("config.json")
}
