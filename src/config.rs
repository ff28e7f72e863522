use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::proctree::DEFAULT_PROC_ROOT;

/// Top-level configuration, optionally loaded from a TOML file.
///
/// The idle timeout and attempt count come from the command line; the file
/// only tunes how stalls are handled.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct WatchdogConfig {
    pub escalation: EscalationConfig,
    pub output: OutputConfig,
    pub proc: ProcConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    /// How long the tree gets to exit after SIGINT before SIGKILL.
    pub grace_period_secs: u64,
    pub poll_interval_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub read_buffer_bytes: usize,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ProcConfig {
    pub root: PathBuf,
}

impl EscalationConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

// --- Default implementations ---

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: 10,
            poll_interval_secs: 2,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            read_buffer_bytes: 4096,
        }
    }
}

impl Default for ProcConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_PROC_ROOT),
        }
    }
}

/// Load config from `path`, or defaults.
///
/// A missing file is not an error. An unreadable or malformed one is
/// reported and ignored: a broken config must not stop the build.
pub fn load_config(path: &Path) -> WatchdogConfig {
    match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("failed to parse {}: {e}", path.display());
                WatchdogConfig::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            WatchdogConfig::default()
        }
        Err(e) => {
            tracing::warn!("failed to read {}: {e}", path.display());
            WatchdogConfig::default()
        }
    }
}
