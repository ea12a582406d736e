//! Engine configuration.
//!
//! Everything the engine writes lives under a single root directory, so tests
//! and alternate installations only need to point `root` somewhere else.

use crate::constants::{CONTAINERS_DIR, DEFAULT_GRACE_PERIOD, ENGINE_DIR, IMAGES_DIR};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Environment variable overriding the engine root directory.
pub const ROOT_ENV: &str = "QNXTAINER_HOME";

/// Environment variable overriding the stop grace period, in seconds.
pub const GRACE_ENV: &str = "QNXTAINER_STOP_GRACE_SECS";

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root directory holding `images/` and `containers/`.
    pub root: PathBuf,
    /// Time between SIGTERM and SIGKILL when stopping a container.
    pub stop_grace_period: Duration,
}

impl EngineConfig {
    /// Creates a configuration rooted at `root` with default timeouts.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            stop_grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    /// Sets the stop grace period.
    #[must_use]
    pub fn stop_grace_period(mut self, grace: Duration) -> Self {
        self.stop_grace_period = grace;
        self
    }

    /// Builds a configuration from `QNXTAINER_HOME` and
    /// `QNXTAINER_STOP_GRACE_SECS`, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = match std::env::var_os(ROOT_ENV) {
            Some(root) if !root.is_empty() => Self::with_root(PathBuf::from(root)),
            _ => Self::default(),
        };

        if let Ok(raw) = std::env::var(GRACE_ENV) {
            match raw.trim().parse::<u64>() {
                Ok(secs) => config.stop_grace_period = Duration::from_secs(secs),
                Err(e) => warn!(value = %raw, error = %e, "ignoring invalid {}", GRACE_ENV),
            }
        }

        config
    }

    /// Returns the image directory root.
    pub fn images_dir(&self) -> PathBuf {
        self.root.join(IMAGES_DIR)
    }

    /// Returns the container workspace root.
    pub fn containers_dir(&self) -> PathBuf {
        self.root.join(CONTAINERS_DIR)
    }

    /// Returns the default root: `~/.qnxtainer`.
    pub fn default_root() -> PathBuf {
        if let Some(home) = dirs::home_dir() {
            home.join(ENGINE_DIR)
        } else {
            PathBuf::from(ENGINE_DIR)
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::with_root(Self::default_root())
    }
}
