//! Container records and lifecycle states.
//!
//! ```text
//!   ┌──────────┐   start   ┌─────────┐   stop   ┌─────────┐
//!   │ Prepared │ ────────► │ Running │ ───────► │ Stopped │
//!   └──────────┘           └─────────┘          └─────────┘
//!        │                                           ▲
//!        └──────────────────── stop ─────────────────┘
//! ```
//!
//! `Stopped` is terminal: the workspace is gone and a new container has to be
//! prepared from the image. Each [`ContainerState`] variant carries exactly
//! the fields that are valid in that state, so a stopped container cannot
//! hold a workspace path and a prepared one cannot hold a pid.

use crate::constants::{BYTES_PER_MEGABYTE, MAX_CPU_SECONDS, MAX_MEMORY_MEGABYTES};
use crate::error::{Error, Result};
use crate::image::Image;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

// =============================================================================
// Container Status
// =============================================================================

/// Externally visible container status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Workspace prepared, no process yet.
    Prepared,
    /// Process spawned.
    Running,
    /// Process reaped and workspace removed.
    Stopped,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Prepared => write!(f, "prepared"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// State-specific container data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerState {
    /// Workspace exists, nothing spawned.
    Prepared {
        /// Container workspace (`<root>/containers/<id>`).
        workspace: PathBuf,
    },
    /// Process spawned; its handle lives in the lifecycle manager.
    Running {
        /// Container workspace.
        workspace: PathBuf,
        /// Process id, also the process group id.
        pid: u32,
        /// When the process was spawned.
        started_at: DateTime<Utc>,
    },
    /// Terminal.
    Stopped {
        /// When the container was stopped.
        stopped_at: DateTime<Utc>,
    },
}

impl ContainerState {
    /// Returns the status tag.
    pub fn status(&self) -> ContainerStatus {
        match self {
            Self::Prepared { .. } => ContainerStatus::Prepared,
            Self::Running { .. } => ContainerStatus::Running,
            Self::Stopped { .. } => ContainerStatus::Stopped,
        }
    }

    /// Returns the workspace while it exists.
    pub fn workspace(&self) -> Option<&Path> {
        match self {
            Self::Prepared { workspace } | Self::Running { workspace, .. } => Some(workspace),
            Self::Stopped { .. } => None,
        }
    }

    /// Returns the process id while running.
    pub fn pid(&self) -> Option<u32> {
        match self {
            Self::Running { pid, .. } => Some(*pid),
            _ => None,
        }
    }
}

// =============================================================================
// Resource Limits
// =============================================================================

/// Per-process rlimits applied at start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// RLIMIT_CPU, in seconds of CPU time.
    pub cpu_seconds: u64,
    /// RLIMIT_AS, in MiB of address space.
    pub memory_megabytes: u64,
}

impl ResourceLimits {
    /// Validates and creates limits.
    ///
    /// Both values must be positive and at most [`MAX_CPU_SECONDS`] /
    /// [`MAX_MEMORY_MEGABYTES`].
    pub fn new(cpu_seconds: u64, memory_megabytes: u64) -> Result<Self> {
        if cpu_seconds == 0 || cpu_seconds > MAX_CPU_SECONDS {
            return Err(Error::InvalidLimits(format!(
                "cpu seconds must be between 1 and {}, got {}",
                MAX_CPU_SECONDS, cpu_seconds
            )));
        }
        if memory_megabytes == 0 || memory_megabytes > MAX_MEMORY_MEGABYTES {
            return Err(Error::InvalidLimits(format!(
                "memory megabytes must be between 1 and {}, got {}",
                MAX_MEMORY_MEGABYTES, memory_megabytes
            )));
        }
        Ok(Self {
            cpu_seconds,
            memory_megabytes,
        })
    }

    /// Address-space limit in bytes.
    pub fn memory_bytes(&self) -> u64 {
        self.memory_megabytes * BYTES_PER_MEGABYTE
    }
}

// =============================================================================
// Signals
// =============================================================================

/// Signals the engine sends to container process groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGTERM (graceful shutdown).
    Term,
    /// SIGKILL (force kill).
    Kill,
}

impl Signal {
    /// Returns the signal number.
    pub fn as_i32(&self) -> i32 {
        match self {
            Self::Term => libc::SIGTERM,
            Self::Kill => libc::SIGKILL,
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Term => write!(f, "SIGTERM"),
            Self::Kill => write!(f, "SIGKILL"),
        }
    }
}

// =============================================================================
// Container
// =============================================================================

/// Catalog record for one container.
#[derive(Debug, Clone)]
pub struct Container {
    /// Opaque id.
    pub id: String,
    /// Optional user-supplied name.
    pub name: Option<String>,
    /// Image the workspace was copied from.
    pub image: Arc<Image>,
    /// Entry script inside the workspace.
    pub entry_script: PathBuf,
    /// Limits recorded at start; `None` until started.
    pub limits: Option<ResourceLimits>,
    /// When the container was prepared.
    pub created_at: DateTime<Utc>,
    /// Current state.
    pub state: ContainerState,
}

impl Container {
    /// Returns the status tag.
    pub fn status(&self) -> ContainerStatus {
        self.state.status()
    }

    /// Returns true if the container is running.
    pub fn is_running(&self) -> bool {
        self.status() == ContainerStatus::Running
    }

    /// Returns a serializable view of this record.
    pub fn summary(&self) -> ContainerSummary {
        ContainerSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            image_id: self.image.id.clone(),
            image: self.image.alias(),
            status: self.status(),
            limits: self.limits,
            workspace: self.state.workspace().map(Path::to_path_buf),
            pid: self.state.pid(),
            created_at: self.created_at,
        }
    }
}

/// Serializable container view used by state export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub image_id: String,
    /// `name:tag` of the image.
    pub image: String,
    pub status: ContainerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceLimits>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub created_at: DateTime<Utc>,
}
