//! # Container Lifecycle Manager
//!
//! Prepares container workspaces, starts them as limited processes, and
//! stops and reaps them, writing every transition back into the [`Registry`].
//!
//! ## Process Table
//!
//! Child handles never enter the registry. They live in this manager's
//! process table, keyed by container id, from spawn until `stop()` reaps
//! them. The registry records only the pid.
//!
//! ## Locking
//!
//! `start()` holds the process table lock across the state check, the spawn
//! and the registry update, so two concurrent starts of the same container
//! spawn exactly one process. Lock order is always process table, then
//! registry. `stop()` writes `Stopped` under the table lock, then releases
//! it before awaiting the child.
//!
//! ## Stop Sequence
//!
//! ```text
//! set Stopped (under table lock)
//!     │
//! SIGTERM → process group
//!     │
//!     ├── exited within grace period ──┐
//!     │                                │
//!     └── timeout → SIGKILL → reap ────┤
//!                                      ▼
//!                  SIGKILL sweep of leftover group members
//!                                      │
//!                               remove workspace
//! ```

use crate::config::EngineConfig;
use crate::constants::{ARCHIVE_ROOT, RUNNER_SCRIPT};
use crate::error::{Error, Result};
use crate::image::{Image, generate_id};
use crate::process::{exit_code, signal_group, spawn_limited};
use crate::registry::Registry;
use crate::runtime::{Container, ContainerState, ResourceLimits, Signal};
use crate::storage::{copy_dir_recursive, mark_executable, remove_dir_best_effort};
use chrono::Utc;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::process::Child;
use tracing::{debug, info, warn};

/// Drives containers through `prepared → running → stopped`.
pub struct LifecycleManager {
    /// Workspace root (`<root>/containers`).
    containers_dir: PathBuf,
    /// Shared catalog.
    registry: Arc<Registry>,
    /// Time between SIGTERM and SIGKILL.
    grace_period: Duration,
    /// Child handles of running containers.
    processes: Mutex<HashMap<String, Child>>,
}

impl LifecycleManager {
    /// Creates a manager with workspaces under `containers_dir`.
    pub fn new(containers_dir: PathBuf, registry: Arc<Registry>, grace_period: Duration) -> Result<Self> {
        fs::create_dir_all(&containers_dir).map_err(|e| Error::StorageInitFailed {
            path: containers_dir.clone(),
            reason: e.to_string(),
        })?;

        debug!("Container workspaces at: {}", containers_dir.display());

        Ok(Self {
            containers_dir,
            registry,
            grace_period,
            processes: Mutex::new(HashMap::new()),
        })
    }

    /// Creates a manager from engine configuration.
    pub fn with_config(config: &EngineConfig, registry: Arc<Registry>) -> Result<Self> {
        Self::new(config.containers_dir(), registry, config.stop_grace_period)
    }

    /// Returns the workspace path for a container id.
    pub fn container_dir(&self, id: &str) -> PathBuf {
        self.containers_dir.join(id)
    }

    fn lock_processes(&self) -> Result<MutexGuard<'_, HashMap<String, Child>>> {
        self.processes
            .lock()
            .map_err(|_| Error::Internal("lock poisoned".to_string()))
    }

    // =========================================================================
    // Prepare
    // =========================================================================

    /// Copies the image into a fresh workspace and registers a prepared
    /// container. Returns the new container id.
    ///
    /// # Errors
    ///
    /// - [`Error::ImageNotFound`] if the image directory is missing on disk
    /// - [`Error::PrepareFailed`] if the copy fails; the partial workspace is
    ///   removed
    ///
    /// An image without a runner script still prepares; `start()` rejects it.
    pub fn prepare(&self, image: Arc<Image>, name: Option<&str>) -> Result<String> {
        if let Some(name) = name {
            crate::constants::validate_container_name(name).map_err(|reason| Error::PrepareFailed {
                image: image.alias(),
                reason: reason.to_string(),
            })?;
        }

        if !image.is_unpacked() {
            return Err(Error::ImageNotFound(format!(
                "{} (directory {} is missing)",
                image.alias(),
                image.path.display()
            )));
        }

        let id = generate_id();
        let workspace = self.container_dir(&id);
        let entry_script = workspace.join(ARCHIVE_ROOT).join(RUNNER_SCRIPT);

        let copied = copy_dir_recursive(&image.path, &workspace)
            .map_err(Error::from)
            .and_then(|()| {
                if entry_script.is_file() {
                    mark_executable(&entry_script)
                } else {
                    debug!(image = %image.alias(), "image has no {}", RUNNER_SCRIPT);
                    Ok(())
                }
            });

        if let Err(e) = copied {
            remove_dir_best_effort(&workspace);
            return Err(Error::PrepareFailed {
                image: image.alias(),
                reason: e.to_string(),
            });
        }

        self.registry.add_container(Container {
            id: id.clone(),
            name: name.map(str::to_string),
            image: Arc::clone(&image),
            entry_script,
            limits: None,
            created_at: Utc::now(),
            state: ContainerState::Prepared {
                workspace: workspace.clone(),
            },
        });

        info!(
            container = %id,
            image = %image.alias(),
            workspace = %workspace.display(),
            "prepared container"
        );
        Ok(id)
    }

    // =========================================================================
    // Start
    // =========================================================================

    /// Spawns the container's entry script under the given limits.
    ///
    /// Does not wait for the process. Starting a running container is a
    /// logged no-op; starting a stopped one is [`Error::InvalidState`].
    /// A workspace without a runner script is [`Error::StartFailed`].
    /// Must be called from within a Tokio runtime.
    pub fn start(&self, id: &str, cpu_seconds: u64, memory_megabytes: u64) -> Result<()> {
        let limits = ResourceLimits::new(cpu_seconds, memory_megabytes)?;

        let mut processes = self.lock_processes()?;
        let container = self
            .registry
            .get_container_by_id(id)
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))?;

        let workspace = match &container.state {
            ContainerState::Prepared { workspace } => workspace.clone(),
            ContainerState::Running { pid, .. } => {
                info!(container = %id, pid, "container already running, ignoring start");
                return Ok(());
            }
            ContainerState::Stopped { .. } => {
                return Err(Error::InvalidState {
                    id: id.to_string(),
                    state: container.status().to_string(),
                    expected: "prepared".to_string(),
                });
            }
        };

        if !container.entry_script.is_file() {
            return Err(Error::StartFailed {
                id: id.to_string(),
                reason: format!("image has no {}", RUNNER_SCRIPT),
            });
        }

        let cwd = container
            .entry_script
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| workspace.clone());

        let child = spawn_limited(&container.entry_script, &cwd, &limits).map_err(|e| {
            Error::StartFailed {
                id: id.to_string(),
                reason: e.to_string(),
            }
        })?;
        let pid = child.id().ok_or_else(|| Error::StartFailed {
            id: id.to_string(),
            reason: "process exited before its pid was read".to_string(),
        })?;
        processes.insert(id.to_string(), child);

        let started_at = Utc::now();
        self.registry
            .update_container(id, |c| {
                c.limits = Some(limits);
                c.state = ContainerState::Running {
                    workspace,
                    pid,
                    started_at,
                };
            })
            .ok_or_else(|| Error::Internal(format!("container {} vanished during start", id)))?;

        info!(
            container = %id,
            pid,
            cpu_seconds = limits.cpu_seconds,
            memory_megabytes = limits.memory_megabytes,
            "started container"
        );
        Ok(())
    }

    // =========================================================================
    // Stop
    // =========================================================================

    /// Marks the container stopped, then terminates its process group and
    /// removes its workspace.
    ///
    /// The `Stopped` transition is written while the process table is held,
    /// so a concurrent `start()` either spawned first (and its handle is
    /// reaped here) or sees `Stopped` and fails. Of two concurrent stops the
    /// first claims the cleanup and the second is a no-op. Waits at most the
    /// grace period before escalating to SIGKILL.
    pub async fn stop(&self, id: &str) -> Result<()> {
        let (workspace, pid, child) = {
            let mut processes = self.lock_processes()?;
            let container = self
                .registry
                .get_container_by_id(id)
                .ok_or_else(|| Error::ContainerNotFound(id.to_string()))?;

            let claimed = match container.state {
                ContainerState::Stopped { .. } => {
                    info!(container = %id, "container already stopped, ignoring stop");
                    return Ok(());
                }
                ContainerState::Prepared { workspace } => (workspace, None, processes.remove(id)),
                ContainerState::Running { workspace, pid, .. } => {
                    (workspace, Some(pid), processes.remove(id))
                }
            };

            self.mark_stopped(id);
            claimed
        };

        match (pid, child) {
            (Some(pid), Some(child)) => self.terminate(id, pid, child).await,
            (Some(pid), None) => {
                debug!(container = %id, pid, "no process handle, sweeping group");
                let _ = signal_group(pid, Signal::Kill);
            }
            _ => {}
        }

        remove_dir_best_effort(&workspace);

        info!(container = %id, "stopped container");
        Ok(())
    }

    /// Removes a container that was prepared but never started.
    ///
    /// Running and stopped containers are left alone. Used to roll back a
    /// failed create-and-start.
    pub fn discard(&self, id: &str) -> Result<()> {
        let processes = self.lock_processes()?;
        let container = self
            .registry
            .get_container_by_id(id)
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))?;

        if let ContainerState::Prepared { workspace } = container.state {
            self.mark_stopped(id);
            drop(processes);
            remove_dir_best_effort(&workspace);
            info!(container = %id, "discarded prepared container");
        }
        Ok(())
    }

    /// Caller must hold the process table lock.
    fn mark_stopped(&self, id: &str) {
        self.registry.update_container(id, |c| {
            c.state = ContainerState::Stopped {
                stopped_at: Utc::now(),
            };
        });
    }

    /// SIGTERM, bounded wait, SIGKILL, reap.
    async fn terminate(&self, id: &str, pid: u32, mut child: Child) {
        match signal_group(pid, Signal::Term) {
            Ok(true) => debug!(container = %id, pid, "sent SIGTERM"),
            Ok(false) => debug!(container = %id, pid, "process group already gone"),
            Err(e) => warn!(container = %id, pid, error = %e, "failed to send SIGTERM"),
        }

        match tokio::time::timeout(self.grace_period, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(container = %id, pid, code = exit_code(status), "container exited");
            }
            Ok(Err(e)) => warn!(container = %id, pid, error = %e, "failed to wait for container"),
            Err(_) => {
                warn!(
                    container = %id,
                    pid,
                    grace_secs = self.grace_period.as_secs(),
                    "grace period expired, sending SIGKILL"
                );
                if let Err(e) = signal_group(pid, Signal::Kill) {
                    warn!(container = %id, pid, error = %e, "failed to send SIGKILL");
                }
                if let Err(e) = child.wait().await {
                    warn!(container = %id, pid, error = %e, "failed to reap container");
                }
            }
        }

        // stragglers that outlived the group leader
        let _ = signal_group(pid, Signal::Kill);
    }

    // =========================================================================
    // Exit Polling
    // =========================================================================

    /// Returns the exit code if the container's process has exited.
    ///
    /// `None` while the process is alive or when the container has no
    /// process. Signal deaths report `128 + signal`. The container stays
    /// `Running` until [`stop`](Self::stop) reaps and cleans it up.
    pub fn poll_exit(&self, id: &str) -> Result<Option<i32>> {
        let mut processes = self.lock_processes()?;
        if self.registry.get_container_by_id(id).is_none() {
            return Err(Error::ContainerNotFound(id.to_string()));
        }

        match processes.get_mut(id) {
            Some(child) => Ok(child.try_wait()?.map(exit_code)),
            None => Ok(None),
        }
    }

    /// Number of live process handles.
    pub fn running_count(&self) -> usize {
        self.processes.lock().map(|p| p.len()).unwrap_or(0)
    }
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("containers_dir", &self.containers_dir)
            .field("grace_period", &self.grace_period)
            .field("running", &self.processes.try_lock().map(|p| p.len()).ok())
            .finish()
    }
}
