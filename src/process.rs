//! Process spawning with rlimits and process-group signalling.
//!
//! Containers are plain child processes. The only containment is what the
//! kernel enforces per process between fork and exec:
//!
//! - `setpgid(0, 0)` so the entry script and everything it forks share a
//!   process group that [`signal_group`] can address as a whole
//! - `RLIMIT_AS` (address space) and `RLIMIT_CPU` (CPU seconds), each
//!   clamped to the current hard limit so an unprivileged caller can always
//!   apply them
//!
//! There are no namespaces, cgroups or filesystem restrictions.

use crate::runtime::{ResourceLimits, Signal};
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command};

/// Sets both soft and hard limit of `$resource` to `$value`, clamped to the
/// current hard limit. Returns the OS error from the enclosing closure.
///
/// A macro because the resource parameter type differs between libc targets.
macro_rules! lower_limit {
    ($resource:expr, $value:expr) => {{
        let mut current = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if libc::getrlimit($resource, &mut current) != 0 {
            return Err(io::Error::last_os_error());
        }
        let value = ($value as libc::rlim_t).min(current.rlim_max);
        let limit = libc::rlimit {
            rlim_cur: value,
            rlim_max: value,
        };
        if libc::setrlimit($resource, &limit) != 0 {
            return Err(io::Error::last_os_error());
        }
    }};
}

/// Spawns `sh <script>` with `cwd` as working directory under `limits`.
///
/// The script is run through `sh` rather than exec'd directly, so a script
/// that was copied moments ago by another thread can never fail with
/// `ETXTBSY`. Must be called from within a Tokio runtime.
pub fn spawn_limited(script: &Path, cwd: &Path, limits: &ResourceLimits) -> io::Result<Child> {
    let memory_bytes = limits.memory_bytes();
    let cpu_seconds = limits.cpu_seconds;

    let mut command = Command::new("/bin/sh");
    command.arg(script).current_dir(cwd).stdin(Stdio::null());

    // SAFETY: the hook runs in the forked child before exec and only makes
    // async-signal-safe syscalls (setpgid, getrlimit, setrlimit).
    unsafe {
        command.pre_exec(move || {
            if libc::setpgid(0, 0) != 0 {
                return Err(io::Error::last_os_error());
            }
            lower_limit!(libc::RLIMIT_AS, memory_bytes);
            lower_limit!(libc::RLIMIT_CPU, cpu_seconds);
            Ok(())
        });
    }

    command.spawn()
}

/// Sends `signal` to the process group led by `pid`.
///
/// Returns `Ok(false)` if the group no longer exists.
pub fn signal_group(pid: u32, signal: Signal) -> io::Result<bool> {
    let pgid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid pid {}", pid)))?;

    // SAFETY: kill has no memory-safety preconditions.
    if unsafe { libc::kill(-pgid, signal.as_i32()) } == 0 {
        return Ok(true);
    }

    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(false)
    } else {
        Err(err)
    }
}

/// Maps an exit status to a shell-style code: the exit code, or 128 plus
/// the signal number for signal deaths.
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}
