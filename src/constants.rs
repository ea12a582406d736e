//! # Engine Constants
//!
//! File names, directory layout, limits and timeouts shared by the builder,
//! the image store and the lifecycle manager. These constants are the single
//! source of truth for the on-disk format: an archive produced by one version
//! of the builder must unpack and run under the same names.
//!
//! ## On-Disk Layout
//!
//! ```text
//! ~/.qnxtainer/
//! ├── images/
//! │   └── <name>/
//! │       ├── <tag>.tar.gz          (builder output)
//! │       └── <tag>/image/...       (unpacked image, immutable)
//! └── containers/
//!     └── <container-id>/image/...  (private copy per container)
//! ```

use std::time::Duration;

// =============================================================================
// Storage Paths
// =============================================================================

/// Engine state directory, relative to the user's home.
pub const ENGINE_DIR: &str = ".qnxtainer";

/// Subdirectory for image archives and unpacked images.
pub const IMAGES_DIR: &str = "images";

/// Subdirectory for container workspaces.
pub const CONTAINERS_DIR: &str = "containers";

/// Extension of image archives written by the builder.
pub const ARCHIVE_EXTENSION: &str = "tar.gz";

/// Single top-level directory inside every image archive.
pub const ARCHIVE_ROOT: &str = "image";

// =============================================================================
// Build Context
// =============================================================================

/// Manifest file expected at the root of a build context.
pub const MANIFEST_FILE: &str = "qnxtainer.yml";

/// Generated environment file (`KEY=VALUE` per line).
pub const ENV_FILE: &str = ".env";

/// Generated entry script.
pub const RUNNER_SCRIPT: &str = "run.sh";

/// Permission bits for the entry script.
pub const RUNNER_SCRIPT_MODE: u32 = 0o755;

/// Prefix of generated image names when the manifest has none.
pub const GENERATED_NAME_PREFIX: &str = "qnxtainer";

/// Tag used when neither the name nor the caller supplies one.
pub const DEFAULT_TAG: &str = "latest";

// =============================================================================
// Resource Limits
// =============================================================================

/// Bytes per megabyte for the memory limit (address space is sized in MiB).
pub const BYTES_PER_MEGABYTE: u64 = 1024 * 1024;

/// Largest accepted memory limit (64 GiB).
///
/// Keeps the MiB → bytes conversion far from overflow and rejects obvious
/// unit mistakes (bytes passed as megabytes).
pub const MAX_MEMORY_MEGABYTES: u64 = 64 * 1024;

/// Largest accepted CPU-time limit (one day of CPU).
pub const MAX_CPU_SECONDS: u64 = 24 * 60 * 60;

// =============================================================================
// Timeouts
// =============================================================================

/// Default time between SIGTERM and SIGKILL during container stop.
///
/// `stop()` never blocks longer than this plus the time to reap the process.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

// =============================================================================
// Validation Patterns
// =============================================================================

/// Valid characters for image names (`/` allows `org/app` style names).
pub const IMAGE_NAME_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_./";

/// Valid characters for image tags.
pub const IMAGE_TAG_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_.";

/// Maximum image name or tag length.
pub const MAX_IMAGE_REF_LEN: usize = 255;

/// Valid characters for container names.
///
/// Excludes `/` and `.` so names can never be confused with paths.
pub const CONTAINER_NAME_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_";

/// Maximum container name length.
pub const MAX_CONTAINER_NAME_LEN: usize = 128;

/// Validates a user-supplied container name.
#[inline]
#[must_use = "validation result must be checked"]
pub fn validate_container_name(name: &str) -> std::result::Result<(), &'static str> {
    if name.is_empty() {
        return Err("container name cannot be empty");
    }
    if name.len() > MAX_CONTAINER_NAME_LEN {
        return Err("container name exceeds maximum length");
    }
    if !name.chars().all(|c| CONTAINER_NAME_VALID_CHARS.contains(c)) {
        return Err("container name contains invalid characters");
    }
    Ok(())
}
