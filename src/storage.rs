//! # Image Store
//!
//! On-disk layout and archive unpacking for images.
//!
//! ## Storage Model
//!
//! ```text
//! ~/.qnxtainer/images/
//! └── demo/
//!     ├── latest.tar.gz        (archive written by the builder)
//!     └── latest/
//!         └── image/           (unpacked archive root)
//!             ├── .env
//!             ├── run.sh
//!             └── ...
//! ```
//!
//! ## All-or-Nothing Unpacking
//!
//! Archives are extracted into a hidden staging directory next to the target
//! and renamed into place only after every entry has been written. Any
//! failure removes the staging directory, so callers never observe a
//! half-extracted image at `<name>/<tag>`.
//!
//! ## Path Traversal Protection
//!
//! Every archive entry must live under the single `image/` root; entries with
//! `..`, absolute paths or another top-level directory are rejected before
//! anything is written for them.

use crate::config::EngineConfig;
use crate::constants::{ARCHIVE_EXTENSION, ARCHIVE_ROOT, RUNNER_SCRIPT, RUNNER_SCRIPT_MODE};
use crate::error::{Error, Result};
use crate::image::{Image, ImageReference};
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tar::Archive;
use tracing::{debug, info, warn};

/// Local image directory.
///
/// ## Thread Safety
///
/// Extraction runs in a private staging directory, so concurrent unpacks
/// proceed in parallel. Swapping a staged image into `<name>/<tag>` is
/// serialized across clones of one store; for concurrent unpacks of the same
/// reference every call succeeds and the last swap is what stays on disk.
#[derive(Debug, Clone)]
pub struct ImageStore {
    /// Base directory for images (`<root>/images`).
    base_dir: PathBuf,
    /// Held while an image directory is swapped into place.
    replace_lock: Arc<Mutex<()>>,
}

impl ImageStore {
    /// Creates an image store under the default engine root.
    pub fn new() -> Result<Self> {
        Self::with_path(EngineConfig::default().images_dir())
    }

    /// Creates an image store at the specified path.
    pub fn with_path(base_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&base_dir).map_err(|e| Error::StorageInitFailed {
            path: base_dir.clone(),
            reason: e.to_string(),
        })?;

        debug!("Image store initialized at: {}", base_dir.display());

        Ok(Self {
            base_dir,
            replace_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Returns the base directory.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Returns the image directory for a reference: `<base>/<name>/<tag>`.
    pub fn image_dir(&self, reference: &ImageReference) -> PathBuf {
        self.base_dir.join(&reference.name).join(&reference.tag)
    }

    /// Returns the image directory for a raw name and optional tag.
    pub fn image_directory(&self, name: &str, tag: Option<&str>) -> Result<PathBuf> {
        let reference = ImageReference::parse(name, tag)?;
        Ok(self.image_dir(&reference))
    }

    /// Returns where the builder writes the archive: `<base>/<name>/<tag>.tar.gz`.
    pub fn archive_path(&self, reference: &ImageReference) -> PathBuf {
        self.base_dir
            .join(&reference.name)
            .join(format!("{}.{}", reference.tag, ARCHIVE_EXTENSION))
    }

    /// Unpacks an image archive and returns a fresh [`Image`] record.
    ///
    /// An existing directory for the same reference is replaced. On failure
    /// the target directory is left exactly as it was before the call.
    pub fn unpack(&self, archive: &Path, reference: &ImageReference) -> Result<Image> {
        if !archive.is_file() {
            return Err(Error::ExtractionFailed {
                archive: archive.to_path_buf(),
                reason: "archive not found".to_string(),
            });
        }

        let digest = file_digest(archive)?;
        let image_dir = self.image_dir(reference);
        let parent = image_dir
            .parent()
            .ok_or_else(|| Error::Internal(format!("image dir has no parent: {}", image_dir.display())))?;
        fs::create_dir_all(parent)?;

        let staging = parent.join(format!(".{}.unpack-{}", reference.tag, uuid::Uuid::now_v7().simple()));
        fs::create_dir_all(&staging)?;

        if let Err(e) = self.stage(archive, &staging) {
            remove_dir_best_effort(&staging);
            return Err(e);
        }

        if let Err(e) = self.swap_into_place(&staging, &image_dir, parent, reference) {
            remove_dir_best_effort(&staging);
            return Err(Error::ExtractionFailed {
                archive: archive.to_path_buf(),
                reason: format!("failed to move image into place: {}", e),
            });
        }

        let image = Image::new(reference, image_dir, Some(digest));
        info!(
            image = %reference,
            id = %image.id,
            path = %image.path.display(),
            "unpacked image"
        );
        Ok(image)
    }

    /// Renames `staging` to `image_dir`.
    ///
    /// A previous directory is first renamed aside and restored if the final
    /// rename fails, so `image_dir` always holds a complete image or nothing.
    fn swap_into_place(
        &self,
        staging: &Path,
        image_dir: &Path,
        parent: &Path,
        reference: &ImageReference,
    ) -> std::io::Result<()> {
        let _guard = self.replace_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let previous = if image_dir.exists() {
            info!(image = %reference, "replacing existing image directory");
            let aside = parent.join(format!(".{}.old-{}", reference.tag, uuid::Uuid::now_v7().simple()));
            fs::rename(image_dir, &aside)?;
            Some(aside)
        } else {
            None
        };

        if let Err(e) = fs::rename(staging, image_dir) {
            if let Some(aside) = &previous
                && let Err(restore) = fs::rename(aside, image_dir)
            {
                warn!(
                    image = %reference,
                    error = %restore,
                    "failed to restore previous image directory"
                );
            }
            return Err(e);
        }

        if let Some(aside) = previous {
            remove_dir_best_effort(&aside);
        }
        Ok(())
    }

    /// Extracts into `staging` and finishes the image layout there.
    fn stage(&self, archive: &Path, staging: &Path) -> Result<()> {
        extract_archive(archive, staging)?;

        let root = staging.join(ARCHIVE_ROOT);
        if !root.is_dir() {
            return Err(Error::ExtractionFailed {
                archive: archive.to_path_buf(),
                reason: format!("archive has no top-level '{}/' directory", ARCHIVE_ROOT),
            });
        }

        let script = root.join(RUNNER_SCRIPT);
        if script.is_file() {
            mark_executable(&script)?;
        } else {
            debug!("archive {} has no {}", archive.display(), RUNNER_SCRIPT);
        }

        Ok(())
    }
}

// =============================================================================
// Archive Utilities
// =============================================================================

/// Extracts a gzip tar archive whose entries all live under `image/`.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<()> {
    let extraction_failed = |reason: String| Error::ExtractionFailed {
        archive: archive.to_path_buf(),
        reason,
    };

    let file = fs::File::open(archive).map_err(|e| extraction_failed(e.to_string()))?;
    let mut tar = Archive::new(GzDecoder::new(file));

    for entry in tar.entries().map_err(|e| extraction_failed(e.to_string()))? {
        let mut entry = entry.map_err(|e| extraction_failed(e.to_string()))?;
        let path = entry
            .path()
            .map_err(|e| extraction_failed(e.to_string()))?
            .into_owned();

        check_archive_path(&path)?;

        entry
            .unpack_in(dest)
            .map_err(|e| extraction_failed(format!("{}: {}", path.display(), e)))?;
    }

    Ok(())
}

/// Rejects entries outside the single `image/` root.
fn check_archive_path(path: &Path) -> Result<()> {
    let mut components = path.components().filter(|c| !matches!(c, Component::CurDir));

    match components.next() {
        Some(Component::Normal(first)) if first == ARCHIVE_ROOT => {}
        _ => {
            return Err(Error::PathTraversal {
                path: path.display().to_string(),
            });
        }
    }

    if components.any(|c| !matches!(c, Component::Normal(_))) {
        return Err(Error::PathTraversal {
            path: path.display().to_string(),
        });
    }

    Ok(())
}

/// Computes `sha256:<hex>` of a file without loading it into memory.
pub fn file_digest(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

// =============================================================================
// Filesystem Utilities
// =============================================================================

/// Sets the entry script permission bits.
pub(crate) fn mark_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(RUNNER_SCRIPT_MODE))?;
    Ok(())
}

/// Copies a directory recursively, preserving symlinks.
pub(crate) fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    if !src.is_dir() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("source directory does not exist: {}", src.display()),
        ));
    }
    fs::create_dir_all(dst)?;

    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_symlink() {
            let link_target = fs::read_link(&src_path)?;
            let _ = fs::remove_file(&dst_path);
            std::os::unix::fs::symlink(&link_target, &dst_path)?;
        } else if file_type.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path)?;
        }
    }
    Ok(())
}

/// Removes a directory tree; a missing directory is not an error.
pub(crate) fn remove_dir_best_effort(path: &Path) {
    match fs::remove_dir_all(path) {
        Ok(()) => debug!("removed {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove directory"),
    }
}
