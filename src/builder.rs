//! Image building.
//!
//! Turns a build context (a directory with a `qnxtainer.yml` manifest) into
//! a gzip tar archive with a single `image/` root:
//!
//! ```text
//! context/ ──copy──► workspace/ ◄──mounts── host paths
//!                        │
//!                   sh -c "<build>"   (cwd = workspace, non-zero exit aborts)
//!                        │
//!                   .env + run.sh
//!                        │
//!                        ▼
//!         images/<name>/<tag>.tar.gz   (image/...)
//! ```
//!
//! Every build runs in a fresh temporary workspace that is removed when the
//! build finishes, so concurrent builds never see each other's files and a
//! failed build leaves nothing behind but its error.

use crate::constants::{ARCHIVE_ROOT, ENV_FILE, MANIFEST_FILE, RUNNER_SCRIPT};
use crate::error::{Error, Result};
use crate::image::ImageReference;
use crate::manifest::{Manifest, Mount};
use crate::storage::{ImageStore, copy_dir_recursive, mark_executable};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tracing::{debug, info, warn};

/// Number of stderr lines carried into a build failure message.
const BUILD_ERROR_TAIL_LINES: usize = 20;

/// Output of a successful build.
#[derive(Debug, Clone)]
pub struct BuiltImage {
    /// Archive written under the image store.
    pub archive: PathBuf,
    /// Reference the archive was built for.
    pub reference: ImageReference,
}

/// Builds image archives into an [`ImageStore`].
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    store: ImageStore,
}

impl ImageBuilder {
    /// Creates a builder that writes archives into `store`.
    pub fn new(store: ImageStore) -> Self {
        Self { store }
    }

    /// Builds the context directory into an image archive.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidManifest`] if the manifest is missing or invalid
    /// - [`Error::BuildFailed`] if the build command exits non-zero or the
    ///   workspace cannot be assembled
    pub async fn build(&self, context_dir: &Path) -> Result<BuiltImage> {
        let context = context_dir.canonicalize().map_err(|e| Error::InvalidManifest {
            path: context_dir.to_path_buf(),
            reason: format!("build context not accessible: {}", e),
        })?;

        let manifest = Manifest::load(&context)?;
        let reference = manifest.reference()?;
        let name = reference.to_string();
        info!(image = %name, context = %context.display(), "building image");

        let workspace = tempfile::Builder::new()
            .prefix("qnxtainer-build-")
            .tempdir()
            .map_err(|e| build_failed(&name, format!("failed to create workspace: {}", e)))?;
        debug!(image = %name, workspace = %workspace.path().display(), "created build workspace");

        copy_dir_recursive(&context, workspace.path())
            .map_err(|e| build_failed(&name, format!("failed to copy context: {}", e)))?;

        apply_mounts(&context, workspace.path(), &manifest.parsed_mounts())?;

        run_build_command(&manifest.build, workspace.path(), &name).await?;

        fs::write(workspace.path().join(ENV_FILE), manifest.env_file())?;
        let script = workspace.path().join(RUNNER_SCRIPT);
        fs::write(&script, render_runner_script(&manifest))?;
        mark_executable(&script)?;

        let archive = self.store.archive_path(&reference);
        write_archive(workspace.path(), &archive)
            .map_err(|e| build_failed(&name, format!("failed to write archive: {}", e)))?;

        info!(image = %name, archive = %archive.display(), "built image");
        Ok(BuiltImage { archive, reference })
    }
}

fn build_failed(name: &str, reason: String) -> Error {
    Error::BuildFailed {
        name: name.to_string(),
        reason,
    }
}

/// Copies every mount source into the workspace, in declaration order.
///
/// Sources are resolved against the build context. A mount overwrites any
/// context file (or earlier mount) at the same destination.
fn apply_mounts(context: &Path, workspace: &Path, mounts: &[Mount]) -> Result<()> {
    for mount in mounts {
        let source = context.join(&mount.source).canonicalize().map_err(|e| Error::InvalidManifest {
            path: context.join(MANIFEST_FILE),
            reason: format!("mount source '{}' not found: {}", mount.source.display(), e),
        })?;
        let destination = workspace.join(&mount.destination);

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }

        if source.is_dir() {
            copy_dir_recursive(&source, &destination)?;
        } else {
            fs::copy(&source, &destination)?;
        }

        debug!(
            source = %source.display(),
            destination = %mount.destination.display(),
            "applied mount"
        );
    }
    Ok(())
}

/// Runs the build command with the workspace as working directory.
async fn run_build_command(command: &str, workspace: &Path, name: &str) -> Result<()> {
    debug!(image = %name, command = %command, "running build command");

    let output = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(workspace)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| build_failed(name, format!("failed to run build command: {}", e)))?;

    for line in String::from_utf8_lossy(&output.stdout).lines() {
        debug!(image = %name, "build: {}", line);
    }

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let lines: Vec<&str> = stderr.lines().collect();
    let tail = lines[lines.len().saturating_sub(BUILD_ERROR_TAIL_LINES)..].join("\n");
    warn!(image = %name, status = %output.status, "build command failed");

    Err(build_failed(
        name,
        if tail.is_empty() {
            format!("build command `{}` exited with {}", command, output.status)
        } else {
            format!(
                "build command `{}` exited with {}:\n{}",
                command, output.status, tail
            )
        },
    ))
}

/// Renders `run.sh`: exports the manifest environment, then runs `cmd`.
///
/// The script changes into its own directory first, so it behaves the same
/// whether launched from the image, a container workspace or by hand.
pub fn render_runner_script(manifest: &Manifest) -> String {
    let mut script = String::from("#!/bin/sh\ncd \"$(dirname \"$0\")\" || exit 1\n");
    for (key, value) in &manifest.env {
        script.push_str(&format!("export {}={}\n", key, shell_quote(value)));
    }
    script.push_str(manifest.cmd.trim_end());
    script.push('\n');
    script
}

/// Single-quotes a value for POSIX sh.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Writes the workspace as `image/...` into a gzip tar archive.
///
/// The archive is written beside its final path and renamed into place, so
/// a reader never sees a truncated archive.
fn write_archive(workspace: &Path, archive: &Path) -> std::io::Result<()> {
    if let Some(parent) = archive.parent() {
        fs::create_dir_all(parent)?;
    }

    let temp_path = archive.with_extension(format!("tmp.{}", uuid::Uuid::now_v7().simple()));
    let result = (|| {
        let file = fs::File::create(&temp_path)?;
        let mut tar = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        tar.follow_symlinks(false);
        tar.append_dir_all(ARCHIVE_ROOT, workspace)?;
        tar.into_inner()?.finish()?.sync_all()?;
        fs::rename(&temp_path, archive)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}
