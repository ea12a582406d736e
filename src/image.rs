//! Image records and `name:tag` references.
//!
//! An [`Image`] is the catalog entry for one unpacked archive. It is created
//! by [`ImageStore::unpack`](crate::storage::ImageStore::unpack), shared as
//! `Arc<Image>` between the registry and every container prepared from it,
//! and never mutated afterwards.

use crate::constants::{
    ARCHIVE_ROOT, DEFAULT_TAG, IMAGE_NAME_VALID_CHARS, IMAGE_TAG_VALID_CHARS, MAX_IMAGE_REF_LEN,
    RUNNER_SCRIPT,
};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Generates an opaque, time-ordered identifier.
pub fn generate_id() -> String {
    uuid::Uuid::now_v7().simple().to_string()
}

// =============================================================================
// Image Reference
// =============================================================================

/// A validated `name:tag` pair.
///
/// Names may carry an embedded tag (`app:v2`), registry style. When both an
/// embedded tag and an explicit tag are given, the explicit tag wins; when
/// neither is given the tag is `latest`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageReference {
    /// Image name, possibly with `/` separated segments.
    pub name: String,
    /// Image tag.
    pub tag: String,
}

impl ImageReference {
    /// Parses a name with an optional explicit tag.
    pub fn parse(name: &str, tag: Option<&str>) -> Result<Self> {
        let (base, embedded) = match name.rsplit_once(':') {
            Some((base, embedded)) => (base, Some(embedded)),
            None => (name, None),
        };

        let tag = match tag.filter(|t| !t.is_empty()) {
            Some(explicit) => explicit,
            None => embedded.filter(|t| !t.is_empty()).unwrap_or(DEFAULT_TAG),
        };

        validate_name(base).map_err(|reason| Error::InvalidImageReference {
            reference: name.to_string(),
            reason: reason.to_string(),
        })?;
        validate_tag(tag).map_err(|reason| Error::InvalidImageReference {
            reference: format!("{}:{}", base, tag),
            reason: reason.to_string(),
        })?;

        Ok(Self {
            name: base.to_string(),
            tag: tag.to_string(),
        })
    }

    /// Returns the `name:tag` alias under which the registry indexes images.
    pub fn alias(&self) -> String {
        format!("{}:{}", self.name, self.tag)
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

fn validate_name(name: &str) -> std::result::Result<(), &'static str> {
    if name.is_empty() {
        return Err("image name cannot be empty");
    }
    if name.len() > MAX_IMAGE_REF_LEN {
        return Err("image name exceeds maximum length");
    }
    if !name.chars().all(|c| IMAGE_NAME_VALID_CHARS.contains(c)) {
        return Err("image name contains invalid characters");
    }
    // Names become directory paths: no absolute paths, no `..`, no empty segments.
    if name
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err("image name contains an empty or relative path segment");
    }
    Ok(())
}

fn validate_tag(tag: &str) -> std::result::Result<(), &'static str> {
    if tag.len() > MAX_IMAGE_REF_LEN {
        return Err("image tag exceeds maximum length");
    }
    if !tag.chars().all(|c| IMAGE_TAG_VALID_CHARS.contains(c)) {
        return Err("image tag contains invalid characters");
    }
    if tag.starts_with('.') {
        return Err("image tag cannot start with '.'");
    }
    Ok(())
}

// =============================================================================
// Image
// =============================================================================

/// An unpacked, registered image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    /// Opaque id, unique per unpack.
    pub id: String,
    /// Image name.
    pub name: String,
    /// Image tag.
    pub tag: String,
    /// When the image was unpacked.
    pub created_at: DateTime<Utc>,
    /// Image directory (`<root>/images/<name>/<tag>`).
    pub path: PathBuf,
    /// SHA-256 of the archive this image was unpacked from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl Image {
    /// Creates a record with a fresh id and the current time.
    pub fn new(reference: &ImageReference, path: PathBuf, digest: Option<String>) -> Self {
        Self {
            id: generate_id(),
            name: reference.name.clone(),
            tag: reference.tag.clone(),
            created_at: Utc::now(),
            path,
            digest,
        }
    }

    /// Returns the `name:tag` alias.
    pub fn alias(&self) -> String {
        format!("{}:{}", self.name, self.tag)
    }

    /// Returns the reference this image was registered under.
    pub fn reference(&self) -> ImageReference {
        ImageReference {
            name: self.name.clone(),
            tag: self.tag.clone(),
        }
    }

    /// Returns the unpacked archive root (`<path>/image`).
    pub fn rootfs(&self) -> PathBuf {
        self.path.join(ARCHIVE_ROOT)
    }

    /// Returns the entry script inside the image.
    pub fn runner_script(&self) -> PathBuf {
        self.rootfs().join(RUNNER_SCRIPT)
    }

    /// Returns true if the image directory is present on disk.
    pub fn is_unpacked(&self) -> bool {
        Path::new(&self.path).is_dir()
    }
}
