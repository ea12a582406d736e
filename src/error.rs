//! Error types for the container engine.

use std::path::PathBuf;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the container engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Lookup Errors
    // =========================================================================
    /// Image id or `name:tag` alias not found.
    #[error("image not found: {0}")]
    ImageNotFound(String),

    /// Container not found.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    // =========================================================================
    // Container Lifecycle Errors
    // =========================================================================
    /// Container is in wrong state for operation.
    #[error("container '{id}' is in state '{state}', expected '{expected}'")]
    InvalidState {
        id: String,
        state: String,
        expected: String,
    },

    /// Requested resource limits are unusable.
    #[error("invalid resource limits: {0}")]
    InvalidLimits(String),

    /// Container process could not be spawned.
    #[error("failed to start container '{id}': {reason}")]
    StartFailed { id: String, reason: String },

    /// Container workspace could not be prepared.
    #[error("failed to prepare container from image '{image}': {reason}")]
    PrepareFailed { image: String, reason: String },

    // =========================================================================
    // Build Errors
    // =========================================================================
    /// Manifest missing, unreadable or semantically invalid.
    #[error("invalid manifest {path}: {reason}")]
    InvalidManifest { path: PathBuf, reason: String },

    /// Build command failed or the image could not be packaged.
    #[error("failed to build image '{name}': {reason}")]
    BuildFailed { name: String, reason: String },

    // =========================================================================
    // Image Store Errors
    // =========================================================================
    /// Failed to parse an image reference.
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidImageReference { reference: String, reason: String },

    /// Archive could not be extracted.
    #[error("failed to extract {archive}: {reason}")]
    ExtractionFailed { archive: PathBuf, reason: String },

    /// Path traversal attempt detected in an archive or mount.
    #[error("path traversal detected: {path}")]
    PathTraversal { path: String },

    /// Storage initialization failed.
    #[error("failed to initialize storage at {path}: {reason}")]
    StorageInitFailed { path: PathBuf, reason: String },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true for unknown image or container lookups.
    ///
    /// The request layer maps these to a not-found response; everything else
    /// is a server-side failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ImageNotFound(_) | Self::ContainerNotFound(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
