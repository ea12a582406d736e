//! Engine facade.
//!
//! [`Engine`] owns one image store, builder, registry and lifecycle manager
//! rooted at the same directory, and exposes the operations a request layer
//! or the CLI needs. Every lookup failure surfaces as an error for which
//! [`Error::is_not_found`] is true.

use crate::builder::{BuiltImage, ImageBuilder};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::image::{Image, ImageReference};
use crate::lifecycle::LifecycleManager;
use crate::registry::{Registry, StateSnapshot};
use crate::runtime::{Container, ResourceLimits};
use crate::storage::ImageStore;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// The container engine.
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    store: ImageStore,
    builder: ImageBuilder,
    registry: Arc<Registry>,
    lifecycle: LifecycleManager,
}

impl Engine {
    /// Creates an engine, creating the directory layout under `config.root`.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let store = ImageStore::with_path(config.images_dir())?;
        let builder = ImageBuilder::new(store.clone());
        let registry = Arc::new(Registry::new());
        let lifecycle = LifecycleManager::with_config(&config, Arc::clone(&registry))?;

        info!(root = %config.root.display(), "engine initialized");

        Ok(Self {
            config,
            store,
            builder,
            registry,
            lifecycle,
        })
    }

    /// Returns the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns the image store.
    pub fn store(&self) -> &ImageStore {
        &self.store
    }

    /// Returns the shared registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Returns the lifecycle manager.
    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    /// Builds a context directory into an archive under the image store.
    ///
    /// The archive is not unpacked or registered; pass it to
    /// [`upload_image`](Self::upload_image).
    pub async fn build_image(&self, context_dir: &Path) -> Result<BuiltImage> {
        self.builder.build(context_dir).await
    }

    /// Unpacks an archive as `name[:tag]` and registers the image.
    pub fn upload_image(&self, archive: &Path, name: &str, tag: Option<&str>) -> Result<Arc<Image>> {
        let reference = ImageReference::parse(name, tag)?;
        let image = self.store.unpack(archive, &reference)?;
        Ok(self.registry.add_image(image))
    }

    /// Prepares a container from an image id (or `name:tag` alias).
    pub fn create_container(&self, image_id: &str, name: Option<&str>) -> Result<String> {
        let image = self
            .registry
            .resolve_image(image_id)
            .ok_or_else(|| Error::ImageNotFound(image_id.to_string()))?;
        self.lifecycle.prepare(image, name)
    }

    /// Prepares and starts a container in one call. Returns its id.
    ///
    /// Limits are checked before anything is written to disk. If the start
    /// fails the prepared container is discarded and ends `Stopped`.
    pub fn start_container_from_image(
        &self,
        image_id: &str,
        cpu_seconds: u64,
        memory_megabytes: u64,
    ) -> Result<String> {
        ResourceLimits::new(cpu_seconds, memory_megabytes)?;
        let id = self.create_container(image_id, None)?;

        if let Err(e) = self.lifecycle.start(&id, cpu_seconds, memory_megabytes) {
            if let Err(cleanup) = self.lifecycle.discard(&id) {
                warn!(container = %id, error = %cleanup, "failed to discard container");
            }
            return Err(e);
        }
        Ok(id)
    }

    /// Starts a prepared container. Returns its id.
    pub fn start_container(&self, container_id: &str, cpu_seconds: u64, memory_megabytes: u64) -> Result<String> {
        self.lifecycle.start(container_id, cpu_seconds, memory_megabytes)?;
        Ok(container_id.to_string())
    }

    /// Stops a container and removes its workspace.
    pub async fn stop_container(&self, container_id: &str) -> Result<()> {
        self.lifecycle.stop(container_id).await
    }

    /// Returns a snapshot of one container record.
    pub fn container(&self, container_id: &str) -> Result<Container> {
        self.registry
            .get_container_by_id(container_id)
            .ok_or_else(|| Error::ContainerNotFound(container_id.to_string()))
    }

    /// Returns the exit code of a running container's process, if it exited.
    pub fn poll_exit(&self, container_id: &str) -> Result<Option<i32>> {
        self.lifecycle.poll_exit(container_id)
    }

    /// Returns every container and every distinct image.
    pub fn export_state(&self) -> StateSnapshot {
        self.registry.export_state()
    }
}
