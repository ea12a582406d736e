//! # Image and Container Catalog
//!
//! In-memory catalog shared by the engine facade and the lifecycle manager.
//!
//! ## Indexes
//!
//! ```text
//! images      id        → Arc<Image>  ─┐
//! aliases     name:tag  → Arc<Image>  ─┴─ same allocation
//! containers  id        → Container
//! ```
//!
//! Registering an image under an existing `name:tag` moves the alias to the
//! new image; the old image stays reachable by id. Export walks the id index,
//! so every image appears exactly once.
//!
//! ## Locking
//!
//! A single mutex guards all three maps. Critical sections are short map
//! operations and never await. A poisoned lock is recovered: every mutation
//! is a single insert or a closure over one record, so the maps are never
//! left half-updated.

use crate::error::Result;
use crate::image::{Image, ImageReference};
use crate::runtime::{Container, ContainerSummary};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

#[derive(Debug, Default)]
struct Catalog {
    images: HashMap<String, Arc<Image>>,
    aliases: HashMap<String, Arc<Image>>,
    containers: HashMap<String, Container>,
}

/// Concurrency-safe catalog of images and containers.
#[derive(Debug, Default)]
pub struct Registry {
    catalog: Mutex<Catalog>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Catalog> {
        self.catalog.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Images
    // =========================================================================

    /// Registers an image by id and by `name:tag`, returning the shared record.
    pub fn add_image(&self, image: Image) -> Arc<Image> {
        let image = Arc::new(image);
        let alias = image.alias();

        let mut catalog = self.lock();
        catalog.images.insert(image.id.clone(), Arc::clone(&image));
        if let Some(previous) = catalog.aliases.insert(alias.clone(), Arc::clone(&image)) {
            debug!(alias = %alias, previous = %previous.id, "alias moved to new image");
        }
        drop(catalog);

        debug!(id = %image.id, alias = %alias, "registered image");
        image
    }

    /// Looks up an image by id.
    pub fn get_image_by_id(&self, id: &str) -> Option<Arc<Image>> {
        self.lock().images.get(id).cloned()
    }

    /// Looks up an image by name and tag.
    pub fn get_image_by_name_tag(&self, name: &str, tag: &str) -> Option<Arc<Image>> {
        self.lock().aliases.get(&format!("{}:{}", name, tag)).cloned()
    }

    /// Resolves an image id or a `name[:tag]` alias.
    ///
    /// Ids take precedence. A bare name resolves to its `latest` tag.
    pub fn resolve_image(&self, reference: &str) -> Option<Arc<Image>> {
        if let Some(image) = self.get_image_by_id(reference) {
            return Some(image);
        }
        let reference = ImageReference::parse(reference, None).ok()?;
        self.get_image_by_name_tag(&reference.name, &reference.tag)
    }

    /// Number of distinct images.
    pub fn image_count(&self) -> usize {
        self.lock().images.len()
    }

    // =========================================================================
    // Containers
    // =========================================================================

    /// Registers a container record, replacing one with the same id.
    pub fn add_container(&self, container: Container) {
        debug!(id = %container.id, status = %container.status(), "registered container");
        self.lock().containers.insert(container.id.clone(), container);
    }

    /// Returns a snapshot of a container record.
    pub fn get_container_by_id(&self, id: &str) -> Option<Container> {
        self.lock().containers.get(id).cloned()
    }

    /// Mutates one container record under the lock.
    ///
    /// Returns `None` if no container has this id.
    pub fn update_container<R>(&self, id: &str, f: impl FnOnce(&mut Container) -> R) -> Option<R> {
        self.lock().containers.get_mut(id).map(f)
    }

    /// Number of containers in any state.
    pub fn container_count(&self) -> usize {
        self.lock().containers.len()
    }

    // =========================================================================
    // Export
    // =========================================================================

    /// Returns every container and every distinct image, ordered by id.
    pub fn export_state(&self) -> StateSnapshot {
        let catalog = self.lock();
        let mut images: Vec<Image> = catalog.images.values().map(|i| Image::clone(i)).collect();
        let mut containers: Vec<ContainerSummary> =
            catalog.containers.values().map(Container::summary).collect();
        drop(catalog);

        images.sort_by(|a, b| a.id.cmp(&b.id));
        containers.sort_by(|a, b| a.id.cmp(&b.id));
        StateSnapshot { images, containers }
    }
}

/// Point-in-time copy of the catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub images: Vec<Image>,
    pub containers: Vec<ContainerSummary>,
}

impl StateSnapshot {
    /// Serializes to pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
