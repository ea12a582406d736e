//! # qnxtainer
//!
//! **Minimal Filesystem-Bundle Container Engine**
//!
//! Builds "images" (directory bundles with a generated entry script) from a
//! build context, unpacks them into a local store, and runs "containers" as
//! resource-limited child processes working in private copies of an image.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                              Engine                                 │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐  archive  ┌──────────────┐  Image  ┌───────────┐  │
//! │  │ ImageBuilder │ ────────► │  ImageStore  │ ──────► │ Registry  │  │
//! │  │ manifest,    │           │ unpack, path │         │ images,   │  │
//! │  │ mounts, sh   │           │ traversal    │         │ aliases,  │  │
//! │  └──────────────┘           └──────────────┘         │ containers│  │
//! │                                                      └─────┬─────┘  │
//! │                                                            │        │
//! │  ┌─────────────────────────────────────────────────────────┴─────┐  │
//! │  │                    LifecycleManager                           │  │
//! │  │   prepare(image) → start(cpu, memory) → stop()                │  │
//! │  │   workspace copy   setpgid + rlimits    SIGTERM/SIGKILL       │  │
//! │  └───────────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Container Lifecycle
//!
//! ```text
//!   ┌──────────┐   start   ┌─────────┐   stop   ┌─────────┐
//!   │ Prepared │ ────────► │ Running │ ───────► │ Stopped │
//!   └──────────┘           └─────────┘          └─────────┘
//! ```
//!
//! Redundant transitions (start while running, stop while stopped) are
//! logged no-ops.
//!
//! # Isolation Model
//!
//! There is none beyond per-process rlimits. A container is an ordinary
//! child process in its own process group with `RLIMIT_AS` and `RLIMIT_CPU`
//! lowered. It shares the host's users, network, PID space and filesystem.
//! Only run trusted images.
//!
//! # Example
//!
//! ```rust,ignore
//! use qnxtainer::{Engine, EngineConfig};
//!
//! #[tokio::main]
//! async fn main() -> qnxtainer::Result<()> {
//!     let engine = Engine::new(EngineConfig::from_env())?;
//!
//!     let built = engine.build_image("./demo".as_ref()).await?;
//!     let image = engine.upload_image(&built.archive, &built.reference.name, Some(&built.reference.tag))?;
//!
//!     let id = engine.start_container_from_image(&image.id, 5, 64)?;
//!     engine.stop_container(&id).await?;
//!
//!     println!("{}", engine.export_state().to_json()?);
//!     Ok(())
//! }
//! ```

#[cfg(not(unix))]
compile_error!("qnxtainer relies on Unix process groups and rlimits");

pub mod builder;
pub mod config;
pub mod constants;
pub mod engine;
pub mod error;
pub mod image;
pub mod lifecycle;
pub mod manifest;
pub mod process;
pub mod registry;
pub mod runtime;
pub mod storage;

pub use builder::{BuiltImage, ImageBuilder};
pub use config::EngineConfig;
pub use constants::*;
pub use engine::Engine;
pub use error::{Error, Result};
pub use image::{Image, ImageReference};
pub use lifecycle::LifecycleManager;
pub use manifest::Manifest;
pub use registry::{Registry, StateSnapshot};
pub use runtime::{Container, ContainerState, ContainerStatus, ContainerSummary, ResourceLimits, Signal};
pub use storage::ImageStore;
