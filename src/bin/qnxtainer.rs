//! # qnxtainer - command-line driver
//!
//! Thin wrapper over [`qnxtainer::Engine`]. The catalog is in-memory, so
//! `run` performs build, unpack, start and stop within one invocation.
//!
//! ```bash
//! qnxtainer build ./demo
//! qnxtainer unpack ~/.qnxtainer/images/demo/latest.tar.gz --name demo
//! qnxtainer run ./demo --cpu 5 --memory 64
//! ```
//!
//! Logs go to stderr (`RUST_LOG`, default `info`); results go to stdout.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use qnxtainer::config::{GRACE_ENV, ROOT_ENV};
use qnxtainer::{Engine, EngineConfig};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Interval between exit checks while `run` waits on a container.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Parser)]
#[command(name = "qnxtainer")]
#[command(about = "Minimal filesystem-bundle container engine", long_about = None)]
struct Cli {
    /// Engine root directory (default: ~/.qnxtainer)
    #[arg(long, global = true, env = ROOT_ENV)]
    root: Option<PathBuf>,

    /// Seconds between SIGTERM and SIGKILL on stop
    #[arg(long, global = true, env = GRACE_ENV)]
    grace: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a context directory into an image archive
    Build {
        /// Directory containing qnxtainer.yml
        context: PathBuf,
    },

    /// Unpack an image archive into the image store
    Unpack {
        /// Path to a .tar.gz archive
        archive: PathBuf,

        /// Image name, optionally with :tag
        #[arg(short, long)]
        name: String,

        /// Image tag (overrides a tag in --name)
        #[arg(short, long)]
        tag: Option<String>,
    },

    /// Build, unpack and run a context until it exits or Ctrl-C
    Run {
        /// Directory containing qnxtainer.yml
        context: PathBuf,

        /// CPU-time limit in seconds
        #[arg(long, default_value = "5")]
        cpu: u64,

        /// Address-space limit in MiB
        #[arg(long, default_value = "64")]
        memory: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match cli.root {
        Some(root) => EngineConfig::with_root(root),
        None => EngineConfig::default(),
    };
    if let Some(secs) = cli.grace {
        config = config.stop_grace_period(Duration::from_secs(secs));
    }
    let engine = Engine::new(config).context("failed to initialize engine")?;

    match cli.command {
        Commands::Build { context } => {
            let built = engine.build_image(&context).await?;
            println!("{}\t{}", built.reference, built.archive.display());
        }

        Commands::Unpack { archive, name, tag } => {
            let image = engine.upload_image(&archive, &name, tag.as_deref())?;
            println!("{}", serde_json::to_string_pretty(image.as_ref())?);
        }

        Commands::Run { context, cpu, memory } => {
            let built = engine.build_image(&context).await?;
            let image = engine.upload_image(
                &built.archive,
                &built.reference.name,
                Some(&built.reference.tag),
            )?;
            let id = engine.start_container_from_image(&image.id, cpu, memory)?;

            let mut interval = tokio::time::interval(POLL_INTERVAL);
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!(container = %id, "interrupted");
                        break;
                    }
                    _ = interval.tick() => {
                        if let Some(code) = engine.poll_exit(&id)? {
                            info!(container = %id, code, "container exited");
                            break;
                        }
                    }
                }
            }

            engine.stop_container(&id).await?;
            println!("{}", engine.export_state().to_json()?);
        }
    }

    Ok(())
}
