//! # sprout-core
//!
//! Provisioning engine for ephemeral project sandboxes.
//!
//! This crate turns an in-memory `path -> content` manifest into a running
//! dev server inside a sandbox, and pipes the server's console to an
//! interactive terminal.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                   LifecycleManager                       │
//! │   run(files) ─▶ teardown previous ─▶ build ─▶ provision  │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌─────────────────┐     ┌──────────────────────────┐    │
//! │  │   VfsBuilder    │────▶│  MountTree               │    │
//! │  │  - normalize()  │     │  (dirs shallowest-first, │    │
//! │  │  - merge()      │     │   then files)            │    │
//! │  └─────────────────┘     └──────────────────────────┘    │
//! │           │                                              │
//! │           ▼                                              │
//! │  ┌─────────────────┐     ┌──────────────────────────┐    │
//! │  │ SandboxSession  │────▶│  dyn SandboxProvider     │    │
//! │  │ - get_or_create │     │  (single-flight boot)    │    │
//! │  │ - mount/spawn   │     └──────────────────────────┘    │
//! │  └─────────────────┘                                     │
//! │           │                                              │
//! │  ┌─────────────────────┐    ┌───────────────────────┐    │
//! │  │ ProcessOrchestrator │───▶│  ProcessHandle        │    │
//! │  │ - run_install()     │    │  (output fan-out,     │    │
//! │  │ - run_dev_server()  │    │   exclusive stdin)    │    │
//! │  │ - await_ready()     │    └───────────────────────┘    │
//! │  └─────────────────────┘               │                 │
//! │                                        ▼                 │
//! │                              ┌───────────────────────┐   │
//! │                              │ IoBridge              │   │
//! │                              │ ◀──▶ TerminalSurface  │   │
//! │                              └───────────────────────┘   │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use sprout_core::{IoBridge, LifecycleManager, RunConfig};
//! use std::sync::Arc;
//!
//! # async fn example(provider: Arc<dyn sprout_core::SandboxProvider>,
//! #                  surface: Arc<dyn sprout_core::TerminalSurface>) -> anyhow::Result<()> {
//! let manager = LifecycleManager::new(provider, RunConfig::default())?;
//!
//! let files = vec![("src/App.jsx", serde_json::json!("export default () => null"))];
//! let outcome = manager.run(files).await?;
//! println!("Preview at {}", outcome.url);
//!
//! let bridge = IoBridge::new(surface);
//! bridge.attach(outcome.process.clone()).await?;
//! bridge.input("r")?;
//!
//! bridge.close().await;
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Mount Trees**: Total coercion of raw entries, scaffold merge, ancestor directories
//! - **Single-flight Boot**: Concurrent callers share one in-progress boot
//! - **Readiness Probes**: Pluggable predicates over accumulated output, ANSI-aware
//! - **Terminal Bridge**: Ordered output, serialized input, explicit attach/detach
//! - **Best-effort Cleanup**: Every teardown step attempted and logged

mod bridge;
mod cleanup;
mod config;
mod error;
mod lifecycle;
mod orchestrator;
mod process;
mod provider;
mod readiness;
mod session;
mod vfs;

#[cfg(test)]
mod testing;

pub use bridge::{IoBridge, TerminalSurface};
pub use cleanup::CleanupPlan;
pub use config::{CommandSpec, RunConfig, RunConfigBuilder};
pub use error::{CoreError, Result};
pub use lifecycle::{LifecycleManager, RunFailure, RunOutcome, RunStage};
pub use orchestrator::{await_readiness, DevServer, ProcessOrchestrator};
pub use process::{
    OutputEvent, OutputSubscription, ProcessHandle, ProcessId, ProcessKind, StdinLock,
};
pub use provider::{InstanceId, SandboxInstance, SandboxProvider, SpawnedProcess};
pub use readiness::{strip_ansi, MarkerProbe, ReadinessProbe};
pub use session::{SandboxSession, SessionState};
pub use vfs::{
    derive_directories, merge, normalize, order, EntryKind, FileEntry, MountTree,
    ProjectManifest, Scaffold, VfsBuilder,
};
