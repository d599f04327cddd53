//! # sprout-host
//!
//! A [`SandboxProvider`](sprout_core::SandboxProvider) that runs projects
//! directly on the host.
//!
//! Each booted instance is a fresh `<workdir>/<instance id>` directory.
//! Mounting writes the tree into it, spawning runs a child process inside
//! it, and teardown kills every child of the instance and removes the
//! directory.
//!
//! This provider offers no isolation beyond a separate working directory.
//!
//! ```ignore
//! use sprout_core::{LifecycleManager, RunConfig};
//! use sprout_host::HostProvider;
//! use std::sync::Arc;
//!
//! let provider = Arc::new(HostProvider::new("/tmp/sprout"));
//! let manager = LifecycleManager::new(provider, RunConfig::default())?;
//! ```

mod fs;
mod process;
mod provider;

pub use provider::{HostInstance, HostProvider};
