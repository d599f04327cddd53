//! Sandbox provider contract.
//!
//! The provider is the trusted runtime that actually isolates the project:
//! it boots instances, writes mount trees into them and spawns processes.
//! Isolation guarantees are entirely the provider's business.

use crate::config::CommandSpec;
use crate::error::Result;
use crate::vfs::MountTree;
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::io::AsyncWrite;
use uuid::Uuid;

/// Unique identifier for a booted sandbox instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(Uuid);

impl InstanceId {
    /// Create a new random instance ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for InstanceId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Boots sandbox instances.
#[async_trait]
pub trait SandboxProvider: Send + Sync + 'static {
    /// Boot a fresh instance.
    async fn boot(&self) -> Result<Arc<dyn SandboxInstance>>;
}

/// A booted sandbox.
#[async_trait]
pub trait SandboxInstance: Send + Sync + 'static {
    /// Identifier of this instance.
    fn id(&self) -> InstanceId;

    /// Write a mount tree into the instance.
    ///
    /// Must fail with [`CoreError::Mount`](crate::CoreError::Mount) when the
    /// structure is rejected, e.g. a file path colliding with a directory.
    async fn mount(&self, tree: &MountTree) -> Result<()>;

    /// Start a process inside the instance.
    async fn spawn(&self, command: &CommandSpec) -> Result<SpawnedProcess>;

    /// Stop every process and release the instance.
    async fn teardown(&self) -> Result<()>;
}

/// Raw process streams as returned by a provider.
pub struct SpawnedProcess {
    /// Process standard input.
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    /// Console output in arrival order.
    pub output: BoxStream<'static, std::io::Result<Bytes>>,
    /// Resolves with the exit code once the process ends.
    pub exit: BoxFuture<'static, Result<i32>>,
}

impl fmt::Debug for SpawnedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnedProcess").finish_non_exhaustive()
    }
}
