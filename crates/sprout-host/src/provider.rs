//! Host-directory sandbox provider.

use crate::{fs, process};
use async_trait::async_trait;
use sprout_core::{
    CommandSpec, CoreError, InstanceId, MountTree, Result, SandboxInstance, SandboxProvider,
    SpawnedProcess,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Provider that boots instances as scratch directories under `workdir`.
#[derive(Debug, Clone)]
pub struct HostProvider {
    workdir: PathBuf,
}

impl HostProvider {
    /// Create a provider rooted at `workdir`. Nothing is created until boot.
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// Directory that holds every instance directory.
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Directory an instance with `id` lives in.
    pub fn instance_dir(&self, id: InstanceId) -> PathBuf {
        self.workdir.join(id.to_string())
    }
}

#[async_trait]
impl SandboxProvider for HostProvider {
    async fn boot(&self) -> Result<Arc<dyn SandboxInstance>> {
        let id = InstanceId::new();
        let root = self.instance_dir(id);
        tokio::fs::create_dir_all(&root).await.map_err(|e| {
            CoreError::Boot(format!("failed to create '{}': {}", root.display(), e))
        })?;

        tracing::info!(sandbox_id = %id, root = %root.display(), "Host instance created");
        Ok(Arc::new(HostInstance::new(id, root)))
    }
}

/// One instance directory and the children running in it.
#[derive(Debug)]
pub struct HostInstance {
    id: InstanceId,
    root: PathBuf,
    kill: watch::Sender<bool>,
    torn_down: AtomicBool,
}

impl HostInstance {
    fn new(id: InstanceId, root: PathBuf) -> Self {
        let (kill, _) = watch::channel(false);
        Self {
            id,
            root,
            kill,
            torn_down: AtomicBool::new(false),
        }
    }

    /// Instance directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_live(&self) -> Result<()> {
        if self.torn_down.load(Ordering::SeqCst) {
            return Err(CoreError::InvalidState {
                expected: "live instance".into(),
                actual: "torn down".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SandboxInstance for HostInstance {
    fn id(&self) -> InstanceId {
        self.id
    }

    async fn mount(&self, tree: &MountTree) -> Result<()> {
        self.ensure_live().map_err(|e| CoreError::Mount(e.to_string()))?;
        let start = std::time::Instant::now();
        fs::materialize(&self.root, tree).await?;
        tracing::debug!(
            sandbox_id = %self.id,
            entries = tree.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Mount tree written"
        );
        Ok(())
    }

    async fn spawn(&self, command: &CommandSpec) -> Result<SpawnedProcess> {
        self.ensure_live().map_err(|e| CoreError::Spawn {
            command: command.to_string(),
            message: e.to_string(),
        })?;
        process::spawn(&self.root, command, self.kill.subscribe())
    }

    async fn teardown(&self) -> Result<()> {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.kill.send_replace(true);

        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(CoreError::Teardown(format!(
                    "failed to remove '{}': {}",
                    self.root.display(),
                    e
                )))
            }
        }
        tracing::debug!(sandbox_id = %self.id, "Host instance removed");
        Ok(())
    }
}
