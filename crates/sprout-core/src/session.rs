//! Sandbox session - owns the single live sandbox instance.
//!
//! ```text
//!  Uninitialized ──boot──▶ Booting ──ok──▶ Ready
//!        ▲                   │  │            │
//!        └──────boot error───┘  └─teardown─┐ │ teardown
//!                                          ▼ ▼
//!                  Booting ◀──get_or_create── TornDown
//! ```
//!
//! Booting is single-flight: concurrent [`SandboxSession::get_or_create`]
//! calls share one boot. The boot itself runs on its own task, so dropping
//! every caller does not abandon it; if the session is torn down while the
//! boot is in flight, the freshly booted instance is released and all
//! waiters get [`CoreError::Cancelled`].

use crate::config::CommandSpec;
use crate::error::{CoreError, Result};
use crate::process::{ProcessHandle, ProcessKind};
use crate::provider::{InstanceId, SandboxInstance, SandboxProvider};
use crate::vfs::MountTree;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

/// Current state of a sandbox session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No instance has been booted, or the last boot failed.
    Uninitialized,
    /// A boot is in flight.
    Booting,
    /// An instance is ready for commands.
    Ready,
    /// The instance was released; the next request boots a new one.
    TornDown,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "Uninitialized"),
            Self::Booting => write!(f, "Booting"),
            Self::Ready => write!(f, "Ready"),
            Self::TornDown => write!(f, "TornDown"),
        }
    }
}

type Instance = Arc<dyn SandboxInstance>;
type BootFuture = Shared<BoxFuture<'static, std::result::Result<Instance, BootError>>>;

/// Clonable boot failure shared by every waiter.
#[derive(Debug, Clone)]
enum BootError {
    Failed(String),
    Cancelled,
}

impl From<BootError> for CoreError {
    fn from(e: BootError) -> Self {
        match e {
            BootError::Failed(msg) => CoreError::Boot(msg),
            BootError::Cancelled => CoreError::Cancelled,
        }
    }
}

enum Slot {
    Uninitialized,
    Booting { generation: u64, boot: BootFuture },
    Ready(Instance),
    TornDown,
}

impl Slot {
    fn state(&self) -> SessionState {
        match self {
            Self::Uninitialized => SessionState::Uninitialized,
            Self::Booting { .. } => SessionState::Booting,
            Self::Ready(_) => SessionState::Ready,
            Self::TornDown => SessionState::TornDown,
        }
    }
}

struct Inner {
    slot: Slot,
    generation: u64,
}

/// Handle to the session's sandbox instance.
///
/// Cloning is cheap; all clones share the same state machine. All state
/// transitions happen inside `get_or_create`, the boot task and `teardown`.
#[derive(Clone)]
pub struct SandboxSession {
    provider: Arc<dyn SandboxProvider>,
    inner: Arc<Mutex<Inner>>,
}

impl fmt::Debug for SandboxSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxSession")
            .field("state", &self.state())
            .field("instance_id", &self.instance_id())
            .finish()
    }
}

impl SandboxSession {
    /// Create a session over a provider. Nothing is booted yet.
    pub fn new(provider: Arc<dyn SandboxProvider>) -> Self {
        Self {
            provider,
            inner: Arc::new(Mutex::new(Inner {
                slot: Slot::Uninitialized,
                generation: 0,
            })),
        }
    }

    /// Get the current state.
    pub fn state(&self) -> SessionState {
        self.lock().slot.state()
    }

    /// Return the ready instance, joining or starting a boot as needed.
    pub async fn get_or_create(&self) -> Result<Instance> {
        let boot = {
            let mut inner = self.lock();
            match &inner.slot {
                Slot::Ready(instance) => return Ok(Arc::clone(instance)),
                Slot::Booting { boot, .. } => {
                    tracing::debug!("Joining in-flight sandbox boot");
                    boot.clone()
                }
                Slot::Uninitialized | Slot::TornDown => {
                    inner.generation += 1;
                    let generation = inner.generation;
                    let boot = self.start_boot(generation);
                    inner.slot = Slot::Booting {
                        generation,
                        boot: boot.clone(),
                    };
                    boot
                }
            }
        };
        boot.await.map_err(CoreError::from)
    }

    /// Spawn the boot task for `generation` and wrap it for sharing.
    fn start_boot(&self, generation: u64) -> BootFuture {
        let provider = Arc::clone(&self.provider);
        let inner = Arc::clone(&self.inner);

        let task = tokio::spawn(async move {
            let start = std::time::Instant::now();
            tracing::info!(generation, "Booting sandbox");
            let result = provider.boot().await;

            let orphan = {
                let mut guard = lock(&inner);
                let current = matches!(
                    guard.slot,
                    Slot::Booting { generation: g, .. } if g == generation
                );
                match (current, result) {
                    (true, Ok(instance)) => {
                        guard.slot = Slot::Ready(Arc::clone(&instance));
                        tracing::info!(
                            sandbox_id = %instance.id(),
                            elapsed_ms = start.elapsed().as_millis() as u64,
                            "Sandbox ready"
                        );
                        return Ok(instance);
                    }
                    (true, Err(e)) => {
                        guard.slot = Slot::Uninitialized;
                        tracing::error!(error = %e, "Sandbox boot failed");
                        return Err(BootError::Failed(e.to_string()));
                    }
                    (false, result) => result,
                }
            };

            match orphan {
                Ok(instance) => {
                    tracing::info!(
                        sandbox_id = %instance.id(),
                        "Session torn down during boot, releasing instance"
                    );
                    if let Err(e) = instance.teardown().await {
                        tracing::warn!(
                            sandbox_id = %instance.id(),
                            error = %e,
                            "Failed to release orphaned instance"
                        );
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Discarding boot failure of torn down session");
                }
            }
            Err(BootError::Cancelled)
        });

        async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(BootError::Failed(format!("boot task failed: {e}"))),
            }
        }
        .boxed()
        .shared()
    }

    /// The ready instance, or `InvalidState`.
    pub fn instance(&self) -> Result<Instance> {
        match &self.lock().slot {
            Slot::Ready(instance) => Ok(Arc::clone(instance)),
            other => Err(CoreError::InvalidState {
                expected: SessionState::Ready.to_string(),
                actual: other.state().to_string(),
            }),
        }
    }

    /// Identifier of the ready instance, if any.
    pub fn instance_id(&self) -> Option<InstanceId> {
        self.instance().ok().map(|i| i.id())
    }

    /// Write a mount tree into the ready instance.
    pub async fn mount(&self, tree: &MountTree) -> Result<()> {
        let instance = self.instance()?;
        tracing::debug!(sandbox_id = %instance.id(), entries = tree.len(), "Mounting project");
        instance.mount(tree).await.map_err(|e| match e {
            CoreError::Mount(msg) => CoreError::Mount(msg),
            other => CoreError::Mount(other.to_string()),
        })?;
        tracing::info!(sandbox_id = %instance.id(), entries = tree.len(), "Project mounted");
        Ok(())
    }

    /// Spawn a process in the ready instance.
    pub async fn spawn(&self, kind: ProcessKind, command: &CommandSpec) -> Result<ProcessHandle> {
        let instance = self.instance()?;
        let process = instance.spawn(command).await.map_err(|e| CoreError::Spawn {
            command: command.to_string(),
            message: e.to_string(),
        })?;
        Ok(ProcessHandle::new(
            instance.id(),
            kind,
            command.clone(),
            process,
        ))
    }

    /// Release the instance. Idempotent and infallible.
    ///
    /// A boot in flight is abandoned: its waiters get `Cancelled` and the
    /// instance it produces is released by the boot task. Provider teardown
    /// errors are logged and dropped.
    pub async fn teardown(&self) {
        let previous = {
            let mut inner = self.lock();
            std::mem::replace(&mut inner.slot, Slot::TornDown)
        };
        match previous {
            Slot::Ready(instance) => {
                let start = std::time::Instant::now();
                tracing::info!(sandbox_id = %instance.id(), "Tearing down sandbox");
                if let Err(e) = instance.teardown().await {
                    tracing::warn!(sandbox_id = %instance.id(), error = %e, "Sandbox teardown failed");
                } else {
                    tracing::info!(
                        sandbox_id = %instance.id(),
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Sandbox torn down"
                    );
                }
            }
            Slot::Booting { generation, .. } => {
                tracing::info!(generation, "Teardown requested during boot");
            }
            Slot::Uninitialized | Slot::TornDown => {
                tracing::trace!("Teardown with no live instance");
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        lock(&self.inner)
    }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
