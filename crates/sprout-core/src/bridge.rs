//! I/O bridge between a process and an interactive terminal surface.
//!
//! Output flows chunk by chunk, in arrival order, from the attached
//! process to the surface. Input events are queued and written to the
//! process's stdin one at a time; each write completes before the next is
//! issued, so keystroke order survives asynchronous writes. The exclusive
//! stdin lock is taken on the first input event and held until detach.
//!
//! Attach and detach are explicit: attaching to a new process first fully
//! detaches from the old one, so two processes never share the surface.
//! Attach, detach and close run one at a time.

use crate::cleanup::CleanupPlan;
use crate::error::{CoreError, Result};
use crate::process::{OutputEvent, ProcessHandle, ProcessId, StdinLock};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How long detach waits for queued input to be written.
const INPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// The display side of a terminal.
pub trait TerminalSurface: Send + Sync + 'static {
    /// Render process output.
    fn write(&self, data: &[u8]) -> Result<()>;

    /// Refit the display to its container's current size.
    fn fit(&self) -> Result<()>;

    /// Release the display.
    fn dispose(&self) -> Result<()>;
}

struct Attachment {
    process: ProcessHandle,
    output_task: JoinHandle<()>,
    input_tx: mpsc::UnboundedSender<Bytes>,
    input_task: JoinHandle<Option<StdinLock>>,
}

impl Attachment {
    /// Stop forwarding output, drain queued input, release stdin.
    async fn shutdown(self) -> Result<()> {
        let Attachment {
            process,
            output_task,
            input_tx,
            mut input_task,
        } = self;

        output_task.abort();
        let _ = output_task.await;

        drop(input_tx);
        match tokio::time::timeout(INPUT_DRAIN_TIMEOUT, &mut input_task).await {
            Ok(Ok(Some(stdin))) => {
                stdin.release();
                Ok(())
            }
            Ok(Ok(None)) => Ok(()),
            Ok(Err(e)) => Err(CoreError::Teardown(format!("input task failed: {e}"))),
            Err(_) => {
                tracing::warn!(process_id = %process.id(), "Pending terminal input dropped on detach");
                // aborting drops the lock, which hands stdin back
                input_task.abort();
                let _ = input_task.await;
                Ok(())
            }
        }
    }
}

/// Pumps bytes between a terminal surface and the attached process.
pub struct IoBridge {
    surface: Arc<dyn TerminalSurface>,
    attachment: Mutex<Option<Attachment>>,
    /// Held across every attach, detach and close.
    transition: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl IoBridge {
    /// Create a bridge over a surface and fit it once.
    pub fn new(surface: Arc<dyn TerminalSurface>) -> Self {
        let bridge = Self {
            surface,
            attachment: Mutex::new(None),
            transition: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        };
        bridge.resize();
        bridge
    }

    /// Process currently attached, if any.
    pub fn attached(&self) -> Option<ProcessId> {
        self.lock().as_ref().map(|a| a.process.id())
    }

    /// Attach to `process`, detaching from the previous one first.
    ///
    /// Attaching to the already-attached process is a no-op. Fails once the
    /// bridge is closed, including when `close` starts while the previous
    /// process is still detaching.
    pub async fn attach(&self, process: ProcessHandle) -> Result<()> {
        let _transition = self.transition.lock().await;
        self.ensure_open()?;
        if self.attached() == Some(process.id()) {
            return Ok(());
        }
        self.detach_current().await;
        self.ensure_open()?;

        let output_task = tokio::spawn(forward_output(
            process.clone(),
            Arc::clone(&self.surface),
        ));
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let input_task = tokio::spawn(pump_input(process.clone(), input_rx));

        tracing::debug!(process_id = %process.id(), "Terminal attached");
        let attachment = Attachment {
            process,
            output_task,
            input_tx,
            input_task,
        };
        let displaced = self.lock().replace(attachment);
        if let Some(displaced) = displaced {
            let id = displaced.process.id();
            if let Err(e) = displaced.shutdown().await {
                tracing::warn!(process_id = %id, error = %e, "Terminal detach incomplete");
            }
        }
        Ok(())
    }

    /// Detach from the current process, if any.
    pub async fn detach(&self) {
        let _transition = self.transition.lock().await;
        self.detach_current().await;
    }

    async fn detach_current(&self) {
        let Some(attachment) = self.lock().take() else {
            return;
        };
        let id = attachment.process.id();
        if let Err(e) = attachment.shutdown().await {
            tracing::warn!(process_id = %id, error = %e, "Terminal detach incomplete");
        }
        tracing::debug!(process_id = %id, "Terminal detached");
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoreError::InvalidState {
                expected: "open bridge".into(),
                actual: "closed bridge".into(),
            });
        }
        Ok(())
    }

    /// Queue one terminal input event for the attached process.
    pub fn input(&self, data: impl AsRef<[u8]>) -> Result<()> {
        let guard = self.lock();
        let attachment = guard.as_ref().ok_or_else(|| CoreError::InvalidState {
            expected: "attached bridge".into(),
            actual: "detached bridge".into(),
        })?;
        attachment
            .input_tx
            .send(Bytes::copy_from_slice(data.as_ref()))
            .map_err(|_| CoreError::StreamWrite("input pump stopped".into()))
    }

    /// Refit the surface after a viewport change. Failures are only logged.
    pub fn resize(&self) {
        if let Err(e) = self.surface.fit() {
            tracing::warn!(error = %e, "Terminal refit failed");
        }
    }

    /// Release stdin and dispose the surface, each independently.
    ///
    /// Waits for an in-progress attach or detach to settle first. Returns
    /// the number of cleanup steps that failed.
    pub async fn close(&self) -> usize {
        if self.closed.swap(true, Ordering::SeqCst) {
            return 0;
        }
        let transition = self.transition.lock().await;
        let attachment = self.lock().take();
        let surface = Arc::clone(&self.surface);

        let failures = CleanupPlan::new("bridge")
            .then("release stdin", async move {
                match attachment {
                    Some(attachment) => attachment.shutdown().await,
                    None => Ok(()),
                }
            })
            .then("dispose terminal", async move { surface.dispose() })
            .run()
            .await;
        drop(transition);
        failures
    }

    fn lock(&self) -> MutexGuard<'_, Option<Attachment>> {
        self.attachment
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn forward_output(process: ProcessHandle, surface: Arc<dyn TerminalSurface>) {
    let mut output = process.subscribe();
    while let Some(event) = output.recv().await {
        match event {
            OutputEvent::Chunk(chunk) => {
                if let Err(e) = surface.write(&chunk) {
                    tracing::warn!(process_id = %process.id(), error = %e, "Terminal write failed");
                }
            }
            OutputEvent::Closed => {
                tracing::debug!(process_id = %process.id(), "Process output closed");
            }
            OutputEvent::Failed(msg) => {
                tracing::warn!(process_id = %process.id(), error = %msg, "Process output failed");
            }
        }
    }
}

async fn pump_input(
    process: ProcessHandle,
    mut input: mpsc::UnboundedReceiver<Bytes>,
) -> Option<StdinLock> {
    let mut stdin: Option<StdinLock> = None;
    while let Some(data) = input.recv().await {
        if stdin.is_none() {
            match process.acquire_stdin() {
                Ok(lock) => stdin = Some(lock),
                Err(e) => {
                    tracing::warn!(process_id = %process.id(), error = %e, "Terminal input dropped");
                    continue;
                }
            }
        }
        if let Some(lock) = stdin.as_mut() {
            if let Err(e) = lock.write(&data).await {
                tracing::warn!(process_id = %process.id(), error = %e, "Terminal input write failed");
            }
        }
    }
    stdin
}
