//! Scripted sandbox provider for unit tests.

use crate::config::CommandSpec;
use crate::error::{CoreError, Result};
use crate::provider::{InstanceId, SandboxInstance, SandboxProvider, SpawnedProcess};
use crate::vfs::MountTree;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{FutureExt, StreamExt};
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, oneshot, watch};

#[derive(Debug, Clone)]
enum Step {
    Chunk(Bytes),
    Fail(String),
}

/// Script for a fake process.
#[derive(Debug, Clone, Default)]
pub struct ScriptedProcess {
    output: Vec<Step>,
    exit: Option<i32>,
    hold_open: bool,
    stdin_delays: Vec<Duration>,
}

impl ScriptedProcess {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chunk(mut self, text: &str) -> Self {
        self.output.push(Step::Chunk(Bytes::from(text.to_string())));
        self
    }

    pub fn fail(mut self, message: &str) -> Self {
        self.output.push(Step::Fail(message.to_string()));
        self
    }

    pub fn exit(mut self, code: i32) -> Self {
        self.exit = Some(code);
        self
    }

    /// Keep output open and the exit pending until driven through the feed.
    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    /// Per-write completion delays, cycled.
    pub fn stdin_delays(mut self, delays: Vec<Duration>) -> Self {
        self.stdin_delays = delays;
        self
    }
}

/// Control side of a fake process.
pub struct ProcessFeed {
    output: Mutex<Option<mpsc::UnboundedSender<io::Result<Bytes>>>>,
    exit: Mutex<Option<oneshot::Sender<Result<i32>>>>,
    stdin: Arc<Mutex<Vec<u8>>>,
}

impl ProcessFeed {
    pub fn chunk(&self, text: &str) {
        if let Some(tx) = self.output.lock().unwrap().as_ref() {
            let _ = tx.send(Ok(Bytes::from(text.to_string())));
        }
    }

    pub fn close(&self) {
        self.output.lock().unwrap().take();
    }

    pub fn exit(&self, code: i32) {
        if let Some(tx) = self.exit.lock().unwrap().take() {
            let _ = tx.send(Ok(code));
        }
    }

    /// Simulate the process being killed.
    pub fn kill(&self) {
        self.close();
        if let Some(tx) = self.exit.lock().unwrap().take() {
            let _ = tx.send(Err(CoreError::Cancelled));
        }
    }

    pub fn stdin_text(&self) -> String {
        String::from_utf8_lossy(&self.stdin.lock().unwrap()).into_owned()
    }
}

/// Build a fake process from a script.
pub fn scripted_process(script: ScriptedProcess) -> (SpawnedProcess, Arc<ProcessFeed>) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    for step in script.output {
        let item = match step {
            Step::Chunk(chunk) => Ok(chunk),
            Step::Fail(message) => Err(io::Error::other(message)),
        };
        let _ = out_tx.send(item);
    }
    let (exit_tx, exit_rx) = oneshot::channel();

    let feed = Arc::new(ProcessFeed {
        output: Mutex::new(Some(out_tx)),
        exit: Mutex::new(Some(exit_tx)),
        stdin: Arc::new(Mutex::new(Vec::new())),
    });
    if !script.hold_open {
        if let Some(code) = script.exit {
            feed.exit(code);
        }
        feed.close();
    }

    let output = futures::stream::unfold(out_rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
    .boxed();
    let exit = async move { exit_rx.await.unwrap_or(Err(CoreError::Cancelled)) }.boxed();
    let stdin = RecordingStdin {
        sink: Arc::clone(&feed.stdin),
        delays: script.stdin_delays,
        writes: 0,
        pending: None,
    };

    (
        SpawnedProcess {
            stdin: Box::new(stdin),
            output,
            exit,
        },
        feed,
    )
}

/// Stdin that records bytes, optionally completing each write after a delay.
struct RecordingStdin {
    sink: Arc<Mutex<Vec<u8>>>,
    delays: Vec<Duration>,
    writes: usize,
    pending: Option<Pin<Box<tokio::time::Sleep>>>,
}

impl AsyncWrite for RecordingStdin {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if !self.delays.is_empty() {
            if self.pending.is_none() {
                let delay = self.delays[self.writes % self.delays.len()];
                self.pending = Some(Box::pin(tokio::time::sleep(delay)));
            }
            if let Some(sleep) = self.pending.as_mut() {
                if sleep.as_mut().poll(cx).is_pending() {
                    return Poll::Pending;
                }
            }
            self.pending = None;
        }
        self.writes += 1;
        self.sink.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[derive(Default)]
struct ProviderState {
    boots: AtomicUsize,
    teardowns: AtomicUsize,
    fail_next_boots: AtomicUsize,
    reject_mount: AtomicBool,
    fail_teardown: AtomicBool,
    gate: Mutex<Option<watch::Sender<bool>>>,
    scripts: Mutex<HashMap<String, ScriptedProcess>>,
    spawns: Mutex<Vec<String>>,
    feeds: Mutex<Vec<(InstanceId, Arc<ProcessFeed>)>>,
    mounts: Mutex<Vec<MountTree>>,
}

/// Provider whose instances run scripted processes.
#[derive(Clone, Default)]
pub struct ScriptedProvider {
    state: Arc<ProviderState>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script every spawn of `command`.
    pub fn script(self, command: &str, script: ScriptedProcess) -> Self {
        self.state
            .scripts
            .lock()
            .unwrap()
            .insert(CommandSpec::parse(command).to_string(), script);
        self
    }

    /// Make boots wait until [`open_gate`](Self::open_gate).
    pub fn close_gate(&self) {
        let (tx, _) = watch::channel(false);
        *self.state.gate.lock().unwrap() = Some(tx);
    }

    pub fn open_gate(&self) {
        if let Some(tx) = self.state.gate.lock().unwrap().as_ref() {
            tx.send_replace(true);
        }
    }

    pub fn fail_next_boots(&self, count: usize) {
        self.state.fail_next_boots.store(count, Ordering::SeqCst);
    }

    pub fn reject_mount(&self) {
        self.state.reject_mount.store(true, Ordering::SeqCst);
    }

    pub fn fail_teardown(&self) {
        self.state.fail_teardown.store(true, Ordering::SeqCst);
    }

    pub fn boots(&self) -> usize {
        self.state.boots.load(Ordering::SeqCst)
    }

    pub fn teardowns(&self) -> usize {
        self.state.teardowns.load(Ordering::SeqCst)
    }

    pub fn spawns(&self) -> Vec<String> {
        self.state.spawns.lock().unwrap().clone()
    }

    pub fn mounts(&self) -> Vec<MountTree> {
        self.state.mounts.lock().unwrap().clone()
    }
}

#[async_trait]
impl SandboxProvider for ScriptedProvider {
    async fn boot(&self) -> Result<Arc<dyn SandboxInstance>> {
        self.state.boots.fetch_add(1, Ordering::SeqCst);
        let gate = self
            .state
            .gate
            .lock()
            .unwrap()
            .as_ref()
            .map(|tx| tx.subscribe());
        if let Some(mut rx) = gate {
            let _ = rx.wait_for(|open| *open).await;
        }

        let failing = self
            .state
            .fail_next_boots
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(CoreError::Boot("scripted boot failure".into()));
        }
        Ok(Arc::new(ScriptedInstance {
            id: InstanceId::new(),
            state: Arc::clone(&self.state),
        }))
    }
}

struct ScriptedInstance {
    id: InstanceId,
    state: Arc<ProviderState>,
}

#[async_trait]
impl SandboxInstance for ScriptedInstance {
    fn id(&self) -> InstanceId {
        self.id
    }

    async fn mount(&self, tree: &MountTree) -> Result<()> {
        if self.state.reject_mount.load(Ordering::SeqCst) {
            return Err(CoreError::Mount("scripted mount rejection".into()));
        }
        self.state.mounts.lock().unwrap().push(tree.clone());
        Ok(())
    }

    async fn spawn(&self, command: &CommandSpec) -> Result<SpawnedProcess> {
        let key = command.to_string();
        self.state.spawns.lock().unwrap().push(key.clone());
        let script = self
            .state
            .scripts
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .unwrap_or_else(|| ScriptedProcess::new().exit(0));
        let (process, feed) = scripted_process(script);
        self.state.feeds.lock().unwrap().push((self.id, feed));
        Ok(process)
    }

    async fn teardown(&self) -> Result<()> {
        self.state.teardowns.fetch_add(1, Ordering::SeqCst);
        for (owner, feed) in self.state.feeds.lock().unwrap().iter() {
            if *owner == self.id {
                feed.kill();
            }
        }
        if self.state.fail_teardown.load(Ordering::SeqCst) {
            return Err(CoreError::Teardown("scripted teardown failure".into()));
        }
        Ok(())
    }
}
