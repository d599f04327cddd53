//! Process handles.
//!
//! A [`ProcessHandle`] wraps the raw streams a provider returns for a spawned
//! process. One pump task drains the output stream as soon as the process
//! starts, so the child never stalls on a full pipe, and fans every event
//! out to any number of subscribers. Each subscriber sees the retained
//! history first, then live chunks, then exactly one terminal event.
//!
//! Standard input has a single exclusive writer, taken with
//! [`ProcessHandle::acquire_stdin`] and given back on release or drop.

use crate::config::CommandSpec;
use crate::error::{CoreError, Result};
use crate::provider::{InstanceId, SpawnedProcess};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

/// Maximum output retained for late subscribers (1 MB).
const MAX_HISTORY_BYTES: usize = 1024 * 1024;

type StdinWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Unique identifier for a spawned process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessId(Uuid);

impl ProcessId {
    /// Create a new random process ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ProcessId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a process was started for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessKind {
    /// Dependency installation; transient.
    Install,
    /// Long-running dev server.
    Dev,
}

impl fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Install => write!(f, "install"),
            Self::Dev => write!(f, "dev"),
        }
    }
}

/// One event of a process's console output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    /// A chunk of output bytes.
    Chunk(Bytes),
    /// The stream ended normally.
    Closed,
    /// The stream failed.
    Failed(String),
}

impl OutputEvent {
    fn is_terminal(&self) -> bool {
        !matches!(self, Self::Chunk(_))
    }
}

/// How a process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ExitOutcome {
    Exited(i32),
    Cancelled,
    Failed(String),
}

#[derive(Default)]
struct OutputState {
    history: VecDeque<Bytes>,
    history_bytes: usize,
    end: Option<OutputEvent>,
    subscribers: Vec<mpsc::UnboundedSender<OutputEvent>>,
}

impl OutputState {
    fn publish(&mut self, event: OutputEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        match event {
            OutputEvent::Chunk(chunk) => {
                self.history_bytes += chunk.len();
                self.history.push_back(chunk);
                while self.history_bytes > MAX_HISTORY_BYTES && self.history.len() > 1 {
                    if let Some(old) = self.history.pop_front() {
                        self.history_bytes -= old.len();
                    }
                }
            }
            end => {
                self.end = Some(end);
                // receivers finish once they drain the terminal event
                self.subscribers.clear();
            }
        }
    }
}

struct Inner {
    id: ProcessId,
    kind: ProcessKind,
    command: CommandSpec,
    instance: InstanceId,
    started_at: DateTime<Utc>,
    output: Mutex<OutputState>,
    exit: watch::Receiver<Option<ExitOutcome>>,
    stdin: Arc<Mutex<Option<StdinWriter>>>,
}

/// Shared handle to a spawned process.
///
/// Cloning is cheap; all clones observe the same process.
#[derive(Clone)]
pub struct ProcessHandle {
    inner: Arc<Inner>,
}

impl ProcessHandle {
    /// Wrap a freshly spawned process and start draining its output.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        instance: InstanceId,
        kind: ProcessKind,
        command: CommandSpec,
        process: SpawnedProcess,
    ) -> Self {
        let SpawnedProcess {
            stdin,
            mut output,
            exit,
        } = process;
        let (exit_tx, exit_rx) = watch::channel(None);

        let handle = Self {
            inner: Arc::new(Inner {
                id: ProcessId::new(),
                kind,
                command,
                instance,
                started_at: Utc::now(),
                output: Mutex::new(OutputState::default()),
                exit: exit_rx,
                stdin: Arc::new(Mutex::new(Some(stdin))),
            }),
        };
        let id = handle.id();

        let pump = Arc::clone(&handle.inner);
        tokio::spawn(async move {
            let mut chunks = 0u64;
            let end = loop {
                match output.next().await {
                    Some(Ok(chunk)) => {
                        chunks += 1;
                        tracing::trace!(process_id = %id, len = chunk.len(), "Output chunk");
                        lock(&pump.output).publish(OutputEvent::Chunk(chunk));
                    }
                    Some(Err(e)) => {
                        tracing::debug!(process_id = %id, error = %e, "Output stream failed");
                        break OutputEvent::Failed(e.to_string());
                    }
                    None => break OutputEvent::Closed,
                }
            };
            tracing::debug!(process_id = %id, chunks, "Output stream ended");
            lock(&pump.output).publish(end);
        });

        tokio::spawn(async move {
            let outcome = match exit.await {
                Ok(code) => ExitOutcome::Exited(code),
                Err(CoreError::Cancelled) => ExitOutcome::Cancelled,
                Err(e) => ExitOutcome::Failed(e.to_string()),
            };
            tracing::debug!(process_id = %id, outcome = ?outcome, "Process exited");
            exit_tx.send_replace(Some(outcome));
        });

        tracing::debug!(
            process_id = %id,
            sandbox_id = %instance,
            kind = %kind,
            command = %handle.inner.command,
            "Process started"
        );
        handle
    }

    /// Get the process ID.
    pub fn id(&self) -> ProcessId {
        self.inner.id
    }

    /// Get what the process was started for.
    pub fn kind(&self) -> ProcessKind {
        self.inner.kind
    }

    /// Get the command line the process was started with.
    pub fn command(&self) -> &CommandSpec {
        &self.inner.command
    }

    /// Get the instance the process runs in.
    pub fn instance_id(&self) -> InstanceId {
        self.inner.instance
    }

    /// Get the start timestamp.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    /// Subscribe to the process output from the beginning of the retained
    /// history.
    pub fn subscribe(&self) -> OutputSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = lock(&self.inner.output);
        for chunk in &state.history {
            let _ = tx.send(OutputEvent::Chunk(chunk.clone()));
        }
        match &state.end {
            Some(end) => {
                let _ = tx.send(end.clone());
            }
            None => state.subscribers.push(tx),
        }
        OutputSubscription { rx }
    }

    /// Retained output decoded as (lossy) UTF-8.
    pub fn output_text(&self) -> String {
        let state = lock(&self.inner.output);
        let bytes: Vec<u8> = state.history.iter().flat_map(|c| c.iter().copied()).collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Wait for the process to exit and return its exit code.
    pub async fn wait(&self) -> Result<i32> {
        let mut rx = self.inner.exit.clone();
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| CoreError::Stream("exit status unavailable".into()))?
            .clone();
        match outcome {
            Some(ExitOutcome::Exited(code)) => Ok(code),
            Some(ExitOutcome::Cancelled) => Err(CoreError::Cancelled),
            Some(ExitOutcome::Failed(msg)) => Err(CoreError::Stream(msg)),
            None => Err(CoreError::Stream("exit status unavailable".into())),
        }
    }

    /// Exit code if the process has already exited.
    pub fn try_exit_code(&self) -> Option<i32> {
        match &*self.inner.exit.borrow() {
            Some(ExitOutcome::Exited(code)) => Some(*code),
            _ => None,
        }
    }

    /// Take the exclusive stdin writer.
    ///
    /// Fails with `InvalidState` while another lock is held.
    pub fn acquire_stdin(&self) -> Result<StdinLock> {
        let writer = lock(&self.inner.stdin).take().ok_or_else(|| CoreError::InvalidState {
            expected: "stdin available".into(),
            actual: "stdin locked".into(),
        })?;
        tracing::trace!(process_id = %self.id(), "Stdin acquired");
        Ok(StdinLock {
            process: self.id(),
            writer: Some(writer),
            slot: Arc::clone(&self.inner.stdin),
        })
    }

    /// Whether the stdin writer is currently available.
    pub fn stdin_available(&self) -> bool {
        lock(&self.inner.stdin).is_some()
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("command", &self.inner.command)
            .field("instance", &self.inner.instance)
            .finish()
    }
}

/// Live view of a process's output.
pub struct OutputSubscription {
    rx: mpsc::UnboundedReceiver<OutputEvent>,
}

impl OutputSubscription {
    /// Next output event, or `None` after the terminal event was delivered.
    pub async fn recv(&mut self) -> Option<OutputEvent> {
        self.rx.recv().await
    }
}

impl Stream for OutputSubscription {
    type Item = OutputEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Exclusive writer for a process's standard input.
///
/// Dropping the lock gives the writer back to its process.
pub struct StdinLock {
    process: ProcessId,
    writer: Option<StdinWriter>,
    slot: Arc<Mutex<Option<StdinWriter>>>,
}

impl StdinLock {
    /// Process this lock writes to.
    pub fn process_id(&self) -> ProcessId {
        self.process
    }

    /// Write and flush `data`.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| CoreError::StreamWrite("stdin already released".into()))?;
        writer
            .write_all(data)
            .await
            .map_err(|e| CoreError::StreamWrite(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| CoreError::StreamWrite(e.to_string()))
    }

    /// Give the writer back to the process.
    pub fn release(mut self) {
        self.give_back();
    }

    fn give_back(&mut self) {
        if let Some(writer) = self.writer.take() {
            *lock(&self.slot) = Some(writer);
            tracing::trace!(process_id = %self.process, "Stdin released");
        }
    }
}

impl Drop for StdinLock {
    fn drop(&mut self) {
        self.give_back();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{scripted_process, ScriptedProcess};

    fn handle(script: ScriptedProcess) -> ProcessHandle {
        ProcessHandle::new(
            InstanceId::new(),
            ProcessKind::Dev,
            CommandSpec::parse("npm run dev"),
            scripted_process(script).0,
        )
    }

    async fn collect(mut sub: OutputSubscription) -> Vec<OutputEvent> {
        let mut events = Vec::new();
        while let Some(event) = sub.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_history_then_end() {
        let h = handle(ScriptedProcess::new().chunk("a").chunk("b").exit(0));
        assert_eq!(h.wait().await.unwrap(), 0);

        let events = collect(h.subscribe()).await;
        assert_eq!(
            events,
            vec![
                OutputEvent::Chunk(Bytes::from("a")),
                OutputEvent::Chunk(Bytes::from("b")),
                OutputEvent::Closed,
            ]
        );
        assert_eq!(h.output_text(), "ab");
    }

    #[tokio::test]
    async fn test_two_subscribers_see_same_order() {
        let (process, feed) = scripted_process(ScriptedProcess::new().hold_open());
        let h = ProcessHandle::new(
            InstanceId::new(),
            ProcessKind::Dev,
            CommandSpec::parse("x"),
            process,
        );
        let first = h.subscribe();
        let second = h.subscribe();

        for chunk in ["1", "2", "3"] {
            feed.chunk(chunk);
        }
        feed.close();

        let expected = vec![
            OutputEvent::Chunk(Bytes::from("1")),
            OutputEvent::Chunk(Bytes::from("2")),
            OutputEvent::Chunk(Bytes::from("3")),
            OutputEvent::Closed,
        ];
        assert_eq!(collect(first).await, expected);
        assert_eq!(collect(second).await, expected);
    }

    #[tokio::test]
    async fn test_stream_error_is_terminal_event() {
        let h = handle(ScriptedProcess::new().chunk("x").fail("boom"));
        let events = collect(h.subscribe()).await;
        assert_eq!(events.last(), Some(&OutputEvent::Failed("boom".into())));
    }

    #[tokio::test]
    async fn test_stdin_is_exclusive_and_released_on_drop() {
        let h = handle(ScriptedProcess::new().hold_open());
        let lock = h.acquire_stdin().unwrap();
        assert!(!h.stdin_available());
        assert!(matches!(
            h.acquire_stdin(),
            Err(CoreError::InvalidState { .. })
        ));
        drop(lock);
        assert!(h.stdin_available());

        let lock = h.acquire_stdin().unwrap();
        lock.release();
        assert!(h.stdin_available());
    }

    #[tokio::test]
    async fn test_stdin_write_reaches_process() {
        let (process, feed) = scripted_process(ScriptedProcess::new().hold_open());
        let h = ProcessHandle::new(
            InstanceId::new(),
            ProcessKind::Dev,
            CommandSpec::parse("x"),
            process,
        );
        let mut stdin = h.acquire_stdin().unwrap();
        stdin.write(b"ls\n").await.unwrap();
        stdin.write(b"pwd\n").await.unwrap();
        assert_eq!(feed.stdin_text(), "ls\npwd\n");
    }

    #[tokio::test]
    async fn test_try_exit_code() {
        let h = handle(ScriptedProcess::new().exit(3));
        assert_eq!(h.wait().await.unwrap(), 3);
        assert_eq!(h.try_exit_code(), Some(3));
    }
}
