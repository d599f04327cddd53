//! Process orchestration: dependency install, dev server spawn, readiness.
//!
//! The orchestrator never retries. An `InstallFailure` or
//! `ReadinessTimeout` ends the current attempt; whether to try again is the
//! lifecycle manager's call.

use crate::config::{CommandSpec, RunConfig};
use crate::error::{CoreError, Result};
use crate::process::{OutputEvent, ProcessHandle, ProcessKind};
use crate::readiness::{MarkerProbe, ReadinessProbe};
use crate::session::SandboxSession;
use std::sync::Arc;
use std::time::Duration;

/// Lines of install output logged when installation fails.
const INSTALL_TAIL_LINES: usize = 20;

/// A dev server that announced its address.
#[derive(Debug, Clone)]
pub struct DevServer {
    /// The running dev server process.
    pub process: ProcessHandle,
    /// Address extracted from its output.
    pub url: String,
}

/// Sequences install, dev server spawn and readiness detection.
#[derive(Clone)]
pub struct ProcessOrchestrator {
    install: CommandSpec,
    dev: CommandSpec,
    probe: Arc<dyn ReadinessProbe>,
    ready_timeout: Duration,
}

impl ProcessOrchestrator {
    /// Create an orchestrator using the config's commands and marker probe.
    pub fn new(config: &RunConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            install: config.install.clone(),
            dev: config.dev.clone(),
            probe: Arc::new(MarkerProbe::new(&config.ready_marker)?),
            ready_timeout: config.ready_timeout,
        })
    }

    /// Replace the readiness probe, e.g. for another dev server's log format.
    pub fn with_probe(mut self, probe: Arc<dyn ReadinessProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// How long readiness is awaited.
    pub fn ready_timeout(&self) -> Duration {
        self.ready_timeout
    }

    /// Run the install command to completion.
    ///
    /// # Errors
    ///
    /// `InstallFailure` when the command exits non-zero.
    pub async fn run_install(&self, session: &SandboxSession) -> Result<()> {
        let start = std::time::Instant::now();
        tracing::info!(command = %self.install, "Installing dependencies");
        let process = session.spawn(ProcessKind::Install, &self.install).await?;
        let exit_code = process.wait().await?;

        if exit_code != 0 {
            let output = process.output_text();
            let lines: Vec<&str> = output.lines().collect();
            let tail = lines[lines.len().saturating_sub(INSTALL_TAIL_LINES)..].join("\n");
            tracing::warn!(
                exit_code,
                elapsed_ms = start.elapsed().as_millis() as u64,
                output_tail = %tail,
                "Dependency install failed"
            );
            return Err(CoreError::InstallFailure { exit_code });
        }

        tracing::info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Dependencies installed"
        );
        Ok(())
    }

    /// Spawn the dev server and return immediately.
    pub async fn run_dev_server(&self, session: &SandboxSession) -> Result<ProcessHandle> {
        tracing::info!(command = %self.dev, "Starting dev server");
        session.spawn(ProcessKind::Dev, &self.dev).await
    }

    /// Wait for the dev server to announce itself using this orchestrator's
    /// probe and timeout.
    pub async fn await_ready(&self, process: &ProcessHandle) -> Result<String> {
        await_readiness(process, self.probe.as_ref(), self.ready_timeout).await
    }

    /// Install, spawn the dev server and wait until it is ready.
    pub async fn start(&self, session: &SandboxSession) -> Result<DevServer> {
        self.run_install(session).await?;
        let process = self.run_dev_server(session).await?;
        let url = self.await_ready(&process).await?;
        Ok(DevServer { process, url })
    }
}

/// Accumulate `process` output until `probe` matches.
///
/// The buffer is never cleared, so a signal split across chunks is still
/// found. A clean end of output counts as a line break after the last
/// chunk. Exactly one outcome is produced: the URL, `ReadinessTimeout`, or
/// the stream error (`StreamClosed` / `Stream`) if output ends first.
pub async fn await_readiness(
    process: &ProcessHandle,
    probe: &dyn ReadinessProbe,
    timeout: Duration,
) -> Result<String> {
    let start = std::time::Instant::now();
    let mut output = process.subscribe();
    let mut buffer: Vec<u8> = Vec::new();

    let watch = async {
        while let Some(event) = output.recv().await {
            match event {
                OutputEvent::Chunk(chunk) => {
                    buffer.extend_from_slice(&chunk);
                    if let Some(url) = probe.detect(&String::from_utf8_lossy(&buffer)) {
                        return Ok(url);
                    }
                }
                OutputEvent::Closed => break,
                OutputEvent::Failed(msg) => return Err(CoreError::Stream(msg)),
            }
        }
        // end of output terminates a trailing, unterminated line
        let mut text = String::from_utf8_lossy(&buffer).into_owned();
        text.push('\n');
        probe.detect(&text).ok_or(CoreError::StreamClosed)
    };

    match tokio::time::timeout(timeout, watch).await {
        Ok(Ok(url)) => {
            tracing::info!(
                process_id = %process.id(),
                url = %url,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Dev server ready"
            );
            Ok(url)
        }
        Ok(Err(e)) => {
            tracing::warn!(process_id = %process.id(), error = %e, "Dev server output ended before readiness");
            Err(e)
        }
        Err(_) => {
            tracing::warn!(process_id = %process.id(), timeout_ms = timeout.as_millis() as u64, "Dev server readiness timed out");
            Err(CoreError::ReadinessTimeout(timeout))
        }
    }
}
