//! Run lifecycle: teardown, rebuild, publish.
//!
//! Each run tears down whatever the previous run left behind, then builds
//! the mount tree, boots (or joins a boot), mounts, installs, starts the
//! dev server and waits for readiness. A failure at any step tears the
//! partial session down and surfaces as a single [`RunFailure`]. Only
//! successful runs are published to subscribers.

use crate::config::RunConfig;
use crate::error::{CoreError, Result};
use crate::orchestrator::ProcessOrchestrator;
use crate::process::ProcessHandle;
use crate::provider::{InstanceId, SandboxProvider};
use crate::readiness::ReadinessProbe;
use crate::session::{SandboxSession, SessionState};
use crate::vfs::{MountTree, Scaffold, VfsBuilder};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex};

/// Step at which a run aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStage {
    /// Booting the sandbox instance
    Boot,
    /// Writing the mount tree
    Mount,
    /// Installing dependencies
    Install,
    /// Spawning the dev server
    DevServer,
    /// Waiting for the dev server address
    Readiness,
    /// Superseded by a shutdown
    Cancelled,
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStage::Boot => write!(f, "sandbox boot"),
            RunStage::Mount => write!(f, "mount"),
            RunStage::Install => write!(f, "install"),
            RunStage::DevServer => write!(f, "dev server"),
            RunStage::Readiness => write!(f, "readiness"),
            RunStage::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A run that did not reach readiness. `Display` is the user-facing message.
#[derive(Debug, Error)]
#[error("{stage}: {error}")]
pub struct RunFailure {
    /// Where the run stopped.
    pub stage: RunStage,
    /// What stopped it.
    #[source]
    pub error: CoreError,
}

impl RunFailure {
    fn at(stage: RunStage) -> impl FnOnce(CoreError) -> Self {
        move |error| Self { stage, error }
    }

    fn cancelled() -> Self {
        Self {
            stage: RunStage::Cancelled,
            error: CoreError::Cancelled,
        }
    }
}

/// A dev server that came up. Published to subscribers.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Session owning the instance. Shared with the manager.
    pub session: SandboxSession,
    /// Instance the project runs in.
    pub instance_id: InstanceId,
    /// The active dev server, for terminal attachment.
    pub process: ProcessHandle,
    /// Preview address.
    pub url: String,
}

/// Coordinates teardown-then-rebuild across runs.
pub struct LifecycleManager {
    session: SandboxSession,
    vfs: VfsBuilder,
    orchestrator: ProcessOrchestrator,
    run_gate: Mutex<()>,
    epoch: AtomicU64,
    published: watch::Sender<Option<RunOutcome>>,
}

impl LifecycleManager {
    /// Create a manager over a provider.
    pub fn new(provider: Arc<dyn SandboxProvider>, config: RunConfig) -> Result<Self> {
        let orchestrator = ProcessOrchestrator::new(&config)?;
        let scaffold = if config.scaffold {
            Scaffold::vite_react()
        } else {
            Scaffold::empty()
        };
        let (published, _) = watch::channel(None);

        Ok(Self {
            session: SandboxSession::new(provider),
            vfs: VfsBuilder::new(scaffold),
            orchestrator,
            run_gate: Mutex::new(()),
            epoch: AtomicU64::new(0),
            published,
        })
    }

    /// Use a different readiness probe for every run.
    pub fn with_probe(mut self, probe: Arc<dyn ReadinessProbe>) -> Self {
        self.orchestrator = self.orchestrator.with_probe(probe);
        self
    }

    /// The session this manager drives.
    pub fn session(&self) -> &SandboxSession {
        &self.session
    }

    /// Watch the last successful run.
    pub fn subscribe(&self) -> watch::Receiver<Option<RunOutcome>> {
        self.published.subscribe()
    }

    /// The last successful run, if any.
    pub fn current(&self) -> Option<RunOutcome> {
        self.published.borrow().clone()
    }

    /// Provision and start a project from a raw `path -> content` map.
    ///
    /// Runs are serialized; a run queued behind another starts only once
    /// the earlier one has finished. A shutdown issued while the run is
    /// pending or in flight turns its result into a `Cancelled` failure.
    pub async fn run<I, K>(&self, files: I) -> std::result::Result<RunOutcome, RunFailure>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: AsRef<str>,
    {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let tree = self.vfs.build(files);

        let _gate = self.run_gate.lock().await;
        if self.epoch.load(Ordering::SeqCst) != epoch {
            tracing::debug!("Run dropped, shutdown requested while queued");
            return Err(RunFailure::cancelled());
        }

        if matches!(
            self.session.state(),
            SessionState::Ready | SessionState::Booting
        ) {
            tracing::info!("Tearing down previous run");
            self.session.teardown().await;
        }

        let start = std::time::Instant::now();
        let result = self.provision(&tree).await;

        match result {
            Ok(outcome) => {
                let published = self.published.send_if_modified(|current| {
                    if self.epoch.load(Ordering::SeqCst) != epoch {
                        return false;
                    }
                    *current = Some(outcome.clone());
                    true
                });
                if !published {
                    tracing::info!(sandbox_id = %outcome.instance_id, "Discarding run finished after shutdown");
                    self.session.teardown().await;
                    return Err(RunFailure::cancelled());
                }
                tracing::info!(
                    sandbox_id = %outcome.instance_id,
                    url = %outcome.url,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Run ready"
                );
                Ok(outcome)
            }
            Err(failure) => {
                self.session.teardown().await;
                if self.epoch.load(Ordering::SeqCst) != epoch {
                    tracing::debug!(stage = %failure.stage, "Run abandoned after shutdown");
                    return Err(RunFailure::cancelled());
                }
                tracing::error!(
                    stage = %failure.stage,
                    error = %failure.error,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Run failed"
                );
                Err(failure)
            }
        }
    }

    async fn provision(&self, tree: &MountTree) -> std::result::Result<RunOutcome, RunFailure> {
        let instance = self
            .session
            .get_or_create()
            .await
            .map_err(RunFailure::at(RunStage::Boot))?;
        self.session
            .mount(tree)
            .await
            .map_err(RunFailure::at(RunStage::Mount))?;
        self.orchestrator
            .run_install(&self.session)
            .await
            .map_err(RunFailure::at(RunStage::Install))?;
        let process = self
            .orchestrator
            .run_dev_server(&self.session)
            .await
            .map_err(RunFailure::at(RunStage::DevServer))?;
        let url = self
            .orchestrator
            .await_ready(&process)
            .await
            .map_err(RunFailure::at(RunStage::Readiness))?;

        Ok(RunOutcome {
            session: self.session.clone(),
            instance_id: instance.id(),
            process,
            url,
        })
    }

    /// Tear everything down without waiting for an in-flight run.
    ///
    /// The published outcome is cleared. A run still in flight settles with
    /// a `Cancelled` failure.
    pub async fn shutdown(&self) {
        self.published.send_modify(|current| {
            self.epoch.fetch_add(1, Ordering::SeqCst);
            *current = None;
        });
        tracing::info!("Shutting down");
        self.session.teardown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedProcess, ScriptedProvider};
    use serde_json::json;

    fn ready_provider() -> ScriptedProvider {
        ScriptedProvider::new()
            .script("npm install", ScriptedProcess::new().chunk("added 3 packages\n").exit(0))
            .script(
                "npm run dev",
                ScriptedProcess::new()
                    .chunk("  VITE v5.0.0  ready in 300 ms\n")
                    .chunk("  Network: http://203.0.113.5:5173/\n")
                    .hold_open(),
            )
    }

    fn manager(provider: &ScriptedProvider) -> LifecycleManager {
        LifecycleManager::new(Arc::new(provider.clone()), RunConfig::default()).unwrap()
    }

    fn files() -> Vec<(&'static str, Value)> {
        vec![
            ("src/App.jsx", json!("export default function App() { return null }")),
            ("src/main.jsx", json!({"file": {"contents": "import App from './App'"}})),
        ]
    }

    #[tokio::test]
    async fn test_run_publishes_outcome() {
        let provider = ready_provider();
        let m = manager(&provider);
        let mut updates = m.subscribe();

        let outcome = m.run(files()).await.unwrap();
        assert_eq!(outcome.url, "http://203.0.113.5:5173");
        assert_eq!(provider.spawns(), vec!["npm install", "npm run dev"]);

        let mounts = provider.mounts();
        assert_eq!(mounts.len(), 1);
        assert!(mounts[0].file("package.json").is_some());
        assert!(mounts[0].file("src/main.jsx").is_some());

        assert!(updates.has_changed().unwrap());
        let published = updates.borrow_and_update().clone().unwrap();
        assert_eq!(published.url, outcome.url);
        assert_eq!(published.instance_id, outcome.instance_id);
        assert_eq!(published.session.state(), SessionState::Ready);
        assert_eq!(published.session.instance_id(), Some(outcome.instance_id));
    }

    #[tokio::test]
    async fn test_install_failure_tears_down() {
        let provider = ScriptedProvider::new().script(
            "npm install",
            ScriptedProcess::new().chunk("npm ERR! code E404\n").exit(1),
        );
        let m = manager(&provider);

        let failure = m.run(files()).await.err().unwrap();
        assert_eq!(failure.stage, RunStage::Install);
        assert_eq!(
            failure.to_string(),
            "install: failed to install dependencies (exit code 1)"
        );
        assert_eq!(provider.spawns(), vec!["npm install"]);
        assert_eq!(provider.teardowns(), 1);
        assert_eq!(m.session().state(), SessionState::TornDown);
        assert!(m.current().is_none());
    }

    #[tokio::test]
    async fn test_mount_failure_never_installs() {
        let provider = ready_provider();
        provider.reject_mount();
        let m = manager(&provider);

        let failure = m.run(files()).await.err().unwrap();
        assert_eq!(failure.stage, RunStage::Mount);
        assert!(matches!(failure.error, CoreError::Mount(_)));
        assert!(provider.spawns().is_empty());
        assert_eq!(provider.teardowns(), 1);
    }

    #[tokio::test]
    async fn test_boot_failure_surfaces() {
        let provider = ready_provider();
        provider.fail_next_boots(1);
        let m = manager(&provider);

        let failure = m.run(files()).await.err().unwrap();
        assert_eq!(failure.stage, RunStage::Boot);

        // next run boots again
        m.run(files()).await.unwrap();
        assert_eq!(provider.boots(), 2);
    }

    #[tokio::test]
    async fn test_failure_keeps_last_success() {
        let provider = ready_provider();
        let m = manager(&provider);
        let first = m.run(files()).await.unwrap();

        provider.clone().script(
            "npm install",
            ScriptedProcess::new().chunk("boom\n").exit(2),
        );
        let failure = m.run(files()).await.err().unwrap();
        assert!(matches!(failure.error, CoreError::InstallFailure { exit_code: 2 }));

        let current = m.current().unwrap();
        assert_eq!(current.instance_id, first.instance_id);
        assert_eq!(current.url, first.url);
        assert_eq!(provider.teardowns(), 2);
    }

    #[tokio::test]
    async fn test_second_run_replaces_first() {
        let provider = ready_provider();
        let m = manager(&provider);

        let first = m.run(files()).await.unwrap();
        let second = m.run(files()).await.unwrap();

        assert_ne!(first.instance_id, second.instance_id);
        assert_eq!(provider.boots(), 2);
        assert_eq!(provider.teardowns(), 1);
        // the first dev server was killed with its instance
        assert!(matches!(first.process.wait().await, Err(CoreError::Cancelled)));
        assert_eq!(m.current().unwrap().instance_id, second.instance_id);
    }

    #[tokio::test]
    async fn test_shutdown_during_boot_cancels_run() {
        let provider = ready_provider();
        provider.close_gate();
        let m = Arc::new(manager(&provider));

        let run = {
            let m = Arc::clone(&m);
            tokio::spawn(async move { m.run(files()).await })
        };
        while provider.boots() == 0 {
            tokio::task::yield_now().await;
        }

        m.shutdown().await;
        provider.open_gate();

        let failure = run.await.unwrap().err().unwrap();
        assert_eq!(failure.stage, RunStage::Cancelled);
        assert!(m.current().is_none());
        assert_eq!(m.session().state(), SessionState::TornDown);
        assert!(provider.spawns().is_empty());

        // the orphaned instance is still released
        while provider.teardowns() == 0 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_shutdown_after_run_clears_outcome() {
        let provider = ready_provider();
        let m = manager(&provider);
        let outcome = m.run(files()).await.unwrap();

        m.shutdown().await;
        assert!(m.current().is_none());
        assert_eq!(provider.teardowns(), 1);
        assert!(matches!(outcome.process.wait().await, Err(CoreError::Cancelled)));

        // a fresh run after shutdown works
        m.run(files()).await.unwrap();
        assert_eq!(provider.boots(), 2);
    }

    #[test]
    fn test_run_stage_display() {
        assert_eq!(RunStage::Boot.to_string(), "sandbox boot");
        assert_eq!(RunStage::DevServer.to_string(), "dev server");
        assert_eq!(RunStage::Cancelled.to_string(), "cancelled");
    }
}
