//! Configuration for the runner.
//!
//! Configuration is loaded from environment variables with sensible defaults.

use sprout_core::{CommandSpec, CoreError, RunConfig};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the `sprout` runner.
#[derive(Debug, Clone)]
pub struct CliConfig {
    /// Directory holding instance directories.
    pub workdir: PathBuf,

    /// Dependency install command.
    pub install: CommandSpec,

    /// Dev server command.
    pub dev: CommandSpec,

    /// Token printed by the dev server right before its URL.
    pub ready_marker: String,

    /// How long to wait for the dev server.
    pub ready_timeout: Duration,

    /// Seed the default Vite + React scaffold (default: true).
    pub scaffold: bool,
}

impl Default for CliConfig {
    fn default() -> Self {
        let run = RunConfig::default();
        Self {
            workdir: PathBuf::from("/tmp/sprout"),
            install: run.install,
            dev: run.dev,
            ready_marker: run.ready_marker,
            ready_timeout: run.ready_timeout,
            scaffold: run.scaffold,
        }
    }
}

impl CliConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `SPROUT_WORKDIR` | `/tmp/sprout` |
    /// | `SPROUT_INSTALL_CMD` | `npm install` |
    /// | `SPROUT_DEV_CMD` | `npm run dev` |
    /// | `SPROUT_READY_MARKER` | `Network:` |
    /// | `SPROUT_READY_TIMEOUT_MS` | `10000` |
    /// | `SPROUT_SCAFFOLD` | `true` (`false` or `0` disables) |
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            workdir: std::env::var("SPROUT_WORKDIR")
                .map(PathBuf::from)
                .unwrap_or(default.workdir),
            install: std::env::var("SPROUT_INSTALL_CMD")
                .map(|v| CommandSpec::parse(&v))
                .unwrap_or(default.install),
            dev: std::env::var("SPROUT_DEV_CMD")
                .map(|v| CommandSpec::parse(&v))
                .unwrap_or(default.dev),
            ready_marker: std::env::var("SPROUT_READY_MARKER").unwrap_or(default.ready_marker),
            ready_timeout: std::env::var("SPROUT_READY_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(default.ready_timeout),
            scaffold: std::env::var("SPROUT_SCAFFOLD")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(default.scaffold),
        }
    }

    /// Build the validated run configuration.
    pub fn run_config(&self) -> Result<RunConfig, CoreError> {
        RunConfig::builder()
            .install(self.install.clone())
            .dev(self.dev.clone())
            .ready_marker(self.ready_marker.clone())
            .ready_timeout(self.ready_timeout)
            .scaffold(self.scaffold)
            .build()
    }

    /// Validate configuration but only log warnings instead of failing.
    pub fn validate_warn(&self) {
        if let Some(parent) = self.workdir.parent() {
            if !parent.exists() {
                tracing::warn!("Workdir parent not found: {:?}", parent);
            }
        }

        if let Err(e) = self.run_config() {
            tracing::warn!(error = %e, "Run configuration is invalid");
        }
    }
}
