//! Run configuration types.

use crate::error::CoreError;
use crate::readiness::MarkerProbe;
use std::fmt;
use std::time::Duration;

/// A program plus its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program to run.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<String>,
}

impl CommandSpec {
    /// Create a command from a program and arguments.
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Split a command line on whitespace. No quoting is supported.
    pub fn parse(line: &str) -> Self {
        let mut parts = line.split_whitespace();
        let program = parts.next().unwrap_or_default().to_string();
        Self {
            program,
            args: parts.map(str::to_string).collect(),
        }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Configuration for a single project run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Dependency install command (default: `npm install`).
    pub install: CommandSpec,
    /// Dev server command (default: `npm run dev`).
    pub dev: CommandSpec,
    /// Token printed by the dev server right before its URL (default: `Network:`).
    pub ready_marker: String,
    /// How long to wait for the dev server to announce itself (default: 10s).
    pub ready_timeout: Duration,
    /// Seed the default project scaffold under the caller's files (default: true).
    pub scaffold: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            install: CommandSpec::new("npm", ["install"]),
            dev: CommandSpec::new("npm", ["run", "dev"]),
            ready_marker: "Network:".to_string(),
            ready_timeout: Duration::from_millis(10_000),
            scaffold: true,
        }
    }
}

impl RunConfig {
    /// Create a new config builder.
    pub fn builder() -> RunConfigBuilder {
        RunConfigBuilder::default()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.install.program.is_empty() {
            return Err(CoreError::Config("install command is required".into()));
        }
        if self.dev.program.is_empty() {
            return Err(CoreError::Config("dev command is required".into()));
        }
        if self.ready_timeout.is_zero() {
            return Err(CoreError::Config("ready_timeout must be > 0".into()));
        }
        MarkerProbe::new(&self.ready_marker)?;
        Ok(())
    }
}

/// Builder for RunConfig.
#[derive(Debug, Default)]
pub struct RunConfigBuilder {
    config: RunConfig,
}

impl RunConfigBuilder {
    /// Set the install command.
    pub fn install(mut self, command: CommandSpec) -> Self {
        self.config.install = command;
        self
    }

    /// Set the dev server command.
    pub fn dev(mut self, command: CommandSpec) -> Self {
        self.config.dev = command;
        self
    }

    /// Set the readiness marker token.
    pub fn ready_marker(mut self, marker: impl Into<String>) -> Self {
        self.config.ready_marker = marker.into();
        self
    }

    /// Set the readiness timeout.
    pub fn ready_timeout(mut self, timeout: Duration) -> Self {
        self.config.ready_timeout = timeout;
        self
    }

    /// Enable or disable the default scaffold.
    pub fn scaffold(mut self, enabled: bool) -> Self {
        self.config.scaffold = enabled;
        self
    }

    /// Build the configuration, validating all fields.
    pub fn build(self) -> Result<RunConfig, CoreError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
