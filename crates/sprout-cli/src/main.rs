//! Sprout runner entry point.
//!
//! Loads a `path -> content` JSON manifest, provisions it in a host
//! sandbox, waits for the dev server and then bridges its console to this
//! terminal. Logs go to stderr; stdout is the terminal surface.
//!
//! ```text
//! sprout <manifest.json>
//! ```

mod config;
mod manifest;
mod terminal;

use config::CliConfig;
use sprout_core::{IoBridge, LifecycleManager};
use sprout_host::HostProvider;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing - logs go to stderr (stdout is the terminal surface)
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("sprout=info".parse()?))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let Some(manifest_path) = std::env::args_os().nth(1).map(PathBuf::from) else {
        eprintln!("usage: sprout <manifest.json>");
        std::process::exit(2);
    };

    let config = CliConfig::from_env();
    tracing::info!(?config, "Configuration loaded");
    config.validate_warn();

    let files = manifest::load(&manifest_path).await?;
    let provider = Arc::new(HostProvider::new(&config.workdir));
    let manager = LifecycleManager::new(provider, config.run_config()?)?;
    let bridge = Arc::new(IoBridge::new(Arc::new(terminal::StdoutTerminal::stdout())));

    let outcome = tokio::select! {
        result = manager.run(files) => match result {
            Ok(outcome) => outcome,
            Err(failure) => {
                bridge.close().await;
                manager.shutdown().await;
                return Err(failure.into());
            }
        },
        _ = signal::ctrl_c() => {
            tracing::info!("Interrupted before the dev server was ready");
            bridge.close().await;
            manager.shutdown().await;
            return Ok(());
        }
    };

    eprintln!("Preview ready at {}", outcome.url);
    bridge.attach(outcome.process.clone()).await?;
    let input = tokio::spawn(forward_stdin(Arc::clone(&bridge)));

    tokio::select! {
        _ = signal::ctrl_c() => {
            tracing::info!("Received shutdown signal, cleaning up...");
        }
        exit = outcome.process.wait() => match exit {
            Ok(code) => tracing::info!(exit_code = code, "Dev server exited"),
            Err(e) => tracing::warn!(error = %e, "Dev server ended"),
        },
        _ = refit_on_resize(Arc::clone(&bridge)) => {}
    }

    input.abort();
    let failures = bridge.close().await;
    manager.shutdown().await;
    tracing::info!(cleanup_failures = failures, "Shutdown complete");

    // the stdin reader may still be parked in a blocking read
    std::process::exit(0);
}

/// Forward local stdin bytes to the attached process.
async fn forward_stdin(bridge: Arc<IoBridge>) {
    let mut stdin = tokio::io::stdin();
    let mut buf = [0u8; 1024];
    loop {
        match stdin.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!("Local stdin closed");
                break;
            }
            Ok(n) => {
                if let Err(e) = bridge.input(&buf[..n]) {
                    tracing::warn!(error = %e, "Terminal input dropped");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read local stdin");
                break;
            }
        }
    }
}

/// Refit the surface whenever the controlling terminal is resized.
#[cfg(unix)]
async fn refit_on_resize(bridge: Arc<IoBridge>) {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::window_change()) {
        Ok(mut winch) => {
            while winch.recv().await.is_some() {
                bridge.resize();
            }
        }
        Err(e) => tracing::warn!(error = %e, "Resize notifications unavailable"),
    }
    std::future::pending::<()>().await
}

#[cfg(not(unix))]
async fn refit_on_resize(_bridge: Arc<IoBridge>) {
    std::future::pending::<()>().await
}
