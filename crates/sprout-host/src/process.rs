//! Child process spawning for host instances.
//!
//! Stdout and stderr are read in fixed-size chunks by two reader tasks and
//! merged into one output stream in arrival order.
//!
//! On unix each child leads its own process group, and a kill signals the
//! whole group so grandchildren (`npm` -> `sh` -> `node`) go down with it.

use bytes::Bytes;
use futures::{FutureExt, StreamExt};
use sprout_core::{CommandSpec, CoreError, Result, SpawnedProcess};
use std::io;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};

/// Read size for process output.
const CHUNK_SIZE: usize = 8 * 1024;

/// Spawn `command` in `dir`.
///
/// The child and its process group are killed when `kill` flips to `true`
/// or its sender is dropped. The exit future then resolves with `Cancelled`.
pub(crate) fn spawn(
    dir: &Path,
    command: &CommandSpec,
    kill: watch::Receiver<bool>,
) -> Result<SpawnedProcess> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .current_dir(dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .map_err(|e| CoreError::Spawn {
            command: command.to_string(),
            message: e.to_string(),
        })?;
    let pid = child.id();
    tracing::debug!(command = %command, pid = ?pid, "Spawned child");

    let (Some(stdin), Some(stdout), Some(stderr)) =
        (child.stdin.take(), child.stdout.take(), child.stderr.take())
    else {
        return Err(CoreError::Spawn {
            command: command.to_string(),
            message: "child stdio was not captured".into(),
        });
    };

    let (tx, rx) = mpsc::unbounded_channel();
    read_chunks(stdout, tx.clone());
    read_chunks(stderr, tx);
    let output = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
    .boxed();

    let exit = async move {
        tokio::select! {
            status = child.wait() => match status {
                Ok(status) => {
                    let code = status.code().unwrap_or(-1);
                    tracing::debug!(pid = ?pid, exit_code = code, "Child exited");
                    Ok(code)
                }
                Err(e) => Err(CoreError::Io(e)),
            },
            _ = killed(kill) => {
                kill_group(pid);
                if let Err(e) = child.kill().await {
                    tracing::warn!(pid = ?pid, error = %e, "Failed to kill child");
                }
                tracing::debug!(pid = ?pid, "Child killed");
                Err(CoreError::Cancelled)
            }
        }
    }
    .boxed();

    Ok(SpawnedProcess {
        stdin: Box::new(stdin),
        output,
        exit,
    })
}

/// SIGKILL every process in the group led by `pid`.
#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid else {
        return;
    };
    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) => tracing::debug!(pgid = pid, "Process group killed"),
        Err(e) => tracing::warn!(pgid = pid, error = %e, "Failed to kill process group"),
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

async fn killed(mut kill: watch::Receiver<bool>) {
    let _ = kill.wait_for(|k| *k).await;
}

fn read_chunks<R>(mut reader: R, tx: mpsc::UnboundedSender<io::Result<Bytes>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e));
                    break;
                }
            }
        }
    });
}
