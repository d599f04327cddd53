//! Terminal surface backed by a local byte sink.

use sprout_core::{CoreError, Result, TerminalSurface};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Resets colours and shows the cursor again.
const RESET: &[u8] = b"\x1b[0m\x1b[?25h";

/// Surface that writes process output straight to a writer.
///
/// The invoking terminal reflows on its own, so a refit only flushes.
pub struct WriterTerminal<W: Write + Send> {
    out: Mutex<W>,
    disposed: AtomicBool,
}

/// The runner's surface.
pub type StdoutTerminal = WriterTerminal<std::io::Stdout>;

impl StdoutTerminal {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> WriterTerminal<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
            disposed: AtomicBool::new(false),
        }
    }

    fn with_out<T>(&self, f: impl FnOnce(&mut W) -> std::io::Result<T>) -> Result<T> {
        let mut out = self
            .out
            .lock()
            .map_err(|_| CoreError::Teardown("terminal writer poisoned".into()))?;
        Ok(f(&mut *out)?)
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.out
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<W: Write + Send + 'static> TerminalSurface for WriterTerminal<W> {
    fn write(&self, data: &[u8]) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.with_out(|out| {
            out.write_all(data)?;
            out.flush()
        })
    }

    fn fit(&self) -> Result<()> {
        tracing::debug!("Terminal refit");
        self.with_out(|out| out.flush())
    }

    fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.with_out(|out| {
            out.write_all(RESET)?;
            out.flush()
        })
    }
}
