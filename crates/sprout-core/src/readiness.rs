//! Dev server readiness detection.
//!
//! A [`ReadinessProbe`] is a predicate over everything a process has printed
//! so far. The orchestrator re-tests the whole accumulated buffer after each
//! chunk, so a probe may match text that spans chunk boundaries.

use crate::error::CoreError;
use regex::Regex;
use std::borrow::Cow;
use std::sync::OnceLock;

/// Decides whether accumulated output announces a listening server.
pub trait ReadinessProbe: Send + Sync {
    /// Return the server URL once `buffer` contains the readiness signal.
    fn detect(&self, buffer: &str) -> Option<String>;
}

impl<F> ReadinessProbe for F
where
    F: Fn(&str) -> Option<String> + Send + Sync,
{
    fn detect(&self, buffer: &str) -> Option<String> {
        self(buffer)
    }
}

/// Matches a marker token followed by a `scheme://host[:port]` URL.
///
/// The URL is only accepted once it is terminated by `/` or whitespace, so
/// an address cut in half by a chunk boundary is never reported early. When
/// output ends, [`await_readiness`](crate::await_readiness) supplies the
/// final line break itself.
/// ANSI escape sequences are ignored.
#[derive(Debug, Clone)]
pub struct MarkerProbe {
    marker: String,
    pattern: Regex,
}

impl MarkerProbe {
    /// Build a probe for the given marker token.
    pub fn new(marker: &str) -> Result<Self, CoreError> {
        let marker = marker.trim();
        if marker.is_empty() {
            return Err(CoreError::Config("readiness marker is required".into()));
        }
        let pattern = format!(
            r"{}\s*([A-Za-z][A-Za-z0-9+.\-]*://[^\s/]+)[/\s]",
            regex::escape(marker)
        );
        let pattern = Regex::new(&pattern)
            .map_err(|e| CoreError::Config(format!("invalid readiness marker: {e}")))?;
        Ok(Self {
            marker: marker.to_string(),
            pattern,
        })
    }

    /// Vite's LAN address line (`Network: http://...`).
    pub fn vite_network() -> Self {
        Self::new("Network:").expect("static marker is valid")
    }

    /// Vite's loopback address line (`Local: http://...`).
    pub fn vite_local() -> Self {
        Self::new("Local:").expect("static marker is valid")
    }

    /// The marker token this probe looks for.
    pub fn marker(&self) -> &str {
        &self.marker
    }
}

impl ReadinessProbe for MarkerProbe {
    fn detect(&self, buffer: &str) -> Option<String> {
        let text = strip_ansi(buffer);
        self.pattern
            .captures(&text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    }
}

/// Remove CSI and OSC escape sequences.
pub fn strip_ansi(text: &str) -> Cow<'_, str> {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    let ansi = ANSI.get_or_init(|| {
        Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)")
            .expect("ANSI pattern is valid")
    });
    ansi.replace_all(text, "")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_probe_matches_network_line() {
        let probe = MarkerProbe::vite_network();
        let out = "Starting...\n  ➜  Network: http://203.0.113.5:5173/\n";
        assert_eq!(probe.detect(out).as_deref(), Some("http://203.0.113.5:5173"));
    }

    #[test]
    fn test_marker_probe_requires_terminated_url() {
        let probe = MarkerProbe::vite_network();
        assert_eq!(probe.detect("Network: http://203.0"), None);
        assert_eq!(
            probe.detect("Network: http://203.0.113.5:5173\n").as_deref(),
            Some("http://203.0.113.5:5173")
        );
    }

    #[test]
    fn test_marker_probe_ignores_ansi_colours() {
        let probe = MarkerProbe::vite_local();
        let out = "  \x1b[32m➜\x1b[39m  \x1b[1mLocal\x1b[22m:   \x1b[36mhttp://localhost:\x1b[1m5173\x1b[22m/\x1b[39m\n";
        assert_eq!(probe.detect(out).as_deref(), Some("http://localhost:5173"));
    }

    #[test]
    fn test_marker_probe_first_match_wins() {
        let probe = MarkerProbe::new("Ready on").unwrap();
        let out = "Ready on https://a.test:1 \nReady on https://b.test:2\n";
        assert_eq!(probe.detect(out).as_deref(), Some("https://a.test:1"));
    }

    #[test]
    fn test_marker_probe_escapes_marker() {
        let probe = MarkerProbe::new("url(*):").unwrap();
        assert_eq!(
            probe.detect("url(*): http://h:1\n").as_deref(),
            Some("http://h:1")
        );
        assert_eq!(probe.detect("url: http://h:1\n"), None);
    }

    #[test]
    fn test_marker_probe_rejects_empty_marker() {
        assert!(matches!(MarkerProbe::new(""), Err(CoreError::Config(_))));
    }

    #[test]
    fn test_closure_probe() {
        fn listening(buf: &str) -> Option<String> {
            buf.contains("listening").then(|| "http://x:1".to_string())
        }
        let probe = listening;
        assert_eq!(probe.detect("now listening"), Some("http://x:1".to_string()));
        assert_eq!(probe.detect("booting"), None);
    }
}
