//! Virtual filesystem builder.
//!
//! Turns the loosely-typed `path -> content` map handed over by the code
//! generator into a [`MountTree`]: every entry coerced to text, merged over
//! the scaffold defaults, and preceded by one directory entry per ancestor
//! path so that parents always exist before their children are written.
//!
//! Everything here is a pure function of its input. Malformed entries are
//! coerced to a best-effort text form or dropped, never reported.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Kind of a mount tree entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    /// Regular file with text contents.
    File,
    /// Directory; contents are always empty.
    Directory,
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File => write!(f, "file"),
            Self::Directory => write!(f, "directory"),
        }
    }
}

/// A single entry of a manifest or mount tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Slash-separated relative path, unique within its container.
    pub path: String,
    /// Text contents (empty for directories).
    pub contents: String,
    /// Whether this is a file or a directory.
    pub kind: EntryKind,
}

impl FileEntry {
    /// Create a file entry.
    pub fn file(path: impl Into<String>, contents: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
            kind: EntryKind::File,
        }
    }

    /// Create a directory entry.
    pub fn directory(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            contents: String::new(),
            kind: EntryKind::Directory,
        }
    }

    /// Number of `/` separators in the path.
    pub fn depth(&self) -> usize {
        depth(&self.path)
    }
}

/// Project files keyed by path. No two entries share a path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectManifest {
    entries: BTreeMap<String, FileEntry>,
}

impl ProjectManifest {
    /// Insert a file, replacing any previous entry at the same path.
    pub fn insert(&mut self, path: impl Into<String>, contents: impl Into<String>) {
        let path = path.into();
        self.entries
            .insert(path.clone(), FileEntry::file(path, contents));
    }

    /// Look up an entry by path.
    pub fn get(&self, path: &str) -> Option<&FileEntry> {
        self.entries.get(path)
    }

    /// Iterate over all paths in ascending order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Iterate over all entries in path order.
    pub fn iter(&self) -> impl Iterator<Item = &FileEntry> {
        self.entries.values()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the manifest holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Manifest plus synthesized directories, ready for the sandbox provider.
///
/// Directory entries come first, shallowest first; file entries follow in
/// path order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MountTree {
    entries: Vec<FileEntry>,
}

impl MountTree {
    /// All entries in materialization order.
    pub fn entries(&self) -> &[FileEntry] {
        &self.entries
    }

    /// Directory entries, parents before children.
    pub fn directories(&self) -> impl Iterator<Item = &FileEntry> {
        self.entries
            .iter()
            .filter(|e| e.kind == EntryKind::Directory)
    }

    /// File entries.
    pub fn files(&self) -> impl Iterator<Item = &FileEntry> {
        self.entries.iter().filter(|e| e.kind == EntryKind::File)
    }

    /// Look up a file entry by path.
    pub fn file(&self, path: &str) -> Option<&FileEntry> {
        self.files().find(|e| e.path == path)
    }

    /// Total number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the tree holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize for providers that take the tree over the wire.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a tree produced by [`to_json`](Self::to_json).
    ///
    /// Entries are taken as given; ordering is not re-derived.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Default project files seeded under the caller's files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scaffold {
    files: BTreeMap<String, String>,
}

impl Default for Scaffold {
    fn default() -> Self {
        Self::vite_react()
    }
}

impl Scaffold {
    /// A scaffold that seeds nothing.
    pub fn empty() -> Self {
        Self {
            files: BTreeMap::new(),
        }
    }

    /// Minimal Vite + React project: `package.json`, `vite.config.js` and
    /// `index.html` loading `/src/main.jsx`.
    pub fn vite_react() -> Self {
        let package = serde_json::json!({
            "name": "generated-app",
            "private": true,
            "type": "module",
            "scripts": {
                "dev": "vite --host",
                "build": "vite build",
                "preview": "vite preview"
            },
            "dependencies": {
                "react": "^18.2.0",
                "react-dom": "^18.2.0",
                "@vitejs/plugin-react": "^4.2.1",
                "vite": "^5.0.8"
            }
        });
        // json! values always serialize
        let package = serde_json::to_string_pretty(&package).unwrap_or_default();

        Self::empty()
            .with_file("package.json", package)
            .with_file("vite.config.js", VITE_CONFIG)
            .with_file("index.html", INDEX_HTML)
    }

    /// Add or replace a scaffold file.
    pub fn with_file(mut self, path: impl AsRef<str>, contents: impl Into<String>) -> Self {
        if let Some(path) = clean_path(path.as_ref()) {
            self.files.insert(path, contents.into());
        }
        self
    }

    /// Scaffold paths in ascending order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }
}

const VITE_CONFIG: &str = r#"import { defineConfig } from 'vite';
import react from '@vitejs/plugin-react';

export default defineConfig({
  plugins: [react()],
  server: {
    hmr: true,
    port: 5173,
    host: true
  }
});"#;

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
  <head>
    <meta charset="UTF-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1.0" />
    <title>Generated App</title>
  </head>
  <body>
    <div id="root"></div>
    <script type="module" src="/src/main.jsx"></script>
  </body>
</html>"#;

/// Builds mount trees over a fixed scaffold.
#[derive(Debug, Clone, Default)]
pub struct VfsBuilder {
    scaffold: Scaffold,
}

impl VfsBuilder {
    /// Create a builder seeding the given scaffold.
    pub fn new(scaffold: Scaffold) -> Self {
        Self { scaffold }
    }

    /// The scaffold seeded under every build.
    pub fn scaffold(&self) -> &Scaffold {
        &self.scaffold
    }

    /// Build the mount tree for a raw `path -> content` map.
    ///
    /// Deterministic for identical input.
    pub fn build<I, K>(&self, raw: I) -> MountTree
    where
        I: IntoIterator<Item = (K, Value)>,
        K: AsRef<str>,
    {
        let manifest = merge(&self.scaffold, normalize(raw));
        let directories = order(derive_directories(manifest.paths()));

        let mut entries = Vec::with_capacity(directories.len() + manifest.len());
        entries.extend(directories.into_iter().map(FileEntry::directory));
        entries.extend(manifest.entries.into_values());

        tracing::debug!(
            entries = entries.len(),
            files = entries.iter().filter(|e| e.kind == EntryKind::File).count(),
            "Built mount tree"
        );
        MountTree { entries }
    }
}

/// Coerce every raw entry to text, dropping falsy and empty ones.
///
/// Strings pass through, `{"file": {"contents": ..}}` objects are unwrapped,
/// anything else is pretty-printed as JSON. Paths are cleaned of leading
/// `/` and `./` segments. Idempotent.
pub fn normalize<I, K>(raw: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (K, Value)>,
    K: AsRef<str>,
{
    let mut out = BTreeMap::new();
    for (path, value) in raw {
        let Some(path) = clean_path(path.as_ref()) else {
            tracing::trace!(path = %path.as_ref(), "Dropping entry with empty path");
            continue;
        };
        match coerce(value) {
            Some(text) if !text.is_empty() => {
                out.insert(path, text);
            }
            _ => tracing::trace!(path = %path, "Dropping empty entry"),
        }
    }
    out
}

/// Overlay normalized files on the scaffold; caller files win.
pub fn merge(scaffold: &Scaffold, normalized: BTreeMap<String, String>) -> ProjectManifest {
    let mut manifest = ProjectManifest::default();
    for (path, contents) in &scaffold.files {
        manifest.insert(path.clone(), contents.clone());
    }
    for (path, contents) in normalized {
        manifest.insert(path, contents);
    }
    manifest
}

/// Every proper ancestor of every multi-segment path, exactly once.
pub fn derive_directories<'a, I>(paths: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut directories = BTreeSet::new();
    for path in paths {
        let mut end = 0;
        while let Some(offset) = path[end..].find('/') {
            end += offset;
            directories.insert(path[..end].to_string());
            end += 1;
        }
    }
    directories
}

/// Sort directories by segment depth (ties by path) so that no directory
/// follows one of its descendants.
pub fn order(directories: BTreeSet<String>) -> Vec<String> {
    let mut ordered: Vec<String> = directories.into_iter().collect();
    ordered.sort_by(|a, b| depth(a).cmp(&depth(b)).then_with(|| a.cmp(b)));
    ordered
}

fn depth(path: &str) -> usize {
    path.matches('/').count()
}

/// Drop empty and `.` segments; `None` when nothing is left.
fn clean_path(path: &str) -> Option<String> {
    let cleaned = path
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/");
    (!cleaned.is_empty()).then_some(cleaned)
}

fn coerce(value: Value) -> Option<String> {
    match value {
        Value::Null | Value::Bool(false) => None,
        Value::Number(n) if n.as_f64() == Some(0.0) => None,
        Value::String(s) => Some(s),
        Value::Object(mut map) if map.get("file").is_some_and(Value::is_object) => {
            match map.remove("file") {
                Some(Value::Object(mut file)) => match file.remove("contents")? {
                    Value::String(s) => Some(s),
                    Value::Null => None,
                    other => pretty(&other),
                },
                _ => None,
            }
        }
        other => pretty(&other),
    }
}

fn pretty(value: &Value) -> Option<String> {
    serde_json::to_string_pretty(value).ok()
}
