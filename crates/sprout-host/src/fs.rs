//! Materializing mount trees on the host file system.

use sprout_core::{CoreError, EntryKind, MountTree, Result};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

/// Resolve a tree path under `root`.
///
/// Absolute paths and `..` components are rejected so nothing escapes the
/// instance directory.
pub(crate) fn resolve(root: &Path, path: &str) -> Result<PathBuf> {
    let relative = Path::new(path);
    let mut resolved = root.to_path_buf();
    let mut depth = 0;

    for component in relative.components() {
        match component {
            Component::Normal(segment) => {
                resolved.push(segment);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(CoreError::Mount(format!("'{}' escapes the sandbox root", path)))
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(CoreError::Mount(format!("'{}' must be relative", path)))
            }
        }
    }

    if depth == 0 {
        return Err(CoreError::Mount("empty path".into()));
    }
    Ok(resolved)
}

/// Reject trees where a file path is also used as a directory.
pub(crate) fn check_collisions(tree: &MountTree) -> Result<()> {
    let files: HashSet<&str> = tree.files().map(|f| f.path.as_str()).collect();

    for dir in tree.directories() {
        if files.contains(dir.path.as_str()) {
            return Err(CoreError::Mount(format!(
                "'{}' is both a file and a directory",
                dir.path
            )));
        }
    }
    for file in tree.files() {
        let mut ancestor = file.path.as_str();
        while let Some((parent, _)) = ancestor.rsplit_once('/') {
            if files.contains(parent) {
                return Err(CoreError::Mount(format!(
                    "'{}' is nested under file '{}'",
                    file.path, parent
                )));
            }
            ancestor = parent;
        }
    }
    Ok(())
}

/// Write `tree` under `root`: directories in tree order, then files.
pub(crate) async fn materialize(root: &Path, tree: &MountTree) -> Result<()> {
    check_collisions(tree)?;

    for entry in tree.entries() {
        let target = resolve(root, &entry.path)?;
        let written = match entry.kind {
            EntryKind::Directory => tokio::fs::create_dir_all(&target).await,
            EntryKind::File => tokio::fs::write(&target, entry.contents.as_bytes()).await,
        };
        written.map_err(|e| {
            CoreError::Mount(format!("failed to write {} '{}': {}", entry.kind, entry.path, e))
        })?;
        tracing::trace!(path = %entry.path, kind = %entry.kind, "Mounted entry");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sprout_core::{Scaffold, VfsBuilder};

    fn tree(files: Vec<(&str, serde_json::Value)>) -> MountTree {
        VfsBuilder::new(Scaffold::empty()).build(files)
    }

    #[test]
    fn test_resolve_relative() {
        let root = Path::new("/srv/sandbox");
        assert_eq!(
            resolve(root, "src/App.jsx").unwrap(),
            PathBuf::from("/srv/sandbox/src/App.jsx")
        );
        assert_eq!(
            resolve(root, "./index.html").unwrap(),
            PathBuf::from("/srv/sandbox/index.html")
        );
    }

    #[test]
    fn test_resolve_rejects_escape() {
        let root = Path::new("/srv/sandbox");
        assert!(matches!(resolve(root, "../etc/passwd"), Err(CoreError::Mount(_))));
        assert!(matches!(resolve(root, "src/../../x"), Err(CoreError::Mount(_))));
        assert!(matches!(resolve(root, "/etc/passwd"), Err(CoreError::Mount(_))));
        assert!(matches!(resolve(root, "."), Err(CoreError::Mount(_))));
    }

    #[test]
    fn test_collision_file_and_directory() {
        let t = tree(vec![("src", json!("oops")), ("src/main.jsx", json!("x"))]);
        let err = check_collisions(&t).unwrap_err();
        assert!(err.to_string().contains("'src' is both a file and a directory"));
    }

    #[test]
    fn test_no_collision() {
        let t = tree(vec![("src/a.js", json!("a")), ("src/lib/b.js", json!("b"))]);
        assert!(check_collisions(&t).is_ok());
    }

    #[tokio::test]
    async fn test_materialize_writes_tree() {
        let dir = tempfile::tempdir().unwrap();
        let t = tree(vec![
            ("src/components/Button.jsx", json!("export const Button = 1")),
            ("README.md", json!("# hi")),
        ]);

        materialize(dir.path(), &t).await.unwrap();

        assert!(dir.path().join("src/components").is_dir());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("src/components/Button.jsx")).unwrap(),
            "export const Button = 1"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("README.md")).unwrap(),
            "# hi"
        );
    }
}
