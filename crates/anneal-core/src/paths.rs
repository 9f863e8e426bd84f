//! Path confinement for edit targets.
//!
//! Every path in a change set is relative to the project root. Anything
//! that could step outside the root (absolute paths, `..` components,
//! symlinks anywhere along the way) is rejected before a single byte is
//! written.

use std::path::{Component, Path, PathBuf};

/// A candidate path that passed confinement checks.
#[derive(Debug)]
pub struct RootedPath {
    pub absolute: PathBuf,
    pub relative: PathBuf,
}

/// Resolve `candidate` inside `root`, allowing the final component to
/// not exist yet (new files are created by the patch engine).
pub fn resolve_in_root(root: &Path, candidate: &Path) -> Result<RootedPath, String> {
    if candidate.as_os_str().is_empty() {
        return Err("Path is empty".to_string());
    }
    if candidate.is_absolute() {
        return Err(format!(
            "Absolute paths are not allowed: {}",
            candidate.display()
        ));
    }
    if candidate
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(format!(
            "Parent traversal is not allowed: {}",
            candidate.display()
        ));
    }

    let root = root
        .canonicalize()
        .map_err(|e| format!("Failed to resolve project root: {}", e))?;
    let joined = root.join(candidate);
    let parent = joined
        .parent()
        .ok_or_else(|| format!("Invalid path: {}", candidate.display()))?;
    let parent_canon = canonicalize_existing_parent(parent)?;

    if !parent_canon.starts_with(&root) {
        return Err(format!(
            "Path escapes project root: {}",
            candidate.display()
        ));
    }

    if let Ok(metadata) = std::fs::symlink_metadata(&joined) {
        if metadata.file_type().is_symlink() {
            return Err(format!(
                "Symlinks are not allowed: {}",
                candidate.display()
            ));
        }
    }

    let mut check_path = joined.clone();
    while check_path.starts_with(&root) && check_path != root {
        if let Ok(metadata) = std::fs::symlink_metadata(&check_path) {
            if metadata.file_type().is_symlink() {
                return Err(format!("Path contains symlink: {}", check_path.display()));
            }
        }
        if !check_path.pop() {
            break;
        }
    }

    let relative = joined
        .strip_prefix(&root)
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|_| candidate.to_path_buf());

    Ok(RootedPath {
        absolute: joined,
        relative,
    })
}

fn canonicalize_existing_parent(path: &Path) -> Result<PathBuf, String> {
    let mut current = path.to_path_buf();
    while !current.exists() {
        if !current.pop() {
            return Err("Path has no existing parent".to_string());
        }
    }
    current
        .canonicalize()
        .map_err(|e| format!("Failed to resolve path {}: {}", current.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_relative_path_inside_root() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = resolve_in_root(dir.path(), Path::new("skills/weather/SKILL.md")).unwrap();
        assert!(resolved.absolute.starts_with(dir.path().canonicalize().unwrap()));
        assert_eq!(resolved.relative, Path::new("skills/weather/SKILL.md"));
    }

    #[test]
    fn rejects_absolute_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_in_root(dir.path(), Path::new("/etc/passwd")).unwrap_err();
        assert!(err.contains("Absolute paths"));
    }

    #[test]
    fn rejects_parent_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_in_root(dir.path(), Path::new("skills/../../escape.txt")).unwrap_err();
        assert!(err.contains("Parent traversal"));
    }

    #[test]
    fn rejects_empty_path() {
        let dir = tempfile::tempdir().unwrap();
        assert!(resolve_in_root(dir.path(), Path::new("")).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn rejects_symlink_target() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();
        let err = resolve_in_root(dir.path(), Path::new("link")).unwrap_err();
        assert!(err.contains("Symlinks"), "{}", err);
    }

    #[cfg(unix)]
    #[test]
    fn rejects_symlink_in_the_middle() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();
        let err = resolve_in_root(dir.path(), Path::new("link/file.txt")).unwrap_err();
        assert!(err.contains("escapes") || err.contains("symlink"), "{}", err);
    }
}
