//! Search/replace patch engine.
//!
//! Edits are anchored by exact text. An anchor that matches zero times
//! or more than once refuses the edit and leaves the file untouched;
//! there is no fuzzy fallback. Batches validate every target path
//! before touching any file, then apply each edit independently so one
//! bad anchor does not sink the rest of the change set.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::paths::resolve_in_root;

/// A single operation against one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum EditOp {
    /// Replace the unique occurrence of `old_string` with `new_string`.
    Replace {
        old_string: String,
        new_string: String,
    },
    /// Splice `insert` on its own line after the line containing the
    /// unique occurrence of `marker`.
    InsertAfter { marker: String, insert: String },
    /// Splice `insert` on its own line before the line containing the
    /// unique occurrence of `marker`.
    InsertBefore { marker: String, insert: String },
}

impl EditOp {
    /// The anchor text this operation searches for.
    pub fn anchor(&self) -> &str {
        match self {
            EditOp::Replace { old_string, .. } => old_string,
            EditOp::InsertAfter { marker, .. } | EditOp::InsertBefore { marker, .. } => marker,
        }
    }
}

/// An edit bound to a file path relative to the project root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEdit {
    pub path: PathBuf,
    #[serde(flatten)]
    pub op: EditOp,
}

/// A file to create. Creation refuses to overwrite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewFile {
    pub path: PathBuf,
    pub content: String,
}

/// Everything one generated proposal wants to do to the tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    #[serde(default)]
    pub new_files: Vec<NewFile>,
    #[serde(default)]
    pub edits: Vec<FileEdit>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.new_files.is_empty() && self.edits.is_empty()
    }

    /// Every path the change set touches, new files first.
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.new_files
            .iter()
            .map(|f| f.path.as_path())
            .chain(self.edits.iter().map(|e| e.path.as_path()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PatchErrorKind {
    /// Target file does not exist.
    FileNotFound,
    /// Anchor matched zero times.
    NotFound,
    /// Anchor matched more than once; carries the match count.
    Ambiguous(usize),
    /// Empty anchor text.
    EmptyTarget,
    /// New file already exists.
    AlreadyExists,
    /// Path failed confinement checks.
    InvalidPath,
    Io,
}

#[derive(Debug, Clone)]
pub struct PatchError {
    pub kind: PatchErrorKind,
    pub message: String,
}

impl PatchError {
    fn new(kind: PatchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for PatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for PatchError {}

enum MatchRange {
    None,
    One { start: usize, end: usize },
    Many(usize),
}

fn find_unique_match(content: &str, needle: &str) -> MatchRange {
    let matches = content.match_indices(needle).collect::<Vec<_>>();
    match matches.len() {
        0 => MatchRange::None,
        1 => {
            let (start, matched) = matches[0];
            MatchRange::One {
                start,
                end: start + matched.len(),
            }
        }
        n => MatchRange::Many(n),
    }
}

fn truncate_for_error(s: &str) -> String {
    const MAX: usize = 120;
    if s.chars().count() <= MAX {
        return s.to_string();
    }
    let head: String = s.chars().take(MAX).collect();
    format!("{}...", head)
}

/// Apply one operation to `content`, returning the new content.
pub fn apply_op(content: &str, op: &EditOp) -> Result<String, PatchError> {
    if op.anchor().is_empty() {
        return Err(PatchError::new(
            PatchErrorKind::EmptyTarget,
            "Anchor text is empty; provide the exact text to match",
        ));
    }

    match op {
        EditOp::Replace {
            old_string,
            new_string,
        } => match find_unique_match(content, old_string) {
            MatchRange::One { start, end } => {
                let mut out = content.to_string();
                out.replace_range(start..end, new_string);
                Ok(out)
            }
            MatchRange::Many(count) => Err(PatchError::new(
                PatchErrorKind::Ambiguous(count),
                format!(
                    "old_string matches {} times (must be unique). Searched for: {:?}",
                    count,
                    truncate_for_error(old_string)
                ),
            )),
            MatchRange::None => Err(PatchError::new(
                PatchErrorKind::NotFound,
                format!(
                    "old_string not found. Searched for: {:?}",
                    truncate_for_error(old_string)
                ),
            )),
        },
        EditOp::InsertAfter { marker, insert } => {
            let (_, line_end) = locate_marker_line(content, marker)?;
            let mut out = String::with_capacity(content.len() + insert.len() + 1);
            out.push_str(&content[..line_end]);
            if !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(insert);
            if !insert.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&content[line_end..]);
            Ok(out)
        }
        EditOp::InsertBefore { marker, insert } => {
            let (line_start, _) = locate_marker_line(content, marker)?;
            let mut out = String::with_capacity(content.len() + insert.len() + 1);
            out.push_str(&content[..line_start]);
            out.push_str(insert);
            if !insert.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&content[line_start..]);
            Ok(out)
        }
    }
}

/// Byte range of the line containing the unique marker match. The end
/// is just past the terminating newline, or at EOF for the last line.
fn locate_marker_line(content: &str, marker: &str) -> Result<(usize, usize), PatchError> {
    let (start, end) = match find_unique_match(content, marker) {
        MatchRange::One { start, end } => (start, end),
        MatchRange::Many(count) => {
            return Err(PatchError::new(
                PatchErrorKind::Ambiguous(count),
                format!(
                    "marker matches {} times (must be unique). Searched for: {:?}",
                    count,
                    truncate_for_error(marker)
                ),
            ));
        }
        MatchRange::None => {
            return Err(PatchError::new(
                PatchErrorKind::NotFound,
                format!(
                    "marker not found. Searched for: {:?}",
                    truncate_for_error(marker)
                ),
            ));
        }
    };

    let line_start = content[..start].rfind('\n').map(|i| i + 1).unwrap_or(0);
    let line_end = content[end..]
        .find('\n')
        .map(|i| end + i + 1)
        .unwrap_or(content.len());
    Ok((line_start, line_end))
}

/// Apply one operation to the file at `absolute`, rewriting it in place.
fn apply_to_file(absolute: &Path, op: &EditOp) -> Result<(), PatchError> {
    let content = match std::fs::read_to_string(absolute) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(PatchError::new(
                PatchErrorKind::FileNotFound,
                format!("File not found: {}", absolute.display()),
            ));
        }
        Err(e) => {
            return Err(PatchError::new(
                PatchErrorKind::Io,
                format!("Failed to read {}: {}", absolute.display(), e),
            ));
        }
    };

    let updated = apply_op(&content, op)?;
    std::fs::write(absolute, updated).map_err(|e| {
        PatchError::new(
            PatchErrorKind::Io,
            format!("Failed to write {}: {}", absolute.display(), e),
        )
    })
}

/// One failed entry from a batch apply.
#[derive(Debug, Clone, Serialize)]
pub struct EditFailure {
    pub path: PathBuf,
    pub error: String,
}

/// Outcome of applying a whole change set.
#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
    pub files_created: Vec<PathBuf>,
    pub files_edited: Vec<PathBuf>,
    pub errors: Vec<EditFailure>,
}

impl ApplyReport {
    pub fn success(&self) -> bool {
        self.errors.is_empty()
    }

    /// All touched paths, relative to the root, without duplicates.
    pub fn touched_paths(&self) -> Vec<PathBuf> {
        let mut out = Vec::new();
        for p in self.files_created.iter().chain(self.files_edited.iter()) {
            if !out.contains(p) {
                out.push(p.clone());
            }
        }
        out
    }

    pub fn error_summary(&self) -> String {
        self.errors
            .iter()
            .map(|f| format!("{}: {}", f.path.display(), f.error))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Apply a change set under `root`.
///
/// Every path is confined to `root` before any file is touched; a
/// single bad path rejects the whole batch. After that, new files are
/// written first, then edits, each independently. Per-entry failures
/// land in the report instead of aborting the rest.
pub fn apply_changes(changes: &ChangeSet, root: &Path) -> Result<ApplyReport, PatchError> {
    for path in changes.paths() {
        if let Err(e) = resolve_in_root(root, path) {
            return Err(PatchError::new(PatchErrorKind::InvalidPath, e));
        }
    }

    let mut report = ApplyReport::default();

    for new_file in &changes.new_files {
        let resolved = resolve_in_root(root, &new_file.path)
            .map_err(|e| PatchError::new(PatchErrorKind::InvalidPath, e))?;
        match write_new_file(&resolved.absolute, &new_file.content) {
            Ok(()) => {
                tracing::debug!(path = %resolved.relative.display(), "created file");
                report.files_created.push(resolved.relative);
            }
            Err(e) => report.errors.push(EditFailure {
                path: new_file.path.clone(),
                error: e.to_string(),
            }),
        }
    }

    for edit in &changes.edits {
        let resolved = resolve_in_root(root, &edit.path)
            .map_err(|e| PatchError::new(PatchErrorKind::InvalidPath, e))?;
        match apply_to_file(&resolved.absolute, &edit.op) {
            Ok(()) => {
                tracing::debug!(path = %resolved.relative.display(), "edited file");
                if !report.files_edited.contains(&resolved.relative) {
                    report.files_edited.push(resolved.relative);
                }
            }
            Err(e) => report.errors.push(EditFailure {
                path: edit.path.clone(),
                error: e.to_string(),
            }),
        }
    }

    Ok(report)
}

fn write_new_file(absolute: &Path, content: &str) -> Result<(), PatchError> {
    if absolute.exists() {
        return Err(PatchError::new(
            PatchErrorKind::AlreadyExists,
            format!(
                "File already exists, refusing to overwrite: {}",
                absolute.display()
            ),
        ));
    }
    if let Some(parent) = absolute.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            PatchError::new(
                PatchErrorKind::Io,
                format!("Failed to create {}: {}", parent.display(), e),
            )
        })?;
    }
    std::fs::write(absolute, content).map_err(|e| {
        PatchError::new(
            PatchErrorKind::Io,
            format!("Failed to write {}: {}", absolute.display(), e),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replace(old: &str, new: &str) -> EditOp {
        EditOp::Replace {
            old_string: old.to_string(),
            new_string: new.to_string(),
        }
    }

    #[test]
    fn replaces_unique_match() {
        let out = apply_op("fn main() {\n    old();\n}\n", &replace("old()", "new()")).unwrap();
        assert_eq!(out, "fn main() {\n    new();\n}\n");
    }

    #[test]
    fn refuses_ambiguous_match_unchanged() {
        let content = "x = 1\nx = 1\n";
        let err = apply_op(content, &replace("x = 1", "x = 2")).unwrap_err();
        assert_eq!(err.kind, PatchErrorKind::Ambiguous(2));
    }

    #[test]
    fn refuses_missing_match() {
        let err = apply_op("abc\n", &replace("zzz", "yyy")).unwrap_err();
        assert_eq!(err.kind, PatchErrorKind::NotFound);
    }

    #[test]
    fn refuses_empty_anchor() {
        let err = apply_op("abc\n", &replace("", "yyy")).unwrap_err();
        assert_eq!(err.kind, PatchErrorKind::EmptyTarget);
    }

    #[test]
    fn matching_is_byte_exact() {
        // Different whitespace is a different string. No trimmed fallback.
        let err = apply_op("    let a = 1;\n", &replace("let a = 1 ;", "let a = 2;")).unwrap_err();
        assert_eq!(err.kind, PatchErrorKind::NotFound);
    }

    #[test]
    fn insert_after_splices_below_marker_line() {
        let content = "line one\nline two\nline three\n";
        let op = EditOp::InsertAfter {
            marker: "line two".to_string(),
            insert: "inserted".to_string(),
        };
        let out = apply_op(content, &op).unwrap();
        assert_eq!(out, "line one\nline two\ninserted\nline three\n");
    }

    #[test]
    fn insert_before_splices_above_marker_line() {
        let content = "line one\nline two\n";
        let op = EditOp::InsertBefore {
            marker: "line two".to_string(),
            insert: "inserted".to_string(),
        };
        let out = apply_op(content, &op).unwrap();
        assert_eq!(out, "line one\ninserted\nline two\n");
    }

    #[test]
    fn insert_after_last_line_without_trailing_newline() {
        let content = "line one\nline two";
        let op = EditOp::InsertAfter {
            marker: "line two".to_string(),
            insert: "inserted".to_string(),
        };
        let out = apply_op(content, &op).unwrap();
        assert_eq!(out, "line one\nline two\ninserted\n");
    }

    #[test]
    fn insert_refuses_ambiguous_marker() {
        let content = "a\nb\na\n";
        let op = EditOp::InsertAfter {
            marker: "a".to_string(),
            insert: "x".to_string(),
        };
        let err = apply_op(content, &op).unwrap_err();
        assert_eq!(err.kind, PatchErrorKind::Ambiguous(2));
    }

    fn write(root: &Path, rel: &str, content: &str) {
        let p = root.join(rel);
        std::fs::create_dir_all(p.parent().unwrap()).unwrap();
        std::fs::write(p, content).unwrap();
    }

    #[test]
    fn batch_applies_independently_and_collects_failures() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", "hello a\n");
        write(dir.path(), "b.txt", "hello b\n");

        let changes = ChangeSet {
            new_files: vec![],
            edits: vec![
                FileEdit {
                    path: PathBuf::from("a.txt"),
                    op: replace("hello a", "bye a"),
                },
                FileEdit {
                    path: PathBuf::from("b.txt"),
                    op: replace("no such text", "x"),
                },
            ],
        };

        let report = apply_changes(&changes, dir.path()).unwrap();
        assert!(!report.success());
        assert_eq!(report.files_edited, vec![PathBuf::from("a.txt")]);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].path, PathBuf::from("b.txt"));
        // The good edit still landed.
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "bye a\n");
        assert_eq!(std::fs::read_to_string(dir.path().join("b.txt")).unwrap(), "hello b\n");
    }

    #[test]
    fn batch_rejects_bad_path_before_touching_anything() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", "hello\n");

        let changes = ChangeSet {
            new_files: vec![],
            edits: vec![
                FileEdit {
                    path: PathBuf::from("a.txt"),
                    op: replace("hello", "bye"),
                },
                FileEdit {
                    path: PathBuf::from("../escape.txt"),
                    op: replace("x", "y"),
                },
            ],
        };

        let err = apply_changes(&changes, dir.path()).unwrap_err();
        assert_eq!(err.kind, PatchErrorKind::InvalidPath);
        // Nothing was applied, including the valid edit.
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "hello\n");
    }

    #[test]
    fn new_file_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "exists.txt", "original\n");

        let changes = ChangeSet {
            new_files: vec![NewFile {
                path: PathBuf::from("exists.txt"),
                content: "clobbered\n".to_string(),
            }],
            edits: vec![],
        };

        let report = apply_changes(&changes, dir.path()).unwrap();
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].error.contains("refusing to overwrite"));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("exists.txt")).unwrap(),
            "original\n"
        );
    }

    #[test]
    fn new_file_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let changes = ChangeSet {
            new_files: vec![NewFile {
                path: PathBuf::from("skills/weather/scripts/weather_api.py"),
                content: "print('hi')\n".to_string(),
            }],
            edits: vec![],
        };

        let report = apply_changes(&changes, dir.path()).unwrap();
        assert!(report.success());
        assert_eq!(
            report.files_created,
            vec![PathBuf::from("skills/weather/scripts/weather_api.py")]
        );
        assert!(dir.path().join("skills/weather/scripts/weather_api.py").exists());
    }

    #[test]
    fn edit_on_missing_file_reports_file_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let changes = ChangeSet {
            new_files: vec![],
            edits: vec![FileEdit {
                path: PathBuf::from("missing.txt"),
                op: replace("a", "b"),
            }],
        };
        let report = apply_changes(&changes, dir.path()).unwrap();
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].error.contains("File not found"));
    }

    #[test]
    fn sequential_edits_to_same_file_see_earlier_results() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", "one\n");
        let changes = ChangeSet {
            new_files: vec![],
            edits: vec![
                FileEdit {
                    path: PathBuf::from("a.txt"),
                    op: replace("one", "two"),
                },
                FileEdit {
                    path: PathBuf::from("a.txt"),
                    op: replace("two", "three"),
                },
            ],
        };
        let report = apply_changes(&changes, dir.path()).unwrap();
        assert!(report.success(), "{}", report.error_summary());
        assert_eq!(report.files_edited, vec![PathBuf::from("a.txt")]);
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "three\n");
    }
}
