//! Skill directory layout and the write whitelist.
//!
//! A skill lives at `<skills_dir>/<name>/` with a `SKILL.md` doc and a
//! script at `scripts/<name>_api.py` (hyphens become underscores in
//! the script name). Generated changes may only touch the skills tree
//! and the agent source tree.

use std::path::{Path, PathBuf};

use crate::patch::ChangeSet;

pub const SKILL_DOC: &str = "SKILL.md";

/// Skill names become directory names, so anything path-like is out.
pub fn is_valid_skill_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

pub fn skill_dir(skills_dir: &Path, skill: &str) -> PathBuf {
    skills_dir.join(skill)
}

pub fn skill_doc_path(skills_dir: &Path, skill: &str) -> PathBuf {
    skill_dir(skills_dir, skill).join(SKILL_DOC)
}

pub fn skill_script_path(skills_dir: &Path, skill: &str) -> PathBuf {
    let script = format!("{}_api.py", skill.replace('-', "_"));
    skill_dir(skills_dir, skill).join("scripts").join(script)
}

/// Check that every path in the change set stays under one of the
/// allowed root directories (all relative to the project root).
pub fn check_paths_allowed(changes: &ChangeSet, allowed: &[PathBuf]) -> Result<(), String> {
    for path in changes.paths() {
        let ok = allowed.iter().any(|root| path.starts_with(root));
        if !ok {
            let roots = allowed
                .iter()
                .map(|r| r.display().to_string())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(format!(
                "Path not allowed: {} (must be under {})",
                path.display(),
                roots
            ));
        }
    }
    Ok(())
}
