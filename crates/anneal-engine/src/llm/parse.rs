//! Strict parsing of model output into a change proposal.
//!
//! The model is asked for a single JSON object. We tolerate markdown
//! fences and prose around the object, but the object itself must
//! parse as-is: no repair passes, no partial salvage. A response that
//! does not parse is a recoverable generation failure, never something
//! to guess at.

use std::path::PathBuf;

use serde::Deserialize;

use anneal_core::patch::{ChangeSet, EditOp, FileEdit, NewFile};

/// A generated change plus the metadata the pipelines need to decide
/// whether and how to apply it.
#[derive(Debug, Clone)]
pub struct ChangeProposal {
    pub analysis: String,
    pub summary: String,
    pub commit_message: Option<String>,
    pub changes: ChangeSet,
    pub confidence: f32,
}

impl ChangeProposal {
    /// A proposal is worth applying only when the model is confident
    /// enough and actually produced changes.
    pub fn is_actionable(&self, min_confidence: f32) -> bool {
        self.confidence >= min_confidence && !self.changes.is_empty()
    }
}

#[derive(Deserialize)]
struct ProposalJson {
    #[serde(default)]
    analysis: String,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    commit_message: Option<String>,
    #[serde(default)]
    new_files: Vec<NewFileJson>,
    #[serde(default)]
    edits: Vec<EditJson>,
    #[serde(default)]
    confidence: f32,
}

#[derive(Deserialize)]
struct NewFileJson {
    path: String,
    content: String,
}

#[derive(Deserialize)]
struct EditJson {
    path: String,
    #[serde(default)]
    old_string: Option<String>,
    #[serde(default)]
    new_string: Option<String>,
    #[serde(default)]
    marker: Option<String>,
    #[serde(default)]
    insert: Option<String>,
    /// "before" or "after"; defaults to "after" for marker edits.
    #[serde(default)]
    position: Option<String>,
}

/// Parse raw model output into a proposal. Any structural problem is
/// an error; the caller treats it as "no usable proposal".
pub fn parse_proposal(raw: &str) -> anyhow::Result<ChangeProposal> {
    let clean = strip_markdown_fences(raw);
    let fragment = extract_json_fragment(clean, '{', '}')
        .ok_or_else(|| anyhow::anyhow!("No JSON object found in model response"))?;

    let parsed: ProposalJson = serde_json::from_str(fragment)
        .map_err(|e| anyhow::anyhow!("Model response is not valid JSON: {}", e))?;

    let mut new_files = Vec::with_capacity(parsed.new_files.len());
    for (i, file) in parsed.new_files.into_iter().enumerate() {
        if file.path.trim().is_empty() {
            return Err(anyhow::anyhow!("new_files[{}]: path is empty", i));
        }
        new_files.push(NewFile {
            path: PathBuf::from(file.path.trim()),
            content: file.content,
        });
    }

    let mut edits = Vec::with_capacity(parsed.edits.len());
    for (i, edit) in parsed.edits.into_iter().enumerate() {
        if edit.path.trim().is_empty() {
            return Err(anyhow::anyhow!("edits[{}]: path is empty", i));
        }
        let path = PathBuf::from(edit.path.trim());

        let op = match (edit.old_string, edit.new_string, edit.marker, edit.insert) {
            (Some(old_string), Some(new_string), None, None) => EditOp::Replace {
                old_string,
                new_string,
            },
            (None, None, Some(marker), Some(insert)) => {
                match edit.position.as_deref().unwrap_or("after") {
                    "after" => EditOp::InsertAfter { marker, insert },
                    "before" => EditOp::InsertBefore { marker, insert },
                    other => {
                        return Err(anyhow::anyhow!(
                            "edits[{}]: unknown position {:?} (expected \"before\" or \"after\")",
                            i,
                            other
                        ));
                    }
                }
            }
            _ => {
                return Err(anyhow::anyhow!(
                    "edits[{}]: expected either old_string/new_string or marker/insert",
                    i
                ));
            }
        };

        edits.push(FileEdit { path, op });
    }

    Ok(ChangeProposal {
        analysis: parsed.analysis,
        summary: parsed.summary,
        commit_message: parsed.commit_message,
        changes: ChangeSet { new_files, edits },
        confidence: parsed.confidence,
    })
}

fn strip_markdown_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let clean = if trimmed.starts_with("```json") {
        trimmed.strip_prefix("```json").unwrap_or(trimmed)
    } else if trimmed.starts_with("```") {
        trimmed.strip_prefix("```").unwrap_or(trimmed)
    } else {
        trimmed
    };
    let clean = if clean.ends_with("```") {
        clean.strip_suffix("```").unwrap_or(clean)
    } else {
        clean
    };
    clean.trim()
}

/// Extract a balanced fragment between matching delimiters, ignoring
/// delimiters inside strings.
fn extract_json_fragment(text: &str, open: char, close: char) -> Option<&str> {
    let mut depth = 0;
    let mut in_string = false;
    let mut escape_next = false;
    let mut start_idx = None;

    for (i, c) in text.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }

        if c == '\\' && in_string {
            escape_next = true;
            continue;
        }

        if c == '"' {
            in_string = !in_string;
            continue;
        }

        if in_string {
            continue;
        }

        if c == open {
            if depth == 0 {
                start_idx = Some(i);
            }
            depth += 1;
        } else if c == close {
            depth -= 1;
            if depth == 0 {
                if let Some(start) = start_idx {
                    return Some(&text[start..=i]);
                }
            }
        }
    }

    None
}
