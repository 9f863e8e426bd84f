//! Change generation: build prompts from the live tree, run the model,
//! parse the result.
//!
//! Generation always happens after the operator has approved a
//! request; nothing here runs speculatively. Prompts carry whole file
//! contents (capped for pathological sizes) because the edit engine
//! needs anchors copied verbatim from what the model saw.

use std::path::Path;
use std::sync::Arc;

use anneal_adapters::config::Settings;
use anneal_core::ports::CodeModel;
use anneal_core::request::ErrorFixRequest;
use anneal_core::skills;

use crate::llm::parse::{parse_proposal, ChangeProposal};

// Whole files go into the prompt; this cap only kicks in for files
// that would blow the context.
const MAX_FILE_CHARS: usize = 20000;
const MAX_SURVEY_DOC_CHARS: usize = 500;
const MAX_AGENT_CONTEXT_FILES: usize = 8;

const FIX_SYSTEM: &str = "\
You are a code repair assistant for a small automation agent. You receive a \
runtime error and the source files involved, and you respond with a single \
JSON object describing the fix:

{
  \"analysis\": \"what went wrong and why\",
  \"summary\": \"one-line description of the fix\",
  \"commit_message\": \"imperative commit message\",
  \"new_files\": [{\"path\": \"...\", \"content\": \"...\"}],
  \"edits\": [
    {\"path\": \"...\", \"old_string\": \"exact text\", \"new_string\": \"replacement\"},
    {\"path\": \"...\", \"marker\": \"exact line\", \"insert\": \"new line\", \"position\": \"after\"}
  ],
  \"confidence\": 0.0
}

Rules:
- old_string and marker must be copied verbatim from the provided files and \
must match exactly once. Include surrounding lines to make them unique.
- Paths are relative to the project root and must stay inside the skills or \
agent directories.
- Keep the diff minimal. Do not refactor.
- If you cannot identify a safe fix, return empty edits and new_files, \
explain in analysis, and set confidence low.
- Respond with the JSON object only.";

const CAPABILITY_SYSTEM: &str = "\
You are a skill author for a small automation agent. You receive a user's \
capability request and a survey of the existing skills, and you respond with \
a single JSON object describing the new or extended skill:

{
  \"analysis\": \"how the request maps onto the skill layout\",
  \"summary\": \"one-line description of the change\",
  \"commit_message\": \"imperative commit message\",
  \"new_files\": [{\"path\": \"...\", \"content\": \"...\"}],
  \"edits\": [
    {\"path\": \"...\", \"old_string\": \"exact text\", \"new_string\": \"replacement\"},
    {\"path\": \"...\", \"marker\": \"exact line\", \"insert\": \"new line\", \"position\": \"after\"}
  ],
  \"confidence\": 0.0
}

Rules:
- A skill lives at <skills>/<name>/ with a SKILL.md and a script under \
scripts/. Follow the conventions visible in the survey.
- Paths are relative to the project root and must stay inside the skills or \
agent directories.
- old_string and marker must be copied verbatim from provided file contents \
and must match exactly once.
- If the request is unclear or out of scope, return empty edits and \
new_files, explain in analysis, and set confidence low.
- Respond with the JSON object only.";

pub struct ChangeGenerator {
    model: Arc<dyn CodeModel>,
    settings: Settings,
}

impl ChangeGenerator {
    pub fn new(model: Arc<dyn CodeModel>, settings: Settings) -> Self {
        Self { model, settings }
    }

    /// Generate a fix proposal for a runtime failure. `Ok(None)` means
    /// the model answered but not with a usable proposal.
    pub async fn error_fix(&self, request: &ErrorFixRequest) -> anyhow::Result<Option<ChangeProposal>> {
        let prompt = self.error_fix_prompt(request);
        let raw = self.model.complete(FIX_SYSTEM, &prompt).await?;
        match parse_proposal(&raw) {
            Ok(proposal) => Ok(Some(proposal)),
            Err(e) => {
                tracing::warn!(request_id = %request.request_id, error = %e, "fix proposal did not parse");
                Ok(None)
            }
        }
    }

    /// Generate a skill change for an approved capability request.
    pub async fn capability(&self, user_request: &str) -> anyhow::Result<Option<ChangeProposal>> {
        let prompt = self.capability_prompt(user_request);
        let raw = self.model.complete(CAPABILITY_SYSTEM, &prompt).await?;
        match parse_proposal(&raw) {
            Ok(proposal) => Ok(Some(proposal)),
            Err(e) => {
                tracing::warn!(error = %e, "capability proposal did not parse");
                Ok(None)
            }
        }
    }

    fn error_fix_prompt(&self, request: &ErrorFixRequest) -> String {
        let mut sections = Vec::new();
        sections.push(format!(
            "Error type: {}\nError message: {}\nSkill: {}\nAction: {}\nContext: {}",
            request.error_type,
            request.error_message,
            request.skill,
            request.action,
            request.context
        ));

        let root = &self.settings.project_root;
        let mut found_skill_files = false;
        if skills::is_valid_skill_name(&request.skill) {
            let script = skills::skill_script_path(&self.settings.skills_dir, &request.skill);
            if let Some(section) = file_section(root, &script) {
                sections.push(section);
                found_skill_files = true;
            }
            let doc = skills::skill_doc_path(&self.settings.skills_dir, &request.skill);
            if let Some(section) = file_section(root, &doc) {
                sections.push(section);
                found_skill_files = true;
            }
        }

        // Failures in the agent itself, or in a skill we cannot locate,
        // get the agent sources as context instead.
        if !found_skill_files {
            sections.extend(self.agent_file_sections());
        }

        sections.push(
            "Produce a minimal fix for this error as a JSON object.".to_string(),
        );
        sections.join("\n\n")
    }

    fn capability_prompt(&self, user_request: &str) -> String {
        let survey = skill_survey(&self.settings.project_root, &self.settings.skills_dir);
        format!(
            "User request: {}\n\nExisting skills:\n{}\n\nDesign the new capability as a JSON object.",
            user_request, survey
        )
    }

    fn agent_file_sections(&self) -> Vec<String> {
        let agent_abs = self.settings.project_root.join(&self.settings.agent_dir);
        let mut names: Vec<String> = match std::fs::read_dir(&agent_abs) {
            Ok(entries) => entries
                .flatten()
                .filter(|e| e.path().is_file())
                .filter_map(|e| e.file_name().into_string().ok())
                .collect(),
            Err(_) => return Vec::new(),
        };
        names.sort();

        names
            .into_iter()
            .take(MAX_AGENT_CONTEXT_FILES)
            .filter_map(|name| {
                let rel = self.settings.agent_dir.join(&name);
                file_section(&self.settings.project_root, &rel)
            })
            .collect()
    }
}

fn file_section(root: &Path, rel: &Path) -> Option<String> {
    let content = std::fs::read_to_string(root.join(rel)).ok()?;
    Some(format!(
        "File: {}\n```\n{}\n```",
        rel.display(),
        truncate_content(&content, MAX_FILE_CHARS)
    ))
}

/// Keep beginning and end when a file is too large for the prompt.
fn truncate_content(content: &str, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        content.to_string()
    } else {
        let head: String = content.chars().take(max_chars / 2).collect();
        let tail: String = content
            .chars()
            .rev()
            .take(max_chars / 2)
            .collect::<String>()
            .chars()
            .rev()
            .collect();
        format!("{}\n\n... [truncated] ...\n\n{}", head, tail)
    }
}

/// One line per skill: name, scripts, and the head of its SKILL.md.
fn skill_survey(root: &Path, skills_dir: &Path) -> String {
    let skills_abs = root.join(skills_dir);
    let entries = match std::fs::read_dir(&skills_abs) {
        Ok(entries) => entries,
        Err(_) => return "(no skills directory)".to_string(),
    };

    let mut names: Vec<String> = entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().into_string().ok())
        .collect();
    names.sort();

    if names.is_empty() {
        return "(no skills yet)".to_string();
    }

    let mut out = String::new();
    for name in names {
        let skill_abs = skills_abs.join(&name);
        out.push_str(&format!("- {}", name));

        let scripts_dir = skill_abs.join("scripts");
        if let Ok(scripts) = std::fs::read_dir(&scripts_dir) {
            let mut files: Vec<String> = scripts
                .flatten()
                .filter_map(|e| e.file_name().into_string().ok())
                .collect();
            files.sort();
            if !files.is_empty() {
                out.push_str(&format!(" (scripts: {})", files.join(", ")));
            }
        }
        out.push('\n');

        if let Ok(doc) = std::fs::read_to_string(skill_abs.join(skills::SKILL_DOC)) {
            let head: String = doc.chars().take(MAX_SURVEY_DOC_CHARS).collect();
            for line in head.lines().take(5) {
                out.push_str(&format!("    {}\n", line));
            }
        }
    }
    out
}
