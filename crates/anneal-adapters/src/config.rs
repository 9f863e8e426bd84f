//! Runtime configuration, read from the environment.
//!
//! Everything has a sensible default except the project root, the
//! operator chat, and the model API key.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context};

use anneal_core::ports::ChatId;

pub const DEFAULT_SKILLS_DIR: &str = "skills";
pub const DEFAULT_AGENT_DIR: &str = "agent";
pub const DEFAULT_APPROVAL_TIMEOUT_MINUTES: u64 = 5;
pub const DEFAULT_MIN_CONFIDENCE: f32 = 0.5;
pub const DEFAULT_MODEL: &str = "openai/gpt-4o-mini";

/// Directory under the project root for anneal's own state files.
pub const STATE_DIR: &str = ".anneal";

#[derive(Debug, Clone)]
pub struct Settings {
    /// Absolute path to the managed checkout.
    pub project_root: PathBuf,
    /// Skills tree, relative to the project root.
    pub skills_dir: PathBuf,
    /// Agent source tree, relative to the project root.
    pub agent_dir: PathBuf,
    /// Chat where approval prompts go.
    pub operator_chat: ChatId,
    /// How long a skill creation request stays open.
    pub approval_timeout: Duration,
    /// Proposals below this confidence are not applied.
    pub min_confidence: f32,
    /// Model identifier sent to the completions API.
    pub model: String,
    pub api_key: String,
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build settings from any variable source. Lets tests avoid
    /// mutating process-wide environment state.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let project_root = lookup("ANNEAL_PROJECT_ROOT")
            .map(PathBuf::from)
            .ok_or_else(|| anyhow!("ANNEAL_PROJECT_ROOT is not set"))?;

        let skills_dir = lookup("ANNEAL_SKILLS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SKILLS_DIR));
        let agent_dir = lookup("ANNEAL_AGENT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_AGENT_DIR));

        let operator_chat = lookup("ANNEAL_OPERATOR_CHAT")
            .ok_or_else(|| anyhow!("ANNEAL_OPERATOR_CHAT is not set"))?
            .parse::<i64>()
            .context("ANNEAL_OPERATOR_CHAT must be a numeric chat id")?;

        let timeout_minutes = match lookup("ANNEAL_APPROVAL_TIMEOUT_MINUTES") {
            Some(raw) => raw
                .parse::<u64>()
                .context("ANNEAL_APPROVAL_TIMEOUT_MINUTES must be a whole number of minutes")?,
            None => DEFAULT_APPROVAL_TIMEOUT_MINUTES,
        };

        let min_confidence = match lookup("ANNEAL_MIN_CONFIDENCE") {
            Some(raw) => raw
                .parse::<f32>()
                .context("ANNEAL_MIN_CONFIDENCE must be a number between 0 and 1")?,
            None => DEFAULT_MIN_CONFIDENCE,
        };

        let model = lookup("ANNEAL_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let api_key =
            lookup("OPENROUTER_API_KEY").ok_or_else(|| anyhow!("OPENROUTER_API_KEY is not set"))?;

        Ok(Settings {
            project_root,
            skills_dir,
            agent_dir,
            operator_chat: ChatId(operator_chat),
            approval_timeout: Duration::from_secs(timeout_minutes * 60),
            min_confidence,
            model,
            api_key,
        })
    }

    pub fn state_dir(&self) -> PathBuf {
        self.project_root.join(STATE_DIR)
    }

    /// Roots (relative to the project root) that generated changes may
    /// write under.
    pub fn allowed_roots(&self) -> Vec<PathBuf> {
        vec![self.skills_dir.clone(), self.agent_dir.clone()]
    }
}
