//! Contracts the pipelines use to reach their collaborators.
//!
//! The coordinator and pipelines only see these traits, so tests can
//! swap in scripted fakes and the transport, VCS, and model stay
//! replaceable.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Identifies a chat (operator channel or requester conversation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(pub i64);

/// Handle to a previously sent message, used to edit it in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageRef(pub i64);

/// Outbound chat transport.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Send an approval prompt with approve/reject controls bound to
    /// `request_id`. Returns a handle for later edits.
    async fn send_approval_prompt(
        &self,
        chat: ChatId,
        text: &str,
        request_id: &str,
    ) -> anyhow::Result<MessageRef>;

    /// Rewrite an earlier message in place, dropping its controls.
    async fn edit_message(
        &self,
        chat: ChatId,
        message: MessageRef,
        text: &str,
    ) -> anyhow::Result<()>;

    /// Plain notification with no controls.
    async fn send_message(&self, chat: ChatId, text: &str) -> anyhow::Result<()>;
}

/// Local repository operations. Implementations work against the
/// project checkout; all calls are blocking.
pub trait VersionControl: Send + Sync {
    fn current_branch(&self) -> anyhow::Result<String>;

    /// Create `name` at the current HEAD and check it out.
    fn create_branch(&self, name: &str) -> anyhow::Result<()>;

    fn checkout(&self, name: &str) -> anyhow::Result<()>;

    /// Commit staged or all working-tree changes. Returns the short
    /// commit id.
    fn commit(&self, message: &str, stage_all: bool) -> anyhow::Result<String>;

    /// Push the current branch to the default remote.
    fn push(&self, set_upstream: bool) -> anyhow::Result<()>;

    /// Merge `name` into the current branch.
    fn merge_branch(&self, name: &str) -> anyhow::Result<()>;

    fn delete_branch(&self, name: &str, force: bool) -> anyhow::Result<()>;

    fn delete_remote_branch(&self, name: &str) -> anyhow::Result<()>;

    /// Throw away uncommitted working-tree changes.
    fn discard_changes(&self) -> anyhow::Result<()>;

    /// Web URL for reviewing `head` against `base`, when the remote
    /// supports one.
    fn compare_url(&self, base: &str, head: &str) -> Option<String>;
}

/// The live skill catalog. Reloaded after a merge lands so new
/// capabilities become callable without a restart.
#[async_trait]
pub trait SkillRegistry: Send + Sync {
    async fn reload(&self) -> anyhow::Result<()>;
}

/// A code-generating model behind a chat-completions API.
#[async_trait]
pub trait CodeModel: Send + Sync {
    /// Run one completion and return the raw assistant text.
    async fn complete(&self, system: &str, user: &str) -> anyhow::Result<String>;
}
