//! Approval request model.
//!
//! Three request kinds flow through the coordinator. Skill creation
//! requests live only in memory and die with the process; merge and
//! error-fix requests are durable and survive restarts. A request is
//! pending exactly as long as it sits in its table; resolution and
//! expiry both remove it, so terminal states never linger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ports::{ChatId, MessageRef};

/// Outcome a pending request can reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    SkillCreation,
    SkillMerge,
    ErrorFix,
}

impl RequestKind {
    pub fn label(&self) -> &'static str {
        match self {
            RequestKind::SkillCreation => "skill creation",
            RequestKind::SkillMerge => "skill merge",
            RequestKind::ErrorFix => "error fix",
        }
    }
}

/// Cap oversized free-text fields before they land in prompts and
/// persisted records.
pub const MAX_DETAIL_CHARS: usize = 500;

pub fn truncate_chars(s: &str, max: usize) -> String {
    if max == 0 {
        return String::new();
    }
    let char_count = s.chars().count();
    if char_count <= max {
        return s.to_string();
    }
    if max <= 3 {
        return s.chars().take(max).collect();
    }
    let truncated: String = s.chars().take(max - 3).collect();
    format!("{}...", truncated)
}

fn short_uuid() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id.chars().take(8).collect()
}

pub fn new_skill_request_id() -> String {
    format!("skill_{}", short_uuid())
}

pub fn new_merge_request_id() -> String {
    format!("skill_merge_{}", short_uuid())
}

/// Error-fix IDs carry a timestamp for the operator's benefit plus a
/// random suffix so two failures in the same second stay distinct.
pub fn new_error_request_id(now: DateTime<Utc>) -> String {
    let suffix: String = short_uuid().chars().take(4).collect();
    format!("err_{}_{}", now.format("%Y%m%d_%H%M%S"), suffix)
}

/// A capability request waiting for first approval. In-memory only.
#[derive(Debug, Clone)]
pub struct SkillCreationRequest {
    pub request_id: String,
    pub user_request: String,
    pub requester_name: String,
    pub requester_chat: ChatId,
    pub created_at: DateTime<Utc>,
    pub message_ref: Option<MessageRef>,
}

impl SkillCreationRequest {
    pub fn new(user_request: &str, requester_name: &str, requester_chat: ChatId) -> Self {
        Self {
            request_id: new_skill_request_id(),
            user_request: user_request.to_string(),
            requester_name: requester_name.to_string(),
            requester_chat,
            created_at: Utc::now(),
            message_ref: None,
        }
    }
}

/// A published branch waiting for merge approval. Durable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillMergeRequest {
    pub request_id: String,
    pub user_request: String,
    pub requester_name: String,
    pub requester_chat: ChatId,
    pub branch_name: String,
    pub base_branch: String,
    pub compare_url: Option<String>,
    pub summary: String,
    pub commit_message: String,
    pub files_changed: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub message_ref: Option<MessageRef>,
}

/// A runtime failure waiting for fix approval. Durable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorFixRequest {
    pub request_id: String,
    pub error_type: String,
    pub error_message: String,
    pub skill: String,
    pub action: String,
    pub context: String,
    pub created_at: DateTime<Utc>,
    pub message_ref: Option<MessageRef>,
}

impl ErrorFixRequest {
    pub fn new(
        error_type: &str,
        error_message: &str,
        skill: &str,
        action: &str,
        context: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            request_id: new_error_request_id(now),
            error_type: error_type.to_string(),
            error_message: truncate_chars(error_message, MAX_DETAIL_CHARS),
            skill: skill.to_string(),
            action: action.to_string(),
            context: truncate_chars(context, MAX_DETAIL_CHARS),
            created_at: now,
            message_ref: None,
        }
    }
}

/// The restart-surviving request kinds, tagged for on-disk storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DurableRequest {
    SkillMerge(SkillMergeRequest),
    ErrorFix(ErrorFixRequest),
}

impl DurableRequest {
    pub fn request_id(&self) -> &str {
        match self {
            DurableRequest::SkillMerge(r) => &r.request_id,
            DurableRequest::ErrorFix(r) => &r.request_id,
        }
    }

    pub fn kind(&self) -> RequestKind {
        match self {
            DurableRequest::SkillMerge(_) => RequestKind::SkillMerge,
            DurableRequest::ErrorFix(_) => RequestKind::ErrorFix,
        }
    }

    pub fn message_ref(&self) -> Option<MessageRef> {
        match self {
            DurableRequest::SkillMerge(r) => r.message_ref,
            DurableRequest::ErrorFix(r) => r.message_ref,
        }
    }

    pub fn set_message_ref(&mut self, message_ref: MessageRef) {
        match self {
            DurableRequest::SkillMerge(r) => r.message_ref = Some(message_ref),
            DurableRequest::ErrorFix(r) => r.message_ref = Some(message_ref),
        }
    }
}
