//! Chat message texts for operator prompts and requester updates.
//!
//! Kept in one place so the coordinator reads like the state machine
//! it is, not like a wall of format strings.

use anneal_core::request::{ErrorFixRequest, SkillCreationRequest, SkillMergeRequest};

pub(crate) fn skill_prompt(req: &SkillCreationRequest) -> String {
    format!(
        "New capability request\n\nFrom: {}\nRequest: {}\nID: {}\n\nApprove to generate the skill on a review branch.",
        req.requester_name, req.user_request, req.request_id
    )
}

pub(crate) fn skill_processing(req: &SkillCreationRequest) -> String {
    format!(
        "Approved. Generating skill for: {}\nID: {}",
        req.user_request, req.request_id
    )
}

pub(crate) fn skill_branch_ready(req: &SkillCreationRequest, branch: &str) -> String {
    format!(
        "Skill generated on branch {}\nID: {}\n\nA separate merge request follows.",
        branch, req.request_id
    )
}

pub(crate) fn skill_rejected(req: &SkillCreationRequest) -> String {
    format!(
        "Rejected: {}\nID: {}\n\nNo changes were made.",
        req.user_request, req.request_id
    )
}

pub(crate) fn skill_expired(req: &SkillCreationRequest) -> String {
    format!(
        "Expired without a decision: {}\nID: {}\n\nNo changes were made.",
        req.user_request, req.request_id
    )
}

pub(crate) fn skill_failed(req: &SkillCreationRequest, reason: &str) -> String {
    format!(
        "Skill generation failed: {}\nID: {}\n\nReason: {}\nNo changes were kept.",
        req.user_request, req.request_id, reason
    )
}

pub(crate) fn skill_not_possible(req: &SkillCreationRequest, analysis: &str) -> String {
    let detail = if analysis.trim().is_empty() {
        "The model did not produce a usable change."
    } else {
        analysis
    };
    format!(
        "No skill was generated for: {}\nID: {}\n\n{}",
        req.user_request, req.request_id, detail
    )
}

pub(crate) fn merge_prompt(req: &SkillMergeRequest) -> String {
    let review = match &req.compare_url {
        Some(url) => format!("Review: {}", url),
        None => format!("Review branch {} locally (no remote compare URL).", req.branch_name),
    };
    format!(
        "Merge request\n\nFor: {}\nSummary: {}\nBranch: {}\nFiles:\n{}\n{}\nID: {}\n\nApprove to merge into {}.",
        req.user_request,
        req.summary,
        req.branch_name,
        bullet_list(&req.files_changed),
        review,
        req.request_id,
        req.base_branch
    )
}

pub(crate) fn merge_processing(req: &SkillMergeRequest) -> String {
    format!("Merging {} into {}...", req.branch_name, req.base_branch)
}

pub(crate) fn merge_done(req: &SkillMergeRequest) -> String {
    format!(
        "Merged {} into {}.\nID: {}\nThe new capability is live.",
        req.branch_name, req.base_branch, req.request_id
    )
}

pub(crate) fn merge_failed(req: &SkillMergeRequest, reason: &str) -> String {
    format!(
        "Merge of {} failed: {}\nID: {}\nThe branch was left for manual review.",
        req.branch_name, reason, req.request_id
    )
}

pub(crate) fn merge_rejected(req: &SkillMergeRequest) -> String {
    format!(
        "Merge rejected. Branch {} was deleted.\nID: {}",
        req.branch_name, req.request_id
    )
}

pub(crate) fn error_prompt(req: &ErrorFixRequest) -> String {
    format!(
        "Runtime error\n\nType: {}\nSkill: {} / {}\nMessage: {}\nContext: {}\nID: {}\n\nApprove to generate and commit a fix.",
        req.error_type, req.skill, req.action, req.error_message, req.context, req.request_id
    )
}

pub(crate) fn error_processing(req: &ErrorFixRequest) -> String {
    format!("Approved. Generating fix for {}...", req.request_id)
}

pub(crate) fn fix_committed(req: &ErrorFixRequest, files: &[String], commit_message: &str) -> String {
    format!(
        "Fix committed for {}\n\nCommit: {}\nFiles:\n{}",
        req.request_id,
        commit_message,
        bullet_list(files)
    )
}

pub(crate) fn fix_not_possible(req: &ErrorFixRequest, analysis: &str) -> String {
    let detail = if analysis.trim().is_empty() {
        "The model did not produce a usable fix."
    } else {
        analysis
    };
    format!("No automatic fix for {}\n\n{}", req.request_id, detail)
}

pub(crate) fn fix_failed(req: &ErrorFixRequest, reason: &str) -> String {
    format!(
        "Fix for {} failed: {}\nNo changes were kept.",
        req.request_id, reason
    )
}

pub(crate) fn error_rejected(req: &ErrorFixRequest) -> String {
    format!("Fix rejected for {}. No changes were made.", req.request_id)
}

pub(crate) fn requester_ack(request_id: &str) -> String {
    format!(
        "I don't have that capability yet. I've asked for approval to build it (request {}).",
        request_id
    )
}

pub(crate) fn requester_in_progress() -> String {
    "Your request was approved. The new capability is being prepared for review.".to_string()
}

pub(crate) fn requester_live() -> String {
    "The new capability has been reviewed and merged. You can use it now.".to_string()
}

pub(crate) fn requester_rejected() -> String {
    "Your capability request was not approved.".to_string()
}

pub(crate) fn requester_expired() -> String {
    "Your capability request expired without a decision. Feel free to ask again.".to_string()
}

pub(crate) fn requester_failed() -> String {
    "Building the requested capability failed. Nothing was changed.".to_string()
}

fn bullet_list(items: &[String]) -> String {
    if items.is_empty() {
        return "- (none)".to_string();
    }
    items
        .iter()
        .map(|i| format!("- {}", i))
        .collect::<Vec<_>>()
        .join("\n")
}
