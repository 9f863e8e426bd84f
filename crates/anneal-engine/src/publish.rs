//! Branch publishing: take an approved proposal from change set to
//! pushed review branch, and later merge or discard it.
//!
//! Publishing never leaves the checkout on a half-built branch. Every
//! step after branch creation rolls back on failure: discard the
//! working tree, return to the original branch, delete the branch.
//! Rollback itself is best-effort; what could not be cleaned is named
//! in the error.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;

use anneal_core::patch::apply_changes;
use anneal_core::ports::VersionControl;
use anneal_core::skills::check_paths_allowed;

use crate::llm::parse::ChangeProposal;

/// What `publish` produced on success.
#[derive(Debug, Clone)]
pub struct PublishOutcome {
    pub branch: String,
    pub base_branch: String,
    pub compare_url: Option<String>,
    pub files_changed: Vec<String>,
    pub commit_message: String,
}

pub struct BranchPublisher {
    vcs: Arc<dyn VersionControl>,
    project_root: PathBuf,
    allowed_roots: Vec<PathBuf>,
}

impl BranchPublisher {
    pub fn new(
        vcs: Arc<dyn VersionControl>,
        project_root: PathBuf,
        allowed_roots: Vec<PathBuf>,
    ) -> Self {
        Self {
            vcs,
            project_root,
            allowed_roots,
        }
    }

    /// Publish a proposal on a fresh branch and push it for review.
    /// Ends back on the original branch whether it succeeds or fails.
    pub fn publish(&self, branch: &str, proposal: &ChangeProposal) -> anyhow::Result<PublishOutcome> {
        // Whitelist check happens before any repository mutation.
        check_paths_allowed(&proposal.changes, &self.allowed_roots)
            .map_err(|e| anyhow::anyhow!("Proposal touches forbidden paths: {}", e))?;

        let base_branch = self
            .vcs
            .current_branch()
            .context("Failed to determine base branch")?;

        self.vcs
            .create_branch(branch)
            .with_context(|| format!("Failed to create branch '{}'", branch))?;

        let report = match apply_changes(&proposal.changes, &self.project_root) {
            Ok(report) if report.success() => report,
            Ok(report) => {
                self.rollback(&base_branch, branch, true);
                return Err(anyhow::anyhow!(
                    "Edits could not be applied:\n{}",
                    report.error_summary()
                ));
            }
            Err(e) => {
                self.rollback(&base_branch, branch, true);
                return Err(anyhow::anyhow!("Failed to apply changes: {}", e));
            }
        };

        let commit_message = proposal
            .commit_message
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| {
                if proposal.summary.trim().is_empty() {
                    "Automated skill change".to_string()
                } else {
                    proposal.summary.clone()
                }
            });

        if let Err(e) = self.vcs.commit(&commit_message, true) {
            self.rollback(&base_branch, branch, true);
            return Err(anyhow::anyhow!("Failed to commit changes: {}", e));
        }

        if let Err(e) = self.vcs.push(true) {
            // Changes are committed on the branch; dropping the branch
            // drops them with it.
            self.rollback(&base_branch, branch, false);
            return Err(anyhow::anyhow!("Failed to push branch '{}': {}", branch, e));
        }

        if let Err(e) = self.vcs.checkout(&base_branch) {
            return Err(anyhow::anyhow!(
                "Branch '{}' was pushed but returning to '{}' failed: {}",
                branch,
                base_branch,
                e
            ));
        }

        let compare_url = self.vcs.compare_url(&base_branch, branch);
        let files_changed = report
            .touched_paths()
            .iter()
            .map(|p| p.display().to_string())
            .collect();

        Ok(PublishOutcome {
            branch: branch.to_string(),
            base_branch,
            compare_url,
            files_changed,
            commit_message,
        })
    }

    /// Merge an approved branch into its base and clean it up.
    pub fn merge(&self, branch: &str, base_branch: &str) -> anyhow::Result<()> {
        self.vcs
            .checkout(base_branch)
            .with_context(|| format!("Failed to checkout '{}'", base_branch))?;
        self.vcs
            .merge_branch(branch)
            .with_context(|| format!("Failed to merge '{}' into '{}'", branch, base_branch))?;
        self.vcs
            .push(false)
            .with_context(|| format!("Merged '{}' but pushing '{}' failed", branch, base_branch))?;

        if let Err(e) = self.vcs.delete_branch(branch, true) {
            tracing::warn!(branch, error = %e, "failed to delete merged local branch");
        }
        if let Err(e) = self.vcs.delete_remote_branch(branch) {
            tracing::warn!(branch, error = %e, "failed to delete merged remote branch");
        }
        Ok(())
    }

    /// Throw away a rejected branch, locally and on the remote.
    pub fn discard(&self, branch: &str, base_branch: &str) -> anyhow::Result<()> {
        let mut problems = Vec::new();

        if let Err(e) = self.vcs.checkout(base_branch) {
            problems.push(format!("checkout '{}': {}", base_branch, e));
        }
        if let Err(e) = self.vcs.delete_branch(branch, true) {
            problems.push(format!("delete local '{}': {}", branch, e));
        }
        if let Err(e) = self.vcs.delete_remote_branch(branch) {
            problems.push(format!("delete remote '{}': {}", branch, e));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(anyhow::anyhow!(
                "Branch cleanup incomplete: {}",
                problems.join("; ")
            ))
        }
    }

    fn rollback(&self, base_branch: &str, branch: &str, dirty_tree: bool) {
        if dirty_tree {
            if let Err(e) = self.vcs.discard_changes() {
                tracing::warn!(error = %e, "rollback: failed to discard working tree");
            }
        }
        if let Err(e) = self.vcs.checkout(base_branch) {
            tracing::warn!(base_branch, error = %e, "rollback: failed to return to base branch");
            return;
        }
        if let Err(e) = self.vcs.delete_branch(branch, true) {
            tracing::warn!(branch, error = %e, "rollback: failed to delete branch");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anneal_core::patch::{ChangeSet, EditOp, FileEdit, NewFile};
    use std::collections::HashSet;
    use std::sync::Mutex;

    struct FakeVcs {
        ops: Mutex<Vec<String>>,
        current: Mutex<String>,
        fail_on: HashSet<&'static str>,
    }

    impl FakeVcs {
        fn new() -> Self {
            Self {
                ops: Mutex::new(Vec::new()),
                current: Mutex::new("main".to_string()),
                fail_on: HashSet::new(),
            }
        }

        fn failing_on(ops: &[&'static str]) -> Self {
            let mut vcs = Self::new();
            vcs.fail_on = ops.iter().copied().collect();
            vcs
        }

        fn record(&self, op: String) {
            self.ops.lock().unwrap().push(op);
        }

        fn fails(&self, op: &str) -> bool {
            self.fail_on.contains(op)
        }

        fn ops(&self) -> Vec<String> {
            self.ops.lock().unwrap().clone()
        }
    }

    impl VersionControl for FakeVcs {
        fn current_branch(&self) -> anyhow::Result<String> {
            Ok(self.current.lock().unwrap().clone())
        }

        fn create_branch(&self, name: &str) -> anyhow::Result<()> {
            self.record(format!("create_branch {}", name));
            if self.fails("create_branch") {
                return Err(anyhow::anyhow!("create failed"));
            }
            *self.current.lock().unwrap() = name.to_string();
            Ok(())
        }

        fn checkout(&self, name: &str) -> anyhow::Result<()> {
            self.record(format!("checkout {}", name));
            if self.fails("checkout") {
                return Err(anyhow::anyhow!("checkout failed"));
            }
            *self.current.lock().unwrap() = name.to_string();
            Ok(())
        }

        fn commit(&self, message: &str, _stage_all: bool) -> anyhow::Result<String> {
            self.record(format!("commit {}", message));
            if self.fails("commit") {
                return Err(anyhow::anyhow!("commit failed"));
            }
            Ok("abcd1234".to_string())
        }

        fn push(&self, set_upstream: bool) -> anyhow::Result<()> {
            self.record(format!("push upstream={}", set_upstream));
            if self.fails("push") {
                return Err(anyhow::anyhow!("push failed"));
            }
            Ok(())
        }

        fn merge_branch(&self, name: &str) -> anyhow::Result<()> {
            self.record(format!("merge {}", name));
            if self.fails("merge_branch") {
                return Err(anyhow::anyhow!("merge failed"));
            }
            Ok(())
        }

        fn delete_branch(&self, name: &str, force: bool) -> anyhow::Result<()> {
            self.record(format!("delete_branch {} force={}", name, force));
            if self.fails("delete_branch") {
                return Err(anyhow::anyhow!("delete failed"));
            }
            Ok(())
        }

        fn delete_remote_branch(&self, name: &str) -> anyhow::Result<()> {
            self.record(format!("delete_remote_branch {}", name));
            if self.fails("delete_remote_branch") {
                return Err(anyhow::anyhow!("remote delete failed"));
            }
            Ok(())
        }

        fn discard_changes(&self) -> anyhow::Result<()> {
            self.record("discard_changes".to_string());
            Ok(())
        }

        fn compare_url(&self, base: &str, head: &str) -> Option<String> {
            Some(format!("https://example.test/compare/{}...{}", base, head))
        }
    }

    fn proposal_with(changes: ChangeSet) -> ChangeProposal {
        ChangeProposal {
            analysis: "analysis".to_string(),
            summary: "Add weather skill".to_string(),
            commit_message: Some("Add weather skill".to_string()),
            changes,
            confidence: 0.9,
        }
    }

    fn allowed() -> Vec<PathBuf> {
        vec![PathBuf::from("skills"), PathBuf::from("agent")]
    }

    fn new_file_changes() -> ChangeSet {
        ChangeSet {
            new_files: vec![NewFile {
                path: PathBuf::from("skills/weather/SKILL.md"),
                content: "# Weather\n".to_string(),
            }],
            edits: vec![],
        }
    }

    #[test]
    fn publish_creates_commits_pushes_and_returns_to_base() {
        let dir = tempfile::tempdir().unwrap();
        let vcs = Arc::new(FakeVcs::new());
        let publisher =
            BranchPublisher::new(vcs.clone(), dir.path().to_path_buf(), allowed());

        let outcome = publisher
            .publish("feat/skill_ab12cd34-weather", &proposal_with(new_file_changes()))
            .unwrap();

        assert_eq!(outcome.base_branch, "main");
        assert_eq!(outcome.files_changed, vec!["skills/weather/SKILL.md"]);
        assert_eq!(
            outcome.compare_url.as_deref(),
            Some("https://example.test/compare/main...feat/skill_ab12cd34-weather")
        );
        assert!(dir.path().join("skills/weather/SKILL.md").exists());

        let ops = vcs.ops();
        assert_eq!(
            ops,
            vec![
                "create_branch feat/skill_ab12cd34-weather",
                "commit Add weather skill",
                "push upstream=true",
                "checkout main",
            ]
        );
    }

    #[test]
    fn publish_rejects_forbidden_paths_without_touching_vcs() {
        let dir = tempfile::tempdir().unwrap();
        let vcs = Arc::new(FakeVcs::new());
        let publisher = BranchPublisher::new(vcs.clone(), dir.path().to_path_buf(), allowed());

        let changes = ChangeSet {
            new_files: vec![NewFile {
                path: PathBuf::from("README.md"),
                content: "clobber\n".to_string(),
            }],
            edits: vec![],
        };
        let err = publisher
            .publish("feat/x", &proposal_with(changes))
            .unwrap_err();
        assert!(err.to_string().contains("forbidden"));
        assert!(vcs.ops().is_empty());
        assert!(!dir.path().join("README.md").exists());
    }

    #[test]
    fn failed_edit_rolls_back_branch() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("skills/pihole/scripts")).unwrap();
        std::fs::write(
            dir.path().join("skills/pihole/scripts/pihole_api.py"),
            "print('x')\n",
        )
        .unwrap();

        let vcs = Arc::new(FakeVcs::new());
        let publisher = BranchPublisher::new(vcs.clone(), dir.path().to_path_buf(), allowed());

        let changes = ChangeSet {
            new_files: vec![],
            edits: vec![FileEdit {
                path: PathBuf::from("skills/pihole/scripts/pihole_api.py"),
                op: EditOp::Replace {
                    old_string: "not present".to_string(),
                    new_string: "y".to_string(),
                },
            }],
        };
        let err = publisher.publish("feat/x", &proposal_with(changes)).unwrap_err();
        assert!(err.to_string().contains("could not be applied"));

        let ops = vcs.ops();
        assert_eq!(
            ops,
            vec![
                "create_branch feat/x",
                "discard_changes",
                "checkout main",
                "delete_branch feat/x force=true",
            ]
        );
    }

    #[test]
    fn failed_push_deletes_branch_and_returns_to_base() {
        let dir = tempfile::tempdir().unwrap();
        let vcs = Arc::new(FakeVcs::failing_on(&["push"]));
        let publisher = BranchPublisher::new(vcs.clone(), dir.path().to_path_buf(), allowed());

        let err = publisher
            .publish("feat/x", &proposal_with(new_file_changes()))
            .unwrap_err();
        assert!(err.to_string().contains("push"));

        let ops = vcs.ops();
        assert_eq!(
            ops,
            vec![
                "create_branch feat/x",
                "commit Add weather skill",
                "push upstream=true",
                "checkout main",
                "delete_branch feat/x force=true",
            ]
        );
    }

    #[test]
    fn merge_lands_branch_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let vcs = Arc::new(FakeVcs::new());
        let publisher = BranchPublisher::new(vcs.clone(), dir.path().to_path_buf(), allowed());

        publisher.merge("feat/x", "main").unwrap();
        assert_eq!(
            vcs.ops(),
            vec![
                "checkout main",
                "merge feat/x",
                "push upstream=false",
                "delete_branch feat/x force=true",
                "delete_remote_branch feat/x",
            ]
        );
    }

    #[test]
    fn merge_failure_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let vcs = Arc::new(FakeVcs::failing_on(&["merge_branch"]));
        let publisher = BranchPublisher::new(vcs.clone(), dir.path().to_path_buf(), allowed());
        assert!(publisher.merge("feat/x", "main").is_err());
    }

    #[test]
    fn discard_deletes_local_and_remote() {
        let dir = tempfile::tempdir().unwrap();
        let vcs = Arc::new(FakeVcs::new());
        let publisher = BranchPublisher::new(vcs.clone(), dir.path().to_path_buf(), allowed());

        publisher.discard("feat/x", "main").unwrap();
        assert_eq!(
            vcs.ops(),
            vec![
                "checkout main",
                "delete_branch feat/x force=true",
                "delete_remote_branch feat/x",
            ]
        );
    }

    #[test]
    fn discard_reports_partial_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let vcs = Arc::new(FakeVcs::failing_on(&["delete_remote_branch"]));
        let publisher = BranchPublisher::new(vcs.clone(), dir.path().to_path_buf(), allowed());

        let err = publisher.discard("feat/x", "main").unwrap_err();
        assert!(err.to_string().contains("delete remote"));
    }
}
