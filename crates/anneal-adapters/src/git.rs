//! Git adapter for the managed checkout.
//!
//! Local operations (branches, checkout, commit, discard) go through
//! git2. Anything that talks to the remote or runs merge machinery
//! shells out to the git CLI with a hard timeout and terminal prompts
//! disabled, so a credential prompt can never hang the pipeline.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use git2::{Repository, Signature};

use anneal_core::ports::VersionControl;

use crate::util::{run_with_timeout, CommandOutput};

const GIT_PUSH_TIMEOUT_SECS: u64 = 180;
const GIT_LOCAL_TIMEOUT_SECS: u64 = 30;

pub struct GitVersionControl {
    repo_root: PathBuf,
}

impl GitVersionControl {
    pub fn new(repo_root: &Path) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
        }
    }

    fn open(&self) -> Result<Repository> {
        Repository::discover(&self.repo_root).with_context(|| {
            format!(
                "Not a git repository (or any parent): {}",
                self.repo_root.display()
            )
        })
    }

    fn run_git(&self, args: &[&str], timeout: Duration) -> Result<CommandOutput> {
        let mut cmd = Command::new("git");
        cmd.current_dir(&self.repo_root)
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0");
        run_with_timeout(&mut cmd, timeout)
            .with_context(|| format!("Failed to run git {}", args.join(" ")))
    }

    fn run_git_checked(&self, args: &[&str], timeout: Duration) -> Result<CommandOutput> {
        let output = self.run_git(args, timeout)?;
        if output.timed_out {
            return Err(anyhow::anyhow!(
                "git {} timed out after {}s",
                args.join(" "),
                timeout.as_secs()
            ));
        }
        if !output.status.map(|s| s.success()).unwrap_or(false) {
            return Err(anyhow::anyhow!(
                "git {} failed: {}",
                args.join(" "),
                output.stderr.trim()
            ));
        }
        Ok(output)
    }

    fn remote_web_url(&self) -> Option<String> {
        let repo = self.open().ok()?;
        let remote = repo.find_remote("origin").ok()?;
        normalize_remote_url(remote.url()?)
    }
}

impl VersionControl for GitVersionControl {
    fn current_branch(&self) -> Result<String> {
        let repo = self.open()?;
        let head = repo.head().context("Failed to read HEAD")?;
        Ok(head.shorthand().unwrap_or("HEAD").to_string())
    }

    fn create_branch(&self, name: &str) -> Result<()> {
        if !is_valid_git_ref(name) {
            return Err(anyhow::anyhow!("Invalid branch name: {}", name));
        }
        let repo = self.open()?;
        let head_commit = repo
            .head()
            .context("Failed to read HEAD")?
            .peel_to_commit()
            .context("Failed to resolve HEAD commit")?;
        repo.branch(name, &head_commit, false)
            .with_context(|| format!("Failed to create branch '{}'", name))?;

        if let Err(error) = self.checkout(name) {
            // Roll the branch back so a failed checkout leaves no trace.
            let cleanup_failed = repo
                .find_branch(name, git2::BranchType::Local)
                .and_then(|mut b| b.delete())
                .is_err();
            if cleanup_failed {
                return Err(anyhow::anyhow!(
                    "Failed to checkout new branch '{}' ({}); cleanup also failed, delete it manually",
                    name,
                    error
                ));
            }
            return Err(anyhow::anyhow!(
                "Failed to checkout new branch '{}': {}",
                name,
                error
            ));
        }
        Ok(())
    }

    fn checkout(&self, name: &str) -> Result<()> {
        let repo = self.open()?;
        let (object, reference) = repo
            .revparse_ext(name)
            .with_context(|| format!("Branch '{}' not found", name))?;
        repo.checkout_tree(&object, None)?;
        match reference {
            Some(r) => repo.set_head(r.name().unwrap_or("HEAD"))?,
            None => repo.set_head_detached(object.id())?,
        }
        Ok(())
    }

    fn commit(&self, message: &str, stage_all: bool) -> Result<String> {
        let repo = self.open()?;
        let mut index = repo.index()?;
        if stage_all {
            index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)?;
            index.write()?;
        }

        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;

        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit().context("Failed to resolve HEAD")?),
            Err(err)
                if matches!(
                    err.code(),
                    git2::ErrorCode::UnbornBranch | git2::ErrorCode::NotFound
                ) =>
            {
                None
            }
            Err(err) => return Err(err.into()),
        };

        let config = repo.config()?;
        let name = config
            .get_string("user.name")
            .unwrap_or_else(|_| "anneal".to_string());
        let email = config
            .get_string("user.email")
            .unwrap_or_else(|_| "anneal@local".to_string());
        let sig = Signature::now(&name, &email)?;

        let oid = match parent {
            Some(ref parent) => repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[parent])?,
            None => repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[])?,
        };

        let short: String = oid.to_string().chars().take(8).collect();
        Ok(short)
    }

    fn push(&self, set_upstream: bool) -> Result<()> {
        let branch = self.current_branch()?;
        let mut args = vec!["push"];
        if set_upstream {
            args.push("-u");
        }
        args.push("origin");
        args.push(&branch);

        let output = self.run_git(&args, Duration::from_secs(GIT_PUSH_TIMEOUT_SECS))?;
        if output.timed_out {
            return Err(anyhow::anyhow!(
                "git push timed out after {}s (branch: {})",
                GIT_PUSH_TIMEOUT_SECS,
                branch
            ));
        }
        if output.status.map(|s| s.success()).unwrap_or(false) {
            return Ok(());
        }

        let stderr = output.stderr;
        // Retry once with -u when the remote asks for an upstream.
        if !set_upstream
            && (stderr.contains("no upstream")
                || stderr.contains("set-upstream")
                || stderr.contains("set upstream"))
        {
            let retry =
                self.run_git(&["push", "-u", "origin", &branch], Duration::from_secs(GIT_PUSH_TIMEOUT_SECS))?;
            if retry.status.map(|s| s.success()).unwrap_or(false) && !retry.timed_out {
                return Ok(());
            }
            return Err(anyhow::anyhow!(
                "git push failed after retrying with upstream (branch: {}): {}",
                branch,
                retry.stderr.trim()
            ));
        }

        Err(anyhow::anyhow!(
            "git push failed (branch: {}): {}",
            branch,
            stderr.trim()
        ))
    }

    fn merge_branch(&self, name: &str) -> Result<()> {
        self.run_git_checked(
            &["merge", "--no-edit", name],
            Duration::from_secs(GIT_LOCAL_TIMEOUT_SECS),
        )?;
        Ok(())
    }

    fn delete_branch(&self, name: &str, force: bool) -> Result<()> {
        let repo = self.open()?;
        let head = repo.head().context("Failed to read HEAD")?;
        if head.shorthand() == Some(name) {
            return Err(anyhow::anyhow!(
                "Refusing to delete currently checked out branch '{}'",
                name
            ));
        }
        let mut branch = repo
            .find_branch(name, git2::BranchType::Local)
            .with_context(|| format!("Local branch '{}' not found", name))?;
        if !force && branch.upstream().is_ok() {
            return Err(anyhow::anyhow!(
                "Refusing to delete branch '{}' with upstream tracking",
                name
            ));
        }
        branch
            .delete()
            .with_context(|| format!("Failed to delete local branch '{}'", name))?;
        Ok(())
    }

    fn delete_remote_branch(&self, name: &str) -> Result<()> {
        self.run_git_checked(
            &["push", "origin", "--delete", name],
            Duration::from_secs(GIT_PUSH_TIMEOUT_SECS),
        )?;
        Ok(())
    }

    fn discard_changes(&self) -> Result<()> {
        self.run_git_checked(&["reset", "HEAD"], Duration::from_secs(GIT_LOCAL_TIMEOUT_SECS))?;

        let checkout = self.run_git(
            &["checkout", "HEAD", "--", "."],
            Duration::from_secs(GIT_LOCAL_TIMEOUT_SECS),
        )?;
        if checkout.timed_out {
            return Err(anyhow::anyhow!("git checkout timed out"));
        }
        let checkout_ok = checkout.status.map(|s| s.success()).unwrap_or(false);
        // "did not match any file(s)" just means nothing is tracked yet.
        if !checkout_ok && !checkout.stderr.contains("did not match any file") {
            return Err(anyhow::anyhow!(
                "git checkout failed: {}",
                checkout.stderr.trim()
            ));
        }

        self.run_git_checked(&["clean", "-fd"], Duration::from_secs(GIT_LOCAL_TIMEOUT_SECS))?;
        Ok(())
    }

    fn compare_url(&self, base: &str, head: &str) -> Option<String> {
        let web = self.remote_web_url()?;
        Some(format!("{}/compare/{}...{}", web, base, head))
    }
}

/// Turn a git remote URL into a browsable web URL, or `None` for
/// remotes without an obvious web form (local paths, bare hosts).
pub fn normalize_remote_url(url: &str) -> Option<String> {
    let url = url.trim().trim_end_matches('/');
    let url = url.strip_suffix(".git").unwrap_or(url);

    if let Some(rest) = url.strip_prefix("https://") {
        return Some(format!("https://{}", rest));
    }
    if let Some(rest) = url.strip_prefix("http://") {
        return Some(format!("http://{}", rest));
    }
    // scp-like syntax: git@host:owner/repo
    if let Some(rest) = url.strip_prefix("git@") {
        let (host, path) = rest.split_once(':')?;
        if path.is_empty() {
            return None;
        }
        return Some(format!("https://{}/{}", host, path));
    }
    if let Some(rest) = url.strip_prefix("ssh://git@") {
        let (host, path) = rest.split_once('/')?;
        return Some(format!("https://{}/{}", host, path));
    }
    None
}

/// Branch name for a published change: `feat/<request-id>[-slug]`.
pub fn generate_branch_name(request_id: &str, summary: &str) -> String {
    let fallback = format!("feat/{}", request_id);

    let slug = sanitize_branch_slug(summary);
    if slug.is_empty() {
        return fallback;
    }

    let candidate = format!("feat/{}-{}", request_id, slug);
    if is_valid_git_ref(&candidate) {
        candidate
    } else {
        fallback
    }
}

fn sanitize_branch_slug(summary: &str) -> String {
    let slug: String = summary
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .take(5)
        .collect::<Vec<_>>()
        .join("-");

    let slug = if slug.chars().count() > 40 {
        slug.chars()
            .take(40)
            .collect::<String>()
            .trim_end_matches('-')
            .to_string()
    } else {
        slug
    };

    slug.trim_matches('-').to_string()
}

const MAX_GIT_REF_LENGTH: usize = 255;

pub fn is_valid_git_ref(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    if name.len() > MAX_GIT_REF_LENGTH {
        return false;
    }
    // Leading hyphens could be read as git flags.
    if name.starts_with('-') {
        return false;
    }
    if name.starts_with('.') || name.ends_with('.') || name.ends_with('/') {
        return false;
    }
    if name.ends_with(".lock") {
        return false;
    }
    if name.contains("..") || name.contains("@{") || name.contains("//") {
        return false;
    }
    for c in name.chars() {
        if c.is_control()
            || c == ' '
            || c == '~'
            || c == '^'
            || c == ':'
            || c == '?'
            || c == '*'
            || c == '['
            || c == '\\'
            || c == '\''
            || c == '"'
            || c == '`'
            || c == '$'
            || c == '!'
            || c == '&'
            || c == ';'
            || c == '|'
            || c == '<'
            || c == '>'
        {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_temp_repo() -> (tempfile::TempDir, PathBuf) {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let repo_path = temp_dir.path().to_path_buf();

        Repository::init(&repo_path).expect("Failed to init repo");

        let repo = Repository::open(&repo_path).unwrap();
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "Test User").unwrap();
        config.set_str("user.email", "test@example.com").unwrap();

        let sig = Signature::now("Test User", "test@example.com").unwrap();
        let tree_id = repo.index().unwrap().write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "Initial commit", &tree, &[])
            .unwrap();

        (temp_dir, repo_path)
    }

    #[test]
    fn create_branch_checks_it_out() {
        let (_tmp, repo_path) = create_temp_repo();
        let vcs = GitVersionControl::new(&repo_path);
        let original = vcs.current_branch().unwrap();

        vcs.create_branch("feat/skill_abc12345-test").unwrap();
        assert_eq!(vcs.current_branch().unwrap(), "feat/skill_abc12345-test");

        vcs.checkout(&original).unwrap();
        assert_eq!(vcs.current_branch().unwrap(), original);
    }

    #[test]
    fn create_branch_rejects_invalid_name() {
        let (_tmp, repo_path) = create_temp_repo();
        let vcs = GitVersionControl::new(&repo_path);
        assert!(vcs.create_branch("-bad").is_err());
        assert!(vcs.create_branch("bad name").is_err());
    }

    #[test]
    fn commit_with_stage_all_picks_up_new_files() {
        let (_tmp, repo_path) = create_temp_repo();
        let vcs = GitVersionControl::new(&repo_path);

        std::fs::write(repo_path.join("new.txt"), "content\n").unwrap();
        let short = vcs.commit("add new file", true).unwrap();
        assert_eq!(short.len(), 8);

        // Working tree is clean afterward.
        let repo = Repository::open(&repo_path).unwrap();
        let statuses = repo.statuses(None).unwrap();
        assert!(statuses.is_empty());
    }

    #[test]
    fn delete_branch_refuses_current_branch() {
        let (_tmp, repo_path) = create_temp_repo();
        let vcs = GitVersionControl::new(&repo_path);
        let current = vcs.current_branch().unwrap();
        assert!(vcs.delete_branch(&current, false).is_err());
    }

    #[test]
    fn delete_branch_removes_other_branch() {
        let (_tmp, repo_path) = create_temp_repo();
        let vcs = GitVersionControl::new(&repo_path);
        let original = vcs.current_branch().unwrap();

        vcs.create_branch("feat/doomed").unwrap();
        vcs.checkout(&original).unwrap();
        vcs.delete_branch("feat/doomed", false).unwrap();

        let repo = Repository::open(&repo_path).unwrap();
        assert!(repo.find_branch("feat/doomed", git2::BranchType::Local).is_err());
    }

    #[test]
    fn discard_changes_restores_tracked_and_removes_untracked() {
        let (_tmp, repo_path) = create_temp_repo();
        let vcs = GitVersionControl::new(&repo_path);

        std::fs::write(repo_path.join("tracked.txt"), "v1\n").unwrap();
        vcs.commit("add tracked", true).unwrap();

        std::fs::write(repo_path.join("tracked.txt"), "dirty\n").unwrap();
        std::fs::write(repo_path.join("untracked.txt"), "junk\n").unwrap();

        vcs.discard_changes().unwrap();

        assert_eq!(
            std::fs::read_to_string(repo_path.join("tracked.txt")).unwrap(),
            "v1\n"
        );
        assert!(!repo_path.join("untracked.txt").exists());
    }

    #[test]
    fn merge_fast_forwards_feature_branch() {
        let (_tmp, repo_path) = create_temp_repo();
        let vcs = GitVersionControl::new(&repo_path);
        let original = vcs.current_branch().unwrap();

        vcs.create_branch("feat/merge-me").unwrap();
        std::fs::write(repo_path.join("feature.txt"), "feature\n").unwrap();
        vcs.commit("feature work", true).unwrap();

        vcs.checkout(&original).unwrap();
        vcs.merge_branch("feat/merge-me").unwrap();
        assert!(repo_path.join("feature.txt").exists());
    }

    #[test]
    fn compare_url_uses_origin_remote() {
        let (_tmp, repo_path) = create_temp_repo();
        {
            let repo = Repository::open(&repo_path).unwrap();
            repo.remote("origin", "git@github.com:acme/agent.git").unwrap();
        }
        let vcs = GitVersionControl::new(&repo_path);
        assert_eq!(
            vcs.compare_url("main", "feat/x").unwrap(),
            "https://github.com/acme/agent/compare/main...feat/x"
        );
    }

    #[test]
    fn compare_url_missing_remote_is_none() {
        let (_tmp, repo_path) = create_temp_repo();
        let vcs = GitVersionControl::new(&repo_path);
        assert!(vcs.compare_url("main", "feat/x").is_none());
    }

    #[test]
    fn normalizes_common_remote_forms() {
        assert_eq!(
            normalize_remote_url("https://github.com/acme/agent.git").unwrap(),
            "https://github.com/acme/agent"
        );
        assert_eq!(
            normalize_remote_url("git@github.com:acme/agent.git").unwrap(),
            "https://github.com/acme/agent"
        );
        assert_eq!(
            normalize_remote_url("ssh://git@github.com/acme/agent.git").unwrap(),
            "https://github.com/acme/agent"
        );
        assert!(normalize_remote_url("/srv/git/agent.git").is_none());
    }

    #[test]
    fn branch_name_includes_slug_from_summary() {
        let name = generate_branch_name("skill_ab12cd34", "Add weather forecast skill");
        assert_eq!(name, "feat/skill_ab12cd34-add-weather-forecast-skill");
        assert!(is_valid_git_ref(&name));
    }

    #[test]
    fn branch_name_falls_back_without_usable_slug() {
        assert_eq!(generate_branch_name("skill_ab12cd34", "!!!"), "feat/skill_ab12cd34");
        assert_eq!(generate_branch_name("skill_ab12cd34", ""), "feat/skill_ab12cd34");
    }

    #[test]
    fn branch_name_limits_slug_words() {
        let name = generate_branch_name("skill_x", "one two three four five six seven");
        assert_eq!(name, "feat/skill_x-one-two-three-four-five");
    }

    #[test]
    fn git_ref_validation_rejects_dangerous_names() {
        assert!(!is_valid_git_ref(""));
        assert!(!is_valid_git_ref("-flag"));
        assert!(!is_valid_git_ref("has space"));
        assert!(!is_valid_git_ref("a..b"));
        assert!(!is_valid_git_ref("name.lock"));
        assert!(!is_valid_git_ref("trailing/"));
        assert!(!is_valid_git_ref("semi;colon"));
        assert!(is_valid_git_ref("feat/skill_ab12cd34-weather"));
        assert!(is_valid_git_ref("fix/err_20250101_120000_ab"));
    }
}
