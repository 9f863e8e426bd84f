//! The approval coordinator: every pending request lives here until
//! the operator approves or rejects it, or it times out.
//!
//! Skill creation requests are transient; they sit in an in-memory
//! table and expire with a timer. Merge and error-fix requests are
//! durable; they live in the on-disk store and survive restarts.
//! Resolution removes the request from its table first, so a decision
//! and a timeout (or two copies of the same decision) can never both
//! act: whoever removes the entry runs the pipeline, everyone else
//! sees an already-handled request and does nothing.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;

use anneal_adapters::config::Settings;
use anneal_adapters::git::generate_branch_name;
use anneal_adapters::store::{ErrorLog, ErrorLogEntry, PendingStore};
use anneal_core::ports::{ChatId, CodeModel, MessageRef, Messenger, SkillRegistry, VersionControl};
use anneal_core::request::{
    new_merge_request_id, DurableRequest, ErrorFixRequest, SkillCreationRequest, SkillMergeRequest,
};
use anneal_core::skills::check_paths_allowed;

use crate::generate::ChangeGenerator;
use crate::llm::parse::ChangeProposal;
use crate::messages;
use crate::publish::BranchPublisher;

pub struct ApprovalCoordinator {
    settings: Settings,
    transient: Mutex<HashMap<String, SkillCreationRequest>>,
    /// Durable requests that could not be persisted; they survive for
    /// the process lifetime so an approval still finds them.
    unpersisted: Mutex<HashMap<String, DurableRequest>>,
    store: PendingStore,
    error_log: ErrorLog,
    messenger: Arc<dyn Messenger>,
    /// Held for the duration of any phase that touches the checkout.
    /// There is one working tree; concurrent resolutions must not
    /// interleave branch and commit operations on it.
    vcs_gate: Mutex<()>,
    vcs: Arc<dyn VersionControl>,
    registry: Arc<dyn SkillRegistry>,
    generator: ChangeGenerator,
}

impl ApprovalCoordinator {
    pub fn new(
        settings: Settings,
        messenger: Arc<dyn Messenger>,
        vcs: Arc<dyn VersionControl>,
        registry: Arc<dyn SkillRegistry>,
        model: Arc<dyn CodeModel>,
    ) -> Self {
        let state_dir = settings.state_dir();
        Self {
            generator: ChangeGenerator::new(model, settings.clone()),
            store: PendingStore::new(&state_dir),
            error_log: ErrorLog::new(&state_dir),
            settings,
            transient: Mutex::new(HashMap::new()),
            unpersisted: Mutex::new(HashMap::new()),
            vcs_gate: Mutex::new(()),
            messenger,
            vcs,
            registry,
        }
    }

    /// Durable requests still waiting for a decision. Used after a
    /// restart to tell the operator what is outstanding.
    pub fn pending_durable(&self) -> anyhow::Result<Vec<DurableRequest>> {
        self.store.all()
    }

    /// A requester asked for a capability the agent does not have.
    /// Registers the request, prompts the operator, arms the expiry
    /// timer, and returns the text to show the requester.
    pub async fn request_capability(
        self: &Arc<Self>,
        user_request: &str,
        requester_name: &str,
        requester_chat: ChatId,
    ) -> anyhow::Result<String> {
        let mut request = SkillCreationRequest::new(user_request, requester_name, requester_chat);
        let request_id = request.request_id.clone();
        tracing::info!(request_id = %request_id, "capability request received");

        let prompt = messages::skill_prompt(&request);
        let message_ref = match self
            .messenger
            .send_approval_prompt(self.settings.operator_chat, &prompt, &request_id)
            .await
        {
            Ok(message_ref) => message_ref,
            Err(e) => {
                // Without a prompt the operator can never resolve it,
                // so the request is not registered at all.
                return Err(anyhow::anyhow!("Failed to reach the operator: {}", e));
            }
        };
        request.message_ref = Some(message_ref);

        self.transient
            .lock()
            .await
            .insert(request_id.clone(), request);

        let coordinator = Arc::clone(self);
        let expire_id = request_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(coordinator.settings.approval_timeout).await;
            coordinator.expire(&expire_id).await;
        });

        Ok(messages::requester_ack(&request_id))
    }

    /// A skill execution failed at runtime. Records the failure and
    /// asks the operator whether to attempt a fix. Returns the request
    /// id.
    pub async fn request_error_fix(
        &self,
        error_type: &str,
        error_message: &str,
        skill: &str,
        action: &str,
        context: &str,
    ) -> anyhow::Result<String> {
        let request = ErrorFixRequest::new(error_type, error_message, skill, action, context);
        let request_id = request.request_id.clone();
        tracing::info!(request_id = %request_id, error_type, skill, "error fix request received");

        if let Err(e) = self.error_log.append(&ErrorLogEntry::Reported {
            id: request_id.clone(),
            error_type: request.error_type.clone(),
            error_message: request.error_message.clone(),
            skill: request.skill.clone(),
            action: request.action.clone(),
            context: request.context.clone(),
            at: request.created_at,
        }) {
            tracing::warn!(error = %e, "failed to append to error log");
        }

        // Persist before prompting, so an approval arriving after a
        // crash still finds the request.
        let durable = DurableRequest::ErrorFix(request.clone());
        self.insert_durable(durable).await;

        let prompt = messages::error_prompt(&request);
        match self
            .messenger
            .send_approval_prompt(self.settings.operator_chat, &prompt, &request_id)
            .await
        {
            Ok(message_ref) => self.set_durable_message_ref(&request_id, message_ref).await,
            Err(e) => {
                tracing::warn!(request_id = %request_id, error = %e, "failed to send error prompt");
            }
        }

        Ok(request_id)
    }

    /// The operator pressed approve or reject. Returns a short status
    /// line for the transport to acknowledge with. Safe to call any
    /// number of times; only the first call for a given id acts.
    pub async fn resolve(&self, request_id: &str, approved: bool) -> String {
        match self.take_durable(request_id).await {
            Some(DurableRequest::SkillMerge(request)) => {
                return self.run_merge(request, approved).await;
            }
            Some(DurableRequest::ErrorFix(request)) => {
                return self.run_fix(request, approved).await;
            }
            None => {}
        }

        let transient = self.transient.lock().await.remove(request_id);
        match transient {
            Some(request) => self.run_skill(request, approved).await,
            None => format!("Request {} not found or already handled.", request_id),
        }
    }

    async fn expire(&self, request_id: &str) {
        let request = match self.transient.lock().await.remove(request_id) {
            Some(request) => request,
            // Already resolved; the timer has nothing to do.
            None => return,
        };

        tracing::info!(request_id, "capability request expired");
        self.edit_operator(request.message_ref, &messages::skill_expired(&request))
            .await;
        self.notify(request.requester_chat, &messages::requester_expired())
            .await;
    }

    async fn insert_durable(&self, request: DurableRequest) {
        let request_id = request.request_id().to_string();
        if let Err(e) = self.store.insert(request.clone()) {
            tracing::error!(request_id = %request_id, error = %e, "failed to persist request, holding in memory");
            self.unpersisted.lock().await.insert(request_id, request);
        }
    }

    async fn take_durable(&self, request_id: &str) -> Option<DurableRequest> {
        match self.store.remove(request_id) {
            Ok(Some(request)) => return Some(request),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(request_id, error = %e, "pending store unavailable during resolve");
            }
        }
        self.unpersisted.lock().await.remove(request_id)
    }

    async fn set_durable_message_ref(&self, request_id: &str, message_ref: MessageRef) {
        match self.store.set_message_ref(request_id, message_ref) {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(request_id, error = %e, "failed to record prompt message");
            }
        }
        if let Some(request) = self.unpersisted.lock().await.get_mut(request_id) {
            request.set_message_ref(message_ref);
        }
    }

    // ------------------------------------------------------------------
    // Skill pipeline, phase one: generate and publish a review branch.
    // ------------------------------------------------------------------

    async fn run_skill(&self, request: SkillCreationRequest, approved: bool) -> String {
        if !approved {
            tracing::info!(request_id = %request.request_id, "capability request rejected");
            self.edit_operator(request.message_ref, &messages::skill_rejected(&request))
                .await;
            self.notify(request.requester_chat, &messages::requester_rejected())
                .await;
            return format!("Request {} rejected.", request.request_id);
        }

        self.edit_operator(request.message_ref, &messages::skill_processing(&request))
            .await;
        self.notify(request.requester_chat, &messages::requester_in_progress())
            .await;

        let proposal = match self.generator.capability(&request.user_request).await {
            Ok(Some(proposal)) if proposal.is_actionable(self.settings.min_confidence) => proposal,
            Ok(other) => {
                let analysis = other.map(|p| p.analysis).unwrap_or_default();
                self.edit_operator(
                    request.message_ref,
                    &messages::skill_not_possible(&request, &analysis),
                )
                .await;
                self.notify(request.requester_chat, &messages::requester_failed())
                    .await;
                return format!("Request {}: no usable change generated.", request.request_id);
            }
            Err(e) => {
                return self.skill_failed(&request, &e.to_string()).await;
            }
        };

        let branch = generate_branch_name(&request.request_id, &proposal.summary);
        let outcome = match self.publish_blocking(branch.clone(), proposal).await {
            Ok(outcome) => outcome,
            Err(e) => {
                return self.skill_failed(&request, &e.to_string()).await;
            }
        };

        let merge_request = SkillMergeRequest {
            request_id: new_merge_request_id(),
            user_request: request.user_request.clone(),
            requester_name: request.requester_name.clone(),
            requester_chat: request.requester_chat,
            branch_name: outcome.branch.clone(),
            base_branch: outcome.base_branch.clone(),
            compare_url: outcome.compare_url.clone(),
            summary: outcome.commit_message.clone(),
            commit_message: outcome.commit_message.clone(),
            files_changed: outcome.files_changed.clone(),
            created_at: Utc::now(),
            message_ref: None,
        };
        let merge_id = merge_request.request_id.clone();

        // Persisted before the prompt goes out, same as error fixes.
        self.insert_durable(DurableRequest::SkillMerge(merge_request.clone()))
            .await;

        let prompt = messages::merge_prompt(&merge_request);
        match self
            .messenger
            .send_approval_prompt(self.settings.operator_chat, &prompt, &merge_id)
            .await
        {
            Ok(message_ref) => self.set_durable_message_ref(&merge_id, message_ref).await,
            Err(e) => {
                tracing::warn!(request_id = %merge_id, error = %e, "failed to send merge prompt");
            }
        }

        self.edit_operator(
            request.message_ref,
            &messages::skill_branch_ready(&request, &outcome.branch),
        )
        .await;

        format!(
            "Request {}: branch {} published, merge approval pending as {}.",
            request.request_id, outcome.branch, merge_id
        )
    }

    async fn skill_failed(&self, request: &SkillCreationRequest, reason: &str) -> String {
        tracing::error!(request_id = %request.request_id, reason, "skill pipeline failed");
        self.edit_operator(request.message_ref, &messages::skill_failed(request, reason))
            .await;
        self.notify(request.requester_chat, &messages::requester_failed())
            .await;
        format!("Request {} failed: {}", request.request_id, reason)
    }

    // ------------------------------------------------------------------
    // Skill pipeline, phase two: merge or discard the review branch.
    // ------------------------------------------------------------------

    async fn run_merge(&self, request: SkillMergeRequest, approved: bool) -> String {
        if !approved {
            tracing::info!(request_id = %request.request_id, branch = %request.branch_name, "merge rejected");
            let branch = request.branch_name.clone();
            let base = request.base_branch.clone();
            if let Err(e) = self
                .vcs_blocking(move |publisher| publisher.discard(&branch, &base))
                .await
            {
                tracing::warn!(request_id = %request.request_id, error = %e, "discard incomplete");
            }
            self.edit_operator(request.message_ref, &messages::merge_rejected(&request))
                .await;
            self.notify(request.requester_chat, &messages::requester_rejected())
                .await;
            return format!("Merge {} rejected, branch discarded.", request.request_id);
        }

        self.edit_operator(request.message_ref, &messages::merge_processing(&request))
            .await;

        let branch = request.branch_name.clone();
        let base = request.base_branch.clone();
        match self
            .vcs_blocking(move |publisher| publisher.merge(&branch, &base))
            .await
        {
            Ok(()) => {
                if let Err(e) = self.registry.reload().await {
                    tracing::warn!(error = %e, "skill registry reload failed after merge");
                }
                self.edit_operator(request.message_ref, &messages::merge_done(&request))
                    .await;
                self.notify(request.requester_chat, &messages::requester_live())
                    .await;
                format!("Merge {} completed.", request.request_id)
            }
            Err(e) => {
                tracing::error!(request_id = %request.request_id, error = %e, "merge failed");
                self.edit_operator(
                    request.message_ref,
                    &messages::merge_failed(&request, &e.to_string()),
                )
                .await;
                self.notify(request.requester_chat, &messages::requester_failed())
                    .await;
                format!("Merge {} failed: {}", request.request_id, e)
            }
        }
    }

    // ------------------------------------------------------------------
    // Fix pipeline: generate, apply, and commit directly.
    // ------------------------------------------------------------------

    async fn run_fix(&self, request: ErrorFixRequest, approved: bool) -> String {
        if !approved {
            tracing::info!(request_id = %request.request_id, "error fix rejected");
            self.edit_operator(request.message_ref, &messages::error_rejected(&request))
                .await;
            self.log_resolution(&request.request_id, "rejected by operator");
            return format!("Fix {} rejected.", request.request_id);
        }

        self.edit_operator(request.message_ref, &messages::error_processing(&request))
            .await;

        let proposal = match self.generator.error_fix(&request).await {
            Ok(Some(proposal)) if proposal.is_actionable(self.settings.min_confidence) => proposal,
            Ok(other) => {
                let analysis = other.map(|p| p.analysis).unwrap_or_default();
                self.edit_operator(
                    request.message_ref,
                    &messages::fix_not_possible(&request, &analysis),
                )
                .await;
                self.log_resolution(&request.request_id, "no usable fix generated");
                return format!("Fix {}: no usable fix generated.", request.request_id);
            }
            Err(e) => {
                self.edit_operator(
                    request.message_ref,
                    &messages::fix_failed(&request, &e.to_string()),
                )
                .await;
                self.log_resolution(&request.request_id, "generation failed");
                return format!("Fix {} failed: {}", request.request_id, e);
            }
        };

        if let Err(e) = check_paths_allowed(&proposal.changes, &self.settings.allowed_roots()) {
            self.edit_operator(request.message_ref, &messages::fix_failed(&request, &e))
                .await;
            self.log_resolution(&request.request_id, "proposal touched forbidden paths");
            return format!("Fix {} rejected: {}", request.request_id, e);
        }

        let commit_message = proposal
            .commit_message
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| format!("Fix {}", request.request_id));

        match self.apply_and_commit_blocking(proposal, commit_message.clone()).await {
            Ok(files) => {
                if let Err(e) = self.registry.reload().await {
                    tracing::warn!(error = %e, "skill registry reload failed after fix");
                }
                self.edit_operator(
                    request.message_ref,
                    &messages::fix_committed(&request, &files, &commit_message),
                )
                .await;
                self.log_resolution(&request.request_id, &format!("fix committed: {}", commit_message));
                format!("Fix {} committed.", request.request_id)
            }
            Err(e) => {
                self.edit_operator(
                    request.message_ref,
                    &messages::fix_failed(&request, &e.to_string()),
                )
                .await;
                self.log_resolution(&request.request_id, "fix could not be applied");
                format!("Fix {} failed: {}", request.request_id, e)
            }
        }
    }

    /// Apply a fix proposal to the working tree and commit it. On any
    /// failure the working tree is restored; nothing half-applied is
    /// ever committed.
    async fn apply_and_commit_blocking(
        &self,
        proposal: ChangeProposal,
        commit_message: String,
    ) -> anyhow::Result<Vec<String>> {
        let vcs = Arc::clone(&self.vcs);
        let root = self.settings.project_root.clone();

        let _gate = self.vcs_gate.lock().await;
        tokio::task::spawn_blocking(move || {
            let report = match anneal_core::patch::apply_changes(&proposal.changes, &root) {
                Ok(report) if report.success() => report,
                Ok(report) => {
                    if let Err(e) = vcs.discard_changes() {
                        tracing::warn!(error = %e, "failed to restore working tree");
                    }
                    return Err(anyhow::anyhow!(
                        "Edits could not be applied:\n{}",
                        report.error_summary()
                    ));
                }
                Err(e) => {
                    if let Err(restore) = vcs.discard_changes() {
                        tracing::warn!(error = %restore, "failed to restore working tree");
                    }
                    return Err(anyhow::anyhow!("Failed to apply changes: {}", e));
                }
            };

            if let Err(e) = vcs.commit(&commit_message, true) {
                if let Err(restore) = vcs.discard_changes() {
                    tracing::warn!(error = %restore, "failed to restore working tree");
                }
                return Err(anyhow::anyhow!("Failed to commit fix: {}", e));
            }

            if let Err(e) = vcs.push(false) {
                // The fix is committed locally; a push failure is worth
                // a warning but not a rollback.
                tracing::warn!(error = %e, "failed to push fix commit");
            }

            Ok(report
                .touched_paths()
                .iter()
                .map(|p| p.display().to_string())
                .collect())
        })
        .await?
    }

    async fn publish_blocking(
        &self,
        branch: String,
        proposal: ChangeProposal,
    ) -> anyhow::Result<crate::publish::PublishOutcome> {
        let vcs = Arc::clone(&self.vcs);
        let root = self.settings.project_root.clone();
        let allowed = self.settings.allowed_roots();
        let _gate = self.vcs_gate.lock().await;
        tokio::task::spawn_blocking(move || {
            BranchPublisher::new(vcs, root, allowed).publish(&branch, &proposal)
        })
        .await?
    }

    async fn vcs_blocking<F>(&self, f: F) -> anyhow::Result<()>
    where
        F: FnOnce(BranchPublisher) -> anyhow::Result<()> + Send + 'static,
    {
        let publisher = BranchPublisher::new(
            Arc::clone(&self.vcs),
            self.settings.project_root.clone(),
            self.settings.allowed_roots(),
        );
        let _gate = self.vcs_gate.lock().await;
        tokio::task::spawn_blocking(move || f(publisher)).await?
    }

    async fn edit_operator(&self, message_ref: Option<MessageRef>, text: &str) {
        let result = match message_ref {
            Some(message_ref) => {
                self.messenger
                    .edit_message(self.settings.operator_chat, message_ref, text)
                    .await
            }
            None => {
                self.messenger
                    .send_message(self.settings.operator_chat, text)
                    .await
            }
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to update operator message");
        }
    }

    async fn notify(&self, chat: ChatId, text: &str) {
        if let Err(e) = self.messenger.send_message(chat, text).await {
            tracing::warn!(error = %e, "failed to notify requester");
        }
    }

    fn log_resolution(&self, request_id: &str, resolution: &str) {
        if let Err(e) = self.error_log.append(&ErrorLogEntry::Resolved {
            id: request_id.to_string(),
            resolution: resolution.to_string(),
            at: Utc::now(),
        }) {
            tracing::warn!(error = %e, "failed to append resolution to error log");
        }
    }
}
