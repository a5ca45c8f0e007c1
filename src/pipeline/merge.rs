//! Merge pipeline — lands an approved review request.
//!
//! Primary path is the tracker's native rebase-merge. When the host refuses,
//! a local rebase onto the target plus a force-push-with-lease gets one more
//! native attempt. Conflicts abort the rebase so the shared clone is never
//! left mid-rebase, and the request is handed back to a human.

use std::sync::Arc;

use anyhow::Result;

use crate::config::Settings;
use crate::git::Vcs;
use crate::github::{IssueHost, NativeMerge, PullRequest};
use crate::models::{MergeOutcome, MergeStatus};

pub struct MergePipeline {
    settings: Settings,
    host: Arc<dyn IssueHost>,
    /// Local clone for the rebase fallback; `None` when this worker has no
    /// workspace (merge-only deployments).
    vcs: Option<Arc<dyn Vcs>>,
}

impl MergePipeline {
    pub fn new(settings: Settings, host: Arc<dyn IssueHost>, vcs: Option<Arc<dyn Vcs>>) -> Self {
        Self {
            settings,
            host,
            vcs,
        }
    }

    /// Merge an approved request. Never panics and never returns `Err`;
    /// failures fold into the outcome taxonomy.
    pub async fn merge(&self, pr_number: u64) -> MergeOutcome {
        tracing::info!(pr_number, "merge.start");
        let outcome = match self.attempt(pr_number).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let msg = format!("{:#}", e);
                tracing::error!(pr_number, error = %msg, "merge.error");
                MergeOutcome::new(pr_number, MergeStatus::Failed, false, msg)
            }
        };

        // Only unresolved-conflict and generic-failure outcomes go back to a
        // human for a fresh review. Precondition violations do not.
        if matches!(outcome.status, MergeStatus::Conflict | MergeStatus::Failed) {
            self.request_new_review(&outcome).await;
        }

        tracing::info!(
            pr_number,
            status = outcome.status.as_str(),
            complex = outcome.complex,
            "merge.finished"
        );
        outcome
    }

    async fn attempt(&self, pr_number: u64) -> Result<MergeOutcome> {
        let pull = self.host.pull(pr_number).await?;

        // Preconditions are non-retryable and checked before any merge call.
        if !self.host.is_approved(pr_number).await? {
            return Ok(MergeOutcome::new(
                pr_number,
                MergeStatus::NotApproved,
                false,
                "request has no approved review",
            ));
        }
        if self.settings.is_primary_branch(&pull.base) {
            return Ok(MergeOutcome::new(
                pr_number,
                MergeStatus::ProtectedBranch,
                false,
                format!("request targets protected branch {}", pull.base),
            ));
        }

        match self.host.rebase_merge(pr_number).await {
            Ok(NativeMerge::Merged) => Ok(MergeOutcome::new(
                pr_number,
                MergeStatus::Merged,
                false,
                "cleanly rebased and merged",
            )),
            Ok(NativeMerge::Rejected { reason }) => {
                tracing::warn!(pr_number, %reason, "merge.native_rejected");
                self.local_rebase_fallback(&pull, &reason).await
            }
            Err(e) => {
                let reason = format!("{:#}", e);
                tracing::warn!(pr_number, %reason, "merge.native_failed");
                self.local_rebase_fallback(&pull, &reason).await
            }
        }
    }

    /// Rebase the source branch onto the target locally and retry the
    /// native merge. Requires a local clone.
    async fn local_rebase_fallback(
        &self,
        pull: &PullRequest,
        primary_reason: &str,
    ) -> Result<MergeOutcome> {
        let Some(vcs) = &self.vcs else {
            return Ok(MergeOutcome::new(
                pull.number,
                MergeStatus::Conflict,
                true,
                format!(
                    "native merge failed ({}) and no local clone is available for a rebase",
                    primary_reason
                ),
            ));
        };

        vcs.prepare(&self.settings.base_branch).await?;
        vcs.checkout_remote(&pull.head).await?;

        if !vcs.rebase_onto(&pull.base).await? {
            // rebase_onto already aborted; the clone is clean.
            return Ok(MergeOutcome::new(
                pull.number,
                MergeStatus::Conflict,
                true,
                format!(
                    "rebase of {} onto {} hit conflicts that need manual resolution",
                    pull.head, pull.base
                ),
            ));
        }

        vcs.force_push_with_lease(&pull.head).await?;

        match self.host.rebase_merge(pull.number).await {
            Ok(NativeMerge::Merged) => Ok(MergeOutcome::new(
                pull.number,
                MergeStatus::MergedViaLocalRebase,
                true,
                "merged after local rebase",
            )),
            Ok(NativeMerge::Rejected { reason }) => Ok(MergeOutcome::new(
                pull.number,
                MergeStatus::Failed,
                false,
                format!("merge still rejected after local rebase: {}", reason),
            )),
            Err(e) => Ok(MergeOutcome::new(
                pull.number,
                MergeStatus::Failed,
                false,
                format!("merge retry failed after local rebase: {:#}", e),
            )),
        }
    }

    /// Ask a human for a fresh review via a PR comment. Best effort.
    async fn request_new_review(&self, outcome: &MergeOutcome) {
        let body = format!(
            "This request could not be merged automatically and needs attention.\n\n\
             **Status:** {}\n\
             **Details:** {}\n\n\
             Please resolve and re-approve.",
            outcome.status.as_str(),
            outcome.message,
        );
        if let Err(e) = self.host.comment_on_pull(outcome.pr_number, &body).await {
            tracing::error!(
                pr_number = outcome.pr_number,
                error = %format!("{:#}", e),
                "merge.review_request_failed"
            );
        }
    }
}
