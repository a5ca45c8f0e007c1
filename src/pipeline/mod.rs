//! Story pipeline — consumes one queued item end-to-end.
//!
//! Stages: entry guard → fetch → branch → code → (review | blocked), with
//! crash rollback. Every stage that touches the shared clone is idempotent:
//! double dispatch from the at-least-once queue re-runs delete-then-recreate
//! branch setup and force-clean preparation without damage.
//!
//! Terminal outcomes always reach the board; an unhandled error rolls the
//! item back to Ready and leaves a retry signal so the poller re-dispatches
//! it without waiting for a full status round trip.

pub mod merge;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::agent::{CodingAgent, StoryContext};
use crate::approvals::{ArtifactApprover, is_run_artifact};
use crate::config::Settings;
use crate::db::DbHandle;
use crate::git::Vcs;
use crate::github::{Board, IssueHost, branch_name_for};
use crate::llm::{Completions, PR_DESCRIPTION_SYSTEM, pr_description_prompt};
use crate::memory::MemoryStore;
use crate::models::{BoardStatus, ProcessOutcome};
use crate::queue::WorkQueue;

/// Characters of each recorded error shown in the blocked comment.
const ERROR_EXCERPT_LEN: usize = 200;

pub struct StoryPipeline {
    settings: Settings,
    board: Arc<dyn Board>,
    host: Arc<dyn IssueHost>,
    queue: Arc<dyn WorkQueue>,
    ledger: DbHandle,
    agent: Arc<dyn CodingAgent>,
    llm: Arc<dyn Completions>,
    vcs: Arc<dyn Vcs>,
    memory: MemoryStore,
    approver: ArtifactApprover,
}

impl StoryPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Settings,
        board: Arc<dyn Board>,
        host: Arc<dyn IssueHost>,
        queue: Arc<dyn WorkQueue>,
        ledger: DbHandle,
        agent: Arc<dyn CodingAgent>,
        llm: Arc<dyn Completions>,
        vcs: Arc<dyn Vcs>,
        memory: MemoryStore,
        approver: ArtifactApprover,
    ) -> Self {
        Self {
            settings,
            board,
            host,
            queue,
            ledger,
            agent,
            llm,
            vcs,
            memory,
            approver,
        }
    }

    /// Process a story end-to-end. Never panics and never returns `Err`:
    /// every failure mode is folded into the outcome and mirrored to the
    /// board/ledger.
    pub async fn process(&self, issue_number: u64) -> ProcessOutcome {
        tracing::info!(issue_number, "pipeline.start");

        // Entry guard: stories that already burned their retries go straight
        // to Blocked without touching the workspace or the agent.
        match self.check_retry_guard(issue_number).await {
            Ok(Some(outcome)) => return outcome,
            Ok(None) => {}
            Err(e) => {
                let msg = format!("{:#}", e);
                tracing::error!(issue_number, error = %msg, "pipeline.guard_error");
                return ProcessOutcome::error(issue_number, msg);
            }
        }

        // One ledger row per dispatch attempt.
        let job = match self.ledger.call(move |db| db.create_job(issue_number)).await {
            Ok(job) => job,
            Err(e) => {
                let msg = format!("{:#}", e);
                tracing::error!(issue_number, error = %msg, "pipeline.ledger_error");
                return ProcessOutcome::error(issue_number, msg);
            }
        };

        match self.attempt(issue_number, job.id).await {
            Ok(outcome) => outcome,
            Err(e) => self.rollback_to_ready(issue_number, job.id, e).await,
        }
    }

    /// Returns the blocked outcome when the retry budget is exhausted.
    async fn check_retry_guard(&self, issue_number: u64) -> Result<Option<ProcessOutcome>> {
        let failed = self
            .ledger
            .call(move |db| db.count_failed(issue_number))
            .await?;
        if failed < self.settings.max_retries {
            return Ok(None);
        }

        tracing::error!(issue_number, retries = failed, "pipeline.max_retries_exceeded");

        // Park it in Blocked — do NOT move back to Ready.
        if let Err(e) = self.move_item(issue_number, BoardStatus::Blocked).await {
            tracing::error!(issue_number, error = %format!("{:#}", e), "pipeline.move_blocked_failed");
        }

        let recent = self
            .ledger
            .call(move |db| db.recent_failure_messages(issue_number, 3))
            .await
            .unwrap_or_default();
        let error_summary = if recent.is_empty() {
            "(no details recorded)".to_string()
        } else {
            recent
                .iter()
                .map(|e| format!("- {}", excerpt(e, ERROR_EXCERPT_LEN)))
                .collect::<Vec<_>>()
                .join("\n")
        };

        let comment = format!(
            "**Blocked after {failed} failed attempts**\n\n\
             This story has been moved to *Blocked* because it failed {failed} times \
             (max retries: {max}).\n\n\
             **Recent errors:**\n{errors}\n\n\
             To retry, move the item back to *Ready* on the project board.",
            failed = failed,
            max = self.settings.max_retries,
            errors = error_summary,
        );
        if let Err(e) = self.host.comment_on_issue(issue_number, &comment).await {
            tracing::error!(issue_number, error = %format!("{:#}", e), "pipeline.blocked_comment_failed");
        }

        Ok(Some(ProcessOutcome::blocked(
            issue_number,
            format!("Exceeded max retries ({})", self.settings.max_retries),
        )))
    }

    /// The fallible body of the pipeline. Any `Err` here triggers the
    /// rollback-to-ready path in `process`.
    async fn attempt(&self, issue_number: u64, job_id: i64) -> Result<ProcessOutcome> {
        // Fetching
        let issue = self
            .host
            .issue(issue_number)
            .await
            .context("fetch issue detail")?;
        {
            let title = issue.title.clone();
            self.ledger
                .call(move |db| db.set_job_title(job_id, &title))
                .await?;
        }

        // Branching
        self.move_item(issue_number, BoardStatus::InProgress).await?;

        self.vcs
            .prepare(&self.settings.base_branch)
            .await
            .context("prepare workspace")?;

        let branch_name = branch_name_for(issue_number, &issue.title, &issue.labels);
        let base_branch = self.determine_base_branch().await;
        let actual_base = self
            .vcs
            .create_branch(&branch_name, &base_branch, &self.settings.base_branch)
            .await
            .context("create feature branch")?;
        if actual_base != self.settings.base_branch {
            tracing::info!(base = %actual_base, "pipeline.stacking");
        }

        // Coding
        let context = self
            .memory
            .build_story_context(&issue.title, &issue.body, &issue.labels)
            .await;
        let story = StoryContext {
            issue_number,
            title: issue.title.clone(),
            body: issue.body.clone(),
            labels: issue.labels.clone(),
            context,
        };
        let result = self.agent.run(&story).await.context("run coding agent")?;

        if !result.success {
            return self
                .finish_blocked(issue_number, job_id, &result.error, &result.files_changed, result.passes_used)
                .await;
        }

        // Generated run artifacts need human sign-off before anything
        // executes them.
        for file in result.files_changed.iter().filter(|f| is_run_artifact(f)) {
            if !self.approver.check(file, "Generated by the coding agent").await {
                let error = format!("generated artifact {} was not approved", file);
                return self
                    .finish_blocked(issue_number, job_id, &error, &result.files_changed, result.passes_used)
                    .await;
            }
        }

        // Commit and push. An empty diff is a skipped no-op, not an error.
        let commit_message = format!(
            "feat(#{}): {}\n\nImplemented by storybot",
            issue_number, issue.title
        );
        self.vcs
            .commit_all(&commit_message)
            .await
            .context("commit changes")?;
        self.vcs.push(&branch_name).await.context("push feature branch")?;

        // PR against the stacked or default base — never the primary.
        if self.settings.is_primary_branch(&actual_base) {
            anyhow::bail!(
                "refusing to open a review request against primary branch {}",
                actual_base
            );
        }
        let pr_body = self
            .llm
            .complete(
                &pr_description_prompt(
                    &issue.title,
                    &issue.body,
                    &result.files_changed,
                    &result.test_output,
                ),
                PR_DESCRIPTION_SYSTEM,
            )
            .await
            .context("generate PR description")?;
        let pr_number = self
            .host
            .create_pull(
                &format!("feat(#{}): {}", issue_number, issue.title),
                &pr_body,
                &branch_name,
                &actual_base,
                Some(issue_number),
            )
            .await
            .context("create pull request")?;

        self.move_item(issue_number, BoardStatus::InReview).await?;

        {
            let branch = branch_name.clone();
            let files = result.files_changed.clone();
            let passes = result.passes_used;
            self.ledger
                .call(move |db| db.seal_success(job_id, pr_number, &branch, &files, passes))
                .await?;
        }

        // Fold what we learned back into persistent memory (best effort).
        let new_facts = format!(
            "Completed story #{}: {}\nBranch: {}, PR: #{}\nFiles: {}\nPasses: {}",
            issue_number,
            issue.title,
            branch_name,
            pr_number,
            result.files_changed.join(", "),
            result.passes_used,
        );
        self.memory
            .compress_and_save(self.llm.as_ref(), &new_facts)
            .await;

        tracing::info!(issue_number, pr_number, branch = %branch_name, "pipeline.succeeded");
        Ok(ProcessOutcome::success(issue_number, pr_number, branch_name))
    }

    /// Normal terminal failure: the agent ran out of road. Board → Blocked,
    /// explanatory comment, failed ledger row. Not an error path — no
    /// recycle signal.
    async fn finish_blocked(
        &self,
        issue_number: u64,
        job_id: i64,
        error: &str,
        files_changed: &[String],
        passes_used: u32,
    ) -> Result<ProcessOutcome> {
        self.move_item(issue_number, BoardStatus::Blocked).await?;

        let comment = format!(
            "Unable to complete this story.\n\n\
             **Error:** {}\n\
             **Passes used:** {}\n\
             **Files changed:** {}\n\n\
             The story has been moved to *Blocked*.",
            error,
            passes_used,
            if files_changed.is_empty() {
                "none".to_string()
            } else {
                files_changed.join(", ")
            },
        );
        if let Err(e) = self.host.comment_on_issue(issue_number, &comment).await {
            tracing::error!(issue_number, error = %format!("{:#}", e), "pipeline.blocked_comment_failed");
        }

        {
            let error = error.to_string();
            let files = files_changed.to_vec();
            self.ledger
                .call(move |db| db.seal_failure(job_id, &error, &files, passes_used))
                .await?;
        }

        tracing::warn!(issue_number, error, "pipeline.blocked");
        Ok(ProcessOutcome::blocked(issue_number, error))
    }

    /// Crash path: move the item back to the trigger status, leave a retry
    /// signal, and record the failure. Crashes are always retryable (still
    /// bounded by the entry guard).
    async fn rollback_to_ready(
        &self,
        issue_number: u64,
        job_id: i64,
        error: anyhow::Error,
    ) -> ProcessOutcome {
        let msg = format!("{:#}", error);
        tracing::error!(issue_number, error = %msg, "pipeline.crashed");

        match self.move_item(issue_number, BoardStatus::Ready).await {
            Ok(()) => {
                tracing::info!(issue_number, "pipeline.moved_back_to_ready");
                if let Err(e) = self.queue.add_retry_signal(issue_number).await {
                    tracing::error!(issue_number, error = %e, "pipeline.retry_signal_failed");
                }
            }
            Err(e) => {
                tracing::error!(issue_number, error = %format!("{:#}", e), "pipeline.move_back_failed");
            }
        }

        {
            let error = msg.clone();
            if let Err(e) = self
                .ledger
                .call(move |db| db.seal_failure(job_id, &error, &[], 0))
                .await
            {
                tracing::error!(issue_number, error = %format!("{:#}", e), "pipeline.seal_failure_error");
            }
        }

        ProcessOutcome::error(issue_number, msg)
    }

    /// Base ref selection: stack on the head of an open review request
    /// targeting the default base when that head still exists on the remote;
    /// otherwise (or on any lookup error) use the default base.
    async fn determine_base_branch(&self) -> String {
        let default = self.settings.base_branch.clone();
        let pulls = match self.host.open_pulls(&default).await {
            Ok(pulls) => pulls,
            Err(e) => {
                tracing::warn!(error = %format!("{:#}", e), "pipeline.base_lookup_failed");
                return default;
            }
        };

        for pull in pulls {
            match self.host.branch_exists(&pull.head).await {
                Ok(true) => {
                    tracing::info!(base = %pull.head, pr_number = pull.number, "pipeline.stacking_base");
                    return pull.head;
                }
                Ok(false) => {
                    tracing::warn!(branch = %pull.head, "pipeline.stacking_base_gone");
                }
                Err(e) => {
                    tracing::warn!(branch = %pull.head, error = %format!("{:#}", e), "pipeline.branch_check_failed");
                }
            }
        }
        default
    }

    /// Move the board item for an issue. A missing item is logged, not
    /// fatal — the issue may have been removed from the board mid-run.
    async fn move_item(&self, issue_number: u64, status: BoardStatus) -> Result<()> {
        let items = self.board.items().await?;
        match items.iter().find(|i| i.issue_number == issue_number) {
            Some(item) => {
                self.board.set_status(&item.item_id, status).await?;
                Ok(())
            }
            None => {
                tracing::warn!(issue_number, status = %status, "pipeline.item_not_found");
                Ok(())
            }
        }
    }
}

/// First `max` characters of a string, respecting char boundaries.
fn excerpt(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
