//! Dispatch engine — periodically checks the project board for ready work.
//!
//! Polling replaces webhooks so the service can run behind NAT/firewalls
//! without inbound connectivity. Each tick scans the board for items in the
//! trigger status and promotes at most one into the queue (board order =
//! priority), then scans open review requests for fresh approvals and
//! enqueues merges.
//!
//! The seen/left sets are process-lifetime state, initialized empty on every
//! start; the recovery scan is the cross-restart substitute. A dispatched
//! issue becomes eligible again only after it demonstrably leaves the
//! trigger status and returns, or via an explicit retry signal from the
//! pipeline (which covers a full ready → in-progress → ready round trip
//! inside one poll window).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::config::Settings;
use crate::github::{Board, IssueHost};
use crate::models::BoardStatus;
use crate::queue::{JobKind, WorkQueue};

pub struct Poller {
    board: Arc<dyn Board>,
    host: Arc<dyn IssueHost>,
    queue: Arc<dyn WorkQueue>,
    trigger: BoardStatus,
    base_branch: String,
    interval: Duration,
    /// Issues already promoted into the queue this process lifetime.
    seen_issues: HashSet<u64>,
    /// Dispatched issues observed to have left the trigger status since.
    left_trigger: HashSet<u64>,
    /// Review requests whose approval was already acted on.
    seen_approved_pulls: HashSet<u64>,
}

impl Poller {
    pub fn new(
        board: Arc<dyn Board>,
        host: Arc<dyn IssueHost>,
        queue: Arc<dyn WorkQueue>,
        settings: &Settings,
    ) -> Self {
        Self {
            board,
            host,
            queue,
            trigger: BoardStatus::Ready,
            base_branch: settings.base_branch.clone(),
            interval: Duration::from_secs(settings.poll_interval_secs),
            seen_issues: HashSet::new(),
            left_trigger: HashSet::new(),
            seen_approved_pulls: HashSet::new(),
        }
    }

    /// Issue numbers already dispatched (read-only copy).
    pub fn seen_issues(&self) -> HashSet<u64> {
        self.seen_issues.clone()
    }

    /// Manually mark an issue so the poller won't trigger it again.
    pub fn mark_seen(&mut self, issue_number: u64) {
        self.seen_issues.insert(issue_number);
    }

    /// Run forever. Every failure inside a tick is logged and swallowed;
    /// the sleep happens regardless of outcome.
    pub async fn run(mut self) {
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            trigger = %self.trigger,
            "poller.starting"
        );
        loop {
            self.tick().await;
            tokio::time::sleep(self.interval).await;
        }
    }

    /// One poll cycle: board scan then approval scan, each error-isolated.
    pub async fn tick(&mut self) {
        if let Err(e) = self.poll_board().await {
            tracing::error!(error = %format!("{:#}", e), "poller.board_scan_error");
        }
        if let Err(e) = self.poll_approvals().await {
            tracing::error!(error = %format!("{:#}", e), "poller.approval_scan_error");
        }
    }

    /// Fetch board items and promote the highest-priority ready item.
    ///
    /// Items come back in board order (top-to-bottom = priority). Only ONE
    /// item is dispatched per cycle to avoid overwhelming the agent.
    async fn poll_board(&mut self) -> Result<()> {
        let items = self.board.items().await?;

        let status_by_issue: HashMap<u64, (&str, Option<BoardStatus>)> = items
            .iter()
            .map(|item| (item.issue_number, (item.status_label.as_str(), item.status)))
            .collect();

        // Track dispatched issues that have left the trigger status. An
        // empty label means the board has no status recorded — that is not
        // "left".
        for issue in self.seen_issues.iter().copied() {
            if let Some((label, status)) = status_by_issue.get(&issue)
                && !label.is_empty()
                && *status != Some(self.trigger)
            {
                self.left_trigger.insert(issue);
            }
        }

        let ready_issues: HashSet<u64> = items
            .iter()
            .filter(|item| item.status == Some(self.trigger))
            .map(|item| item.issue_number)
            .collect();

        // Recycle: an issue that left the trigger status and came back is
        // eligible again (a crashed pipeline rolled it back to Ready).
        let recycled: Vec<u64> = self
            .left_trigger
            .intersection(&ready_issues)
            .copied()
            .collect();
        if !recycled.is_empty() {
            tracing::info!(issues = ?recycled, "poller.recycling_seen");
            for issue in &recycled {
                self.seen_issues.remove(issue);
                self.left_trigger.remove(issue);
            }
        }

        // Retry signals cover the round trip that happens faster than one
        // poll window (the tick never saw the item leave). Signal errors
        // must not stop the scan.
        match self.queue.retry_signals().await {
            Ok(signals) => {
                for issue in signals {
                    if self.seen_issues.contains(&issue) && ready_issues.contains(&issue) {
                        tracing::info!(issue_number = issue, "poller.signal_recycling");
                        self.seen_issues.remove(&issue);
                        self.left_trigger.remove(&issue);
                        if let Err(e) = self.queue.remove_retry_signal(issue).await {
                            tracing::error!(
                                issue_number = issue,
                                error = %e,
                                "poller.signal_remove_error"
                            );
                        }
                    }
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "poller.signal_check_error");
            }
        }

        for item in &items {
            if item.status != Some(self.trigger) {
                continue;
            }
            if self.seen_issues.contains(&item.issue_number) {
                continue;
            }

            // Highest-priority ready item — dispatch it and stop.
            tracing::info!(
                issue_number = item.issue_number,
                title = %item.title,
                "poller.triggered"
            );
            self.seen_issues.insert(item.issue_number);

            if let Err(e) = self
                .queue
                .enqueue(JobKind::ProcessStory {
                    issue_number: item.issue_number,
                })
                .await
            {
                tracing::error!(
                    issue_number = item.issue_number,
                    error = %e,
                    "poller.enqueue_error"
                );
            }
            break;
        }

        Ok(())
    }

    /// Check open review requests for approvals and enqueue merges.
    ///
    /// Each request fires the merge exactly once — the first time an
    /// APPROVED review is observed.
    async fn poll_approvals(&mut self) -> Result<()> {
        let pulls = self.host.open_pulls(&self.base_branch).await?;

        for pull in pulls {
            if self.seen_approved_pulls.contains(&pull.number) {
                continue;
            }
            match self.host.is_approved(pull.number).await {
                Ok(true) => {
                    tracing::info!(pr_number = pull.number, "poller.pull_approved");
                    self.seen_approved_pulls.insert(pull.number);
                    if let Err(e) = self
                        .queue
                        .enqueue(JobKind::MergePull {
                            pr_number: pull.number,
                        })
                        .await
                    {
                        tracing::error!(
                            pr_number = pull.number,
                            error = %e,
                            "poller.merge_enqueue_error"
                        );
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(
                        pr_number = pull.number,
                        error = %format!("{:#}", e),
                        "poller.review_check_error"
                    );
                }
            }
        }

        Ok(())
    }
}
