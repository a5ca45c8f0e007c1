//! Startup recovery — heals whole-process crashes mid-pipeline.
//!
//! Runs once before the poller starts. Items the previous process left in
//! "In progress" with no matching live queue job are demoted back to Ready
//! so the next tick picks them up; items with a live job are left alone.

use std::collections::HashSet;

use anyhow::Result;

use crate::db::DbHandle;
use crate::github::Board;
use crate::models::BoardStatus;
use crate::queue::WorkQueue;

/// Reconcile the board against the queue. Returns the number of items
/// demoted to Ready.
pub async fn recover_interrupted_items(
    board: &dyn Board,
    queue: &dyn WorkQueue,
) -> Result<usize> {
    let items = board.items().await?;
    let in_progress: Vec<_> = items
        .into_iter()
        .filter(|i| i.status == Some(BoardStatus::InProgress))
        .collect();

    if in_progress.is_empty() {
        tracing::info!("recovery.none_needed");
        return Ok(0);
    }

    // Live = pending or running story jobs, matched by job kind plus the
    // issue-number argument.
    let live_issues: HashSet<u64> = queue
        .active()
        .await?
        .iter()
        .filter_map(|job| job.kind.story_issue())
        .collect();

    let mut recovered = 0;
    for item in in_progress {
        if live_issues.contains(&item.issue_number) {
            tracing::info!(
                issue_number = item.issue_number,
                title = %item.title,
                "recovery.job_still_active"
            );
            continue;
        }

        tracing::info!(
            issue_number = item.issue_number,
            title = %item.title,
            "recovery.moving_to_ready"
        );
        match board.set_status(&item.item_id, BoardStatus::Ready).await {
            Ok(()) => {
                recovered += 1;
                tracing::info!(issue_number = item.issue_number, "recovery.recovered");
            }
            Err(e) => {
                // One stuck item must not block recovery of the rest.
                tracing::error!(
                    issue_number = item.issue_number,
                    error = %format!("{:#}", e),
                    "recovery.move_failed"
                );
            }
        }
    }

    Ok(recovered)
}

/// Clear stale failed ledger rows so the retry counter starts fresh —
/// failures from earlier service sessions should not count against the
/// limit for this one.
pub async fn reset_stale_failures(ledger: &DbHandle) -> Result<usize> {
    let reset = ledger.call(|db| db.cancel_stale_failures()).await?;
    if reset > 0 {
        tracing::info!(count = reset, "recovery.reset_failed_jobs");
    }
    Ok(reset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::JobKind;
    use crate::testkit::{FakeBoard, FakeQueue, item};

    #[tokio::test]
    async fn test_orphaned_in_progress_item_is_demoted() {
        let board = FakeBoard::new(vec![item(10, "Stuck story", "In progress")]);
        let queue = FakeQueue::default();

        let recovered = recover_interrupted_items(&board, &queue).await.unwrap();

        assert_eq!(recovered, 1);
        assert_eq!(board.status_of(10), Some(BoardStatus::Ready));
    }

    #[tokio::test]
    async fn test_item_with_live_job_is_left_alone() {
        let board = FakeBoard::new(vec![
            item(10, "Still running", "In progress"),
            item(20, "Orphaned", "In progress"),
        ]);
        let queue = FakeQueue::default();
        queue.inject_running(JobKind::ProcessStory { issue_number: 10 });

        let recovered = recover_interrupted_items(&board, &queue).await.unwrap();

        assert_eq!(recovered, 1);
        assert_eq!(board.status_of(10), Some(BoardStatus::InProgress));
        assert_eq!(board.status_of(20), Some(BoardStatus::Ready));
    }

    #[tokio::test]
    async fn test_pending_job_also_counts_as_live() {
        let board = FakeBoard::new(vec![item(10, "Queued story", "In progress")]);
        let queue = FakeQueue::default();
        queue
            .enqueue(JobKind::ProcessStory { issue_number: 10 })
            .await
            .unwrap();

        let recovered = recover_interrupted_items(&board, &queue).await.unwrap();

        assert_eq!(recovered, 0);
        assert_eq!(board.status_of(10), Some(BoardStatus::InProgress));
    }

    #[tokio::test]
    async fn test_merge_jobs_do_not_shield_story_items() {
        let board = FakeBoard::new(vec![item(10, "Orphaned", "In progress")]);
        let queue = FakeQueue::default();
        // A merge job for "10" is a different function identity.
        queue.inject_running(JobKind::MergePull { pr_number: 10 });

        let recovered = recover_interrupted_items(&board, &queue).await.unwrap();

        assert_eq!(recovered, 1);
    }

    #[tokio::test]
    async fn test_non_in_progress_items_are_untouched() {
        let board = FakeBoard::new(vec![
            item(10, "Ready one", "Ready"),
            item(20, "Done one", "Done"),
        ]);
        let queue = FakeQueue::default();

        let recovered = recover_interrupted_items(&board, &queue).await.unwrap();

        assert_eq!(recovered, 0);
        assert!(board.status_writes().is_empty());
    }
}
