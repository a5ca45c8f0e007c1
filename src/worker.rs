//! Queue consumer — runs pipelines for dequeued jobs.
//!
//! One worker owns one local clone; jobs run sequentially so the clone is
//! only ever contended between jobs, which `Vcs::prepare` handles by
//! force-resetting. Outcomes are logged here; the pipelines already
//! mirrored them to the board and ledger.

use std::sync::Arc;
use std::time::Duration;

use crate::pipeline::StoryPipeline;
use crate::pipeline::merge::MergePipeline;
use crate::queue::{JobKind, JobSpec, WorkQueue};

/// How long one dequeue call blocks before looping.
const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(5);

/// Backoff after a queue error so an outage does not spin the loop.
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

pub struct Worker {
    queue: Arc<dyn WorkQueue>,
    pipeline: Arc<StoryPipeline>,
    merge: Arc<MergePipeline>,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        pipeline: Arc<StoryPipeline>,
        merge: Arc<MergePipeline>,
    ) -> Self {
        Self {
            queue,
            pipeline,
            merge,
        }
    }

    /// Consume jobs forever.
    pub async fn run(&self) {
        tracing::info!("worker.starting");
        loop {
            match self.queue.dequeue(DEQUEUE_TIMEOUT).await {
                Ok(Some(job)) => self.handle(job).await,
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(error = %e, "worker.dequeue_error");
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
        }
    }

    async fn handle(&self, job: JobSpec) {
        tracing::info!(job_id = %job.id, kind = ?job.kind, "worker.job_start");
        match job.kind {
            JobKind::ProcessStory { issue_number } => {
                let outcome = self.pipeline.process(issue_number).await;
                tracing::info!(
                    issue_number,
                    status = ?outcome.status,
                    pr_number = outcome.pr_number,
                    "worker.story_done"
                );
            }
            JobKind::MergePull { pr_number } => {
                let outcome = self.merge.merge(pr_number).await;
                tracing::info!(
                    pr_number,
                    status = outcome.status.as_str(),
                    complex = outcome.complex,
                    "worker.merge_done"
                );
            }
        }

        if let Err(e) = self.queue.complete(&job).await {
            tracing::error!(job_id = %job.id, error = %e, "worker.complete_error");
        }
    }
}
