//! GitHub integration: project board (GraphQL) and repository host (REST).
//!
//! The orchestrator consumes these through the `Board` and `IssueHost`
//! traits so the poller and pipelines can be exercised against in-memory
//! fakes; the structs in the submodules are the production implementations.

pub mod board;
pub mod client;
pub mod pr;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::BoardError;
use crate::models::{BoardStatus, WorkItem};

pub use board::ProjectBoard;
pub use client::GitHubClient;
pub use pr::{RepoHost, branch_name_for, slugify};

/// Full detail of one issue, fetched when the pipeline starts work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueDetail {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    pub state: String,
}

/// An open review request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    /// Source branch.
    pub head: String,
    /// Target branch.
    pub base: String,
}

/// Outcome of the tracker's native rebase-merge call.
/// `Rejected` means the host refused the merge (conflicts, not mergeable);
/// transport failures surface as errors instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeMerge {
    Merged,
    Rejected { reason: String },
}

/// Read/query abstraction over the kanban-style board.
#[async_trait]
pub trait Board: Send + Sync {
    /// All items in board order (top-to-bottom = priority).
    async fn items(&self) -> Result<Vec<WorkItem>, BoardError>;

    /// Move an item to a status column. Unknown labels fail loudly.
    async fn set_status(&self, item_id: &str, status: BoardStatus) -> Result<(), BoardError>;
}

/// Issue/PR operations on the repository host.
#[async_trait]
pub trait IssueHost: Send + Sync {
    async fn issue(&self, number: u64) -> Result<IssueDetail>;

    async fn comment_on_issue(&self, number: u64, body: &str) -> Result<()>;

    /// Open a pull request; returns the new PR number.
    async fn create_pull(
        &self,
        title: &str,
        body: &str,
        head: &str,
        base: &str,
        issue_number: Option<u64>,
    ) -> Result<u64>;

    /// Open review requests targeting `base`.
    async fn open_pulls(&self, base: &str) -> Result<Vec<PullRequest>>;

    async fn pull(&self, number: u64) -> Result<PullRequest>;

    /// True when the request has at least one APPROVED review.
    async fn is_approved(&self, number: u64) -> Result<bool>;

    /// Invoke the host's native rebase-merge.
    async fn rebase_merge(&self, number: u64) -> Result<NativeMerge>;

    async fn comment_on_pull(&self, number: u64, body: &str) -> Result<()>;

    /// True when the branch exists on the remote.
    async fn branch_exists(&self, branch: &str) -> Result<bool>;
}
