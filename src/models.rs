use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Status column on the project board.
///
/// Board labels are free text on the wire; they are normalized into this
/// enum at the read boundary (case-insensitive) and rendered back with
/// `display_name` on writes. An unrecognized label on a write is a hard
/// error, never a silent no-op.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BoardStatus {
    Backlog,
    Ready,
    InProgress,
    InReview,
    Blocked,
    Done,
}

impl BoardStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backlog => "backlog",
            Self::Ready => "ready",
            Self::InProgress => "in_progress",
            Self::InReview => "in_review",
            Self::Blocked => "blocked",
            Self::Done => "done",
        }
    }

    /// The label as it appears on the board ("In progress", not "in_progress").
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Backlog => "Backlog",
            Self::Ready => "Ready",
            Self::InProgress => "In progress",
            Self::InReview => "In review",
            Self::Blocked => "Blocked",
            Self::Done => "Done",
        }
    }

    /// Case-insensitive parse of a board label. Returns `None` for labels
    /// this orchestrator does not know about (such items are never
    /// dispatchable).
    pub fn parse_label(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "backlog" => Some(Self::Backlog),
            "ready" => Some(Self::Ready),
            "in progress" | "in_progress" | "in-progress" => Some(Self::InProgress),
            "in review" | "in_review" | "in-review" => Some(Self::InReview),
            "blocked" => Some(Self::Blocked),
            "done" => Some(Self::Done),
            _ => None,
        }
    }
}

impl std::fmt::Display for BoardStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for BoardStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_label(s).ok_or_else(|| format!("Unknown board status: {}", s))
    }
}

/// A story/issue as it appears on the project board.
///
/// `issue_number` is the stable identity; `item_id` is the board's node id
/// and may change when a draft is converted to a real issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub item_id: String,
    pub issue_number: u64,
    pub title: String,
    pub body: String,
    /// Normalized status; `None` when the raw label is empty or unrecognized.
    pub status: Option<BoardStatus>,
    /// The label exactly as the board reported it. Kept so "has this item
    /// left the trigger column" can be answered even for labels outside the
    /// closed enum.
    pub status_label: String,
    pub labels: Vec<String>,
}

impl WorkItem {
    pub fn has_label(&self, name: &str) -> bool {
        self.labels.iter().any(|l| l.eq_ignore_ascii_case(name))
    }
}

/// Status of a dispatch attempt recorded in the ledger.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    /// The agent is waiting on a human answer.
    Asking,
    Success,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Asking => "asking",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "asking" => Ok(Self::Asking),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

/// One dispatch attempt for a story. Rows are append-only; a retried story
/// gets a new row rather than overwriting the failed one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryJob {
    pub id: i64,
    pub issue_number: u64,
    pub issue_title: String,
    pub branch_name: String,
    pub pr_number: Option<u64>,
    pub status: JobStatus,
    /// Comma-separated list of paths the agent touched.
    pub files_changed: String,
    pub passes_used: u32,
    pub error_message: String,
    pub created_at: String,
    pub completed_at: Option<String>,
}

/// Cached human decision about a generated run artifact (e.g. a Dockerfile
/// the agent produced). Keyed by (repo, file_path); once approved we never
/// ask again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub repo: String,
    pub file_path: String,
    pub approved: bool,
    pub approved_by: String,
    pub approved_at: Option<String>,
}

/// Terminal status of a story pipeline run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Success,
    Blocked,
    Error,
}

/// Result of `StoryPipeline::process`, also the JSON printed by the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessOutcome {
    pub issue_number: u64,
    pub status: ProcessStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProcessOutcome {
    pub fn success(issue_number: u64, pr_number: u64, branch: String) -> Self {
        Self {
            issue_number,
            status: ProcessStatus::Success,
            pr_number: Some(pr_number),
            branch: Some(branch),
            error: None,
        }
    }

    pub fn blocked(issue_number: u64, error: impl Into<String>) -> Self {
        Self {
            issue_number,
            status: ProcessStatus::Blocked,
            pr_number: None,
            branch: None,
            error: Some(error.into()),
        }
    }

    pub fn error(issue_number: u64, error: impl Into<String>) -> Self {
        Self {
            issue_number,
            status: ProcessStatus::Error,
            pr_number: None,
            branch: None,
            error: Some(error.into()),
        }
    }
}

/// Terminal status of a merge pipeline run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    /// Native rebase merge succeeded directly.
    Merged,
    /// Native merge failed but a local rebase + force-push made it land.
    MergedViaLocalRebase,
    /// The request had no approved review; nothing was attempted.
    NotApproved,
    /// The request targets a protected primary branch; nothing was attempted.
    ProtectedBranch,
    /// Rebase conflicts need manual resolution.
    Conflict,
    /// Everything else (transport errors, re-merge failure after rebase).
    Failed,
}

impl MergeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Merged => "merged",
            Self::MergedViaLocalRebase => "merged_via_local_rebase",
            Self::NotApproved => "not_approved",
            Self::ProtectedBranch => "protected_branch",
            Self::Conflict => "conflict",
            Self::Failed => "failed",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Merged | Self::MergedViaLocalRebase)
    }
}

/// Result of `MergePipeline::merge`, also the JSON printed by the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub pr_number: u64,
    pub status: MergeStatus,
    /// True when the merge needed (or still needs) manual-grade work:
    /// a local rebase happened, or conflicts remain.
    pub complex: bool,
    pub message: String,
}

impl MergeOutcome {
    pub fn new(
        pr_number: u64,
        status: MergeStatus,
        complex: bool,
        message: impl Into<String>,
    ) -> Self {
        Self {
            pr_number,
            status,
            complex,
            message: message.into(),
        }
    }
}
