//! Typed error hierarchy for the orchestrator.
//!
//! Three enums cover the three external subsystems the pipelines lean on:
//! - `GitError` — local VCS subprocess failures
//! - `BoardError` — project board reads/writes
//! - `QueueError` — job queue and recycle-signal operations
//!
//! Orchestration-level code composes these with `anyhow::Result`.

use thiserror::Error;

/// Errors from local git operations.
#[derive(Debug, Error)]
pub enum GitError {
    #[error("git {command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("git {command} timed out after {seconds}s")]
    Timeout { command: String, seconds: u64 },

    #[error("refusing to push to protected branch: {branch}")]
    ProtectedBranch { branch: String },

    #[error("failed to spawn git: {0}")]
    Spawn(#[source] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the project board.
#[derive(Debug, Error)]
pub enum BoardError {
    /// A status write named a label the board does not have. This is loud on
    /// purpose: silently dropping a status move would strand the item.
    #[error("unknown board status '{status}', available: {available:?}")]
    UnknownStatus {
        status: String,
        available: Vec<String>,
    },

    #[error("no board item found for issue #{issue_number}")]
    ItemNotFound { issue_number: u64 },

    #[error("board response missing field: {0}")]
    MissingField(String),

    #[error("board request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the background job queue.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue backend error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("malformed job payload: {0}")]
    Payload(#[from] serde_json::Error),
}
