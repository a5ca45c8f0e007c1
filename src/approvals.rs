//! Human approval gate for generated run artifacts.
//!
//! When the agent produces a file the orchestrator would execute (a
//! Dockerfile, a compose file), a human signs off once per (repo, path).
//! Decisions are cached in the ledger so the same artifact is never asked
//! about twice; an approval is permanent.

use std::sync::Arc;

use crate::agent::QuestionHandler;
use crate::db::DbHandle;

/// Words in an answer that count as approval.
const AFFIRMATIVE_WORDS: &[&str] = &["approve", "approved", "yes", "allow", "ok", "lgtm"];

/// True for generated artifacts that require sign-off before they run.
pub fn is_run_artifact(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    name == "Dockerfile"
        || name.starts_with("Dockerfile.")
        || name.starts_with("docker-compose.")
}

/// True when a free-text answer reads as approval.
pub fn is_affirmative(answer: &str) -> bool {
    let lowered = answer.to_lowercase();
    AFFIRMATIVE_WORDS.iter().any(|w| lowered.contains(w))
}

pub struct ArtifactApprover {
    ledger: DbHandle,
    questions: Arc<dyn QuestionHandler>,
    repo: String,
}

impl ArtifactApprover {
    pub fn new(ledger: DbHandle, questions: Arc<dyn QuestionHandler>, repo: impl Into<String>) -> Self {
        Self {
            ledger,
            questions,
            repo: repo.into(),
        }
    }

    /// Check (or obtain) approval for one artifact. Errors on the question
    /// channel are treated as denial — never as approval.
    pub async fn check(&self, file_path: &str, description: &str) -> bool {
        let repo = self.repo.clone();
        let path = file_path.to_string();
        let cached = self
            .ledger
            .call(move |db| db.approval(&repo, &path))
            .await
            .ok()
            .flatten();
        if let Some(approval) = cached
            && approval.approved
        {
            tracing::info!(file_path, repo = %self.repo, "approval.cached");
            return true;
        }

        let question = format!(
            "Permission request\n\n\
             The coder generated a new run artifact and needs permission to use it:\n\n\
             File: `{}`\n\
             Description: {}\n\n\
             Reply *approve* to allow this file, or *deny* to block it.",
            file_path, description
        );
        let answer = match self
            .questions
            .ask(&question, &format!("Repo: {}", self.repo))
            .await
        {
            Ok(answer) => answer,
            Err(e) => {
                tracing::error!(file_path, error = %format!("{:#}", e), "approval.ask_failed");
                return false;
            }
        };

        let approved = is_affirmative(&answer);

        let repo = self.repo.clone();
        let path = file_path.to_string();
        if let Err(e) = self
            .ledger
            .call(move |db| db.record_approval(&repo, &path, approved, "question-channel"))
            .await
        {
            tracing::error!(file_path, error = %format!("{:#}", e), "approval.persist_failed");
        }

        tracing::info!(file_path, approved, "approval.decided");
        approved
    }
}
