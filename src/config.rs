//! Runtime configuration, loaded from environment variables.
//!
//! `dotenvy` is invoked by `main` before this runs, so a local `.env` file
//! works the same as real environment variables. Required variables produce
//! a contextual error at startup; everything else has a default that matches
//! a small single-repo deployment.

use std::path::PathBuf;

use anyhow::{Context, Result};

/// Seconds the poller sleeps between board scans.
const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;

/// Failed ledger rows allowed before a story is parked in Blocked.
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Coding passes the agent may spend on one story.
const DEFAULT_MAX_AGENT_PASSES: u32 = 5;

/// Soft token budget for the persistent memory file.
const DEFAULT_MEMORY_MAX_TOKENS: usize = 2000;

/// Minutes to wait for a human answer before the default kicks in.
const DEFAULT_QUESTION_TIMEOUT_MINUTES: u64 = 30;

#[derive(Debug, Clone)]
pub struct Settings {
    /// GitHub personal access token.
    pub github_token: String,
    /// Target repository, `owner/repo`.
    pub github_repo: String,
    /// Projects V2 board number.
    pub github_project_number: u32,
    /// Login that owns the project board (defaults to the repo owner).
    pub github_project_owner: String,

    /// Anthropic API key for PR descriptions and memory compression.
    pub anthropic_api_key: String,
    /// Completion model id.
    pub anthropic_model: String,

    /// Redis connection URL for the job queue.
    pub redis_url: String,

    /// Integration branch PRs target (never pushed to directly).
    pub base_branch: String,
    /// Primary branches merges must never target.
    pub primary_branches: Vec<String>,

    /// Directory holding the local clone.
    pub work_dir: PathBuf,
    /// SQLite ledger path.
    pub database_path: PathBuf,
    /// Persistent agent memory file.
    pub memory_path: PathBuf,

    pub poll_interval_secs: u64,
    pub max_retries: u32,
    pub max_agent_passes: u32,
    pub memory_max_tokens: usize,
    pub question_timeout_minutes: u64,

    /// Port for the health endpoint.
    pub http_port: u16,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let github_repo = require("STORYBOT_GITHUB_REPO")?;
        let owner = github_repo
            .split('/')
            .next()
            .unwrap_or_default()
            .to_string();
        if owner.is_empty() || !github_repo.contains('/') {
            anyhow::bail!(
                "STORYBOT_GITHUB_REPO must be in owner/repo format, got '{}'",
                github_repo
            );
        }

        Ok(Self {
            github_token: require("STORYBOT_GITHUB_TOKEN")?,
            github_project_number: parse_or("STORYBOT_GITHUB_PROJECT_NUMBER", 1)?,
            github_project_owner: optional("STORYBOT_GITHUB_PROJECT_OWNER").unwrap_or(owner),
            github_repo,
            anthropic_api_key: require("STORYBOT_ANTHROPIC_API_KEY")?,
            anthropic_model: optional("STORYBOT_ANTHROPIC_MODEL")
                .unwrap_or_else(|| "claude-sonnet-4-20250514".to_string()),
            redis_url: optional("STORYBOT_REDIS_URL")
                .unwrap_or_else(|| "redis://localhost:6379/0".to_string()),
            base_branch: optional("STORYBOT_BASE_BRANCH").unwrap_or_else(|| "develop".to_string()),
            primary_branches: vec!["main".to_string(), "master".to_string()],
            work_dir: optional("STORYBOT_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/tmp/storybot-workspaces")),
            database_path: optional("STORYBOT_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("storybot.db")),
            memory_path: optional("STORYBOT_MEMORY_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("MEMORY.md")),
            poll_interval_secs: parse_or("STORYBOT_POLL_INTERVAL", DEFAULT_POLL_INTERVAL_SECS)?,
            max_retries: parse_or("STORYBOT_MAX_RETRIES", DEFAULT_MAX_RETRIES)?,
            max_agent_passes: parse_or("STORYBOT_MAX_AGENT_PASSES", DEFAULT_MAX_AGENT_PASSES)?,
            memory_max_tokens: parse_or("STORYBOT_MEMORY_MAX_TOKENS", DEFAULT_MEMORY_MAX_TOKENS)?,
            question_timeout_minutes: parse_or(
                "STORYBOT_QUESTION_TIMEOUT_MINUTES",
                DEFAULT_QUESTION_TIMEOUT_MINUTES,
            )?,
            http_port: parse_or("STORYBOT_HTTP_PORT", 8080)?,
        })
    }

    /// Repo owner, from the `owner/repo` slug.
    pub fn repo_owner(&self) -> &str {
        self.github_repo.split('/').next().unwrap_or_default()
    }

    /// Repo name, from the `owner/repo` slug.
    pub fn repo_name(&self) -> &str {
        self.github_repo.split('/').nth(1).unwrap_or_default()
    }

    /// Directory the target repo is cloned into.
    pub fn clone_dir(&self) -> PathBuf {
        self.work_dir.join(self.repo_name())
    }

    /// Branches that must never be pushed to: the primaries plus the
    /// integration base.
    pub fn push_protected_branches(&self) -> Vec<String> {
        let mut protected = self.primary_branches.clone();
        protected.push(self.base_branch.clone());
        protected
    }

    /// True when a merge request may not target this branch.
    pub fn is_primary_branch(&self, branch: &str) -> bool {
        self.primary_branches
            .iter()
            .any(|b| b.eq_ignore_ascii_case(branch))
    }
}

fn require(name: &str) -> Result<String> {
    std::env::var(name).with_context(|| format!("Missing required environment variable {}", name))
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match optional(name) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("Invalid value for {}: '{}'", name, raw)),
        None => Ok(default),
    }
}
