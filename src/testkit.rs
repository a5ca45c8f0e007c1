//! In-memory fakes for the external collaborators, shared by the unit tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::agent::{AgentResult, CodingAgent, StoryContext};
use crate::config::Settings;
use crate::errors::{BoardError, GitError, QueueError};
use crate::git::Vcs;
use crate::github::{Board, IssueDetail, IssueHost, NativeMerge, PullRequest};
use crate::llm::Completions;
use crate::models::{BoardStatus, WorkItem};
use crate::queue::{JobKind, JobSpec, WorkQueue};

/// Settings for tests: small repo, develop base, three retries.
pub fn settings() -> Settings {
    Settings {
        github_token: "ghp_test".into(),
        github_repo: "acme/widgets".into(),
        github_project_number: 1,
        github_project_owner: "acme".into(),
        anthropic_api_key: "sk-test".into(),
        anthropic_model: "claude-sonnet-4-20250514".into(),
        redis_url: "redis://localhost:6379/0".into(),
        base_branch: "develop".into(),
        primary_branches: vec!["main".into(), "master".into()],
        work_dir: PathBuf::from("/tmp/storybot-test"),
        database_path: PathBuf::from(":memory:"),
        memory_path: PathBuf::from("MEMORY.md"),
        poll_interval_secs: 30,
        max_retries: 3,
        max_agent_passes: 5,
        memory_max_tokens: 2000,
        question_timeout_minutes: 30,
        http_port: 0,
    }
}

/// Build a board item with the given raw status label.
pub fn item(issue_number: u64, title: &str, status_label: &str) -> WorkItem {
    WorkItem {
        item_id: format!("item-{}", issue_number),
        issue_number,
        title: title.to_string(),
        body: String::new(),
        status: BoardStatus::parse_label(status_label),
        status_label: status_label.to_string(),
        labels: Vec::new(),
    }
}

// ── Board ─────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeBoard {
    items: Mutex<Vec<WorkItem>>,
    status_writes: Mutex<Vec<(String, BoardStatus)>>,
    fail_next_items: AtomicBool,
}

impl FakeBoard {
    pub fn new(items: Vec<WorkItem>) -> Self {
        Self {
            items: Mutex::new(items),
            ..Default::default()
        }
    }

    pub fn set_items(&self, items: Vec<WorkItem>) {
        *self.items.lock().unwrap() = items;
    }

    pub fn fail_next_items(&self) {
        self.fail_next_items.store(true, Ordering::SeqCst);
    }

    /// All `(item_id, status)` writes, in order.
    pub fn status_writes(&self) -> Vec<(String, BoardStatus)> {
        self.status_writes.lock().unwrap().clone()
    }

    /// Current status of an issue, as the fake board sees it.
    pub fn status_of(&self, issue_number: u64) -> Option<BoardStatus> {
        self.items
            .lock()
            .unwrap()
            .iter()
            .find(|i| i.issue_number == issue_number)
            .and_then(|i| i.status)
    }
}

#[async_trait]
impl Board for FakeBoard {
    async fn items(&self) -> Result<Vec<WorkItem>, BoardError> {
        if self.fail_next_items.swap(false, Ordering::SeqCst) {
            return Err(BoardError::Other(anyhow::anyhow!("board unavailable")));
        }
        Ok(self.items.lock().unwrap().clone())
    }

    async fn set_status(&self, item_id: &str, status: BoardStatus) -> Result<(), BoardError> {
        self.status_writes
            .lock()
            .unwrap()
            .push((item_id.to_string(), status));
        let mut items = self.items.lock().unwrap();
        for item in items.iter_mut() {
            if item.item_id == item_id {
                item.status = Some(status);
                item.status_label = status.display_name().to_string();
            }
        }
        Ok(())
    }
}

// ── Issue host ────────────────────────────────────────────────────────

/// Scripted result for one native-merge call.
#[derive(Debug, Clone)]
pub enum MergeScript {
    Merged,
    Rejected(String),
    TransportError(String),
}

pub struct CreatedPull {
    pub title: String,
    pub body: String,
    pub head: String,
    pub base: String,
    pub issue_number: Option<u64>,
}

#[derive(Default)]
pub struct FakeHost {
    issues: Mutex<HashMap<u64, IssueDetail>>,
    open_pulls: Mutex<Vec<PullRequest>>,
    approved: Mutex<HashSet<u64>>,
    remote_branches: Mutex<HashSet<String>>,
    merge_script: Mutex<VecDeque<MergeScript>>,
    merge_calls: AtomicUsize,
    created_pulls: Mutex<Vec<CreatedPull>>,
    issue_comments: Mutex<Vec<(u64, String)>>,
    pull_comments: Mutex<Vec<(u64, String)>>,
    next_pr_number: AtomicU64,
}

impl FakeHost {
    pub fn add_issue(&self, number: u64, title: &str, body: &str, labels: &[&str]) {
        self.issues.lock().unwrap().insert(
            number,
            IssueDetail {
                number,
                title: title.to_string(),
                body: body.to_string(),
                labels: labels.iter().map(|l| l.to_string()).collect(),
                state: "open".to_string(),
            },
        );
    }

    pub fn add_open_pull(&self, number: u64, head: &str, base: &str) {
        self.open_pulls.lock().unwrap().push(PullRequest {
            number,
            head: head.to_string(),
            base: base.to_string(),
        });
    }

    pub fn approve(&self, number: u64) {
        self.approved.lock().unwrap().insert(number);
    }

    pub fn add_remote_branch(&self, branch: &str) {
        self.remote_branches.lock().unwrap().insert(branch.to_string());
    }

    /// Script the next native-merge results, in order. When the script runs
    /// dry, merges succeed.
    pub fn script_merges(&self, script: Vec<MergeScript>) {
        *self.merge_script.lock().unwrap() = script.into();
    }

    pub fn merge_calls(&self) -> usize {
        self.merge_calls.load(Ordering::SeqCst)
    }

    pub fn created_pulls(&self) -> Vec<CreatedPull> {
        std::mem::take(&mut *self.created_pulls.lock().unwrap())
    }

    pub fn issue_comments(&self) -> Vec<(u64, String)> {
        self.issue_comments.lock().unwrap().clone()
    }

    pub fn pull_comments(&self) -> Vec<(u64, String)> {
        self.pull_comments.lock().unwrap().clone()
    }
}

#[async_trait]
impl IssueHost for FakeHost {
    async fn issue(&self, number: u64) -> Result<IssueDetail> {
        Ok(self
            .issues
            .lock()
            .unwrap()
            .get(&number)
            .cloned()
            .unwrap_or(IssueDetail {
                number,
                title: format!("Issue {}", number),
                body: String::new(),
                labels: Vec::new(),
                state: "open".to_string(),
            }))
    }

    async fn comment_on_issue(&self, number: u64, body: &str) -> Result<()> {
        self.issue_comments
            .lock()
            .unwrap()
            .push((number, body.to_string()));
        Ok(())
    }

    async fn create_pull(
        &self,
        title: &str,
        body: &str,
        head: &str,
        base: &str,
        issue_number: Option<u64>,
    ) -> Result<u64> {
        self.created_pulls.lock().unwrap().push(CreatedPull {
            title: title.to_string(),
            body: body.to_string(),
            head: head.to_string(),
            base: base.to_string(),
            issue_number,
        });
        Ok(100 + self.next_pr_number.fetch_add(1, Ordering::SeqCst))
    }

    async fn open_pulls(&self, base: &str) -> Result<Vec<PullRequest>> {
        Ok(self
            .open_pulls
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.base == base)
            .cloned()
            .collect())
    }

    async fn pull(&self, number: u64) -> Result<PullRequest> {
        self.open_pulls
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.number == number)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("PR #{} not found", number))
    }

    async fn is_approved(&self, number: u64) -> Result<bool> {
        Ok(self.approved.lock().unwrap().contains(&number))
    }

    async fn rebase_merge(&self, _number: u64) -> Result<NativeMerge> {
        self.merge_calls.fetch_add(1, Ordering::SeqCst);
        match self.merge_script.lock().unwrap().pop_front() {
            None | Some(MergeScript::Merged) => Ok(NativeMerge::Merged),
            Some(MergeScript::Rejected(reason)) => Ok(NativeMerge::Rejected { reason }),
            Some(MergeScript::TransportError(msg)) => Err(anyhow::anyhow!(msg)),
        }
    }

    async fn comment_on_pull(&self, number: u64, body: &str) -> Result<()> {
        self.pull_comments
            .lock()
            .unwrap()
            .push((number, body.to_string()));
        Ok(())
    }

    async fn branch_exists(&self, branch: &str) -> Result<bool> {
        Ok(self.remote_branches.lock().unwrap().contains(branch))
    }
}

// ── Queue ─────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeQueue {
    enqueued: Mutex<Vec<JobKind>>,
    pending: Mutex<VecDeque<JobSpec>>,
    running: Mutex<Vec<JobSpec>>,
    signals: Mutex<HashSet<u64>>,
    fail_enqueues: AtomicBool,
}

impl FakeQueue {
    pub fn fail_enqueues(&self) {
        self.fail_enqueues.store(true, Ordering::SeqCst);
    }

    /// Every kind ever successfully enqueued, in order.
    pub fn enqueued(&self) -> Vec<JobKind> {
        self.enqueued.lock().unwrap().clone()
    }

    pub async fn add_signal(&self, issue_number: u64) {
        self.signals.lock().unwrap().insert(issue_number);
    }

    pub async fn signals(&self) -> HashSet<u64> {
        self.signals.lock().unwrap().clone()
    }

    /// Place a job straight into the running listing (recovery tests).
    pub fn inject_running(&self, kind: JobKind) {
        self.running.lock().unwrap().push(JobSpec::new(kind));
    }
}

#[async_trait]
impl WorkQueue for FakeQueue {
    async fn enqueue(&self, kind: JobKind) -> Result<JobSpec, QueueError> {
        if self.fail_enqueues.load(Ordering::SeqCst) {
            let err = serde_json::from_str::<JobSpec>("queue down").unwrap_err();
            return Err(QueueError::Payload(err));
        }
        let job = JobSpec::new(kind.clone());
        self.enqueued.lock().unwrap().push(kind);
        self.pending.lock().unwrap().push_back(job.clone());
        Ok(job)
    }

    async fn dequeue(&self, _timeout: Duration) -> Result<Option<JobSpec>, QueueError> {
        let job = self.pending.lock().unwrap().pop_front();
        if let Some(job) = &job {
            self.running.lock().unwrap().push(job.clone());
        }
        Ok(job)
    }

    async fn complete(&self, job: &JobSpec) -> Result<(), QueueError> {
        self.running.lock().unwrap().retain(|j| j.id != job.id);
        Ok(())
    }

    async fn active(&self) -> Result<Vec<JobSpec>, QueueError> {
        let mut jobs: Vec<JobSpec> = self.pending.lock().unwrap().iter().cloned().collect();
        jobs.extend(self.running.lock().unwrap().iter().cloned());
        Ok(jobs)
    }

    async fn add_retry_signal(&self, issue_number: u64) -> Result<(), QueueError> {
        self.signals.lock().unwrap().insert(issue_number);
        Ok(())
    }

    async fn retry_signals(&self) -> Result<HashSet<u64>, QueueError> {
        Ok(self.signals.lock().unwrap().clone())
    }

    async fn remove_retry_signal(&self, issue_number: u64) -> Result<(), QueueError> {
        self.signals.lock().unwrap().remove(&issue_number);
        Ok(())
    }
}

// ── VCS ───────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeVcs {
    pub prepares: Mutex<Vec<String>>,
    pub branches_created: Mutex<Vec<(String, String)>>,
    pub commits: Mutex<Vec<String>>,
    pub pushes: Mutex<Vec<String>>,
    pub force_pushes: Mutex<Vec<String>>,
    pub checkouts: Mutex<Vec<String>>,
    changed: Mutex<Vec<String>>,
    missing_bases: Mutex<HashSet<String>>,
    rebase_conflicts: AtomicBool,
    fail_stage: Mutex<Option<String>>,
    protected: Vec<String>,
}

impl FakeVcs {
    pub fn new() -> Self {
        Self {
            protected: vec!["develop".into(), "main".into(), "master".into()],
            ..Default::default()
        }
    }

    pub fn set_changed_files(&self, files: Vec<&str>) {
        *self.changed.lock().unwrap() = files.into_iter().map(String::from).collect();
    }

    /// Make `create_branch` fall back when asked to branch from this base.
    pub fn remove_base(&self, base: &str) {
        self.missing_bases.lock().unwrap().insert(base.to_string());
    }

    pub fn conflict_on_rebase(&self) {
        self.rebase_conflicts.store(true, Ordering::SeqCst);
    }

    /// Fail the named operation ("prepare", "create_branch", "push",
    /// "commit", "checkout", "force_push") with a command error.
    pub fn fail_on(&self, stage: &str) {
        *self.fail_stage.lock().unwrap() = Some(stage.to_string());
    }

    fn maybe_fail(&self, stage: &str) -> Result<(), GitError> {
        if self.fail_stage.lock().unwrap().as_deref() == Some(stage) {
            return Err(GitError::CommandFailed {
                command: stage.to_string(),
                stderr: format!("simulated {} failure", stage),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Vcs for FakeVcs {
    async fn prepare(&self, branch: &str) -> Result<(), GitError> {
        self.maybe_fail("prepare")?;
        self.prepares.lock().unwrap().push(branch.to_string());
        Ok(())
    }

    async fn create_branch(
        &self,
        branch: &str,
        base: &str,
        fallback: &str,
    ) -> Result<String, GitError> {
        self.maybe_fail("create_branch")?;
        let base_used = if self.missing_bases.lock().unwrap().contains(base) {
            fallback.to_string()
        } else {
            base.to_string()
        };
        self.branches_created
            .lock()
            .unwrap()
            .push((branch.to_string(), base_used.clone()));
        Ok(base_used)
    }

    async fn commit_all(&self, message: &str) -> Result<bool, GitError> {
        self.maybe_fail("commit")?;
        self.commits.lock().unwrap().push(message.to_string());
        Ok(!self.changed.lock().unwrap().is_empty())
    }

    async fn push(&self, branch: &str) -> Result<(), GitError> {
        if self.protected.iter().any(|b| b.eq_ignore_ascii_case(branch)) {
            return Err(GitError::ProtectedBranch {
                branch: branch.to_string(),
            });
        }
        self.maybe_fail("push")?;
        self.pushes.lock().unwrap().push(branch.to_string());
        Ok(())
    }

    async fn changed_files(&self) -> Result<Vec<String>, GitError> {
        Ok(self.changed.lock().unwrap().clone())
    }

    async fn checkout_remote(&self, branch: &str) -> Result<(), GitError> {
        self.maybe_fail("checkout")?;
        self.checkouts.lock().unwrap().push(branch.to_string());
        Ok(())
    }

    async fn fetch_all(&self) -> Result<(), GitError> {
        self.maybe_fail("fetch")?;
        Ok(())
    }

    async fn rebase_onto(&self, _target: &str) -> Result<bool, GitError> {
        Ok(!self.rebase_conflicts.load(Ordering::SeqCst))
    }

    async fn force_push_with_lease(&self, branch: &str) -> Result<(), GitError> {
        if self.protected.iter().any(|b| b.eq_ignore_ascii_case(branch)) {
            return Err(GitError::ProtectedBranch {
                branch: branch.to_string(),
            });
        }
        self.maybe_fail("force_push")?;
        self.force_pushes.lock().unwrap().push(branch.to_string());
        Ok(())
    }
}

// ── Agent ─────────────────────────────────────────────────────────────

enum AgentScript {
    Succeed(AgentResult),
    FailBusiness(AgentResult),
    Crash(String),
}

pub struct FakeAgent {
    script: Mutex<AgentScript>,
    calls: AtomicUsize,
}

impl FakeAgent {
    /// Agent that completes the story, touching the given files.
    pub fn succeeding(files: Vec<&str>) -> Self {
        Self {
            script: Mutex::new(AgentScript::Succeed(AgentResult {
                success: true,
                files_changed: files.into_iter().map(String::from).collect(),
                test_output: "all tests passed".into(),
                passes_used: 2,
                message: "done".into(),
                error: String::new(),
            })),
            calls: AtomicUsize::new(0),
        }
    }

    /// Agent that runs but cannot finish the story (business failure).
    pub fn failing(error: &str) -> Self {
        Self {
            script: Mutex::new(AgentScript::FailBusiness(AgentResult {
                success: false,
                files_changed: Vec::new(),
                test_output: String::new(),
                passes_used: 5,
                message: String::new(),
                error: error.to_string(),
            })),
            calls: AtomicUsize::new(0),
        }
    }

    /// Agent whose invocation itself blows up (infrastructure error).
    pub fn crashing(message: &str) -> Self {
        Self {
            script: Mutex::new(AgentScript::Crash(message.to_string())),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn times_called(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CodingAgent for FakeAgent {
    async fn run(&self, _ctx: &StoryContext) -> Result<AgentResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &*self.script.lock().unwrap() {
            AgentScript::Succeed(result) | AgentScript::FailBusiness(result) => Ok(result.clone()),
            AgentScript::Crash(message) => Err(anyhow::anyhow!("{}", message)),
        }
    }
}

// ── Completions ───────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeCompletions {
    pub prompts: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl Completions for FakeCompletions {
    async fn complete(&self, prompt: &str, system: &str) -> Result<String> {
        self.prompts
            .lock()
            .unwrap()
            .push((prompt.to_string(), system.to_string()));
        Ok("Generated description".to_string())
    }
}
