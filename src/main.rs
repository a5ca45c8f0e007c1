use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use storybot::agent::{ClaudeCliAgent, CodingAgent, StaticAnswerHandler};
use storybot::approvals::ArtifactApprover;
use storybot::config::Settings;
use storybot::db::{DbHandle, Ledger};
use storybot::git::{GitWorkspace, Vcs};
use storybot::github::{Board, GitHubClient, IssueHost, ProjectBoard, RepoHost};
use storybot::llm::{AnthropicClient, Completions};
use storybot::memory::MemoryStore;
use storybot::pipeline::StoryPipeline;
use storybot::pipeline::merge::MergePipeline;
use storybot::poller::Poller;
use storybot::queue::{RedisWorkQueue, WorkQueue};
use storybot::recovery::{recover_interrupted_items, reset_stale_failures};
use storybot::server;
use storybot::worker::Worker;

/// Upper bound on one coding attempt; the agent's own pass budget normally
/// finishes well inside this.
const AGENT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Parser)]
#[command(name = "storybot")]
#[command(version, about = "Dispatches board stories to an AI coding agent and shepherds the results to merge")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full service: recovery scan, poller, queue worker, health endpoint
    Serve,
    /// Process one story inline and print the JSON outcome
    Process {
        /// Issue number of the story
        issue: u64,
    },
    /// Merge one approved review request inline and print the JSON outcome
    Merge {
        /// Pull request number
        pr: u64,
    },
    /// Run the startup recovery scan once and exit
    Recover,
}

/// Everything the pipelines need, built once from settings.
struct Services {
    settings: Settings,
    board: Arc<dyn Board>,
    host: Arc<dyn IssueHost>,
    queue: Arc<dyn WorkQueue>,
    ledger: DbHandle,
    pipeline: Arc<StoryPipeline>,
    merge: Arc<MergePipeline>,
}

fn build_services(settings: Settings) -> Result<Services> {
    let ledger = DbHandle::new(Ledger::new(&settings.database_path)?);

    let client = Arc::new(GitHubClient::new(
        settings.github_token.clone(),
        settings.github_repo.clone(),
    ));
    let board: Arc<dyn Board> = Arc::new(ProjectBoard::new(
        client.clone(),
        settings.github_project_owner.clone(),
        settings.github_project_number,
    ));
    let host: Arc<dyn IssueHost> = Arc::new(RepoHost::new(client));

    let queue: Arc<dyn WorkQueue> = Arc::new(RedisWorkQueue::new(&settings.redis_url)?);

    let vcs: Arc<dyn Vcs> = Arc::new(GitWorkspace::new(
        settings.clone_dir(),
        GitWorkspace::authenticated_url(&settings.github_repo, &settings.github_token),
        settings.push_protected_branches(),
    ));

    let llm: Arc<dyn Completions> = Arc::new(AnthropicClient::new(
        settings.anthropic_api_key.clone(),
        settings.anthropic_model.clone(),
    ));

    let agent: Arc<dyn CodingAgent> = Arc::new(ClaudeCliAgent::new(
        vcs.clone(),
        settings.clone_dir(),
        AGENT_TIMEOUT,
    ));

    let memory = MemoryStore::new(settings.memory_path.clone(), settings.memory_max_tokens);

    // No chat integration is wired in this deployment: questions get a
    // conservative default answer, which also means unapproved generated
    // artifacts block their story.
    let approver = ArtifactApprover::new(
        ledger.clone(),
        Arc::new(StaticAnswerHandler::new("deny")),
        settings.github_repo.clone(),
    );

    let pipeline = Arc::new(StoryPipeline::new(
        settings.clone(),
        board.clone(),
        host.clone(),
        queue.clone(),
        ledger.clone(),
        agent,
        llm,
        vcs.clone(),
        memory,
        approver,
    ));
    let merge = Arc::new(MergePipeline::new(
        settings.clone(),
        host.clone(),
        Some(vcs),
    ));

    Ok(Services {
        settings,
        board,
        host,
        queue,
        ledger,
        pipeline,
        merge,
    })
}

async fn run_serve(services: Services) -> Result<()> {
    let settings = &services.settings;
    tracing::info!(repo = %settings.github_repo, "storybot.starting");

    // Seed the memory file on first run.
    MemoryStore::new(settings.memory_path.clone(), settings.memory_max_tokens)
        .seed_default(
            &settings.github_repo,
            &settings.base_branch,
            settings.max_agent_passes,
        )
        .await?;

    // Startup recovery, before the poller sees anything: reset stale retry
    // accounting, then un-stick items abandoned by a crashed process.
    // Recovery problems are logged, never fatal.
    if let Err(e) = reset_stale_failures(&services.ledger).await {
        tracing::error!(error = %format!("{:#}", e), "recovery.reset_error");
    }
    match recover_interrupted_items(services.board.as_ref(), services.queue.as_ref()).await {
        Ok(recovered) => {
            if recovered > 0 {
                tracing::info!(recovered, "recovery.done");
            }
        }
        Err(e) => tracing::error!(error = %format!("{:#}", e), "recovery.error"),
    }

    let poller = Poller::new(
        services.board.clone(),
        services.host.clone(),
        services.queue.clone(),
        settings,
    );
    let poller_task = tokio::spawn(poller.run());

    let worker = Worker::new(
        services.queue.clone(),
        services.pipeline.clone(),
        services.merge.clone(),
    );
    let worker_task = tokio::spawn(async move { worker.run().await });

    let port = settings.http_port;
    tokio::select! {
        result = server::serve(port) => {
            result.context("health server exited")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("storybot.shutdown_requested");
        }
    }

    poller_task.abort();
    worker_task.abort();
    tracing::info!("storybot.shutdown");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // A local .env behaves like real environment variables.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let settings = Settings::from_env()?;
    let services = build_services(settings)?;

    match cli.command {
        Commands::Serve => run_serve(services).await?,
        Commands::Process { issue } => {
            let outcome = services.pipeline.process(issue).await;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Merge { pr } => {
            let outcome = services.merge.merge(pr).await;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Recover => {
            reset_stale_failures(&services.ledger).await?;
            let recovered =
                recover_interrupted_items(services.board.as_ref(), services.queue.as_ref())
                    .await?;
            println!("recovered {} item(s)", recovered);
        }
    }

    Ok(())
}
