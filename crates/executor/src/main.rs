//! CLI entry point: subcommands to run the executor loop (once or as a
//! daemon), run the watchdog standalone against an in-progress issue, or
//! run the quality-gate pipeline standalone against a working directory.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use coordination::ai_client::RetryingAiClient;
use coordination::anomaly::AnomalyAnalyzer;
use coordination::approval::ApprovalGate;
use coordination::context_usage::ContextUsageDetector;
use coordination::gates::recovery;
use coordination::harness::GitManager;
use coordination::intervention::InterventionController;
use coordination::issue_store::beads_cli::BeadsCli;
use coordination::issue_store::memory::InMemoryIssueStore;
use coordination::issue_store::IssueStore;
use coordination::telemetry::TelemetryMonitor;
use coordination::verifier::Verifier;
use coordination::watchdog::{self, Watchdog};
use coordination::{ExecutorLoop, ExecutorLoopConfig, ProjectLock, WorkerRegistry};
use tokio_util::sync::CancellationToken;

use executor::ai_agent::SubprocessAgentRunner;
use executor::ai_client::RigAiClient;
use executor::config::ExecutorConfig;
use executor::sandbox::WorktreeSandbox;

#[derive(Parser)]
#[command(name = "executor", about = "Autonomous issue-driven code-change executor")]
struct Cli {
    /// Path to a TOML config file; falls back to defaults + env overrides.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the executor loop.
    Run {
        /// Run exactly one claim/dispatch/gate/approve cycle and exit.
        #[arg(long)]
        once: bool,
        /// Path to the git repository the loop operates on.
        #[arg(long, default_value = ".")]
        repo: PathBuf,
    },
    /// Run the watchdog standalone against an issue already in progress.
    Watchdog {
        #[arg(long)]
        issue_id: String,
    },
    /// Run the quality-gate pipeline standalone against a working directory.
    Gates {
        #[arg(long, default_value = ".")]
        workdir: PathBuf,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
}

fn build_store(config: &ExecutorConfig) -> Arc<dyn IssueStore> {
    match &config.beads_db {
        Some(path) => Arc::new(BeadsCli::new().with_db_path(path.display().to_string())),
        None => {
            tracing::warn!(target: "executor", "no beads database discovered, using in-memory issue store");
            Arc::new(InMemoryIssueStore::new())
        }
    }
}

fn build_ai_client(config: &ExecutorConfig) -> anyhow::Result<Arc<RetryingAiClient<RigAiClient>>> {
    let inner = RigAiClient::new(&config.ai).context("failed to build AI client")?;
    Ok(Arc::new(RetryingAiClient::new(inner, "executor-ai")))
}

async fn run_loop(config: ExecutorConfig, repo: PathBuf, once: bool) -> anyhow::Result<()> {
    let lock_path = repo.join(".beads").join(".exclusive-lock");
    let _project_lock =
        ProjectLock::acquire(&lock_path, &config.worker_id).context("another executor instance holds the project lock")?;

    let store = build_store(&config);
    let ai_client = build_ai_client(&config)?;
    let sandbox: Arc<dyn coordination::executor_loop::Sandbox> =
        Arc::new(WorktreeSandbox::new(config.sandbox_base_dir.clone(), &repo).context("failed to initialize sandbox")?);
    let agent = Arc::new(SubprocessAgentRunner::new(
        config.agent_command[0].clone(),
        config.agent_command[1..].to_vec(),
    ));
    let approval = ApprovalGate::new(GitManager::new(&repo, "[executor]"))
        .with_auto_approve_env_var(config.approval_auto_approve_env_var.clone());

    let registry = WorkerRegistry::new(store.clone());
    registry.register(&config.worker_id).await.context("failed to register worker instance")?;
    let stale_threshold = chrono::Duration::seconds(config.worker_stale_threshold_secs as i64);
    registry.reap_stale(stale_threshold).await.context("failed to reap stale worker instances")?;

    let loop_config = ExecutorLoopConfig {
        worker_id: config.worker_id.clone(),
        agent_name: config.agent_command[0].clone(),
        watchdog_config: config.watchdog.clone(),
        verifier_config: config.verifier.clone(),
        merge_base_branch: config.merge_base_branch.clone(),
        idle_poll_interval: std::time::Duration::from_secs(config.idle_poll_interval_secs),
    };

    let executor = ExecutorLoop::new(store, ai_client, sandbox, agent, approval, loop_config);

    let cancellation = CancellationToken::new();
    let shutdown = cancellation.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!(target: "executor", "received ctrl-c, shutting down");
            shutdown.cancel();
        }
    });

    let heartbeat_cancel = cancellation.clone();
    let heartbeat_interval = std::time::Duration::from_secs(config.worker_heartbeat_interval_secs);
    let heartbeat_worker_id = config.worker_id.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = heartbeat_cancel.cancelled() => break,
                _ = tokio::time::sleep(heartbeat_interval) => {
                    if let Err(e) = registry.heartbeat(&heartbeat_worker_id).await {
                        tracing::warn!(target: "worker_registry", error = %e, "heartbeat failed");
                    }
                }
            }
        }
    });

    if once {
        let outcome = executor.run_once(&cancellation).await?;
        tracing::info!(target: "executor", ?outcome, "single iteration complete");
        cancellation.cancel();
    } else {
        executor.run(&cancellation).await;
    }

    Ok(())
}

async fn run_watchdog_standalone(config: ExecutorConfig, issue_id: String) -> anyhow::Result<()> {
    let store = build_store(&config);
    let ai_client = build_ai_client(&config)?;

    let intervention = Arc::new(InterventionController::new(store.clone(), config.worker_id.clone()));
    let telemetry = Arc::new(TelemetryMonitor::default());
    let context_detector = Arc::new(ContextUsageDetector::default());
    let analyzer = AnomalyAnalyzer::new(ai_client.clone());

    let watchdog_instance = Arc::new(Watchdog::new(
        config.watchdog.clone(),
        analyzer,
        context_detector,
        telemetry,
        intervention,
        issue_id.clone(),
    ));

    tracing::info!(target: "watchdog", issue_id = %issue_id, "standalone watchdog attached");
    let handle = watchdog::spawn(watchdog_instance);

    tokio::signal::ctrl_c().await.ok();
    handle.stop().await;
    Ok(())
}

async fn run_gates_standalone(config: ExecutorConfig, workdir: PathBuf) -> anyhow::Result<()> {
    let verifier = Verifier::new(&workdir, config.verifier.clone());
    let cancellation = CancellationToken::new();
    let report = recovery::run_pipeline_with_heartbeat(&verifier, None, &cancellation)
        .await
        .context("gate pipeline produced no report")?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.all_green {
        std::process::exit(1);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = ExecutorConfig::load(cli.config.as_deref()).context("failed to load executor config")?;

    match cli.command {
        Command::Run { once, repo } => run_loop(config, repo, once).await,
        Command::Watchdog { issue_id } => run_watchdog_standalone(config, issue_id).await,
        Command::Gates { workdir } => run_gates_standalone(config, workdir).await,
    }
}
