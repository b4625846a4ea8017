use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use agentflow::agents::{AgentContext, AgentRegistry, HeadlessCli};
use agentflow::config::Config;
use agentflow::core::{DependencyGraph, ManifestValidator, ProjectManifest};
use agentflow::git::RepoManager;
use agentflow::metrics::InMemoryMetrics;
use agentflow::orchestration::{ExecutionScheduler, ReviewGate, SchedulerEvent};
use agentflow::retrieval::KeywordRetriever;
use agentflow::review::{FileReviewStore, InMemoryReviewStore, ReviewId, ReviewStore};
use agentflow::sandbox::{DockerCli, SandboxRunner};
use agentflow::util::{blocking, write_atomic};
use agentflow::{Error, Result};

/// Exit code for manifests that fail to parse or validate.
const EXIT_INVALID: u8 = 2;

/// agentflow - run agent pipelines declared as task dependency graphs
#[derive(Parser, Debug)]
#[command(name = "agentflow")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    AGENTFLOW_DEBUG=1     Enable debug logging (alternative to --debug)\n    AGENTFLOW_HOME        State directory (default ~/.agentflow)"
)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Execute every task of a manifest
    Run {
        /// Manifest file (.json or .toml)
        manifest: PathBuf,

        /// Directory agents write into (overrides config)
        #[arg(long)]
        project_dir: Option<PathBuf>,

        /// Write the JSON execution report here
        #[arg(long)]
        report: Option<PathBuf>,

        /// Files indexed as retrieval context
        #[arg(long = "context", value_name = "FILE")]
        context: Vec<PathBuf>,

        /// Fail reviews not decided within this many seconds
        #[arg(long, value_name = "SECS")]
        review_timeout: Option<u64>,

        /// Keep reviews in memory instead of the review store file
        #[arg(long)]
        memory_reviews: bool,
    },

    /// Check a manifest and print its execution order
    Validate {
        /// Manifest file (.json or .toml)
        manifest: PathBuf,
    },

    /// Inspect and decide pending reviews
    Reviews {
        #[command(subcommand)]
        action: ReviewAction,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum ReviewAction {
    /// List every review
    List,
    /// Approve a pending review
    Approve { id: ReviewId },
    /// Reject a pending review
    Reject {
        id: ReviewId,

        /// Reason given to the pipeline
        #[arg(long)]
        feedback: Option<String>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    agentflow::log::init_with_debug(cli.debug);

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match rt.block_on(dispatch(cli.command)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::from(error_exit_code(&e))
        }
    }
}

fn error_exit_code(e: &Error) -> u8 {
    match e {
        Error::Validation(_) | Error::Json(_) | Error::TomlParse(_) => EXIT_INVALID,
        // a broken config file is a setup error, not a bad manifest
        Error::Config { .. } => 1,
        _ => 1,
    }
}

async fn dispatch(command: Command) -> Result<ExitCode> {
    let config = Config::load()?;
    match command {
        Command::Run {
            manifest,
            project_dir,
            report,
            context,
            review_timeout,
            memory_reviews,
        } => {
            let opts = RunOptions {
                manifest,
                project_dir,
                report,
                context,
                review_timeout,
                memory_reviews,
            };
            run_pipeline(config, opts).await
        }
        Command::Validate { manifest } => run_validate(&manifest),
        Command::Reviews { action } => run_reviews(&config, action).await,
    }
}

struct RunOptions {
    manifest: PathBuf,
    project_dir: Option<PathBuf>,
    report: Option<PathBuf>,
    context: Vec<PathBuf>,
    review_timeout: Option<u64>,
    memory_reviews: bool,
}

/// Parse and validate a manifest against the built-in agent kinds.
///
/// Touches nothing on disk besides reading `path`.
fn load_manifest(path: &Path) -> Result<(ProjectManifest, DependencyGraph)> {
    let manifest = ProjectManifest::from_path(path)?;
    let registry = AgentRegistry::with_builtin(&AgentContext::new("."));
    let graph = ManifestValidator::new(&registry).validate(&manifest)?;
    Ok((manifest, graph))
}

async fn run_pipeline(config: Config, opts: RunOptions) -> Result<ExitCode> {
    let (manifest, graph) = load_manifest(&opts.manifest)?;
    let project_dir = opts.project_dir.clone().unwrap_or_else(|| config.project_dir());
    tracing::info!(
        manifest = %opts.manifest.display(),
        project = %manifest.name,
        project_dir = %project_dir.display(),
        "run command"
    );

    let repo = {
        let dir = project_dir.clone();
        blocking(move || {
            let repo = RepoManager::new(&dir)?;
            repo.init()?;
            Ok::<_, Error>(repo)
        })
        .await?
    };

    if !DockerCli::new(&config.sandbox.engine).is_available() {
        tracing::warn!(engine = %config.sandbox.engine, "container engine not found, sandboxed tasks will fail");
    }
    let mut ctx = AgentContext::new(&project_dir)
        .with_repo(Arc::new(repo))
        .with_sandbox(Arc::new(SandboxRunner::docker(config.sandbox.clone())));
    if let Some(llm) = configured_llm(&config) {
        ctx = ctx.with_llm(llm);
    }
    let registry = Arc::new(AgentRegistry::with_builtin(&ctx));

    let store: Arc<dyn ReviewStore> = if opts.memory_reviews {
        Arc::new(InMemoryReviewStore::new())
    } else {
        Arc::new(FileReviewStore::new(config.reviews_path()?))
    };

    let mut scheduler_config = config.scheduler_config();
    if let Some(secs) = opts.review_timeout {
        scheduler_config.review_timeout = Some(Duration::from_secs(secs));
    }

    let metrics = Arc::new(InMemoryMetrics::new());
    let (tx, rx) = mpsc::unbounded_channel();
    let mut scheduler = ExecutionScheduler::new(registry)
        .with_review_gate(ReviewGate::new(store))
        .with_metrics(metrics.clone())
        .with_config(scheduler_config)
        .with_events(tx);

    let mut documents = config.document_paths();
    documents.extend(opts.context.iter().cloned());
    if !documents.is_empty() {
        let retriever = KeywordRetriever::from_files(&documents)?;
        scheduler = scheduler.with_retriever(Arc::new(retriever));
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, cancelling run");
                cancel.cancel();
            }
        });
    }

    let progress = tokio::spawn(print_progress(rx, opts.memory_reviews));
    let report = scheduler.run(&graph, cancel).await;
    drop(scheduler);
    let _ = progress.await;

    tracing::debug!(metrics = %metrics.render(), "run metrics");

    if let Some(path) = &opts.report {
        let json = serde_json::to_vec_pretty(&report)?;
        write_atomic(path, &json)?;
        tracing::info!(path = %path.display(), "report written");
    }

    print!("{}", report.summary());
    Ok(ExitCode::from(report.exit_code() as u8))
}

fn configured_llm(config: &Config) -> Option<HeadlessCli> {
    let line = config.agents.command.as_deref()?;
    let mut llm = HeadlessCli::from_command_line(line)?;
    if let Some(secs) = config.agents.timeout_secs {
        llm = llm.with_timeout(Duration::from_secs(secs));
    }
    if !llm.is_available() {
        tracing::warn!(command = llm.binary(), "LLM command not found, using stub generation");
        return None;
    }
    Some(llm)
}

async fn print_progress(mut rx: mpsc::UnboundedReceiver<SchedulerEvent>, memory_reviews: bool) {
    while let Some(event) = rx.recv().await {
        match event {
            SchedulerEvent::Started { task, attempt } => {
                println!("[start] {} (attempt {})", task, attempt);
            }
            SchedulerEvent::Retrying { task, attempt, delay } => {
                println!("[retry] {} after attempt {} in {:?}", task, attempt, delay);
            }
            SchedulerEvent::ReviewRequested { task, review_id } => {
                println!("[review] {} waiting on review {}", task, review_id);
                if !memory_reviews {
                    println!(
                        "         decide with `agentflow reviews approve {id}` or `agentflow reviews reject {id}`",
                        id = review_id
                    );
                }
            }
            SchedulerEvent::Finished { task, state } => {
                println!("[done]  {} {}", task, state);
            }
            SchedulerEvent::Promoted { .. } | SchedulerEvent::RunComplete { .. } => {}
        }
    }
}

fn run_validate(path: &Path) -> Result<ExitCode> {
    let (manifest, graph) = load_manifest(path)?;

    println!(
        "Manifest {} is valid: {} tasks, {} dependencies",
        manifest.name,
        graph.len(),
        graph.edge_count()
    );
    for (i, task) in graph.topological_order().unwrap_or_default().iter().enumerate() {
        println!("  {:>2}. {} ({})", i + 1, task.name, task.agent);
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_reviews(config: &Config, action: ReviewAction) -> Result<ExitCode> {
    let store = FileReviewStore::new(config.reviews_path()?);
    match action {
        ReviewAction::List => {
            let reviews = store.list().await?;
            if reviews.is_empty() {
                println!("No reviews in {}", store.path().display());
            }
            for review in reviews {
                println!(
                    "{:>4}  {:<9} {:<20} {:<20} issues={} created={}",
                    review.id,
                    review.status.to_string(),
                    truncate_string(&review.project_name, 20),
                    truncate_string(&review.task, 20),
                    review.issues.len(),
                    review.created_at.format("%Y-%m-%d %H:%M:%S UTC")
                );
                if let Some(feedback) = &review.feedback {
                    println!("      feedback: {}", feedback);
                }
            }
        }
        ReviewAction::Approve { id } => {
            store.approve(id).await?;
            println!("Approved review {}", id);
        }
        ReviewAction::Reject { id, feedback } => {
            store.reject(id, feedback).await?;
            println!("Rejected review {}", id);
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
