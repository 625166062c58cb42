use clap::Parser;
use colored::*;
use eyre::{Context, Result, eyre};
use log::info;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use devloop::domain::{ApprovalSet, RunStatus, Task};
use devloop::generator::CommandGenerator;
use devloop::patch::{
    ApplyOutcome, PatchApplier, PatchValidator, ScopeGuard, ValidationResult, Verdict, Violation, parse_patch,
};
use devloop::prompt::PromptRenderer;
use devloop::runner::DevLoop;
use devloop::storage::{list_runs, load_run};
use devloop::tree::WorkingTree;
use devloop::verify::{
    Classifier, Evidence, FailureKind, FeedbackFormatter, InfraGuard, PathScope, VerifyRunner, VerifyStatus,
};

mod cli;
mod config;

use cli::Cli;
use cli::commands::{Commands, RepoArgs, RunsCommands};
use config::Config;

/// Exit code when a patch is rejected or verification fails outside a run.
const EXIT_REJECTED: i32 = 3;

fn setup_logging() -> Result<()> {
    // Create log directory
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("devloop")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("devloop.log");

    // Setup env_logger with file output
    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

async fn run_application(cli: &Cli, config: &Config, cancel: &CancellationToken) -> Result<i32> {
    info!("Starting application");

    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
    }

    match &cli.command {
        Commands::Run {
            task,
            files,
            approve_scope,
            max_attempts,
            generator,
            repo,
        } => {
            handle_run_command(
                task,
                files,
                approve_scope.as_deref(),
                *max_attempts,
                generator.as_deref(),
                repo,
                config,
                cancel,
            )
            .await
        }
        Commands::Verify { repo } => handle_verify_command(repo, config, cancel).await,
        Commands::CheckPatch { patch, files, repo } => handle_check_patch_command(patch, files, repo, config),
        Commands::Apply { patch, files, repo } => handle_apply_command(patch, files, repo, config),
        Commands::Runs { command, repo } => handle_runs_command(command, repo, config),
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_run_command(
    task: &str,
    files: &[String],
    approve_scope: Option<&Path>,
    max_attempts: Option<u32>,
    generator: Option<&str>,
    repo: &RepoArgs,
    config: &Config,
    cancel: &CancellationToken,
) -> Result<i32> {
    let repo_root = config.repo_root(repo.repo.as_deref())?;
    let settings = config.devloop_config(&repo_root, max_attempts)?;

    let command = generator
        .map(str::to_string)
        .or_else(|| config.generator.command.clone())
        .ok_or_else(|| eyre!("No generator configured: set generator.command or pass --generator"))?;
    let generator = Arc::new(
        CommandGenerator::new(command, &repo_root).with_timeout(Duration::from_secs(config.generator.timeout_secs)),
    );

    let prompt = match &config.prompt.template {
        Some(path) => PromptRenderer::from_file(&repo_root.join(path))?,
        None => PromptRenderer::new()?,
    };
    let approvals = match approve_scope {
        Some(path) => ApprovalSet::load(path).context(format!("Failed to load approvals from {}", path.display()))?,
        None => ApprovalSet::default(),
    };

    let task = Task::new(task, files);
    info!("Running task '{}' on {:?}", task.description, task.allowed_files);
    println!("{} {}", "Task:".green(), task.description);

    let outcome = DevLoop::new(generator, prompt, settings)
        .with_approvals(approvals)
        .run(task, cancel)
        .await
        .context("Run failed")?;

    let summary = outcome.status.summary();
    match &outcome.status {
        RunStatus::Success { .. } => println!("{}", summary.as_str().green()),
        RunStatus::Halted { line, .. } => {
            println!("{}", summary.as_str().red());
            println!("  {}", line);
        }
        RunStatus::MaxAttemptsExceeded { last_failure, .. } => {
            println!("{}", summary.as_str().red());
            if let Some(report) = last_failure {
                println!("{}", FeedbackFormatter::new().format_single(report));
            }
        }
        RunStatus::Cancelled { .. } => println!("{}", summary.as_str().yellow()),
    }
    println!("{} {}", "Run record:".cyan(), outcome.run_dir.display());

    Ok(outcome.status.exit_code())
}

async fn handle_verify_command(repo: &RepoArgs, config: &Config, cancel: &CancellationToken) -> Result<i32> {
    let repo_root = config.repo_root(repo.repo.as_deref())?;
    let runner = VerifyRunner::new(config.verify_steps()?);
    info!("Verifying {} with {} step(s)", repo_root.display(), runner.steps().len());

    let report = runner.run(&repo_root, cancel).await;
    for step in &report.steps {
        let status = if step.succeeded() {
            "ok".green()
        } else {
            step.exit.describe().as_str().red()
        };
        println!("{:<20} {} ({}ms)", step.name, status, step.duration_ms);
    }

    match report.status {
        VerifyStatus::Passed => {
            println!("{}", "Verification passed".green());
            Ok(0)
        }
        VerifyStatus::Cancelled => {
            println!("{}", "Verification cancelled".yellow());
            Ok(4)
        }
        VerifyStatus::Failed { .. } => {
            let classifier = Classifier::new(
                InfraGuard::new(config.infra_signatures.iter().cloned()),
                PathScope::new(repo_root.clone()),
            );
            match classifier.classify(1, Evidence::Verify(&report))? {
                Some(FailureKind::Infra { signature, line, .. }) => {
                    println!("{} {}", "Infrastructure failure:".red(), signature);
                    println!("  {}", line);
                    Ok(2)
                }
                Some(kind) => {
                    println!("{}", FeedbackFormatter::new().format_single(kind.report()));
                    Ok(EXIT_REJECTED)
                }
                None => Ok(EXIT_REJECTED),
            }
        }
    }
}

/// Parse and validate a patch file against `files`.
fn load_and_validate(patch: &Path, files: &[String], repo: &RepoArgs, config: &Config) -> Result<(WorkingTree, Verdict)> {
    let repo_root = config.repo_root(repo.repo.as_deref())?;
    let text = fs::read_to_string(patch).context(format!("Failed to read patch {}", patch.display()))?;
    let tree = WorkingTree::new(repo_root);

    let verdict = match parse_patch(&text) {
        Ok(parsed) => {
            let task = Task::new("", files);
            PatchValidator::new(ScopeGuard::new(task.allowed_files.iter())).validate(parsed, &tree)?
        }
        Err(e) => {
            println!("{} {}", "Parse error:".red(), e);
            let result = ValidationResult::fail(Violation::syntax(None, e.to_string()));
            return Ok((tree, Verdict::Rejected(result)));
        }
    };
    Ok((tree, verdict))
}

fn print_violations(verdict: &Verdict) {
    for violation in verdict.result().violations {
        println!("  {}", violation.to_string().as_str().red());
    }
}

fn handle_check_patch_command(patch: &Path, files: &[String], repo: &RepoArgs, config: &Config) -> Result<i32> {
    let (_, verdict) = load_and_validate(patch, files, repo, config)?;
    match &verdict {
        Verdict::Accepted(validated) => {
            println!("{} {}", "Patch is valid:".green(), validated.files().join(", "));
            Ok(0)
        }
        Verdict::Rejected(_) => {
            println!("{}", "Patch rejected".red());
            print_violations(&verdict);
            Ok(EXIT_REJECTED)
        }
    }
}

fn handle_apply_command(patch: &Path, files: &[String], repo: &RepoArgs, config: &Config) -> Result<i32> {
    let (tree, verdict) = load_and_validate(patch, files, repo, config)?;
    let validated = match &verdict {
        Verdict::Accepted(validated) => validated,
        Verdict::Rejected(_) => {
            println!("{}", "Patch rejected".red());
            print_violations(&verdict);
            return Ok(EXIT_REJECTED);
        }
    };

    match PatchApplier::new(&tree).apply(validated)? {
        ApplyOutcome::Applied { files } => {
            println!("{} {}", "Applied:".green(), files.join(", "));
            Ok(0)
        }
        ApplyOutcome::AlreadyAppliedNoop => {
            println!("{}", "Patch already applied, nothing to do".yellow());
            Ok(0)
        }
        ApplyOutcome::Rejected {
            path,
            hunk_index,
            detail,
        } => {
            let hunk = hunk_index.map(|i| format!(" hunk {}", i + 1)).unwrap_or_default();
            println!("{} {}{}: {}", "Conflict:".red(), path, hunk, detail);
            Ok(EXIT_REJECTED)
        }
    }
}

fn handle_runs_command(command: &RunsCommands, repo: &RepoArgs, config: &Config) -> Result<i32> {
    let repo_root = config.repo_root(repo.repo.as_deref())?;
    let runs_dir = config.runs_dir(&repo_root);

    match command {
        RunsCommands::List => {
            let runs = list_runs(&runs_dir)?;
            if runs.is_empty() {
                println!("No runs in {}", runs_dir.display());
            }
            for run in runs {
                let task = run.header.as_ref().map(|h| h.task.description.as_str()).unwrap_or("?");
                let status = match &run.result {
                    Some(result) if result.status.is_success() => result.status.state().as_str().green(),
                    Some(result) => result.status.state().as_str().red(),
                    None => "in progress".yellow(),
                };
                println!("{}  {:<24} {}", run.run_id, status, task);
            }
        }
        RunsCommands::Show { id } => {
            let details = load_run(&runs_dir, id)?;
            println!("{} {}", "Run:".cyan(), details.summary.run_id);
            if let Some(header) = &details.summary.header {
                println!("  task:     {}", header.task.description);
                println!("  files:    {}", header.task.allowed_files.join(", "));
                println!("  started:  {}", header.started_at);
            }
            match &details.summary.result {
                Some(result) => println!("  result:   {}", result.summary),
                None => println!("  result:   {}", "in progress".yellow()),
            }
            println!("  attempts: {}", details.attempts.join(", "));
            for event in &details.events {
                let attempt = event.attempt.map(|a| format!("#{}", a)).unwrap_or_default();
                println!("  {:>4} {:<3} {:<26} {}", event.seq, attempt, event.event_type, event.payload);
            }
        }
    }
    Ok(0)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Setup logging first
    setup_logging().context("Failed to setup logging")?;

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    if let Some(level) = config.log_level.as_deref().and_then(|l| l.parse::<log::LevelFilter>().ok()) {
        log::set_max_level(level);
    }

    info!("Starting with config from: {:?}", cli.config);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, cancelling");
            on_interrupt.cancel();
        }
    });

    // Run the main application logic
    let code = run_application(&cli, &config, &cancel).await.context("Application failed")?;

    std::process::exit(code);
}
