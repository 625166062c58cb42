//! CLI command definitions using clap.
//!
//! Defines the main CLI structure and subcommands:
//! - run: drive the full loop for a task
//! - verify: run the verify chain once and classify the result
//! - check-patch / apply: the patch pipeline on its own
//! - runs: inspect past run directories

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// DevLoop - generate, validate, apply and verify code changes in a loop
#[derive(Parser, Debug)]
#[command(name = "devloop")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// Repository selection shared by every subcommand
#[derive(Args, Debug, Clone, Default)]
pub struct RepoArgs {
    /// Repository root (defaults to config project_root, then the current directory)
    #[arg(long)]
    pub repo: Option<PathBuf>,
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the loop for a task
    Run {
        /// Task description
        task: String,

        /// Files the change may touch (repo-relative)
        #[arg(short, long, num_args = 1.., required = true)]
        files: Vec<String>,

        /// YAML/JSON file with per-attempt scope-expansion approvals
        #[arg(long)]
        approve_scope: Option<PathBuf>,

        /// Override the configured attempt budget
        #[arg(short, long)]
        max_attempts: Option<u32>,

        /// Override the configured generator command
        #[arg(short, long)]
        generator: Option<String>,

        #[command(flatten)]
        repo: RepoArgs,
    },

    /// Run the verify chain once and classify any failure
    Verify {
        #[command(flatten)]
        repo: RepoArgs,
    },

    /// Parse and validate a patch file without applying it
    CheckPatch {
        /// Patch file
        patch: PathBuf,

        /// Files the patch may touch
        #[arg(short, long, num_args = 1.., required = true)]
        files: Vec<String>,

        #[command(flatten)]
        repo: RepoArgs,
    },

    /// Validate and apply a patch file
    Apply {
        /// Patch file
        patch: PathBuf,

        /// Files the patch may touch
        #[arg(short, long, num_args = 1.., required = true)]
        files: Vec<String>,

        #[command(flatten)]
        repo: RepoArgs,
    },

    /// Inspect past runs
    Runs {
        #[command(subcommand)]
        command: RunsCommands,

        #[command(flatten)]
        repo: RepoArgs,
    },
}

/// Run history subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum RunsCommands {
    /// List runs, oldest first
    List,

    /// Show one run's result and event log
    Show {
        /// Run ID (directory name)
        id: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["devloop"]).is_err());
    }

    #[test]
    fn test_cli_verbose_and_config() {
        let cli = Cli::try_parse_from(["devloop", "-v", "--config", "/tmp/d.yml", "verify"]).unwrap();
        assert!(cli.is_verbose());
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/d.yml")));
        assert!(matches!(cli.command, Commands::Verify { .. }));
    }

    #[test]
    fn test_run_command() {
        let cli = Cli::try_parse_from([
            "devloop",
            "run",
            "add a greeting",
            "--files",
            "src/a.py",
            "tests/test_a.py",
            "--approve-scope",
            "approvals.yaml",
            "--max-attempts",
            "5",
            "--repo",
            "/work/repo",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                task,
                files,
                approve_scope,
                max_attempts,
                generator,
                repo,
            } => {
                assert_eq!(task, "add a greeting");
                assert_eq!(files, vec!["src/a.py", "tests/test_a.py"]);
                assert_eq!(approve_scope, Some(PathBuf::from("approvals.yaml")));
                assert_eq!(max_attempts, Some(5));
                assert!(generator.is_none());
                assert_eq!(repo.repo, Some(PathBuf::from("/work/repo")));
            }
            other => panic!("expected run, got {:?}", other),
        }
    }

    #[test]
    fn test_run_requires_files() {
        assert!(Cli::try_parse_from(["devloop", "run", "task"]).is_err());
    }

    #[test]
    fn test_check_patch_command() {
        let cli = Cli::try_parse_from(["devloop", "check-patch", "fix.diff", "-f", "a.rs"]).unwrap();
        match cli.command {
            Commands::CheckPatch { patch, files, .. } => {
                assert_eq!(patch, PathBuf::from("fix.diff"));
                assert_eq!(files, vec!["a.rs"]);
            }
            other => panic!("expected check-patch, got {:?}", other),
        }
    }

    #[test]
    fn test_runs_show_command() {
        let cli = Cli::try_parse_from(["devloop", "runs", "show", "20261018-142501000-abcd"]).unwrap();
        match cli.command {
            Commands::Runs {
                command: RunsCommands::Show { id },
                ..
            } => assert_eq!(id, "20261018-142501000-abcd"),
            other => panic!("expected runs show, got {:?}", other),
        }
    }

    #[test]
    fn test_runs_list_command() {
        let cli = Cli::try_parse_from(["devloop", "runs", "list"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Runs {
                command: RunsCommands::List,
                ..
            }
        ));
    }
}
