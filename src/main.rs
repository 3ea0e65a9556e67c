use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "ivan")]
#[command(
    version,
    about = "Delegate code changes to an AI agent in isolated worktrees and open pull requests"
)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Repository to work in (defaults to the current directory)
    #[arg(long, global = true)]
    pub repo: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Plan a change, implement it and open pull requests
    Run {
        /// What to build, in plain language
        description: String,
        /// Put every task on one branch and open a single pull request
        #[arg(long)]
        single_pr: bool,
    },
    /// Re-run the unfinished tasks of a job
    Retry {
        job: i64,
        #[arg(long)]
        single_pr: bool,
    },
    /// Fix unresolved inline review comments on a pull request
    Address {
        /// Pull request number (default: every open PR on an ivan branch)
        pr: Option<i64>,
        /// Wait for reviewers first (minutes; defaults to workflow.review_wait_minutes)
        #[arg(long, num_args = 0..=1, value_name = "MINUTES", requires = "pr")]
        wait: Option<Option<u64>>,
    },
    /// Fix failing test and lint checks on a pull request
    FixChecks { pr: i64 },
    /// List recent jobs
    Jobs {
        #[arg(long, default_value = "20")]
        limit: i64,
    },
    /// Show the tasks of a job
    Tasks {
        job: i64,
        /// Print each task's execution log
        #[arg(long)]
        log: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    // A missing .env is fine
    let _ = dotenvy::dotenv();
    ivan::logging::init(cli.verbose);

    let config = ivan::config::IvanConfig::load()?;
    let repo_dir = match cli.repo.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match cli.command {
        Commands::Run {
            description,
            single_pr,
        } => cmd::cmd_run(&repo_dir, config, &description, single_pr).await?,
        Commands::Retry { job, single_pr } => {
            cmd::cmd_retry(&repo_dir, config, job, single_pr).await?
        }
        Commands::Address { pr, wait } => cmd::cmd_address(&repo_dir, config, pr, wait).await?,
        Commands::FixChecks { pr } => cmd::cmd_fix_checks(&repo_dir, config, pr).await?,
        Commands::Jobs { limit } => cmd::cmd_jobs(&config, limit)?,
        Commands::Tasks { job, log } => cmd::cmd_tasks(&config, job, log)?,
        Commands::Config { command } => cmd::cmd_config(&config, command)?,
    }

    Ok(())
}
