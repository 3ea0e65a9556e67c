//! Workflow commands: `ivan run`, `ivan retry`, `ivan address`, `ivan fix-checks`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use ivan::config::IvanConfig;
use ivan::executor::{AgentOutput, create_executor};
use ivan::generate::AgentTextGenerator;
use ivan::github::create_code_host;
use ivan::orchestrator::{JobReport, TaskOrchestrator};
use ivan::store::StoreHandle;

/// An orchestrator plus the task printing live agent output.
struct Workbench {
    orchestrator: TaskOrchestrator,
    printer: JoinHandle<()>,
}

impl Workbench {
    /// Drop the orchestrator so the output channel closes, then drain the printer.
    async fn finish(self) {
        drop(self.orchestrator);
        let _ = self.printer.await;
    }
}

async fn repo_root(dir: &Path) -> Result<PathBuf> {
    let top = ivan::git::run_ok(dir, &["rev-parse", "--show-toplevel"])
        .await
        .with_context(|| format!("{} is not inside a git repository", dir.display()))?;
    Ok(PathBuf::from(top.trim()))
}

async fn workbench(dir: &Path, config: IvanConfig) -> Result<Workbench> {
    let repo = repo_root(dir).await?;

    let cancel = CancellationToken::new();
    ivan::cancel::install_ctrl_c_handler(cancel.clone());

    let (tx, mut rx) = mpsc::unbounded_channel::<AgentOutput>();
    let printer = tokio::spawn(async move {
        while let Some(output) = rx.recv().await {
            println!("{}", output);
        }
    });

    let executor = create_executor(&config, cancel.clone(), Some(tx));
    let host = create_code_host(&config, &repo).await?;
    let store = StoreHandle::open(&config.db_path()?)?;
    let generator = Arc::new(AgentTextGenerator::from_config(&config));

    let orchestrator =
        TaskOrchestrator::new(store, executor, host, generator, repo, config, cancel);
    Ok(Workbench {
        orchestrator,
        printer,
    })
}

fn print_report(report: &JobReport) -> Result<()> {
    println!();
    println!("Job #{}: {}", report.job.id, report.job.description);
    for outcome in &report.outcomes {
        println!(
            "  [{}] #{} {}",
            outcome.status.as_str(),
            outcome.task_id,
            outcome.description
        );
        if let Some(pr) = &outcome.pr_link {
            println!("      PR: {}", pr);
        }
        if let Some(reply) = &outcome.comment_url {
            println!("      Reply: {}", reply);
        }
        if let Some(err) = &outcome.error {
            println!("      Error: {}", err);
        }
    }

    let failed = report.failed();
    if failed > 0 {
        bail!(
            "{} task(s) failed; re-run with `ivan retry {}`",
            failed,
            report.job.id
        );
    }
    Ok(())
}

pub async fn cmd_run(dir: &Path, config: IvanConfig, description: &str, single_pr: bool) -> Result<()> {
    if description.trim().is_empty() {
        bail!("Description must not be empty");
    }
    let bench = workbench(dir, config).await?;
    let result = bench.orchestrator.run_build_job(description, single_pr).await;
    bench.finish().await;
    print_report(&result?)
}

pub async fn cmd_retry(dir: &Path, config: IvanConfig, job: i64, single_pr: bool) -> Result<()> {
    let bench = workbench(dir, config).await?;
    let result = bench.orchestrator.retry_job(job, single_pr).await;
    bench.finish().await;
    print_report(&result?)
}

/// `wait`: `None` addresses immediately, `Some(None)` waits the configured time.
/// Without `pr`, every open pull request on one of our branches is swept.
pub async fn cmd_address(
    dir: &Path,
    config: IvanConfig,
    pr: Option<i64>,
    wait: Option<Option<u64>>,
) -> Result<()> {
    let bench = workbench(dir, config).await?;
    let Some(pr) = pr else {
        let result = bench.orchestrator.address_open_pull_requests().await;
        bench.finish().await;
        let reports = result?;
        if reports.is_empty() {
            println!("No unaddressed review comments on open pull requests");
        }
        let mut failed = Vec::new();
        for report in &reports {
            if let Err(e) = print_report(report) {
                failed.push(e.to_string());
            }
        }
        if !failed.is_empty() {
            bail!("{}", failed.join("\n"));
        }
        return Ok(());
    };

    let result = match wait {
        Some(minutes) => bench.orchestrator.wait_then_address(pr, minutes).await,
        None => bench.orchestrator.address_pull_request(pr).await,
    };
    bench.finish().await;

    match result? {
        Some(report) => print_report(&report),
        None => {
            println!("No unaddressed review comments on PR #{}", pr);
            Ok(())
        }
    }
}

pub async fn cmd_fix_checks(dir: &Path, config: IvanConfig, pr: i64) -> Result<()> {
    let bench = workbench(dir, config).await?;
    let result = bench.orchestrator.fix_failing_checks(pr).await;
    bench.finish().await;

    match result? {
        Some(report) => print_report(&report),
        None => {
            println!("No failing test or lint checks on PR #{}", pr);
            Ok(())
        }
    }
}
