//! Job history commands: `ivan jobs`, `ivan tasks`.

use anyhow::{Result, bail};

use ivan::config::IvanConfig;
use ivan::store::Store;

pub fn cmd_jobs(config: &IvanConfig, limit: i64) -> Result<()> {
    let store = Store::open(&config.db_path()?)?;
    let jobs = store.list_jobs(limit)?;

    if jobs.is_empty() {
        println!("No jobs yet. Start one with `ivan run \"<description>\"`.");
        return Ok(());
    }

    for job in jobs {
        let tasks = store.list_tasks_for_job(job.id)?;
        let done = tasks
            .iter()
            .filter(|t| t.status == ivan::store::TaskStatus::Completed)
            .count();
        println!(
            "#{:<5} {}  [{}/{}]  {}",
            job.id,
            job.created_at,
            done,
            tasks.len(),
            ivan::util::truncate_chars(&job.description, 60)
        );
    }
    Ok(())
}

pub fn cmd_tasks(config: &IvanConfig, job_id: i64, show_log: bool) -> Result<()> {
    let store = Store::open(&config.db_path()?)?;
    let Some(job) = store.get_job(job_id)? else {
        bail!("Job #{} not found", job_id);
    };

    println!("Job #{}: {}", job.id, job.description);
    println!("Directory: {}", job.working_directory);
    println!();

    for task in store.list_tasks_for_job(job.id)? {
        println!(
            "  #{} [{}] ({}) {}",
            task.id,
            task.status.as_str(),
            task.task_type.as_str(),
            task.description
        );
        if let Some(branch) = &task.branch {
            println!("      branch: {}", branch);
        }
        if let Some(sha) = &task.commit_sha {
            println!("      commit: {}", sha);
        }
        if let Some(pr) = &task.pr_link {
            println!("      PR: {}", pr);
        }
        if let Some(url) = &task.comment_url {
            println!("      reply: {}", url);
        }
        if show_log && !task.execution_log.is_empty() {
            println!();
            for line in task.execution_log.lines() {
                println!("      | {}", line);
            }
            println!();
        }
    }
    Ok(())
}
