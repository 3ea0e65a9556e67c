//! Prompt and reply text.

use crate::store::Task;
use crate::util::{tail_chars, truncate_chars};

/// Hook output beyond this is cut from the front; the end holds the errors.
const MAX_HOOK_OUTPUT_CHARS: usize = 12_000;
const MAX_CHECK_LOG_CHARS: usize = 8_000;

fn with_repo_instructions(mut prompt: String, repo_instructions: Option<&str>) -> String {
    if let Some(extra) = repo_instructions.map(str::trim).filter(|s| !s.is_empty()) {
        prompt.push_str("\n\n## Repository instructions\n\n");
        prompt.push_str(extra);
    }
    prompt
}

pub fn build_prompt(description: &str, repo_instructions: Option<&str>) -> String {
    let prompt = format!(
        "You are working in a git checkout of this repository on a dedicated branch.\n\n\
         ## Task\n\n{}\n\n\
         Make the change directly in the working tree. Do not commit, push or switch branches; \
         that is handled for you. When you are done, finish with a short summary of what you \
         changed.",
        description.trim()
    );
    with_repo_instructions(prompt, repo_instructions)
}

pub fn repair_prompt(hook_output: &str, attempt: u32, max_attempts: u32) -> String {
    format!(
        "Committing your changes failed because the repository's pre-commit checks reported \
         problems (attempt {} of {}). The raw output is below.\n\n```\n{}\n```\n\n\
         Fix every reported problem in the working tree. Do not disable, skip or weaken the \
         checks and do not commit. Finish with a short summary of the fixes.",
        attempt,
        max_attempts,
        tail_chars(hook_output.trim(), MAX_HOOK_OUTPUT_CHARS)
    )
}

/// What the agent did on earlier comments about the same file.
pub fn prior_resolution_context(tasks: &[Task]) -> Option<String> {
    if tasks.is_empty() {
        return None;
    }
    let mut out = String::from("## Earlier review fixes in this file\n");
    for task in tasks {
        out.push_str("\n- ");
        out.push_str(&truncate_chars(task.description.lines().next().unwrap_or(""), 200));
        if let Some(sha) = &task.commit_sha {
            out.push_str(&format!(" (commit {})", &sha[..sha.len().min(7)]));
        } else {
            out.push_str(" (no change needed)");
        }
    }
    Some(out)
}

pub struct AddressPromptInput<'a> {
    pub author: &'a str,
    pub path: &'a str,
    pub line: Option<i64>,
    pub comment: &'a str,
    pub instructions: &'a str,
    pub prior_context: Option<&'a str>,
}

pub fn address_prompt(input: &AddressPromptInput<'_>, repo_instructions: Option<&str>) -> String {
    let location = match input.line {
        Some(line) => format!("{}:{}", input.path, line),
        None => input.path.to_string(),
    };
    let mut prompt = format!(
        "A reviewer ({}) left an inline comment on this pull request at `{}`:\n\n> {}\n\n\
         ## What to do\n\n{}\n\n\
         Make the change in the working tree. If the comment needs no code change, change \
         nothing and explain why. Do not commit or push. Finish with one or two sentences \
         addressed to the reviewer describing what you did.",
        input.author,
        location,
        input.comment.trim().replace('\n', "\n> "),
        input.instructions.trim()
    );
    if let Some(prior) = input.prior_context {
        prompt.push_str("\n\n");
        prompt.push_str(prior);
    }
    with_repo_instructions(prompt, repo_instructions)
}

pub fn checks_prompt(failures: &[(String, String)], repo_instructions: Option<&str>) -> String {
    let mut prompt = String::from(
        "The following CI checks failed on this branch. Fix the code so they pass. Do not \
         disable or skip tests or lint rules, and do not commit.\n",
    );
    for (name, log) in failures {
        prompt.push_str(&format!(
            "\n## {}\n\n```\n{}\n```\n",
            name,
            tail_chars(log.trim(), MAX_CHECK_LOG_CHARS)
        ));
    }
    prompt.push_str("\nFinish with a short summary of the fixes.");
    with_repo_instructions(prompt, repo_instructions)
}

pub fn fixed_reply(short_sha: &str, closing_remark: &str) -> String {
    let remark = closing_remark.trim();
    if remark.is_empty() {
        format!("Addressed in {}.", short_sha)
    } else {
        format!("Addressed in {}.\n\n{}", short_sha, remark)
    }
}

pub fn no_change_reply(closing_remark: &str) -> String {
    let remark = closing_remark.trim();
    if remark.is_empty() {
        "Reviewed this comment; no code changes were necessary.".to_string()
    } else {
        format!("No code changes were necessary.\n\n{}", remark)
    }
}
