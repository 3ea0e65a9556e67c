use std::path::Path;
use std::sync::OnceLock;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{
    AgentCommand, AgentOutput, ExecutionResult, Executor, OutputSink, StreamLine, drive_process,
    emit, permissions,
};
use crate::errors::{IvanError, IvanResult};

/// Process backend: runs the agent as a plain-text subprocess.
///
/// Stdout and stderr are forwarded live and buffered into the transcript.
/// Conversation continuity uses an explicit session id: a fresh UUID is
/// handed over with `--session-id` on the first call and `--resume` after.
pub struct ProcessExecutor {
    agent: AgentCommand,
    cancel: CancellationToken,
    output: Option<OutputSink>,
    allowed_tools: OnceLock<Vec<String>>,
}

impl ProcessExecutor {
    pub fn new(agent: AgentCommand, cancel: CancellationToken, output: Option<OutputSink>) -> Self {
        Self {
            agent,
            cancel,
            output,
            allowed_tools: OnceLock::new(),
        }
    }

    /// Arguments for one call and the session id it will run under.
    pub(crate) fn build_args(prompt: &str, session_id: Option<&str>) -> (Vec<String>, String) {
        let mut args = vec!["-p".to_string(), prompt.to_string()];
        let session = match session_id {
            Some(id) => {
                args.push("--resume".to_string());
                args.push(id.to_string());
                id.to_string()
            }
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                args.push("--session-id".to_string());
                args.push(id.clone());
                id
            }
        };
        (args, session)
    }
}

/// The agent's closing remark: the last paragraph of its output.
pub(crate) fn last_paragraph(stdout: &str) -> String {
    stdout
        .trim()
        .rsplit("\n\n")
        .map(str::trim)
        .find(|p| !p.is_empty())
        .unwrap_or("")
        .to_string()
}

#[async_trait]
impl Executor for ProcessExecutor {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn validate_installation(&self) -> IvanResult<()> {
        self.agent.check_installed().await
    }

    async fn execute_task(
        &self,
        prompt: &str,
        working_dir: &Path,
        session_id: Option<&str>,
    ) -> IvanResult<ExecutionResult> {
        let tools = self
            .allowed_tools
            .get_or_init(|| permissions::resolve_allowed_tools(working_dir, &self.agent.allowed_tools));

        let (args, session) = Self::build_args(prompt, session_id);
        let mut cmd = self.agent.command(working_dir, tools);
        cmd.args(args);
        tracing::debug!(dir = %working_dir.display(), session = %session, "spawning agent process");

        let mut transcript = String::new();
        let mut stdout = String::new();
        let outcome = drive_process(cmd, &self.agent.program, &self.cancel, |line| match line {
            StreamLine::Stdout(line) => {
                transcript.push_str(&line);
                transcript.push('\n');
                stdout.push_str(&line);
                stdout.push('\n');
                emit(&self.output, AgentOutput::Text(line));
            }
            StreamLine::Stderr(line) => {
                transcript.push_str(&line);
                transcript.push('\n');
                emit(&self.output, AgentOutput::Stderr(line));
            }
        })
        .await?;

        if !outcome.status.success() {
            return Err(IvanError::execution_failed(
                outcome.status.code(),
                outcome.stderr,
            ));
        }

        Ok(ExecutionResult {
            last_message: last_paragraph(&stdout),
            transcript,
            session_id: Some(session),
        })
    }
}
