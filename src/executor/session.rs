use std::path::Path;
use std::sync::OnceLock;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::stream::TranscriptBuilder;
use super::{
    AgentCommand, AgentOutput, ExecutionResult, Executor, OutputSink, StreamLine, drive_process,
    emit, permissions,
};
use crate::errors::{IvanError, IvanResult};

/// Session backend: one `stream-json` call per invocation.
///
/// The agent reports a session id in its `init`/`result` events; passing it
/// back through `execute_task` resumes the same conversation.
pub struct SessionExecutor {
    agent: AgentCommand,
    cancel: CancellationToken,
    output: Option<OutputSink>,
    allowed_tools: OnceLock<Vec<String>>,
}

impl SessionExecutor {
    pub fn new(agent: AgentCommand, cancel: CancellationToken, output: Option<OutputSink>) -> Self {
        Self {
            agent,
            cancel,
            output,
            allowed_tools: OnceLock::new(),
        }
    }

    pub(crate) fn build_args(prompt: &str, session_id: Option<&str>) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            prompt.to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];
        if let Some(id) = session_id {
            args.push("--resume".to_string());
            args.push(id.to_string());
        }
        args
    }
}

#[async_trait]
impl Executor for SessionExecutor {
    fn name(&self) -> &'static str {
        "session"
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

        let mut cmd = self.agent.command(working_dir, tools);
        cmd.args(Self::build_args(prompt, session_id));
        tracing::debug!(dir = %working_dir.display(), resume = ?session_id, "starting agent session");

        let mut builder = TranscriptBuilder::new();
        let outcome = drive_process(cmd, &self.agent.program, &self.cancel, |line| match line {
            StreamLine::Stdout(line) => {
                for out in builder.push_line(&line) {
                    emit(&self.output, out);
                }
            }
            StreamLine::Stderr(line) => emit(&self.output, AgentOutput::Stderr(line)),
        })
        .await?;

        if !outcome.status.success() {
            return Err(IvanError::execution_failed(
                outcome.status.code(),
                outcome.stderr,
            ));
        }
        if let Some(error) = builder.error() {
            return Err(IvanError::execution_failed(
                outcome.status.code(),
                error.to_string(),
            ));
        }

        let (transcript, last_message, new_session) = builder.finish();
        Ok(ExecutionResult {
            transcript,
            last_message,
            session_id: new_session.or_else(|| session_id.map(str::to_string)),
        })
    }
}
