//! Agent executors.
//!
//! The orchestrator only sees the [`Executor`] trait. Two backends implement
//! it on top of the agent CLI:
//!
//! - [`SessionExecutor`]: structured `stream-json` events, resumable by
//!   session id.
//! - [`ProcessExecutor`]: a plain interactive subprocess whose stdout and
//!   stderr are streamed live.
//!
//! Both observe the global [`CancellationToken`]: cancelling kills the agent
//! process and the pending call fails with [`IvanError::Cancelled`].

pub mod permissions;
pub mod process;
pub mod session;
pub mod stream;

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{ExecutorBackend, IvanConfig};
use crate::errors::{IvanError, IvanResult};

pub use process::ProcessExecutor;
pub use session::SessionExecutor;

/// How long to keep reading buffered output once the agent has exited.
const DRAIN_GRACE: std::time::Duration = std::time::Duration::from_millis(500);

const INSTALL_HINT: &str =
    "Install it with `npm install -g @anthropic-ai/claude-code` or point CLAUDE_CMD at the binary.";

/// Outcome of one agent invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionResult {
    /// Everything the agent said and did, in arrival order.
    pub transcript: String,
    /// The agent's closing remark.
    pub last_message: String,
    /// Pass back into the next call to continue the same conversation.
    pub session_id: Option<String>,
}

/// Live output forwarded to the operator while an agent runs.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentOutput {
    Text(String),
    Tool(String),
    ToolResult(String),
    Stderr(String),
    Status(String),
}

impl std::fmt::Display for AgentOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentOutput::Text(s) => write!(f, "{}", s),
            AgentOutput::Tool(s) => write!(f, "  > {}", s),
            AgentOutput::ToolResult(s) => write!(f, "    {}", s),
            AgentOutput::Stderr(s) => write!(f, "[stderr] {}", s),
            AgentOutput::Status(s) => write!(f, "[{}]", s),
        }
    }
}

pub type OutputSink = mpsc::UnboundedSender<AgentOutput>;

pub(crate) fn emit(sink: &Option<OutputSink>, output: AgentOutput) {
    if let Some(tx) = sink {
        // Receiver gone just means nobody is watching
        let _ = tx.send(output);
    }
}

/// Abstraction over the AI coding agent.
/// Real implementations: `SessionExecutor`, `ProcessExecutor`. Tests use fakes.
#[async_trait]
pub trait Executor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fail fast with `NotInstalled` when the agent binary is unavailable.
    async fn validate_installation(&self) -> IvanResult<()>;

    async fn execute_task(
        &self,
        prompt: &str,
        working_dir: &Path,
        session_id: Option<&str>,
    ) -> IvanResult<ExecutionResult>;

    /// Split a request into ordered subtasks. Never returns an empty list.
    async fn generate_breakdown(
        &self,
        description: &str,
        working_dir: &Path,
    ) -> IvanResult<Vec<String>> {
        let result = self
            .execute_task(&breakdown_prompt(description), working_dir, None)
            .await?;
        Ok(parse_breakdown(&result.last_message, description))
    }
}

/// Build the configured executor backend.
pub fn create_executor(
    config: &IvanConfig,
    cancel: CancellationToken,
    output: Option<OutputSink>,
) -> Arc<dyn Executor> {
    let agent = AgentCommand::from_config(config);
    match config.executor.backend {
        ExecutorBackend::Session => Arc::new(SessionExecutor::new(agent, cancel, output)),
        ExecutorBackend::Process => Arc::new(ProcessExecutor::new(agent, cancel, output)),
    }
}

pub fn breakdown_prompt(description: &str) -> String {
    format!(
        "Break the following request into the smallest set of independent, ordered \
         implementation tasks. Each task must be a self-contained instruction for a coding \
         agent. For simple requests return a single task. Do not modify any files.\n\n\
         Request:\n{}\n\n\
         Respond with a JSON array of strings only, for example [\"first task\", \"second task\"].",
        description
    )
}

/// Parse the agent's breakdown answer, falling back to the whole request as
/// one task when it holds no usable JSON array.
pub fn parse_breakdown(response: &str, description: &str) -> Vec<String> {
    let tasks: Vec<String> = crate::util::extract_json_array(response)
        .and_then(|json| serde_json::from_str::<Vec<serde_json::Value>>(&json).ok())
        .unwrap_or_default()
        .into_iter()
        .filter_map(|item| match item {
            serde_json::Value::String(s) => Some(s),
            serde_json::Value::Object(map) => map
                .get("description")
                .or_else(|| map.get("title"))
                .and_then(|v| v.as_str())
                .map(str::to_string),
            _ => None,
        })
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    if tasks.is_empty() {
        tracing::warn!("task breakdown unusable, running request as a single task");
        vec![description.to_string()]
    } else {
        tasks
    }
}

/// How to invoke the agent CLI.
#[derive(Debug, Clone)]
pub struct AgentCommand {
    pub program: String,
    pub model: Option<String>,
    pub allowed_tools: Vec<String>,
}

impl AgentCommand {
    pub fn from_config(config: &IvanConfig) -> Self {
        Self {
            program: config.executor.command.clone(),
            model: config.executor.model.clone(),
            allowed_tools: config.executor.allowed_tools.clone(),
        }
    }

    /// Base command in `working_dir` with model and tool allow-list flags.
    pub(crate) fn command(&self, working_dir: &Path, allowed_tools: &[String]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.current_dir(working_dir);
        if let Some(model) = &self.model {
            cmd.args(["--model", model]);
        }
        if !allowed_tools.is_empty() {
            cmd.args(["--allowedTools", &allowed_tools.join(",")]);
        }
        cmd
    }

    /// Run `<program> --version`.
    pub async fn check_installed(&self) -> IvanResult<()> {
        let output = Command::new(&self.program)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .await;
        match output {
            Ok(out) if out.status.success() => Ok(()),
            Ok(out) => Err(IvanError::not_installed(
                &self.program,
                &format!(
                    "`{} --version` failed: {}. {}",
                    self.program,
                    String::from_utf8_lossy(&out.stderr).trim(),
                    INSTALL_HINT
                ),
            )),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(IvanError::not_installed(&self.program, INSTALL_HINT))
            }
            Err(e) => Err(anyhow::Error::new(e)
                .context(format!("Failed to run {} --version", self.program))
                .into()),
        }
    }
}

/// One line of agent output, tagged by stream.
#[derive(Debug)]
pub(crate) enum StreamLine {
    Stdout(String),
    Stderr(String),
}

pub(crate) struct ProcessOutcome {
    pub status: std::process::ExitStatus,
    pub stderr: String,
}

/// Spawn `cmd`, hand every stdout/stderr line to `on_line` as it arrives,
/// and wait for exit. Cancellation kills the child and yields `Cancelled`.
pub(crate) async fn drive_process<F>(
    mut cmd: Command,
    program: &str,
    cancel: &CancellationToken,
    mut on_line: F,
) -> IvanResult<ProcessOutcome>
where
    F: FnMut(StreamLine),
{
    if cancel.is_cancelled() {
        return Err(IvanError::Cancelled);
    }

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(IvanError::not_installed(program, INSTALL_HINT));
        }
        Err(e) => {
            return Err(anyhow::Error::new(e)
                .context(format!("Failed to spawn {}", program))
                .into());
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<StreamLine>();

    if let Some(stdout) = child.stdout.take() {
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(StreamLine::Stdout(line)).is_err() {
                    break;
                }
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(StreamLine::Stderr(line)).is_err() {
                    break;
                }
            }
        });
    }
    drop(tx);

    let mut stderr = String::new();
    let mut streams_open = true;
    let status = loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => Next::Cancelled,
            status = child.wait() => Next::Exited(status),
            line = rx.recv(), if streams_open => Next::Line(line),
        };
        match next {
            Next::Cancelled => {
                kill_child(&mut child).await;
                return Err(IvanError::Cancelled);
            }
            Next::Exited(status) => break status.context("Failed to wait for agent process")?,
            Next::Line(Some(line)) => record_line(line, &mut stderr, &mut on_line),
            Next::Line(None) => streams_open = false,
        }
    };

    // A background process spawned by the agent can keep the pipes open
    // after the agent itself exits.
    let deadline = tokio::time::Instant::now() + DRAIN_GRACE;
    while streams_open {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(line)) => record_line(line, &mut stderr, &mut on_line),
            Ok(None) => streams_open = false,
            Err(_) => {
                tracing::debug!("agent output still open after exit, not waiting for it");
                break;
            }
        }
    }

    Ok(ProcessOutcome { status, stderr })
}

enum Next {
    Cancelled,
    Exited(std::io::Result<std::process::ExitStatus>),
    Line(Option<StreamLine>),
}

fn record_line<F>(line: StreamLine, stderr: &mut String, on_line: &mut F)
where
    F: FnMut(StreamLine),
{
    if let StreamLine::Stderr(text) = &line {
        stderr.push_str(text);
        stderr.push('\n');
    }
    on_line(line);
}

async fn kill_child(child: &mut tokio::process::Child) {
    tracing::warn!("cancelling agent process");
    if let Err(e) = child.kill().await {
        tracing::debug!(error = %e, "agent process already exited");
    }
}
