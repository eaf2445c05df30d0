//! The external executor boundary.
//!
//! The engine knows an executor only through [`Executor::invoke`]: hand it
//! a prompt and a working directory, get back success, output text, and a
//! token count. [`CommandExecutor`] runs a command line as a child process
//! in its own process group so that the whole tree can be stopped on
//! timeout or cancellation.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::util::{signal_process_group, StopSignal};
use crate::{tlog_debug, tlog_warn};

/// How an invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum EndReason {
    /// The process exited on its own.
    Exited { code: Option<i32> },
    TimedOut,
    Cancelled,
}

/// Structured result of one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorOutcome {
    pub success: bool,
    pub output: String,
    pub tokens_used: u64,
    pub error: Option<String>,
    pub ended: EndReason,
}

impl ExecutorOutcome {
    pub fn succeeded(output: impl Into<String>, tokens_used: u64) -> Self {
        Self {
            success: true,
            output: output.into(),
            tokens_used,
            error: None,
            ended: EndReason::Exited { code: Some(0) },
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            tokens_used: 0,
            error: Some(error.into()),
            ended: EndReason::Exited { code: None },
        }
    }

    pub fn timed_out(&self) -> bool {
        self.ended == EndReason::TimedOut
    }
}

/// Per-invocation controls beyond the prompt itself.
#[derive(Debug, Clone)]
pub struct InvokeControl {
    /// Fires when the run is cancelled.
    pub cancel: CancellationToken,
    /// Time between the polite stop request and the hard kill.
    pub grace_period: Duration,
    /// Where to write captured stdout/stderr.
    pub log_path: Option<PathBuf>,
    /// Set to the child's pid once spawned; 0 until then.
    pub spawned_pid: Arc<AtomicU32>,
}

impl InvokeControl {
    pub fn spawned_pid(&self) -> Option<u32> {
        match self.spawned_pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }
}

impl Default for InvokeControl {
    fn default() -> Self {
        Self {
            cancel: CancellationToken::new(),
            grace_period: Duration::from_secs(10),
            log_path: None,
            spawned_pid: Arc::new(AtomicU32::new(0)),
        }
    }
}

#[async_trait]
pub trait Executor: Send + Sync {
    /// Run one prompt to completion, timeout, or cancellation.
    ///
    /// `Err` is reserved for failures to start; anything the executor
    /// itself reports comes back as an unsuccessful outcome.
    async fn invoke(
        &self,
        prompt: &str,
        cwd: &Path,
        timeout: Duration,
        control: &InvokeControl,
    ) -> Result<ExecutorOutcome>;

    /// Short label for logs.
    fn name(&self) -> String {
        "executor".to_string()
    }
}

#[derive(Debug, Deserialize)]
struct RawUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// The JSON shape emitted by `claude -p --output-format json`.
#[derive(Debug, Deserialize)]
struct RawResponse {
    subtype: Option<String>,
    #[serde(default)]
    is_error: bool,
    result: Option<String>,
    error: Option<String>,
    usage: Option<RawUsage>,
}

/// Runs an external command, appending the prompt as its last argument.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandExecutor {
    pub fn new(program: impl Into<PathBuf>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse a whitespace-separated command line and resolve the program.
    pub fn from_command_line(command: &str) -> Result<Self> {
        let mut parts = command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| Error::Validation("executor command is empty".to_string()))?;
        let resolved = which::which(program)
            .map_err(|_| Error::ExecutorNotAvailable(program.to_string()))?;
        Ok(Self::new(resolved, parts))
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn spawn(&self, prompt: &str, cwd: &Path) -> Result<Child> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(prompt)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd.spawn()
            .map_err(|e| Error::Executor(format!("failed to spawn {}: {}", self.program.display(), e)))
    }

    /// SIGTERM the group, give it `grace`, then SIGKILL.
    async fn terminate(child: &mut Child, pgid: Option<u32>, grace: Duration) {
        match pgid {
            Some(pgid) => {
                signal_process_group(pgid, StopSignal::Terminate);
                if tokio::time::timeout(grace, child.wait()).await.is_err() {
                    tlog_warn!("Worker group {} ignored SIGTERM for {:?}; killing", pgid, grace);
                    signal_process_group(pgid, StopSignal::Kill);
                }
            }
            None => {
                let _ = child.start_kill();
            }
        }
        if let Err(e) = child.wait().await {
            tlog_warn!("Failed to reap worker process: {}", e);
        }
    }

    /// Map exit status and stdout to the executor contract.
    pub fn interpret(stdout: &str, stderr: &str, ended: EndReason, timeout: Duration) -> ExecutorOutcome {
        let exited_ok = ended == EndReason::Exited { code: Some(0) };
        let parsed = serde_json::from_str::<RawResponse>(stdout.trim()).ok();

        let (output, tokens_used, reported_error) = match parsed {
            Some(raw) => {
                let tokens = raw
                    .usage
                    .map(|u| u.input_tokens + u.output_tokens)
                    .unwrap_or(0);
                let is_error = raw.is_error || raw.subtype.as_deref() == Some("error");
                let error = if is_error {
                    Some(raw.error.clone().or(raw.result.clone()).unwrap_or_else(|| "executor reported an error".to_string()))
                } else {
                    None
                };
                (raw.result.unwrap_or_default(), tokens, error)
            }
            None => (stdout.trim().to_string(), 0, None),
        };

        let error = match ended {
            EndReason::TimedOut => Some(Error::WorkerTimeout(timeout).to_string()),
            EndReason::Cancelled => Some(Error::Cancelled.to_string()),
            EndReason::Exited { code } if !exited_ok => Some(if stderr.trim().is_empty() {
                match code {
                    Some(code) => format!("exit status {}", code),
                    None => "terminated by signal".to_string(),
                }
            } else {
                stderr.trim().to_string()
            }),
            EndReason::Exited { .. } => reported_error,
        };

        ExecutorOutcome {
            success: error.is_none(),
            output,
            tokens_used,
            error,
            ended,
        }
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    async fn invoke(
        &self,
        prompt: &str,
        cwd: &Path,
        timeout: Duration,
        control: &InvokeControl,
    ) -> Result<ExecutorOutcome> {
        let mut child = self.spawn(prompt, cwd)?;
        let pgid = child.id();
        if let Some(pid) = pgid {
            control.spawned_pid.store(pid, Ordering::SeqCst);
        }
        tlog_debug!(
            "Spawned {} pid={:?} cwd={}",
            self.program.display(),
            pgid,
            cwd.display()
        );

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(ref mut pipe) = stdout_pipe {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(ref mut pipe) = stderr_pipe {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });

        let ended = tokio::select! {
            status = child.wait() => EndReason::Exited { code: status?.code() },
            _ = tokio::time::sleep(timeout) => {
                tlog_warn!("Worker pid={:?} timed out after {:?}", pgid, timeout);
                Self::terminate(&mut child, pgid, control.grace_period).await;
                EndReason::TimedOut
            }
            _ = control.cancel.cancelled() => {
                tlog_debug!("Worker pid={:?} cancelled", pgid);
                Self::terminate(&mut child, pgid, control.grace_period).await;
                EndReason::Cancelled
            }
        };
        // Stragglers left in the group would keep the pipes open.
        if let Some(pgid) = pgid {
            signal_process_group(pgid, StopSignal::Kill);
        }

        let stdout = stdout_task
            .await
            .map_err(|e| Error::TaskJoin(e.to_string()))?;
        let stderr = stderr_task
            .await
            .map_err(|e| Error::TaskJoin(e.to_string()))?;
        let stdout = String::from_utf8_lossy(&stdout);
        let stderr = String::from_utf8_lossy(&stderr);

        if let Some(ref log_path) = control.log_path {
            let log = format!("=== stdout ===\n{}\n=== stderr ===\n{}\n", stdout, stderr);
            if let Err(e) = tokio::fs::write(log_path, log).await {
                tlog_warn!("Could not write worker log {}: {}", log_path.display(), e);
            }
        }

        Ok(Self::interpret(&stdout, &stderr, ended, timeout))
    }

    fn name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.display().to_string())
    }
}
