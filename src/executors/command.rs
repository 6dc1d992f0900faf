use crate::core::errors::EngineError;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Upper bound on draining pipes after the child is gone. Grandchildren that
/// inherited the pipe can otherwise hold it open indefinitely.
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// One external process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub timeout: Duration,
    /// Written to the child's stdin, which is then closed.
    pub stdin: Option<String>,
    /// File the tool writes its output to (the run's output sink).
    pub output_file: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            timeout,
            stdin: None,
            output_file: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// `flag value` pair.
    pub fn opt(self, flag: &str, value: impl Into<String>) -> Self {
        self.arg(flag).arg(value)
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn output_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_file = Some(path.into());
        self
    }

    pub fn has_arg(&self, arg: &str) -> bool {
        self.args.iter().any(|a| a == arg)
    }

    /// Shell-quoted command line for logs.
    pub fn display(&self) -> String {
        let mut words = Vec::with_capacity(self.args.len() + 1);
        words.push(self.program.as_str());
        words.extend(self.args.iter().map(String::as_str));
        shell_words::join(words)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited,
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed or ended by a signal.
    pub exit_code: Option<i32>,
    pub duration_ms: u128,
    pub termination: Termination,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.termination == Termination::Exited && self.exit_code == Some(0)
    }
}

/// Process execution seam. The scheduler only talks to this trait, so tests
/// can substitute a scripted runner for real binaries.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    fn is_available(&self, program: &str) -> bool;

    /// Run `spec` to completion, timeout or cancellation. Only spawn failures
    /// are errors; a non-zero exit is a normal [`CommandOutput`].
    async fn run(
        &self,
        spec: &CommandSpec,
        cancel: &CancellationToken,
        grace: Duration,
    ) -> Result<CommandOutput, EngineError>;
}

#[derive(Debug, Default, Clone)]
pub struct ProcessRunner;

enum Waited {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    fn is_available(&self, program: &str) -> bool {
        super::toolchain::is_available(program)
    }

    async fn run(
        &self,
        spec: &CommandSpec,
        cancel: &CancellationToken,
        grace: Duration,
    ) -> Result<CommandOutput, EngineError> {
        let start = Instant::now();
        tracing::debug!("Executing: {} in {:?}", spec.display(), spec.cwd);

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.cwd)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => EngineError::ToolMissing(spec.program.clone()),
            _ => EngineError::Io(e),
        })?;

        if let (Some(input), Some(mut stdin)) = (spec.stdin.clone(), child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(input.as_bytes()).await {
                    tracing::debug!("stdin write failed: {}", e);
                }
            });
        }

        let stdout_task = child.stdout.take().map(|out| tokio::spawn(drain(out)));
        let stderr_task = child.stderr.take().map(|err| tokio::spawn(drain(err)));

        let waited = tokio::select! {
            status = child.wait() => Waited::Exited(status),
            _ = tokio::time::sleep(spec.timeout) => Waited::TimedOut,
            _ = cancel.cancelled() => Waited::Cancelled,
        };

        let (exit_code, termination) = match waited {
            Waited::Exited(status) => (status?.code(), Termination::Exited),
            Waited::TimedOut => {
                tracing::warn!(
                    "{} timed out after {}s, killing",
                    spec.program,
                    spec.timeout.as_secs()
                );
                let _ = child.kill().await;
                (None, Termination::TimedOut)
            }
            Waited::Cancelled => {
                // in-flight runs get the grace period before being killed;
                // one that exits inside it finished its work
                match tokio::time::timeout(grace, child.wait()).await {
                    Ok(Ok(status)) => (status.code(), Termination::Exited),
                    _ => {
                        let _ = child.kill().await;
                        (None, Termination::Cancelled)
                    }
                }
            }
        };

        let stdout = collect(stdout_task).await;
        let stderr = collect(stderr_task).await;

        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code,
            duration_ms: start.elapsed().as_millis(),
            termination,
        })
    }
}

async fn drain<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut buf = Vec::new();
    if let Err(e) = reader.read_to_end(&mut buf).await {
        tracing::debug!("pipe read stopped early: {}", e);
    }
    String::from_utf8_lossy(&buf).into_owned()
}

async fn collect(task: Option<tokio::task::JoinHandle<String>>) -> String {
    let Some(task) = task else {
        return String::new();
    };
    match tokio::time::timeout(PIPE_DRAIN_TIMEOUT, task).await {
        Ok(Ok(text)) => text,
        _ => String::new(),
    }
}
