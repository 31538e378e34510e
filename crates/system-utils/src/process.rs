use std::fmt;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;

const MAX_DUMP_BYTES: u64 = 1024 * 1024;

/// The fixed command every admitted request runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub timeout: Duration,
}

impl CommandSpec {
    /// Builds a spec from `argv`, where the first element is the program.
    pub fn from_argv(
        argv: &[String],
        working_dir: Option<PathBuf>,
        timeout: Duration,
    ) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        if program.trim().is_empty() {
            return None;
        }
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            working_dir,
            timeout,
        })
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Success,
    Failed {
        detail: String,
        output: CapturedOutput,
    },
    TimedOut {
        after: Duration,
        output: CapturedOutput,
    },
}

impl ProcessOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    pub fn output(&self) -> Option<&CapturedOutput> {
        match self {
            Self::Success => None,
            Self::Failed { output, .. } | Self::TimedOut { output, .. } => Some(output),
        }
    }
}

impl fmt::Display for ProcessOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("command succeeded"),
            Self::Failed { detail, .. } => write!(f, "command failed: {detail}"),
            Self::TimedOut { after, .. } => {
                write!(f, "command timed out after {} seconds", after.as_secs())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    NotStarted,
    Running,
    Succeeded,
    Failed,
    Killing,
    Killed,
}

impl ExecutionState {
    pub fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::NotStarted, Self::Running)
                | (Self::NotStarted, Self::Failed)
                | (Self::Running, Self::Succeeded)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Killing)
                | (Self::Killing, Self::Killed)
        )
    }
}

/// A timed-out child could not be killed, or its exit could not be confirmed.
/// The process may still be running.
#[derive(Debug)]
pub struct TerminationFailed {
    pub pid: Option<u32>,
    pub source: io::Error,
}

impl fmt::Display for TerminationFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pid {
            Some(pid) => write!(f, "could not terminate process {pid}: {}", self.source),
            None => write!(f, "could not terminate process: {}", self.source),
        }
    }
}

impl std::error::Error for TerminationFailed {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

struct Supervision<'a> {
    program: &'a str,
    state: ExecutionState,
}

impl<'a> Supervision<'a> {
    fn new(program: &'a str) -> Self {
        Self {
            program,
            state: ExecutionState::NotStarted,
        }
    }

    fn advance(&mut self, next: ExecutionState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "invalid transition {:?} -> {:?}",
            self.state,
            next
        );
        tracing::debug!(
            event = "command.state",
            program = %self.program,
            from = ?self.state,
            to = ?next,
        );
        self.state = next;
    }
}

struct Captures {
    stdout: File,
    stderr: File,
}

/// Runs `spec` once with `input` on stdin, bounded by `spec.timeout`.
///
/// stdout and stderr go to anonymous temp files in `capture_dir`; they are
/// read back and logged only when the command fails or times out. On timeout
/// the child's process group is killed and its exit awaited before
/// returning. `Err` means that kill could not be carried out.
pub async fn run_supervised<I>(
    spec: &CommandSpec,
    input: I,
    capture_dir: &Path,
) -> Result<ProcessOutcome, TerminationFailed>
where
    I: AsRef<[u8]> + Send + Sync + 'static,
{
    let mut supervision = Supervision::new(&spec.program);

    let (captures, stdout, stderr) = match open_captures(capture_dir) {
        Ok(files) => files,
        Err(err) => {
            supervision.advance(ExecutionState::Failed);
            return Ok(ProcessOutcome::Failed {
                detail: format!(
                    "failed to create capture files in {}: {err}",
                    capture_dir.display()
                ),
                output: CapturedOutput::default(),
            });
        }
    };

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args);
    if let Some(dir) = &spec.working_dir {
        cmd.current_dir(dir);
    }
    cmd.stdin(Stdio::piped());
    cmd.stdout(stdout);
    cmd.stderr(stderr);
    cmd.kill_on_drop(true);
    apply_process_group(&mut cmd);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            supervision.advance(ExecutionState::Failed);
            let detail = format!("failed to spawn {}: {err}", spec.program);
            return Ok(fail(detail, captures).await);
        }
    };
    supervision.advance(ExecutionState::Running);
    let pid = child.id();
    tracing::debug!(event = "command.spawned", program = %spec.program, pid = ?pid);

    let feeder = child.stdin.take().map(|stdin| tokio::spawn(feed_stdin(stdin, input)));

    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = tokio::time::sleep(spec.timeout) => None,
    };

    let outcome = match exited {
        Some(Ok(status)) if status.success() => {
            supervision.advance(ExecutionState::Succeeded);
            ProcessOutcome::Success
        }
        Some(Ok(status)) => {
            supervision.advance(ExecutionState::Failed);
            fail(status.to_string(), captures).await
        }
        Some(Err(err)) => {
            supervision.advance(ExecutionState::Failed);
            fail(format!("failed to wait on {}: {err}", spec.program), captures).await
        }
        None => {
            supervision.advance(ExecutionState::Killing);
            tracing::warn!(
                event = "command.timeout",
                program = %spec.program,
                pid = ?pid,
                timeout_secs = spec.timeout.as_secs(),
                "command timed out, killing"
            );
            let status = match terminate(&mut child).await {
                Ok(status) => status,
                Err(source) => {
                    join_feeder(feeder).await;
                    return Err(TerminationFailed { pid, source });
                }
            };
            supervision.advance(ExecutionState::Killed);
            tracing::debug!(event = "command.killed", pid = ?pid, status = %status);
            let output = dump_captures(captures).await;
            ProcessOutcome::TimedOut {
                after: spec.timeout,
                output,
            }
        }
    };

    join_feeder(feeder).await;
    Ok(outcome)
}

fn open_captures(dir: &Path) -> io::Result<(Captures, Stdio, Stdio)> {
    let stdout = tempfile::tempfile_in(dir)?;
    let stderr = tempfile::tempfile_in(dir)?;
    let child_stdout = Stdio::from(stdout.try_clone()?);
    let child_stderr = Stdio::from(stderr.try_clone()?);
    let captures = Captures {
        stdout: File::from_std(stdout),
        stderr: File::from_std(stderr),
    };
    Ok((captures, child_stdout, child_stderr))
}

async fn feed_stdin<I: AsRef<[u8]> + Send + Sync>(mut stdin: ChildStdin, input: I) {
    if let Err(err) = stdin.write_all(input.as_ref()).await {
        tracing::debug!(event = "command.stdin", error = %err, "stdin closed early");
        return;
    }
    if let Err(err) = stdin.shutdown().await {
        tracing::debug!(event = "command.stdin", error = %err, "stdin shutdown failed");
    }
}

// The child is gone at this point; a writer still blocked on its pipe is
// aborted rather than awaited.
async fn join_feeder(feeder: Option<JoinHandle<()>>) {
    let Some(feeder) = feeder else {
        return;
    };
    if !feeder.is_finished() {
        feeder.abort();
    }
    let _ = feeder.await;
}

async fn fail(detail: String, captures: Captures) -> ProcessOutcome {
    let output = dump_captures(captures).await;
    ProcessOutcome::Failed { detail, output }
}

async fn dump_captures(captures: Captures) -> CapturedOutput {
    let output = CapturedOutput {
        stdout: read_capture("stdout", captures.stdout).await,
        stderr: read_capture("stderr", captures.stderr).await,
    };
    tracing::warn!(
        event = "command.output",
        stream = "stdout",
        output = %output.stdout.as_deref().unwrap_or(""),
        "dumping stdout of failed command"
    );
    tracing::warn!(
        event = "command.output",
        stream = "stderr",
        output = %output.stderr.as_deref().unwrap_or(""),
        "dumping stderr of failed command"
    );
    output
}

async fn read_capture(stream: &str, mut file: File) -> Option<String> {
    let mut bytes = Vec::new();
    let read = async {
        file.seek(SeekFrom::Start(0)).await?;
        (&mut file).take(MAX_DUMP_BYTES + 1).read_to_end(&mut bytes).await
    };
    if let Err(err) = read.await {
        tracing::warn!(event = "command.output", stream, error = %err, "failed to read capture");
        return None;
    }
    let truncated = bytes.len() as u64 > MAX_DUMP_BYTES;
    if truncated {
        bytes.truncate(MAX_DUMP_BYTES as usize);
    }
    format_output(&bytes, truncated)
}

fn format_output(bytes: &[u8], truncated: bool) -> Option<String> {
    if bytes.is_empty() {
        return None;
    }
    let mut out = String::from_utf8_lossy(bytes).to_string();
    if truncated {
        out.push_str("\n[output truncated]");
    }
    Some(out)
}

async fn terminate(child: &mut Child) -> io::Result<ExitStatus> {
    signal_group(child, libc::SIGKILL);
    child.start_kill()?;
    child.wait().await
}

#[cfg(unix)]
fn apply_process_group(cmd: &mut Command) {
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn apply_process_group(_cmd: &mut Command) {}

#[cfg(unix)]
fn signal_group(child: &Child, signal: i32) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(-(pid as i32), signal);
        }
    }
}

#[cfg(not(unix))]
fn signal_group(_child: &Child, _signal: i32) {}
