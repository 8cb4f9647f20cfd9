//! Runs one external tool to completion with cooperative cancellation.
//!
//! Output is pumped line by line into a channel by two reader tasks; the
//! runner polls that channel, the child's exit status and the registry's
//! cancel flag on a fixed cadence.

use crate::jobs::{JobGuard, JobId, JobRegistry, ProcessHandle, RegistryError};
use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Exit codes a shell reports for "cannot execute" and "not found".
const NOT_EXECUTABLE_EXIT_CODES: [i32; 2] = [126, 127];
const EXEC_FORMAT_ERROR: &str = "Exec format error";
const ENOEXEC: i32 = 8;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("Failed to launch '{program}': {source}")]
    LaunchFailed {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("'{program}' is not executable on this host: {detail}")]
    ToolNotExecutable { program: String, detail: String },
    #[error("Job '{0}' was cancelled")]
    Cancelled(JobId),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("IO error while supervising '{program}': {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// Program, arguments and working directory of one tool invocation.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub working_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn program_name(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }

    /// Command line for log output.
    pub fn display(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|part| part.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a process that ran to exit.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    /// `None` when the process was ended by a signal.
    pub exit_code: Option<i32>,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn stdout_text(&self) -> String {
        self.stdout.join("\n")
    }

    pub fn stderr_text(&self) -> String {
        self.stderr.join("\n")
    }

    /// Exit codes 126/127 or an exec format error on stderr mean the binary
    /// cannot run here at all, usually a build for another architecture.
    pub fn indicates_not_executable(&self) -> bool {
        self.exit_code.is_some_and(|code| NOT_EXECUTABLE_EXIT_CODES.contains(&code))
            || self.stderr.iter().any(|line| line.contains(EXEC_FORMAT_ERROR))
    }
}

#[derive(Debug)]
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Reader tasks for a child's pipes. Aborted when dropped so the pipe handles
/// are released on every exit path.
struct OutputPump {
    rx: mpsc::UnboundedReceiver<OutputLine>,
    readers: Vec<JoinHandle<()>>,
}

impl OutputPump {
    fn attach(child: &mut Child) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, tx.clone(), OutputLine::Stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, tx, OutputLine::Stderr));
        }
        Self { rx, readers }
    }

    /// Move all buffered lines into `output`. Returns the number of lines
    /// moved and whether both pipes have closed.
    fn drain(&mut self, job_id: &JobId, output: &mut ProcessOutput) -> (usize, bool) {
        let mut count = 0;
        loop {
            match self.rx.try_recv() {
                Ok(OutputLine::Stdout(line)) => {
                    tracing::debug!(job_id = %job_id, "stdout: {}", line);
                    output.stdout.push(line);
                    count += 1;
                }
                Ok(OutputLine::Stderr(line)) => {
                    tracing::debug!(job_id = %job_id, "stderr: {}", line);
                    output.stderr.push(line);
                    count += 1;
                }
                Err(mpsc::error::TryRecvError::Empty) => return (count, false),
                Err(mpsc::error::TryRecvError::Disconnected) => return (count, true),
            }
        }
    }
}

impl Drop for OutputPump {
    fn drop(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
    }
}

fn spawn_reader<R>(
    pipe: R,
    tx: mpsc::UnboundedSender<OutputLine>,
    wrap: fn(String) -> OutputLine,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(wrap(line)).is_err() {
                break;
            }
        }
    })
}

/// Launches external tools and supervises them until exit or cancellation.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    registry: JobRegistry,
    poll_interval: Duration,
    terminate_grace: Duration,
}

impl ProcessRunner {
    pub fn new(registry: JobRegistry, poll_interval: Duration, terminate_grace: Duration) -> Self {
        Self {
            registry,
            poll_interval,
            terminate_grace,
        }
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Run `spec` as job `job_id`.
    ///
    /// A non-zero exit is not an error here: it comes back as a
    /// [`ProcessOutput`] for the caller to judge. Errors are reserved for
    /// launch problems, cancellation and registry misuse.
    pub async fn run(&self, spec: &CommandSpec, job_id: JobId) -> Result<ProcessOutput, RunError> {
        let program = spec.program_name();
        tracing::info!(job_id = %job_id, "Running '{}'", spec.display());

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| classify_launch_error(&program, e))?;
        let mut pump = OutputPump::attach(&mut child);

        let mut guard = match self.registry.register_scoped(job_id.clone(), ProcessHandle::new(child.id())) {
            Ok(guard) => Some(guard),
            Err(e) => {
                tracing::error!(job_id = %job_id, "Refusing to supervise a second process: {}", e);
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(e.into());
            }
        };

        let mut output = ProcessOutput::default();
        let mut exit_status: Option<ExitStatus> = None;
        let mut quiet_polls = 0u32;
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            if guard.as_ref().is_some_and(JobGuard::is_cancelled) {
                pump.drain(&job_id, &mut output);
                self.stop(&mut child, &job_id).await;
                tracing::warn!(job_id = %job_id, "'{}' was cancelled", program);
                return Err(RunError::Cancelled(job_id));
            }

            let (received, pipes_closed) = pump.drain(&job_id, &mut output);

            if exit_status.is_none() {
                exit_status = child.try_wait().map_err(|source| RunError::Io {
                    program: program.clone(),
                    source,
                })?;
                if exit_status.is_some() {
                    // The pid may be reused once reaped; the job is over even
                    // while output is still being drained.
                    guard = None;
                }
            }

            if exit_status.is_some() {
                if pipes_closed {
                    break;
                }
                quiet_polls = if received == 0 { quiet_polls + 1 } else { 0 };
                if quiet_polls >= 2 {
                    break;
                }
            }
        }
        output.exit_code = exit_status.and_then(|status| status.code());
        if output.success() {
            tracing::info!(job_id = %job_id, "'{}' finished successfully", program);
        } else {
            tracing::warn!(
                job_id = %job_id,
                exit_code = ?output.exit_code,
                "'{}' exited unsuccessfully: {}",
                program,
                output.stderr_text()
            );
        }
        Ok(output)
    }

    /// Ask the child to terminate, then kill it if it outlives the grace period.
    async fn stop(&self, child: &mut Child, job_id: &JobId) {
        ProcessHandle::new(child.id()).terminate();
        match tokio::time::timeout(self.terminate_grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(job_id = %job_id, "Terminated process exited with {}", status);
            }
            Ok(Err(e)) => {
                tracing::warn!(job_id = %job_id, "Failed to reap terminated process: {}", e);
            }
            Err(_) => {
                tracing::warn!(job_id = %job_id, "Process ignored terminate signal, killing it");
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
    }
}

fn classify_launch_error(program: &str, source: io::Error) -> RunError {
    if source.raw_os_error() == Some(ENOEXEC) {
        return RunError::ToolNotExecutable {
            program: program.to_string(),
            detail: source.to_string(),
        };
    }
    tracing::error!("Failed to launch '{}': {}", program, source);
    RunError::LaunchFailed {
        program: program.to_string(),
        source,
    }
}
