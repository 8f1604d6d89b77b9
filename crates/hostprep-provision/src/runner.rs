//! External command execution
//!
//! Every interaction with the host goes through a [`CommandRunner`], which
//! keeps the engine testable: the real [`SystemRunner`] spawns processes,
//! while tests substitute a simulated host.

use std::fmt;
use std::io::{self, Read, Write};
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

/// Interval between `try_wait` polls while a child is running
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long output pipes may stay open after the child exits
const PIPE_GRACE: Duration = Duration::from_secs(2);

/// Default per-command timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(900);

/// A single command to execute
#[derive(Clone, Default)]
pub struct Invocation {
    /// Program name or path
    pub program: String,
    /// Positional arguments
    pub args: Vec<String>,
    /// Extra environment variables
    pub env: Vec<(String, String)>,
    /// Data piped to stdin. May carry secrets and is never logged.
    pub stdin: Option<String>,
}

impl Invocation {
    /// Create a new invocation of `program`
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable for the child
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Pipe `input` to the child's stdin
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Program and arguments as a single string, suitable for logs
    pub fn display(&self) -> String {
        let mut out = self.program.clone();
        for arg in &self.args {
            out.push(' ');
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                out.push('\'');
                out.push_str(arg);
                out.push('\'');
            } else {
                out.push_str(arg);
            }
        }
        out
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("env", &self.env)
            .field("stdin", &self.stdin.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display())
    }
}

/// Per-call execution options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Log the command and return a synthetic success instead of running it
    pub dry_run: bool,
    /// Kill the child once this much time has elapsed
    pub timeout: Duration,
}

impl RunOptions {
    /// Options for a real (non dry-run) invocation
    pub fn live(timeout: Duration) -> Self {
        Self {
            dry_run: false,
            timeout,
        }
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::live(DEFAULT_TIMEOUT)
    }
}

/// Captured result of a successful command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code (always 0 for a successful run)
    pub exit_code: i32,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
}

impl CommandOutput {
    /// A synthetic success with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }
}

/// Why a command did not succeed
#[derive(Debug, Error)]
pub enum CommandError {
    /// The binary is missing or could not be spawned
    #[error("failed to execute {program}: {source}")]
    Execution {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The command ran and signalled failure
    #[error("{command} exited with code {code}{}", stderr_suffix(.stderr))]
    NonZeroExit {
        command: String,
        code: i32,
        stdout: String,
        stderr: String,
    },

    /// The command exceeded its allotted time and was killed
    #[error("{command} timed out after {}s", .timeout.as_secs())]
    Timeout { command: String, timeout: Duration },
}

fn stderr_suffix(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(": {trimmed}")
    }
}

impl CommandError {
    /// Exit code if the command ran to completion
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::NonZeroExit { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Captured stdout of a non-zero exit
    pub fn stdout(&self) -> &str {
        match self {
            Self::NonZeroExit { stdout, .. } => stdout,
            _ => "",
        }
    }

    /// Captured stderr of a non-zero exit
    pub fn stderr(&self) -> &str {
        match self {
            Self::NonZeroExit { stderr, .. } => stderr,
            _ => "",
        }
    }
}

/// Executes external commands on the host
pub trait CommandRunner: Send + Sync {
    /// Run `invocation`.
    ///
    /// In dry-run mode implementations must not touch the host and return a
    /// synthetic success.
    fn run(
        &self,
        invocation: &Invocation,
        options: &RunOptions,
    ) -> Result<CommandOutput, CommandError>;
}

/// Runner backed by real processes
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl SystemRunner {
    /// Create a new system runner
    pub fn new() -> Self {
        Self
    }
}

impl CommandRunner for SystemRunner {
    fn run(
        &self,
        invocation: &Invocation,
        options: &RunOptions,
    ) -> Result<CommandOutput, CommandError> {
        let command = invocation.display();

        if options.dry_run {
            tracing::info!(command = %command, "dry-run: not executing");
            return Ok(CommandOutput::default());
        }

        tracing::debug!(command = %command, timeout_secs = options.timeout.as_secs(), "running");

        let execution_error = |source: io::Error| CommandError::Execution {
            program: invocation.program.clone(),
            source,
        };

        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .envs(invocation.env.iter().map(|(k, v)| (k, v)))
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(execution_error)?;

        if let (Some(input), Some(mut pipe)) = (invocation.stdin.clone(), child.stdin.take()) {
            // Written from a thread so a child that does not read stdin cannot block us.
            thread::spawn(move || {
                let _ = pipe.write_all(input.as_bytes());
            });
        }

        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let deadline = Instant::now() + options.timeout;
        let status = loop {
            if let Some(status) = child.try_wait().map_err(execution_error)? {
                break status;
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                tracing::warn!(command = %command, "timed out, child killed");
                return Err(CommandError::Timeout {
                    command,
                    timeout: options.timeout,
                });
            }
            thread::sleep(POLL_INTERVAL);
        };

        // Background processes the child started may still hold the pipes
        let until = Instant::now() + PIPE_GRACE;
        let stdout = stdout
            .map(|rx| collect(&rx, until, &command))
            .unwrap_or_default();
        let stderr = stderr
            .map(|rx| collect(&rx, until, &command))
            .unwrap_or_default();

        match status.code() {
            Some(0) => Ok(CommandOutput {
                exit_code: 0,
                stdout,
                stderr,
            }),
            code => {
                // Killed by a signal when there is no code
                let code = code.unwrap_or(-1);
                tracing::debug!(command = %command, code, "non-zero exit");
                Err(CommandError::NonZeroExit {
                    command,
                    code,
                    stdout,
                    stderr,
                })
            }
        }
    }
}

/// Forward everything read from `reader` in chunks until EOF
fn drain<R: Read + Send + 'static>(mut reader: R) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => break,
            }
        }
    });
    rx
}

/// Output received before the pipe closed or `until` passed
fn collect(rx: &Receiver<Vec<u8>>, until: Instant, command: &str) -> String {
    let mut buf = Vec::new();
    loop {
        match rx.recv_timeout(until.saturating_duration_since(Instant::now())) {
            Ok(chunk) => buf.extend_from_slice(&chunk),
            Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                tracing::debug!(command, "pipe still open after exit, output truncated");
                break;
            }
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}
