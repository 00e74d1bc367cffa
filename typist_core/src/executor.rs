use crate::coverage::CoverageObservation;
use std::fs;
use std::io::{ErrorKind, Write};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use thiserror::Error;
use tracing::debug;

/// Token in an invocation that is replaced by the path of the current input file.
pub const INPUT_PLACEHOLDER: &str = "@@";

/// Fixed name of the file inputs are written to in file-delivery mode.
pub const CURRENT_INPUT_FILENAME: &str = ".cur_input";

/// Exit status reserved by targets to signal an abnormal termination.
pub const CRASH_EXIT_STATUS: i32 = 255;

/// Status reported for an in-process harness that panicked.
pub const PANIC_EXIT_STATUS: i32 = -1;

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("Target invocation is empty")]
    EmptyInvocation,
    #[error("Failed to parse invocation '{invocation}': {reason}")]
    MalformedInvocation { invocation: String, reason: String },
    #[error("Failed to spawn command {command:?}: {source}")]
    Spawn {
        command: Vec<String>,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to write input file {path:?}: {source}")]
    InputFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to write to target stdin: {0}")]
    Stdin(#[source] std::io::Error),
    #[error("Error waiting for child process: {0}")]
    Wait(#[source] std::io::Error),
}

/// Runs the target once per input and reports what it observed.
pub trait Executor: Send {
    fn run(&mut self, input: &[u8]) -> Result<CoverageObservation, ExecError>;
}

/// The crash oracle: negative statuses mean the target died to a signal or
/// fault, and 255 is the conventional "abort" exit code.
pub fn is_crash_status(status: i32) -> bool {
    status < 0 || status == CRASH_EXIT_STATUS
}

/// Builds the observation for one exit status. The status selects the single
/// slot that gets marked; negative statuses wrap from the end of the map.
pub fn observation_for_status(status: i32) -> CoverageObservation {
    let mut observation = CoverageObservation::new();
    observation.mark_slot(status.rem_euclid(crate::coverage::MAP_SIZE as i32) as usize);
    if is_crash_status(status) {
        observation.mark_crash();
    }
    observation
}

pub struct InProcessExecutor<F>
where
    F: FnMut(&[u8]) -> i32,
{
    harness_fn: F,
}

impl<F> InProcessExecutor<F>
where
    F: FnMut(&[u8]) -> i32,
{
    pub fn new(harness_fn: F) -> Self {
        Self { harness_fn }
    }
}

impl<F> Executor for InProcessExecutor<F>
where
    F: FnMut(&[u8]) -> i32 + Send,
{
    fn run(&mut self, input: &[u8]) -> Result<CoverageObservation, ExecError> {
        let result = catch_unwind(AssertUnwindSafe(|| (self.harness_fn)(input)));
        let status = match result {
            Ok(status) => status,
            Err(panic_payload) => {
                let msg = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic type".to_string()
                };
                debug!(%msg, "harness panicked");
                PANIC_EXIT_STATUS
            }
        };
        Ok(observation_for_status(status))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputDelivery {
    StdIn,
    File(PathBuf),
}

/// Executes an external command and fakes coverage from its exit status.
#[derive(Debug)]
pub struct ReturnCodeExecutor {
    command: Vec<String>,
    input_delivery: InputDelivery,
}

impl ReturnCodeExecutor {
    /// Picks the delivery mode once: an invocation mentioning `@@` gets its
    /// input through `<scratch_dir>/.cur_input`, anything else through stdin.
    pub fn from_invocation(invocation: &str, scratch_dir: &Path) -> Result<Self, ExecError> {
        let words =
            shell_words::split(invocation).map_err(|e| ExecError::MalformedInvocation {
                invocation: invocation.to_string(),
                reason: e.to_string(),
            })?;
        if words.is_empty() {
            return Err(ExecError::EmptyInvocation);
        }

        if words.iter().any(|word| word.contains(INPUT_PLACEHOLDER)) {
            let input_path = scratch_dir.join(CURRENT_INPUT_FILENAME);
            let path_str = input_path.to_string_lossy();
            let command = words
                .iter()
                .map(|word| word.replace(INPUT_PLACEHOLDER, &path_str))
                .collect();
            Ok(Self {
                command,
                input_delivery: InputDelivery::File(input_path),
            })
        } else {
            Ok(Self {
                command: words,
                input_delivery: InputDelivery::StdIn,
            })
        }
    }

    pub fn input_delivery(&self) -> &InputDelivery {
        &self.input_delivery
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    fn spawn_error(&self, source: std::io::Error) -> ExecError {
        ExecError::Spawn {
            command: self.command.clone(),
            source,
        }
    }
}

impl Executor for ReturnCodeExecutor {
    fn run(&mut self, input: &[u8]) -> Result<CoverageObservation, ExecError> {
        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..]);
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
        // Keep terminal signals (Ctrl+C) away from the target; the fuzzer
        // decides how an interrupt ends the run.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        match &self.input_delivery {
            InputDelivery::StdIn => {
                cmd.stdin(Stdio::piped());
            }
            InputDelivery::File(path) => {
                fs::write(path, input).map_err(|source| ExecError::InputFile {
                    path: path.clone(),
                    source,
                })?;
                cmd.stdin(Stdio::null());
            }
        }

        let mut child = cmd.spawn().map_err(|e| self.spawn_error(e))?;

        if let InputDelivery::StdIn = self.input_delivery {
            if let Some(mut child_stdin) = child.stdin.take() {
                match child_stdin.write_all(input) {
                    // The target may exit or close stdin before reading everything.
                    Err(e) if e.kind() == ErrorKind::BrokenPipe => {}
                    Err(e) => {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(ExecError::Stdin(e));
                    }
                    Ok(()) => {}
                }
            }
        }

        let status = child.wait().map_err(ExecError::Wait)?;
        Ok(observation_for_status(exit_status_code(status)))
    }
}

/// Collapses an `ExitStatus` into a single integer: the exit code, or the
/// negated signal number when the process was killed by a signal.
fn exit_status_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    PANIC_EXIT_STATUS
}
