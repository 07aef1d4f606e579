//! External process execution.
//!
//! Every toolchain step (package manager, native build tools, device
//! installers) runs through the [`CommandRunner`] trait so the orchestrator
//! can be driven by scripted fakes in tests. Two real runners are provided:
//! [`ProcessCommandRunner`] buffers output silently, while
//! [`StreamingCommandRunner`] forwards each line to the terminal as it is
//! produced and still captures it for error reporting.

use std::ffi::OsString;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::process::{Child, Command, Stdio};
use std::thread;

use camino::Utf8Path;
use shell_escape::unix::escape;
use thiserror::Error;
use tracing::debug;

/// Result of running an external command.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Converts a non-zero exit into [`ProcessError::CommandFailure`].
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::CommandFailure`] when the exit code is not
    /// zero or the process was terminated without one.
    pub fn into_checked(self, program: &str) -> Result<Self, ProcessError> {
        if self.is_success() {
            return Ok(self);
        }

        let status_text = self
            .code
            .map_or_else(|| String::from("unknown"), |code| code.to_string());
        Err(ProcessError::CommandFailure {
            program: program.to_owned(),
            status: self.code,
            status_text,
            stderr: self.stderr,
        })
    }
}

/// Errors raised while running external commands.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProcessError {
    /// Raised when a command cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when a command completes with a non-zero exit code.
    #[error("{program} exited with status {status_text}")]
    CommandFailure {
        /// Command name used for the attempted operation.
        program: String,
        /// Exit status as reported by the OS.
        status: Option<i32>,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the process.
        stderr: String,
    },
}

impl ProcessError {
    /// Returns the stderr captured from a failed command, when non-empty.
    #[must_use]
    pub fn captured_stderr(&self) -> Option<&str> {
        match self {
            Self::CommandFailure { stderr, .. } if !stderr.trim().is_empty() => Some(stderr),
            _ => None,
        }
    }
}

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner {
    /// Runs `program` in `cwd`, capturing stdout and stderr.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::Spawn`] if the command cannot be started.
    fn run(
        &self,
        program: &str,
        args: &[OsString],
        cwd: &Utf8Path,
    ) -> Result<CommandOutput, ProcessError>;

    /// Runs `program` in `cwd`, handing each stdout line to `on_line` as it
    /// arrives. The lines are read lazily and can only be consumed once.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::Spawn`] if the command cannot be started.
    fn run_lines(
        &self,
        program: &str,
        args: &[OsString],
        cwd: &Utf8Path,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<CommandOutput, ProcessError>;
}

/// Runs `program` and converts a non-zero exit into an error.
///
/// # Errors
///
/// Returns [`ProcessError`] when the command cannot be spawned or exits with
/// a non-zero status.
pub fn run_checked<R: CommandRunner + ?Sized>(
    runner: &R,
    program: &str,
    args: &[OsString],
    cwd: &Utf8Path,
) -> Result<CommandOutput, ProcessError> {
    debug!(cwd = %cwd, command = %render_command(program, args), "running command");
    runner.run(program, args, cwd)?.into_checked(program)
}

/// Converts string slices into an owned argument vector.
#[must_use]
pub fn os_args(args: &[&str]) -> Vec<OsString> {
    args.iter().map(OsString::from).collect()
}

/// Renders a command line for logging, shell-escaping each argument.
#[must_use]
pub fn render_command(program: &str, args: &[OsString]) -> String {
    let mut rendered = String::from(program);
    for arg in args {
        rendered.push(' ');
        let lossy = arg.to_string_lossy();
        rendered.push_str(escape(lossy).as_ref());
    }
    rendered
}

/// Real command runner that buffers output without echoing it.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run(
        &self,
        program: &str,
        args: &[OsString],
        cwd: &Utf8Path,
    ) -> Result<CommandOutput, ProcessError> {
        let output = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .output()
            .map_err(|err| spawn_error(program, &err))?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn run_lines(
        &self,
        program: &str,
        args: &[OsString],
        cwd: &Utf8Path,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<CommandOutput, ProcessError> {
        stream_lines(program, args, cwd, on_line)
    }
}

/// Real command runner that echoes output while capturing it.
#[derive(Clone, Debug, Default)]
pub struct StreamingCommandRunner;

impl CommandRunner for StreamingCommandRunner {
    fn run(
        &self,
        program: &str,
        args: &[OsString],
        cwd: &Utf8Path,
    ) -> Result<CommandOutput, ProcessError> {
        let mut child = spawn_piped(program, args, cwd)?;
        let stderr_forwarder = child
            .stderr
            .take()
            .map(|pipe| thread::spawn(move || forward_lines(pipe, &mut io::stderr())));
        let stdout = child
            .stdout
            .take()
            .map(|pipe| forward_lines(pipe, &mut io::stdout()))
            .unwrap_or_default();
        let stderr = join_capture(stderr_forwarder);
        let status = child.wait().map_err(|err| spawn_error(program, &err))?;

        Ok(CommandOutput {
            code: status.code(),
            stdout,
            stderr,
        })
    }

    fn run_lines(
        &self,
        program: &str,
        args: &[OsString],
        cwd: &Utf8Path,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<CommandOutput, ProcessError> {
        stream_lines(program, args, cwd, on_line)
    }
}

fn stream_lines(
    program: &str,
    args: &[OsString],
    cwd: &Utf8Path,
    on_line: &mut dyn FnMut(&str),
) -> Result<CommandOutput, ProcessError> {
    let mut child = spawn_piped(program, args, cwd)?;
    let stderr_capture = child
        .stderr
        .take()
        .map(|pipe| thread::spawn(move || forward_lines(pipe, &mut io::sink())));

    let mut stdout = String::new();
    if let Some(pipe) = child.stdout.take() {
        for line in BufReader::new(pipe).lines().map_while(Result::ok) {
            on_line(&line);
            stdout.push_str(&line);
            stdout.push('\n');
        }
    }

    let stderr = join_capture(stderr_capture);
    let status = child.wait().map_err(|err| spawn_error(program, &err))?;
    Ok(CommandOutput {
        code: status.code(),
        stdout,
        stderr,
    })
}

fn spawn_piped(program: &str, args: &[OsString], cwd: &Utf8Path) -> Result<Child, ProcessError> {
    Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| spawn_error(program, &err))
}

fn forward_lines(pipe: impl Read, sink: &mut dyn Write) -> String {
    let mut captured = String::new();
    for line in BufReader::new(pipe).lines().map_while(Result::ok) {
        writeln!(sink, "{line}").ok();
        captured.push_str(&line);
        captured.push('\n');
    }
    captured
}

fn join_capture(handle: Option<thread::JoinHandle<String>>) -> String {
    handle
        .and_then(|forwarder| forwarder.join().ok())
        .unwrap_or_default()
}

fn spawn_error(program: &str, err: &io::Error) -> ProcessError {
    ProcessError::Spawn {
        program: program.to_owned(),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn cwd() -> &'static Utf8Path {
        Utf8Path::new(".")
    }

    #[rstest]
    fn into_checked_keeps_successful_output() {
        let output = CommandOutput {
            code: Some(0),
            stdout: String::from("done"),
            stderr: String::new(),
        };

        let checked = output.clone().into_checked("npm").expect("success passes");
        assert_eq!(checked, output);
    }

    #[rstest]
    #[case(Some(1), "1")]
    #[case(None, "unknown")]
    fn into_checked_reports_failure_status(#[case] code: Option<i32>, #[case] expected: &str) {
        let output = CommandOutput {
            code,
            stdout: String::new(),
            stderr: String::from("boom"),
        };

        let err = output.into_checked("./gradlew").expect_err("failure expected");
        assert_eq!(
            err,
            ProcessError::CommandFailure {
                program: String::from("./gradlew"),
                status: code,
                status_text: expected.to_owned(),
                stderr: String::from("boom"),
            }
        );
        assert_eq!(err.captured_stderr(), Some("boom"));
    }

    #[rstest]
    fn render_command_escapes_arguments() {
        let rendered = render_command("npm", &os_args(&["i", "left pad@1.0.0"]));
        assert_eq!(rendered, "npm i 'left pad@1.0.0'");
    }

    #[rstest]
    fn process_runner_captures_output_and_status() {
        let output = ProcessCommandRunner
            .run(
                "sh",
                &os_args(&["-c", "printf out && printf err 1>&2; exit 3"]),
                cwd(),
            )
            .expect("sh should spawn");

        assert_eq!(output.code, Some(3));
        assert_eq!(output.stdout, "out");
        assert_eq!(output.stderr, "err");
    }

    #[rstest]
    fn streaming_runner_captures_lines() {
        let output = StreamingCommandRunner
            .run(
                "sh",
                &os_args(&["-c", "echo one && echo two 1>&2"]),
                cwd(),
            )
            .expect("sh should spawn");

        assert!(output.is_success());
        assert_eq!(output.stdout, "one\n");
        assert_eq!(output.stderr, "two\n");
    }

    #[rstest]
    fn run_lines_yields_each_stdout_line_in_order() {
        let mut seen = Vec::new();
        let output = ProcessCommandRunner
            .run_lines(
                "sh",
                &os_args(&["-c", "echo a; echo b; echo c"]),
                cwd(),
                &mut |line| seen.push(line.to_owned()),
            )
            .expect("sh should spawn");

        assert!(output.is_success());
        assert_eq!(seen, ["a", "b", "c"]);
    }

    #[rstest]
    fn missing_program_is_a_spawn_error() {
        let err = ProcessCommandRunner
            .run("rn-tape-definitely-missing", &[], cwd())
            .expect_err("spawn should fail");

        assert!(
            matches!(err, ProcessError::Spawn { ref program, .. } if program == "rn-tape-definitely-missing"),
            "unexpected error: {err}"
        );
    }
}
