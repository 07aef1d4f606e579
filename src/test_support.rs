//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};

use crate::farm::{DeviceFarm, FarmError, FarmFuture, SessionCapabilities, SessionHandle};
use crate::platform::BuildArtifact;
use crate::process::{CommandOutput, CommandRunner, ProcessError};
use crate::run_config::Credentials;
use crate::tunnel::{Tunnel, TunnelError, TunnelFuture};

/// Public URL reported by [`ScriptedTunnel`].
pub const SCRIPTED_PUBLIC_URL: &str = "https://relay.example.test";

/// Artifact reference reported by [`ScriptedFarm`] uploads.
pub const SCRIPTED_APP_URL: &str = "bs://scripted-app";

/// Session identifier reported by [`ScriptedFarm`].
pub const SCRIPTED_SESSION_ID: &str = "scripted-session";

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Working directory the program ran in.
    pub cwd: Utf8PathBuf,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

#[derive(Debug, Default)]
struct RunnerState {
    responses: VecDeque<CommandOutput>,
    overrides: Vec<(String, CommandOutput)>,
    invocations: Vec<CommandInvocation>,
    permissive: bool,
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Outputs registered with [`ScriptedRunner::respond_to`] take precedence
/// for matching commands. A permissive runner answers every unscripted
/// command with success; a strict one reports a spawn failure.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    state: Arc<Mutex<RunnerState>>,
}

impl ScriptedRunner {
    /// Creates a strict runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a runner that answers unscripted commands with success.
    #[must_use]
    pub fn permissive() -> Self {
        let runner = Self::default();
        lock(&runner.state).permissive = true;
        runner
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        lock(&self.state).invocations.clone()
    }

    /// Returns the recorded invocations rendered as command strings.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        self.invocations()
            .iter()
            .map(CommandInvocation::command_string)
            .collect()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        lock(&self.state).responses.push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }

    /// Answers every command whose rendered form starts with `prefix`.
    pub fn respond_to(&self, prefix: impl Into<String>, output: CommandOutput) {
        lock(&self.state).overrides.push((prefix.into(), output));
    }

    /// Makes every command starting with `prefix` exit with `code`.
    pub fn fail_on(&self, prefix: impl Into<String>, code: i32) {
        self.respond_to(
            prefix,
            CommandOutput {
                code: Some(code),
                stdout: String::new(),
                stderr: String::from("simulated failure"),
            },
        );
    }

    fn next_response(&self, program: &str, args: &[OsString], cwd: &Utf8Path) -> Result<CommandOutput, ProcessError> {
        let invocation = CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
            cwd: cwd.to_path_buf(),
        };
        let rendered = invocation.command_string();
        let mut state = lock(&self.state);
        state.invocations.push(invocation);

        if let Some((_, output)) = state
            .overrides
            .iter()
            .find(|(prefix, _)| rendered.starts_with(prefix.as_str()))
        {
            return Ok(output.clone());
        }
        if let Some(output) = state.responses.pop_front() {
            return Ok(output);
        }
        if state.permissive {
            return Ok(CommandOutput {
                code: Some(0),
                ..CommandOutput::default()
            });
        }
        Err(ProcessError::Spawn {
            program: program.to_owned(),
            message: String::from("no scripted response available"),
        })
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(
        &self,
        program: &str,
        args: &[OsString],
        cwd: &Utf8Path,
    ) -> Result<CommandOutput, ProcessError> {
        self.next_response(program, args, cwd)
    }

    fn run_lines(
        &self,
        program: &str,
        args: &[OsString],
        cwd: &Utf8Path,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<CommandOutput, ProcessError> {
        let output = self.next_response(program, args, cwd)?;
        output.stdout.lines().for_each(|line| on_line(line));
        Ok(output)
    }
}

/// Sends `body` to a collector on the loopback interface as one POST.
///
/// # Errors
///
/// Returns the I/O error raised while connecting or writing.
pub async fn post_result(port: u16, body: &str) -> std::io::Result<String> {
    use tokio::io::AsyncReadExt;

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;
    let request = format!(
        "POST /result HTTP/1.1\r\nHost: 127.0.0.1\r\nContent-Type: application/json\r\n\
         Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(request.as_bytes()).await?;
    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

#[derive(Debug, Default)]
struct TunnelState {
    delivery: Option<(String, Duration)>,
    connect_error: Option<TunnelError>,
    connected_port: Option<u16>,
    region: Option<String>,
    stall_disconnect: bool,
}

/// Tunnel double that reports a fixed URL and can deliver a result to the
/// collector it was connected to, standing in for the app under test.
#[derive(Clone, Debug, Default)]
pub struct ScriptedTunnel {
    state: Arc<Mutex<TunnelState>>,
    disconnects: Arc<AtomicUsize>,
    teardowns: Arc<AtomicUsize>,
}

impl ScriptedTunnel {
    /// Creates a tunnel that connects but delivers nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Posts `body` to the connected port after `delay`.
    #[must_use]
    pub fn delivering(self, body: impl Into<String>, delay: Duration) -> Self {
        lock(&self.state).delivery = Some((body.into(), delay));
        self
    }

    /// Makes `connect` fail with `error`.
    #[must_use]
    pub fn failing_with(self, error: TunnelError) -> Self {
        lock(&self.state).connect_error = Some(error);
        self
    }

    /// Makes `disconnect` never complete, like an agent API that stops
    /// answering.
    #[must_use]
    pub fn stalling_disconnect(self) -> Self {
        lock(&self.state).stall_disconnect = true;
        self
    }

    /// Port passed to the last `connect` call.
    #[must_use]
    pub fn connected_port(&self) -> Option<u16> {
        lock(&self.state).connected_port
    }

    /// Region passed to the last `connect` call.
    #[must_use]
    pub fn region(&self) -> Option<String> {
        lock(&self.state).region.clone()
    }

    /// Number of `disconnect` calls.
    #[must_use]
    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Number of `teardown` calls.
    #[must_use]
    pub fn teardowns(&self) -> usize {
        self.teardowns.load(Ordering::SeqCst)
    }
}

impl Tunnel for ScriptedTunnel {
    fn connect<'a>(&'a self, local_port: u16, region: Option<&'a str>) -> TunnelFuture<'a, String> {
        Box::pin(async move {
            let delivery = {
                let mut state = lock(&self.state);
                state.connected_port = Some(local_port);
                state.region = region.map(str::to_owned);
                if let Some(err) = state.connect_error.clone() {
                    return Err(err);
                }
                state.delivery.clone()
            };
            if let Some((body, delay)) = delivery {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    post_result(local_port, &body).await.ok();
                });
            }
            Ok(String::from(SCRIPTED_PUBLIC_URL))
        })
    }

    fn disconnect(&self) -> TunnelFuture<'_, ()> {
        Box::pin(async move {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            let stall = lock(&self.state).stall_disconnect;
            if stall {
                std::future::pending::<()>().await;
            }
            Ok(())
        })
    }

    fn teardown(&self) -> TunnelFuture<'_, ()> {
        Box::pin(async move {
            self.teardowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

#[derive(Debug, Default)]
struct FarmState {
    upload_error: Option<FarmError>,
    session_error: Option<FarmError>,
    ping_error: Option<FarmError>,
    stall_quit: bool,
    uploads: Vec<BuildArtifact>,
    capabilities: Vec<SessionCapabilities>,
}

/// Device farm double that counts pings and quits.
#[derive(Clone, Debug, Default)]
pub struct ScriptedFarm {
    state: Arc<Mutex<FarmState>>,
    pings: Arc<AtomicUsize>,
    quits: Arc<AtomicUsize>,
}

impl ScriptedFarm {
    /// Creates a farm that accepts every request.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes uploads fail with `error`.
    #[must_use]
    pub fn failing_upload(self, error: FarmError) -> Self {
        lock(&self.state).upload_error = Some(error);
        self
    }

    /// Makes session start fail with `error`.
    #[must_use]
    pub fn failing_session(self, error: FarmError) -> Self {
        lock(&self.state).session_error = Some(error);
        self
    }

    /// Makes every ping fail with `error`.
    #[must_use]
    pub fn failing_ping(self, error: FarmError) -> Self {
        lock(&self.state).ping_error = Some(error);
        self
    }

    /// Makes `quit` never complete.
    #[must_use]
    pub fn stalling_quit(self) -> Self {
        lock(&self.state).stall_quit = true;
        self
    }

    /// Artifacts uploaded so far.
    #[must_use]
    pub fn uploads(&self) -> Vec<BuildArtifact> {
        lock(&self.state).uploads.clone()
    }

    /// Capabilities of every session started so far.
    #[must_use]
    pub fn sessions(&self) -> Vec<SessionCapabilities> {
        lock(&self.state).capabilities.clone()
    }

    /// Number of keep-alive pings received.
    #[must_use]
    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    /// Number of sessions quit.
    #[must_use]
    pub fn quits(&self) -> usize {
        self.quits.load(Ordering::SeqCst)
    }
}

impl DeviceFarm for ScriptedFarm {
    fn upload<'a>(
        &'a self,
        _credentials: &'a Credentials,
        artifact: &'a BuildArtifact,
    ) -> FarmFuture<'a, String> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.uploads.push(artifact.clone());
            state
                .upload_error
                .clone()
                .map_or_else(|| Ok(String::from(SCRIPTED_APP_URL)), Err)
        })
    }

    fn start_session<'a>(
        &'a self,
        credentials: &'a Credentials,
        capabilities: &'a SessionCapabilities,
    ) -> FarmFuture<'a, SessionHandle> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.capabilities.push(capabilities.clone());
            if let Some(err) = state.session_error.clone() {
                return Err(err);
            }
            Ok(SessionHandle {
                id: String::from(SCRIPTED_SESSION_ID),
                credentials: credentials.clone(),
            })
        })
    }

    fn ping<'a>(&'a self, _session: &'a SessionHandle) -> FarmFuture<'a, ()> {
        Box::pin(async move {
            self.pings.fetch_add(1, Ordering::SeqCst);
            lock(&self.state).ping_error.clone().map_or(Ok(()), Err)
        })
    }

    fn quit<'a>(&'a self, _session: &'a SessionHandle) -> FarmFuture<'a, ()> {
        Box::pin(async move {
            self.quits.fetch_add(1, Ordering::SeqCst);
            let stall = lock(&self.state).stall_quit;
            if stall {
                std::future::pending::<()>().await;
            }
            Ok(())
        })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
