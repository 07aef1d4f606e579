//! Orchestrates end-to-end test runs.
//!
//! A run prepares the host app, installs the package under test, starts the
//! result collector, publishes it through a tunnel, builds the app for the
//! target platform, deploys it, and waits for the app to report its result.
//! Teardown runs on every path once the collector is up, in a fixed order,
//! and never masks the failure that ended the run.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8Path;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::collector::{CollectorError, PendingResult, ResultCollector};
use crate::config::ToolConfig;
use crate::farm::{DeviceFarm, FarmError, SessionCapabilities, SessionHandle};
use crate::host_app::{HostApp, HostAppError, PackageManifest};
use crate::platform::{ArtifactSource, BuildArtifact, BuildError, PlatformBuilder, install_on_device};
use crate::process::{CommandRunner, ProcessError};
use crate::progress::{announce, instruct};
use crate::run_config::{Credentials, RunConfig, TargetSystem, UsageError};
use crate::tunnel::{Tunnel, TunnelError};

/// Interval between keep-alive pings.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(120);

/// Longest any single teardown step may take before it is abandoned.
pub const TEARDOWN_STEP_TIMEOUT: Duration = Duration::from_secs(45);

/// Failure classes reported to the operator.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// Bad command-line input.
    Usage,
    /// An external tool exited unsuccessfully.
    Toolchain,
    /// A tunnel, collector transport or device farm request failed.
    Network,
    /// The submitted result could not be decoded.
    Protocol,
    /// A local file could not be read or written.
    Filesystem,
    /// The remote session failed while the run was waiting.
    UnexpectedFault,
}

/// Errors that end a run.
#[derive(Debug, Error)]
pub enum RunError {
    /// Raised when the run inputs are invalid.
    #[error(transparent)]
    Usage(#[from] UsageError),
    /// Raised when host app preparation fails.
    #[error("host app preparation failed: {0}")]
    HostApp(#[from] HostAppError),
    /// Raised when the platform build fails.
    #[error("platform build failed: {0}")]
    Build(#[from] BuildError),
    /// Raised when installing onto a local device fails.
    #[error("device install failed: {0}")]
    Install(#[source] ProcessError),
    /// Raised when the collector fails or the first submission is unusable.
    #[error("result collection failed: {0}")]
    Collector(#[from] CollectorError),
    /// Raised when the tunnel cannot be opened.
    #[error("tunnel failed: {0}")]
    Tunnel(#[from] TunnelError),
    /// Raised when uploading or starting the remote session fails.
    #[error("device farm failed: {0}")]
    Farm(#[from] FarmError),
    /// Raised when the remote session faults while awaiting the result.
    #[error("remote session fault: {0}")]
    UnexpectedFault(#[source] FarmError),
}

impl RunError {
    /// Projects the error onto its failure class.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Usage(_) => ErrorKind::Usage,
            Self::HostApp(HostAppError::Process(_))
            | Self::Build(BuildError::Process(_) | BuildError::MissingBuildId)
            | Self::Build(BuildError::MissingArtifactUrl { .. })
            | Self::Install(_) => ErrorKind::Toolchain,
            Self::HostApp(HostAppError::Filesystem { .. } | HostAppError::Manifest { .. })
            | Self::Build(BuildError::Filesystem { .. }) => ErrorKind::Filesystem,
            Self::Collector(CollectorError::Parse { .. }) => ErrorKind::Protocol,
            Self::Collector(_) | Self::Tunnel(_) | Self::Farm(_) => ErrorKind::Network,
            Self::UnexpectedFault(_) => ErrorKind::UnexpectedFault,
        }
    }

    /// Auxiliary data attached to the failure, such as captured stderr of a
    /// failed tool or the body of an unexpected device farm response.
    #[must_use]
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            Self::HostApp(HostAppError::Process(err))
            | Self::Build(BuildError::Process(err))
            | Self::Install(err) => err.captured_stderr(),
            Self::Farm(err) | Self::UnexpectedFault(err) => err.response_body(),
            _ => None,
        }
    }

    /// Message with any diagnostics appended.
    #[must_use]
    pub fn report_text(&self) -> String {
        match self.diagnostics() {
            Some(extra) => format!("{self}\n{}", extra.trim_end()),
            None => self.to_string(),
        }
    }
}

/// Outcome reported by the app under test.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunOutcome {
    /// Exit code derived from the payload's completion flag.
    pub exit_code: i32,
    /// Test output to print.
    pub output: String,
}

/// Periodic pinger that keeps an idle remote session alive.
#[derive(Debug, Default)]
struct KeepAlive {
    task: Option<JoinHandle<()>>,
}

impl KeepAlive {
    fn start<F>(
        farm: Arc<F>,
        session: SessionHandle,
        period: Duration,
        faults: mpsc::Sender<FarmError>,
    ) -> Self
    where
        F: DeviceFarm + Send + Sync + 'static,
    {
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                debug!(session = %session.id, "keep-alive ping");
                if let Err(err) = farm.ping(&session).await {
                    warn!(error = %err, "keep-alive ping failed");
                    faults.send(err).await.ok();
                    break;
                }
            }
        });
        Self { task: Some(task) }
    }

    /// Stops the pinger; cancelling twice, or never started, is a no-op.
    async fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            task.await.ok();
            debug!("keep-alive cancelled");
        }
    }
}

/// Channel carrying asynchronous faults raised by the remote session.
///
/// Installed when the session starts and dropped during teardown.
#[derive(Debug)]
struct FaultScope {
    reporter: mpsc::Sender<FarmError>,
    faults: mpsc::Receiver<FarmError>,
}

impl FaultScope {
    fn install() -> Self {
        let (reporter, faults) = mpsc::channel(1);
        Self { reporter, faults }
    }

    fn reporter(&self) -> mpsc::Sender<FarmError> {
        self.reporter.clone()
    }
}

/// Resources acquired by a run that teardown must release.
#[derive(Debug)]
struct RunState {
    collector: ResultCollector,
    tunnel_engaged: bool,
    session: Option<SessionHandle>,
    keep_alive: KeepAlive,
    faults: Option<FaultScope>,
}

impl RunState {
    fn new(collector: ResultCollector) -> Self {
        Self {
            collector,
            tunnel_engaged: false,
            session: None,
            keep_alive: KeepAlive::default(),
            faults: None,
        }
    }

    async fn teardown<T: Tunnel, F: DeviceFarm>(&mut self, tunnel: &T, farm: &F, limit: Duration) {
        self.keep_alive.cancel().await;
        self.faults = None;

        if let Some(session) = self.session.take() {
            announce("driver:quit");
            bounded_step("quit remote session", limit, farm.quit(&session)).await;
        }

        if self.tunnel_engaged {
            announce("ngrok:disconnect");
            bounded_step("disconnect tunnel", limit, tunnel.disconnect()).await;
            bounded_step("tear down tunnel", limit, tunnel.teardown()).await;
            self.tunnel_engaged = false;
        }

        announce("server:close");
        bounded_step("close result collector", limit, self.collector.stop()).await;
    }
}

/// Runs one teardown step, logging instead of propagating its failure.
async fn bounded_step<E: Display>(
    step: &str,
    limit: Duration,
    action: impl Future<Output = Result<(), E>>,
) {
    match tokio::time::timeout(limit, action).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(error = %err, "failed to {step}"),
        Err(_) => warn!(limit = ?limit, "gave up waiting to {step}"),
    }
}

/// Executes test runs against the given toolchain, tunnel and device farm.
#[derive(Debug)]
pub struct RunOrchestrator<R, T, F> {
    tools: ToolConfig,
    runner: R,
    tunnel: T,
    farm: Arc<F>,
    keep_alive_interval: Duration,
    teardown_step_timeout: Duration,
}

impl<R, T, F> RunOrchestrator<R, T, F>
where
    R: CommandRunner,
    T: Tunnel,
    F: DeviceFarm + Send + Sync + 'static,
{
    /// Creates a new orchestrator.
    #[must_use]
    pub fn new(tools: ToolConfig, runner: R, tunnel: T, farm: F) -> Self {
        Self {
            tools,
            runner,
            tunnel,
            farm: Arc::new(farm),
            keep_alive_interval: KEEP_ALIVE_INTERVAL,
            teardown_step_timeout: TEARDOWN_STEP_TIMEOUT,
        }
    }

    /// Overrides the keep-alive interval.
    ///
    /// This is primarily used by tests to keep long-session scenarios fast.
    #[must_use]
    pub const fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    /// Overrides how long each teardown step may take.
    #[must_use]
    pub const fn with_teardown_step_timeout(mut self, limit: Duration) -> Self {
        self.teardown_step_timeout = limit;
        self
    }

    /// Runs every phase and returns the outcome reported by the app.
    ///
    /// Once the collector is bound, teardown always runs before this returns,
    /// whatever the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`RunError`] for the first fatal failure of any phase.
    pub async fn execute(&self, config: &RunConfig) -> Result<RunOutcome, RunError> {
        info!(build = %config.build_label(), remote = config.is_remote(), "starting run");
        announce(&format!("rn-tape:start [build={}]", config.build_label()));

        let host = HostApp::for_target(config.target, &self.tools, &self.runner);
        let manifest = PackageManifest::read(&config.package_dir)?;
        host.prepare(&manifest, config.force_clean)?;
        host.install_package(&config.package_dir, &manifest)?;

        announce("server:start");
        let collector = ResultCollector::start(self.tools.collector_port).await?;
        let mut state = RunState::new(collector);

        let result = self.drive(config, &host, &manifest, &mut state).await;
        state
            .teardown(&self.tunnel, self.farm.as_ref(), self.teardown_step_timeout)
            .await;

        match &result {
            Ok(outcome) => info!(exit_code = outcome.exit_code, "run finished"),
            Err(err) => warn!(error = %err, "run failed"),
        }
        result
    }

    async fn drive(
        &self,
        config: &RunConfig,
        host: &HostApp<'_, R>,
        manifest: &PackageManifest,
        state: &mut RunState,
    ) -> Result<RunOutcome, RunError> {
        let pending = state.collector.take_pending().ok_or(CollectorError::Closed)?;

        announce("ngrok:connect");
        state.tunnel_engaged = true;
        let public_url = self
            .tunnel
            .connect(state.collector.port(), config.tunnel_region.as_deref())
            .await?;
        announce(&format!("ngrok:connected [url={public_url}]"));

        host.write_test_descriptor(manifest, &config.test_entry, &public_url)?;

        let artifact = PlatformBuilder::new(host.root(), &self.tools, &self.runner).build(config)?;

        match &config.credentials {
            Some(credentials) => {
                self.deploy_remote(config, credentials, manifest, &artifact, state)
                    .await?;
            }
            None => self.deploy_local(config.target, host.root(), &artifact)?,
        }

        announce("test:await-result");
        let payload = await_result(pending, state.faults.as_mut()).await?;
        Ok(RunOutcome {
            exit_code: payload.exit_code(),
            output: payload.output_text(),
        })
    }

    async fn deploy_remote(
        &self,
        config: &RunConfig,
        credentials: &Credentials,
        manifest: &PackageManifest,
        artifact: &BuildArtifact,
        state: &mut RunState,
    ) -> Result<(), RunError> {
        announce("browserstack:upload");
        let app_url = self.farm.upload(credentials, artifact).await?;
        let capabilities = SessionCapabilities::for_run(config, artifact, &manifest.name, &app_url);

        announce(&format!(
            "Starting browser test at {} [device={}, os_version={}]",
            app_url, capabilities.device, capabilities.os_version
        ));
        let session = self.farm.start_session(credentials, &capabilities).await?;

        let scope = FaultScope::install();
        if config.needs_keep_alive() {
            state.keep_alive = KeepAlive::start(
                Arc::clone(&self.farm),
                session.clone(),
                self.keep_alive_interval,
                scope.reporter(),
            );
        }
        state.faults = Some(scope);
        state.session = Some(session);
        Ok(())
    }

    fn deploy_local(
        &self,
        target: TargetSystem,
        host_root: &Utf8Path,
        artifact: &BuildArtifact,
    ) -> Result<(), RunError> {
        match (target, &artifact.source) {
            (TargetSystem::Android, _) => {
                install_on_device(host_root, &self.tools, &self.runner)
                    .map_err(RunError::Install)?;
                instruct("open the react-native app \"rntape\" on the device.");
            }
            (_, ArtifactSource::Url(url)) => {
                instruct(&format!("install the app from {url} on the device and open it."));
            }
            (_, ArtifactSource::File(path)) => instruct(&format!(
                "install {path} on the device and open the react-native app \"rntape\"."
            )),
        }
        Ok(())
    }
}

async fn await_result(
    pending: PendingResult,
    faults: Option<&mut FaultScope>,
) -> Result<crate::collector::TestPayload, RunError> {
    let Some(scope) = faults else {
        return Ok(pending.wait().await?);
    };
    tokio::select! {
        result = pending.wait() => Ok(result?),
        Some(fault) = scope.faults.recv() => Err(RunError::UnexpectedFault(fault)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn command_failure(stderr: &str) -> ProcessError {
        ProcessError::CommandFailure {
            program: String::from("./gradlew"),
            status: Some(1),
            status_text: String::from("1"),
            stderr: stderr.to_owned(),
        }
    }

    #[rstest]
    #[case(RunError::Usage(UsageError::UnknownTarget(String::from("windows"))), ErrorKind::Usage)]
    #[case(RunError::Build(BuildError::Process(command_failure(""))), ErrorKind::Toolchain)]
    #[case(RunError::Build(BuildError::MissingBuildId), ErrorKind::Toolchain)]
    #[case(
        RunError::HostApp(HostAppError::Filesystem {
            path: camino::Utf8PathBuf::from("/host/node_modules/pkg"),
            message: String::from("permission denied"),
        }),
        ErrorKind::Filesystem
    )]
    #[case(
        RunError::Collector(CollectorError::Parse { message: String::from("eof") }),
        ErrorKind::Protocol
    )]
    #[case(
        RunError::Collector(CollectorError::Transport { message: String::from("reset") }),
        ErrorKind::Network
    )]
    #[case(
        RunError::Tunnel(TunnelError::Timeout { seconds: 30 }),
        ErrorKind::Network
    )]
    #[case(
        RunError::UnexpectedFault(FarmError::Transport { message: String::from("gone") }),
        ErrorKind::UnexpectedFault
    )]
    fn errors_map_onto_failure_classes(#[case] err: RunError, #[case] expected: ErrorKind) {
        assert_eq!(err.kind(), expected);
    }

    #[rstest]
    fn report_text_appends_captured_stderr() {
        let err = RunError::Build(BuildError::Process(command_failure(
            "FAILURE: Build failed with an exception.\n",
        )));
        assert_eq!(
            err.report_text(),
            "platform build failed: ./gradlew exited with status 1\n\
             FAILURE: Build failed with an exception."
        );
    }

    #[rstest]
    fn report_text_appends_unexpected_farm_body() {
        let err = RunError::Farm(FarmError::UnexpectedResponse {
            status: 500,
            body: String::from("{\"value\":{}}"),
        });
        assert!(err.report_text().ends_with("\n{\"value\":{}}"));
    }

    #[rstest]
    fn report_text_without_diagnostics_is_the_message() {
        let err = RunError::Tunnel(TunnelError::Timeout { seconds: 5 });
        assert_eq!(err.report_text(), err.to_string());
    }

    #[tokio::test]
    async fn cancelling_an_idle_keep_alive_is_a_no_op() {
        let mut keep_alive = KeepAlive::default();
        keep_alive.cancel().await;
        keep_alive.cancel().await;
        assert!(keep_alive.task.is_none());
    }
}
