//! Core library for the `rn-tape` test runner.
//!
//! The crate packages a React Native library into a host app, builds it for
//! Android, iOS or Expo, deploys it to a local device or a remote device
//! farm, and collects the single result document the app posts back through
//! a public tunnel.

pub mod collector;
pub mod config;
pub mod farm;
pub mod host_app;
pub mod logging;
pub mod platform;
pub mod process;
pub mod progress;
pub mod report;
pub mod run;
pub mod run_config;
pub mod test_support;
pub mod tunnel;

pub use collector::{CollectorError, CompletionFlag, PendingResult, ResultCollector, TestPayload};
pub use config::{ConfigError, FarmConfig, ToolConfig, TunnelConfig};
pub use farm::{BrowserStackFarm, DeviceFarm, FarmError, SessionCapabilities, SessionHandle};
pub use host_app::{HostApp, HostAppError, PackArchive, PackageManifest};
pub use platform::{ArtifactSource, BuildArtifact, BuildError, PlatformBuilder};
pub use process::{
    CommandOutput, CommandRunner, ProcessCommandRunner, ProcessError, StreamingCommandRunner,
};
pub use run::{ErrorKind, RunError, RunOrchestrator, RunOutcome};
pub use run_config::{Credentials, RunConfig, RunConfigBuilder, TargetSystem, UsageError};
pub use tunnel::{NgrokTunnel, Tunnel, TunnelError};
