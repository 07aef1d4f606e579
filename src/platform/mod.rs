//! Platform-specific builds of the host app.
//!
//! Each target system produces exactly one [`BuildArtifact`]: a local binary
//! for native builds, or a hosted artifact URL for managed builds. The
//! artifact carries the device capabilities it is meant to run on.

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

use crate::config::ToolConfig;
use crate::process::{CommandRunner, ProcessError};
use crate::run_config::{RunConfig, TargetSystem};

mod android;
mod expo;
mod ios;

pub use android::{ANDROID_APK, install_on_device};
pub use expo::{BuildIdScanner, build_status_script};
pub use ios::{IOS_APP, IOS_IPA};

/// Where the built app can be fetched from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ArtifactSource {
    /// Binary on the local filesystem.
    File(Utf8PathBuf),
    /// Artifact already hosted by the build service.
    Url(String),
}

/// Output of a platform build.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BuildArtifact {
    /// Location of the built app.
    pub source: ArtifactSource,
    /// Device the app should run on.
    pub device: String,
    /// OS version the app should run on.
    pub os_version: String,
}

/// Errors raised while building the host app.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BuildError {
    /// Raised when a toolchain step fails.
    #[error(transparent)]
    Process(#[from] ProcessError),
    /// Raised when preparing build directories fails.
    #[error("filesystem error at {path}: {message}")]
    Filesystem {
        /// Path involved in the failed operation.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the managed build never reports its identifier.
    #[error("managed build did not report a build identifier")]
    MissingBuildId,
    /// Raised when no artifact URL is published for the build in time.
    #[error("no artifact URL available for managed build {build_id} after {attempts} status queries")]
    MissingArtifactUrl {
        /// Build identifier that was queried.
        build_id: String,
        /// Status queries made.
        attempts: u32,
    },
}

impl BuildError {
    fn filesystem(path: &Utf8Path, err: &std::io::Error) -> Self {
        Self::Filesystem {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}

/// Builds the host app for the configured target system.
#[derive(Debug)]
pub struct PlatformBuilder<'a, R: CommandRunner> {
    host_root: &'a Utf8Path,
    tools: &'a ToolConfig,
    runner: &'a R,
}

impl<'a, R: CommandRunner> PlatformBuilder<'a, R> {
    /// Creates a builder for the host app at `host_root`.
    #[must_use]
    pub const fn new(host_root: &'a Utf8Path, tools: &'a ToolConfig, runner: &'a R) -> Self {
        Self {
            host_root,
            tools,
            runner,
        }
    }

    /// Runs the toolchain for `config.target` and returns the artifact.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError`] when any toolchain step fails.
    pub fn build(&self, config: &RunConfig) -> Result<BuildArtifact, BuildError> {
        let source = match config.target {
            TargetSystem::Android => android::build(self.host_root, self.tools, self.runner)?,
            TargetSystem::Expo => expo::build(self.host_root, self.tools, self.runner)?,
            TargetSystem::Ios => ios::build(self.host_root, self.tools, self.runner)?,
        };
        Ok(BuildArtifact {
            source,
            device: config.device.clone(),
            os_version: config.os_version.clone(),
        })
    }
}
