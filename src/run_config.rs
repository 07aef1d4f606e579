//! Immutable description of a single test run.
//!
//! A [`RunConfig`] is assembled once from CLI flags and layered
//! configuration through [`RunConfigBuilder`], which is also where the target
//! system is validated. Nothing downstream mutates it.

use std::fmt;
use std::str::FromStr;

use camino::Utf8PathBuf;
use thiserror::Error;

/// Idle timeout used when none is configured, in seconds.
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 90;

/// Maximum idle timeout accepted by the device farm, in seconds.
pub const MAX_IDLE_TIMEOUT_SECS: u64 = 300;

/// Default test entry path, relative to the package root.
pub const DEFAULT_TEST_ENTRY: &str = "/test";

/// Label used for builds outside CI.
pub const DEFAULT_RUN_ID: &str = "dirty";

/// Mobile platform the package is tested on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TargetSystem {
    /// Native Android build installed as an APK.
    Android,
    /// Native iOS build packaged as an IPA.
    Ios,
    /// Managed Expo build producing a hosted Android bundle.
    Expo,
}

impl TargetSystem {
    /// All accepted target systems.
    pub const ALL: [Self; 3] = [Self::Android, Self::Ios, Self::Expo];

    /// Returns the lowercase name used on the command line.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Android => "android",
            Self::Ios => "ios",
            Self::Expo => "expo",
        }
    }

    /// Device requested when none is configured.
    #[must_use]
    pub const fn default_device(self) -> &'static str {
        match self {
            Self::Ios => "iPhone XS",
            Self::Android | Self::Expo => "Google Pixel 3",
        }
    }

    /// OS version requested when none is configured.
    #[must_use]
    pub const fn default_os_version(self) -> &'static str {
        match self {
            Self::Ios => "12",
            Self::Android | Self::Expo => "9.0",
        }
    }
}

impl fmt::Display for TargetSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetSystem {
    type Err = UsageError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|system| system.as_str() == value)
            .ok_or_else(|| UsageError::UnknownTarget(value.to_owned()))
    }
}

/// Errors raised when the run cannot even be described.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum UsageError {
    /// Raised when the target system is not one of the supported values.
    #[error("unknown target system '{0}': expected \"android\", \"ios\" or \"expo\"")]
    UnknownTarget(String),
    /// Raised when a device-farm user is given without an access key.
    #[error("a device farm access key is required when a user is given")]
    MissingAccessKey,
    /// Raised when a required value is blank.
    #[error("missing or empty value: {0}")]
    Blank(&'static str),
}

/// Device-farm credentials.
#[derive(Clone, Eq, PartialEq)]
pub struct Credentials {
    /// Account user name.
    pub user: String,
    /// Account access key.
    pub key: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Everything a run needs to know about what to test and where.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunConfig {
    /// Platform to build for.
    pub target: TargetSystem,
    /// Root directory of the package under test.
    pub package_dir: Utf8PathBuf,
    /// Test entry point, relative to the package root.
    pub test_entry: String,
    /// Device name requested from the farm.
    pub device: String,
    /// OS version requested from the farm.
    pub os_version: String,
    /// Requested idle timeout, in seconds, before clamping.
    pub idle_timeout_secs: u64,
    /// Device-farm credentials; remote mode is used when present.
    pub credentials: Option<Credentials>,
    /// CI run identifier used in the build label.
    pub run_id: String,
    /// Region hint forwarded to the tunnel provider.
    pub tunnel_region: Option<String>,
    /// Whether a stale copy of the package is removed from the host app.
    pub force_clean: bool,
}

impl RunConfig {
    /// Starts a builder for a [`RunConfig`].
    #[must_use]
    pub fn builder() -> RunConfigBuilder {
        RunConfigBuilder::default()
    }

    /// Returns `true` when the run targets a remote device farm.
    #[must_use]
    pub const fn is_remote(&self) -> bool {
        self.credentials.is_some()
    }

    /// Idle timeout sent to the farm, clamped to `1..=MAX_IDLE_TIMEOUT_SECS`.
    #[must_use]
    pub fn effective_idle_timeout(&self) -> u64 {
        self.idle_timeout_secs.clamp(1, MAX_IDLE_TIMEOUT_SECS)
    }

    /// Whether the session needs keep-alive pings to survive long runs.
    #[must_use]
    pub const fn needs_keep_alive(&self) -> bool {
        self.idle_timeout_secs >= MAX_IDLE_TIMEOUT_SECS
    }

    /// Label identifying this build on the farm dashboard.
    #[must_use]
    pub fn build_label(&self) -> String {
        format!(
            "{}:react-native:{}:{}:{}",
            self.run_id, self.target, self.device, self.os_version
        )
    }
}

/// Builder for [`RunConfig`] that validates on construction.
#[derive(Clone, Debug, Default)]
pub struct RunConfigBuilder {
    target: String,
    package_dir: Utf8PathBuf,
    test_entry: Option<String>,
    device: Option<String>,
    os_version: Option<String>,
    idle_timeout_secs: Option<u64>,
    user: Option<String>,
    access_key: Option<String>,
    run_id: Option<String>,
    tunnel_region: Option<String>,
    force_clean: Option<bool>,
}

impl RunConfigBuilder {
    /// Sets the target system name.
    #[must_use]
    pub fn target(mut self, value: impl Into<String>) -> Self {
        self.target = value.into();
        self
    }

    /// Sets the package directory.
    #[must_use]
    pub fn package_dir(mut self, value: impl Into<Utf8PathBuf>) -> Self {
        self.package_dir = value.into();
        self
    }

    /// Sets the test entry path.
    #[must_use]
    pub fn test_entry(mut self, value: Option<String>) -> Self {
        self.test_entry = value;
        self
    }

    /// Sets the device name.
    #[must_use]
    pub fn device(mut self, value: Option<String>) -> Self {
        self.device = value;
        self
    }

    /// Sets the OS version.
    #[must_use]
    pub fn os_version(mut self, value: Option<String>) -> Self {
        self.os_version = value;
        self
    }

    /// Sets the idle timeout in seconds.
    #[must_use]
    pub const fn idle_timeout_secs(mut self, value: Option<u64>) -> Self {
        self.idle_timeout_secs = value;
        self
    }

    /// Sets the device-farm user.
    #[must_use]
    pub fn user(mut self, value: Option<String>) -> Self {
        self.user = value;
        self
    }

    /// Sets the device-farm access key.
    #[must_use]
    pub fn access_key(mut self, value: Option<String>) -> Self {
        self.access_key = value;
        self
    }

    /// Sets the CI run identifier.
    #[must_use]
    pub fn run_id(mut self, value: Option<String>) -> Self {
        self.run_id = value;
        self
    }

    /// Sets the tunnel region hint.
    #[must_use]
    pub fn tunnel_region(mut self, value: Option<String>) -> Self {
        self.tunnel_region = value;
        self
    }

    /// Sets whether stale package copies are removed.
    #[must_use]
    pub const fn force_clean(mut self, value: bool) -> Self {
        self.force_clean = Some(value);
        self
    }

    /// Validates the inputs and builds the [`RunConfig`].
    ///
    /// The target system is checked first so an unknown platform is reported
    /// before anything else is inspected.
    ///
    /// # Errors
    ///
    /// Returns [`UsageError`] when the target system is unknown, a user is
    /// given without an access key, or the package directory is blank.
    pub fn build(self) -> Result<RunConfig, UsageError> {
        let target = TargetSystem::from_str(self.target.trim())?;
        if self.package_dir.as_str().trim().is_empty() {
            return Err(UsageError::Blank("package_dir"));
        }

        let credentials = match (non_blank(self.user), non_blank(self.access_key)) {
            (Some(user), Some(key)) => Some(Credentials { user, key }),
            (Some(_), None) => return Err(UsageError::MissingAccessKey),
            (None, _) => None,
        };

        Ok(RunConfig {
            target,
            package_dir: self.package_dir,
            test_entry: non_blank(self.test_entry)
                .unwrap_or_else(|| DEFAULT_TEST_ENTRY.to_owned()),
            device: non_blank(self.device).unwrap_or_else(|| target.default_device().to_owned()),
            os_version: non_blank(self.os_version)
                .unwrap_or_else(|| target.default_os_version().to_owned()),
            idle_timeout_secs: self.idle_timeout_secs.unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS),
            credentials,
            run_id: non_blank(self.run_id).unwrap_or_else(|| DEFAULT_RUN_ID.to_owned()),
            tunnel_region: non_blank(self.tunnel_region),
            force_clean: self.force_clean.unwrap_or(true),
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|raw| raw.trim().to_owned())
        .filter(|trimmed| !trimmed.is_empty())
}
