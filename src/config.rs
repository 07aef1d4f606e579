//! Configuration loading via `ortho-config`.
//!
//! Three independent sections are merged from defaults, configuration files
//! and environment variables: the local toolchain ([`ToolConfig`], prefix
//! `RNTAPE`), the device farm ([`FarmConfig`], prefix `BROWSERSTACK`) and the
//! tunnel agent ([`TunnelConfig`], prefix `NGROK`). CLI flags are applied on
//! top by the binary.
//!
//! All sections share one file, `rn-tape.toml`, found through the usual
//! discovery paths or named explicitly with `RNTAPE_CONFIG_PATH`.
//!
//! When `RNTAPE_HOSTS_DIR` is unset the bundled host apps are looked up next
//! to the running executable: `<bin>/hosts`, then
//! `<bin>/../share/rn-tape/hosts`, then the source tree the binary was built
//! from.

use camino::{Utf8Path, Utf8PathBuf};
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Host apps in the source tree, used when no installed copy is found.
pub const SOURCE_HOSTS_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/hosts");

/// Name of the directory holding the bundled host apps.
pub const HOSTS_DIR_NAME: &str = "hosts";

/// Status queries made while waiting for a managed build artifact.
pub const DEFAULT_EXPO_STATUS_ATTEMPTS: u32 = 60;

/// Milliseconds between managed build status queries.
pub const DEFAULT_EXPO_STATUS_INTERVAL_MS: u64 = 10_000;

/// Port the result collector binds by default.
pub const DEFAULT_COLLECTOR_PORT: u16 = 1234;

/// Device farm upload endpoint.
pub const DEFAULT_UPLOAD_URL: &str = "https://api-cloud.browserstack.com/app-automate/upload";

/// Device farm WebDriver hub.
pub const DEFAULT_HUB_URL: &str = "http://hub-cloud.browserstack.com/wd/hub";

/// Local inspection API of the tunnel agent.
pub const DEFAULT_TUNNEL_API_URL: &str = "http://127.0.0.1:4040";

const BIN_NAME: &str = "rn-tape";

/// Local toolchain settings.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "RNTAPE",
    discovery(
        app_name = "rn-tape",
        env_var = "RNTAPE_CONFIG_PATH",
        config_file_name = "rn-tape.toml",
        dotfile_name = ".rn-tape.toml",
        project_file_name = "rn-tape.toml"
    )
)]
pub struct ToolConfig {
    /// Directory containing the `rntape` and `expotape` host apps; located
    /// next to the executable when blank.
    #[ortho_config(default = String::new())]
    pub hosts_dir: String,
    /// Package manager binary.
    #[ortho_config(default = "npm".to_owned())]
    pub npm_bin: String,
    /// Node.js binary, used to query managed build status.
    #[ortho_config(default = "node".to_owned())]
    pub node_bin: String,
    /// Package runner binary, used for managed builds.
    #[ortho_config(default = "npx".to_owned())]
    pub npx_bin: String,
    /// Gradle wrapper, relative to the host app's `android` directory.
    #[ortho_config(default = "./gradlew".to_owned())]
    pub gradle_bin: String,
    /// Android debug bridge binary.
    #[ortho_config(default = "adb".to_owned())]
    pub adb_bin: String,
    /// CocoaPods binary.
    #[ortho_config(default = "pod".to_owned())]
    pub pod_bin: String,
    /// Xcode command-line build binary.
    #[ortho_config(default = "xcodebuild".to_owned())]
    pub xcodebuild_bin: String,
    /// Recursive copy binary, used to assemble the iOS payload.
    #[ortho_config(default = "cp".to_owned())]
    pub cp_bin: String,
    /// Archiver used to compress the iOS payload.
    #[ortho_config(default = "zip".to_owned())]
    pub zip_bin: String,
    /// Number of managed build status queries before giving up.
    #[ortho_config(default = DEFAULT_EXPO_STATUS_ATTEMPTS)]
    pub expo_status_attempts: u32,
    /// Delay between managed build status queries, in milliseconds.
    #[ortho_config(default = DEFAULT_EXPO_STATUS_INTERVAL_MS)]
    pub expo_status_interval_ms: u64,
    /// Port the result collector binds.
    #[ortho_config(default = DEFAULT_COLLECTOR_PORT)]
    pub collector_port: u16,
    /// Whether stale package copies are removed from the host app.
    #[ortho_config(default = true)]
    pub force_clean: bool,
}

/// Device farm settings.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "BROWSERSTACK",
    discovery(
        app_name = "rn-tape",
        env_var = "RNTAPE_CONFIG_PATH",
        config_file_name = "rn-tape.toml",
        dotfile_name = ".rn-tape.toml",
        project_file_name = "rn-tape.toml"
    )
)]
pub struct FarmConfig {
    /// Account user name; enables remote runs when set.
    pub user: Option<String>,
    /// Account access key.
    pub access_key: Option<String>,
    /// Device requested for the session.
    pub device: Option<String>,
    /// OS version requested for the session.
    pub os_version: Option<String>,
    /// Idle timeout in seconds.
    pub idle_timeout: Option<u64>,
    /// Upload endpoint for app binaries.
    #[ortho_config(default = DEFAULT_UPLOAD_URL.to_owned())]
    pub upload_url: String,
    /// WebDriver hub for sessions.
    #[ortho_config(default = DEFAULT_HUB_URL.to_owned())]
    pub hub_url: String,
}

/// Tunnel agent settings.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "NGROK",
    discovery(
        app_name = "rn-tape",
        env_var = "RNTAPE_CONFIG_PATH",
        config_file_name = "rn-tape.toml",
        dotfile_name = ".rn-tape.toml",
        project_file_name = "rn-tape.toml"
    )
)]
pub struct TunnelConfig {
    /// Tunnel agent binary.
    #[ortho_config(default = "ngrok".to_owned())]
    pub bin: String,
    /// Region hint passed to the agent.
    pub region: Option<String>,
    /// Base URL of the agent's local inspection API.
    #[ortho_config(default = DEFAULT_TUNNEL_API_URL.to_owned())]
    pub api_url: String,
    /// Seconds to wait for a public URL.
    #[ortho_config(default = 30)]
    pub connect_timeout_secs: u64,
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty.
    #[error("missing {field}: set {env_var} or add {field} to the configuration file")]
    MissingField {
        /// Field name.
        field: &'static str,
        /// Environment variable that provides it.
        env_var: &'static str,
    },
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

fn require(value: &str, field: &'static str, env_var: &'static str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingField { field, env_var });
    }
    Ok(())
}

impl ToolConfig {
    /// Loads defaults, configuration files and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the merge or validation fails.
    ///
    /// A blank hosts directory is resolved with [`locate_hosts_dir`].
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        let mut config = Self::load_from_iter([std::ffi::OsString::from(BIN_NAME)])
            .map_err(|err| ConfigError::Parse(err.to_string()))?;
        if config.hosts_dir.trim().is_empty() {
            config.hosts_dir = locate_hosts_dir()
                .map(Utf8PathBuf::into_string)
                .unwrap_or_default();
        }
        config.validate()?;
        Ok(config)
    }

    /// Ensures every binary and the hosts directory are non-blank.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] for the first blank value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require(&self.hosts_dir, "hosts_dir", "RNTAPE_HOSTS_DIR")?;
        require(&self.npm_bin, "npm_bin", "RNTAPE_NPM_BIN")?;
        require(&self.node_bin, "node_bin", "RNTAPE_NODE_BIN")?;
        require(&self.npx_bin, "npx_bin", "RNTAPE_NPX_BIN")?;
        require(&self.gradle_bin, "gradle_bin", "RNTAPE_GRADLE_BIN")?;
        require(&self.adb_bin, "adb_bin", "RNTAPE_ADB_BIN")?;
        require(&self.pod_bin, "pod_bin", "RNTAPE_POD_BIN")?;
        require(&self.xcodebuild_bin, "xcodebuild_bin", "RNTAPE_XCODEBUILD_BIN")?;
        require(&self.cp_bin, "cp_bin", "RNTAPE_CP_BIN")?;
        require(&self.zip_bin, "zip_bin", "RNTAPE_ZIP_BIN")?;
        Ok(())
    }

    /// Hosts directory as a path.
    #[must_use]
    pub fn hosts_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(&self.hosts_dir)
    }
}

/// Finds the bundled host apps relative to the running executable.
#[must_use]
pub fn locate_hosts_dir() -> Option<Utf8PathBuf> {
    let exe = std::env::current_exe()
        .ok()
        .and_then(|path| Utf8PathBuf::from_path_buf(path).ok());
    find_hosts_dir(exe.as_deref().and_then(Utf8Path::parent))
}

fn find_hosts_dir(exe_dir: Option<&Utf8Path>) -> Option<Utf8PathBuf> {
    let installed = exe_dir.into_iter().flat_map(|dir| {
        [
            dir.join(HOSTS_DIR_NAME),
            dir.join("../share").join(BIN_NAME).join(HOSTS_DIR_NAME),
        ]
    });
    installed
        .chain(std::iter::once(Utf8PathBuf::from(SOURCE_HOSTS_DIR)))
        .find(|candidate| candidate.is_dir())
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            hosts_dir: SOURCE_HOSTS_DIR.to_owned(),
            npm_bin: String::from("npm"),
            node_bin: String::from("node"),
            npx_bin: String::from("npx"),
            gradle_bin: String::from("./gradlew"),
            adb_bin: String::from("adb"),
            pod_bin: String::from("pod"),
            xcodebuild_bin: String::from("xcodebuild"),
            cp_bin: String::from("cp"),
            zip_bin: String::from("zip"),
            expo_status_attempts: DEFAULT_EXPO_STATUS_ATTEMPTS,
            expo_status_interval_ms: DEFAULT_EXPO_STATUS_INTERVAL_MS,
            collector_port: DEFAULT_COLLECTOR_PORT,
            force_clean: true,
        }
    }
}

impl FarmConfig {
    /// Loads defaults, configuration files and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the merge or validation fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        let config = Self::load_from_iter([std::ffi::OsString::from(BIN_NAME)])
            .map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Ensures the farm endpoints are non-blank.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] for the first blank endpoint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require(&self.upload_url, "upload_url", "BROWSERSTACK_UPLOAD_URL")?;
        require(&self.hub_url, "hub_url", "BROWSERSTACK_HUB_URL")?;
        Ok(())
    }
}

impl Default for FarmConfig {
    fn default() -> Self {
        Self {
            user: None,
            access_key: None,
            device: None,
            os_version: None,
            idle_timeout: None,
            upload_url: DEFAULT_UPLOAD_URL.to_owned(),
            hub_url: DEFAULT_HUB_URL.to_owned(),
        }
    }
}

impl TunnelConfig {
    /// Loads defaults, configuration files and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the merge or validation fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        let config = Self::load_from_iter([std::ffi::OsString::from(BIN_NAME)])
            .map_err(|err| ConfigError::Parse(err.to_string()))?;
        require(&config.bin, "bin", "NGROK_BIN")?;
        require(&config.api_url, "api_url", "NGROK_API_URL")?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn default_tool_config_is_valid() {
        assert_eq!(ToolConfig::default().validate(), Ok(()));
    }

    #[rstest]
    fn blank_binary_names_the_env_var() {
        let config = ToolConfig {
            gradle_bin: String::from("  "),
            ..ToolConfig::default()
        };

        let err = config.validate().expect_err("blank gradle");
        assert_eq!(
            err,
            ConfigError::MissingField {
                field: "gradle_bin",
                env_var: "RNTAPE_GRADLE_BIN",
            }
        );
        assert!(err.to_string().contains("RNTAPE_GRADLE_BIN"));
    }

    #[rstest]
    fn installed_hosts_sit_next_to_the_binary() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 temp dir");
        std::fs::create_dir_all(root.join("bin/hosts")).expect("hosts dir");

        assert_eq!(
            find_hosts_dir(Some(&root.join("bin"))),
            Some(root.join("bin/hosts"))
        );
    }

    #[rstest]
    fn shared_data_layout_is_found() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 temp dir");
        std::fs::create_dir_all(root.join("bin")).expect("bin dir");
        std::fs::create_dir_all(root.join("share/rn-tape/hosts")).expect("hosts dir");

        assert_eq!(
            find_hosts_dir(Some(&root.join("bin"))),
            Some(root.join("bin/../share/rn-tape/hosts"))
        );
    }

    #[rstest]
    fn source_tree_is_the_last_resort() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 temp dir");

        assert_eq!(
            find_hosts_dir(Some(&root)),
            Some(Utf8PathBuf::from(SOURCE_HOSTS_DIR))
        );
    }

    #[rstest]
    fn blank_hub_is_rejected() {
        let config = FarmConfig {
            hub_url: String::new(),
            ..FarmConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField { field: "hub_url", .. })
        ));
    }
}
