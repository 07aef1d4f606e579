//! Host app preparation.
//!
//! The package under test is installed into a wrapper app (`rntape` for
//! native builds, `expotape` for managed builds) so it runs inside a real
//! mobile runtime. This module resets the host app's manifest, packs and
//! installs the package, hoists its dependencies to the host's top level,
//! and writes the test descriptor bundled at build time.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::ambient_authority;
use cap_std::fs_utf8::Dir;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ToolConfig;
use crate::process::{CommandRunner, ProcessError, os_args, run_checked};
use crate::progress::announce;
use crate::run_config::TargetSystem;

/// Name of this tool's own package; never hoisted into the host app.
pub const SELF_PACKAGE_NAME: &str = "rn-tape";

/// Manifest template shipped inside each host app.
pub const MANIFEST_TEMPLATE: &str = "template-package.json";

/// Generated test descriptor inside each host app.
pub const TEST_DESCRIPTOR: &str = "test-config.js";

const MANIFEST: &str = "package.json";
const DEPENDENCY_DIR: &str = "node_modules";

/// Errors raised while preparing the host app.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum HostAppError {
    /// Raised when a filesystem operation fails.
    #[error("filesystem error at {path}: {message}")]
    Filesystem {
        /// Path involved in the failed operation.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// Raised when a manifest cannot be decoded.
    #[error("invalid manifest {path}: {message}")]
    Manifest {
        /// Manifest path.
        path: Utf8PathBuf,
        /// Decoder error string.
        message: String,
    },
    /// Raised when a package manager step fails.
    #[error(transparent)]
    Process(#[from] ProcessError),
}

impl HostAppError {
    fn filesystem(path: &Utf8Path, err: &io::Error) -> Self {
        Self::Filesystem {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}

/// The subset of a package manifest the tool relies on.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PackageManifest {
    /// Package name, possibly scoped (`@scope/name`).
    pub name: String,
    /// Package version.
    pub version: String,
    /// Runtime dependencies.
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    /// Development dependencies.
    #[serde(default)]
    pub dev_dependencies: BTreeMap<String, String>,
}

impl PackageManifest {
    /// Reads `package.json` from `package_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`HostAppError::Filesystem`] when the file cannot be read, or
    /// [`HostAppError::Manifest`] when it cannot be decoded.
    pub fn read(package_dir: &Utf8Path) -> Result<Self, HostAppError> {
        let path = package_dir.join(MANIFEST);
        let raw =
            std::fs::read_to_string(&path).map_err(|err| HostAppError::filesystem(&path, &err))?;
        serde_json::from_str(&raw).map_err(|err| HostAppError::Manifest {
            path,
            message: err.to_string(),
        })
    }

    /// File name `npm pack` gives the archive for this package.
    #[must_use]
    pub fn archive_name(&self) -> String {
        let stem = self.name.trim_start_matches('@').replace('/', "-");
        format!("{stem}-{}.tgz", self.version)
    }

    /// Union of runtime and development dependencies as `name@range`
    /// install specs. Development entries win on conflict and this tool's
    /// own package is excluded.
    #[must_use]
    pub fn hoisted_dependencies(&self) -> Vec<String> {
        let mut combined = self.dependencies.clone();
        combined.extend(
            self.dev_dependencies
                .iter()
                .map(|(name, range)| (name.clone(), range.clone())),
        );
        combined.remove(SELF_PACKAGE_NAME);
        combined
            .into_iter()
            .map(|(name, range)| format!("{name}@{range}"))
            .collect()
    }
}

/// Packed archive that is deleted when dropped.
#[derive(Debug)]
pub struct PackArchive {
    path: Utf8PathBuf,
}

impl PackArchive {
    /// Takes ownership of the archive at `path`.
    #[must_use]
    pub const fn new(path: Utf8PathBuf) -> Self {
        Self { path }
    }

    /// Location of the archive.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

impl Drop for PackArchive {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path, "removed pack archive"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %self.path, error = %err, "failed to remove pack archive"),
        }
    }
}

/// Wrapper app that hosts the package under test.
#[derive(Debug)]
pub struct HostApp<'a, R: CommandRunner> {
    root: Utf8PathBuf,
    tools: &'a ToolConfig,
    runner: &'a R,
}

impl<'a, R: CommandRunner> HostApp<'a, R> {
    /// Selects the host app for `target` under the configured hosts directory.
    #[must_use]
    pub fn for_target(target: TargetSystem, tools: &'a ToolConfig, runner: &'a R) -> Self {
        let name = match target {
            TargetSystem::Expo => "expotape",
            TargetSystem::Android | TargetSystem::Ios => "rntape",
        };
        Self {
            root: tools.hosts_path().join(name),
            tools,
            runner,
        }
    }

    /// Host app root directory.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Removes a stale copy of the package, regenerates the manifest from
    /// its template and installs the host app's own dependencies.
    ///
    /// # Errors
    ///
    /// Returns [`HostAppError`] when removal, manifest generation or the
    /// install fails. A missing stale copy is not an error.
    pub fn prepare(&self, manifest: &PackageManifest, force_clean: bool) -> Result<(), HostAppError> {
        let stale = self.root.join(DEPENDENCY_DIR).join(&manifest.name);
        if force_clean {
            remove_stale_copy(&stale)?;
            announce(&format!("react-native:clearing-old-dep [target={stale}]"));
        } else {
            debug!(target = %stale, "leaving stale copy for the package manager");
        }

        announce("react-native:npm install");
        self.write_manifest()?;
        self.npm(&["i"], &self.root)?;
        Ok(())
    }

    /// Packs the package, installs the archive into the host app and hoists
    /// the package's dependencies. The archive is removed on every path.
    ///
    /// # Errors
    ///
    /// Returns [`HostAppError`] when packing or any install step fails.
    pub fn install_package(
        &self,
        package_dir: &Utf8Path,
        manifest: &PackageManifest,
    ) -> Result<(), HostAppError> {
        announce("react-native:npm pack");
        let packed = self.npm(&["pack"], package_dir)?;
        let archive_name = packed
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| line.ends_with(".tgz"))
            .last()
            .map_or_else(|| manifest.archive_name(), str::to_owned);

        {
            let archive = PackArchive::new(package_dir.join(archive_name));
            announce("react-native:npm install .tgz");
            let args = [OsString::from("i"), OsString::from(archive.path().as_str())];
            run_checked(self.runner, &self.tools.npm_bin, &args, &self.root)?;
        }

        announce("react-native:npm install sub-dependencies");
        let hoisted = manifest.hoisted_dependencies();
        if hoisted.is_empty() {
            debug!("package has no dependencies to hoist");
            return Ok(());
        }
        let mut args = vec![OsString::from("i")];
        args.extend(hoisted.into_iter().map(OsString::from));
        run_checked(self.runner, &self.tools.npm_bin, &args, &self.root)?;
        Ok(())
    }

    /// Writes the descriptor naming the test entry point and relay URL.
    ///
    /// # Errors
    ///
    /// Returns [`HostAppError::Filesystem`] when the file cannot be written.
    pub fn write_test_descriptor(
        &self,
        manifest: &PackageManifest,
        test_entry: &str,
        public_url: &str,
    ) -> Result<(), HostAppError> {
        let contents = render_test_descriptor(&manifest.name, test_entry, public_url);
        self.write_file(TEST_DESCRIPTOR, &contents)
    }

    fn write_manifest(&self) -> Result<(), HostAppError> {
        let template_path = self.root.join(MANIFEST_TEMPLATE);
        let raw = std::fs::read_to_string(&template_path)
            .map_err(|err| HostAppError::filesystem(&template_path, &err))?;
        let template: Value =
            serde_json::from_str(&raw).map_err(|err| HostAppError::Manifest {
                path: template_path.clone(),
                message: err.to_string(),
            })?;
        let mut rendered =
            serde_json::to_string_pretty(&template).map_err(|err| HostAppError::Manifest {
                path: template_path,
                message: err.to_string(),
            })?;
        rendered.push('\n');
        self.write_file(MANIFEST, &rendered)
    }

    fn write_file(&self, name: &str, contents: &str) -> Result<(), HostAppError> {
        let dir = Dir::open_ambient_dir(&self.root, ambient_authority())
            .map_err(|err| HostAppError::filesystem(&self.root, &err))?;
        dir.write(name, contents)
            .map_err(|err| HostAppError::filesystem(&self.root.join(name), &err))
    }

    fn npm(&self, args: &[&str], cwd: &Utf8Path) -> Result<crate::process::CommandOutput, HostAppError> {
        Ok(run_checked(
            self.runner,
            &self.tools.npm_bin,
            &os_args(args),
            cwd,
        )?)
    }
}

/// Removes `path` recursively; a missing path (or a missing parent
/// directory) is not an error.
///
/// # Errors
///
/// Returns [`HostAppError::Filesystem`] for any other failure.
pub fn remove_stale_copy(path: &Utf8Path) -> Result<(), HostAppError> {
    let result = match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(err) => Err(err),
    };
    match result {
        Ok(()) => Ok(()),
        Err(err) if is_absent(&err) => Ok(()),
        Err(err) => Err(HostAppError::filesystem(path, &err)),
    }
}

fn is_absent(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
    )
}

/// Renders the script bundled into the host app at build time.
#[must_use]
pub fn render_test_descriptor(package_name: &str, test_entry: &str, public_url: &str) -> String {
    let module = Value::String(format!("{package_name}{test_entry}"));
    let url = Value::String(public_url.to_owned());
    format!(
        "// This file was generated by rn-tape\n\
         function runTest () {{\n  require({module})\n}}\n\n\
         const publicURL = {url}\n\n\
         module.exports = {{ runTest, publicURL }}\n"
    )
}
