//! Native Android release build and local install.

use camino::Utf8Path;

use super::{ArtifactSource, BuildError};
use crate::config::ToolConfig;
use crate::process::{CommandRunner, ProcessError, os_args, run_checked};
use crate::progress::announce;

/// Release APK, relative to the host app's `android` directory.
pub const ANDROID_APK: &str = "app/build/outputs/apk/release/app-release.apk";

pub(super) fn build<R: CommandRunner>(
    host_root: &Utf8Path,
    tools: &ToolConfig,
    runner: &R,
) -> Result<ArtifactSource, BuildError> {
    announce("react-native:build:android");
    let android_dir = host_root.join("android");
    run_checked(
        runner,
        &tools.gradle_bin,
        &os_args(&["assembleRelease"]),
        &android_dir,
    )?;
    Ok(ArtifactSource::File(android_dir.join(ANDROID_APK)))
}

/// Installs the release APK onto the connected device, replacing any
/// previous install.
///
/// # Errors
///
/// Returns [`ProcessError`] when the install command fails.
pub fn install_on_device<R: CommandRunner>(
    host_root: &Utf8Path,
    tools: &ToolConfig,
    runner: &R,
) -> Result<(), ProcessError> {
    announce("react-native:install");
    run_checked(
        runner,
        &tools.adb_bin,
        &os_args(&["install", "-r", ANDROID_APK]),
        &host_root.join("android"),
    )?;
    Ok(())
}
