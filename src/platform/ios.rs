//! Native iOS build, packaged as an unsigned IPA.

use std::fs;
use std::io;

use camino::Utf8Path;

use super::{ArtifactSource, BuildError};
use crate::config::ToolConfig;
use crate::process::{CommandRunner, os_args, run_checked};
use crate::progress::announce;

/// Built app bundle, relative to the host app's `ios` directory.
pub const IOS_APP: &str = "build/Build/Products/Release-iphoneos/rntape.app";

/// Packaged archive, relative to the host app's `ios` directory.
pub const IOS_IPA: &str = "build/rntape-1.ipa";

pub(super) fn build<R: CommandRunner>(
    host_root: &Utf8Path,
    tools: &ToolConfig,
    runner: &R,
) -> Result<ArtifactSource, BuildError> {
    announce("react-native:build:ios");
    let ios_dir = host_root.join("ios");
    run_checked(
        runner,
        &tools.pod_bin,
        &os_args(&["install", "--clean-install"]),
        &ios_dir,
    )?;

    let build_dir = ios_dir.join("build");
    fs::create_dir_all(&build_dir).map_err(|err| BuildError::filesystem(&build_dir, &err))?;

    let workspace = ios_dir.join("rntape.xcworkspace");
    run_checked(
        runner,
        &tools.xcodebuild_bin,
        &os_args(&[
            "clean",
            "build",
            "-workspace",
            workspace.as_str(),
            "-configuration",
            "Release",
            "-scheme",
            "rntape",
            "-arch",
            "arm64",
            "-derivedDataPath",
            "build",
            "CODE_SIGN_IDENTITY=",
            "CODE_SIGNING_REQUIRED=NO",
            "CODE_SIGN_ENTITLEMENTS=",
            "CODE_SIGNING_ALLOWED=NO",
        ]),
        &ios_dir,
    )?;

    announce("react-native:package:ios");
    let ipa_dir = build_dir.join("ipa");
    remove_dir_if_present(&ipa_dir)?;
    let payload_dir = ipa_dir.join("Payload");
    fs::create_dir_all(&payload_dir).map_err(|err| BuildError::filesystem(&payload_dir, &err))?;

    run_checked(
        runner,
        &tools.cp_bin,
        &os_args(&["-r", IOS_APP, "build/ipa/Payload/rntape.app"]),
        &ios_dir,
    )?;

    let archive = ios_dir.join(IOS_IPA);
    match fs::remove_file(&archive) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(BuildError::filesystem(&archive, &err)),
    }
    run_checked(
        runner,
        &tools.zip_bin,
        &os_args(&["-r", "../rntape-1.ipa", "Payload"]),
        &ipa_dir,
    )?;

    Ok(ArtifactSource::File(archive))
}

fn remove_dir_if_present(path: &Utf8Path) -> Result<(), BuildError> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(BuildError::filesystem(path, &err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedRunner;
    use camino::Utf8PathBuf;
    use rstest::rstest;
    use tempfile::TempDir;

    fn host_root(dir: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 temp dir")
    }

    #[rstest]
    fn stale_payload_is_replaced() {
        let dir = TempDir::new().expect("temp dir");
        let root = host_root(&dir);
        let stale = root.join("ios/build/ipa/Payload/old.app");
        fs::create_dir_all(&stale).expect("stale payload");
        fs::write(root.join("ios").join(IOS_IPA), "old").expect("stale archive");
        let runner = ScriptedRunner::permissive();

        let source = build(&root, &ToolConfig::default(), &runner).expect("build succeeds");

        assert_eq!(source, ArtifactSource::File(root.join("ios").join(IOS_IPA)));
        assert!(!stale.exists());
        assert!(root.join("ios/build/ipa/Payload").is_dir());
        assert!(!root.join("ios").join(IOS_IPA).exists());
        assert_eq!(
            runner.commands()[2],
            format!("cp -r {IOS_APP} build/ipa/Payload/rntape.app")
        );
    }

    #[rstest]
    fn signing_is_disabled_for_the_release_build() {
        let dir = TempDir::new().expect("temp dir");
        let root = host_root(&dir);
        let runner = ScriptedRunner::permissive();

        build(&root, &ToolConfig::default(), &runner).expect("build succeeds");

        let invocations = runner.invocations();
        let xcodebuild = &invocations[1];
        assert_eq!(xcodebuild.cwd, root.join("ios"));
        let rendered = xcodebuild.command_string();
        assert!(rendered.contains(&format!("-workspace {root}/ios/rntape.xcworkspace")));
        assert!(rendered.contains("-configuration Release -scheme rntape -arch arm64"));
        assert!(rendered.contains("CODE_SIGN_IDENTITY= CODE_SIGNING_REQUIRED=NO"));
    }

    #[rstest]
    fn pod_failure_stops_the_build() {
        let dir = TempDir::new().expect("temp dir");
        let root = host_root(&dir);
        let runner = ScriptedRunner::new();
        runner.push_failure(1);

        let err = build(&root, &ToolConfig::default(), &runner).expect_err("pods fail");

        assert!(matches!(err, BuildError::Process(_)));
        assert_eq!(runner.invocations().len(), 1);
        assert!(!root.join("ios/build").exists());
    }
}
