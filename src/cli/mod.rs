//! Command-line interface definitions for the `rn-tape` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::Parser;

/// Top-level CLI for the `rn-tape` binary.
#[derive(Debug, Parser)]
#[command(
    name = "rn-tape",
    version,
    about = "Run a React Native package's tests on a device or device farm",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Build the host app with the package and run its tests.
    #[command(name = "run", about = "Build the host app with the package and run its tests")]
    Run(RunCommand),
}

/// Arguments for the `rn-tape run` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct RunCommand {
    /// Target system: android, ios or expo.
    #[arg(value_name = "SYSTEM")]
    pub(crate) system: String,
    /// Directory of the package under test.
    #[arg(value_name = "LOCATION", default_value = ".")]
    pub(crate) location: String,
    /// Test entry point, relative to the package root.
    #[arg(value_name = "TEST")]
    pub(crate) test: Option<String>,
    /// Device farm user; runs remotely when set.
    ///
    /// Falls back to `BROWSERSTACK_USER` and the configuration file.
    #[arg(long, value_name = "USER")]
    pub(crate) user: Option<String>,
    /// Device farm access key, required with `--user`.
    #[arg(long, value_name = "KEY")]
    pub(crate) access_key: Option<String>,
    /// Device to run on.
    #[arg(long, value_name = "NAME")]
    pub(crate) device: Option<String>,
    /// OS version to run on.
    #[arg(long, value_name = "VERSION")]
    pub(crate) os_version: Option<String>,
    /// Session idle timeout in seconds (default 90, at most 300).
    ///
    /// At 300 or above the session is kept alive with periodic pings.
    #[arg(long, value_name = "SECONDS")]
    pub(crate) idle_timeout: Option<u64>,
    /// Leave a stale copy of the package in the host app.
    #[arg(long)]
    pub(crate) no_clean: bool,
    /// Echo toolchain output and enable debug logging.
    #[arg(short, long)]
    pub(crate) verbose: bool,
}
