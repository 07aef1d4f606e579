//! Binary entry point for the `rn-tape` CLI.

use std::env;
use std::io::{self, Write};
use std::process;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use thiserror::Error;

use rntape::{
    BrowserStackFarm, CommandRunner, ConfigError, FarmConfig, NgrokTunnel, ProcessCommandRunner,
    RunConfig, RunError, RunOrchestrator, StreamingCommandRunner, TargetSystem, ToolConfig,
    TunnelConfig, logging, report,
};

mod cli;

use cli::{Cli, RunCommand};

/// Environment variable carrying the CI run identifier.
const RUN_ID_ENV: &str = "GITHUB_RUN_ID";

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("cannot resolve package location {location}: {message}")]
    Location { location: String, message: String },
    #[error(transparent)]
    Run(#[from] RunError),
}

struct Settings {
    tools: ToolConfig,
    farm: FarmConfig,
    tunnel: TunnelConfig,
}

#[tokio::main]
async fn main() {
    let Cli::Run(command) = Cli::parse();
    logging::init(command.verbose);

    let exit_code = match run_command(command).await {
        Ok(code) => code,
        Err(err) => report_error(&err),
    };
    process::exit(exit_code);
}

async fn run_command(args: RunCommand) -> Result<i32, CliError> {
    TargetSystem::from_str(args.system.trim()).map_err(RunError::from)?;

    let settings = Settings {
        tools: ToolConfig::load_without_cli_args()?,
        farm: FarmConfig::load_without_cli_args()?,
        tunnel: TunnelConfig::load_without_cli_args()?,
    };
    let package_dir = absolute_location(&args.location)?;
    let config = build_run_config(&args, &settings, package_dir, env::var(RUN_ID_ENV).ok())?;

    let outcome = if args.verbose {
        execute(StreamingCommandRunner, settings, &config).await?
    } else {
        execute(ProcessCommandRunner, settings, &config).await?
    };
    Ok(report::write_outcome(&mut io::stdout().lock(), &outcome))
}

async fn execute<R: CommandRunner>(
    runner: R,
    settings: Settings,
    config: &RunConfig,
) -> Result<rntape::RunOutcome, RunError> {
    let farm = BrowserStackFarm::new(&settings.farm);
    let tunnel = NgrokTunnel::new(settings.tunnel);
    RunOrchestrator::new(settings.tools, runner, tunnel, farm)
        .execute(config)
        .await
}

/// Merges CLI flags over the loaded configuration. Flags win.
fn build_run_config(
    args: &RunCommand,
    settings: &Settings,
    package_dir: Utf8PathBuf,
    run_id: Option<String>,
) -> Result<RunConfig, RunError> {
    let farm = &settings.farm;
    let config = RunConfig::builder()
        .target(args.system.as_str())
        .package_dir(package_dir)
        .test_entry(args.test.clone())
        .user(args.user.clone().or_else(|| farm.user.clone()))
        .access_key(args.access_key.clone().or_else(|| farm.access_key.clone()))
        .device(args.device.clone().or_else(|| farm.device.clone()))
        .os_version(args.os_version.clone().or_else(|| farm.os_version.clone()))
        .idle_timeout_secs(args.idle_timeout.or(farm.idle_timeout))
        .run_id(run_id)
        .tunnel_region(settings.tunnel.region.clone())
        .force_clean(settings.tools.force_clean && !args.no_clean)
        .build()?;
    Ok(config)
}

fn absolute_location(location: &str) -> Result<Utf8PathBuf, CliError> {
    let location_error = |message: String| CliError::Location {
        location: location.to_owned(),
        message,
    };
    let absolute = std::path::absolute(Utf8Path::new(location))
        .map_err(|err| location_error(err.to_string()))?;
    Utf8PathBuf::from_path_buf(absolute)
        .map_err(|path| location_error(format!("{} is not valid UTF-8", path.display())))
}

fn report_error(err: &CliError) -> i32 {
    let mut stderr = io::stderr().lock();
    match err {
        CliError::Run(run_err) => report::write_failure(&mut stderr, run_err),
        other => {
            writeln!(stderr, "rn-tape failed: {other}").ok();
            report::FATAL_EXIT_CODE
        }
    }
}
