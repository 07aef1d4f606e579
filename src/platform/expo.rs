//! Managed (Expo) build.
//!
//! The managed build runs remotely; the CLI prints a link containing the
//! build identifier while it waits. The identifier is scraped from the
//! streamed output and then used to look up the hosted artifact URL, which
//! is queried repeatedly until the service publishes it.

use std::ffi::OsString;
use std::io::{self, Write};
use std::sync::LazyLock;
use std::thread;
use std::time::Duration;

use camino::Utf8Path;
use regex::Regex;
use tracing::debug;

use super::{ArtifactSource, BuildError};
use crate::config::ToolConfig;
use crate::process::{CommandRunner, os_args, run_checked};
use crate::progress::announce;

static BUILD_ID: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)builds/([0-9a-f-]+)").ok());

/// Tracks the last build identifier seen in a stream of output lines.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BuildIdScanner {
    last: Option<String>,
}

impl BuildIdScanner {
    /// Inspects one line, remembering the identifier if it carries one.
    pub fn observe(&mut self, line: &str) {
        let Some(pattern) = BUILD_ID.as_ref() else {
            return;
        };
        if let Some(id) = pattern.captures(line).and_then(|caps| caps.get(1)) {
            self.last = Some(id.as_str().to_owned());
        }
    }

    /// Consumes the scanner, returning the last identifier observed.
    #[must_use]
    pub fn finish(self) -> Option<String> {
        self.last
    }
}

/// Script printing the artifact URL of build `build_id`, or nothing.
#[must_use]
pub fn build_status_script(build_id: &str) -> String {
    let id = serde_json::Value::String(build_id.to_owned());
    format!(
        "const xdl = require('@expo/xdl');\n\
         xdl.Project.getBuildStatusAsync('.', {{ platform: 'android', current: false }})\n\
         .then(data => {{\n\
         \x20 if (!data.jobs) return\n\
         \x20 const results = data.jobs.filter(job => job.id === {id})\n\
         \x20 if (!results.length) return\n\
         \x20 console.log(results[0].artifacts.url)\n\
         }})\n"
    )
}

pub(super) fn build<R: CommandRunner>(
    host_root: &Utf8Path,
    tools: &ToolConfig,
    runner: &R,
) -> Result<ArtifactSource, BuildError> {
    announce("react-native:build:expo");
    let mut scanner = BuildIdScanner::default();
    let args = os_args(&[
        "expo",
        "build:android",
        "-t",
        "app-bundle",
        "--non-interactive",
    ]);
    let mut stdout = io::stdout();
    runner
        .run_lines(&tools.npx_bin, &args, host_root, &mut |line| {
            scanner.observe(line);
            writeln!(stdout, "{line}").ok();
        })?
        .into_checked(&tools.npx_bin)?;

    let build_id = scanner.finish().ok_or(BuildError::MissingBuildId)?;
    debug!(build_id = %build_id, "managed build identified");

    let url = await_artifact_url(host_root, tools, runner, &build_id)?;
    Ok(ArtifactSource::Url(url))
}

fn await_artifact_url<R: CommandRunner>(
    host_root: &Utf8Path,
    tools: &ToolConfig,
    runner: &R,
    build_id: &str,
) -> Result<String, BuildError> {
    let query = [OsString::from("-e"), OsString::from(build_status_script(build_id))];
    let attempts = tools.expo_status_attempts.max(1);
    let interval = Duration::from_millis(tools.expo_status_interval_ms);

    for attempt in 1..=attempts {
        let output = run_checked(runner, &tools.node_bin, &query, host_root)?;
        let url = output.stdout.trim();
        if !url.is_empty() {
            debug!(url, attempt, "managed build artifact resolved");
            return Ok(url.to_owned());
        }
        debug!(attempt, attempts, "managed build artifact not published yet");
        if attempt < attempts {
            thread::sleep(interval);
        }
    }
    Err(BuildError::MissingArtifactUrl {
        build_id: build_id.to_owned(),
        attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedRunner;
    use rstest::rstest;

    #[rstest]
    fn scanner_keeps_the_last_match() {
        let mut scanner = BuildIdScanner::default();
        for line in [
            "Building...",
            "https://expo.io/builds/0a1b-2c3d",
            "noise",
            "See https://expo.io/accounts/me/BUILDS/ffee-0011 for details",
            "done",
        ] {
            scanner.observe(line);
        }
        assert_eq!(scanner.finish().as_deref(), Some("ffee-0011"));
    }

    #[rstest]
    fn scanner_without_match_reports_none() {
        let mut scanner = BuildIdScanner::default();
        scanner.observe("no links here");
        assert!(scanner.finish().is_none());
    }

    fn polling_tools(attempts: u32) -> ToolConfig {
        ToolConfig {
            expo_status_attempts: attempts,
            expo_status_interval_ms: 0,
            ..ToolConfig::default()
        }
    }

    fn scripted_build(runner: &ScriptedRunner) {
        runner.push_output(Some(0), "Waiting...\nhttps://expo.io/builds/abc-123\n", "");
    }

    #[rstest]
    fn status_is_queried_until_the_artifact_appears() {
        let runner = ScriptedRunner::new();
        scripted_build(&runner);
        runner.push_output(Some(0), "\n", "");
        runner.push_output(Some(0), "https://expo.io/artifacts/abc-123.aab\n", "");

        let source = build(Utf8Path::new("/host"), &polling_tools(5), &runner)
            .expect("artifact published on the second query");

        assert_eq!(
            source,
            ArtifactSource::Url(String::from("https://expo.io/artifacts/abc-123.aab"))
        );
        let queries = runner
            .invocations()
            .iter()
            .filter(|call| call.program == "node")
            .count();
        assert_eq!(queries, 2);
    }

    #[rstest]
    fn exhausted_status_queries_report_the_build() {
        let runner = ScriptedRunner::new();
        scripted_build(&runner);
        runner.push_output(Some(0), "", "");
        runner.push_output(Some(0), "", "");

        let err = build(Utf8Path::new("/host"), &polling_tools(2), &runner)
            .expect_err("artifact never published");

        assert_eq!(
            err,
            BuildError::MissingArtifactUrl {
                build_id: String::from("abc-123"),
                attempts: 2,
            }
        );
        assert_eq!(runner.invocations().len(), 3);
    }

    #[rstest]
    fn failing_status_query_stops_polling() {
        let runner = ScriptedRunner::new();
        scripted_build(&runner);
        runner.push_failure(1);

        let err = build(Utf8Path::new("/host"), &polling_tools(5), &runner)
            .expect_err("status query fails");

        assert!(matches!(err, BuildError::Process(_)), "{err}");
        assert_eq!(runner.invocations().len(), 2);
    }

    #[rstest]
    fn status_script_quotes_the_build_id() {
        let script = build_status_script("abc-123");
        assert!(script.contains(r#"job.id === "abc-123""#), "{script}");
        assert!(script.contains("@expo/xdl"));
    }
}
