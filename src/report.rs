//! Final reporting and exit codes.

use std::io::Write;

use crate::run::{RunError, RunOutcome};

/// Exit code for any failure of the tool itself, distinct from the codes a
/// test payload can report for pass and fail.
pub const FATAL_EXIT_CODE: i32 = 2;

/// Prints the collected test output and returns the payload's exit code.
pub fn write_outcome(writer: &mut dyn Write, outcome: &RunOutcome) -> i32 {
    if outcome.output.ends_with('\n') || outcome.output.is_empty() {
        write!(writer, "{}", outcome.output).ok();
    } else {
        writeln!(writer, "{}", outcome.output).ok();
    }
    writer.flush().ok();
    outcome.exit_code
}

/// Prints the failure with its diagnostics and returns [`FATAL_EXIT_CODE`].
pub fn write_failure(writer: &mut dyn Write, error: &RunError) -> i32 {
    writeln!(writer, "rn-tape failed ({:?}): {}", error.kind(), error.report_text()).ok();
    writer.flush().ok();
    FATAL_EXIT_CODE
}
