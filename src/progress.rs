//! Phase narration on standard output.

use std::io::{self, Write};

/// Prints a `## <phase>` progress line.
pub fn announce(phase: &str) {
    writeln!(io::stdout().lock(), "## {phase}").ok();
    tracing::debug!(phase, "phase started");
}

/// Prints an instruction the operator must act on.
pub fn instruct(message: &str) {
    writeln!(io::stdout().lock(), "## MANUAL ACTION REQUIRED: {message}").ok();
}
