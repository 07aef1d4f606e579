//! Diagnostic logging setup.
//!
//! Progress narration goes to standard output; diagnostics go to standard
//! error through `tracing`. `RUST_LOG` overrides the default filter.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Default filter directives.
#[must_use]
pub const fn default_directives(verbose: bool) -> &'static str {
    if verbose {
        "rntape=debug,info"
    } else {
        "rntape=info,warn"
    }
}

/// Installs the global subscriber. Calling it again is a no-op.
pub fn init(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(verbose)));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(verbose)
                .with_file(false)
                .with_line_number(false)
                .compact(),
        )
        .try_init()
        .ok();
}
