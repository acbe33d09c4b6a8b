#![forbid(unsafe_code)]

//! Subscriber setup for the engine's `tracing` events.
//!
//! Available with the `tracing-json` feature. Both initializers honor
//! `RUST_LOG` and fall back to `warn`, which shows registry misuse,
//! contract violations, and lenient validation failures.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::prelude::*;

const DEFAULT_FILTER: &str = "warn";

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install a JSON-lines subscriber on stderr.
pub fn init_json() -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(filter())
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_span_events(FmtSpan::CLOSE)
                .with_writer(std::io::stderr),
        )
        .try_init()
}

/// Install a human-readable subscriber on stderr.
pub fn init() -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(filter())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_fails_cleanly() {
        let _ = init_json();
        assert!(init().is_err());
    }
}
