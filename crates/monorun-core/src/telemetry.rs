//! Log output for the `monorun` binary.
//!
//! Everything monorun reports is a tracing event written to stderr: the
//! selected projects, each `$ command` line, and the captured output of every
//! command, tagged with `project` and `stage` fields. Nothing is written to
//! stdout. ANSI colours are only used when stderr is a terminal, so CI logs
//! and `--json` output stay plain.

use std::io::IsTerminal;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Filter used when `RUST_LOG` is unset: `level` for everything.
fn default_filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()))
}

/// Install the global subscriber. Only the first call in a process has an
/// effect.
///
/// `json` selects newline-delimited JSON events (`--json`); `level` is DEBUG
/// with `--verbose` and INFO otherwise.
pub fn init_tracing(json: bool, level: Level) {
    let filter = default_filter(level);
    let layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let installed = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(layer.json().with_current_span(true))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(layer.with_ansi(std::io::stderr().is_terminal()))
            .try_init()
    };

    if installed.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_tracing_twice_does_not_panic() {
        init_tracing(false, Level::INFO);
        init_tracing(true, Level::DEBUG);
        tracing::info!(project = "api", stage = "build", "still alive");
    }

    #[test]
    fn default_filter_uses_requested_level() {
        if std::env::var_os("RUST_LOG").is_none() {
            assert_eq!(default_filter(Level::DEBUG).to_string(), "debug");
        }
    }
}
