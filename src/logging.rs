//! Tracing setup for the CLI and the background workers.
//!
//! Everything goes to stderr so stdout stays clean for `--json` results.
//! `RUST_LOG` replaces the verbosity-derived filter entirely, e.g.
//! `RUST_LOG=slideshow::dedup=trace,slideshow=info`.

use std::io::{self, IsTerminal};

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How log events are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line.
    Json,
    /// Colored, with thread names, for an interactive terminal.
    Pretty,
    /// Plain single lines for pipes and service managers.
    Compact,
}

impl LogFormat {
    pub const fn select(json: bool, terminal: bool) -> Self {
        if json {
            Self::Json
        } else if terminal {
            Self::Pretty
        } else {
            Self::Compact
        }
    }
}

/// Filter used when `RUST_LOG` is unset.
pub fn default_directive(verbose: u8, quiet: bool) -> &'static str {
    match (quiet, verbose) {
        (true, _) => "slideshow=error",
        (false, 0) => "slideshow=info",
        (false, 1) => "slideshow=debug",
        (false, _) => "slideshow=trace",
    }
}

/// Install the global subscriber.
///
/// `verbose` counts `-v` flags (info, debug, trace); `quiet` keeps errors only.
/// A subscriber installed earlier in the process stays in place.
pub fn init_logging(json: bool, verbose: u8, quiet: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose, quiet)));
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match LogFormat::select(json, io::stderr().is_terminal()) {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(false)
                    .with_span_list(false)
                    .with_writer(io::stderr),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().with_thread_names(true).with_writer(io::stderr))
            .try_init(),
        LogFormat::Compact => registry
            .with(fmt::layer().compact().with_ansi(false).with_writer(io::stderr))
            .try_init(),
    };
    if installed.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}
