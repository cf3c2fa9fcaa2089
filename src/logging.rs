//! Tracing subscriber setup for the binary

use std::io::{self, IsTerminal};

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::error::{Error, Result};

/// Default filter for a `-v` count; `RUST_LOG` takes precedence when set
pub fn default_filter(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "pixelmix=info,warn",
        1 => "pixelmix=debug,info",
        2 => "pixelmix=trace,debug",
        _ => "trace",
    }
}

/// Install a global subscriber: JSON lines or plain text
pub fn init_logging(verbosity: u8, json_output: bool) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbosity)));

    let installed = if json_output {
        let json_layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_filter(env_filter);

        tracing_subscriber::registry().with(json_layer).try_init()
    } else {
        let fmt_layer = fmt::layer()
            .with_target(false)
            .with_ansi(io::stdout().is_terminal())
            .with_filter(env_filter);

        tracing_subscriber::registry().with(fmt_layer).try_init()
    };

    installed.map_err(|e| Error::invalid_state(format!("failed to install logger: {}", e)))
}
