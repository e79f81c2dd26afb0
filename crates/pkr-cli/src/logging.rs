//! Tracing subscriber initialisation
//!
//! The library crates only emit events; the binary installs the subscriber.
//!
//! | Flag(s) | Filter level |
//! |---------|--------------|
//! | `-q`    | ERROR        |
//! | (none)  | WARN         |
//! | `-v`    | INFO         |
//! | `-vv`   | DEBUG        |
//! | `-vvv`  | TRACE        |
//!
//! `RUST_LOG` overrides all of the above when set.

use std::io::IsTerminal as _;

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const CRATES: [&str; 4] = ["pkr", "pkr_core", "pkr_engine", "pkr_driver"];

/// Install the stderr subscriber; a second call is a no-op
pub fn init_logging(verbose: u8, quiet: bool) {
    let level = derive_level(verbose, quiet);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives(level)));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(verbose > 1)
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr);

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}

fn derive_level(verbose: u8, quiet: bool) -> &'static str {
    if quiet {
        return "error";
    }
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

fn directives(level: &str) -> String {
    CRATES
        .iter()
        .map(|krate| format!("{krate}={level}"))
        .collect::<Vec<_>>()
        .join(",")
}
