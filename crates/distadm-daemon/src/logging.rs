//! Logger construction: one `slog::Logger` built at startup and cloned into
//! every subsystem, never a global singleton.
//!
//! Grounded on `util`'s `sloggers::terminal::TerminalLoggerBuilder` setup.

use slog::Logger;
use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

/// Maps `-v` repetitions to a `slog::Level`, matching `util`'s
/// verbosity-count convention.
pub fn build_logger(verbosity: u8) -> Logger {
    let severity = match verbosity {
        0 => Severity::Info,
        1 => Severity::Debug,
        _ => Severity::Trace,
    };

    let mut builder = TerminalLoggerBuilder::new();
    builder.level(severity);
    builder.destination(Destination::Stderr);
    builder.build().expect("terminal logger configuration is always valid")
}
