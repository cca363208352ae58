//! Line-oriented console output.
//!
//! Every user-visible line goes through here. A failed write (a closed
//! terminal, a reader that went away) is logged and dropped; the loop keeps
//! running and the next line is tried again.

use std::fmt;
use std::io::{self, Write};

use tracing::warn;

/// Write one line to stdout.
pub fn out(args: fmt::Arguments<'_>) {
    if let Err(err) = writeln!(io::stdout().lock(), "{}", args) {
        warn!(%err, "stdout write failed");
    }
}

/// Write one line to stderr.
pub fn err(args: fmt::Arguments<'_>) {
    if let Err(err) = writeln!(io::stderr().lock(), "{}", args) {
        warn!(%err, "stderr write failed");
    }
}
