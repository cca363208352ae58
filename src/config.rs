//! Runtime settings for the supervisor loop.

use std::time::Duration;

/// Supervisor configuration, built from the command line.
#[derive(Clone, Debug)]
pub struct Config {
    /// Echo registration, spawn/restart and EOF notices.
    pub verbose: bool,
    /// Startup grace period and per-cycle output collection window.
    pub pace: Duration,
    /// How often the loop wakes while waiting for input, to service signals.
    pub input_poll: Duration,
}

impl Default for Config {
    /// - `verbose = false`
    /// - `pace = 1s`
    /// - `input_poll = 250ms`
    fn default() -> Self {
        Self {
            verbose: false,
            pace: Duration::from_secs(1),
            input_poll: Duration::from_millis(250),
        }
    }
}
