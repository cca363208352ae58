//! Asynchronous signal bridge.
//!
//! Handlers only flip an [`AtomicBool`]; the supervisor loop drains the flags
//! at fixed points in its cycle and does every bit of real work (stats
//! printing, logging) there.
//!
//! - `SIGPIPE`: a write to a job's input pipe found no reader.
//! - `SIGHUP`: print per-job statistics.
//! - `SIGINT`: recorded and otherwise ignored, so an interactive ^C does not
//!   take the supervisor down.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use signal_hook::consts::{SIGHUP, SIGINT, SIGPIPE};

/// Events raised since the last [`SignalBridge::drain`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PendingSignals {
    pub dead_pipe: bool,
    pub stats: bool,
    pub interrupt: bool,
}

#[derive(Debug, Default)]
pub struct SignalBridge {
    dead_pipe: Arc<AtomicBool>,
    stats: Arc<AtomicBool>,
    interrupt: Arc<AtomicBool>,
}

impl SignalBridge {
    /// Register the handlers. Safe to call more than once; every bridge
    /// gets its own flags.
    pub fn install() -> io::Result<Self> {
        let bridge = Self::default();
        signal_hook::flag::register(SIGPIPE, Arc::clone(&bridge.dead_pipe))?;
        signal_hook::flag::register(SIGHUP, Arc::clone(&bridge.stats))?;
        signal_hook::flag::register(SIGINT, Arc::clone(&bridge.interrupt))?;
        Ok(bridge)
    }

    /// Take and clear every pending event.
    pub fn drain(&self) -> PendingSignals {
        PendingSignals {
            dead_pipe: self.dead_pipe.swap(false, Ordering::AcqRel),
            stats: self.stats.swap(false, Ordering::AcqRel),
            interrupt: self.interrupt.swap(false, Ordering::AcqRel),
        }
    }
}
