//! # jobherd
//!
//! A small single-host worker supervisor. It launches a fixed set of
//! commands as child processes, wires each one's stdin/stdout to a file or
//! to an internal pipe, relays input lines to every piped worker, prints
//! one tagged line of each worker's output per cycle, and restarts workers
//! that exit until their restart budget runs out.
//!
//! ## Job file
//! One job per line, `restarts:input:output:command`:
//! ```text
//! # unlimited restarts, pipes both ways
//! :::cat
//! # at most 3 spawns, reads a file, writes through a pipe
//! 3:words.txt::sort
//! ```
//!
//! ## Input stream
//! Lines starting with `*` are commands (`*sleep <ms>`,
//! `*signal <job> <signal>`); every other line is broadcast.
//!
//! ## Signals
//! `SIGHUP` prints `job:spawns:inputs` per job on stderr, `SIGINT` is
//! ignored, and `SIGPIPE` is absorbed and attributed to the job whose
//! input write failed.

pub mod builtins;
pub mod config;
pub mod console;
pub mod error;
pub mod executor;
pub mod job;
pub mod parser;
pub mod signals;
pub mod supervisor;

pub use config::Config;
pub use error::{CommandError, Direction, IoConfigError, SpawnError, SpecError};
pub use job::{Job, JobSpec, JobTable, RestartBudget, Termination, EXEC_FAILED_STATUS};
pub use signals::SignalBridge;
pub use supervisor::{InputStream, Supervisor};
