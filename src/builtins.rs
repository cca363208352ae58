//! The `*`-prefixed control commands accepted on the input stream.
//!
//! - `*sleep <ms>` pauses the supervisor.
//! - `*signal <job> <signal>` sends a signal (1..=31) to a runnable job.

use std::thread;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use tracing::{debug, warn};

use crate::error::CommandError;
use crate::job::JobTable;
use crate::parser::{parse_non_negative, split_command};

const MIN_SIGNAL: u64 = 1;
const MAX_SIGNAL: u64 = 31;

/// What a successful command did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandOutcome {
    Slept(Duration),
    Signalled { job: u32, signal: i32 },
}

pub fn is_command(line: &str) -> bool {
    line.starts_with('*')
}

/// Validate and execute one command line.
pub fn run_command(line: &str, jobs: &JobTable) -> Result<CommandOutcome, CommandError> {
    let tokens = split_command(line);
    let Some((name, args)) = tokens.split_first() else {
        return Err(CommandError::Unknown(line.to_string()));
    };
    match name.as_str() {
        "*sleep" => {
            let pause = parse_sleep(args)?;
            thread::sleep(pause);
            Ok(CommandOutcome::Slept(pause))
        }
        "*signal" => builtin_signal(args, jobs),
        _ => Err(CommandError::Unknown(line.to_string())),
    }
}

fn numeric_arg(token: &str, name: &'static str) -> Result<u64, CommandError> {
    parse_non_negative(token).ok_or(CommandError::InvalidValue(name))
}

fn parse_sleep(args: &[String]) -> Result<Duration, CommandError> {
    let [millis] = args else {
        return Err(CommandError::ArgumentCount);
    };
    Ok(Duration::from_millis(numeric_arg(millis, "duration")?))
}

fn builtin_signal(args: &[String], jobs: &JobTable) -> Result<CommandOutcome, CommandError> {
    let [job, signal] = args else {
        return Err(CommandError::ArgumentCount);
    };
    let number = numeric_arg(job, "job")?;
    let signal = numeric_arg(signal, "signal")?;

    let target = u32::try_from(number)
        .ok()
        .and_then(|n| jobs.find_runnable(n))
        .ok_or(CommandError::InvalidJob)?;
    let pid = target.pid.ok_or(CommandError::InvalidJob)?;

    if !(MIN_SIGNAL..=MAX_SIGNAL).contains(&signal) {
        return Err(CommandError::InvalidSignal);
    }
    let signo = signal as i32;
    let sig = Signal::try_from(signo).map_err(|_| CommandError::InvalidSignal)?;

    match kill(pid, sig) {
        Ok(()) => debug!(job = target.number, %pid, signal = signo, "signal delivered"),
        Err(err) => warn!(job = target.number, %pid, signal = signo, %err, "signal not delivered"),
    }
    Ok(CommandOutcome::Signalled { job: target.number, signal: signo })
}
