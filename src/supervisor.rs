//! The polling loop that ties everything together.
//!
//! One cycle:
//! 1. reap every runnable job that has exited
//! 2. restart jobs with a pending restart
//! 3. stop if no child is left and no job is runnable
//! 4. read one input line: end of stream stops, a `*` line is a command
//!    (the cycle ends there), anything else is broadcast to piped jobs
//! 5. collect at most one output line per eligible job within the pace window
//!
//! Signal events are drained at the top of a cycle, while waiting for input,
//! and after output collection.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::ops::ControlFlow;
use std::os::fd::{AsFd, BorrowedFd};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::wait::{waitid, Id, WaitPidFlag};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::builtins::{is_command, run_command, CommandOutcome};
use crate::config::Config;
use crate::console;
use crate::executor::start_job;
use crate::job::{JobTable, LineRead};
use crate::signals::SignalBridge;

/// Why the supervisor stopped. Both are clean exits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Shutdown {
    InputClosed,
    NoViableWorkers,
}

/// The external, newline-delimited input stream.
#[derive(Debug)]
pub struct InputStream {
    reader: BufReader<File>,
}

impl InputStream {
    pub fn new(file: File) -> Self {
        Self { reader: BufReader::new(file) }
    }

    /// A private duplicate of the process's stdin.
    pub fn stdin() -> io::Result<Self> {
        let fd = io::stdin().as_fd().try_clone_to_owned()?;
        Ok(Self::new(File::from(fd)))
    }

    /// Next line without its newline, or `None` at end of stream.
    ///
    /// While nothing is buffered the descriptor is polled every `tick`, and
    /// `idle` runs each time the tick passes with no data.
    pub fn next_line(
        &mut self,
        tick: Duration,
        mut idle: impl FnMut(),
    ) -> io::Result<Option<String>> {
        if self.reader.buffer().is_empty() {
            while !wait_readable(self.reader.get_ref().as_fd(), Instant::now() + tick)? {
                idle();
            }
        }
        read_text_line(&mut self.reader)
    }
}

pub struct Supervisor {
    jobs: JobTable,
    input: InputStream,
    bridge: SignalBridge,
    config: Config,
}

impl Supervisor {
    pub fn new(jobs: JobTable, input: InputStream, bridge: SignalBridge, config: Config) -> Self {
        Self { jobs, input, bridge, config }
    }

    /// Spawn every job, wait out the startup grace period, then cycle until
    /// input ends or no viable worker remains.
    pub fn run(mut self) {
        self.start_all();
        thread::sleep(self.config.pace);

        let reason = loop {
            if let ControlFlow::Break(reason) = self.cycle() {
                break reason;
            }
        };
        info!(?reason, "supervisor stopping");
        self.jobs.release_all();
    }

    pub fn start_all(&mut self) {
        for index in 0..self.jobs.len() {
            // failures already reported; the job is left unrunnable
            let _ = start_job(&mut self.jobs, index, false, self.config.verbose);
        }
    }

    fn cycle(&mut self) -> ControlFlow<Shutdown> {
        service_signals(&self.bridge, &self.jobs);

        self.jobs.reap();
        self.restart_pending();

        if no_children_left() && self.jobs.all_unrunnable() {
            console::err(format_args!("No more viable workers, exiting"));
            return ControlFlow::Break(Shutdown::NoViableWorkers);
        }

        let Some(line) = self.read_input() else {
            return ControlFlow::Break(Shutdown::InputClosed);
        };

        if is_command(&line) {
            match run_command(&line, &self.jobs) {
                Ok(CommandOutcome::Slept(pause)) => debug!(?pause, "slept"),
                Ok(CommandOutcome::Signalled { job, signal }) => debug!(job, signal, "signalled"),
                Err(err) => {
                    debug!(kind = err.as_label(), "command rejected");
                    console::out(format_args!("Error: {}", err));
                }
            }
            return ControlFlow::Continue(());
        }

        self.broadcast(&line);
        self.collect_output();
        service_signals(&self.bridge, &self.jobs);
        ControlFlow::Continue(())
    }

    fn restart_pending(&mut self) {
        for index in 0..self.jobs.len() {
            let due = self
                .jobs
                .get(index)
                .is_some_and(|job| job.runnable && job.restart_pending);
            if due {
                let _ = start_job(&mut self.jobs, index, true, self.config.verbose);
            }
        }
    }

    fn read_input(&mut self) -> Option<String> {
        let bridge = &self.bridge;
        let jobs = &self.jobs;
        match self.input.next_line(self.config.input_poll, || service_signals(bridge, jobs)) {
            Ok(line) => line,
            Err(err) => {
                warn!(%err, "input stream failed; treating as end of input");
                None
            }
        }
    }

    /// Send `line` to every runnable job fed by an internal pipe.
    pub(crate) fn broadcast(&mut self, line: &str) {
        let mut dead: Vec<Pid> = Vec::new();
        for job in self.jobs.iter_mut().filter(|j| j.runnable && j.input.uses_pipe()) {
            job.inputs_received += 1;
            if let Err(err) = job.send_line(line) {
                match (err.kind(), job.pid) {
                    (io::ErrorKind::BrokenPipe, Some(pid)) => dead.push(pid),
                    _ => warn!(job = job.number, %err, "input not delivered"),
                }
            }
            console::out(format_args!("{}<-'{}'", job.number, line));
        }
        for pid in dead {
            debug!(%pid, "dead pipe");
            self.jobs.mark_killed(pid);
        }
    }

    /// Print at most one line per runnable, piped, not-killed job, in table
    /// order. All jobs share one `pace` window; whatever is left of it is
    /// slept off so the cycle length stays constant. A job with only part of
    /// a line ready keeps it buffered for a later cycle.
    pub(crate) fn collect_output(&mut self) {
        let deadline = Instant::now() + self.config.pace;
        let verbose = self.config.verbose;

        for job in self
            .jobs
            .iter_mut()
            .filter(|j| j.runnable && j.output.uses_pipe() && !j.killed)
        {
            let number = job.number;
            let Some(reader) = job.output_reader() else {
                continue;
            };
            loop {
                match reader.read_line() {
                    Ok(LineRead::Line(line)) => {
                        console::out(format_args!("{}->'{}'", number, line));
                    }
                    Ok(LineRead::Eof) => {
                        if verbose {
                            console::err(format_args!("Received EOF from job {}", number));
                        }
                    }
                    Ok(LineRead::Pending) => match wait_readable(reader.as_fd(), deadline) {
                        Ok(true) if Instant::now() < deadline => continue,
                        Ok(_) => debug!(job = number, "no output this cycle"),
                        Err(err) => warn!(job = number, %err, "poll failed"),
                    },
                    Err(err) => warn!(job = number, %err, "output read failed"),
                }
                break;
            }
        }

        let now = Instant::now();
        if deadline > now {
            thread::sleep(deadline - now);
        }
    }
}

fn service_signals(bridge: &SignalBridge, jobs: &JobTable) {
    let pending = bridge.drain();
    if pending.stats {
        if let Err(err) = jobs.write_stats(&mut io::stderr().lock()) {
            warn!(%err, "could not write stats");
        }
    }
    if pending.dead_pipe {
        debug!("dead pipe signal");
    }
    if pending.interrupt {
        debug!("interrupt ignored");
    }
}

/// True when the process has no children at all, exited or not.
/// `WNOWAIT` leaves any exit status for the per-job reap to collect.
fn no_children_left() -> bool {
    let flags = WaitPidFlag::WEXITED | WaitPidFlag::WNOHANG | WaitPidFlag::WNOWAIT;
    matches!(waitid(Id::All, flags), Err(Errno::ECHILD))
}

/// Wait until `fd` is readable (or hung up) or `deadline` passes.
fn wait_readable(fd: BorrowedFd<'_>, deadline: Instant) -> io::Result<bool> {
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let millis = u16::try_from(remaining.as_millis()).unwrap_or(u16::MAX);
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(millis)) {
            Ok(0) => return Ok(false),
            Ok(_) => return Ok(true),
            Err(Errno::EINTR) if Instant::now() < deadline => continue,
            Err(Errno::EINTR) => return Ok(false),
            Err(errno) => return Err(errno.into()),
        }
    }
}

fn read_text_line<R: BufRead>(reader: &mut R) -> io::Result<Option<String>> {
    let mut buf = Vec::new();
    if reader.read_until(b'\n', &mut buf)? == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}
