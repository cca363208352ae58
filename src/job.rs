use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::PathBuf;

use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::debug;

use crate::console;
use crate::parser::split_command;

/// Status a child exits with when its command could not be executed.
pub const EXEC_FAILED_STATUS: i32 = 99;

/// How many times a job may be spawned before it is retired.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestartBudget {
    Unlimited,
    Limited(u32),
}

impl RestartBudget {
    /// `0` means the same as an empty field: no limit.
    pub fn from_count(count: u32) -> Self {
        match count {
            0 => RestartBudget::Unlimited,
            n => RestartBudget::Limited(n),
        }
    }

    /// Charge one exit against the budget. Returns `true` once it is spent.
    fn consume(&mut self) -> bool {
        match self {
            RestartBudget::Unlimited => false,
            RestartBudget::Limited(n) => {
                *n = n.saturating_sub(1);
                *n == 0
            }
        }
    }
}

/// One validated job file entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobSpec {
    pub budget: RestartBudget,
    /// `None` means an internal pipe.
    pub input: Option<PathBuf>,
    /// `None` means an internal pipe.
    pub output: Option<PathBuf>,
    pub command: String,
}

/// The supervisor's end of a configured endpoint.
#[derive(Debug)]
pub enum Descriptor {
    /// Write end of the pipe feeding the job's stdin.
    Writer(File),
    /// Read end of the pipe carrying the job's stdout.
    Reader(LineReader),
    /// A named file opened on the job's behalf.
    File(OwnedFd),
}

/// What one non-blocking read attempt produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LineRead {
    Line(String),
    /// Nothing complete yet; any partial text stays buffered.
    Pending,
    Eof,
}

/// Splits a non-blocking pipe into lines. A partial line is kept across
/// calls until its newline arrives, or until end of file flushes it.
#[derive(Debug)]
pub struct LineReader {
    file: File,
    partial: Vec<u8>,
}

impl LineReader {
    /// `file` must already be in non-blocking mode.
    pub fn new(file: File) -> Self {
        Self { file, partial: Vec::new() }
    }

    pub fn partial(&self) -> &[u8] {
        &self.partial
    }

    /// Hand out a buffered line if there is one, otherwise read once.
    pub fn read_line(&mut self) -> io::Result<LineRead> {
        if let Some(line) = self.take_line() {
            return Ok(LineRead::Line(line));
        }
        let mut chunk = [0u8; 4096];
        loop {
            match self.file.read(&mut chunk) {
                Ok(0) if self.partial.is_empty() => return Ok(LineRead::Eof),
                Ok(0) => {
                    let rest = std::mem::take(&mut self.partial);
                    return Ok(LineRead::Line(String::from_utf8_lossy(&rest).into_owned()));
                }
                Ok(n) => {
                    self.partial.extend_from_slice(&chunk[..n]);
                    return Ok(self.take_line().map_or(LineRead::Pending, LineRead::Line));
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(LineRead::Pending),
                Err(err) => return Err(err),
            }
        }
    }

    fn take_line(&mut self) -> Option<String> {
        let end = self.partial.iter().position(|&b| b == b'\n')?;
        let rest = self.partial.split_off(end + 1);
        let mut line = std::mem::replace(&mut self.partial, rest);
        line.pop();
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Poll-and-read until a line shows up or `timeout` passes.
    #[cfg(test)]
    pub(crate) fn wait_line(&mut self, timeout: std::time::Duration) -> Option<String> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            match self.read_line() {
                Ok(LineRead::Line(line)) => return Some(line),
                Ok(LineRead::Pending) if std::time::Instant::now() < deadline => {
                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
                _ => return None,
            }
        }
    }
}

impl AsFd for LineReader {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

/// One direction of a job's I/O.
#[derive(Debug, Default)]
pub struct IoEndpoint {
    pub path: Option<PathBuf>,
    pub live: Option<Descriptor>,
}

impl IoEndpoint {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path, live: None }
    }

    pub fn uses_pipe(&self) -> bool {
        self.path.is_none()
    }

    pub fn release(&mut self) {
        self.live = None;
    }
}

/// How a reaped job ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Termination {
    Exited(i32),
    Signaled(i32),
    /// The child never got as far as running its command.
    ExecFailed,
}

impl Termination {
    fn from_exit_code(code: i32) -> Self {
        if code == EXEC_FAILED_STATUS {
            Termination::ExecFailed
        } else {
            Termination::Exited(code)
        }
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Exited(code) => write!(f, "has terminated with exit code {}", code),
            Termination::Signaled(sig) => write!(f, "has terminated due to signal {}", sig),
            Termination::ExecFailed => write!(f, "was unable to execute its command"),
        }
    }
}

#[derive(Debug)]
pub struct Job {
    /// Assigned at first successful spawn; 0 until then.
    pub number: u32,
    pub command: String,
    pub pid: Option<Pid>,
    pub budget: RestartBudget,
    pub runnable: bool,
    pub restart_pending: bool,
    /// Set when a write to the job's input hit a dead pipe.
    pub killed: bool,
    pub spawn_count: u32,
    pub inputs_received: u32,
    pub input: IoEndpoint,
    pub output: IoEndpoint,
}

impl Job {
    /// Build an unstarted job. No process or descriptor is created here.
    pub fn new(spec: JobSpec) -> Self {
        Self {
            number: 0,
            command: spec.command,
            pid: None,
            budget: spec.budget,
            runnable: false,
            restart_pending: false,
            killed: false,
            spawn_count: 0,
            inputs_received: 0,
            input: IoEndpoint::new(spec.input),
            output: IoEndpoint::new(spec.output),
        }
    }

    pub fn release_fds(&mut self) {
        self.input.release();
        self.output.release();
    }

    /// Deliver one line to the job's input pipe.
    pub fn send_line(&mut self, line: &str) -> io::Result<()> {
        let Some(Descriptor::Writer(writer)) = self.input.live.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "input is not a pipe"));
        };
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        writer.write_all(&buf)
    }

    pub fn output_reader(&mut self) -> Option<&mut LineReader> {
        match self.output.live.as_mut() {
            Some(Descriptor::Reader(reader)) => Some(reader),
            _ => None,
        }
    }

    /// Non-blocking reap. On exit the descriptors are released and the
    /// budget decides between a pending restart and retirement.
    pub fn try_reap(&mut self) -> Option<Termination> {
        let pid = self.pid?;
        let termination = match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => Termination::from_exit_code(code),
            Ok(WaitStatus::Signaled(_, signal, _)) => Termination::Signaled(signal as i32),
            Ok(_) => return None,
            Err(err) => {
                debug!(job = self.number, %pid, %err, "waitpid failed");
                return None;
            }
        };

        self.release_fds();
        self.pid = None;
        if self.budget.consume() {
            self.runnable = false;
            self.restart_pending = false;
        } else {
            self.restart_pending = true;
        }
        Some(termination)
    }
}

/// All supervised jobs, in job file order. Never reordered or pruned.
#[derive(Debug)]
pub struct JobTable {
    next_number: u32, // first job gets 1; never handed out twice
    jobs: Vec<Job>,
}

impl Default for JobTable {
    fn default() -> Self {
        Self::new()
    }
}

impl JobTable {
    pub fn new() -> Self {
        Self { next_number: 1, jobs: Vec::new() }
    }

    /// Build the table from parsed specs. Verbose mode announces each worker.
    pub fn from_specs(specs: Vec<JobSpec>, verbose: bool) -> Self {
        let mut table = Self::new();
        for spec in specs {
            if verbose {
                console::out(format_args!(
                    "Registering worker {}: {}",
                    table.len() + 1,
                    split_command(&spec.command).join(" ")
                ));
            }
            table.push(Job::new(spec));
        }
        table
    }

    pub fn push(&mut self, job: Job) {
        self.jobs.push(job);
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.jobs.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Job> {
        self.jobs.iter_mut()
    }

    pub fn get(&self, index: usize) -> Option<&Job> {
        self.jobs.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Job> {
        self.jobs.get_mut(index)
    }

    pub(crate) fn take_number(&mut self) -> u32 {
        let number = self.next_number;
        self.next_number += 1;
        number
    }

    /// Reap every runnable job that has exited, printing
    /// `Job N has terminated ...` for each.
    pub fn reap(&mut self) {
        for job in self.jobs.iter_mut().filter(|j| j.runnable) {
            if let Some(termination) = job.try_reap() {
                console::out(format_args!("Job {} {}", job.number, termination));
            }
        }
    }

    pub fn all_unrunnable(&self) -> bool {
        self.jobs.iter().all(|j| !j.runnable)
    }

    pub fn find_runnable(&self, number: u32) -> Option<&Job> {
        self.jobs.iter().find(|j| j.runnable && j.number == number)
    }

    /// Flag the job owning `pid` as having a dead input pipe.
    pub fn mark_killed(&mut self, pid: Pid) {
        for job in self.jobs.iter_mut().filter(|j| j.pid == Some(pid)) {
            job.killed = true;
        }
    }

    /// One `number:spawns:inputs` line per job.
    pub fn write_stats<W: Write>(&self, out: &mut W) -> io::Result<()> {
        for job in &self.jobs {
            writeln!(out, "{}:{}:{}", job.number, job.spawn_count, job.inputs_received)?;
        }
        out.flush()
    }

    /// Drop every descriptor still held by a runnable job.
    pub fn release_all(&mut self) {
        for job in self.jobs.iter_mut().filter(|j| j.runnable) {
            job.release_fds();
        }
    }
}
