use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use libc::{STDIN_FILENO, STDOUT_FILENO};
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::unistd::{close, dup2, execvp, fork, pipe2, ForkResult};
use tracing::{debug, warn};

use crate::error::{Direction, IoConfigError, SpawnError};
use crate::console;
use crate::job::{Descriptor, JobTable, LineReader, EXEC_FAILED_STATUS};
use crate::parser::split_command;

/// Both ends of a freshly configured endpoint, before the fork decides who keeps what.
#[derive(Debug)]
pub struct Endpoint {
    direction: Direction,
    /// What the child gets as stdin or stdout.
    child: OwnedFd,
    /// Supervisor end of an internal pipe. `None` for named files.
    parent: Option<OwnedFd>,
}

impl Endpoint {
    pub fn is_pipe(&self) -> bool {
        self.parent.is_some()
    }

    /// The descriptor the job will see.
    pub fn child_fd(&self) -> RawFd {
        self.child.as_raw_fd()
    }

    /// Keep the supervisor's side. For a pipe the child's end is closed here.
    fn into_descriptor(self) -> Descriptor {
        match (self.parent, self.direction) {
            (Some(fd), Direction::Input) => Descriptor::Writer(File::from(fd)),
            (Some(fd), Direction::Output) => Descriptor::Reader(LineReader::new(File::from(fd))),
            (None, _) => Descriptor::File(self.child),
        }
    }
}

/// Resolve one direction of a job's I/O to a live descriptor.
///
/// No path means an internal pipe: the child gets the read end of an input
/// pipe and the write end of an output pipe. Named input files are opened
/// read-only; output files are created or truncated with mode 0600.
/// Everything is close-on-exec so no other child inherits it, and the
/// supervisor's end of an output pipe never blocks.
pub fn configure_endpoint(
    direction: Direction,
    path: Option<&Path>,
) -> Result<Endpoint, SpawnError> {
    let Some(path) = path else {
        let (read, write) = pipe2(OFlag::O_CLOEXEC).map_err(SpawnError::Pipe)?;
        let (child, parent) = match direction {
            Direction::Input => (read, write),
            Direction::Output => {
                fcntl(read.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
                    .map_err(SpawnError::Pipe)?;
                (write, read)
            }
        };
        return Ok(Endpoint { direction, child, parent: Some(parent) });
    };

    let opened = match direction {
        Direction::Input => OpenOptions::new().read(true).open(path),
        Direction::Output => OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path),
    };
    let file = opened.map_err(|source| IoConfigError {
        path: path.to_path_buf(),
        direction,
        source,
    })?;
    Ok(Endpoint { direction, child: OwnedFd::from(file), parent: None })
}

/// Launch (or relaunch) the job at `index`.
///
/// Both endpoints are configured first; if either fails the job is retired
/// and nothing is forked. A restart builds fresh pipes and reopens files just
/// like a first launch; only the job number and remaining budget carry over.
pub fn start_job(
    jobs: &mut JobTable,
    index: usize,
    restart: bool,
    verbose: bool,
) -> Result<(), SpawnError> {
    let Some(job) = jobs.get_mut(index) else {
        return Ok(());
    };

    job.release_fds();
    let endpoints = configure_endpoint(Direction::Input, job.input.path.as_deref())
        .and_then(|input| {
            configure_endpoint(Direction::Output, job.output.path.as_deref())
                .map(|output| (input, output))
        });
    let (input, output) = match endpoints {
        Ok(pair) => pair,
        Err(err) => {
            if let SpawnError::IoConfig(ref io) = err {
                console::err(format_args!("Error: {}", io));
            }
            warn!(kind = err.as_label(), %err, command = %job.command, "job is unrunnable");
            job.runnable = false;
            job.restart_pending = false;
            return Err(err);
        }
    };

    // Built before forking; the child must not allocate.
    let argv: Option<Vec<CString>> = split_command(&job.command)
        .into_iter()
        .map(CString::new)
        .collect::<Result<Vec<_>, _>>()
        .ok()
        .filter(|argv| !argv.is_empty());

    let pid = match unsafe { fork() } {
        Ok(ForkResult::Child) => exec_child(&input, &output, argv.as_deref()),
        Ok(ForkResult::Parent { child }) => child,
        Err(errno) => {
            let err = SpawnError::Fork(errno);
            warn!(kind = err.as_label(), %err, command = %job.command, "job is unrunnable");
            job.runnable = false;
            job.restart_pending = false;
            return Err(err);
        }
    };

    job.input.live = Some(input.into_descriptor());
    job.output.live = Some(output.into_descriptor());
    job.pid = Some(pid);
    job.spawn_count += 1;
    job.runnable = true;
    job.killed = false;
    job.restart_pending = false;

    // Numbered on the first successful spawn only.
    let current = job.number;
    let number = if current == 0 { jobs.take_number() } else { current };
    let Some(job) = jobs.get_mut(index) else {
        return Ok(());
    };
    job.number = number;
    debug!(job = job.number, %pid, restart, "spawned");

    if verbose {
        if restart {
            console::out(format_args!("Restarting worker {}", job.number));
        } else {
            console::out(format_args!("Spawning worker {}", job.number));
        }
    }
    Ok(())
}

/// Child side of the fork: wire stdin/stdout, drop the supervisor's pipe
/// ends, and replace the image. Only async-signal-safe calls from here on.
fn exec_child(input: &Endpoint, output: &Endpoint, argv: Option<&[CString]>) -> ! {
    // Handlers installed by the supervisor are reset by exec, but an
    // inherited SIG_IGN would not be.
    let _ = unsafe { signal(Signal::SIGPIPE, SigHandler::SigDfl) };

    let wired = redirect(input.child_fd(), STDIN_FILENO).is_ok()
        && redirect(output.child_fd(), STDOUT_FILENO).is_ok();
    if wired {
        for end in [&input.parent, &output.parent].into_iter().flatten() {
            let _ = close(end.as_raw_fd());
        }
        if let Some(argv) = argv {
            let _ = execvp(argv[0].as_c_str(), argv);
        }
    }
    unsafe { libc::_exit(EXEC_FAILED_STATUS) }
}

/// `dup2` onto `target`, which also clears close-on-exec. When the
/// descriptor already is `target` the flag has to be cleared by hand.
fn redirect(fd: RawFd, target: RawFd) -> nix::Result<()> {
    if fd == target {
        fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty()))?;
    } else {
        dup2(fd, target)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Job, JobSpec, RestartBudget, Termination};
    use pretty_assertions::assert_eq;
    use std::io::Read;
    use std::path::PathBuf;
    use std::thread::sleep;
    use std::time::{Duration, Instant};

    fn table_with(
        command: &str,
        input: Option<PathBuf>,
        output: Option<PathBuf>,
        budget: RestartBudget,
    ) -> JobTable {
        let mut table = JobTable::new();
        table.push(Job::new(JobSpec { budget, input, output, command: command.into() }));
        table
    }

    fn reap_blocking(table: &mut JobTable) -> Termination {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(t) = table.get_mut(0).unwrap().try_reap() {
                return t;
            }
            assert!(Instant::now() < deadline, "child never exited");
            sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn pipe_endpoint_hands_child_the_right_end() {
        let input = configure_endpoint(Direction::Input, None).unwrap();
        assert!(input.is_pipe());
        let output = configure_endpoint(Direction::Output, None).unwrap();
        assert!(output.is_pipe());
        assert!(matches!(input.into_descriptor(), Descriptor::Writer(_)));
        assert!(matches!(output.into_descriptor(), Descriptor::Reader(_)));
    }

    #[test]
    fn only_the_supervisor_read_end_is_nonblocking() {
        let output = configure_endpoint(Direction::Output, None).unwrap();
        let flags = |fd: RawFd| OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL).unwrap());
        assert!(!flags(output.child_fd()).contains(OFlag::O_NONBLOCK));
        let parent = output.parent.as_ref().unwrap().as_raw_fd();
        assert!(flags(parent).contains(OFlag::O_NONBLOCK));
    }

    #[test]
    fn missing_input_file_is_io_config_error() {
        let missing = Path::new("/definitely/not/here");
        let err = configure_endpoint(Direction::Input, Some(missing)).unwrap_err();
        match err {
            SpawnError::IoConfig(io) => assert_eq!(io.direction, Direction::Input),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn output_file_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        std::fs::write(&path, "stale contents").unwrap();

        let endpoint = configure_endpoint(Direction::Output, Some(&path)).unwrap();
        assert!(!endpoint.is_pipe());
        drop(endpoint);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn echo_round_trip_through_pipes() {
        let mut table = table_with("cat", None, None, RestartBudget::Unlimited);
        start_job(&mut table, 0, false, false).unwrap();

        let job = table.get_mut(0).unwrap();
        assert_eq!(job.number, 1);
        assert_eq!(job.spawn_count, 1);
        assert!(job.runnable);
        job.send_line("hello").unwrap();

        let line = job.output_reader().unwrap().wait_line(Duration::from_secs(5));
        assert_eq!(line.as_deref(), Some("hello"));

        // closing stdin lets cat finish
        job.input.release();
        assert_eq!(reap_blocking(&mut table), Termination::Exited(0));
    }

    #[test]
    fn restart_keeps_number_and_counts_spawns() {
        let mut table = table_with("true", None, None, RestartBudget::Limited(3));
        start_job(&mut table, 0, false, false).unwrap();
        assert_eq!(reap_blocking(&mut table), Termination::Exited(0));
        assert!(table.get_mut(0).unwrap().restart_pending);

        start_job(&mut table, 0, true, false).unwrap();
        let job = table.get_mut(0).unwrap();
        assert_eq!(job.number, 1);
        assert_eq!(job.spawn_count, 2);
        assert!(!job.restart_pending);
        reap_blocking(&mut table);
    }

    #[test]
    fn unknown_command_reports_exec_failure() {
        let mut table =
            table_with("no-such-command-jobherd", None, None, RestartBudget::Limited(1));
        start_job(&mut table, 0, false, false).unwrap();
        assert_eq!(reap_blocking(&mut table), Termination::ExecFailed);
        let job = table.get_mut(0).unwrap();
        assert!(!job.runnable);
        assert!(job.input.live.is_none() && job.output.live.is_none());
    }

    #[test]
    fn bad_input_file_retires_job_without_forking() {
        let missing = PathBuf::from("/definitely/not/here");
        let mut table = table_with("cat", Some(missing), None, RestartBudget::Unlimited);
        assert!(start_job(&mut table, 0, false, false).is_err());
        let job = table.get_mut(0).unwrap();
        assert!(!job.runnable);
        assert_eq!(job.pid, None);
        assert_eq!(job.spawn_count, 0);
    }

    #[test]
    fn file_wiring_reaches_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.txt");
        let output = dir.path().join("out.txt");
        std::fs::write(&input, "one\ntwo\n").unwrap();

        let mut table =
            table_with("cat", Some(input), Some(output.clone()), RestartBudget::Limited(1));
        start_job(&mut table, 0, false, false).unwrap();
        assert_eq!(reap_blocking(&mut table), Termination::Exited(0));

        let mut written = String::new();
        File::open(&output).unwrap().read_to_string(&mut written).unwrap();
        assert_eq!(written, "one\ntwo\n");
    }
}
