//! Error types for job configuration, spawning and the embedded command protocol.
//!
//! None of these ever stop the supervisor: a bad job line drops that job,
//! a failed spawn makes that one job unrunnable, and a bad command line is
//! reported and ignored.

use std::path::PathBuf;

use thiserror::Error;

/// Which side of a job an endpoint feeds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    /// Word used in user-facing open failures.
    pub fn as_verb(&self) -> &'static str {
        match self {
            Direction::Input => "reading",
            Direction::Output => "writing",
        }
    }
}

/// A job file line that cannot become a job.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SpecError {
    #[error("expected 4 colon-separated fields, found {found}")]
    FieldCount { found: usize },

    #[error("restart count '{0}' is not a non-negative integer")]
    RestartCount(String),

    #[error("command must be non-empty and must not begin with a space")]
    Command,
}

impl SpecError {
    pub fn as_label(&self) -> &'static str {
        match self {
            SpecError::FieldCount { .. } => "spec_field_count",
            SpecError::RestartCount(_) => "spec_restart_count",
            SpecError::Command => "spec_command",
        }
    }
}

/// Failure to open the file named by an endpoint.
#[derive(Error, Debug)]
#[error("unable to open \"{}\" for {}", .path.display(), .direction.as_verb())]
pub struct IoConfigError {
    pub path: PathBuf,
    pub direction: Direction,
    #[source]
    pub source: std::io::Error,
}

/// Why a job could not be (re)started.
#[derive(Error, Debug)]
pub enum SpawnError {
    #[error(transparent)]
    IoConfig(#[from] IoConfigError),

    #[error("failed to allocate pipe: {0}")]
    Pipe(#[source] nix::Error),

    #[error("fork failed: {0}")]
    Fork(#[source] nix::Error),
}

impl SpawnError {
    pub fn as_label(&self) -> &'static str {
        match self {
            SpawnError::IoConfig(_) => "spawn_io_config",
            SpawnError::Pipe(_) => "spawn_pipe",
            SpawnError::Fork(_) => "spawn_fork",
        }
    }
}

/// Rejections from the `*signal` / `*sleep` command protocol.
///
/// `Display` yields the exact text shown to the user after `Error: `.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CommandError {
    #[error("Incorrect number of arguments")]
    ArgumentCount,

    /// A numeric argument was malformed; carries the argument's name.
    #[error("Invalid {0}")]
    InvalidValue(&'static str),

    #[error("Invalid job")]
    InvalidJob,

    #[error("Invalid signal")]
    InvalidSignal,

    #[error("Bad command '{0}'")]
    Unknown(String),
}

impl CommandError {
    pub fn as_label(&self) -> &'static str {
        match self {
            CommandError::ArgumentCount => "command_argument_count",
            CommandError::InvalidValue(_) => "command_invalid_value",
            CommandError::InvalidJob => "command_invalid_job",
            CommandError::InvalidSignal => "command_invalid_signal",
            CommandError::Unknown(_) => "command_unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn io_config_error_names_path_and_direction() {
        let err = IoConfigError {
            path: PathBuf::from("/nope/in.txt"),
            direction: Direction::Input,
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert_eq!(err.to_string(), "unable to open \"/nope/in.txt\" for reading");
    }

    #[test]
    fn command_errors_render_user_text() {
        assert_eq!(CommandError::InvalidValue("duration").to_string(), "Invalid duration");
        assert_eq!(
            CommandError::Unknown("*foo 1".into()).to_string(),
            "Bad command '*foo 1'"
        );
        assert_eq!(CommandError::InvalidSignal.as_label(), "command_invalid_signal");
    }
}
