//! Error types for procpipe.

use std::time::Duration;

use nix::errno::Errno;
use thiserror::Error;

use crate::execution::PipeLevel;

/// Main error type for procpipe operations.
///
/// These are caller-side errors. Failures of the execution machinery itself
/// (fork, exec, reap) never surface here; they are recorded in the
/// [`ExecutionResult`](crate::ExecutionResult) as an [`EngineFailure`].
#[derive(Error, Debug)]
pub enum ProcpipeError {
    /// Program, argument or environment entry cannot be passed to exec.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The command already has a running child.
    #[error("command already running as pid {0}")]
    AlreadyRunning(i32),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Blocking execution task failed to complete.
    #[error("execution task failed: {0}")]
    Join(String),
}

/// Convenience Result type for procpipe operations.
pub type Result<T> = std::result::Result<T, ProcpipeError>;

/// Failure of the execution engine, as opposed to the child's own exit code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineFailure {
    /// Fewer than three pipes could be created.
    #[error("pipe allocation stopped at {created:?}: {errno}")]
    PipeAllocation { created: PipeLevel, errno: Errno },

    /// No child process was created.
    #[error("fork failed: {0}")]
    Fork(Errno),

    /// The child could not replace its image with the program.
    #[error("failed to exec {program}: {}", describe_errno(.code))]
    Exec { program: String, code: i32 },

    /// Reaping the child failed.
    #[error("wait failed: {0}")]
    Wait(Errno),

    /// Reaping returned a different process than the one started.
    #[error("wait returned pid {actual}, expected {expected}")]
    PidMismatch { expected: i32, actual: i32 },

    /// There is no started child to wait for.
    #[error("no running child to wait for")]
    NoChild,

    /// The deadline expired and the child was killed.
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
}

fn describe_errno(code: &i32) -> std::io::Error {
    std::io::Error::from_raw_os_error(*code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_argument_display() {
        let err = ProcpipeError::InvalidArgument("nul byte in argument 2".into());
        assert!(err.to_string().contains("invalid argument"));
        assert!(err.to_string().contains("argument 2"));
    }

    #[test]
    fn test_already_running_display() {
        let err = ProcpipeError::AlreadyRunning(4242);
        assert!(err.to_string().contains("4242"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: ProcpipeError = io_err.into();
        assert!(matches!(err, ProcpipeError::Io(_)));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_exec_failure_display() {
        let failure = EngineFailure::Exec {
            program: "no_such_binary_xyz".into(),
            code: libc::ENOENT,
        };
        let text = failure.to_string();
        assert!(text.contains("no_such_binary_xyz"));
        assert!(text.contains("No such file"));
    }

    #[test]
    fn test_pipe_allocation_display() {
        let failure = EngineFailure::PipeAllocation {
            created: PipeLevel::InputCreated,
            errno: Errno::EMFILE,
        };
        assert!(failure.to_string().contains("InputCreated"));
    }

    #[test]
    fn test_timeout_display() {
        let failure = EngineFailure::TimedOut(Duration::from_millis(250));
        assert!(failure.to_string().contains("timed out"));
    }
}
