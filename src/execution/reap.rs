//! Reaping the child, optionally against a deadline.

use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::error::EngineFailure;

/// Polling interval while waiting against a deadline.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How the child terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Termination {
    /// Normal exit with a status code.
    Exited(i32),
    /// Killed by a signal.
    Signaled(i32),
}

impl Termination {
    /// Shell-style status: the exit code, or `128 + signal`.
    pub(crate) fn status(self) -> i32 {
        match self {
            Termination::Exited(code) => code,
            Termination::Signaled(signal) => 128 + signal,
        }
    }

    pub(crate) fn signal(self) -> Option<i32> {
        match self {
            Termination::Signaled(signal) => Some(signal),
            Termination::Exited(_) => None,
        }
    }
}

/// Block until `pid` terminates.
pub(crate) fn reap(pid: Pid) -> Result<Termination, EngineFailure> {
    loop {
        match waitpid(pid, None) {
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(EngineFailure::Wait(errno)),
            Ok(status) => {
                if let Some(termination) = classify(pid, status)? {
                    return Ok(termination);
                }
            }
        }
    }
}

/// Wait for `pid` until `deadline`, then kill it.
///
/// On expiry the child is sent SIGKILL and reaped, and the outcome is a
/// [`EngineFailure::TimedOut`] carrying `limit`.
pub(crate) fn reap_until(
    pid: Pid,
    deadline: Instant,
    limit: Duration,
) -> Result<Termination, EngineFailure> {
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(EngineFailure::Wait(errno)),
            Ok(WaitStatus::StillAlive) => {}
            Ok(status) => {
                if let Some(termination) = classify(pid, status)? {
                    return Ok(termination);
                }
            }
        }

        let now = Instant::now();
        if now >= deadline {
            warn!(pid = pid.as_raw(), "deadline expired, killing child");
            if let Err(errno) = kill(pid, Signal::SIGKILL) {
                debug!(pid = pid.as_raw(), %errno, "kill failed");
            }
            reap(pid)?;
            return Err(EngineFailure::TimedOut(limit));
        }
        std::thread::sleep(POLL_INTERVAL.min(deadline - now));
    }
}

/// Kill a child that is being abandoned and reap it.
pub(crate) fn kill_and_reap(pid: Pid) {
    let _ = kill(pid, Signal::SIGKILL);
    if let Err(failure) = reap(pid) {
        debug!(pid = pid.as_raw(), "reap after kill failed: {}", failure);
    }
}

fn classify(expected: Pid, status: WaitStatus) -> Result<Option<Termination>, EngineFailure> {
    let actual = match status.pid() {
        Some(pid) => pid,
        None => return Ok(None),
    };
    if actual != expected {
        return Err(EngineFailure::PidMismatch {
            expected: expected.as_raw(),
            actual: actual.as_raw(),
        });
    }

    match status {
        WaitStatus::Exited(_, code) => Ok(Some(Termination::Exited(code))),
        WaitStatus::Signaled(_, signal, _) => Ok(Some(Termination::Signaled(signal as i32))),
        // Stopped or continued children have not terminated yet.
        _ => Ok(None),
    }
}
