//! Code that runs in the forked child, plus the parent's view of exec status.
//!
//! Between fork and exec the child may only make async-signal-safe calls: no
//! allocation, no locks, no logging. Every path ends in exec or `_exit`.

use std::fs::File;
use std::io::{ErrorKind, Read};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use super::marshal::ExecPlan;
use super::pipes::{last_errno, ChildFds};

/// Exit status of a child whose exec failed (shell "command not found").
pub const EXEC_FAILURE_CODE: i32 = 127;

const DIAGNOSTIC_PREFIX: &[u8] = b"procpipe: failed to exec ";

/// Redirect the standard streams and replace the process image.
///
/// # Safety
///
/// Must only be called in the child right after fork. `fds`, `plan` and
/// `report` must have been prepared by the parent before forking.
pub(crate) unsafe fn exec_child(fds: &ChildFds, plan: &ExecPlan, report: Option<RawFd>) -> ! {
    if let Err(errno) = fds.redirect() {
        fail(plan, report, errno);
    }

    // Rust runtimes ignore SIGPIPE and ignored dispositions survive exec.
    libc::signal(libc::SIGPIPE, libc::SIG_DFL);

    match plan.envp() {
        Some(envp) => {
            libc::execve(plan.path().as_ptr(), plan.argv().as_ptr(), envp.as_ptr());
        }
        None => {
            libc::execvp(plan.program().as_ptr(), plan.argv().as_ptr());
        }
    }

    fail(plan, report, last_errno())
}

unsafe fn fail(plan: &ExecPlan, report: Option<RawFd>, errno: i32) -> ! {
    let program = plan.program().to_bytes();
    write_all(libc::STDERR_FILENO, DIAGNOSTIC_PREFIX);
    write_all(libc::STDERR_FILENO, program);
    write_all(libc::STDERR_FILENO, b"\n");

    if let Some(fd) = report {
        write_all(fd, &errno.to_ne_bytes());
    }
    libc::_exit(EXEC_FAILURE_CODE)
}

unsafe fn write_all(fd: RawFd, mut bytes: &[u8]) {
    while !bytes.is_empty() {
        let n = libc::write(fd, bytes.as_ptr().cast::<libc::c_void>(), bytes.len());
        if n > 0 {
            bytes = &bytes[n as usize..];
        } else if n < 0 && last_errno() == libc::EINTR {
            continue;
        } else {
            return;
        }
    }
}

/// Close-on-exec pipe the child uses to report a failed exec.
///
/// A successful exec closes the write end, so the parent reads EOF. A failed
/// exec writes the errno first.
#[derive(Debug)]
pub(crate) struct ExecStatusPipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl ExecStatusPipe {
    pub(crate) fn new() -> nix::Result<Self> {
        let (read, write) = super::pipes::cloexec_pipe()?;
        Ok(Self { read, write })
    }

    pub(crate) fn write_fd(&self) -> RawFd {
        self.write.as_raw_fd()
    }

    /// Parent side: drop the write end and wait for exec to happen or fail.
    ///
    /// Returns the child's errno when exec failed.
    pub(crate) fn read_exec_error(self) -> Option<i32> {
        drop(self.write);
        let mut reader = File::from(self.read);
        let mut buf = [0u8; 4];
        let mut filled = 0;

        while filled < buf.len() {
            match reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }

        (filled == buf.len()).then(|| i32::from_ne_bytes(buf))
    }
}
