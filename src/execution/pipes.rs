//! Pipe bookkeeping for a single invocation.
//!
//! A [`PipeSet`] owns the stdin, stdout and stderr pipes of one child. Each
//! pipe is a small state machine over owned descriptors, so an end can only
//! be closed once and never used after it was closed or handed away.

use std::fs::File;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use tracing::{debug, warn};

/// Which standard stream a pipe is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Child's standard input.
    Stdin,
    /// Child's standard output.
    Stdout,
    /// Child's standard error.
    Stderr,
}

impl StreamKind {
    /// Descriptor number the stream occupies in the child.
    pub fn target_fd(self) -> RawFd {
        match self {
            StreamKind::Stdin => libc::STDIN_FILENO,
            StreamKind::Stdout => libc::STDOUT_FILENO,
            StreamKind::Stderr => libc::STDERR_FILENO,
        }
    }
}

/// How many of the three pipes were allocated, in allocation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum PipeLevel {
    /// No pipe exists.
    #[default]
    None,
    /// Only the stdin pipe exists.
    InputCreated,
    /// Stdin and stdout pipes exist.
    OutputCreated,
    /// All three pipes exist.
    ErrorCreated,
}

impl PipeLevel {
    /// Number of pipes created.
    pub fn count(self) -> usize {
        self as usize
    }

    /// Whether all three streams are wired.
    pub fn is_complete(self) -> bool {
        self == PipeLevel::ErrorCreated
    }

    fn from_count(count: usize) -> Self {
        match count {
            0 => PipeLevel::None,
            1 => PipeLevel::InputCreated,
            2 => PipeLevel::OutputCreated,
            _ => PipeLevel::ErrorCreated,
        }
    }
}

/// Source of OS pipes.
///
/// The default [`SystemPipes`] creates close-on-exec pipes. Other
/// implementations exist mainly to inject allocation failures.
pub trait PipeAllocator: Send {
    /// Create one pipe, returning `(read_end, write_end)`.
    fn allocate(&mut self, stream: StreamKind) -> nix::Result<(OwnedFd, OwnedFd)>;
}

/// Allocates real close-on-exec pipes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPipes;

impl PipeAllocator for SystemPipes {
    fn allocate(&mut self, _stream: StreamKind) -> nix::Result<(OwnedFd, OwnedFd)> {
        cloexec_pipe()
    }
}

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly",
    target_os = "illumos"
))]
pub(crate) fn cloexec_pipe() -> nix::Result<(OwnedFd, OwnedFd)> {
    nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly",
    target_os = "illumos"
)))]
pub(crate) fn cloexec_pipe() -> nix::Result<(OwnedFd, OwnedFd)> {
    use nix::fcntl::{fcntl, FcntlArg, FdFlag};

    let (read, write) = nix::unistd::pipe()?;
    fcntl(read.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    fcntl(write.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    Ok((read, write))
}

/// Lifecycle of one pipe as seen by the parent.
#[derive(Debug, Default)]
pub enum PipeState {
    /// Allocation never happened or failed.
    #[default]
    NotCreated,
    /// Both ends are open.
    Created { read: OwnedFd, write: OwnedFd },
    /// Read end closed, write end still held.
    ClosedRead { write: OwnedFd },
    /// Write end closed, read end still held.
    ClosedWrite { read: OwnedFd },
    /// Nothing left to close.
    ClosedBoth,
}

impl PipeState {
    /// Whether the pipe was ever created.
    pub fn exists(&self) -> bool {
        !matches!(self, PipeState::NotCreated)
    }

    /// Close the read end if it is still held.
    pub fn close_read(&mut self) {
        *self = match std::mem::take(self) {
            PipeState::Created { write, .. } => PipeState::ClosedRead { write },
            PipeState::ClosedWrite { .. } => PipeState::ClosedBoth,
            other => other,
        };
    }

    /// Close the write end if it is still held.
    pub fn close_write(&mut self) {
        *self = match std::mem::take(self) {
            PipeState::Created { read, .. } => PipeState::ClosedWrite { read },
            PipeState::ClosedRead { .. } => PipeState::ClosedBoth,
            other => other,
        };
    }

    /// Move the read end out. The pipe then counts it as closed.
    pub fn take_read(&mut self) -> Option<OwnedFd> {
        match std::mem::take(self) {
            PipeState::Created { read, write } => {
                *self = PipeState::ClosedRead { write };
                Some(read)
            }
            PipeState::ClosedWrite { read } => {
                *self = PipeState::ClosedBoth;
                Some(read)
            }
            other => {
                *self = other;
                None
            }
        }
    }

    /// Move the write end out. The pipe then counts it as closed.
    pub fn take_write(&mut self) -> Option<OwnedFd> {
        match std::mem::take(self) {
            PipeState::Created { read, write } => {
                *self = PipeState::ClosedWrite { read };
                Some(write)
            }
            PipeState::ClosedRead { write } => {
                *self = PipeState::ClosedBoth;
                Some(write)
            }
            other => {
                *self = other;
                None
            }
        }
    }

    /// Close whatever is still open. Safe to call repeatedly.
    pub fn close_all(&mut self) {
        if self.exists() {
            *self = PipeState::ClosedBoth;
        }
    }

    fn raw_ends(&self) -> Option<(RawFd, RawFd)> {
        match self {
            PipeState::Created { read, write } => Some((read.as_raw_fd(), write.as_raw_fd())),
            _ => None,
        }
    }
}

/// Descriptor numbers the child needs, captured before fork.
///
/// Plain integers only: the child must not touch allocator-backed state.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ChildFds {
    stdin: Option<(RawFd, RawFd)>,
    stdout: Option<(RawFd, RawFd)>,
    stderr: Option<(RawFd, RawFd)>,
}

impl ChildFds {
    /// Close the ends the child does not use and move the kept ends onto
    /// 0/1/2. Streams without a pipe keep the inherited descriptor.
    ///
    /// Returns the errno of the first failing `dup2`.
    ///
    /// # Safety
    ///
    /// Only call in the freshly forked child, before exec. Performs raw
    /// async-signal-safe syscalls on descriptors the child owns.
    pub(crate) unsafe fn redirect(&self) -> Result<(), i32> {
        if let Some((read, write)) = self.stdin {
            libc::close(write);
            attach(read, StreamKind::Stdin.target_fd())?;
        }
        if let Some((read, write)) = self.stdout {
            libc::close(read);
            attach(write, StreamKind::Stdout.target_fd())?;
        }
        if let Some((read, write)) = self.stderr {
            libc::close(read);
            attach(write, StreamKind::Stderr.target_fd())?;
        }
        Ok(())
    }
}

/// Place `fd` at `target`, clearing close-on-exec on the result.
unsafe fn attach(fd: RawFd, target: RawFd) -> Result<(), i32> {
    if fd == target {
        // dup2 onto itself keeps FD_CLOEXEC, so clear it by hand.
        if libc::fcntl(fd, libc::F_SETFD, 0) < 0 {
            return Err(last_errno());
        }
        return Ok(());
    }
    loop {
        if libc::dup2(fd, target) >= 0 {
            break;
        }
        let errno = last_errno();
        if errno != libc::EINTR {
            return Err(errno);
        }
    }
    libc::close(fd);
    Ok(())
}

pub(crate) fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// The three pipes of one invocation.
#[derive(Debug, Default)]
pub struct PipeSet {
    stdin: PipeState,
    stdout: PipeState,
    stderr: PipeState,
    level: PipeLevel,
    error: Option<Errno>,
}

impl PipeSet {
    /// Allocate stdin, stdout and stderr pipes in that order, stopping at the
    /// first failure.
    pub fn allocate(allocator: &mut dyn PipeAllocator) -> Self {
        let mut set = PipeSet::default();
        let mut created = 0;

        for kind in [StreamKind::Stdin, StreamKind::Stdout, StreamKind::Stderr] {
            match allocator.allocate(kind) {
                Ok((read, write)) => {
                    *set.slot_mut(kind) = PipeState::Created { read, write };
                    created += 1;
                }
                Err(errno) => {
                    warn!(stream = ?kind, %errno, "pipe allocation failed");
                    set.error = Some(errno);
                    break;
                }
            }
        }

        set.level = PipeLevel::from_count(created);
        debug!(level = ?set.level, "pipes allocated");
        set
    }

    /// How many pipes exist.
    pub fn level(&self) -> PipeLevel {
        self.level
    }

    /// The error that stopped allocation, if any.
    pub fn allocation_error(&self) -> Option<Errno> {
        self.error
    }

    /// State of the pipe attached to `kind`.
    pub fn state(&self, kind: StreamKind) -> &PipeState {
        match kind {
            StreamKind::Stdin => &self.stdin,
            StreamKind::Stdout => &self.stdout,
            StreamKind::Stderr => &self.stderr,
        }
    }

    fn slot_mut(&mut self, kind: StreamKind) -> &mut PipeState {
        match kind {
            StreamKind::Stdin => &mut self.stdin,
            StreamKind::Stdout => &mut self.stdout,
            StreamKind::Stderr => &mut self.stderr,
        }
    }

    /// Snapshot the raw descriptors for the child side.
    pub(crate) fn child_fds(&self) -> ChildFds {
        ChildFds {
            stdin: self.stdin.raw_ends(),
            stdout: self.stdout.raw_ends(),
            stderr: self.stderr.raw_ends(),
        }
    }

    /// Close the ends that belong to the child.
    pub fn setup_parent(&mut self) {
        self.stdin.close_read();
        self.stdout.close_write();
        self.stderr.close_write();
    }

    /// Hand out the stdin write end.
    pub fn take_input_writer(&mut self) -> Option<File> {
        self.stdin.take_write().map(File::from)
    }

    /// Hand out the stdout and stderr read ends.
    pub fn take_output_readers(&mut self) -> (Option<File>, Option<File>) {
        (
            self.stdout.take_read().map(File::from),
            self.stderr.take_read().map(File::from),
        )
    }

    /// Close every end still held. Idempotent.
    pub fn teardown(&mut self) {
        self.stdin.close_all();
        self.stdout.close_all();
        self.stderr.close_all();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Succeeds for the first `remaining` pipes, then fails with `EMFILE`.
    pub(crate) struct FailAfter {
        pub remaining: usize,
    }

    impl PipeAllocator for FailAfter {
        fn allocate(&mut self, _stream: StreamKind) -> nix::Result<(OwnedFd, OwnedFd)> {
            if self.remaining == 0 {
                return Err(Errno::EMFILE);
            }
            self.remaining -= 1;
            cloexec_pipe()
        }
    }

    #[test]
    fn test_allocate_all() {
        let set = PipeSet::allocate(&mut SystemPipes);
        assert_eq!(set.level(), PipeLevel::ErrorCreated);
        assert!(set.level().is_complete());
        assert!(set.allocation_error().is_none());
        assert!(set.state(StreamKind::Stderr).exists());
    }

    #[test]
    fn test_fail_on_second_pipe() {
        let mut set = PipeSet::allocate(&mut FailAfter { remaining: 1 });
        assert_eq!(set.level(), PipeLevel::InputCreated);
        assert_eq!(set.level().count(), 1);
        assert_eq!(set.allocation_error(), Some(Errno::EMFILE));
        assert!(set.state(StreamKind::Stdin).exists());
        assert!(!set.state(StreamKind::Stdout).exists());
        assert!(!set.state(StreamKind::Stderr).exists());

        set.setup_parent();
        let (out, err) = set.take_output_readers();
        assert!(out.is_none());
        assert!(err.is_none());
        assert!(set.take_input_writer().is_some());

        set.teardown();
        set.teardown();
        assert!(matches!(set.state(StreamKind::Stderr), PipeState::NotCreated));
    }

    #[test]
    fn test_fail_on_first_pipe() {
        let set = PipeSet::allocate(&mut FailAfter { remaining: 0 });
        assert_eq!(set.level(), PipeLevel::None);
        let fds = set.child_fds();
        assert!(fds.stdin.is_none() && fds.stdout.is_none() && fds.stderr.is_none());
    }

    #[test]
    fn test_setup_parent_keeps_parent_ends() {
        let mut set = PipeSet::allocate(&mut SystemPipes);
        set.setup_parent();
        assert!(matches!(set.state(StreamKind::Stdin), PipeState::ClosedRead { .. }));
        assert!(matches!(set.state(StreamKind::Stdout), PipeState::ClosedWrite { .. }));
        assert!(matches!(set.state(StreamKind::Stderr), PipeState::ClosedWrite { .. }));
    }

    #[test]
    fn test_pipe_state_transitions() {
        let (read, write) = cloexec_pipe().unwrap();
        let mut state = PipeState::Created { read, write };

        state.close_read();
        assert!(matches!(state, PipeState::ClosedRead { .. }));
        state.close_read();
        assert!(matches!(state, PipeState::ClosedRead { .. }));
        assert!(state.take_read().is_none());

        assert!(state.take_write().is_some());
        assert!(matches!(state, PipeState::ClosedBoth));
        assert!(state.take_write().is_none());
        state.close_all();
        assert!(matches!(state, PipeState::ClosedBoth));
    }

    #[test]
    fn test_close_all_leaves_not_created_alone() {
        let mut state = PipeState::NotCreated;
        state.close_all();
        assert!(!state.exists());
    }

    #[test]
    fn test_level_ordering() {
        assert!(PipeLevel::None < PipeLevel::InputCreated);
        assert!(PipeLevel::OutputCreated < PipeLevel::ErrorCreated);
        assert_eq!(PipeLevel::ErrorCreated.count(), 3);
        assert_eq!(PipeLevel::default(), PipeLevel::None);
    }
}
