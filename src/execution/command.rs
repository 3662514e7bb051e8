//! Command building and process orchestration.

use std::fmt;
use std::time::{Duration, Instant};

use nix::unistd::{fork, ForkResult, Pid};
use tracing::{debug, warn};

use super::child::{exec_child, ExecStatusPipe};
use super::drain::{InputFeeder, OutputCollector, DEFAULT_READ_BUFFER_SIZE};
use super::marshal::ExecPlan;
use super::pipes::{PipeAllocator, PipeSet, SystemPipes};
use super::reap::{kill_and_reap, reap, reap_until};
use super::result::{ExecutionResult, ENGINE_FAILURE};
use crate::error::{EngineFailure, ProcpipeError};
use crate::Result;

/// How long output may keep arriving after a timed-out child was killed.
const KILL_GRACE: Duration = Duration::from_millis(250);

/// An external program to run with piped standard streams.
///
/// Configure it with the builder methods, then either [`run`](Self::run) it
/// to completion or [`start`](Self::start) it and [`wait`](Self::wait) later.
///
/// ```no_run
/// use procpipe::Command;
///
/// let mut cmd = Command::new("grep");
/// cmd.arg("hello").input("hello, world\nbye\n");
/// let result = cmd.run().unwrap();
/// assert_eq!(result.output(), b"hello, world\n");
/// ```
pub struct Command {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    input: Vec<u8>,
    timeout: Option<Duration>,
    read_buffer_size: usize,
    allocator: Box<dyn PipeAllocator>,
    state: State,
    last: Option<ExecutionResult>,
}

enum State {
    Idle,
    Running(Box<Invocation>),
}

/// Parent-side bookkeeping for a started child.
struct Invocation {
    pid: Pid,
    pipes: PipeSet,
    allocation_failure: Option<EngineFailure>,
    exec_failure: Option<EngineFailure>,
    output: Option<OutputCollector>,
    feeder: Option<InputFeeder>,
    started: Instant,
}

impl Command {
    /// Create a command for `program`.
    ///
    /// Names without a `/` are looked up on PATH.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            input: Vec::new(),
            timeout: None,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            allocator: Box::new(SystemPipes),
            state: State::Idle,
            last: None,
        }
    }

    /// Append an argument.
    pub fn arg(&mut self, arg: impl Into<String>) -> &mut Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add an environment variable.
    ///
    /// Setting any variable replaces the inherited environment entirely.
    pub fn env(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Add multiple environment variables.
    pub fn envs<I, K, V>(&mut self, vars: I) -> &mut Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in vars {
            self.envs.push((k.into(), v.into()));
        }
        self
    }

    /// Append bytes to the stdin payload.
    pub fn input(&mut self, data: impl AsRef<[u8]>) -> &mut Self {
        self.input.extend_from_slice(data.as_ref());
        self
    }

    /// Append several pieces to the stdin payload, in order.
    pub fn inputs<I, D>(&mut self, pieces: I) -> &mut Self
    where
        I: IntoIterator<Item = D>,
        D: AsRef<[u8]>,
    {
        for piece in pieces {
            self.input.extend_from_slice(piece.as_ref());
        }
        self
    }

    /// Kill the child and report a timeout if it runs longer than `duration`.
    pub fn timeout(&mut self, duration: Duration) -> &mut Self {
        self.timeout = Some(duration);
        self
    }

    /// Chunk size for reading the child's output.
    pub fn read_buffer_size(&mut self, size: usize) -> &mut Self {
        self.read_buffer_size = size.max(1);
        self
    }

    /// Use a custom pipe source.
    pub fn pipe_allocator(&mut self, allocator: impl PipeAllocator + 'static) -> &mut Self {
        self.allocator = Box::new(allocator);
        self
    }

    /// Program name as given.
    pub fn get_program(&self) -> &str {
        &self.program
    }

    /// Arguments after the program name.
    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    /// Explicit environment entries, in insertion order.
    pub fn get_envs(&self) -> &[(String, String)] {
        &self.envs
    }

    /// Accumulated stdin payload.
    pub fn get_input(&self) -> &[u8] {
        &self.input
    }

    /// Configured deadline.
    pub fn get_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Process id of the running child.
    pub fn pid(&self) -> Option<i32> {
        match &self.state {
            State::Running(inv) => Some(inv.pid.as_raw()),
            State::Idle => None,
        }
    }

    /// Whether a started child has not been waited for yet.
    pub fn is_running(&self) -> bool {
        matches!(self.state, State::Running(_))
    }

    /// Result of the last invocation, once it has completed.
    pub fn result(&self) -> Option<&ExecutionResult> {
        self.last.as_ref()
    }

    /// Run the program to completion.
    ///
    /// Engine failures (fork, exec, wait, timeout) are reported inside the
    /// returned result. `Err` means the command could not be attempted: it is
    /// already running, or a string holds a nul byte.
    pub fn run(&mut self) -> Result<&ExecutionResult> {
        self.start()?;
        if self.is_running() {
            return self.wait();
        }
        // Fork failed and start already recorded the result.
        Ok(&*self
            .last
            .get_or_insert_with(|| ExecutionResult::engine_failure(EngineFailure::NoChild)))
    }

    /// Launch the program and return without waiting for it.
    ///
    /// The input payload is delivered in the background.
    pub fn start(&mut self) -> Result<&mut Self> {
        if let State::Running(inv) = &self.state {
            return Err(ProcpipeError::AlreadyRunning(inv.pid.as_raw()));
        }

        let plan = ExecPlan::new(&self.program, &self.args, &self.envs)?;
        self.last = None;
        let mut pipes = PipeSet::allocate(self.allocator.as_mut());
        let allocation_failure = pipes
            .allocation_error()
            .map(|errno| EngineFailure::PipeAllocation {
                created: pipes.level(),
                errno,
            });

        let status_pipe = match ExecStatusPipe::new() {
            Ok(pipe) => Some(pipe),
            Err(errno) => {
                warn!(%errno, "exec status pipe unavailable");
                None
            }
        };
        let child_fds = pipes.child_fds();
        let report_fd = status_pipe.as_ref().map(ExecStatusPipe::write_fd);

        debug!(
            program = %self.program,
            argc = plan.argv().len(),
            env_entries = self.envs.len(),
            input_bytes = self.input.len(),
            "forking"
        );

        let started = Instant::now();
        // SAFETY: the child only runs `exec_child`, which sticks to
        // async-signal-safe calls on data prepared above and never returns.
        let fork_result = unsafe { fork() };
        let pid = match fork_result {
            Ok(ForkResult::Child) => unsafe { exec_child(&child_fds, &plan, report_fd) },
            Ok(ForkResult::Parent { child }) => child,
            Err(errno) => {
                warn!(program = %self.program, %errno, "fork failed");
                pipes.teardown();
                self.last = Some(
                    ExecutionResult::engine_failure(EngineFailure::Fork(errno))
                        .with_pipe_level(pipes.level()),
                );
                return Ok(self);
            }
        };
        drop(plan);

        debug!(pid = pid.as_raw(), program = %self.program, "child started");
        pipes.setup_parent();

        let exec_failure = status_pipe
            .and_then(ExecStatusPipe::read_exec_error)
            .map(|code| {
                warn!(program = %self.program, code, "exec failed in child");
                EngineFailure::Exec {
                    program: self.program.clone(),
                    code,
                }
            });

        let mut inv = Invocation {
            pid,
            pipes,
            allocation_failure,
            exec_failure,
            output: None,
            feeder: None,
            started,
        };

        let (stdout, stderr) = inv.pipes.take_output_readers();
        match OutputCollector::spawn(stdout, stderr, self.read_buffer_size) {
            Ok(collector) => inv.output = Some(collector),
            Err(e) => warn!("failed to start output drains: {}", e),
        }

        if let Some(writer) = inv.pipes.take_input_writer() {
            if self.input.is_empty() {
                drop(writer);
            } else {
                match InputFeeder::spawn(writer, self.input.clone()) {
                    Ok(feeder) => inv.feeder = Some(feeder),
                    Err(e) => warn!("failed to start input feeder: {}", e),
                }
            }
        }

        self.state = State::Running(Box::new(inv));
        Ok(self)
    }

    /// Block until the started child exits and return its result.
    ///
    /// Without a running child, including a second `wait`, the result records
    /// [`EngineFailure::NoChild`].
    pub fn wait(&mut self) -> Result<&ExecutionResult> {
        let result = match std::mem::replace(&mut self.state, State::Idle) {
            State::Running(inv) => self.finish(*inv),
            State::Idle => {
                debug!(program = %self.program, "wait called without a running child");
                ExecutionResult::engine_failure(EngineFailure::NoChild)
            }
        };
        Ok(&*self.last.insert(result))
    }

    fn finish(&self, mut inv: Invocation) -> ExecutionResult {
        let reaped = match self.timeout {
            Some(limit) => reap_until(inv.pid, inv.started + limit, limit),
            None => reap(inv.pid),
        };
        let duration = inv.started.elapsed();

        let mut result = match reaped {
            Ok(termination) => {
                let mut result = inv.collect(termination.status(), duration);
                result.signal = termination.signal();
                result.failure = inv.exec_failure.take().or(inv.allocation_failure.take());
                result
            }
            // The child is gone, but its descendants may keep the pipes open.
            Err(failure @ EngineFailure::TimedOut(_)) => {
                let mut result = inv.collect_after_kill(duration);
                result.timed_out = true;
                result.failure = Some(failure);
                result
            }
            Err(failure) => {
                warn!(pid = inv.pid.as_raw(), "{}", failure);
                if let Some(output) = inv.output.take() {
                    output.abandon();
                }
                let mut result = ExecutionResult::engine_failure(failure);
                result.duration = duration;
                result
            }
        };

        inv.pipes.teardown();
        result.pipe_level = inv.pipes.level();

        debug!(
            pid = inv.pid.as_raw(),
            status = result.exit_status,
            stdout_bytes = result.stdout.len(),
            stderr_bytes = result.stderr.len(),
            "child finished in {:?}",
            duration
        );
        result
    }
}

impl Invocation {
    /// Join the feeder and drains of a child that has terminated.
    fn collect(&mut self, status: i32, duration: Duration) -> ExecutionResult {
        let input_written = self.feeder.take().map(InputFeeder::join).unwrap_or(0);
        let (stdout, stderr) = self
            .output
            .take()
            .map(OutputCollector::collect)
            .unwrap_or_default();

        let mut result = ExecutionResult::new(status, stdout, stderr, duration);
        result.input_written = input_written;
        result
    }

    /// Gather what a killed child left behind without blocking past
    /// [`KILL_GRACE`].
    fn collect_after_kill(&mut self, duration: Duration) -> ExecutionResult {
        let (stdout, stderr) = self
            .output
            .take()
            .map(|output| output.collect_within(KILL_GRACE))
            .unwrap_or_default();
        let input_written = self
            .feeder
            .take()
            .and_then(InputFeeder::join_if_finished)
            .unwrap_or(0);

        let mut result = ExecutionResult::new(ENGINE_FAILURE, stdout, stderr, duration);
        result.input_written = input_written;
        result
    }
}

impl Drop for Command {
    fn drop(&mut self) {
        if let State::Running(inv) = &mut self.state {
            warn!(pid = inv.pid.as_raw(), "command dropped while running, killing child");
            kill_and_reap(inv.pid);
            inv.pipes.teardown();
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("envs", &self.envs)
            .field("input_len", &self.input.len())
            .field("timeout", &self.timeout)
            .field("pid", &self.pid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::pipes::tests::FailAfter;
    use crate::execution::pipes::PipeLevel;

    #[test]
    fn test_command_new() {
        let cmd = Command::new("grep");
        assert_eq!(cmd.get_program(), "grep");
        assert!(cmd.get_args().is_empty());
        assert!(cmd.get_envs().is_empty());
        assert!(cmd.get_input().is_empty());
        assert!(cmd.get_timeout().is_none());
        assert!(!cmd.is_running());
        assert!(cmd.result().is_none());
    }

    #[test]
    fn test_command_builder_chain() {
        let mut cmd = Command::new("grep");
        cmd.arg("hello")
            .args(["-n", ""])
            .env("LANG", "C")
            .envs([("A", "1")])
            .input("I am input text\n")
            .inputs(["hello, world\n", "hello, c++"])
            .timeout(Duration::from_secs(5));

        assert_eq!(cmd.get_args(), ["hello", "-n", ""]);
        assert_eq!(cmd.get_envs()[0], ("LANG".to_string(), "C".to_string()));
        assert_eq!(cmd.get_envs().len(), 2);
        assert_eq!(
            cmd.get_input(),
            b"I am input text\nhello, world\nhello, c++"
        );
        assert_eq!(cmd.get_timeout(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_run_rejects_nul_byte() {
        let mut cmd = Command::new("echo");
        cmd.arg("bad\0arg");
        let err = cmd.run().unwrap_err();
        assert!(matches!(err, ProcpipeError::InvalidArgument(_)));
        assert!(!cmd.is_running());
    }

    #[test]
    fn test_start_twice_fails_fast() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        cmd.start().unwrap();
        let pid = cmd.pid().unwrap();

        let err = cmd.start().unwrap_err();
        assert!(matches!(err, ProcpipeError::AlreadyRunning(p) if p == pid));
        assert!(cmd.run().is_err());
        // Drop kills and reaps the sleeper.
    }

    #[test]
    fn test_drop_kills_and_reaps_running_child() {
        use nix::errno::Errno;
        use nix::sys::wait::{waitpid, WaitPidFlag};

        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        cmd.start().unwrap();
        let pid = Pid::from_raw(cmd.pid().unwrap());

        let started = Instant::now();
        drop(cmd);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(waitpid(pid, Some(WaitPidFlag::WNOHANG)), Err(Errno::ECHILD));
    }

    #[test]
    fn test_wait_without_start() {
        let mut cmd = Command::new("true");
        let result = cmd.wait().unwrap();
        assert_eq!(result.failure, Some(EngineFailure::NoChild));
        assert_eq!(result.exit_status, ENGINE_FAILURE);
    }

    #[test]
    fn test_second_pipe_failure_still_runs() {
        let mut cmd = Command::new("true");
        cmd.pipe_allocator(FailAfter { remaining: 1 });
        let result = cmd.run().unwrap();

        assert_eq!(result.pipe_level, PipeLevel::InputCreated);
        assert_eq!(result.pipe_level.count(), 1);
        assert_eq!(result.exit_status, 0);
        assert!(matches!(
            result.failure,
            Some(EngineFailure::PipeAllocation {
                created: PipeLevel::InputCreated,
                ..
            })
        ));
        assert!(result.stdout.is_empty());
        assert!(result.stderr.is_empty());
        assert!(!result.success());
    }

    #[test]
    fn test_no_pipes_still_runs() {
        let mut cmd = Command::new("true");
        cmd.pipe_allocator(FailAfter { remaining: 0 }).input("ignored");
        let result = cmd.run().unwrap();
        assert_eq!(result.pipe_level, PipeLevel::None);
        assert_eq!(result.exit_status, 0);
        assert_eq!(result.input_written, 0);
    }

    #[test]
    fn test_rerun_after_finish_uses_fresh_result() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo run");
        assert_eq!(cmd.run().unwrap().output(), b"run\n");
        assert_eq!(cmd.run().unwrap().output(), b"run\n");
    }

    #[test]
    fn test_debug_output() {
        let mut cmd = Command::new("cat");
        cmd.input("abc");
        let text = format!("{:?}", cmd);
        assert!(text.contains("cat"));
        assert!(text.contains("input_len: 3"));
    }
}
