//! Command execution entry points.

use std::time::Duration;

use super::command::Command;
use super::drain::DEFAULT_READ_BUFFER_SIZE;
use super::result::ExecutionResult;
use crate::error::ProcpipeError;
use crate::Result;

/// Defaults applied to every command an executor runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorSettings {
    /// Deadline for each command, if any.
    pub timeout: Option<Duration>,
    /// Chunk size for output drains.
    pub read_buffer_size: usize,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            timeout: None,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

/// Runs commands with shared defaults.
#[derive(Debug, Clone, Default)]
pub struct CommandExecutor {
    settings: ExecutorSettings,
}

impl CommandExecutor {
    /// Create a new command executor.
    pub fn new(settings: ExecutorSettings) -> Self {
        Self { settings }
    }

    /// Settings this executor applies.
    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Build a command carrying this executor's defaults.
    pub fn command(&self, program: impl Into<String>) -> Command {
        let mut cmd = Command::new(program);
        cmd.read_buffer_size(self.settings.read_buffer_size);
        if let Some(timeout) = self.settings.timeout {
            cmd.timeout(timeout);
        }
        cmd
    }

    /// Run a command to completion on the current thread.
    pub fn execute_sync(&self, mut command: Command) -> Result<ExecutionResult> {
        command.run().cloned()
    }

    /// Start a command and wait for it in two steps.
    ///
    /// Produces the same result as [`execute_sync`](Self::execute_sync); it
    /// exists for callers that want the child's pid before it finishes.
    pub fn execute_detached<F>(&self, mut command: Command, on_start: F) -> Result<ExecutionResult>
    where
        F: FnOnce(Option<i32>),
    {
        command.start()?;
        on_start(command.pid());
        command.wait().cloned()
    }

    /// Run a command on tokio's blocking pool.
    pub async fn execute_async(&self, mut command: Command) -> Result<ExecutionResult> {
        tokio::task::spawn_blocking(move || command.run().cloned())
            .await
            .map_err(|e| ProcpipeError::Join(e.to_string()))?
    }
}

/// Simple one-shot command execution.
pub fn execute_simple<I, S>(program: &str, args: I) -> Result<ExecutionResult>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let executor = CommandExecutor::default();
    let mut cmd = executor.command(program);
    cmd.args(args);
    executor.execute_sync(cmd)
}

/// Execute a command with timeout.
pub fn execute_with_timeout<I, S>(
    program: &str,
    args: I,
    timeout: Duration,
) -> Result<ExecutionResult>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let executor = CommandExecutor::new(ExecutorSettings {
        timeout: Some(timeout),
        ..ExecutorSettings::default()
    });
    let mut cmd = executor.command(program);
    cmd.args(args);
    executor.execute_sync(cmd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executor_defaults() {
        let executor = CommandExecutor::default();
        assert_eq!(executor.settings().timeout, None);
        assert_eq!(executor.settings().read_buffer_size, DEFAULT_READ_BUFFER_SIZE);
    }

    #[test]
    fn test_command_carries_settings() {
        let executor = CommandExecutor::new(ExecutorSettings {
            timeout: Some(Duration::from_secs(5)),
            read_buffer_size: 64,
        });
        let cmd = executor.command("echo");
        assert_eq!(cmd.get_timeout(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_execute_simple_echo() {
        let result = execute_simple("echo", ["test"]).unwrap();
        assert!(result.success());
        assert_eq!(result.output_text(), "test\n");
    }

    #[test]
    fn test_execute_with_timeout_fast_command() {
        let result = execute_with_timeout("echo", ["fast"], Duration::from_secs(5)).unwrap();
        assert!(!result.timed_out);
        assert_eq!(result.exit_status, 0);
    }

    #[test]
    fn test_execute_detached_reports_pid() {
        let executor = CommandExecutor::default();
        let mut seen = None;
        let result = executor
            .execute_detached(executor.command("true"), |pid| seen = pid)
            .unwrap();
        assert!(seen.is_some_and(|pid| pid > 0));
        assert!(result.success());
    }

    #[test]
    fn test_execute_async_block_on() {
        let executor = CommandExecutor::default();
        let mut cmd = executor.command("cat");
        cmd.input("through the pool");
        let result = tokio_test::block_on(executor.execute_async(cmd)).unwrap();
        assert_eq!(result.output(), b"through the pool");
    }

    #[tokio::test]
    async fn test_execute_async_exit_code() {
        let executor = CommandExecutor::default();
        let mut cmd = executor.command("sh");
        cmd.args(["-c", "exit 3"]);
        let result = executor.execute_async(cmd).await.unwrap();
        assert_eq!(result.exit_status, 3);
        assert!(result.failed());
    }
}
