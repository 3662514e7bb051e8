//! Execution result types.

use std::borrow::Cow;
use std::time::Duration;

use super::pipes::PipeLevel;
use crate::error::EngineFailure;

/// Exit status recorded when the engine itself failed (fork, wait, timeout).
pub const ENGINE_FAILURE: i32 = -1;

/// Result of one command invocation.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Child exit code, `128 + signal` if it was killed, or
    /// [`ENGINE_FAILURE`].
    pub exit_status: i32,
    /// Captured standard output.
    pub stdout: Vec<u8>,
    /// Captured standard error.
    pub stderr: Vec<u8>,
    /// How many of the three pipes were created.
    pub pipe_level: PipeLevel,
    /// Engine-level failure, if any.
    pub failure: Option<EngineFailure>,
    /// Signal that terminated the child.
    pub signal: Option<i32>,
    /// Bytes of the input payload that reached the child.
    pub input_written: usize,
    /// Wall time from fork to reap.
    pub duration: Duration,
    /// Whether the deadline expired.
    pub timed_out: bool,
}

impl ExecutionResult {
    /// Create a result for a child that exited with `exit_status`.
    pub fn new(exit_status: i32, stdout: Vec<u8>, stderr: Vec<u8>, duration: Duration) -> Self {
        Self {
            exit_status,
            stdout,
            stderr,
            duration,
            ..Default::default()
        }
    }

    /// Create a result describing an engine-level failure.
    pub fn engine_failure(failure: EngineFailure) -> Self {
        Self {
            timed_out: matches!(failure, EngineFailure::TimedOut(_)),
            failure: Some(failure),
            ..Default::default()
        }
    }

    /// Record the pipe allocation outcome.
    pub fn with_pipe_level(mut self, level: PipeLevel) -> Self {
        self.pipe_level = level;
        self
    }

    /// Check if the command succeeded: exit code 0 and a clean engine run.
    pub fn success(&self) -> bool {
        self.exit_status == 0 && self.failure.is_none()
    }

    /// Check if the command failed for any reason.
    pub fn failed(&self) -> bool {
        !self.success()
    }

    /// Whether the exit status is the engine sentinel [`ENGINE_FAILURE`].
    ///
    /// Some engine failures keep a child status (`Exec` reports 127,
    /// `PipeAllocation` keeps the child's code), so check `failure` to learn
    /// whether anything went wrong in the engine at all.
    pub fn has_engine_status(&self) -> bool {
        self.exit_status == ENGINE_FAILURE
    }

    /// The child's exit status.
    pub fn exit_status(&self) -> i32 {
        self.exit_status
    }

    /// Captured standard output.
    pub fn output(&self) -> &[u8] {
        &self.stdout
    }

    /// Captured standard error.
    pub fn error(&self) -> &[u8] {
        &self.stderr
    }

    /// Standard output decoded as UTF-8 (lossy).
    pub fn output_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    /// Standard error decoded as UTF-8 (lossy).
    pub fn error_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }

    /// Output lines without their terminators, decoded lossily so that one
    /// bad byte only affects its own line.
    pub fn output_lines(&self) -> impl Iterator<Item = Cow<'_, str>> {
        let body = self
            .stdout
            .strip_suffix(b"\n")
            .unwrap_or(self.stdout.as_slice());
        body.split(|&b| b == b'\n')
            .take(if self.stdout.is_empty() { 0 } else { usize::MAX })
            .map(|line| String::from_utf8_lossy(line.strip_suffix(b"\r").unwrap_or(line)))
    }
}

impl Default for ExecutionResult {
    fn default() -> Self {
        Self {
            exit_status: ENGINE_FAILURE,
            stdout: Vec::new(),
            stderr: Vec::new(),
            pipe_level: PipeLevel::None,
            failure: None,
            signal: None,
            input_written: 0,
            duration: Duration::ZERO,
            timed_out: false,
        }
    }
}

/// Chunk of child output moving from a drain worker to the collector.
#[derive(Debug, Clone)]
pub struct OutputChunk {
    /// Raw bytes.
    pub raw: Vec<u8>,
    /// Stream source.
    pub source: OutputSource,
}

/// Source of output data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSource {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

impl OutputSource {
    /// Short name of the stream.
    pub fn as_str(self) -> &'static str {
        match self {
            OutputSource::Stdout => "stdout",
            OutputSource::Stderr => "stderr",
        }
    }
}

impl OutputChunk {
    /// Create a new output chunk.
    pub fn new(raw: Vec<u8>, source: OutputSource) -> Self {
        Self { raw, source }
    }
}
