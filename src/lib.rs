//! # procpipe
//!
//! Run an external program with its standard streams wired to pipes.
//!
//! A [`Command`] collects the program, its arguments, an optional
//! replacement environment and a stdin payload. Running it forks a child,
//! redirects the child's stdin/stdout/stderr onto fresh pipes, feeds the
//! payload, drains both output streams concurrently and reaps the child.
//! The outcome is an [`ExecutionResult`] holding the exit status and the
//! captured bytes.
//!
//! ## Features
//!
//! - **Blocking or two-step**: `run`, or `start` followed by `wait`
//! - **Deadlock-free capture**: output is drained while input is written
//! - **Partial pipe failure**: execution proceeds with whatever pipes exist
//! - **Timeouts**: optional deadline that kills the child
//! - **Async entry point**: run on tokio's blocking pool
//!
//! ## Quick Start
//!
//! ```no_run
//! use procpipe::Command;
//!
//! fn main() -> procpipe::Result<()> {
//!     // Initialize logging
//!     procpipe::logging::try_init().ok();
//!
//!     let mut cmd = Command::new("grep");
//!     cmd.arg("hello")
//!         .input("I am input text\n")
//!         .inputs(["hello, world\n", "oh, so cool!\n", "hello, c++"]);
//!
//!     let result = cmd.run()?;
//!     if result.success() {
//!         print!("{}", result.output_text());
//!     } else {
//!         eprint!("{}", result.error_text());
//!     }
//!     Ok(())
//! }
//! ```

#[cfg(not(unix))]
compile_error!("procpipe requires a Unix platform (fork/exec/pipe)");

pub mod cli;
pub mod config;
pub mod error;
pub mod execution;
pub mod logging;

// Re-export commonly used types
pub use error::{EngineFailure, ProcpipeError, Result};
pub use execution::{
    Command, CommandExecutor, ExecutionResult, ExecutorSettings, PipeLevel, ENGINE_FAILURE,
    EXEC_FAILURE_CODE,
};
