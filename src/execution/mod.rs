//! Subprocess execution engine.
//!
//! This module provides:
//! - Blocking (`run`) and two-step (`start` + `wait`) execution
//! - Three-way pipe bookkeeping with partial-allocation handling
//! - Concurrent output draining
//! - Timeout handling
//!
//! # Example
//!
//! ```no_run
//! use procpipe::execution::{execute_simple, Command};
//!
//! // Simple one-shot execution
//! let result = execute_simple("echo", ["hello"]).unwrap();
//! println!("Output: {}", result.output_text());
//!
//! // Two-step execution with input
//! let mut cmd = Command::new("grep");
//! cmd.arg("hello").input("hello, world\noh, so cool!\n");
//! cmd.start().unwrap();
//! let result = cmd.wait().unwrap();
//! assert!(result.success());
//! ```

mod child;
mod command;
mod drain;
mod executor;
mod marshal;
mod pipes;
mod reap;
mod result;

pub use child::EXEC_FAILURE_CODE;
pub use command::Command;
pub use drain::{deliver_input, drain_to_end, DEFAULT_READ_BUFFER_SIZE};
pub use executor::{execute_simple, execute_with_timeout, CommandExecutor, ExecutorSettings};
pub use pipes::{PipeAllocator, PipeLevel, PipeSet, PipeState, StreamKind, SystemPipes};
pub use result::{ExecutionResult, OutputChunk, OutputSource, ENGINE_FAILURE};
