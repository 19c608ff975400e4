//! Structured error types for callstep
//!
//! Using thiserror for automatic Display implementation and error chaining.

use super::types::{Address, Pid};
use std::path::PathBuf;
use thiserror::Error;

/// Failures of a profiling session. Every variant aborts the session before
/// any output is written, except `OutputWrite` which is raised by the write itself.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("No function information for the current instruction at {address}")]
    UnresolvableFrame { address: Address },

    #[error("Resolver returned an empty call stack")]
    EmptyStack,

    #[error("Failed to step the target: {0}")]
    Step(#[source] TargetError),

    #[error("Failed to resolve the current frame: {0}")]
    Resolve(#[source] TargetError),

    #[error("Stop address not reached after {steps} steps")]
    StepLimitReached { steps: u64 },

    #[error("Failed to write profile to {}: {source}", path.display())]
    OutputWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failures of the debugger backend driving the traced process.
#[derive(Error, Debug)]
pub enum TargetError {
    #[error("ptrace({request}) failed for {pid}: {source}")]
    Ptrace {
        request: &'static str,
        pid: Pid,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn {command}: {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Process {pid} exited with status {code}")]
    Exited { pid: Pid, code: i32 },

    #[error("Process {pid} was killed by signal {signal}")]
    Killed { pid: Pid, signal: i32 },

    #[error("Process {pid} crashed with signal {signal} at 0x{address:x}")]
    Crashed { pid: Pid, signal: i32, address: u64 },

    #[error("Failed to access memory of {pid} at 0x{address:x}: {source}")]
    Memory {
        pid: Pid,
        address: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read the memory maps of {0}")]
    MemoryMapsParseFailed(Pid),

    #[error("Failed to load symbols from {path}: {reason}")]
    SymbolizationFailed { path: String, reason: String },

    #[error("Symbol {0} not found in any mapped object")]
    SymbolNotFound(String),

    #[error("Cannot evaluate the unwind expression at 0x{address:x}: {reason}")]
    UnwindExpression { address: u64, reason: String },
}
