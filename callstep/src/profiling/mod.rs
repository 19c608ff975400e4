//! Profiling backend
//!
//! This module connects the profiling session to a real process:
//! - ptrace control of the traced process (x86_64 Linux only)
//! - Stack trace resolution over `.eh_frame` and the process's mapped objects

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod inferior;
pub mod stack_resolver;

// Re-export common types
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use inferior::Inferior;
pub use stack_resolver::{StackResolver, StartPoint, Tracee, MAX_DEPTH};
