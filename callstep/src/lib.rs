//! # callstep - Instruction-level callgrind profiles by single-stepping
//!
//! callstep executes a process one machine instruction at a time between a
//! start point and a stop address. After every instruction it unwinds the
//! call stack and charges one sample to the executing instruction and one to
//! every call edge on the stack. The result is written in the callgrind text
//! format, readable by `kcachegrind`, `qcachegrind` and `callgrind_annotate`.
//!
//! Unlike statistical profilers nothing is missed: every executed instruction
//! is counted exactly once, which makes the tool suited for short, precisely
//! delimited regions of code.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Traced Process                            │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ ptrace: SINGLESTEP, GETREGS, /proc/pid/mem
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                   callstep (This Crate)                         │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐        │
//! │  │  Profiling   │──▶│   Session    │──▶│  Cost Model  │        │
//! │  │  (ptrace)    │   │ (step loop)  │   │  (model)     │        │
//! │  └──────────────┘   └──────────────┘   └──────────────┘        │
//! │         │                                      │                │
//! │         ▼                                      ▼                │
//! │  ┌──────────────┐                      ┌──────────────┐        │
//! │  │ Symbolizer   │                      │    Export    │        │
//! │  │ (DWARF, CFI) │                      │ (callgrind)  │        │
//! │  └──────────────┘                      └──────────────┘        │
//! │                                                │                │
//! │                                                ▼                │
//! │                                        ┌──────────────┐        │
//! │                                        │   Analysis   │        │
//! │                                        │  (Hotspots)  │        │
//! │                                        └──────────────┘        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! ### Core Pipeline Modules
//!
//! - [`session`]: the sampling loop and the two target traits it drives
//!   - `LocationResolver`: unwinds the stopped thread into frames
//!   - `SampleStepper`: executes one instruction
//!
//! - [`model`]: cost aggregation
//!   - `FrameChain`: non-empty call chain of one sample, innermost first
//!   - `CostModel`: object file → function → positions and call edges
//!
//! - [`export`]: callgrind text format writer with atomic file replacement
//!
//! - [`profiling`]: the Linux x86_64 backend
//!   - `Inferior`: spawn/attach, single-step, registers and memory via ptrace
//!   - `StackResolver`: `.eh_frame` unwinding over the mapped objects
//!
//! - [`symbolization`]: addresses to function, file and line
//!   - Uses DWARF debug information via the `addr2line` crate
//!   - Falls back to ELF symbol tables for objects without DWARF
//!   - Handles PIE and shared library load bias
//!
//! - [`analysis`]: end-of-session hotspot summary
//!
//! ### Supporting Modules
//!
//! - [`cli`]: Command-line argument parsing
//! - [`preflight`]: checks run before any ptrace request
//! - [`process_lookup`]: find a running process by name
//! - [`domain`]: Core domain types (Address, Pid, file and function names) and errors
//!
//! ## Typical Usage
//!
//! ```bash
//! # Profile ./app from main until the instruction at 0x1189 is about to run
//! callstep --stop 0x1189 -o app.callgrind -- ./app
//!
//! # Attach to a running process and stop at a link-time address
//! callstep --stop 0x401a2c -o app.callgrind --pid 1234
//!
//! kcachegrind app.callgrind
//! ```
//!
//! ## Key Concepts
//!
//! - **Sample**: one executed instruction together with its call stack
//! - **Position**: `(address, line)` of an instruction; counts self cost
//! - **Call edge**: caller → callee pair; counts inclusive cost of the callee
//! - **Link-time address**: runtime address minus the object's load bias,
//!   stable across runs and comparable with `objdump` output

// Expose modules for testing
pub mod analysis;
pub mod cli;
pub mod domain;
pub mod export;
pub mod model;
pub mod preflight;
pub mod process_lookup;
pub mod profiling;
pub mod session;
pub mod symbolization;
