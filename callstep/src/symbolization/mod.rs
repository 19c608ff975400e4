//! # Symbol Resolution, Address Translation and Unwinding
//!
//! Every sample starts as a register file of the stopped thread: a program
//! counter, a stack pointer and a frame pointer. This module turns that into
//! a chain of symbolized frames, innermost first.
//!
//! ## Address Translation
//!
//! Executables built as PIE and all shared libraries are relocated at load
//! time, so the addresses seen in the process differ from the link-time
//! addresses stored in DWARF, the symbol tables and `.eh_frame`:
//!
//! ```text
//! bias              = mapping start - file offset - first segment address
//! link-time address = runtime address - bias
//! ```
//!
//! `/proc/<pid>/maps` tells which object a runtime address belongs to and
//! where that object was mapped. Addresses written to the profile are
//! link-time addresses, so profiles of the same binary are comparable across
//! runs regardless of ASLR.
//!
//! ## Symbolization
//!
//! ```text
//! link-time address
//!      │
//!      ├─► DWARF (addr2line) ──► function, file, line
//!      │        │ (no DWARF)
//!      │        ▼
//!      └─► .symtab / .dynsym ──► function, file = "???", line = 0
//! ```
//!
//! The function of an address is its *physical* function: inlined callees are
//! attributed to the function they were inlined into, while file and line come
//! from the innermost inlined location.
//!
//! ## Unwinding
//!
//! Caller frames are recovered from `.eh_frame` call frame information rather
//! than frame pointers, which optimized code does not maintain. For callers the
//! return address is reported but the *call* instruction (`return address - 1`)
//! is symbolized, since the return address may already belong to the next line
//! or even the next function.
//!
//! ## Module Structure
//!
//! - **`memory_maps`**: `/proc/<pid>/maps` parsing and load bias computation
//! - **`symbolizer`**: DWARF and symbol table lookups with a per-address cache
//! - **`cfi`**: `.eh_frame` rules and the register recovery for one frame
//! - **`modules`**: lazily loaded object files of the traced process

pub mod cfi;
pub mod memory_maps;
pub mod modules;
pub mod symbolizer;

pub use cfi::{Cfa, CfiTable, FrameRule, ReadMemory, Registers, SavedRegister};
pub use memory_maps::{load_bias, parse_maps, read_memory_maps, Mapping, MemoryRange};
pub use modules::{LoadedModule, ModuleMap};
pub use symbolizer::{ResolvedFrame, Symbolizer};
