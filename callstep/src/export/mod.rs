//! Profile export
//!
//! This module provides functionality for exporting the cost model.
//! Currently supports the callgrind format for `callgrind_annotate` and KCachegrind.

pub mod callgrind;

pub use callgrind::{ProfileWriter, DEFAULT_CREATOR};
