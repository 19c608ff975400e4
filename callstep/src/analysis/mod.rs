//! Analysis logic for finished profiles
//!
//! This module contains pure logic for summarizing a cost model,
//! separated from the CLI presentation.

pub mod hotspot_analyzer;

pub use hotspot_analyzer::{analyze_hotspots, format_report, FunctionHotspot, ProfileSummary};
