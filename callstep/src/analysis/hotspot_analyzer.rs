//! Hotspot analysis for a finished profile.
//!
//! Ranks functions by self cost so the end of a session can print a short
//! summary without opening the callgrind file in a viewer.
//!
//! # Cost definitions
//!
//! - **self cost**: sum of the function's position counts
//! - **inclusive cost**: self cost plus the inclusive cost of every outgoing
//!   call edge, except edges back into the function itself (recursion would
//!   otherwise count the same samples several times)

// Percentage calculations intentionally convert u64 to f64
#![allow(clippy::cast_precision_loss)]

use std::fmt::Write as _;

use crate::model::{CodeLocation, CostModel};

/// A function hotspot with aggregated statistics.
#[derive(Debug, Clone)]
pub struct FunctionHotspot {
    pub location: CodeLocation,

    /// Samples executing directly in this function.
    pub self_cost: u64,

    /// Samples with this function anywhere on the stack (see module docs).
    pub inclusive_cost: u64,

    /// Self cost as a percentage of all samples (0.0 - 100.0).
    pub percentage: f64,
}

/// Totals over the whole profile
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProfileSummary {
    pub samples: u64,
    pub object_files: usize,
    pub functions: usize,
    pub call_edges: usize,
}

impl ProfileSummary {
    #[must_use]
    pub fn of(model: &CostModel) -> Self {
        Self {
            samples: model.sample_count(),
            object_files: model.objects().count(),
            functions: model.function_count(),
            call_edges: model.call_edge_count(),
        }
    }
}

/// Rank all functions of `model` by self cost (descending).
///
/// Ties are broken by inclusive cost, then by first-seen order.
#[must_use]
pub fn analyze_hotspots(model: &CostModel) -> Vec<FunctionHotspot> {
    let total = model.sample_count();

    let mut hotspots: Vec<FunctionHotspot> = model
        .objects()
        .flat_map(|object| {
            object.functions().map(move |function| {
                let self_cost = function.self_cost();
                let callees: u64 = function
                    .calls()
                    .filter(|(callee, _)| {
                        !(callee.function == *function.name() && callee.object_file == *object.object_file())
                    })
                    .map(|(_, edge)| edge.inclusive_cost())
                    .sum();
                let percentage =
                    if total > 0 { (self_cost as f64 / total as f64) * 100.0 } else { 0.0 };

                FunctionHotspot {
                    location: CodeLocation::new(
                        object.object_file().clone(),
                        object.source_file().clone(),
                        function.name().clone(),
                    ),
                    self_cost,
                    inclusive_cost: self_cost + callees,
                    percentage,
                }
            })
        })
        .collect();

    // Stable sort keeps first-seen order among equal costs
    hotspots.sort_by(|a, b| {
        b.self_cost.cmp(&a.self_cost).then_with(|| b.inclusive_cost.cmp(&a.inclusive_cost))
    });
    hotspots
}

/// Render the summary and the `limit` hottest functions as plain text
#[must_use]
pub fn format_report(model: &CostModel, limit: usize) -> String {
    let summary = ProfileSummary::of(model);
    let mut out = String::new();

    let _ = writeln!(
        out,
        "{} instructions, {} functions in {} object files, {} call edges",
        summary.samples, summary.functions, summary.object_files, summary.call_edges
    );

    for hotspot in analyze_hotspots(model).into_iter().take(limit) {
        let _ = writeln!(
            out,
            "  {:>6.2}%  {:>10} self  {:>10} incl  {}  ({})",
            hotspot.percentage,
            hotspot.self_cost,
            hotspot.inclusive_cost,
            hotspot.location.function,
            hotspot.location.source_file,
        );
    }

    out
}
