//! Profile aggregation model
//!
//! - [`frame`]: frame snapshots and the non-empty call chain of one sample
//! - [`cost_model`]: the ObjectFile → Function → {positions, call edges} hierarchy

pub mod cost_model;
pub mod frame;

pub use cost_model::{CallEdge, CalleeKey, CodeLocation, CostModel, Function, ObjectFile, Position};
pub use frame::{FrameChain, FrameSnapshot, UnwoundFrame};
