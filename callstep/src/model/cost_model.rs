//! Cost aggregation for sampled instructions.
//!
//! The model is a three-level owned hierarchy:
//!
//! ```text
//! CostModel
//!  └── ObjectFile      keyed by (object file, source file)
//!       └── Function   keyed by function name
//!            ├── positions  (address, line)      → leaf sample count
//!            └── calls      (callee object, fn)  → CallEdge (inclusive cost)
//! ```
//!
//! Entries are created on first touch through explicit `upsert_*` methods and
//! are never removed. Counters only grow.
//!
//! Object files and functions keep insertion order so that serialization is
//! deterministic for a given sequence of samples; positions are kept sorted by
//! `(address, line)` because callgrind readers require ascending positions.

use indexmap::IndexMap;
use std::collections::BTreeMap;

use super::frame::{FrameChain, FrameSnapshot};
use crate::domain::{Address, FunctionName, LineNumber, ObjectFileId, SourceFileId};

/// Identity of a function within the session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CodeLocation {
    pub object_file: ObjectFileId,
    pub source_file: SourceFileId,
    pub function: FunctionName,
}

impl CodeLocation {
    pub fn new(
        object_file: impl Into<ObjectFileId>,
        source_file: impl Into<SourceFileId>,
        function: impl Into<FunctionName>,
    ) -> Self {
        Self { object_file: object_file.into(), source_file: source_file.into(), function: function.into() }
    }

    fn object_key(&self) -> ObjectKey {
        ObjectKey { object_file: self.object_file.clone(), source_file: self.source_file.clone() }
    }
}

impl From<&FrameSnapshot> for CodeLocation {
    fn from(frame: &FrameSnapshot) -> Self {
        Self {
            object_file: frame.object_file.clone(),
            source_file: frame.source_file.clone(),
            function: frame.function.clone(),
        }
    }
}

/// Key of an `ObjectFile` entry: one object file paired with one source file
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ObjectKey {
    object_file: ObjectFileId,
    source_file: SourceFileId,
}

/// Finest-grained unit of leaf cost
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Position {
    pub address: Address,
    pub line: LineNumber,
}

/// Key of a `CallEdge`: the callee's object file and function name.
///
/// The callee's source file is deliberately not part of the key; it is
/// tracked on the edge as `callee_source_file` (last write wins).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CalleeKey {
    pub object_file: ObjectFileId,
    pub function: FunctionName,
}

impl From<&FrameSnapshot> for CalleeKey {
    fn from(frame: &FrameSnapshot) -> Self {
        Self { object_file: frame.object_file.clone(), function: frame.function.clone() }
    }
}

/// Aggregated caller → callee relationship
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallEdge {
    callee_source_file: SourceFileId,
    destination: Address,
    source_line: LineNumber,
    source_position: Address,
    inclusive_cost: u64,
}

impl CallEdge {
    fn new(callee: &FrameSnapshot, caller: &FrameSnapshot) -> Self {
        Self {
            callee_source_file: callee.source_file.clone(),
            destination: callee.address,
            source_line: caller.line,
            source_position: caller.address,
            inclusive_cost: 0,
        }
    }

    /// Attribute one sample to this edge.
    ///
    /// The destination only moves down (lowest callee address seen approximates
    /// the callee's entry point); call-site fields reflect the latest sample.
    pub fn attribute(&mut self, callee: &FrameSnapshot, caller: &FrameSnapshot) {
        self.callee_source_file.clone_from(&callee.source_file);
        self.destination = self.destination.min(callee.address);
        self.source_line = caller.line;
        self.source_position = caller.address;
        self.inclusive_cost += 1;
    }

    #[must_use]
    pub fn callee_source_file(&self) -> &SourceFileId {
        &self.callee_source_file
    }

    #[must_use]
    pub fn destination(&self) -> Address {
        self.destination
    }

    #[must_use]
    pub fn source_line(&self) -> LineNumber {
        self.source_line
    }

    #[must_use]
    pub fn source_position(&self) -> Address {
        self.source_position
    }

    #[must_use]
    pub fn inclusive_cost(&self) -> u64 {
        self.inclusive_cost
    }
}

/// One named function within an object file
#[derive(Debug, Clone)]
pub struct Function {
    name: FunctionName,
    positions: BTreeMap<Position, u64>,
    calls: IndexMap<CalleeKey, CallEdge>,
}

impl Function {
    fn new(name: FunctionName) -> Self {
        Self { name, positions: BTreeMap::new(), calls: IndexMap::new() }
    }

    /// Count one executed instruction at `(address, line)`, creating the position on first use
    pub fn add_sample(&mut self, address: Address, line: LineNumber) {
        *self.positions.entry(Position { address, line }).or_insert(0) += 1;
    }

    /// Get the edge towards `callee`, creating it on first use.
    ///
    /// A new edge starts with zero cost, the callee's address as destination and
    /// the caller's address/line as call site; `CallEdge::attribute` does the counting.
    pub fn upsert_call(&mut self, callee: &FrameSnapshot, caller: &FrameSnapshot) -> &mut CallEdge {
        self.calls.entry(CalleeKey::from(callee)).or_insert_with(|| CallEdge::new(callee, caller))
    }

    #[must_use]
    pub fn name(&self) -> &FunctionName {
        &self.name
    }

    /// Positions in ascending `(address, line)` order
    pub fn positions(&self) -> impl Iterator<Item = (Position, u64)> + '_ {
        self.positions.iter().map(|(pos, count)| (*pos, *count))
    }

    /// Leaf count of a single position (0 if never sampled)
    #[must_use]
    pub fn position_count(&self, address: Address, line: LineNumber) -> u64 {
        self.positions.get(&Position { address, line }).copied().unwrap_or(0)
    }

    /// Outgoing call edges in first-seen order
    pub fn calls(&self) -> impl Iterator<Item = (&CalleeKey, &CallEdge)> {
        self.calls.iter()
    }

    /// Edge towards the given callee, if one was observed
    #[must_use]
    pub fn call_to(&self, object_file: &ObjectFileId, function: &FunctionName) -> Option<&CallEdge> {
        self.calls.get(&CalleeKey { object_file: object_file.clone(), function: function.clone() })
    }

    /// Exclusive cost: samples executing directly in this function
    #[must_use]
    pub fn self_cost(&self) -> u64 {
        self.positions.values().sum()
    }
}

/// One loaded object file paired with the source file its functions came from
#[derive(Debug, Clone)]
pub struct ObjectFile {
    object_file: ObjectFileId,
    source_file: SourceFileId,
    functions: IndexMap<FunctionName, Function>,
}

impl ObjectFile {
    fn new(object_file: ObjectFileId, source_file: SourceFileId) -> Self {
        Self { object_file, source_file, functions: IndexMap::new() }
    }

    /// Get the function named `name`, creating an empty one on first use
    pub fn upsert_function(&mut self, name: &FunctionName) -> &mut Function {
        self.functions.entry(name.clone()).or_insert_with(|| Function::new(name.clone()))
    }

    #[must_use]
    pub fn object_file(&self) -> &ObjectFileId {
        &self.object_file
    }

    #[must_use]
    pub fn source_file(&self) -> &SourceFileId {
        &self.source_file
    }

    /// Functions in first-seen order
    pub fn functions(&self) -> impl Iterator<Item = &Function> {
        self.functions.values()
    }
}

/// The whole profile of a session
#[derive(Debug, Clone, Default)]
pub struct CostModel {
    objects: IndexMap<ObjectKey, ObjectFile>,
    samples: u64,
}

impl CostModel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one sampled instruction.
    ///
    /// The innermost frame gets one unit of leaf cost at its `(address, line)`.
    /// Then every caller pays one unit of inclusive cost on its edge towards the
    /// frame directly inside it, so each function on the stack is charged once
    /// per enclosing call.
    pub fn record(&mut self, chain: &FrameChain) {
        self.samples += 1;

        let leaf = chain.innermost();
        self.upsert_function(&CodeLocation::from(leaf)).add_sample(leaf.address, leaf.line);

        for (callee, caller) in chain.call_pairs() {
            self.upsert_function(&CodeLocation::from(caller))
                .upsert_call(callee, caller)
                .attribute(callee, caller);
        }
    }

    /// Get the object file entry for `(object_file, source_file)`, creating it on first use
    pub fn upsert_object(&mut self, object_file: &ObjectFileId, source_file: &SourceFileId) -> &mut ObjectFile {
        let key = ObjectKey { object_file: object_file.clone(), source_file: source_file.clone() };
        self.objects
            .entry(key)
            .or_insert_with(|| ObjectFile::new(object_file.clone(), source_file.clone()))
    }

    /// Get the function at `location`, creating its object file and itself on first use
    pub fn upsert_function(&mut self, location: &CodeLocation) -> &mut Function {
        self.upsert_object(&location.object_file, &location.source_file)
            .upsert_function(&location.function)
    }

    /// Look up a function without creating it
    #[must_use]
    pub fn function(&self, location: &CodeLocation) -> Option<&Function> {
        self.objects.get(&location.object_key())?.functions.get(&location.function)
    }

    /// Object files in first-seen order
    pub fn objects(&self) -> impl Iterator<Item = &ObjectFile> {
        self.objects.values()
    }

    /// Number of `record` calls
    #[must_use]
    pub fn sample_count(&self) -> u64 {
        self.samples
    }

    #[must_use]
    pub fn function_count(&self) -> usize {
        self.objects.values().map(|obj| obj.functions.len()).sum()
    }

    #[must_use]
    pub fn call_edge_count(&self) -> usize {
        self.objects.values().flat_map(|obj| obj.functions.values()).map(|f| f.calls.len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples == 0
    }
}
