//! Frame snapshots and call chains fed into the cost model

use crate::domain::{Address, FunctionName, LineNumber, ObjectFileId, SessionError, SourceFileId};

/// One symbolized stack frame at the moment of a sample.
///
/// For the innermost frame `address` is the executing instruction; for
/// callers it is the return address (the instruction after the call).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSnapshot {
    pub address: Address,
    pub line: LineNumber,
    pub function: FunctionName,
    pub object_file: ObjectFileId,
    pub source_file: SourceFileId,
}

impl FrameSnapshot {
    pub fn new(
        address: impl Into<Address>,
        line: u32,
        function: impl Into<FunctionName>,
        object_file: impl Into<ObjectFileId>,
        source_file: impl Into<SourceFileId>,
    ) -> Self {
        Self {
            address: address.into(),
            line: LineNumber(line),
            function: function.into(),
            object_file: object_file.into(),
            source_file: source_file.into(),
        }
    }
}

/// A frame as reported by a `LocationResolver`, before truncation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnwoundFrame {
    Resolved(FrameSnapshot),
    /// No function information (unsymbolized code, stripped object, ...)
    Unresolved { address: Address },
}

/// Non-empty call chain, innermost frame first.
///
/// Every frame in the chain has function information; the chain ends right
/// before the first ancestor that could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameChain {
    frames: Vec<FrameSnapshot>,
}

impl FrameChain {
    /// Chain containing only the executing frame
    #[must_use]
    pub fn new(innermost: FrameSnapshot) -> Self {
        Self { frames: vec![innermost] }
    }

    /// Append the next caller outward
    #[must_use]
    pub fn with_caller(mut self, caller: FrameSnapshot) -> Self {
        self.frames.push(caller);
        self
    }

    /// Build a chain from raw unwinder output.
    ///
    /// # Errors
    /// - `EmptyStack` if no frame was reported
    /// - `UnresolvableFrame` if the innermost frame has no function information
    pub fn from_unwound(frames: impl IntoIterator<Item = UnwoundFrame>) -> Result<Self, SessionError> {
        let mut frames = frames.into_iter();
        let innermost = match frames.next() {
            Some(UnwoundFrame::Resolved(frame)) => frame,
            Some(UnwoundFrame::Unresolved { address }) => {
                return Err(SessionError::UnresolvableFrame { address })
            }
            None => return Err(SessionError::EmptyStack),
        };

        let mut chain = Self::new(innermost);
        for frame in frames {
            match frame {
                UnwoundFrame::Resolved(caller) => chain.frames.push(caller),
                UnwoundFrame::Unresolved { .. } => break,
            }
        }
        Ok(chain)
    }

    /// The executing frame
    #[must_use]
    pub fn innermost(&self) -> &FrameSnapshot {
        &self.frames[0]
    }

    /// Number of frames (always at least one)
    #[must_use]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Frames from innermost to outermost
    pub fn iter(&self) -> impl Iterator<Item = &FrameSnapshot> {
        self.frames.iter()
    }

    /// `(callee, caller)` pairs walking outward from the innermost frame
    pub fn call_pairs(&self) -> impl Iterator<Item = (&FrameSnapshot, &FrameSnapshot)> {
        self.frames.windows(2).map(|pair| (&pair[0], &pair[1]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(addr: u64, function: &str) -> FrameSnapshot {
        FrameSnapshot::new(addr, 1, function, "/bin/app", "app.c")
    }

    #[test]
    fn test_from_unwound_truncates_at_first_unresolved_ancestor() {
        let chain = FrameChain::from_unwound(vec![
            UnwoundFrame::Resolved(frame(0x10, "leaf")),
            UnwoundFrame::Resolved(frame(0x20, "mid")),
            UnwoundFrame::Unresolved { address: Address(0x30) },
            UnwoundFrame::Resolved(frame(0x40, "root")),
        ])
        .unwrap();

        let names: Vec<&str> = chain.iter().map(|f| f.function.as_str()).collect();
        assert_eq!(names, vec!["leaf", "mid"]);
    }

    #[test]
    fn test_from_unwound_rejects_unresolved_innermost() {
        let err = FrameChain::from_unwound(vec![
            UnwoundFrame::Unresolved { address: Address(0x99) },
            UnwoundFrame::Resolved(frame(0x20, "caller")),
        ])
        .unwrap_err();

        assert!(matches!(err, SessionError::UnresolvableFrame { address } if address == Address(0x99)));
    }

    #[test]
    fn test_from_unwound_rejects_empty_stack() {
        let err = FrameChain::from_unwound(Vec::new()).unwrap_err();
        assert!(matches!(err, SessionError::EmptyStack));
    }

    #[test]
    fn test_call_pairs_walk_outward() {
        let chain = FrameChain::new(frame(0x10, "c"))
            .with_caller(frame(0x20, "b"))
            .with_caller(frame(0x30, "a"));

        let pairs: Vec<(&str, &str)> = chain
            .call_pairs()
            .map(|(callee, caller)| (callee.function.as_str(), caller.function.as_str()))
            .collect();
        assert_eq!(pairs, vec![("c", "b"), ("b", "a")]);
        assert_eq!(chain.depth(), 3);
        assert_eq!(chain.innermost().function.as_str(), "c");
    }
}
