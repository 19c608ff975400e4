//! # Profiling session
//!
//! Drives the sampling loop:
//!
//! ```text
//!        ┌──────────────────────────────────────────────┐
//!        ▼                                              │
//!   resolve chain ──► CostModel::record ──► at stop? ─┴─ no ──► step
//!                                              │
//!                                             yes
//!                                              ▼
//!                                     Done ──► ProfileWriter
//! ```
//!
//! The terminal instruction is recorded but never executed. Any resolver or
//! stepper failure aborts the loop, and nothing is written in that case.

use std::fmt;
use std::path::Path;

use log::{debug, info};

use crate::domain::{Address, ObjectFileId, SessionError, TargetError};
use crate::export::ProfileWriter;
use crate::model::{CostModel, FrameChain, FrameSnapshot, UnwoundFrame};

/// Log a progress line every this many samples
const PROGRESS_INTERVAL: u64 = 100_000;

/// Answers "where is the stopped thread, and how did it get there".
pub trait LocationResolver {
    /// Unwind the current stack, innermost frame first.
    ///
    /// Frames without function information are reported as
    /// `UnwoundFrame::Unresolved`; the session decides how far to trust the chain.
    ///
    /// # Errors
    /// Returns an error if the thread state cannot be read at all
    fn unwind(&mut self) -> Result<Vec<UnwoundFrame>, TargetError>;
}

/// Advances the traced thread.
pub trait SampleStepper {
    /// Execute exactly one instruction.
    ///
    /// # Errors
    /// Returns an error if the process exited, was killed or crashed
    fn step(&mut self) -> Result<(), TargetError>;
}

/// Sampling loop state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Running,
    Done,
}

/// The instruction that ends sampling.
///
/// Link-time addresses overlap between objects (a PIE executable and `ld.so`
/// both have code near 0x1000), so the address is qualified by its object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopPoint {
    pub object_file: ObjectFileId,
    pub address: Address,
}

impl StopPoint {
    #[must_use]
    pub fn new(object_file: impl Into<ObjectFileId>, address: Address) -> Self {
        Self { object_file: object_file.into(), address }
    }

    /// Whether `frame` is executing the stop instruction
    #[must_use]
    pub fn matches(&self, frame: &FrameSnapshot) -> bool {
        frame.address == self.address && frame.object_file == self.object_file
    }
}

impl fmt::Display for StopPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in {}", self.address, self.object_file)
    }
}

/// Session parameters
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Sampling ends once this is the executing instruction
    pub stop: StopPoint,
    /// Abort after this many steps without reaching `stop`
    pub max_steps: Option<u64>,
}

impl SessionConfig {
    #[must_use]
    pub fn new(stop: StopPoint) -> Self {
        Self { stop, max_steps: None }
    }

    #[must_use]
    pub fn with_max_steps(mut self, max_steps: Option<u64>) -> Self {
        self.max_steps = max_steps;
        self
    }
}

/// Owns the cost model and the target for the duration of one profile
pub struct ProfileSession<T> {
    target: T,
    config: SessionConfig,
    model: CostModel,
    state: SessionState,
    steps: u64,
}

impl<T: LocationResolver + SampleStepper> ProfileSession<T> {
    pub fn new(target: T, config: SessionConfig) -> Self {
        Self { target, config, model: CostModel::new(), state: SessionState::Running, steps: 0 }
    }

    /// Take one sample and, unless it was the stop address, advance one instruction.
    ///
    /// Calling this once `Done` is a no-op.
    ///
    /// # Errors
    /// - `UnresolvableFrame` / `EmptyStack` if the executing frame has no function
    /// - `Resolve` / `Step` if the target fails
    /// - `StepLimitReached` once `max_steps` instructions were executed
    pub fn sample(&mut self) -> Result<SessionState, SessionError> {
        if self.state == SessionState::Done {
            return Ok(SessionState::Done);
        }

        let frames = self.target.unwind().map_err(SessionError::Resolve)?;
        let chain = FrameChain::from_unwound(frames)?;
        self.model.record(&chain);

        if self.config.stop.matches(chain.innermost()) {
            info!("Reached stop address {} after {} steps", self.config.stop, self.steps);
            self.state = SessionState::Done;
            return Ok(self.state);
        }

        if let Some(limit) = self.config.max_steps {
            if self.steps >= limit {
                return Err(SessionError::StepLimitReached { steps: self.steps });
            }
        }

        self.target.step().map_err(SessionError::Step)?;
        self.steps += 1;

        if self.steps % PROGRESS_INTERVAL == 0 {
            debug!(
                "{} steps, {} functions, {} call edges, depth {}",
                self.steps,
                self.model.function_count(),
                self.model.call_edge_count(),
                chain.depth()
            );
        }

        Ok(self.state)
    }

    /// Sample until the stop address is reached.
    ///
    /// # Errors
    /// Propagates the first error from [`Self::sample`]
    pub fn run(mut self) -> Result<CostModel, SessionError> {
        while self.sample()? == SessionState::Running {}
        Ok(self.model)
    }

    /// Sample until the stop address is reached, then write the profile to `path`.
    ///
    /// Nothing is written if sampling fails.
    ///
    /// # Errors
    /// Propagates sampling errors, or `OutputWrite` if the profile cannot be written
    pub fn run_to_file(self, writer: &ProfileWriter, path: &Path) -> Result<CostModel, SessionError> {
        let model = self.run()?;
        writer.write_file(&model, path)?;
        Ok(model)
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Instructions executed so far
    #[must_use]
    pub fn steps(&self) -> u64 {
        self.steps
    }

    #[must_use]
    pub fn model(&self) -> &CostModel {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Pid;
    use std::collections::VecDeque;

    /// Replays a fixed list of stacks, one per instruction
    struct Script {
        stacks: VecDeque<Vec<UnwoundFrame>>,
        steps: usize,
    }

    impl Script {
        fn new(stacks: Vec<Vec<UnwoundFrame>>) -> Self {
            Self { stacks: stacks.into(), steps: 0 }
        }
    }

    impl LocationResolver for Script {
        fn unwind(&mut self) -> Result<Vec<UnwoundFrame>, TargetError> {
            Ok(self.stacks.front().cloned().unwrap_or_default())
        }
    }

    impl SampleStepper for Script {
        fn step(&mut self) -> Result<(), TargetError> {
            self.stacks.pop_front();
            if self.stacks.is_empty() {
                return Err(TargetError::Exited { pid: Pid(1), code: 0 });
            }
            self.steps += 1;
            Ok(())
        }
    }

    fn main_at(addr: u64) -> UnwoundFrame {
        UnwoundFrame::Resolved(FrameSnapshot::new(addr, 10, "main", "/bin/app", "app.c"))
    }

    fn stop_at(addr: u64) -> SessionConfig {
        SessionConfig::new(StopPoint::new("/bin/app", Address(addr)))
    }

    #[test]
    fn test_stops_without_stepping_past_stop_address() {
        let script = Script::new(vec![vec![main_at(0x100)], vec![main_at(0x104)], vec![main_at(0x108)]]);
        let mut session = ProfileSession::new(script, stop_at(0x104));

        assert_eq!(session.sample().unwrap(), SessionState::Running);
        assert_eq!(session.sample().unwrap(), SessionState::Done);
        assert_eq!(session.steps(), 1);
        assert_eq!(session.model().sample_count(), 2);

        // Further calls do not touch the target
        assert_eq!(session.sample().unwrap(), SessionState::Done);
        assert_eq!(session.model().sample_count(), 2);
    }

    #[test]
    fn test_step_failure_aborts_session() {
        let script = Script::new(vec![vec![main_at(0x100)], vec![main_at(0x104)]]);
        let session = ProfileSession::new(script, stop_at(0x999));

        let err = session.run().unwrap_err();
        assert!(matches!(err, SessionError::Step(TargetError::Exited { .. })));
    }

    #[test]
    fn test_unresolved_innermost_frame_aborts_session() {
        let script = Script::new(vec![
            vec![main_at(0x100)],
            vec![UnwoundFrame::Unresolved { address: Address(0x7000) }, main_at(0x104)],
            vec![main_at(0x108)],
        ]);
        let session = ProfileSession::new(script, stop_at(0x108));

        let err = session.run().unwrap_err();
        assert!(matches!(err, SessionError::UnresolvableFrame { address } if address == Address(0x7000)));
    }

    #[test]
    fn test_step_limit_aborts_session() {
        let stacks = (0..10).map(|i| vec![main_at(0x100 + i * 4)]).collect();
        let session = ProfileSession::new(
            Script::new(stacks),
            stop_at(0xffff).with_max_steps(Some(3)),
        );

        let err = session.run().unwrap_err();
        assert!(matches!(err, SessionError::StepLimitReached { steps: 3 }));
    }

    #[test]
    fn test_stop_address_on_first_sample() {
        let script = Script::new(vec![vec![main_at(0x100)]]);
        let model = ProfileSession::new(script, stop_at(0x100)).run().unwrap();
        assert_eq!(model.sample_count(), 1);
    }

    #[test]
    fn test_stop_address_in_another_object_does_not_stop() {
        // The dynamic linker has code at the same link-time offset as main
        let resolver_frame = UnwoundFrame::Resolved(FrameSnapshot::new(
            0x1189,
            0,
            "_dl_runtime_resolve",
            "/lib64/ld-linux-x86-64.so.2",
            "???",
        ));
        let script = Script::new(vec![
            vec![main_at(0x1180)],
            vec![resolver_frame, main_at(0x1185)],
            vec![main_at(0x1189)],
        ]);

        let model = ProfileSession::new(script, stop_at(0x1189)).run().unwrap();
        assert_eq!(model.sample_count(), 3);
    }

    #[test]
    fn test_stop_point_display() {
        let stop = StopPoint::new("/bin/app", Address(0x1189));
        assert_eq!(stop.to_string(), "0x1189 in /bin/app");
    }
}
