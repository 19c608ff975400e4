//! End-to-end sessions against a scripted target, checked on the written file

use callstep::domain::{Address, Pid, SessionError, TargetError};
use callstep::export::ProfileWriter;
use callstep::model::{FrameSnapshot, UnwoundFrame};
use callstep::session::{LocationResolver, ProfileSession, SampleStepper, SessionConfig, StopPoint};
use std::collections::VecDeque;

/// Replays one stack per instruction; stepping past the last one fails
struct ScriptedTarget {
    stacks: VecDeque<Vec<UnwoundFrame>>,
    fail_step_at: Option<usize>,
    steps: usize,
}

impl ScriptedTarget {
    fn new(stacks: Vec<Vec<FrameSnapshot>>) -> Self {
        Self {
            stacks: stacks.into_iter().map(|s| s.into_iter().map(UnwoundFrame::Resolved).collect()).collect(),
            fail_step_at: None,
            steps: 0,
        }
    }

    fn failing_at(mut self, step: usize) -> Self {
        self.fail_step_at = Some(step);
        self
    }
}

impl LocationResolver for ScriptedTarget {
    fn unwind(&mut self) -> Result<Vec<UnwoundFrame>, TargetError> {
        Ok(self.stacks.front().cloned().unwrap_or_default())
    }
}

impl SampleStepper for ScriptedTarget {
    fn step(&mut self) -> Result<(), TargetError> {
        if self.fail_step_at == Some(self.steps) || self.stacks.len() <= 1 {
            return Err(TargetError::Exited { pid: Pid(7), code: 1 });
        }
        self.stacks.pop_front();
        self.steps += 1;
        Ok(())
    }
}

fn main_at(addr: u64, line: u32) -> FrameSnapshot {
    FrameSnapshot::new(addr, line, "main", "/bin/app", "app.c")
}

fn helper_at(addr: u64, line: u32) -> FrameSnapshot {
    FrameSnapshot::new(addr, line, "helper", "/bin/app", "helper.c")
}

fn stop_in_app(addr: u64) -> SessionConfig {
    SessionConfig::new(StopPoint::new("/bin/app", Address(addr)))
}

const HEADER: &str = "# callgrind format\nversion: 1\ncreator: callstep\npositions: instr line\nevents: Instructions\n\n";

#[test]
fn test_straight_line_profile() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("callgrind.out");

    let target = ScriptedTarget::new(vec![
        vec![main_at(0x100, 10)],
        vec![main_at(0x104, 11)],
        vec![main_at(0x108, 12)],
    ]);
    let model = ProfileSession::new(target, stop_in_app(0x108))
        .run_to_file(&ProfileWriter::default(), &path)
        .unwrap();
    assert_eq!(model.sample_count(), 3);

    let written = std::fs::read_to_string(&path).unwrap();
    let expected = format!(
        "{HEADER}ob=/bin/app\nfl=app.c\nfn=main\n0x100 10 1\n0x104 11 1\n0x108 12 1\n\n\n"
    );
    assert_eq!(written, expected);
}

#[test]
fn test_call_into_helper_profile() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("callgrind.out");

    // main calls helper at 0x101, which returns to 0x105
    let target = ScriptedTarget::new(vec![
        vec![main_at(0x100, 10)],
        vec![helper_at(0x200, 20), main_at(0x105, 11)],
        vec![helper_at(0x204, 21), main_at(0x105, 11)],
        vec![main_at(0x105, 11)],
    ]);
    ProfileSession::new(target, stop_in_app(0x105))
        .run_to_file(&ProfileWriter::default(), &path)
        .unwrap();

    let written = std::fs::read_to_string(&path).unwrap();
    let expected = format!(
        "{HEADER}\
         ob=/bin/app\nfl=app.c\nfn=main\n0x100 10 1\n0x105 11 1\n\n\
         cfi=helper.c\ncfn=helper\ncob=/bin/app\ncalls=1 0x200\n0x105 11 2\n\n\
         ob=/bin/app\nfl=helper.c\nfn=helper\n0x200 20 1\n0x204 21 1\n\n\n"
    );
    assert_eq!(written, expected);
}

#[test]
fn test_nested_calls_charge_every_caller() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("callgrind.out");

    let leaf = |addr: u64| FrameSnapshot::new(addr, 30, "leaf", "/lib/libleaf.so", "leaf.c");
    let target = ScriptedTarget::new(vec![
        vec![leaf(0x3000), helper_at(0x210, 22), main_at(0x105, 11)],
        vec![leaf(0x3004), helper_at(0x210, 22), main_at(0x105, 11)],
        vec![helper_at(0x210, 22), main_at(0x105, 11)],
    ]);
    let model = ProfileSession::new(target, stop_in_app(0x210))
        .run_to_file(&ProfileWriter::new("tests"), &path)
        .unwrap();
    assert_eq!(model.call_edge_count(), 2);

    let written = std::fs::read_to_string(&path).unwrap();
    assert!(written.contains("creator: tests\n"));
    // helper → leaf: two samples inside leaf
    assert!(written.contains("cfi=leaf.c\ncfn=leaf\ncob=/lib/libleaf.so\ncalls=1 0x3000\n0x210 22 2\n"));
    // main → helper: all three samples happened inside helper's call
    assert!(written.contains("cfi=helper.c\ncfn=helper\ncob=/bin/app\ncalls=1 0x210\n0x105 11 3\n"));
}

#[test]
fn test_step_failure_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("callgrind.out");

    let target = ScriptedTarget::new(vec![
        vec![main_at(0x100, 10)],
        vec![main_at(0x104, 11)],
        vec![main_at(0x108, 12)],
    ])
    .failing_at(1);
    let err = ProfileSession::new(target, stop_in_app(0x108))
        .run_to_file(&ProfileWriter::default(), &path)
        .unwrap_err();

    assert!(matches!(err, SessionError::Step(TargetError::Exited { code: 1, .. })));
    assert!(!path.exists());
}

#[test]
fn test_failure_keeps_existing_destination() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("callgrind.out");
    std::fs::write(&path, "previous profile").unwrap();

    let target = ScriptedTarget::new(vec![vec![main_at(0x100, 10)]]);
    let err = ProfileSession::new(target, stop_in_app(0x999))
        .run_to_file(&ProfileWriter::default(), &path)
        .unwrap_err();

    assert!(matches!(err, SessionError::Step(_)));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "previous profile");
}

#[test]
fn test_step_limit_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("callgrind.out");

    let stacks = (0..100).map(|i| vec![main_at(0x100 + i * 4, 10)]).collect();
    let err = ProfileSession::new(
        ScriptedTarget::new(stacks),
        stop_in_app(0xffff).with_max_steps(Some(10)),
    )
    .run_to_file(&ProfileWriter::default(), &path)
    .unwrap_err();

    assert!(matches!(err, SessionError::StepLimitReached { steps: 10 }));
    assert!(!path.exists());
}

#[test]
fn test_same_address_in_dynamic_linker_does_not_end_profile() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("callgrind.out");

    let resolver = FrameSnapshot::new(0x1189, 0, "_dl_runtime_resolve", "/lib64/ld-linux-x86-64.so.2", "???");
    let target = ScriptedTarget::new(vec![
        vec![main_at(0x1180, 10)],
        vec![resolver, main_at(0x1185, 11)],
        vec![main_at(0x1189, 12)],
    ]);
    let model = ProfileSession::new(target, stop_in_app(0x1189))
        .run_to_file(&ProfileWriter::default(), &path)
        .unwrap();
    assert_eq!(model.sample_count(), 3);

    let written = std::fs::read_to_string(&path).unwrap();
    assert!(written.contains("ob=/lib64/ld-linux-x86-64.so.2
fl=???
fn=_dl_runtime_resolve
0x1189 0 1
"));
    assert!(written.contains("0x1189 12 1
"));
}
