//! Stack trace resolution for a stopped thread
//!
//! Turns the registers of the traced thread into the frame list consumed by
//! the profiling session:
//!
//! ```text
//! registers ──► module of pc ──► symbolize ──► .eh_frame rule ──► caller registers
//!                   ▲                                                   │
//!                   └─────────────────── ra - 1 ◄──────────────────────┘
//! ```
//!
//! The walk stops at the first frame outside any known object, without a
//! symbol, or without unwind information.

use log::{debug, warn};

use crate::domain::{Address, ObjectFileId, Pid, TargetError};
use crate::model::UnwoundFrame;
use crate::session::{LocationResolver, SampleStepper};
use crate::symbolization::{ModuleMap, ReadMemory, Registers};

/// Upper bound on unwound frames, guards against corrupted stacks
pub const MAX_DEPTH: usize = 512;

/// A stopped thread whose registers and memory can be inspected
pub trait Tracee: ReadMemory {
    fn pid(&self) -> Pid;

    /// Current program counter and general purpose registers
    ///
    /// # Errors
    /// Returns an error if the registers cannot be read
    fn registers(&self) -> Result<Registers, TargetError>;

    /// Execute exactly one instruction
    ///
    /// # Errors
    /// Returns an error if the thread terminated or crashed
    fn single_step(&mut self) -> Result<(), TargetError>;
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
impl Tracee for super::Inferior {
    fn pid(&self) -> Pid {
        Self::pid(self)
    }

    fn registers(&self) -> Result<Registers, TargetError> {
        Self::registers(self)
    }

    fn single_step(&mut self) -> Result<(), TargetError> {
        Self::single_step(self)
    }
}

/// Stack trace resolver over a traced thread and the objects mapped in its process
pub struct StackResolver<T> {
    tracee: T,
    modules: ModuleMap,
    max_depth: usize,
    /// The depth warning is logged once per session
    warned_truncated: bool,
}

impl<T: Tracee> StackResolver<T> {
    /// Create a new stack resolver for `tracee`
    ///
    /// # Errors
    /// Returns an error if the process's memory maps cannot be read
    pub fn new(tracee: T) -> Result<Self, TargetError> {
        let modules = ModuleMap::new(tracee.pid())?;
        Ok(Self::with_modules(tracee, modules))
    }

    #[must_use]
    pub fn with_modules(tracee: T, modules: ModuleMap) -> Self {
        Self { tracee, modules, max_depth: MAX_DEPTH, warned_truncated: false }
    }

    #[must_use]
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth.max(1);
        self
    }

    pub fn tracee(&self) -> &T {
        &self.tracee
    }

    pub fn tracee_mut(&mut self) -> &mut T {
        &mut self.tracee
    }

    /// Object file of the main executable, as frames inside it report it
    ///
    /// # Errors
    /// Returns `SymbolizationFailed` if the executable cannot be loaded
    pub fn executable_object(&mut self) -> Result<ObjectFileId, TargetError> {
        self.modules.executable().map(|exe| exe.path().clone()).ok_or_else(|| {
            TargetError::SymbolizationFailed {
                path: format!("/proc/{}/exe", self.tracee.pid().0),
                reason: "main executable is not mapped".to_string(),
            }
        })
    }

    /// The instruction the tracee is stopped at, with its object file,
    /// function and source line
    ///
    /// # Errors
    /// Returns an error if the registers cannot be read
    pub fn current_location(&mut self) -> Result<String, TargetError> {
        let pc = self.tracee.registers()?.pc;
        Ok(match self.modules.lookup(pc) {
            Some(module) => {
                let resolved = module.symbolizer().resolve(module.to_link_time(pc));
                format!("{}\n{}", module.path(), resolved.format(0))
            }
            None => format!("0x{pc:x} outside any mapped object"),
        })
    }

    /// Runtime address of `start`: a function symbol, or a link-time
    /// address in the main executable
    ///
    /// # Errors
    /// Returns `SymbolNotFound` if the symbol is in no mapped object
    pub fn runtime_address(&mut self, start: &StartPoint) -> Result<u64, TargetError> {
        match start {
            StartPoint::Symbol(name) => {
                self.modules.find_symbol(name).ok_or_else(|| TargetError::SymbolNotFound(name.clone()))
            }
            StartPoint::Address(addr) => {
                let exe = self
                    .modules
                    .executable()
                    .ok_or_else(|| TargetError::SymbolNotFound(addr.to_string()))?;
                Ok(exe.to_runtime(addr.0))
            }
        }
    }

    fn walk(&mut self, mut regs: Registers) -> Vec<UnwoundFrame> {
        let mut frames = Vec::new();
        // The innermost frame is described by its pc, callers by their call instruction
        let mut lookup = regs.pc;

        loop {
            let Some(module) = self.modules.lookup(lookup) else {
                frames.push(UnwoundFrame::Unresolved { address: Address(regs.pc) });
                break;
            };
            let Some(frame) = module.snapshot(regs.pc, lookup) else {
                frames.push(UnwoundFrame::Unresolved { address: Address(module.to_link_time(regs.pc)) });
                break;
            };
            frames.push(UnwoundFrame::Resolved(frame));

            if frames.len() >= self.max_depth {
                if !self.warned_truncated {
                    warn!("Call stack deeper than {} frames, outer frames are dropped", self.max_depth);
                    self.warned_truncated = true;
                }
                break;
            }

            let Some(rule) = module.cfi().and_then(|cfi| cfi.frame_rule(module.to_link_time(lookup))) else {
                debug!("No unwind info at 0x{lookup:x} in {}", module.path());
                break;
            };
            let caller = match rule.apply(&regs, &self.tracee) {
                Ok(Some(caller)) => caller,
                Ok(None) => break,
                Err(e) => {
                    debug!("Unwinding stopped: {e}");
                    break;
                }
            };

            // The stack grows down, so callers live at higher addresses
            if caller.pc == 0 || caller.sp() <= regs.sp() {
                break;
            }
            regs = caller;
            lookup = Address(caller.pc).call_site().0;
        }

        frames
    }
}

impl<T: Tracee> LocationResolver for StackResolver<T> {
    fn unwind(&mut self) -> Result<Vec<UnwoundFrame>, TargetError> {
        let regs = self.tracee.registers()?;
        Ok(self.walk(regs))
    }
}

impl<T: Tracee> SampleStepper for StackResolver<T> {
    fn step(&mut self) -> Result<(), TargetError> {
        self.tracee.single_step()
    }
}

/// Where sampling begins
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartPoint {
    Symbol(String),
    /// Link-time address in the main executable
    Address(Address),
}
