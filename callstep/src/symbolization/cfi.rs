//! Call frame information (`.eh_frame`) based unwinding for x86_64 objects.
//!
//! Frame pointers are not reliable in optimized code, so each caller frame is
//! recovered from the unwind tables the compiler emits for exception handling:
//!
//! ```text
//! CFA          = reg + offset | DWARF expression   (value of rsp before the call)
//! return addr  = *(CFA + ra_offset)
//! saved reg    = *(CFA + offset) | CFA + offset | other reg | expression
//! caller rsp   = CFA
//! ```
//!
//! Any general purpose register may serve as the CFA base. `.plt` stubs and
//! glibc's lazy binding trampolines need that, the former through a small
//! DWARF expression over `rsp` and `rip`, the latter through `rbx`.

use gimli::{
    BaseAddresses, CfaRule, EhFrame, Encoding, EndianRcSlice, EvaluationResult, Expression, Format,
    Register, RegisterRule, RunTimeEndian, UnwindContext, UnwindSection, Value, X86_64,
};
use object::{Object, ObjectSection};
use std::cell::RefCell;
use std::rc::Rc;

use crate::domain::TargetError;

type Reader = EndianRcSlice<RunTimeEndian>;

/// rax..r15 in DWARF numbering
const GPR_COUNT: usize = 16;

/// Bound on DWARF operations per expression, guards against looping bytecode
const MAX_EXPRESSION_OPS: u32 = 64;

/// Program counter and general purpose registers of an x86_64 thread.
///
/// Registers are indexed by their DWARF number: rax, rdx, rcx, rbx, rsi,
/// rdi, rbp, rsp, r8..r15.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registers {
    pub pc: u64,
    gpr: [u64; GPR_COUNT],
}

impl Registers {
    /// Registers with only pc, rsp and rbp known; the others read as zero
    #[must_use]
    pub fn new(pc: u64, sp: u64, fp: u64) -> Self {
        Self::from_gprs(pc, [0; GPR_COUNT]).with(X86_64::RSP, sp).with(X86_64::RBP, fp)
    }

    /// Registers from a full general purpose register file in DWARF order
    #[must_use]
    pub fn from_gprs(pc: u64, gpr: [u64; GPR_COUNT]) -> Self {
        Self { pc, gpr }
    }

    #[must_use]
    pub fn sp(&self) -> u64 {
        self.gpr[usize::from(X86_64::RSP.0)]
    }

    #[must_use]
    pub fn fp(&self) -> u64 {
        self.gpr[usize::from(X86_64::RBP.0)]
    }

    /// Value of a DWARF register; the return address column reads as the pc
    #[must_use]
    pub fn get(&self, register: Register) -> Option<u64> {
        if register == X86_64::RA {
            return Some(self.pc);
        }
        self.gpr.get(usize::from(register.0)).copied()
    }

    /// Copy with `register` set to `value`. Registers outside the general
    /// purpose set are ignored.
    #[must_use]
    pub fn with(mut self, register: Register, value: u64) -> Self {
        if register == X86_64::RA {
            self.pc = value;
        } else if let Some(slot) = self.gpr.get_mut(usize::from(register.0)) {
            *slot = value;
        }
        self
    }
}

/// Read access to the traced process's memory
pub trait ReadMemory {
    /// Read a native-endian `u64` at a runtime address
    ///
    /// # Errors
    /// Returns an error if the address is not readable
    fn read_u64(&self, address: u64) -> Result<u64, TargetError>;
}

/// How the CFA of a frame is computed
#[derive(Debug, Clone)]
pub enum Cfa {
    RegisterOffset { register: Register, offset: i64 },
    Expression(Expression<Reader>),
}

/// Where a register of the caller can be found
#[derive(Debug, Clone)]
pub enum SavedRegister {
    /// Stored in memory at `CFA + offset`
    AtCfaOffset(i64),
    /// Equals `CFA + offset`
    CfaOffset(i64),
    /// Held in another register of this frame
    InRegister(Register),
    /// Stored in memory at the address an expression computes
    AtExpression(Expression<Reader>),
    /// Equals the value an expression computes
    Expression(Expression<Reader>),
    /// Not modified by this frame
    Unchanged,
    /// No value: this is the outermost frame
    Undefined,
}

/// Unwind row for one instruction address
#[derive(Debug, Clone)]
pub struct FrameRule {
    pub cfa: Cfa,
    pub return_address: SavedRegister,
    /// Rules for general purpose registers; registers without one are unchanged
    pub saved: Vec<(Register, SavedRegister)>,
}

impl FrameRule {
    /// Rule with a register based CFA and no saved registers besides the return address
    #[must_use]
    pub fn new(cfa_register: Register, cfa_offset: i64, return_address: SavedRegister) -> Self {
        Self {
            cfa: Cfa::RegisterOffset { register: cfa_register, offset: cfa_offset },
            return_address,
            saved: Vec::new(),
        }
    }

    #[must_use]
    pub fn saving(mut self, register: Register, rule: SavedRegister) -> Self {
        self.saved.push((register, rule));
        self
    }

    /// Recover the caller's registers from `regs`.
    ///
    /// Returns `Ok(None)` when there is no caller (undefined return address).
    ///
    /// # Errors
    /// Returns an error if saved registers cannot be read from the stack or an
    /// expression cannot be evaluated
    pub fn apply(&self, regs: &Registers, memory: &impl ReadMemory) -> Result<Option<Registers>, TargetError> {
        let cfa = match &self.cfa {
            Cfa::RegisterOffset { register, offset } => register_value(regs, *register)?.wrapping_add_signed(*offset),
            Cfa::Expression(expr) => evaluate(expr, regs, memory, None)?,
        };

        let restore = |rule: &SavedRegister| -> Result<Option<u64>, TargetError> {
            Ok(match rule {
                SavedRegister::AtCfaOffset(offset) => Some(memory.read_u64(cfa.wrapping_add_signed(*offset))?),
                SavedRegister::CfaOffset(offset) => Some(cfa.wrapping_add_signed(*offset)),
                SavedRegister::InRegister(register) => Some(register_value(regs, *register)?),
                SavedRegister::AtExpression(expr) => Some(memory.read_u64(evaluate(expr, regs, memory, Some(cfa))?)?),
                SavedRegister::Expression(expr) => Some(evaluate(expr, regs, memory, Some(cfa))?),
                SavedRegister::Unchanged | SavedRegister::Undefined => None,
            })
        };

        if matches!(self.return_address, SavedRegister::Undefined) {
            return Ok(None);
        }
        let pc = restore(&self.return_address)?.unwrap_or(regs.pc);

        // Every rule reads the callee's registers, so restore into a copy
        let mut caller = regs.with(X86_64::RSP, cfa);
        for (register, rule) in &self.saved {
            if let Some(value) = restore(rule)? {
                caller = caller.with(*register, value);
            }
        }
        caller.pc = pc;

        Ok(Some(caller))
    }
}

fn register_value(regs: &Registers, register: Register) -> Result<u64, TargetError> {
    regs.get(register).ok_or_else(|| TargetError::UnwindExpression {
        address: regs.pc,
        reason: format!("register {} is not tracked", register.0),
    })
}

/// Evaluate a CFI expression against the callee's registers.
///
/// Register rule expressions start with the CFA pushed on the stack.
fn evaluate(
    expr: &Expression<Reader>,
    regs: &Registers,
    memory: &impl ReadMemory,
    initial: Option<u64>,
) -> Result<u64, TargetError> {
    let failed = |reason: String| TargetError::UnwindExpression { address: regs.pc, reason };
    let encoding = Encoding { address_size: 8, format: Format::Dwarf32, version: 4 };

    let mut eval = expr.clone().evaluation(encoding);
    eval.set_max_iterations(MAX_EXPRESSION_OPS);
    if let Some(value) = initial {
        eval.set_initial_value(value);
    }

    let mut result = eval.evaluate().map_err(|e| failed(e.to_string()))?;
    loop {
        result = match result {
            EvaluationResult::Complete => break,
            EvaluationResult::RequiresRegister { register, .. } => {
                let value = register_value(regs, register)?;
                eval.resume_with_register(Value::Generic(value))
            }
            EvaluationResult::RequiresMemory { address, size, .. } => {
                let word = memory.read_u64(address)?;
                let value = if size >= 8 { word } else { word & ((1u64 << (u32::from(size) * 8)) - 1) };
                eval.resume_with_memory(Value::Generic(value))
            }
            other => return Err(failed(format!("unsupported operation {other:?}"))),
        }
        .map_err(|e| failed(e.to_string()))?;
    }

    eval.value_result()
        .and_then(|value| value.to_u64(u64::MAX).ok())
        .ok_or_else(|| failed("expression has no value".to_string()))
}

/// `.eh_frame` of one object file, queried with link-time addresses
pub struct CfiTable {
    eh_frame: EhFrame<Reader>,
    bases: BaseAddresses,
    ctx: RefCell<UnwindContext<usize>>,
}

impl CfiTable {
    /// Load the unwind table of an object, if it has one
    #[must_use]
    pub fn from_object(obj_file: &object::File<'_>) -> Option<Self> {
        let endian =
            if obj_file.is_little_endian() { RunTimeEndian::Little } else { RunTimeEndian::Big };

        let section = obj_file.section_by_name(".eh_frame")?;
        let data = section.uncompressed_data().ok()?;
        let mut eh_frame = EhFrame::from(EndianRcSlice::new(Rc::from(&*data), endian));
        eh_frame.set_address_size(if obj_file.is_64() { 8 } else { 4 });

        let mut bases = BaseAddresses::default().set_eh_frame(section.address());
        if let Some(hdr) = obj_file.section_by_name(".eh_frame_hdr") {
            bases = bases.set_eh_frame_hdr(hdr.address());
        }
        if let Some(text) = obj_file.section_by_name(".text") {
            bases = bases.set_text(text.address());
        }
        if let Some(got) = obj_file.section_by_name(".got") {
            bases = bases.set_got(got.address());
        }

        Some(Self { eh_frame, bases, ctx: RefCell::new(UnwindContext::new()) })
    }

    /// Unwind rule for the instruction at link-time address `addr`
    #[must_use]
    pub fn frame_rule(&self, addr: u64) -> Option<FrameRule> {
        let mut ctx = self.ctx.borrow_mut();
        let row = self
            .eh_frame
            .unwind_info_for_address(&self.bases, &mut *ctx, addr, EhFrame::cie_from_offset)
            .ok()?;

        let cfa = match row.cfa() {
            CfaRule::RegisterAndOffset { register, offset } => {
                Cfa::RegisterOffset { register: *register, offset: *offset }
            }
            CfaRule::Expression(expr) => Cfa::Expression(expr.get(&self.eh_frame).ok()?),
        };

        let saved = row
            .registers()
            .filter(|(register, _)| usize::from(register.0) < GPR_COUNT)
            .filter_map(|(register, rule)| Some((*register, self.saved_register(rule)?)))
            .collect();

        Some(FrameRule { cfa, return_address: self.saved_register(&row.register(X86_64::RA))?, saved })
    }

    fn saved_register(&self, rule: &RegisterRule<usize>) -> Option<SavedRegister> {
        match rule {
            RegisterRule::Offset(offset) => Some(SavedRegister::AtCfaOffset(*offset)),
            RegisterRule::ValOffset(offset) => Some(SavedRegister::CfaOffset(*offset)),
            RegisterRule::Register(register) => Some(SavedRegister::InRegister(*register)),
            RegisterRule::Expression(expr) => Some(SavedRegister::AtExpression(expr.get(&self.eh_frame).ok()?)),
            RegisterRule::ValExpression(expr) => Some(SavedRegister::Expression(expr.get(&self.eh_frame).ok()?)),
            RegisterRule::SameValue => Some(SavedRegister::Unchanged),
            RegisterRule::Undefined => Some(SavedRegister::Undefined),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FakeStack(HashMap<u64, u64>);

    impl ReadMemory for FakeStack {
        fn read_u64(&self, address: u64) -> Result<u64, TargetError> {
            self.0.get(&address).copied().ok_or(TargetError::Memory {
                pid: crate::domain::Pid(0),
                address,
                source: std::io::Error::from(std::io::ErrorKind::UnexpectedEof),
            })
        }
    }

    fn expression(bytes: &[u8]) -> Expression<Reader> {
        Expression(EndianRcSlice::new(Rc::from(bytes), RunTimeEndian::Little))
    }

    /// CFA expression ld emits for classic `.plt` entries:
    /// `rsp + 8 + ((rip & 15) >= 11 ? 8 : 0)`
    fn plt_cfa() -> Expression<Reader> {
        // breg7 8, breg16 0, lit15, and, lit11, ge, lit3, shl, plus
        expression(&[0x77, 0x08, 0x80, 0x00, 0x3f, 0x1a, 0x3b, 0x2a, 0x33, 0x24, 0x22])
    }

    #[test]
    fn test_apply_at_function_entry() {
        // Right after `call`: CFA = rsp + 8, return address at CFA - 8
        let rule = FrameRule::new(X86_64::RSP, 8, SavedRegister::AtCfaOffset(-8));
        let stack = FakeStack(HashMap::from([(0x7ff0, 0x40_1234)]));
        let regs = Registers::new(0x40_2000, 0x7ff0, 0x8000);

        let caller = rule.apply(&regs, &stack).unwrap().unwrap();
        assert_eq!(caller, Registers::new(0x40_1234, 0x7ff8, 0x8000));
    }

    #[test]
    fn test_apply_with_frame_pointer_based_cfa() {
        // After `push rbp; mov rbp, rsp`: CFA = rbp + 16, rbp saved at CFA - 16
        let rule = FrameRule::new(X86_64::RBP, 16, SavedRegister::AtCfaOffset(-8))
            .saving(X86_64::RBP, SavedRegister::AtCfaOffset(-16));
        let stack = FakeStack(HashMap::from([(0x7fe0, 0x9000), (0x7fe8, 0x40_1234)]));
        let regs = Registers::new(0x40_2010, 0x7f00, 0x7fe0);

        let caller = rule.apply(&regs, &stack).unwrap().unwrap();
        assert_eq!(caller, Registers::new(0x40_1234, 0x7ff0, 0x9000));
    }

    #[test]
    fn test_apply_with_rbx_based_cfa() {
        // Lazy binding trampoline: `push rbx; mov rbx, rsp; and rsp, -64`,
        // CFA = rbx + 24, rbx saved at CFA - 24
        let rule = FrameRule::new(X86_64::RBX, 24, SavedRegister::AtCfaOffset(-8))
            .saving(X86_64::RBX, SavedRegister::AtCfaOffset(-24));
        let stack = FakeStack(HashMap::from([(0x7fd0, 0x5555), (0x7fe0, 0x40_1234)]));
        let regs = Registers::new(0x7f00_0000_1000, 0x7f40, 0x8000).with(X86_64::RBX, 0x7fd0);

        let caller = rule.apply(&regs, &stack).unwrap().unwrap();
        assert_eq!(caller.pc, 0x40_1234);
        assert_eq!(caller.sp(), 0x7fe8);
        assert_eq!(caller.get(X86_64::RBX), Some(0x5555));
        assert_eq!(caller.fp(), 0x8000);
    }

    #[test]
    fn test_apply_with_plt_cfa_expression() {
        let stack = FakeStack(HashMap::from([(0x7ff0, 0x40_1111), (0x7ff8, 0x40_2222)]));
        let rule = FrameRule {
            cfa: Cfa::Expression(plt_cfa()),
            return_address: SavedRegister::AtCfaOffset(-8),
            saved: Vec::new(),
        };

        // First instruction of a stub: nothing pushed yet
        let caller = rule.apply(&Registers::new(0x1030, 0x7ff0, 0), &stack).unwrap().unwrap();
        assert_eq!((caller.pc, caller.sp()), (0x40_1111, 0x7ff8));

        // After `push $index` at offset 11 of the entry
        let caller = rule.apply(&Registers::new(0x103b, 0x7fe8, 0), &stack).unwrap().unwrap();
        assert_eq!((caller.pc, caller.sp()), (0x40_1111, 0x7ff8));
    }

    #[test]
    fn test_apply_register_rules_read_callee_values() {
        // rbx moved into r12 and r12 saved on the stack in the same frame
        let rule = FrameRule::new(X86_64::RSP, 16, SavedRegister::AtCfaOffset(-8))
            .saving(X86_64::RBX, SavedRegister::InRegister(X86_64::R12))
            .saving(X86_64::R12, SavedRegister::AtCfaOffset(-16));
        let stack = FakeStack(HashMap::from([(0x7ff0, 0xaaaa), (0x7ff8, 0x40_1234)]));
        let regs = Registers::new(0x40_2000, 0x7ff0, 0).with(X86_64::R12, 0xbbbb);

        let caller = rule.apply(&regs, &stack).unwrap().unwrap();
        assert_eq!(caller.get(X86_64::RBX), Some(0xbbbb));
        assert_eq!(caller.get(X86_64::R12), Some(0xaaaa));
    }

    #[test]
    fn test_apply_stops_at_undefined_return_address() {
        let rule = FrameRule::new(X86_64::RSP, 8, SavedRegister::Undefined);
        let regs = Registers::new(0x1000, 0x7ff0, 0);
        assert_eq!(rule.apply(&regs, &FakeStack(HashMap::new())).unwrap(), None);
    }

    #[test]
    fn test_apply_reports_unreadable_stack() {
        let rule = FrameRule::new(X86_64::RSP, 8, SavedRegister::AtCfaOffset(-8));
        let regs = Registers::new(0x1000, 0x7ff0, 0);
        assert!(rule.apply(&regs, &FakeStack(HashMap::new())).is_err());
    }

    #[test]
    fn test_apply_rejects_untracked_cfa_register() {
        // xmm0 is not a general purpose register
        let rule = FrameRule::new(Register(17), 8, SavedRegister::AtCfaOffset(-8));
        let regs = Registers::new(0x1000, 0x7ff0, 0);
        let err = rule.apply(&regs, &FakeStack(HashMap::new())).unwrap_err();
        assert!(matches!(err, TargetError::UnwindExpression { address: 0x1000, .. }));
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_frame_rule_at_entry_of_own_function() {
        let exe = std::env::current_exe().unwrap();
        let data = std::fs::read(&exe).unwrap();
        let obj = object::File::parse(&*data).unwrap();
        let symbolizer = crate::symbolization::Symbolizer::from_object(&obj).unwrap();
        let table = CfiTable::from_object(&obj).expect("test binary has .eh_frame");

        let entry = symbolizer.find_symbol("main").expect("test binary has a main symbol");
        let rule = table.frame_rule(entry).expect("main has an FDE");

        assert!(matches!(rule.cfa, Cfa::RegisterOffset { register: X86_64::RSP, offset: 8 }));
        assert!(matches!(rule.return_address, SavedRegister::AtCfaOffset(-8)));
    }
}
