//! ptrace control of the traced process (Linux, x86_64)
//!
//! ```text
//!  spawn ──► stopped at exec ──► run_to(main) ──┐
//!                                               ├──► single_step ⟲ ──► drop: kill
//!  attach ──► stopped by SIGSTOP ───────────────┘                  ──► drop: detach
//! ```
//!
//! Only the thread identified by the pid is traced. Signals that arrive while
//! stepping are delivered to the process; signals that indicate a crash end
//! the session.

// ptrace and waitpid have no safe wrappers in the dependency stack
#![allow(unsafe_code)]

use log::{debug, info, warn};
use std::ffi::c_void;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::os::unix::process::CommandExt;
use std::process::Command;
use std::ptr;

use crate::domain::{Pid, TargetError};
use crate::symbolization::{ReadMemory, Registers};

#[cfg(target_env = "gnu")]
type Request = libc::c_uint;
#[cfg(not(target_env = "gnu"))]
type Request = libc::c_int;

const INT3: u8 = 0xcc;

/// How the process came under our control, which decides cleanup on drop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ownership {
    Spawned,
    Attached,
}

/// A stopped, ptrace-controlled process
pub struct Inferior {
    pid: Pid,
    mem: File,
    ownership: Ownership,
}

impl Inferior {
    /// Start `command` under ptrace, stopped right after `exec`
    ///
    /// # Errors
    /// Returns an error if the command cannot be started or traced
    pub fn spawn(command: &[String]) -> Result<Self, TargetError> {
        let (program, args) = command.split_first().ok_or_else(|| TargetError::SpawnFailed {
            command: String::new(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "empty command"),
        })?;

        let mut cmd = Command::new(program);
        cmd.args(args);
        // SAFETY: the hook only calls ptrace(2), which is async-signal-safe
        unsafe {
            cmd.pre_exec(|| {
                if libc::ptrace(libc::PTRACE_TRACEME, 0, ptr::null_mut::<c_void>(), ptr::null_mut::<c_void>()) == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd
            .spawn()
            .map_err(|source| TargetError::SpawnFailed { command: command.join(" "), source })?;
        let pid = Pid::from(child.id() as i32);
        debug!("Spawned {program} as {pid}");

        // The child stops with SIGTRAP once exec succeeds
        wait_for_stop(pid)?;
        ptrace(libc::PTRACE_SETOPTIONS, "PTRACE_SETOPTIONS", pid, 0, libc::PTRACE_O_EXITKILL as usize)?;

        Ok(Self { pid, mem: open_mem(pid)?, ownership: Ownership::Spawned })
    }

    /// Attach to a running thread and wait until it stops
    ///
    /// # Errors
    /// Returns an error if the process does not exist or may not be traced
    pub fn attach(pid: Pid) -> Result<Self, TargetError> {
        ptrace(libc::PTRACE_ATTACH, "PTRACE_ATTACH", pid, 0, 0)?;
        let inferior = Self { pid, mem: open_mem(pid)?, ownership: Ownership::Attached };

        // Other signals may be pending ahead of the attach SIGSTOP
        loop {
            match wait_for_stop(pid)? {
                libc::SIGSTOP => break,
                signal => {
                    debug!("{pid}: signal {signal} pending at attach, delivering");
                    ptrace(libc::PTRACE_CONT, "PTRACE_CONT", pid, 0, signal as usize)?;
                }
            }
        }

        info!("Attached to {pid}");
        Ok(inferior)
    }

    #[must_use]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Execute exactly one instruction
    ///
    /// # Errors
    /// - `Exited` / `Killed` if the process terminated during the step
    /// - `Crashed` if the instruction raised a fault signal
    pub fn single_step(&mut self) -> Result<(), TargetError> {
        let mut deliver = 0;
        loop {
            ptrace(libc::PTRACE_SINGLESTEP, "PTRACE_SINGLESTEP", self.pid, 0, deliver as usize)?;
            match wait_for_stop(self.pid)? {
                libc::SIGTRAP => return Ok(()),
                signal if is_fault(signal) => {
                    let address = self.registers().map(|r| r.pc).unwrap_or(0);
                    return Err(TargetError::Crashed { pid: self.pid, signal, address });
                }
                // Delivered with the next step; a handler becomes the next
                // instructions to sample
                signal => deliver = signal,
            }
        }
    }

    /// Read the raw register file
    ///
    /// # Errors
    /// Returns an error if the registers cannot be read
    pub fn user_regs(&self) -> Result<libc::user_regs_struct, TargetError> {
        // SAFETY: user_regs_struct is plain old data; all-zero is a valid value
        let mut regs: libc::user_regs_struct = unsafe { std::mem::zeroed() };
        ptrace(libc::PTRACE_GETREGS, "PTRACE_GETREGS", self.pid, 0, ptr::addr_of_mut!(regs) as usize)?;
        Ok(regs)
    }

    /// Program counter and general purpose registers, in DWARF order
    ///
    /// # Errors
    /// Returns an error if the registers cannot be read
    pub fn registers(&self) -> Result<Registers, TargetError> {
        let r = self.user_regs()?;
        Ok(Registers::from_gprs(
            r.rip,
            [
                r.rax, r.rdx, r.rcx, r.rbx, r.rsi, r.rdi, r.rbp, r.rsp, r.r8, r.r9, r.r10, r.r11, r.r12,
                r.r13, r.r14, r.r15,
            ],
        ))
    }

    /// Move the program counter
    ///
    /// # Errors
    /// Returns an error if the registers cannot be written
    pub fn set_pc(&mut self, pc: u64) -> Result<(), TargetError> {
        let mut regs = self.user_regs()?;
        regs.rip = pc;
        ptrace(libc::PTRACE_SETREGS, "PTRACE_SETREGS", self.pid, 0, ptr::addr_of_mut!(regs) as usize)
    }

    /// Read `buf.len()` bytes at a runtime address
    ///
    /// # Errors
    /// Returns an error if the range is not mapped
    pub fn read_bytes(&self, address: u64, buf: &mut [u8]) -> Result<(), TargetError> {
        self.mem
            .read_exact_at(buf, address)
            .map_err(|source| TargetError::Memory { pid: self.pid, address, source })
    }

    /// Overwrite one byte of the process's memory (including read-only code)
    ///
    /// # Errors
    /// Returns an error if the address is not mapped
    pub fn write_byte(&mut self, address: u64, byte: u8) -> Result<(), TargetError> {
        self.mem
            .write_all_at(&[byte], address)
            .map_err(|source| TargetError::Memory { pid: self.pid, address, source })
    }

    /// Continue until the instruction at runtime address `address` is about to execute
    ///
    /// # Errors
    /// Returns an error if the process terminates or crashes first
    pub fn run_to(&mut self, address: u64) -> Result<(), TargetError> {
        if self.registers()?.pc == address {
            return Ok(());
        }

        let mut original = [0u8; 1];
        self.read_bytes(address, &mut original)?;
        self.write_byte(address, INT3)?;

        let reached = self.continue_to_trap(address + 1);
        // Restore the code even if the process died, the write then fails harmlessly
        let restored = self.write_byte(address, original[0]);
        reached?;
        restored?;

        self.set_pc(address)?;
        info!("{}: reached start address 0x{address:x}", self.pid);
        Ok(())
    }

    fn continue_to_trap(&mut self, trap_pc: u64) -> Result<(), TargetError> {
        let mut deliver = 0;
        loop {
            ptrace(libc::PTRACE_CONT, "PTRACE_CONT", self.pid, 0, deliver as usize)?;
            deliver = match wait_for_stop(self.pid)? {
                libc::SIGTRAP if self.registers()?.pc == trap_pc => return Ok(()),
                libc::SIGTRAP => 0,
                signal if is_fault(signal) => {
                    let address = self.registers().map(|r| r.pc).unwrap_or(0);
                    return Err(TargetError::Crashed { pid: self.pid, signal, address });
                }
                signal => signal,
            };
        }
    }
}

impl ReadMemory for Inferior {
    fn read_u64(&self, address: u64) -> Result<u64, TargetError> {
        let mut buf = [0u8; 8];
        self.read_bytes(address, &mut buf)?;
        Ok(u64::from_ne_bytes(buf))
    }
}

impl Drop for Inferior {
    fn drop(&mut self) {
        match self.ownership {
            Ownership::Spawned => {
                // SAFETY: plain syscalls on a child we own
                unsafe {
                    libc::kill(self.pid.0, libc::SIGKILL);
                    libc::waitpid(self.pid.0, ptr::null_mut(), libc::__WALL);
                }
                debug!("Killed {}", self.pid);
            }
            Ownership::Attached => match ptrace(libc::PTRACE_DETACH, "PTRACE_DETACH", self.pid, 0, 0) {
                Ok(()) => info!("Detached from {}", self.pid),
                Err(e) => warn!("{e}"),
            },
        }
    }
}

fn is_fault(signal: i32) -> bool {
    matches!(signal, libc::SIGSEGV | libc::SIGBUS | libc::SIGILL | libc::SIGFPE | libc::SIGABRT)
}

fn ptrace(request: Request, name: &'static str, pid: Pid, addr: usize, data: usize) -> Result<(), TargetError> {
    // SAFETY: every request passes either 0 or a pointer to a live, correctly
    // sized value as `data`
    let ret = unsafe { libc::ptrace(request, pid.0, addr as *mut c_void, data as *mut c_void) };
    if ret == -1 {
        return Err(TargetError::Ptrace { request: name, pid, source: io::Error::last_os_error() });
    }
    Ok(())
}

/// Wait until `pid` stops and return the stop signal
fn wait_for_stop(pid: Pid) -> Result<i32, TargetError> {
    let mut status = 0;
    loop {
        // SAFETY: status points to a live c_int
        let ret = unsafe { libc::waitpid(pid.0, &mut status, libc::__WALL) };
        if ret == -1 {
            let source = io::Error::last_os_error();
            if source.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(TargetError::Ptrace { request: "waitpid", pid, source });
        }
        break;
    }

    if libc::WIFEXITED(status) {
        return Err(TargetError::Exited { pid, code: libc::WEXITSTATUS(status) });
    }
    if libc::WIFSIGNALED(status) {
        return Err(TargetError::Killed { pid, signal: libc::WTERMSIG(status) });
    }
    Ok(libc::WSTOPSIG(status))
}

fn open_mem(pid: Pid) -> Result<File, TargetError> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(format!("/proc/{}/mem", pid.0))
        .map_err(|source| TargetError::Memory { pid, address: 0, source })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_fault() {
        assert!(is_fault(libc::SIGSEGV));
        assert!(is_fault(libc::SIGABRT));
        assert!(!is_fault(libc::SIGCHLD));
        assert!(!is_fault(libc::SIGTRAP));
    }

    #[test]
    fn test_spawn_empty_command_fails() {
        assert!(matches!(Inferior::spawn(&[]), Err(TargetError::SpawnFailed { .. })));
    }

    #[test]
    #[ignore = "requires ptrace permissions"]
    fn test_spawn_step_and_exit() {
        let mut inferior = Inferior::spawn(&["/bin/true".to_string()]).unwrap();
        let before = inferior.registers().unwrap().pc;
        inferior.single_step().unwrap();
        assert_ne!(inferior.registers().unwrap().pc, before);

        let err = loop {
            if let Err(e) = inferior.single_step() {
                break e;
            }
        };
        assert!(matches!(err, TargetError::Exited { code: 0, .. }));
    }
}
