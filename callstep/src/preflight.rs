//! Pre-flight checks for callstep
//!
//! Validates that the target can be traced before any ptrace request is made.
//! Provides clear, actionable error messages when requirements aren't met.

#![allow(unsafe_code)] // geteuid() requires unsafe

use anyhow::{bail, Context, Result};
use object::{Object, ObjectSection};
use std::path::Path;

const PTRACE_SCOPE_PATH: &str = "/proc/sys/kernel/yama/ptrace_scope";

/// Checks for a command that is about to be spawned under ptrace
///
/// # Errors
/// Returns an error if the program cannot be found
pub fn check_spawn_target(program: &str, quiet: bool) -> Result<()> {
    let path = resolve_program(program)?;
    check_binary_exists(&path)?;
    check_debug_symbols(&path, quiet)?;
    Ok(())
}

/// Checks for a running process that is about to be attached to
///
/// # Errors
/// Returns an error if the process does not exist or cannot be inspected
pub fn check_attach_target(pid: i32, exe_path: &str, quiet: bool) -> Result<()> {
    check_process_exists(pid)?;
    check_proc_access(pid)?;
    check_ptrace_scope(quiet);
    check_debug_symbols(exe_path, quiet)?;
    Ok(())
}

/// Find a program the way `execvp` would: paths with a slash as-is, bare names on `$PATH`
fn resolve_program(program: &str) -> Result<String> {
    if program.contains('/') {
        return Ok(program.to_string());
    }

    let search = std::env::var_os("PATH").unwrap_or_default();
    std::env::split_paths(&search)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
        .map(|found| found.to_string_lossy().into_owned())
        .with_context(|| format!("Command not found: {program}\n\nCheck the name or pass a path."))
}

/// Check if the target binary exists and is a file
fn check_binary_exists(target_path: &str) -> Result<()> {
    let path = Path::new(target_path);
    if !path.exists() {
        bail!(
            "Binary not found: {}\n\n\
             Make sure the path is correct and the binary exists.",
            target_path
        );
    }
    if !path.is_file() {
        bail!(
            "Not a file: {}\n\n\
             The command must be an executable file, not a directory.",
            target_path
        );
    }
    Ok(())
}

/// Warn if the Yama LSM forbids attaching to processes we did not start
fn check_ptrace_scope(quiet: bool) {
    if quiet || unsafe { libc::geteuid() } == 0 {
        return;
    }
    let Ok(scope) = std::fs::read_to_string(PTRACE_SCOPE_PATH) else {
        return;
    };
    if let Some(warning) = ptrace_scope_warning(scope.trim()) {
        eprintln!("warning: {warning}");
    }
}

fn ptrace_scope_warning(scope: &str) -> Option<String> {
    match scope {
        "0" => None,
        "1" => Some(format!(
            "{PTRACE_SCOPE_PATH} is 1, attaching to a non-child process requires root or CAP_SYS_PTRACE"
        )),
        "2" => Some(format!("{PTRACE_SCOPE_PATH} is 2, attaching requires CAP_SYS_PTRACE")),
        other => Some(format!("{PTRACE_SCOPE_PATH} is {other}, ptrace attach is disabled")),
    }
}

/// Check if the binary has debug symbols for proper source attribution
fn check_debug_symbols(target_path: &str, quiet: bool) -> Result<()> {
    if quiet {
        return Ok(());
    }

    let file_data = std::fs::read(target_path)
        .with_context(|| format!("Failed to read binary: {target_path}"))?;

    let obj = match object::File::parse(&*file_data) {
        Ok(obj) => obj,
        Err(_) => {
            // Not a valid object file (e.g. a script), let exec handle it
            return Ok(());
        }
    };

    // Check for .debug_info section (DWARF debug info)
    let has_debug_info = obj.section_by_name(".debug_info").is_some_and(|s| s.size() > 0);

    // Check for .symtab (symbol table - present in non-stripped binaries)
    let has_symtab = obj.section_by_name(".symtab").is_some_and(|s| s.size() > 0);

    if !has_debug_info && !has_symtab {
        eprintln!("warning: binary stripped, only exported functions can be attributed");
    } else if !has_debug_info {
        eprintln!("warning: no DWARF debug info, source files will show as ???");
    }

    Ok(())
}

/// Check if the target process exists
pub fn check_process_exists(pid: i32) -> Result<()> {
    let proc_path = format!("/proc/{pid}");
    if !Path::new(&proc_path).exists() {
        bail!(
            "Process {pid} not found.\n\n\
             Is the process still running? Check with: ps -p {pid}"
        );
    }
    Ok(())
}

/// Check if we can read the process's memory maps
pub fn check_proc_access(pid: i32) -> Result<()> {
    let maps_path = format!("/proc/{pid}/maps");
    std::fs::read_to_string(&maps_path).with_context(|| {
        format!(
            "Cannot read {maps_path}\n\n\
             This usually means:\n\
             - The process doesn't exist (check: ps -p {pid})\n\
             - Permission denied (run as the process owner or with sudo)\n\
             - /proc is not mounted"
        )
    })?;
    Ok(())
}
