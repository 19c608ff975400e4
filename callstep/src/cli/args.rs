//! CLI argument definitions

use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;

use crate::domain::Address;
use crate::export::DEFAULT_CREATOR;
use crate::profiling::{StartPoint, MAX_DEPTH};

#[derive(Parser, Debug)]
#[command(
    name = "callstep",
    about = "Single-step a process and write a callgrind profile of every executed instruction",
    after_help = "\
EXAMPLES:
    callstep --stop 0x1189 -o out.callgrind -- ./app arg       Run ./app from main to 0x1189
    callstep --stop 0x1189 -o out.callgrind --start work -- ./app
    callstep --stop 0x401a2c -o out.callgrind --pid 1234      Sample a running process

ADDRESSES:
    Link-time addresses as printed by nm/objdump: 0x hex, 0o octal, 0b binary or decimal"
)]
pub struct Args {
    /// Address in the main executable of the last instruction to sample
    /// (recorded, never executed)
    #[arg(long, value_name = "ADDR", value_parser = parse_address)]
    pub stop: Address,

    /// Callgrind profile to write
    #[arg(short, long, value_name = "FILE")]
    pub output: PathBuf,

    /// Function symbol or address where sampling begins [default for commands: main]
    #[arg(long, value_name = "SYMBOL|ADDR")]
    pub start: Option<String>,

    /// Abort after N instructions without reaching the stop address
    #[arg(long, value_name = "N")]
    pub max_steps: Option<u64>,

    /// Creator recorded in the profile header
    #[arg(long, value_name = "NAME", default_value = DEFAULT_CREATOR)]
    pub creator: String,

    /// Number of functions in the summary
    #[arg(long, value_name = "N", default_value = "10")]
    pub top: usize,

    /// Deepest call stack unwound per instruction; outer frames are not charged
    #[arg(long, value_name = "N", default_value_t = MAX_DEPTH)]
    pub max_depth: usize,

    /// Process ID to attach to
    #[arg(short, long, conflicts_with_all = ["name", "command"])]
    pub pid: Option<i32>,

    /// Name of a running process to attach to
    #[arg(short, long, value_name = "PROCESS", conflicts_with = "command")]
    pub name: Option<String>,

    /// Suppress the summary and non-essential output
    #[arg(short, long)]
    pub quiet: bool,

    /// Command to run under the profiler
    #[arg(last = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

/// Which process to profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSpec {
    Spawn(Vec<String>),
    Attach(i32),
    ByName(String),
}

impl Args {
    /// The process to profile
    ///
    /// # Errors
    /// Returns an error if neither a command, `--pid` nor `--name` was given
    pub fn target(&self) -> Result<TargetSpec> {
        if let Some(pid) = self.pid {
            return Ok(TargetSpec::Attach(pid));
        }
        if let Some(ref name) = self.name {
            return Ok(TargetSpec::ByName(name.clone()));
        }
        if !self.command.is_empty() {
            return Ok(TargetSpec::Spawn(self.command.clone()));
        }

        bail!(
            "Missing required argument: --pid, --name or -- COMMAND\n\n\
             Usage:\n  \
             callstep --stop <ADDR> -o <FILE> -- ./app      Run a command\n  \
             callstep --stop <ADDR> -o <FILE> --pid 1234    Attach to a process\n\n\
             Run 'callstep --help' for more options"
        )
    }

    /// Where sampling begins; spawned commands default to `main`
    #[must_use]
    pub fn start_point(&self) -> Option<StartPoint> {
        match self.start.as_deref() {
            Some(start) => Some(match parse_address(start) {
                Ok(addr) => StartPoint::Address(addr),
                Err(_) => StartPoint::Symbol(start.to_string()),
            }),
            None if !self.command.is_empty() && self.pid.is_none() && self.name.is_none() => {
                Some(StartPoint::Symbol("main".to_string()))
            }
            None => None,
        }
    }
}

/// Parse an address written as `0x` hex, `0o` octal, `0b` binary or decimal
///
/// # Errors
/// Returns a message suitable for clap if the value is not a number
pub fn parse_address(value: &str) -> Result<Address, String> {
    let value = value.trim().replace('_', "");
    let (digits, radix) = match value.get(..2).map(str::to_ascii_lowercase).as_deref() {
        Some("0x") => (&value[2..], 16),
        Some("0o") => (&value[2..], 8),
        Some("0b") => (&value[2..], 2),
        _ => (value.as_str(), 10),
    };

    u64::from_str_radix(digits, radix)
        .map(Address)
        .map_err(|e| format!("invalid address '{value}': {e}"))
}
