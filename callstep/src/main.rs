//! # callstep - Main Entry Point
//!
//! Supports two ways of choosing the process:
//! - **Spawn** (`callstep ... -- ./app args`): start the command under ptrace and
//!   run it to `--start` (default `main`)
//! - **Attach** (`--pid <PID>` or `--name <PROCESS>`): stop a running thread and
//!   sample from wherever it is, or from `--start` if given
//!
//! Either way every instruction up to `--stop` is sampled and the profile is
//! written to `--output` only if that address is reached.

use anyhow::Result;
use clap::Parser;
use std::time::Instant;

use callstep::analysis::format_report;
use callstep::cli::{Args, TargetSpec};
use callstep::domain::Pid;
use callstep::export::ProfileWriter;
use callstep::preflight::{check_attach_target, check_spawn_target};
use callstep::process_lookup::{find_process_by_name, resolve_exe_path};
use callstep::session::{ProfileSession, SessionConfig, StopPoint};

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_NOPERM: i32 = 77;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    let msg = err.to_string().to_lowercase();
    if msg.contains("permission denied") || msg.contains("operation not permitted") {
        EXIT_NOPERM
    } else if msg.contains("missing required argument") {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
fn run() -> Result<()> {
    let _ = Args::parse();
    anyhow::bail!("callstep only supports x86_64 Linux")
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn run() -> Result<()> {
    use callstep::profiling::{Inferior, StackResolver};
    use log::{debug, info};

    let args = Args::parse();

    let inferior = match args.target()? {
        TargetSpec::Spawn(command) => {
            check_spawn_target(&command[0], args.quiet)?;
            Inferior::spawn(&command)?
        }
        TargetSpec::Attach(pid) => {
            let exe = resolve_exe_path(Pid(pid))?;
            check_attach_target(pid, &exe.to_string_lossy(), args.quiet)?;
            Inferior::attach(Pid(pid))?
        }
        TargetSpec::ByName(name) => {
            let process = find_process_by_name(&name)?;
            if !args.quiet {
                eprintln!("Found {} ({}) at {}", process.pid, process.command, process.exe_path.display());
            }
            check_attach_target(process.pid.0, &process.exe_path.to_string_lossy(), args.quiet)?;
            Inferior::attach(process.pid)?
        }
    };

    let mut resolver = StackResolver::new(inferior)?.with_max_depth(args.max_depth);
    if let Some(start) = args.start_point() {
        let address = resolver.runtime_address(&start)?;
        resolver.tracee_mut().run_to(address)?;
    }
    debug!("Sampling from {}", resolver.current_location()?);

    let stop = StopPoint::new(resolver.executable_object()?, args.stop);
    let config = SessionConfig::new(stop).with_max_steps(args.max_steps);
    let writer = ProfileWriter::new(args.creator.clone());

    let started = Instant::now();
    let model = ProfileSession::new(resolver, config).run_to_file(&writer, &args.output)?;
    info!("Sampled {} instructions in {:.2?}", model.sample_count(), started.elapsed());

    if !args.quiet {
        print!("{}", format_report(&model, args.top));
        println!("saved: {}", args.output.display());
    }

    Ok(())
}
