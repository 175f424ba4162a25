use std::thread;
use std::time::Duration;

use clap::Parser;
use hwbp::{read_context, HwBreakpoint, PtraceEngine, ThreadLocks};
use nix::unistd::Pid;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

mod cli;
mod utils;

use crate::cli::{Cmd, Opts};

fn main() -> hwbp::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .with_target(false)
        .init();
    let opts = Opts::parse();

    let tid = opts.tid;
    let engine = PtraceEngine::new()?;

    match opts.command {
        Cmd::Show => show(&engine, tid)?,
        Cmd::Arm {
            address,
            condition,
            length,
            hold,
        } => {
            let locks = ThreadLocks::new();
            let mut bp = HwBreakpoint::new(address, tid, condition, length);

            let slot = bp.enable(&engine, &locks.lock(tid))?;
            info!(%tid, %slot, "watching {:#x} ({}, {} bytes)", address, condition, length.bytes());
            show(&engine, tid)?;

            thread::sleep(Duration::from_secs(hold));

            bp.disable(&engine, &locks.lock(tid))?;
            info!(%tid, %slot, "watch removed");
            bp.destroy();
        }
    }
    Ok(())
}

fn show(engine: &PtraceEngine, tid: Pid) -> hwbp::Result<()> {
    let ctx = read_context(engine, tid)?;
    println!("thread {}", tid);
    for (n, address) in ctx.address.iter().enumerate() {
        println!("  dr{} = {:#018x}", n, address);
    }
    println!("  dr6 = {:#018x}", ctx.status.0);
    println!("  dr7 = {:#018x}", ctx.control.0);
    for (slot, condition, length) in ctx.control.armed_slots() {
        println!(
            "  {}: {:#x} {} {} bytes",
            slot,
            ctx.address[slot.index()],
            condition,
            length.bytes()
        );
    }
    Ok(())
}
