use clap::{Parser, Subcommand};
use nix::unistd::Pid;

use hwbp::{Condition, Length};
use crate::utils::parse_address;

#[derive(Parser, Debug)]
#[command(version, about = "Arm x86 hardware breakpoints on a running thread")]
pub struct Opts {
    /// Kernel thread id of the target thread
    #[arg(short, long, env = "HWBP_TID", value_parser = parse_tid)]
    pub tid: Pid,

    #[command(subcommand)]
    pub command: Cmd,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Print the debug registers of the thread
    Show,
    /// Arm a watch, hold it, then remove it
    Arm {
        /// Address to watch, hex with optional 0x prefix
        #[arg(short, long, value_parser = parse_address)]
        address: u64,

        /// execute, write, io or rw
        #[arg(short, long, default_value = "write")]
        condition: Condition,

        /// Width of the watched location in bytes: 1, 2, 4 or 8
        #[arg(short, long, default_value = "4", value_parser = parse_length)]
        length: Length,

        /// Seconds to keep the watch armed
        #[arg(long, default_value_t = 10)]
        hold: u64,
    },
}

fn parse_length(s: &str) -> std::result::Result<Length, String> {
    let bytes: u64 = s.parse().map_err(|err| format!("{err}"))?;
    Length::from_bytes(bytes).ok_or_else(|| format!("{bytes} is not one of 1, 2, 4, 8"))
}

fn parse_tid(s: &str) -> std::result::Result<Pid, String> {
    match s.parse::<i32>() {
        Ok(tid) if tid > 0 => Ok(Pid::from_raw(tid)),
        _ => Err(format!("invalid thread id {s:?}")),
    }
}
