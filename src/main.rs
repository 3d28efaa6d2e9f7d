#![allow(dead_code)]

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate lazy_static;

#[macro_use]
mod log;

mod auto_remote_syscalls;
mod commands;
mod event;
mod extra_registers;
mod flags;
mod kernel_abi;
mod kernel_metadata;
mod kernel_supplement;
mod monkeypatcher;
mod perf_counters;
mod preload_interface;
mod registers;
mod remote_code_ptr;
mod remote_ptr;
mod scheduler;
mod scoped_fd;
mod session;
mod sig;
mod task_set;
mod taskish_uid;
mod ticks;
mod trace;
mod util;
mod wait_status;

use crate::{
    commands::{
        exit_result::ExitResult,
        options::{Options, SubCommand},
    },
    flags::Flags,
};
use structopt::StructOpt;

fn main() -> ExitResult<()> {
    let options = Options::from_args();
    Flags::init(options.to_flags());

    match options.cmd {
        SubCommand::Record { exe, args } => commands::record_command::run(exe, args),
        SubCommand::Replay { trace_dir } => commands::replay_command::run(trace_dir),
        SubCommand::Dump { trace_dir, raw } => commands::dump_command::run(trace_dir, raw),
    }
}
