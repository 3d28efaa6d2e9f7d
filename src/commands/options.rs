use crate::{
    flags::{Checksum, Flags},
    trace::trace_frame::FrameTime,
};
use std::{error::Error, ffi::OsString, path::PathBuf};
use structopt::{clap, clap::AppSettings, StructOpt};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "retrace",
    about = "A deterministic record/replay engine for Linux processes",
    after_help = "Use RETRACE_LOG to control logging; e.g. \
                  RETRACE_LOG=all:warn,scheduler:debug"
)]
#[structopt(global_settings = &[AppSettings::UnifiedHelpMessage, AppSettings::AllowNegativeNumbers])]
pub struct Options {
    #[structopt(
        short = "T",
        long = "dump-at",
        help = "Dump tracee memory at global time point <dump_at>."
    )]
    pub dump_at: Option<FrameTime>,

    #[structopt(
        short = "C",
        long = "checksum",
        parse(try_from_str = parse_checksum),
        help = "Where <checksum> := `on-syscalls` | `on-all-events` | <from-time>.\n\
                Compute and store (during recording) or read and verify (during\n\
                replay) checksums of each tracee memory mapping at the end of all\n\
                syscalls (`on-syscalls`), at all events (`on-all-events`), or\n\
                starting from global timepoint <from-time>."
    )]
    pub checksum: Option<Checksum>,

    #[structopt(
        short = "M",
        long = "mark-stdio",
        help = "Mark tracee stdio writes with `[retrace <pid> <ev>]` where <ev> is \
                the global trace time of the write."
    )]
    pub mark_stdio: bool,

    #[structopt(
        short = "K",
        long = "check-cached-maps",
        help = "Verify that cached task mmaps match /proc/maps."
    )]
    pub check_cached_maps: bool,

    #[structopt(
        short = "n",
        long = "no-syscall-buffer",
        help = "Disable the syscall buffer preload library even if it would \
                otherwise be used."
    )]
    pub no_syscall_buffer: bool,

    #[structopt(
        short = "F",
        long = "force-things",
        help = "Force things that don't seem like good ideas."
    )]
    pub force_things: bool,

    #[structopt(
        short = "S",
        long = "suppress-environment-warnings",
        help = "Suppress warnings about issues in the environment the engine has \
                no control over."
    )]
    pub suppress_environment_warnings: bool,

    #[structopt(
        short = "E",
        long = "fatal-errors",
        help = "Any warning or error that is printed is treated as fatal."
    )]
    pub fatal_errors: bool,

    #[structopt(
        short = "A",
        long = "microarch",
        help = "Assume the CPU has the given microarchitecture (e.g. 'Ivy Bridge') \
                even if runtime detection says otherwise."
    )]
    pub microarch: Option<String>,

    #[structopt(
        long = "resource-path",
        help = "Where to find engine resources.",
        parse(from_os_str)
    )]
    pub resource_path: Option<PathBuf>,

    #[structopt(subcommand)]
    pub cmd: SubCommand,
}

#[derive(StructOpt, Debug, Clone)]
pub enum SubCommand {
    /// Record the execution of <exe> with its arguments into a new trace.
    #[structopt(name = "record")]
    Record {
        #[structopt(parse(from_os_str))]
        exe: OsString,
        #[structopt(parse(from_os_str))]
        args: Vec<OsString>,
    },

    /// Replay a recorded trace, defaulting to the latest one.
    #[structopt(name = "replay")]
    Replay {
        /// The trace directory; the `latest-trace` symlink when omitted.
        #[structopt(parse(from_os_str))]
        trace_dir: Option<PathBuf>,
    },

    /// Dump the frames of a recorded trace in a human-readable form.
    #[structopt(name = "dump")]
    Dump {
        #[structopt(parse(from_os_str))]
        trace_dir: Option<PathBuf>,

        /// Dump raw frame records, one line each.
        #[structopt(short = "r", long)]
        raw: bool,
    },
}

fn parse_checksum(checksum_s: &str) -> Result<Checksum, Box<dyn Error>> {
    if checksum_s == "on-syscalls" {
        Ok(Checksum::ChecksumSyscall)
    } else if checksum_s == "on-all-events" {
        Ok(Checksum::ChecksumAll)
    } else if checksum_s.chars().all(|c| c.is_ascii_digit()) {
        Ok(Checksum::ChecksumAt(checksum_s.parse::<FrameTime>()?))
    } else {
        Err(Box::new(clap::Error::with_description(
            "Only `on-syscalls` or `on-all-events` or an unsigned integer is valid here",
            clap::ErrorKind::InvalidValue,
        )))
    }
}

impl Options {
    /// Populate the process-wide Flags from the parsed options.
    pub fn to_flags(&self) -> Flags {
        Flags {
            checksum: self.checksum,
            dump_at: self.dump_at,
            mark_stdio: self.mark_stdio,
            check_cached_maps: self.check_cached_maps,
            no_syscall_buffer: self.no_syscall_buffer,
            force_things: self.force_things,
            suppress_environment_warnings: self.suppress_environment_warnings,
            fatal_errors_and_warnings: self.fatal_errors,
            forced_uarch: self.microarch.clone(),
            resource_path: self.resource_path.clone(),
        }
    }
}
