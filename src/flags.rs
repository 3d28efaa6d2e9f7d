use crate::trace::trace_frame::FrameTime;
use std::path::PathBuf;

/// When to generate or check memory checksums: at syscall exits, at every
/// event, or from a global time point onward.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Checksum {
    ChecksumSyscall,
    ChecksumAll,
    ChecksumAt(FrameTime),
}

/// Process-wide options derived from the command line. Immutable after
/// startup.
#[derive(Clone, Default)]
pub struct Flags {
    pub checksum: Option<Checksum>,
    /// Dump tracee memory at this global time point.
    pub dump_at: Option<FrameTime>,
    /// Mark the trace global time along with tracee writes to stdio.
    pub mark_stdio: bool,
    /// Verify that cached task mmaps match /proc/maps after each event.
    pub check_cached_maps: bool,
    /// Disable the syscall buffer / preload interception entirely.
    pub no_syscall_buffer: bool,
    /// Force things that don't seem like good ideas.
    pub force_things: bool,
    /// Suppress warnings about environmental features outside our control.
    pub suppress_environment_warnings: bool,
    /// Any warning or error that would be printed is treated as fatal.
    pub fatal_errors_and_warnings: bool,
    /// User override for microarchitecture detection.
    pub forced_uarch: Option<String>,
    /// User override for the path to resources such as the syscall page.
    pub resource_path: Option<PathBuf>,
}

static mut FLAGS: Option<Flags> = None;

impl Flags {
    /// Install the parsed options. Called exactly once, from main, before
    /// any threads exist.
    pub fn init(flags: Flags) {
        unsafe {
            debug_assert!(FLAGS.is_none());
            FLAGS = Some(flags);
        }
    }

    pub fn get() -> &'static Flags {
        lazy_static! {
            static ref DEFAULT: Flags = Flags::default();
        }
        unsafe { FLAGS.as_ref() }.unwrap_or(&*DEFAULT)
    }
}
