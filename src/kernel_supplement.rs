//! Kernel constants and structs that libc does not export.

#![allow(non_camel_case_types)]
#![allow(non_upper_case_globals)]

use libc::{c_int, c_ulong};

pub const NUM_SIGNALS: usize = 65;

/// x86-only ptrace requests, absent from libc.
pub const PTRACE_SYSEMU: u32 = 31;
pub const PTRACE_SYSEMU_SINGLESTEP: u32 = 32;

/// The stop signalled by PTRACE_SEIZE group-stops, in status>>16.
pub const PTRACE_EVENT_STOP: u32 = 128;

/// fcntl owner types for F_SETOWN_EX.
pub const F_OWNER_TID: c_int = 0;
pub const F_SETOWN_EX: c_int = 15;
pub const F_SETSIG: c_int = 10;

#[repr(C)]
pub struct f_owner_ex {
    pub type_: c_int,
    pub pid: libc::pid_t,
}

/// perf_event_open support. The full kernel header carries far more; only
/// what the ticks counter programs is declared here.
pub const PERF_TYPE_HARDWARE: u32 = 0;
pub const PERF_TYPE_RAW: u32 = 4;
pub const PERF_COUNT_HW_CPU_CYCLES: u64 = 0;

pub const PERF_EVENT_IOC_ENABLE: c_ulong = 0x2400;
pub const PERF_EVENT_IOC_DISABLE: c_ulong = 0x2401;
pub const PERF_EVENT_IOC_RESET: c_ulong = 0x2403;
pub const PERF_EVENT_IOC_PERIOD: c_ulong = 0x4008_2404;

/// Flag bits within perf_event_attr.flags. Only the ones we set.
pub const PERF_ATTR_FLAG_DISABLED: u64 = 1 << 0;
pub const PERF_ATTR_FLAG_EXCLUDE_KERNEL: u64 = 1 << 5;
pub const PERF_ATTR_FLAG_EXCLUDE_HV: u64 = 1 << 7;
pub const PERF_ATTR_FLAG_PINNED: u64 = 1 << 17;
pub const PERF_ATTR_FLAG_EXCLUDE_GUEST: u64 = 1 << 20;

#[repr(C)]
#[derive(Copy, Clone)]
pub struct perf_event_attr {
    pub type_: u32,
    pub size: u32,
    pub config: u64,
    pub sample_period: u64,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: u64,
    pub wakeup_events: u32,
    pub bp_type: u32,
    pub config1: u64,
    pub config2: u64,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clockid: i32,
    pub sample_regs_intr: u64,
    pub aux_watermark: u32,
    pub sample_max_stack: u16,
    pub __reserved_2: u16,
}

impl Default for perf_event_attr {
    fn default() -> Self {
        let mut attr: perf_event_attr = unsafe { std::mem::zeroed() };
        attr.size = std::mem::size_of::<perf_event_attr>() as u32;
        attr
    }
}

/// The btrfs clone ioctls used for the trace reflink fast path.
pub const BTRFS_IOC_CLONE: c_ulong = 0x4004_9409;
pub const BTRFS_IOC_CLONE_RANGE: c_ulong = 0x4020_940d;

#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct btrfs_ioctl_clone_range_args {
    pub src_fd: i64,
    pub src_offset: u64,
    pub src_length: u64,
    pub dest_offset: u64,
}

/// sysexits.h
pub const EX_DATAERR: i32 = 65;

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::const_assert_eq;

    // The kernel's perf_event_attr through PERF_ATTR_SIZE_VER5.
    const_assert_eq!(std::mem::size_of::<perf_event_attr>(), 112);

    #[test]
    fn attr_default_size() {
        let attr = perf_event_attr::default();
        assert_eq!(attr.size as usize, std::mem::size_of::<perf_event_attr>());
        assert_eq!(attr.config, 0);
    }
}
