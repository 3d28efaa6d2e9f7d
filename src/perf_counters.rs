use crate::{
    flags::Flags,
    kernel_metadata::signal_name,
    kernel_supplement::{
        f_owner_ex, perf_event_attr, F_OWNER_TID, F_SETOWN_EX, F_SETSIG,
        PERF_ATTR_FLAG_EXCLUDE_GUEST, PERF_ATTR_FLAG_EXCLUDE_HV, PERF_ATTR_FLAG_EXCLUDE_KERNEL,
        PERF_ATTR_FLAG_PINNED, PERF_COUNT_HW_CPU_CYCLES, PERF_EVENT_IOC_DISABLE,
        PERF_EVENT_IOC_ENABLE, PERF_EVENT_IOC_PERIOD, PERF_EVENT_IOC_RESET, PERF_TYPE_HARDWARE,
        PERF_TYPE_RAW,
    },
    log::{LogDebug, LogInfo},
    scoped_fd::ScopedFd,
    sig::{Sig, SIGSTKFLT},
    ticks::Ticks,
    util::running_under_retrace,
};
use libc::{c_ulong, pid_t};
use nix::{errno::errno, unistd::read};
use raw_cpuid::CpuId;
use std::{io::stderr, io::Write, mem::size_of, os::unix::io::RawFd};

/// The signal the ticks counter delivers on period overflow. Linux doesn't
/// use SIGSTKFLT, so tracees are unlikely to either.
pub const TIME_SLICE_SIGNAL: Sig = SIGSTKFLT;

const NUM_BRANCHES: u64 = 500;

bitflags! {
    struct PmuFlags: u32 {
        /// This CPU supports ticks counting retired conditional branches.
        const PMU_TICKS_RCB = 1 << 0;
        /// This CPU supports ticks counting all taken branches (excluding
        /// interrupts, far branches, and rets).
        const PMU_TICKS_TAKEN_BRANCHES = 1 << 1;
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum CpuMicroarch {
    UnknownCpu,
    IntelNehalem,
    IntelWestmere,
    IntelSandyBridge,
    IntelIvyBridge,
    IntelHaswell,
    IntelBroadwell,
    IntelSkylake,
    IntelSilvermont,
    IntelGoldmont,
    IntelKabylake,
    IntelCometlake,
    AMDRyzen,
}
use CpuMicroarch::*;

struct PmuConfig {
    uarch: CpuMicroarch,
    name: &'static str,
    rcb_cntr_event: u32,
    skid_size: Ticks,
    flags: PmuFlags,
}

/// event 0x5101c4:
/// - 51 = generic PMU
/// - 01 = umask for event BR_INST_RETIRED.CONDITIONAL
/// - c4 = eventsel for event BR_INST_RETIRED.CONDITIONAL
/// See the Intel 64 and IA32 Architectures Performance Monitoring Events
/// lists, and check_events from libpfm4.
const PMU_CONFIGS: [PmuConfig; 12] = [
    PmuConfig {
        uarch: IntelCometlake,
        name: "Intel Cometlake",
        rcb_cntr_event: 0x5101c4,
        skid_size: 100,
        flags: PmuFlags::PMU_TICKS_RCB,
    },
    PmuConfig {
        uarch: IntelKabylake,
        name: "Intel Kabylake",
        rcb_cntr_event: 0x5101c4,
        skid_size: 100,
        flags: PmuFlags::PMU_TICKS_RCB,
    },
    PmuConfig {
        uarch: IntelSkylake,
        name: "Intel Skylake",
        rcb_cntr_event: 0x5101c4,
        skid_size: 100,
        flags: PmuFlags::PMU_TICKS_RCB,
    },
    PmuConfig {
        uarch: IntelBroadwell,
        name: "Intel Broadwell",
        rcb_cntr_event: 0x5101c4,
        skid_size: 100,
        flags: PmuFlags::PMU_TICKS_RCB,
    },
    PmuConfig {
        uarch: IntelHaswell,
        name: "Intel Haswell",
        rcb_cntr_event: 0x5101c4,
        skid_size: 100,
        flags: PmuFlags::PMU_TICKS_RCB,
    },
    PmuConfig {
        uarch: IntelIvyBridge,
        name: "Intel Ivy Bridge",
        rcb_cntr_event: 0x5101c4,
        skid_size: 100,
        flags: PmuFlags::PMU_TICKS_RCB,
    },
    PmuConfig {
        uarch: IntelSandyBridge,
        name: "Intel Sandy Bridge",
        rcb_cntr_event: 0x5101c4,
        skid_size: 100,
        flags: PmuFlags::PMU_TICKS_RCB,
    },
    PmuConfig {
        uarch: IntelNehalem,
        name: "Intel Nehalem",
        rcb_cntr_event: 0x5101c4,
        skid_size: 100,
        flags: PmuFlags::PMU_TICKS_RCB,
    },
    PmuConfig {
        uarch: IntelWestmere,
        name: "Intel Westmere",
        rcb_cntr_event: 0x5101c4,
        skid_size: 100,
        flags: PmuFlags::PMU_TICKS_RCB,
    },
    PmuConfig {
        uarch: IntelSilvermont,
        name: "Intel Silvermont",
        rcb_cntr_event: 0x517ec4,
        skid_size: 100,
        flags: PmuFlags::PMU_TICKS_RCB,
    },
    PmuConfig {
        uarch: IntelGoldmont,
        name: "Intel Goldmont",
        rcb_cntr_event: 0x517ec4,
        skid_size: 100,
        flags: PmuFlags::PMU_TICKS_RCB,
    },
    PmuConfig {
        uarch: AMDRyzen,
        name: "AMD Ryzen",
        rcb_cntr_event: 0x5100d1,
        skid_size: 1000,
        flags: PmuFlags::PMU_TICKS_RCB,
    },
];

struct PmuAttributes {
    skid_size: Ticks,
    ticks_attr: perf_event_attr,
}

lazy_static! {
    static ref PMU_ATTRIBUTES: PmuAttributes = get_init_attributes();
}

/// Detected, known microarchitecture of this CPU, or don't return.
fn get_cpu_microarch() -> CpuMicroarch {
    if let Some(ref forced) = Flags::get().forced_uarch {
        let forced = forced.to_lowercase();
        for pmu in &PMU_CONFIGS {
            if pmu.name.to_lowercase().contains(&forced) {
                log!(LogInfo, "Using forced uarch {}", pmu.name);
                return pmu.uarch;
            }
        }
        clean_fatal!("Forced uarch {} isn't known", forced);
    }

    let cpuid = CpuId::new();
    let vendor = cpuid.get_vendor_info().unwrap().as_str().to_owned();
    if vendor != "GenuineIntel" && vendor != "AuthenticAMD" {
        clean_fatal!("Unknown CPU vendor '{}'", vendor);
    }

    let info = cpuid.get_feature_info().unwrap();
    let cpu_type: u32 = ((info.model_id() as u32) << 4)
        + ((info.family_id() as u32) << 8)
        + ((info.extended_model_id() as u32) << 16);
    match cpu_type {
        0x106A0 | 0x106E0 | 0x206E0 => return IntelNehalem,
        0x20650 | 0x206C0 | 0x206F0 => return IntelWestmere,
        0x206A0 | 0x206D0 | 0x306e0 => return IntelSandyBridge,
        0x306A0 => return IntelIvyBridge,
        0x306C0 | 0x306F0 | 0x40650 | 0x40660 => return IntelHaswell,
        0x306D0 | 0x40670 | 0x406F0 | 0x50660 => return IntelBroadwell,
        0x406e0 | 0x50650 | 0x506e0 => return IntelSkylake,
        0x30670 | 0x406c0 | 0x50670 => return IntelSilvermont,
        0x506f0 => return IntelGoldmont,
        0x806e0 | 0x906e0 => return IntelKabylake,
        0xa0660 => return IntelCometlake,
        0x00f10 => return AMDRyzen,
        _ => (),
    }

    clean_fatal!("CPU type {:#x} unknown; no ticks counter available", cpu_type);
}

fn new_perf_event_attr(type_id: u32, config: u64) -> perf_event_attr {
    let mut attr = perf_event_attr::default();
    attr.type_ = type_id;
    attr.config = config;
    // Events must count userspace tracee code only.
    attr.flags |= PERF_ATTR_FLAG_EXCLUDE_KERNEL | PERF_ATTR_FLAG_EXCLUDE_GUEST;
    attr
}

fn get_init_attributes() -> PmuAttributes {
    let uarch = get_cpu_microarch();
    let pmu = PMU_CONFIGS
        .iter()
        .find(|config| config.uarch == uarch)
        .unwrap();
    if !pmu.flags.contains(PmuFlags::PMU_TICKS_RCB) {
        fatal!("Microarchitecture `{}' currently unsupported.", pmu.name);
    }

    let ticks_attr = new_perf_event_attr(PERF_TYPE_RAW, pmu.rcb_cntr_event as u64);
    PmuAttributes {
        skid_size: pmu.skid_size,
        ticks_attr,
    }
}

/// Force PMU detection early so configuration problems surface before the
/// first tracee runs.
pub fn init_pmu() {
    let skid = PMU_ATTRIBUTES.skid_size;
    log!(LogDebug, "Initialized PMU (skid_size={})", skid);
}

fn start_counter(tid: pid_t, group_fd: i32, attr: &mut perf_event_attr) -> ScopedFd {
    if group_fd == -1 {
        attr.flags |= PERF_ATTR_FLAG_PINNED;
    } else {
        attr.flags &= !PERF_ATTR_FLAG_PINNED;
    }

    let fd: RawFd = unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            attr as *mut perf_event_attr,
            tid,
            -1,
            group_fd,
            0,
        ) as RawFd
    };
    if fd < 0 {
        if errno() == libc::EACCES {
            fatal!(
                "Permission denied to use 'perf_event_open'; are perf events \
                 enabled? Try 'perf record'."
            );
        }
        if errno() == libc::ENOENT {
            fatal!(
                "Unable to open performance counter with 'perf_event_open'; \
                 are perf events enabled? Try 'perf record'."
            );
        }
        fatal!("Failed to initialize counter");
    }

    ScopedFd::from_raw(fd)
}

fn read_counter(fd: &ScopedFd) -> u64 {
    let mut buf = [0u8; size_of::<u64>()];
    match read(fd.as_raw(), &mut buf) {
        Ok(nread) if nread == size_of::<u64>() => u64::from_le_bytes(buf),
        _ => fatal!("Could not read perf counter"),
    }
}

fn perf_ioctl(fd: &ScopedFd, request: c_ulong, arg: *const u64) -> i32 {
    unsafe { libc::ioctl(fd.as_raw(), request, arg) }
}

fn perf_ioctl_null(fd: &ScopedFd, request: c_ulong) -> i32 {
    unsafe { libc::ioctl(fd.as_raw(), request, 0) }
}

fn make_counter_async(fd: &ScopedFd, signal: Sig) {
    let ok = unsafe {
        libc::fcntl(fd.as_raw(), libc::F_SETFL, libc::O_ASYNC) == 0
            && libc::fcntl(fd.as_raw(), F_SETSIG, signal.as_raw()) == 0
    };
    if !ok {
        fatal!(
            "Failed to make ticks counter ASYNC with {}",
            signal_name(signal.as_raw())
        );
    }
}

/// The retired-conditional-branch counter attached to one task. Programmed
/// to overflow at the time-slice budget; the resulting TIME_SLICE_SIGNAL is
/// the only legitimate source of preemption during recording.
pub struct PerfCounters {
    tid: pid_t,
    fd_ticks_interrupt: ScopedFd,
    /// Only valid while counting.
    counting_period: Ticks,
    started: bool,
    counting: bool,
}

impl PerfCounters {
    pub fn new(tid: pid_t) -> PerfCounters {
        PerfCounters {
            tid,
            fd_ticks_interrupt: ScopedFd::new(),
            counting_period: 0,
            started: false,
            counting: false,
        }
    }

    pub fn set_tid(&mut self, tid: pid_t) {
        self.stop();
        self.tid = tid;
    }

    /// Reset all counter values to 0 and program the counter to deliver
    /// TIME_SLICE_SIGNAL after `ticks_period` ticks. (The hardware
    /// triggers its interrupt some time after that; we also allow the
    /// interrupt to fire early.) Must be called while the task is stopped,
    /// before it runs again. Zero means don't interrupt.
    pub fn reset(&mut self, ticks_period: Ticks) {
        let mut ticks_period = ticks_period;
        if ticks_period == 0 {
            // Sampling can't be switched off via PERF_EVENT_IOC_PERIOD, so
            // zero becomes a very large number.
            ticks_period = 1 << 60;
        }

        if !self.started {
            log!(
                LogDebug,
                "Creating counters for {} with period {}",
                self.tid,
                ticks_period
            );
            let mut attr = PMU_ATTRIBUTES.ticks_attr;
            attr.sample_period = ticks_period;
            self.fd_ticks_interrupt = start_counter(self.tid, -1, &mut attr);

            let own = f_owner_ex {
                type_: F_OWNER_TID,
                pid: self.tid,
            };
            if unsafe {
                libc::fcntl(
                    self.fd_ticks_interrupt.as_raw(),
                    F_SETOWN_EX,
                    &own as *const f_owner_ex,
                )
            } != 0
            {
                fatal!("Failed to SETOWN_EX ticks event fd");
            }
            make_counter_async(&self.fd_ticks_interrupt, TIME_SLICE_SIGNAL);
        } else {
            log!(
                LogDebug,
                "Resetting counters for {} with period {}",
                self.tid,
                ticks_period
            );
            if perf_ioctl_null(&self.fd_ticks_interrupt, PERF_EVENT_IOC_RESET) != 0 {
                fatal!("ioctl(PERF_EVENT_IOC_RESET) failed");
            }
            if perf_ioctl(
                &self.fd_ticks_interrupt,
                PERF_EVENT_IOC_PERIOD,
                &ticks_period,
            ) != 0
            {
                fatal!(
                    "ioctl(PERF_EVENT_IOC_PERIOD) failed with period {}",
                    ticks_period
                );
            }
            if perf_ioctl_null(&self.fd_ticks_interrupt, PERF_EVENT_IOC_ENABLE) != 0 {
                fatal!("ioctl(PERF_EVENT_IOC_ENABLE) failed");
            }
        }

        self.started = true;
        self.counting = true;
        self.counting_period = ticks_period;
    }

    /// Close the counter fds; they are reopened when reset is called again.
    pub fn stop(&mut self) {
        if !self.started {
            return;
        }
        self.fd_ticks_interrupt.close();
        self.started = false;
        self.counting = false;
    }

    /// Suspend counting until the next reset.
    pub fn stop_counting(&mut self) {
        if !self.counting {
            return;
        }
        self.counting = false;
        perf_ioctl_null(&self.fd_ticks_interrupt, PERF_EVENT_IOC_DISABLE);
    }

    /// The current ticks count since the last reset.
    pub fn read_ticks(&self) -> Ticks {
        if !self.started || !self.counting {
            return 0;
        }
        read_counter(&self.fd_ticks_interrupt)
    }

    /// The fd the counter signal is delivered for.
    pub fn ticks_interrupt_fd(&self) -> RawFd {
        self.fd_ticks_interrupt.as_raw()
    }

    /// At most this many ticks may elapse between a requested interrupt and
    /// its delivery.
    pub fn skid_size() -> Ticks {
        PMU_ATTRIBUTES.skid_size
    }

    /// More skid is seen in practice during recording.
    pub fn recording_skid_size() -> Ticks {
        Self::skid_size() * 5
    }
}

impl Drop for PerfCounters {
    fn drop(&mut self) {
        self.stop()
    }
}

/// Sanity check that the counter counts: run NUM_BRANCHES conditional
/// branches that can't be optimized out and require a nonzero count.
pub fn check_working_counters() {
    let mut attr = PMU_ATTRIBUTES.ticks_attr;
    attr.sample_period = 0;
    let fd = start_counter(0, -1, &mut attr);

    // 'accumulator' is always odd and can't be zero.
    let mut accumulator: u32 = unsafe { libc::rand() as u32 }
        .wrapping_mul(2)
        .wrapping_add(1);
    for _ in 0..NUM_BRANCHES {
        if accumulator == 0 {
            break;
        }
        accumulator = accumulator.wrapping_mul(7).wrapping_add(2) & 0xffffff;
    }
    // Keep the result alive so the loop isn't optimized out.
    if accumulator == 0xdeadbeef {
        let _ = write!(stderr(), "");
    }

    let events = read_counter(&fd);
    if events < NUM_BRANCHES && !running_under_retrace() {
        let config = PMU_ATTRIBUTES.ticks_attr.config;
        fatal!(
            "\nGot {} branch events, expected at least {}.\n\n\
             The hardware performance counter seems to not be working. Check\n\
             that hardware performance counters are working by running:\n\
             perf stat --event=r{:#x} true\n\
             and checking that it reports a nonzero number of events.",
            events,
            NUM_BRANCHES,
            config
        );
    }
}
