use crate::{
    auto_remote_syscalls::AutoRemoteSyscalls,
    event::{Event, SyscallState},
    kernel_abi::is_mmap_syscall,
    log::{LogDebug, LogInfo, LogWarn},
    perf_counters::PerfCounters,
    session::{
        task::{ResumeRequest, TaskSharedPtr, TicksRequest, WaitRequest, WriteFlags},
        SessionSharedPtr,
    },
    ticks::Ticks,
    trace::{
        trace_frame::TraceFrame,
        trace_reader::{TimeConstraint, ValidateSourceFile},
        trace_stream::MappedDataSource,
        trace_task_event::TaskEventVariant,
    },
};
use nix::fcntl::OFlag;
use std::ffi::OsString;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReplayStatus {
    /// The replay is making progress.
    ReplayContinue,
    /// The end of the trace has been reached.
    ReplayedAllEvents,
}

pub struct ReplayResult {
    pub status: ReplayStatus,
}

/// The executable the recording exec'd, found in the tasks substream; the
/// replayed process must start from the same image.
pub fn find_initial_exe(trace_dir: Option<&std::path::Path>) -> OsString {
    let mut scan = crate::trace::trace_reader::TraceReader::new(trace_dir);
    while let Some(ev) = scan.read_task_event() {
        if let TaskEventVariant::Exec { file_name, .. } = ev.variant() {
            return file_name.clone();
        }
    }
    fatal!("Trace contains no exec; nothing to replay");
}

/// One iteration of the replay loop: read a frame, pick the recorded task,
/// drive it to the recorded stop, inject the recorded effects.
pub fn replay_step(session: &SessionSharedPtr) -> ReplayResult {
    let replay = session.as_replay().unwrap();
    if replay.trace_reader.borrow().at_end() {
        return ReplayResult {
            status: ReplayStatus::ReplayedAllEvents,
        };
    }

    let frame = replay.trace_reader.borrow_mut().read_frame();
    *replay.current_frame.borrow_mut() = frame.clone();

    let t = match session.find_task(frame.tid()) {
        Some(t) => t,
        None => {
            // The task may not exist yet: its creating clone event carries
            // a later frame. Tolerate only for frames without effects.
            log!(LogWarn, "frame {} for unknown task {}", frame.time(), frame.tid());
            return ReplayResult {
                status: ReplayStatus::ReplayContinue,
            };
        }
    };

    match frame.event() {
        Event::Syscall(s) => match s.state {
            SyscallState::EnteringSyscall => replay_syscall_entry(session, &t, &frame),
            SyscallState::ExitingSyscall => replay_syscall_exit(session, &t, &frame),
        },
        Event::Sched => {
            // Preempt at the recorded tick count.
            advance_to_ticks(&t, frame.ticks());
            validate_registers(session, &t, &frame);
        }
        Event::Signal(data) => {
            advance_to_ticks(&t, frame.ticks());
            t.borrow_mut().sig_to_deliver = Some(data.sig);
        }
        Event::SignalDelivery(data) | Event::SignalHandler(data) => {
            let sig = data.sig;
            let mut task = t.borrow_mut();
            let to_deliver = task.sig_to_deliver.take().or(Some(sig));
            task.resume_execution(
                ResumeRequest::ResumeSinglestep,
                WaitRequest::ResumeWait,
                TicksRequest::ResumeNoTicks,
                to_deliver,
            );
        }
        Event::Exit => {
            // Let the pending exit reach its ptrace-exit stop, then reap.
            let mut task = t.borrow_mut();
            task.advance_real_exit();
            task.destroy();
        }
        Event::InstructionTrap | Event::PatchSyscall => {
            let mut task = t.borrow_mut();
            task.resume_execution(
                ResumeRequest::ResumeSinglestep,
                WaitRequest::ResumeWait,
                TicksRequest::ResumeNoTicks,
                None,
            );
        }
        Event::Sentinel | Event::TraceTermination => {
            return ReplayResult {
                status: ReplayStatus::ReplayedAllEvents,
            }
        }
    }

    maybe_validate_checksums(session, &t, &frame);

    ReplayResult {
        status: ReplayStatus::ReplayContinue,
    }
}

/// Syscalls whose kernel-side effects must really happen at replay: exec
/// and the address-space mutators applied with recorded (deterministic)
/// arguments, plus exits. Everything else is emulated. A sysemu entry stop
/// arms syscall suppression, so the choice is made at entry time.
fn needs_real_execution(syscallno: i32, arch: crate::kernel_abi::SupportedArch) -> bool {
    use crate::kernel_abi::*;
    is_execve_syscall(syscallno, arch)
        || is_exit_syscall(syscallno, arch)
        || is_exit_group_syscall(syscallno, arch)
        || is_clone_like_syscall(syscallno, arch)
        || syscallno == syscall_number_for_munmap(arch)
        || syscallno == syscall_number_for_mprotect(arch)
        || syscallno == syscall_number_for_brk(arch)
        || syscallno == x64::MREMAP
}

/// Drive the task to its next syscall entry and check it is the recorded
/// one. Emulated syscalls enter under sysemu so the kernel never runs
/// them; real-execution syscalls enter under plain syscall-stop.
fn replay_syscall_entry(session: &SessionSharedPtr, t: &TaskSharedPtr, frame: &TraceFrame) {
    let syscall = *frame.event().syscall();
    let resume = if needs_real_execution(syscall.number, syscall.arch) {
        ResumeRequest::ResumeSyscall
    } else {
        ResumeRequest::ResumeSysemu
    };
    {
        let mut task = t.borrow_mut();
        loop {
            task.resume_execution(
                resume,
                WaitRequest::ResumeWait,
                TicksRequest::ResumeUnlimitedTicks,
                None,
            );
            let status = task.status();
            if status.is_syscall() {
                break;
            }
            if status.ptrace_event() == Some(libc::PTRACE_EVENT_EXIT as u32) {
                log!(LogWarn, "task died while advancing to syscall entry");
                return;
            }
            // Spurious stops (e.g. the counter overshooting) are skipped;
            // recorded signals arrive via their own frames.
            log!(LogDebug, "skipping spurious stop {}", status);
        }
        task.in_syscall = true;
    }
    validate_registers(session, t, frame);
}

/// Reproduce the recorded syscall exit: mmap is redone at its recorded
/// address, real-execution syscalls complete in the kernel, everything
/// else has its results injected from the trace.
fn replay_syscall_exit(session: &SessionSharedPtr, t: &TaskSharedPtr, frame: &TraceFrame) {
    let syscall = *frame.event().syscall();
    let arch = syscall.arch;

    if crate::kernel_abi::is_execve_syscall(syscall.number, arch) {
        replay_exec(session, t);
        return;
    }

    if needs_real_execution(syscall.number, arch) {
        // Let the armed syscall complete in the kernel and take its exit
        // stop. Clone-class syscalls report the new child on the way; it
        // is adopted under its recorded tid (task tids are deterministic
        // only through the recorded mapping, so rec_tid comes from the
        // trace's task events at validation time).
        loop {
            let mut task = t.borrow_mut();
            task.resume_execution(
                ResumeRequest::ResumeSyscall,
                WaitRequest::ResumeWait,
                TicksRequest::ResumeNoTicks,
                None,
            );
            let status = task.status();
            if status.is_syscall() {
                break;
            }
            match status.ptrace_event().map(|e| e as i32) {
                Some(libc::PTRACE_EVENT_CLONE)
                | Some(libc::PTRACE_EVENT_FORK)
                | Some(libc::PTRACE_EVENT_VFORK) => {
                    let mut new_tid: libc::c_ulong = 0;
                    task.ptrace_if_alive(
                        libc::PTRACE_GETEVENTMSG as u32,
                        crate::remote_ptr::RemotePtr::null(),
                        &mut new_tid as *mut libc::c_ulong as *mut libc::c_void,
                    );
                    let raw = task.regs_ref().arg1();
                    let mut flags = crate::session::task::CloneFlags::empty();
                    if raw & libc::CLONE_VM as usize != 0 {
                        flags |= crate::session::task::CloneFlags::SHARE_VM;
                    }
                    if raw & libc::CLONE_SIGHAND as usize != 0 {
                        flags |= crate::session::task::CloneFlags::SHARE_SIGHANDLERS;
                    }
                    if raw & libc::CLONE_THREAD as usize != 0 {
                        flags |= crate::session::task::CloneFlags::SHARE_TASK_GROUP;
                    }
                    let child =
                        session.create_cloned_task(&task, flags, new_tid as i32, new_tid as i32);
                    drop(task);
                    child.borrow_mut().wait(None);
                }
                Some(libc::PTRACE_EVENT_EXIT) => {
                    log!(LogWarn, "task died inside real-executed syscall");
                    task.in_syscall = false;
                    return;
                }
                _ => (),
            }
        }
        let mut task = t.borrow_mut();
        task.in_syscall = false;
        // Mirror the recorded cache mutation.
        let regs = *frame.regs_ref();
        let vm = task.vm();
        if syscall.number == crate::kernel_abi::syscall_number_for_munmap(arch) {
            vm.unmap(regs.arg1().into(), regs.arg2());
        } else if syscall.number == crate::kernel_abi::syscall_number_for_mprotect(arch) {
            vm.protect(
                regs.arg1().into(),
                regs.arg2(),
                nix::sys::mman::ProtFlags::from_bits_truncate(regs.arg3() as i32),
            );
        } else if syscall.number == crate::kernel_abi::syscall_number_for_brk(arch) {
            let new_end = regs.syscall_result().into();
            if vm.brk_region_start().is_null() {
                vm.init_brk(new_end);
            } else {
                vm.brk(
                    new_end,
                    nix::sys::mman::ProtFlags::PROT_READ | nix::sys::mman::ProtFlags::PROT_WRITE,
                );
            }
        } else if syscall.number == crate::kernel_abi::x64::MREMAP {
            vm.remap(
                regs.arg1().into(),
                regs.arg2(),
                regs.syscall_result().into(),
                regs.arg3(),
            );
        }
        drop(task);
        apply_raw_data(session, t, frame);
        let mut task = t.borrow_mut();
        task.set_regs(frame.regs_ref());
        task.flush_regs();
        return;
    }

    if is_mmap_syscall(syscall.number, arch) {
        replay_mmap(session, t, frame);
    }

    // Inject recorded memory effects.
    apply_raw_data(session, t, frame);

    // Step over the suppressed syscall instruction and install the
    // recorded register state, making the result visible.
    {
        let mut task = t.borrow_mut();
        if task.in_syscall {
            task.resume_execution(
                ResumeRequest::ResumeSysemuSinglestep,
                WaitRequest::ResumeWait,
                TicksRequest::ResumeNoTicks,
                None,
            );
            task.in_syscall = false;
        }
        task.set_regs(frame.regs_ref());
        task.flush_regs();
    }
}

/// The exec executes for real: run to the PTRACE_EVENT_EXEC, rebuild the
/// address-space cache from the kernel and reinstall the syscall page, as
/// at record time.
fn replay_exec(session: &SessionSharedPtr, t: &TaskSharedPtr) {
    let mut task = t.borrow_mut();
    loop {
        task.resume_execution(
            ResumeRequest::ResumeSyscall,
            WaitRequest::ResumeWait,
            TicksRequest::ResumeNoTicks,
            None,
        );
        let status = task.status();
        if status.ptrace_event() == Some(libc::PTRACE_EVENT_EXEC as u32) {
            break;
        }
        if status.ptrace_event() == Some(libc::PTRACE_EVENT_EXIT as u32) {
            log!(LogWarn, "task died during exec replay");
            return;
        }
    }
    task.in_syscall = false;

    let exe = std::fs::read_link(format!("/proc/{}/exe", task.tid))
        .map(|p| p.into_os_string())
        .unwrap_or_default();
    session.post_exec_vm(&mut task, &exe);
    {
        let mut remote = AutoRemoteSyscalls::new(&mut task);
        crate::auto_remote_syscalls::map_syscall_page(&mut remote);
    }
}

/// Redo a recorded mmap: from a live backing file, from the in-trace copy,
/// or from zeroes, per the recorded policy decision.
fn replay_mmap(session: &SessionSharedPtr, t: &TaskSharedPtr, frame: &TraceFrame) {
    let replay = session.as_replay().unwrap();
    let entry = replay
        .trace_reader
        .borrow_mut()
        .read_mapped_region(ValidateSourceFile::Validate, TimeConstraint::AnyTime);
    let (map, res, data) = match entry {
        Some(e) => e,
        None => {
            log!(LogWarn, "mmap frame without mmaps entry at {}", frame.time());
            return;
        }
    };

    let mut task = t.borrow_mut();
    let prot = map.prot();
    let flags = map.flags();
    {
        let mut remote = AutoRemoteSyscalls::new(&mut task);
        match data.source {
            MappedDataSource::SourceZero | MappedDataSource::SourceTrace => {
                remote.infallible_mmap_syscall(
                    Some(map.start()),
                    map.size(),
                    (prot | nix::sys::mman::ProtFlags::PROT_WRITE).bits(),
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
                    -1,
                    0,
                );
            }
            MappedDataSource::SourceFile => {
                // Open the backing file in the tracee and map it at the
                // recorded address.
                let path_bytes: Vec<u8> = {
                    use std::os::unix::ffi::OsStrExt;
                    let mut v = data.filename.as_os_str().as_bytes().to_vec();
                    v.push(0);
                    v
                };
                let remote_path = remote.push_bytes(&path_bytes);
                let child_fd = remote.infallible_syscall(
                    crate::kernel_abi::syscall_number_for_openat(crate::kernel_abi::NATIVE_ARCH),
                    &[
                        (-100i64) as usize, // AT_FDCWD
                        remote_path.as_usize(),
                        OFlag::O_RDONLY.bits() as usize,
                    ],
                ) as i32;
                remote.infallible_mmap_syscall(
                    Some(map.start()),
                    map.size(),
                    prot.bits(),
                    flags.bits() | libc::MAP_FIXED,
                    child_fd,
                    data.data_offset_bytes,
                );
                remote.infallible_close_syscall(child_fd);
            }
        }
    }
    let vm = task.vm();
    vm.map(
        map.start(),
        map.size(),
        prot,
        flags,
        map.file_offset_bytes(),
        res,
    );
}

/// Memory writes recorded as raw data are poked into the tracee at replay
/// time.
fn apply_raw_data(session: &SessionSharedPtr, t: &TaskSharedPtr, frame: &TraceFrame) {
    let replay = session.as_replay().unwrap();
    loop {
        let raw = replay
            .trace_reader
            .borrow_mut()
            .read_raw_data_for_frame(frame);
        let raw = match raw {
            Some(raw) => raw,
            None => break,
        };
        let mut task = t.borrow_mut();
        let mut ok = true;
        task.write_bytes_helper(raw.addr, &raw.data, Some(&mut ok), WriteFlags::empty());
        if !ok {
            log!(
                LogWarn,
                "couldn't poke {} recorded bytes at {}",
                raw.data.len(),
                raw.addr
            );
        }
    }
}

/// Program the branch counter to overflow at the remaining recorded ticks
/// and advance the task until the count is reached. Overshoot within the
/// skid region is closed by single-stepping.
fn advance_to_ticks(t: &TaskSharedPtr, target: Ticks) {
    let mut task = t.borrow_mut();
    loop {
        let now = task.tick_count();
        if now >= target {
            break;
        }
        let remaining = target - now;
        if remaining > PerfCounters::skid_size() {
            task.resume_execution(
                ResumeRequest::ResumeCont,
                WaitRequest::ResumeWait,
                TicksRequest::ResumeWithTicksRequest(remaining - PerfCounters::skid_size()),
                None,
            );
        } else {
            task.resume_execution(
                ResumeRequest::ResumeSinglestep,
                WaitRequest::ResumeWait,
                TicksRequest::ResumeUnlimitedTicks,
                None,
            );
        }
        if task.status().ptrace_event() == Some(libc::PTRACE_EVENT_EXIT as u32) {
            log!(LogWarn, "task died while advancing to tick target");
            return;
        }
    }
}

/// Halt at the same instruction boundary: the recorded register file must
/// match the replayed one.
fn validate_registers(session: &SessionSharedPtr, t: &TaskSharedPtr, frame: &TraceFrame) {
    if !session.can_validate() {
        return;
    }
    let task = t.borrow();
    if !task.regs_ref().matches(frame.regs_ref(), true) {
        ed_assert!(
            &*task,
            false,
            "Replay diverged from recording at event {} (ticks {}/{})",
            frame.time(),
            task.tick_count(),
            frame.ticks()
        );
    }
}

fn maybe_validate_checksums(session: &SessionSharedPtr, t: &TaskSharedPtr, frame: &TraceFrame) {
    // Checksums are stored at syscall exits; validate on the same cadence.
    let at_syscall_exit = frame.event().is_syscall_event()
        && frame.event().syscall().state == SyscallState::ExitingSyscall;
    if !at_syscall_exit || !session.should_checksum(frame) {
        return;
    }
    let mut task = t.borrow_mut();
    session.checksum_process_memory(&mut task, frame.time(), false);
    log!(LogInfo, "checksums validated at {}", frame.time());
}
