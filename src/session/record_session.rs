use crate::{
    event::{Event, SignalDeterministic, SyscallState},
    flags::Flags,
    kernel_abi::{is_exit_group_syscall, is_exit_syscall, NATIVE_ARCH},
    log::{LogDebug, LogInfo, LogWarn},
    perf_counters::TIME_SLICE_SIGNAL,
    preload_interface::MAGIC_SAVE_DATA_FD,
    remote_ptr::{RemotePtr, Void},
    session::{
        address_space::resource::{FileId, PseudoDev, Resource},
        dump_process_memory,
        task::{
            CloneFlags, ResumeRequest, Task, TaskSharedPtr, TicksRequest, WaitRequest,
        },
        SessionSharedPtr,
    },
    sig::Sig,
    trace::{
        trace_frame::TraceFrame,
        trace_task_event::TraceTaskEvent,
        trace_writer::{MappingOrigin, RecordInTrace},
    },
    util::monotonic_now_sec,
    wait_status::WaitStatus,
};
use libc::pid_t;
use nix::sys::{
    mman::{MapFlags, ProtFlags},
    stat::stat,
};
use std::{
    convert::TryFrom,
    ffi::{CString, OsStr, OsString},
    os::unix::ffi::OsStrExt,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RecordStatus {
    /// The recording is making progress.
    StepContinue,
    /// All tasks have exited.
    AllTasksExited,
}

pub struct RecordResult {
    pub status: RecordStatus,
    pub exit_code: i32,
}

/// Start the initial tracee: fork, PTRACE_TRACEME in the child, exec. The
/// parent waits for the post-traceme SIGSTOP, sets its ptrace options and
/// builds the initial Task.
pub fn spawn_tracee(session: &SessionSharedPtr, exe: &OsStr, args: &[OsString]) -> TaskSharedPtr {
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        fatal!("fork() failed");
    }
    if pid == 0 {
        // Tracee side.
        unsafe {
            libc::ptrace(libc::PTRACE_TRACEME, 0, 0, 0);
            libc::raise(libc::SIGSTOP);
        }
        let exe_c = CString::new(exe.as_bytes()).unwrap();
        let mut argv_c: Vec<CString> = Vec::with_capacity(args.len() + 1);
        argv_c.push(exe_c.clone());
        for arg in args {
            argv_c.push(CString::new(arg.as_bytes()).unwrap());
        }
        let mut argv_ptrs: Vec<*const libc::c_char> =
            argv_c.iter().map(|a| a.as_ptr()).collect();
        argv_ptrs.push(std::ptr::null());
        unsafe {
            libc::execv(exe_c.as_ptr(), argv_ptrs.as_ptr());
            // Only reached when exec failed.
            libc::_exit(127);
        }
    }

    // Tracer side: sync with the SIGSTOP.
    let mut raw_status: i32 = 0;
    let ret = unsafe { libc::waitpid(pid, &mut raw_status, libc::__WALL) };
    if ret != pid {
        fatal!("waitpid on spawned tracee {} failed", pid);
    }
    let options = libc::PTRACE_O_TRACESYSGOOD
        | libc::PTRACE_O_TRACEEXEC
        | libc::PTRACE_O_TRACEEXIT
        | libc::PTRACE_O_TRACECLONE
        | libc::PTRACE_O_TRACEFORK
        | libc::PTRACE_O_TRACEVFORK
        | libc::PTRACE_O_EXITKILL;
    unsafe {
        libc::ptrace(
            libc::PTRACE_SETOPTIONS,
            pid,
            0,
            options as usize as *mut libc::c_void,
        );
    }

    let task = session.create_initial_task(pid, pid, exe);
    {
        let mut t = task.borrow_mut();
        t.did_waitpid(WaitStatus::new(raw_status));
        t.open_mem_fd();
    }
    session.scheduler().set_current(Some(task.clone()));
    log!(LogInfo, "Spawned tracee {} for {:?}", pid, exe);
    task
}

/// One iteration of the record loop: pick a task, advance it, classify the
/// stop, and write whatever the stop implies into the trace.
pub fn record_step(session: &SessionSharedPtr) -> RecordResult {
    let t = match session.scheduler().get_next_task(session) {
        Some(t) => t,
        None => {
            return RecordResult {
                status: RecordStatus::AllTasksExited,
                exit_code: last_exit_code(session),
            }
        }
    };

    {
        let mut task = t.borrow_mut();
        if task.is_stopped() {
            let budget = session.scheduler().interrupt_after_ticks(&task);
            let sig = task.sig_to_deliver.take();
            task.resume_execution(
                ResumeRequest::ResumeSyscall,
                WaitRequest::ResumeWait,
                TicksRequest::ResumeWithTicksRequest(budget),
                sig,
            );
        }
    }

    let status = t.borrow().status();
    if let Some(event) = status.ptrace_event() {
        handle_ptrace_event(session, &t, event);
    } else if status.is_syscall() {
        handle_syscall_stop(session, &t);
    } else if let Some(sig) = status.stop_sig() {
        handle_signal_stop(session, &t, sig);
    } else if status.group_stop_sig().is_some() {
        // Group stops carry no recordable effect of their own; resume.
        log!(LogDebug, "group stop for {}", t.borrow().tid);
    } else if let Some(sig) = status.fatal_sig() {
        handle_fatal_signal(session, &t, sig);
    } else if status.exit_code().is_some() {
        finish_task_exit(session, &t);
    }

    RecordResult {
        status: RecordStatus::StepContinue,
        exit_code: 0,
    }
}

/// Finish the trace: flush substreams and update the latest-trace symlink.
pub fn finish_recording(session: &SessionSharedPtr) {
    let record = session.as_record().unwrap();
    let mut writer = record.trace_writer.borrow_mut();
    writer.close();
    writer.make_latest_trace();
    log!(LogInfo, "Recording finished in {:?}", writer.dir());
}

fn last_exit_code(session: &SessionSharedPtr) -> i32 {
    // The exit status of the original task group stands for the recording.
    session
        .initial_task_group_exit_status()
        .and_then(|status| status.exit_code())
        .unwrap_or(0)
}

fn handle_ptrace_event(session: &SessionSharedPtr, t: &TaskSharedPtr, event: u32) {
    match event as i32 {
        libc::PTRACE_EVENT_EXEC => handle_exec(session, t),
        libc::PTRACE_EVENT_FORK | libc::PTRACE_EVENT_VFORK | libc::PTRACE_EVENT_CLONE => {
            handle_clone(session, t, event)
        }
        libc::PTRACE_EVENT_EXIT => finish_task_exit(session, t),
        other => {
            log!(LogWarn, "Unhandled ptrace event {}", other);
        }
    }
}

/// An execve succeeded: record the task event, rebuild the AddressSpace
/// from the kernel's view, and run the post-exec patching pass.
fn handle_exec(session: &SessionSharedPtr, t: &TaskSharedPtr) {
    let exe = {
        let task = t.borrow();
        std::fs::read_link(format!("/proc/{}/exe", task.tid))
            .map(|p| p.into_os_string())
            .unwrap_or_default()
    };
    log!(LogDebug, "PTRACE_EVENT_EXEC: {:?}", exe);

    {
        let record = session.as_record().unwrap();
        let tid = t.borrow().rec_tid;
        record
            .trace_writer
            .borrow_mut()
            .write_task_event(&TraceTaskEvent::for_exec(tid, &exe, vec![]));
    }

    let vm = {
        let mut task = t.borrow_mut();
        session.post_exec_vm(&mut task, &exe)
    };

    // Install the syscall page at its fixed address; the patcher needs its
    // trusted entry points.
    {
        let mut task = t.borrow_mut();
        let mut remote = crate::auto_remote_syscalls::AutoRemoteSyscalls::new(&mut task);
        crate::auto_remote_syscalls::map_syscall_page(&mut remote);
    }

    // Record the post-exec mappings so replay can reconstruct them.
    {
        let record = session.as_record().unwrap();
        let mut writer = record.trace_writer.borrow_mut();
        let mut task = t.borrow_mut();
        for entry in vm.maps() {
            let st = stat(entry.res.fsname()).ok();
            let origin = MappingOrigin::ExecMapping;
            if writer.write_mapped_region(&entry.map, &entry.res, st.as_ref(), origin)
                == RecordInTrace::RecordInTrace
            {
                record_mapping_data(&mut writer, &mut task, &entry);
            }
        }
    }

    {
        let patcher = session.patcher_for(vm.uid());
        let mut task = t.borrow_mut();
        patcher.borrow_mut().patch_after_exec(&mut task);
    }
}

fn handle_clone(session: &SessionSharedPtr, t: &TaskSharedPtr, event: u32) {
    let mut new_tid: libc::c_ulong = 0;
    {
        let task = t.borrow();
        task.ptrace_if_alive(
            libc::PTRACE_GETEVENTMSG as u32,
            RemotePtr::null(),
            &mut new_tid as *mut libc::c_ulong as *mut libc::c_void,
        );
    }
    let new_tid = new_tid as pid_t;

    // The sharing bits: a plain fork shares nothing; CLONE events share
    // according to the tracee's clone flags in arg1.
    let flags = if event as i32 == libc::PTRACE_EVENT_CLONE {
        let raw = t.borrow().regs_ref().arg1();
        let mut flags = CloneFlags::empty();
        if raw & libc::CLONE_VM as usize != 0 {
            flags |= CloneFlags::SHARE_VM;
        }
        if raw & libc::CLONE_SIGHAND as usize != 0 {
            flags |= CloneFlags::SHARE_SIGHANDLERS;
        }
        if raw & libc::CLONE_THREAD as usize != 0 {
            flags |= CloneFlags::SHARE_TASK_GROUP;
        }
        flags
    } else {
        CloneFlags::empty()
    };

    log!(LogDebug, "new task {} cloned with {:?}", new_tid, flags);

    let child = {
        let parent = t.borrow();
        session.create_cloned_task(&parent, flags, new_tid, new_tid)
    };

    // The child starts in a SIGSTOP-ish stop; adopt it.
    child.borrow_mut().wait(None);

    {
        let record = session.as_record().unwrap();
        let parent_tid = t.borrow().rec_tid;
        let raw_flags = t.borrow().regs_ref().arg1() as u32;
        record
            .trace_writer
            .borrow_mut()
            .write_task_event(&TraceTaskEvent::for_clone(new_tid, parent_tid, raw_flags));
    }
}

fn handle_syscall_stop(session: &SessionSharedPtr, t: &TaskSharedPtr) {
    let entering = !t.borrow().in_syscall;
    if entering {
        handle_syscall_entry(session, t);
    } else {
        handle_syscall_exit(session, t);
    }
}

fn handle_syscall_entry(session: &SessionSharedPtr, t: &TaskSharedPtr) {
    let (syscallno, arch) = {
        let task = t.borrow();
        (task.regs_ref().original_syscallno() as i32, task.arch())
    };

    // The preload library's rendezvous: adopt its trampolines, then let
    // the call complete as a no-op.
    if syscallno == crate::preload_interface::RETCALL_INIT_PRELOAD {
        let patcher = {
            let task = t.borrow();
            session.patcher_for(task.vm().uid())
        };
        let mut task = t.borrow_mut();
        patcher.borrow_mut().patch_at_preload_init(&mut task);
        task.in_syscall = true;
        return;
    }

    // Hot syscall sites whose following bytes match a hook template are
    // redirected through the trampoline; refusal is a soft degradation
    // and the syscall proceeds via the trap path.
    if session.can_validate() {
        let patcher = {
            let task = t.borrow();
            session.patcher_for(task.vm().uid())
        };
        let patched = {
            let mut task = t.borrow_mut();
            patcher.borrow_mut().try_patch_syscall(&mut task)
        };
        if patched {
            record_current_frame(session, t, Event::PatchSyscall);
            return;
        }
    }

    t.borrow_mut().in_syscall = true;

    // The exit handshake: hijack SYS_exit so cleanup runs while the tracee
    // is alive, then let the real exit proceed.
    if is_exit_syscall(syscallno, arch) || is_exit_group_syscall(syscallno, arch) {
        record_current_frame(
            session,
            t,
            Event::new_syscall(arch, syscallno, SyscallState::EnteringSyscall),
        );
        let single_task = t.borrow().task_group().borrow().task_set().len() == 1;
        if is_exit_syscall(syscallno, arch) || single_task {
            let mut task = t.borrow_mut();
            task.hijack_exit_to_gettid(arch);
            // Cleanup happens here, with the task still alive.
            task.advance_real_exit();
        }
        return;
    }

    record_current_frame(
        session,
        t,
        Event::new_syscall(arch, syscallno, SyscallState::EnteringSyscall),
    );
}

fn handle_syscall_exit(session: &SessionSharedPtr, t: &TaskSharedPtr) {
    t.borrow_mut().in_syscall = false;
    let (syscallno, arch) = {
        let task = t.borrow();
        (task.regs_ref().original_syscallno() as i32, task.arch())
    };

    process_syscall_effects(session, t, syscallno);

    record_current_frame(
        session,
        t,
        Event::new_syscall(arch, syscallno, SyscallState::ExitingSyscall),
    );

    // A signal that raced with the syscall was stashed; now that the
    // syscall event is complete it can take the normal pipeline.
    if t.borrow().has_stashed_sig() {
        let sig_num = {
            let mut task = t.borrow_mut();
            let stashed = task.pop_stash_sig();
            stashed.siginfo.si_signo
        };
        if let Ok(sig) = Sig::try_from(sig_num) {
            record_and_arm_signal(session, t, sig);
        }
    }

    maybe_checksum_and_dump(session, t);
}

/// Apply the memory-map effects of mmap-class syscalls to the AddressSpace
/// cache and record the data the syscall produced.
fn process_syscall_effects(session: &SessionSharedPtr, t: &TaskSharedPtr, syscallno: i32) {
    let regs = *t.borrow().regs_ref();
    let result = regs.syscall_result_signed();
    let failed = result < 0 && result > -4096;

    match syscallno as i64 {
        libc::SYS_write => {
            let fd = regs.arg1() as i32;
            if fd == MAGIC_SAVE_DATA_FD {
                // The magic fd doesn't really exist; record the bytes and
                // emulate success. Replay validates writes against them.
                let addr: RemotePtr<Void> = regs.arg2().into();
                let len = regs.arg3();
                let mut buf = vec![0u8; len];
                let mut task = t.borrow_mut();
                if task
                    .read_bytes_fallible(addr, &mut buf)
                    .map_or(false, |n| n == len)
                {
                    let record = session.as_record().unwrap();
                    record
                        .trace_writer
                        .borrow_mut()
                        .write_raw(task.rec_tid, &buf, addr.as_usize());
                    let mut r = *task.regs_ref();
                    r.set_syscall_result(len);
                    task.set_regs(&r);
                }
            } else if !failed && (fd == libc::STDOUT_FILENO || fd == libc::STDERR_FILENO) {
                // Record the written bytes so replay can reproduce them at
                // the tracee's buffer address.
                let addr: RemotePtr<Void> = regs.arg2().into();
                let len = regs.arg3();
                let mut buf = vec![0u8; len];
                let mut task = t.borrow_mut();
                if task
                    .read_bytes_fallible(addr, &mut buf)
                    .map_or(false, |n| n == len)
                {
                    if Flags::get().mark_stdio {
                        eprintln!(
                            "[retrace {} {}]",
                            task.tgid(),
                            session.current_frame_time()
                        );
                    }
                    let record = session.as_record().unwrap();
                    record
                        .trace_writer
                        .borrow_mut()
                        .write_raw(task.rec_tid, &buf, addr.as_usize());
                }
            }
        }
        libc::SYS_brk if !failed => {
            let new_end: RemotePtr<Void> = regs.syscall_result().into();
            let vm = t.borrow().vm();
            if vm.brk_region_start().is_null() {
                vm.init_brk(new_end);
            } else {
                vm.brk(new_end, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE);
            }
        }
        libc::SYS_mmap if !failed => {
            process_mmap(session, t, &regs);
        }
        libc::SYS_munmap if !failed => {
            let vm = t.borrow().vm();
            vm.unmap(regs.arg1().into(), regs.arg2());
        }
        libc::SYS_mprotect if !failed => {
            let vm = t.borrow().vm();
            vm.protect(
                regs.arg1().into(),
                regs.arg2(),
                ProtFlags::from_bits_truncate(regs.arg3() as i32),
            );
        }
        libc::SYS_mremap if !failed => {
            let vm = t.borrow().vm();
            vm.remap(
                regs.arg1().into(),
                regs.arg2(),
                regs.syscall_result().into(),
                regs.arg3(),
            );
        }
        libc::SYS_rt_sigaction if !failed => {
            record_sigaction(t, &regs);
        }
        _ => (),
    }
}

fn process_mmap(session: &SessionSharedPtr, t: &TaskSharedPtr, regs: &crate::registers::Registers) {
    let addr: RemotePtr<Void> = regs.syscall_result().into();
    let length = regs.arg2();
    let prot = ProtFlags::from_bits_truncate(regs.arg3() as i32);
    let flags = MapFlags::from_bits_truncate(regs.arg4() as i32);
    let fd = regs.arg5() as i32;
    let offset = regs.arg6() as u64;

    let res = if flags.contains(MapFlags::MAP_ANONYMOUS) {
        Resource::anonymous(session.next_anonymous_inode())
    } else {
        // Identify the backing through the tracee's own fd link.
        let tid = t.borrow().tid;
        let fsname = std::fs::read_link(format!("/proc/{}/fd/{}", tid, fd))
            .map(|p| p.into_os_string())
            .unwrap_or_default();
        match stat(fsname.as_os_str()) {
            Ok(st) => Resource::new(FileId::real(st.st_dev, st.st_ino), &fsname),
            Err(_) => Resource::pseudo(PseudoDev::SharedMmapFile, &fsname),
        }
    };

    let vm = t.borrow().vm();
    let map = vm.map(addr, length, prot, flags, offset, res.clone());

    let record = session.as_record().unwrap();
    let st = stat(res.fsname()).ok();
    let record_in_trace = record.trace_writer.borrow_mut().write_mapped_region(
        &map,
        &res,
        st.as_ref(),
        MappingOrigin::SyscallMapping,
    );
    if record_in_trace == RecordInTrace::RecordInTrace {
        let entry = crate::session::address_space::MappingEntry::new(map, res);
        let mut task = t.borrow_mut();
        record_mapping_data(&mut record.trace_writer.borrow_mut(), &mut task, &entry);
    }
}

fn record_mapping_data(
    writer: &mut crate::trace::trace_writer::TraceWriter,
    task: &mut Task,
    entry: &crate::session::address_space::MappingEntry,
) {
    let mut buf = vec![0u8; entry.map.size()];
    let nread = task
        .read_bytes_fallible(entry.map.start(), &mut buf)
        .unwrap_or(0);
    writer.write_raw(task.rec_tid, &buf[..nread], entry.map.start().as_usize());
}

/// Track the tracee's disposition table as it installs handlers.
fn record_sigaction(t: &TaskSharedPtr, regs: &crate::registers::Registers) {
    let sig = match Sig::try_from(regs.arg1() as i32) {
        Ok(sig) => sig,
        Err(_) => return,
    };
    let act_ptr: RemotePtr<Void> = regs.arg2().into();
    if act_ptr.is_null() {
        return;
    }

    // struct kernel_sigaction: handler, flags, restorer, mask.
    let mut task = t.borrow_mut();
    let handler: usize = task.read_val_mem(RemotePtr::<usize>::new(act_ptr.as_usize()), None);
    let sa_flags: usize =
        task.read_val_mem(RemotePtr::<usize>::new(act_ptr.as_usize() + 8), None);
    let restorer: usize =
        task.read_val_mem(RemotePtr::<usize>::new(act_ptr.as_usize() + 16), None);
    let mask: u64 = task.read_val_mem(RemotePtr::<u64>::new(act_ptr.as_usize() + 24), None);

    let action = match handler {
        0 => crate::session::sighandlers::SigAction::Default,
        1 => crate::session::sighandlers::SigAction::Ignore,
        h => crate::session::sighandlers::SigAction::UserHandler {
            handler: RemotePtr::new(h),
            flags: sa_flags,
            restorer: RemotePtr::new(restorer),
            mask,
        },
    };
    let resethand = sa_flags & libc::SA_RESETHAND as usize != 0;
    task.sighandlers()
        .borrow_mut()
        .set(sig, action, resethand);
}

fn handle_signal_stop(session: &SessionSharedPtr, t: &TaskSharedPtr, sig: Sig) {
    if sig == TIME_SLICE_SIGNAL {
        // The branch counter fired: this is a scheduling preemption, the
        // only legitimate asynchronous one. Record it so replay preempts
        // at the same tick count.
        record_current_frame(session, t, Event::Sched);
        session.scheduler().expire_timeslice();
        return;
    }

    // A signal racing with an in-flight syscall is deferred until the
    // syscall event completes.
    {
        let mut task = t.borrow_mut();
        if task.in_syscall && !task.has_stashed_sig() {
            task.stash_sig();
            return;
        }
    }

    record_and_arm_signal(session, t, sig);
}

/// Record the signal and its delivery, and arm it for the next resume so
/// the handler (or default action) runs under observation.
fn record_and_arm_signal(session: &SessionSharedPtr, t: &TaskSharedPtr, sig: Sig) {
    let deterministic = if t.borrow().get_siginfo().si_code > 0 {
        SignalDeterministic::DeterministicSig
    } else {
        SignalDeterministic::NondeterministicSig
    };
    record_current_frame(session, t, Event::new_signal(sig, deterministic));

    {
        let mut task = t.borrow_mut();
        task.sig_to_deliver = Some(sig);
        let sighandlers = task.sighandlers();
        let is_user_handler = sighandlers.borrow().get(sig).is_user_handler();
        if is_user_handler {
            sighandlers.borrow_mut().reset_handler_if_resethand(sig);
        }
    }
    record_current_frame(
        session,
        t,
        Event::SignalDelivery(crate::event::SignalEventData { sig, deterministic }),
    );
}

fn handle_fatal_signal(session: &SessionSharedPtr, t: &TaskSharedPtr, sig: Sig) {
    log!(LogDebug, "task {} got fatal {}", t.borrow().tid, sig);
    // A fatal signal destabilizes the whole group: every member will die
    // without further scheduling.
    t.borrow().task_group().borrow_mut().destabilize();
    finish_task_exit(session, t);
}

/// Record the exit frame and task event, then reap.
fn finish_task_exit(session: &SessionSharedPtr, t: &TaskSharedPtr) {
    let status = t.borrow().status();
    {
        let tg = t.borrow().task_group();
        tg.borrow_mut().exit_status = status;
    }
    record_current_frame(session, t, Event::Exit);
    {
        let record = session.as_record().unwrap();
        let tid = t.borrow().rec_tid;
        record
            .trace_writer
            .borrow_mut()
            .write_task_event(&TraceTaskEvent::for_exit(tid, status));
    }
    let rec_tid = t.borrow().rec_tid;
    t.borrow_mut().destroy();
    session.on_destroy_task(crate::taskish_uid::TaskUid::new_with(rec_tid, 0));
}

/// Write one frame for the task's current state.
fn record_current_frame(session: &SessionSharedPtr, t: &TaskSharedPtr, ev: Event) {
    let record = session.as_record().unwrap();
    let mut writer = record.trace_writer.borrow_mut();
    let task = t.borrow();
    let mut frame = TraceFrame::new_with(
        writer.time(),
        task.rec_tid,
        ev,
        task.tick_count(),
        monotonic_now_sec(),
    );
    if frame.event().has_exec_info() {
        frame.set_regs(*task.regs_ref());
    }
    writer.write_frame(&frame);
}

fn maybe_checksum_and_dump(session: &SessionSharedPtr, t: &TaskSharedPtr) {
    let time = session.current_frame_time();
    let (should_checksum, dump_at) = {
        let frame_like = TraceFrame::new_with(
            time,
            t.borrow().rec_tid,
            Event::new_syscall(NATIVE_ARCH, 0, SyscallState::ExitingSyscall),
            0,
            0.0,
        );
        (
            session.should_checksum(&frame_like),
            Flags::get().dump_at == Some(time),
        )
    };
    if should_checksum {
        let mut task = t.borrow_mut();
        session.checksum_process_memory(&mut task, time, true);
    }
    if dump_at {
        let record = session.as_record().unwrap();
        let dir = record.trace_writer.borrow().dir().to_path_buf();
        let mut task = t.borrow_mut();
        dump_process_memory(&mut task, &dir, time, "dump_at");
    }
}
