use crate::{
    event::Event,
    kernel_abi::{syscall_number_for_gettid, SupportedArch, NATIVE_ARCH},
    kernel_metadata::{is_zombie_process, ptrace_req_name},
    kernel_supplement::{PTRACE_SYSEMU, PTRACE_SYSEMU_SINGLESTEP},
    log::{LogDebug, LogWarn},
    perf_counters::{PerfCounters, TIME_SLICE_SIGNAL},
    registers::Registers,
    remote_code_ptr::RemoteCodePtr,
    remote_ptr::{RemotePtr, Void},
    scoped_fd::ScopedFd,
    session::{
        address_space::{AddressSpaceSharedPtr, NUM_X86_WATCHPOINTS, WatchType},
        sighandlers::SighandlersSharedPtr,
        task_group::TaskGroupSharedPtr,
        SessionSharedPtr, SessionSharedWeakPtr,
    },
    sig::Sig,
    taskish_uid::TaskUid,
    ticks::Ticks,
    trace::trace_frame::FrameTime,
    util::to_timeval,
    wait_status::{is_signal_triggered_by_ptrace_interrupt, WaitStatus},
};
use libc::{
    pid_t, siginfo_t, ESRCH, PTRACE_GETREGS, PTRACE_GETSIGINFO, PTRACE_PEEKDATA, PTRACE_PEEKUSER,
    PTRACE_POKEDATA, PTRACE_POKEUSER, PTRACE_SETREGS, __WALL,
};
use nix::errno::{errno, Errno};
use std::{
    cell::RefCell,
    cmp::min,
    ffi::{CString, OsString},
    mem::size_of,
    os::raw::{c_long, c_void},
    ptr,
    rc::{Rc, Weak},
};

pub type TaskSharedPtr = Rc<RefCell<Task>>;
pub type TaskSharedWeakPtr = Weak<RefCell<Task>>;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum ResumeRequest {
    ResumeCont = libc::PTRACE_CONT,
    ResumeSinglestep = libc::PTRACE_SINGLESTEP,
    ResumeSyscall = libc::PTRACE_SYSCALL,
    ResumeSysemu = PTRACE_SYSEMU,
    ResumeSysemuSinglestep = PTRACE_SYSEMU_SINGLESTEP,
}

#[derive(Copy, Clone, Eq, PartialEq)]
pub enum WaitRequest {
    /// After resuming, blocking-waitpid() until the tracee status changes.
    ResumeWait,
    /// Don't wait after resuming.
    ResumeNonblocking,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TicksRequest {
    /// No ticks expected; skips stopping and restarting the counters.
    ResumeNoTicks,
    ResumeUnlimitedTicks,
    /// Interrupt after this many ticks. Must stay below MAX_TICKS_REQUEST.
    ResumeWithTicksRequest(Ticks),
}

/// Positive tick requests above this are coding errors.
pub const MAX_TICKS_REQUEST: Ticks = 2_000_000_000;

bitflags! {
    pub struct WriteFlags: u32 {
        const IS_BREAKPOINT_RELATED = 0x1;
    }
}

bitflags! {
    /// Which resources a cloned child shares with its parent.
    pub struct CloneFlags: u32 {
        const SHARE_SIGHANDLERS = 0x1;
        const SHARE_TASK_GROUP = 0x2;
        const SHARE_VM = 0x4;
    }
}

/// A signal that raced with another event and was put aside; both the wait
/// status and the siginfo are preserved. At most one may be stashed.
#[derive(Copy, Clone)]
pub struct StashedSignal {
    pub status: WaitStatus,
    pub siginfo: siginfo_t,
}

const NUM_X86_DEBUG_REGS: usize = 8;

/// The watchdog applied to blocking waits during recording.
pub const WAIT_WATCHDOG_SECONDS: f64 = 3.0;

/// The ptrace stub over one tracee thread.
pub struct Task {
    /// The real OS tid of the tracee.
    pub tid: pid_t,
    /// The stable trace identifier. Synonymous with `tid` during recording;
    /// during replay it's the tid that was recorded.
    pub rec_tid: pid_t,
    serial: u32,

    /// Scheduling priority; lower runs first.
    pub priority: i32,

    /// Scratch region used to proxy tracee buffers during interception.
    pub scratch_ptr: RemotePtr<Void>,
    pub scratch_size: usize,

    /// The tracee's mapping of its syscall buffer, when bound.
    pub syscallbuf_child: RemotePtr<crate::preload_interface::syscallbuf_hdr>,
    pub syscallbuf_size: usize,
    /// The tracee's desched-event fd number.
    pub desched_fd_child: i32,

    /// Address cleared and futex-woken on exit (CLONE_CHILD_CLEARTID).
    pub tid_futex: RemotePtr<i32>,

    /// Signal mask currently blocked in the tracee.
    pub blocked_sigs: u64,

    /// True between an observed syscall entry and its matching exit.
    pub in_syscall: bool,
    /// A signal to be delivered at the next resume.
    pub sig_to_deliver: Option<Sig>,

    /// The stack of events being processed during recording.
    pending_events: Vec<Event>,

    stashed_signal: Option<StashedSignal>,

    pub hpc: PerfCounters,

    /// Ticks seen by this task since the last wait.
    ticks: Ticks,

    /// When stopped, our cached registers.
    registers: Registers,
    /// True when `registers` has changes not yet flushed to the tracee.
    registers_dirty: bool,
    /// Whether the cache holds the tracee's registers.
    registers_known: bool,

    /// Where we last resumed execution, for breakpoint reconciliation.
    address_of_last_execution_resume: RemoteCodePtr,
    how_last_execution_resumed: ResumeRequest,

    /// True when waitpid() told us the task is stopped and we haven't
    /// resumed it.
    is_stopped: bool,
    /// True when a PTRACE_EVENT_EXIT has been observed for this task.
    pub seen_ptrace_exit_event: bool,
    /// True when we consumed an exit race detected at resume time.
    detected_unexpected_exit: bool,
    /// After PTRACE_INTERRUPT, any of the next two stops may be the group
    /// stop it induced; see did_waitpid.
    expecting_ptrace_interrupt_stop: u32,

    wait_status: WaitStatus,
    pending_siginfo: siginfo_t,

    session_: SessionSharedWeakPtr,
    vm: RefCell<AddressSpaceSharedPtr>,
    task_group: RefCell<TaskGroupSharedPtr>,
    sighandlers: RefCell<SighandlersSharedPtr>,

    weak_self: TaskSharedWeakPtr,
}

impl Task {
    pub fn new(
        session: SessionSharedWeakPtr,
        tid: pid_t,
        rec_tid: pid_t,
        serial: u32,
        vm: AddressSpaceSharedPtr,
        task_group: TaskGroupSharedPtr,
        sighandlers: SighandlersSharedPtr,
    ) -> Task {
        Task {
            tid,
            rec_tid,
            serial,
            priority: 0,
            scratch_ptr: RemotePtr::null(),
            scratch_size: 0,
            syscallbuf_child: RemotePtr::null(),
            syscallbuf_size: 0,
            desched_fd_child: -1,
            tid_futex: RemotePtr::null(),
            blocked_sigs: 0,
            in_syscall: false,
            sig_to_deliver: None,
            pending_events: Vec::new(),
            stashed_signal: None,
            hpc: PerfCounters::new(tid),
            ticks: 0,
            registers: Registers::new(NATIVE_ARCH),
            registers_dirty: false,
            registers_known: false,
            address_of_last_execution_resume: RemoteCodePtr::null(),
            how_last_execution_resumed: ResumeRequest::ResumeCont,
            is_stopped: false,
            seen_ptrace_exit_event: false,
            detected_unexpected_exit: false,
            expecting_ptrace_interrupt_stop: 0,
            wait_status: WaitStatus::default(),
            pending_siginfo: unsafe { std::mem::zeroed() },
            session_: session,
            vm: RefCell::new(vm),
            task_group: RefCell::new(task_group),
            sighandlers: RefCell::new(sighandlers),
            weak_self: Weak::new(),
        }
    }

    pub fn set_weak_self(&mut self, weak: TaskSharedWeakPtr) {
        self.weak_self = weak;
    }

    pub fn weak_self_clone(&self) -> TaskSharedWeakPtr {
        self.weak_self.clone()
    }

    pub fn tuid(&self) -> TaskUid {
        TaskUid::new_with(self.rec_tid, self.serial)
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }

    pub fn session(&self) -> SessionSharedPtr {
        self.session_.upgrade().unwrap()
    }

    pub fn try_session(&self) -> Option<SessionSharedPtr> {
        self.session_.upgrade()
    }

    pub fn vm(&self) -> AddressSpaceSharedPtr {
        self.vm.borrow().clone()
    }

    pub fn set_vm(&self, vm: AddressSpaceSharedPtr) {
        *self.vm.borrow_mut() = vm;
    }

    pub fn task_group(&self) -> TaskGroupSharedPtr {
        self.task_group.borrow().clone()
    }

    pub fn set_task_group(&self, tg: TaskGroupSharedPtr) {
        *self.task_group.borrow_mut() = tg;
    }

    pub fn sighandlers(&self) -> SighandlersSharedPtr {
        self.sighandlers.borrow().clone()
    }

    pub fn set_sighandlers(&self, sh: SighandlersSharedPtr) {
        *self.sighandlers.borrow_mut() = sh;
    }

    pub fn tgid(&self) -> pid_t {
        self.task_group.borrow().borrow().tgid
    }

    pub fn trace_time(&self) -> FrameTime {
        self.session().current_frame_time()
    }

    pub fn status(&self) -> WaitStatus {
        self.wait_status
    }

    pub fn set_status(&mut self, status: WaitStatus) {
        self.wait_status = status;
    }

    pub fn clear_wait_status(&mut self) {
        self.wait_status = WaitStatus::default();
    }

    pub fn is_stopped(&self) -> bool {
        self.is_stopped
    }

    pub fn is_running(&self) -> bool {
        !self.is_stopped
    }

    pub fn tick_count(&self) -> Ticks {
        self.ticks
    }

    pub fn set_tick_count(&mut self, ticks: Ticks) {
        self.ticks = ticks;
    }

    pub fn get_siginfo(&self) -> &siginfo_t {
        &self.pending_siginfo
    }

    pub fn ip(&self) -> RemoteCodePtr {
        self.regs_ref().ip()
    }

    pub fn arch(&self) -> SupportedArch {
        self.registers.arch()
    }

    pub fn regs_ref(&self) -> &Registers {
        debug_assert!(self.registers_known);
        &self.registers
    }

    pub fn set_regs(&mut self, regs: &Registers) {
        self.registers = *regs;
        self.registers_known = true;
        self.registers_dirty = true;
    }

    /// Push any dirty register changes back into the tracee.
    pub fn flush_regs(&mut self) {
        if !self.registers_dirty {
            return;
        }
        let regs = self.registers.get_ptrace();
        let ok = self.ptrace_if_alive(
            PTRACE_SETREGS as u32,
            RemotePtr::null(),
            &regs as *const libc::user_regs_struct as *mut c_void,
        );
        if !ok {
            log!(LogDebug, "Unexpected process death for {}", self.tid);
        }
        self.registers_dirty = false;
    }

    /// Events the recorder is tracking for this task, as a stack.
    pub fn push_event(&mut self, ev: Event) {
        self.pending_events.push(ev);
    }

    pub fn pop_event(&mut self) -> Option<Event> {
        self.pending_events.pop()
    }

    pub fn current_event(&self) -> Option<&Event> {
        self.pending_events.last()
    }

    /// Put aside a racing signal. Stashing twice is a contract violation.
    pub fn stash_sig(&mut self) {
        ed_assert!(
            self,
            self.stashed_signal.is_none(),
            "Only one signal can be stashed"
        );
        self.stashed_signal = Some(StashedSignal {
            status: self.wait_status,
            siginfo: self.pending_siginfo,
        });
    }

    /// Synthesize a stash as if `sig` had been received with `status`.
    pub fn stash_synthetic_sig(&mut self, sig: Sig, status: WaitStatus) {
        ed_assert!(
            self,
            self.stashed_signal.is_none(),
            "Only one signal can be stashed"
        );
        let mut siginfo: siginfo_t = unsafe { std::mem::zeroed() };
        siginfo.si_signo = sig.as_raw();
        self.stashed_signal = Some(StashedSignal { status, siginfo });
    }

    pub fn has_stashed_sig(&self) -> bool {
        self.stashed_signal.is_some()
    }

    /// Take the stashed signal back, restoring the wait status.
    pub fn pop_stash_sig(&mut self) -> StashedSignal {
        match self.stashed_signal.take() {
            Some(stashed) => {
                self.wait_status = stashed.status;
                self.pending_siginfo = stashed.siginfo;
                stashed
            }
            None => {
                ed_assert!(self, false, "No stashed signal to pop");
                unreachable!()
            }
        }
    }

    /// Resume execution `how`, delivering `sig` if present. After resuming,
    /// `wait_how`. The tick period programs the branch counter; the
    /// watchdog is applied by wait() during recording. Returns false when
    /// the wait (in blocking mode) saw the task already dead.
    pub fn resume_execution(
        &mut self,
        how: ResumeRequest,
        wait_how: WaitRequest,
        tick_period: TicksRequest,
        maybe_sig: Option<Sig>,
    ) -> bool {
        match tick_period {
            TicksRequest::ResumeNoTicks => (),
            TicksRequest::ResumeUnlimitedTicks => {
                self.hpc.reset(0);
            }
            TicksRequest::ResumeWithTicksRequest(tr) => {
                ed_assert!(self, tr <= MAX_TICKS_REQUEST);
                self.hpc.reset(std::cmp::max(1, tr));
            }
        }

        let sig_string = match maybe_sig {
            Some(sig) => format!(", signal: {}", sig),
            None => String::new(),
        };
        log!(
            LogDebug,
            "resuming execution of tid: {} with: {}{} tick_period: {:?}",
            self.tid,
            ptrace_req_name(how as u32),
            sig_string,
            tick_period
        );

        self.address_of_last_execution_resume = self.ip();
        self.how_last_execution_resumed = how;
        self.flush_regs();

        // A stopped task can be woken by a SIGKILL and advance to the
        // PTRACE_EXIT_EVENT stop just before our resume; probe for that
        // during recording so cleanup still sees the task alive.
        let mut exited_early = false;
        if self.session().is_recording() {
            let mut raw_status: i32 = 0;
            let ret = unsafe { libc::waitpid(self.tid, &mut raw_status, libc::WNOHANG | __WALL) };
            if ret == self.tid {
                let status = WaitStatus::new(raw_status);
                ed_assert!(
                    self,
                    status.ptrace_event() == Some(libc::PTRACE_EVENT_EXIT as u32)
                        || status.fatal_sig() == Some(crate::sig::SIGKILL),
                    "got {:?}",
                    status
                );
                exited_early = true;
            }
        }

        if exited_early {
            log!(LogDebug, "Task {} exited unexpectedly", self.tid);
            // wait() will see this and report the ptrace-exit event.
            self.detected_unexpected_exit = true;
        } else {
            let data = maybe_sig.map_or(0usize, |sig| sig.as_raw() as usize);
            self.ptrace_if_alive(how as u32, RemotePtr::null(), data as *mut c_void);
        }

        self.is_stopped = false;
        self.registers_known = false;

        if wait_how == WaitRequest::ResumeWait {
            let watchdog = if self.session().is_recording() {
                Some(WAIT_WATCHDOG_SECONDS)
            } else {
                None
            };
            return self.wait(watchdog);
        }
        true
    }

    /// Block until the tracee's status changes. With a watchdog interval
    /// (recording only), a stuck wait applies PTRACE_INTERRUPT to the
    /// tracee and the induced stop is reconciled into a synthetic
    /// time-slice signal. Returns false when the task turned out dead.
    pub fn wait(&mut self, maybe_interrupt_after_elapsed: Option<f64>) -> bool {
        let interrupt_after_elapsed = maybe_interrupt_after_elapsed.unwrap_or(0.0);
        debug_assert!(interrupt_after_elapsed >= 0.0);
        log!(LogDebug, "going into blocking waitpid({}) ...", self.tid);
        ed_assert!(
            self,
            self.session().is_recording() || interrupt_after_elapsed == 0.0
        );

        if self.detected_unexpected_exit {
            self.detected_unexpected_exit = false;
            self.did_waitpid(WaitStatus::for_ptrace_event(libc::PTRACE_EVENT_EXIT));
            return false;
        }

        let mut status: WaitStatus;
        let mut sent_wait_interrupt = false;
        let mut ret: pid_t;
        loop {
            if interrupt_after_elapsed > 0.0 {
                let timer = libc::itimerval {
                    it_interval: to_timeval(0.0),
                    it_value: to_timeval(interrupt_after_elapsed),
                };
                unsafe {
                    libc::setitimer(libc::ITIMER_REAL, &timer, ptr::null_mut());
                }
            }
            let mut raw_status: i32 = 0;
            ret = unsafe { libc::waitpid(self.tid, &mut raw_status, __WALL) };
            status = WaitStatus::new(raw_status);
            if interrupt_after_elapsed > 0.0 {
                let timer: libc::itimerval = unsafe { std::mem::zeroed() };
                unsafe {
                    libc::setitimer(libc::ITIMER_REAL, &timer, ptr::null_mut());
                }
            }
            if ret >= 0 || errno() != libc::EINTR {
                // waitpid was not interrupted by the watchdog.
                break;
            }

            if is_zombie_process(self.tgid()) {
                // The process is dead; stop waiting or we might never make
                // progress. Fake a PTRACE_EVENT_EXIT.
                log!(
                    LogWarn,
                    "Synthesizing PTRACE_EVENT_EXIT for zombie process {}",
                    self.tid
                );
                status = WaitStatus::for_ptrace_event(libc::PTRACE_EVENT_EXIT);
                ret = self.tid;
                break;
            }

            if !sent_wait_interrupt && interrupt_after_elapsed > 0.0 {
                self.ptrace_if_alive(
                    libc::PTRACE_INTERRUPT as u32,
                    RemotePtr::null(),
                    ptr::null_mut(),
                );
                sent_wait_interrupt = true;
                self.expecting_ptrace_interrupt_stop = 2;
            }
        }

        if ret >= 0 && status.exit_code().is_some() {
            // A plain exit status here means the PTRACE_EXIT_EVENT for this
            // task was somehow missed; synthesize it.
            ed_assert!(
                self,
                !self.seen_ptrace_exit_event,
                "A PTRACE_EXIT_EVENT was observed for this task, but somehow forgotten"
            );
            log!(
                LogWarn,
                "Synthesizing PTRACE_EVENT_EXIT for process {} exited with {}",
                self.tid,
                status.exit_code().unwrap()
            );
            status = WaitStatus::for_ptrace_event(libc::PTRACE_EVENT_EXIT);
        }

        log!(
            LogDebug,
            "  waitpid({}) returns {}; status {}",
            self.tid,
            ret,
            status
        );
        ed_assert!(
            self,
            self.tid == ret,
            "waitpid({}) failed with {}",
            self.tid,
            ret
        );

        if sent_wait_interrupt {
            log!(LogWarn, "Forced to PTRACE_INTERRUPT tracee");
            if !is_signal_triggered_by_ptrace_interrupt(status.group_stop_sig()) {
                log!(
                    LogWarn,
                    "  PTRACE_INTERRUPT raced with another event {:?}",
                    status
                );
            }
        }

        self.did_waitpid(status);
        status.ptrace_event() != Some(libc::PTRACE_EVENT_EXIT as u32)
    }

    /// Non-blocking wait. Returns true when a status change was consumed;
    /// false means "still running".
    pub fn try_wait(&mut self) -> bool {
        if self.detected_unexpected_exit {
            self.detected_unexpected_exit = false;
            self.did_waitpid(WaitStatus::for_ptrace_event(libc::PTRACE_EVENT_EXIT));
            return true;
        }

        let mut raw_status: i32 = 0;
        let ret = unsafe { libc::waitpid(self.tid, &mut raw_status, libc::WNOHANG | __WALL) };
        if ret == self.tid {
            self.did_waitpid(WaitStatus::new(raw_status));
            return true;
        }
        false
    }

    /// Reconcile a fresh wait status into the task: interrupt-stop
    /// translation, siginfo capture, register refresh, tick accumulation.
    pub fn did_waitpid(&mut self, mut status: WaitStatus) {
        // After PTRACE_INTERRUPT, either of the next two stops may be the
        // group stop it caused; while this counter is positive, a group
        // stop that looks like the interrupt's ack is treated as the
        // time-slice signal so the scheduler preempts as if the branch
        // counter had fired.
        let mut siginfo_overridden = false;
        if self.expecting_ptrace_interrupt_stop > 0 {
            self.expecting_ptrace_interrupt_stop -= 1;
            if is_signal_triggered_by_ptrace_interrupt(status.group_stop_sig()) {
                status = WaitStatus::for_stop_sig(TIME_SLICE_SIGNAL);
                self.pending_siginfo = unsafe { std::mem::zeroed() };
                self.pending_siginfo.si_signo = TIME_SLICE_SIGNAL.as_raw();
                self.pending_siginfo.si_code = libc::POLLIN as i32;
                siginfo_overridden = true;
                self.expecting_ptrace_interrupt_stop = 0;
                if let Some(session) = self.try_session() {
                    if session.is_recording() {
                        session.scheduler().expire_timeslice();
                    }
                }
            }
        }

        if !siginfo_overridden && status.stop_sig().is_some() {
            let mut local_siginfo: siginfo_t = unsafe { std::mem::zeroed() };
            if !self.ptrace_if_alive(
                PTRACE_GETSIGINFO as u32,
                RemotePtr::null(),
                &mut local_siginfo as *mut siginfo_t as *mut c_void,
            ) {
                log!(LogDebug, "Unexpected process death for {}", self.tid);
                status = WaitStatus::for_ptrace_event(libc::PTRACE_EVENT_EXIT);
            }
            self.pending_siginfo = local_siginfo;
        }

        let original_syscallno = if self.registers_known {
            Some(self.registers.original_syscallno())
        } else {
            None
        };
        log!(LogDebug, "  (refreshing register cache)");
        let mut ptrace_regs: libc::user_regs_struct = unsafe { std::mem::zeroed() };
        if self.ptrace_if_alive(
            PTRACE_GETREGS as u32,
            RemotePtr::null(),
            &mut ptrace_regs as *mut libc::user_regs_struct as *mut c_void,
        ) {
            self.registers.set_from_ptrace(&ptrace_regs);
            self.registers_known = true;
            self.registers_dirty = false;
        } else {
            log!(LogDebug, "Unexpected process death for {}", self.tid);
            status = WaitStatus::for_ptrace_event(libc::PTRACE_EVENT_EXIT);
        }

        self.is_stopped = true;
        self.wait_status = status;
        let more_ticks: Ticks = self.hpc.read_ticks();
        // Stop counting here: operations on the stopped tracee could
        // otherwise generate spurious ticks.
        self.hpc.stop_counting();
        self.ticks += more_ticks;
        if let Some(session) = self.try_session() {
            session.accumulate_ticks_processed(more_ticks);
        }

        if status.ptrace_event() == Some(libc::PTRACE_EVENT_EXIT as u32) {
            self.seen_ptrace_exit_event = true;
            return;
        }

        if self.registers.singlestep_flag() {
            self.registers.clear_singlestep_flag();
            self.registers_dirty = true;
        }

        // Resuming at a breakpoint without executing anything can reset the
        // original syscall number to -1; undo that so resume-at-a-breakpoint
        // is a register no-op.
        if let Some(orig) = original_syscallno {
            let bkpt_addr = self.address_of_last_execution_resume;
            if self.vm().get_breakpoint_type_at_addr(bkpt_addr).is_some()
                && self.wait_status.stop_sig() == Some(crate::sig::SIGTRAP)
                && self.ip() == bkpt_addr.increment_by_bkpt_insn_length(self.arch())
            {
                ed_assert!(self, more_ticks == 0);
                self.registers.set_original_syscallno(orig);
                self.registers_dirty = true;
            }
        }
    }

    /// Move the IP back over the breakpoint instruction just trapped.
    pub fn move_ip_before_breakpoint(&mut self) {
        let mut r = *self.regs_ref();
        let ip = r.ip().decrement_by_bkpt_insn_length(self.arch());
        r.set_ip(ip);
        self.set_regs(&r);
    }

    /// Open (or reopen) this address space's /proc/{tid}/mem fd.
    pub fn open_mem_fd(&mut self) -> bool {
        let path = CString::new(format!("/proc/{}/mem", self.tid)).unwrap();
        let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR | libc::O_CLOEXEC) };
        if fd < 0 {
            log!(LogDebug, "Can't retrieve mem fd for {}", self.tid);
            return false;
        }
        self.vm().set_mem_fd(ScopedFd::from_raw(fd));
        true
    }

    /// Read tracee memory through the mem fd; returns a short count rather
    /// than dying. The first read after exec can return 0 with errno 0
    /// because the fd still refers to the pre-exec address space: reopen
    /// once and retry.
    pub fn read_bytes_fallible(
        &mut self,
        addr: RemotePtr<Void>,
        buf: &mut [u8],
    ) -> Result<usize, ()> {
        if buf.is_empty() {
            return Ok(0);
        }

        if !self.vm().mem_fd().is_open() {
            return Ok(self.read_bytes_ptrace(addr, buf));
        }

        let mut all_read = 0;
        while all_read < buf.len() {
            Errno::clear();
            let nread: isize = unsafe {
                libc::pread64(
                    self.vm().mem_fd().as_raw(),
                    buf[all_read..].as_mut_ptr() as *mut c_void,
                    buf.len() - all_read,
                    (addr.as_usize() + all_read) as i64,
                )
            };
            if nread == 0 && all_read == 0 && errno() == 0 {
                if !self.open_mem_fd() {
                    return Ok(0);
                }
                continue;
            }
            if nread <= 0 {
                if all_read > 0 {
                    // Some data was read; report success.
                    Errno::clear();
                    return Ok(all_read);
                }
                return Err(());
            }
            all_read += nread as usize;
        }
        Ok(all_read)
    }

    /// Read, dying (or reporting through `ok`) on a short read.
    pub fn read_bytes_helper(
        &mut self,
        addr: RemotePtr<Void>,
        buf: &mut [u8],
        ok: Option<&mut bool>,
    ) {
        let result = self.read_bytes_fallible(addr, buf);
        match result {
            Ok(nread) if nread == buf.len() => (),
            _ => {
                let nread = result.unwrap_or(0);
                match ok {
                    Some(ok) => *ok = false,
                    None => {
                        ed_assert!(
                            self,
                            false,
                            "Should have read {} bytes from {}, but only read {}",
                            buf.len(),
                            addr,
                            nread
                        );
                    }
                }
            }
        }
    }

    /// Write tracee memory. A first-write-returns-zero is retried once
    /// after reopening the mem fd; sustained failure dies unless `ok` is
    /// provided.
    pub fn write_bytes_helper(
        &mut self,
        addr: RemotePtr<Void>,
        buf: &[u8],
        ok: Option<&mut bool>,
        flags: WriteFlags,
    ) {
        if buf.is_empty() {
            return;
        }

        if !self.vm().mem_fd().is_open() {
            let nwritten = self.write_bytes_ptrace(addr, buf);
            if let Some(ok) = ok {
                if nwritten < buf.len() {
                    *ok = false;
                }
            }
            return;
        }

        Errno::clear();
        let nwritten_result =
            crate::util::pwrite_all_fallible(self.vm().mem_fd().as_raw(), buf, addr.as_isize());
        if let Ok(0) = nwritten_result {
            self.open_mem_fd();
            return self.write_bytes_helper(addr, buf, ok, flags);
        }
        if errno() == libc::EPERM {
            fatal!("Can't write to /proc/{}/mem", self.tid);
        }
        let nwritten = nwritten_result.unwrap_or(0);
        match ok {
            Some(ok) => {
                if nwritten < buf.len() {
                    *ok = false;
                }
            }
            None => {
                ed_assert!(
                    self,
                    nwritten == buf.len(),
                    "Should have written {} bytes to {}, but only wrote {}",
                    buf.len(),
                    addr,
                    nwritten
                );
            }
        }
        if nwritten > 0 && !flags.contains(WriteFlags::IS_BREAKPOINT_RELATED) {
            let vm = self.vm();
            vm.notify_written(self, addr, nwritten);
        }
    }

    pub fn write_bytes(&mut self, addr: RemotePtr<Void>, buf: &[u8]) {
        self.write_bytes_helper(addr, buf, None, WriteFlags::empty());
    }

    pub fn read_val_mem<D: Copy>(&mut self, addr: RemotePtr<D>, ok: Option<&mut bool>) -> D {
        let mut v: D = unsafe { std::mem::zeroed() };
        let buf =
            unsafe { std::slice::from_raw_parts_mut(&mut v as *mut D as *mut u8, size_of::<D>()) };
        self.read_bytes_helper(RemotePtr::cast(addr), buf, ok);
        v
    }

    pub fn write_val_mem<D: Copy>(&mut self, addr: RemotePtr<D>, val: &D, ok: Option<&mut bool>) {
        let buf =
            unsafe { std::slice::from_raw_parts(val as *const D as *const u8, size_of::<D>()) };
        self.write_bytes_helper(RemotePtr::cast(addr), buf, ok, WriteFlags::empty());
    }

    /// Read the null-terminated string at `child_addr`. Conservative about
    /// page boundaries: only [addr, end-of-page) is known mapped.
    pub fn read_c_str(&mut self, child_addr: RemotePtr<u8>) -> CString {
        let mut p = child_addr.to_void();
        let mut s: Vec<u8> = Vec::new();
        loop {
            let end_of_page: RemotePtr<Void> = crate::util::ceil_page_size(p.as_usize() + 1).into();
            let nbytes = end_of_page - p;
            let mut buf = vec![0u8; nbytes];
            self.read_bytes_helper(p, &mut buf, None);
            for &c in &buf {
                if c == 0 {
                    return unsafe { CString::from_vec_unchecked(s) };
                }
                s.push(c);
            }
            p = end_of_page;
        }
    }

    fn read_bytes_ptrace(&mut self, addr: RemotePtr<Void>, buf: &mut [u8]) -> usize {
        let mut nread: usize = 0;
        let word_size = size_of::<c_long>();
        Errno::clear();
        while nread < buf.len() {
            let word_start = (addr.as_usize() + nread) / word_size * word_size;
            let start_offset = addr.as_usize() + nread - word_start;
            let length = min(word_size - start_offset, buf.len() - nread);
            let v = unsafe { libc::ptrace(PTRACE_PEEKDATA, self.tid, word_start, 0) };
            if errno() != 0 {
                break;
            }
            let bytes = v.to_ne_bytes();
            buf[nread..nread + length].copy_from_slice(&bytes[start_offset..start_offset + length]);
            nread += length;
        }
        nread
    }

    fn write_bytes_ptrace(&mut self, addr: RemotePtr<Void>, buf: &[u8]) -> usize {
        let mut nwritten: usize = 0;
        let word_size = size_of::<c_long>();
        Errno::clear();
        while nwritten < buf.len() {
            let word_start = (addr.as_usize() + nwritten) / word_size * word_size;
            let start_offset = addr.as_usize() + nwritten - word_start;
            let length = min(word_size - start_offset, buf.len() - nwritten);
            let mut word = if length == word_size {
                [0u8; size_of::<c_long>()]
            } else {
                let v = unsafe { libc::ptrace(PTRACE_PEEKDATA, self.tid, word_start, 0) };
                if errno() != 0 {
                    break;
                }
                v.to_ne_bytes()
            };
            word[start_offset..start_offset + length]
                .copy_from_slice(&buf[nwritten..nwritten + length]);
            let v = c_long::from_ne_bytes(word);
            if unsafe { libc::ptrace(PTRACE_POKEDATA, self.tid, word_start, v) } < 0 {
                break;
            }
            nwritten += length;
        }
        nwritten
    }

    /// A ptrace request that tolerates the tracee having died: returns
    /// false on ESRCH instead of dying.
    pub fn ptrace_if_alive(&self, request: u32, addr: RemotePtr<Void>, data: *mut c_void) -> bool {
        Errno::clear();
        unsafe {
            libc::ptrace(
                request as libc::c_uint,
                self.tid,
                addr.as_usize() as *mut c_void,
                data,
            )
        };
        if errno() == ESRCH {
            log!(LogDebug, "ptrace_if_alive tid {} was not alive", self.tid);
            return false;
        }
        ed_assert!(
            self,
            errno() == 0,
            "ptrace({}, {}, addr={}, data={:?}) failed with errno {}",
            ptrace_req_name(request),
            self.tid,
            addr,
            data,
            errno()
        );
        true
    }

    /// Program the x86 debug registers from the watch configuration.
    /// Returns false when the configuration does not fit or the tracee
    /// rejected it.
    pub fn set_debug_regs(&mut self, regs: &[crate::session::address_space::WatchConfig]) -> bool {
        // DR7 has an enable pair per slot in its low word and a 4-bit
        // rw/len field per slot in its high word.
        fn dr7_settings(type_: WatchType, num_bytes: usize) -> Option<usize> {
            let type_bits: usize = match type_ {
                WatchType::Exec => 0x0,
                WatchType::Write => 0x1,
                WatchType::ReadWrite => 0x3,
            };
            let len_bits: usize = match num_bytes {
                1 => 0x0,
                2 => 0x1,
                8 => 0x2,
                4 => 0x3,
                _ => return None,
            };
            Some(type_bits | (len_bits << 2))
        }

        if regs.len() > NUM_X86_WATCHPOINTS {
            return false;
        }

        // Disable all watchpoints while rewriting them.
        if !self.poke_debug_reg(7, 0) {
            return false;
        }

        let mut dr7: usize = 0;
        for (i, reg) in regs.iter().enumerate() {
            let settings = match dr7_settings(reg.type_, reg.num_bytes) {
                Some(s) => s,
                None => return false,
            };
            if !self.poke_debug_reg(i, reg.addr.as_usize()) {
                return false;
            }
            // Local enable bit plus the slot's rw/len nibble.
            dr7 |= (1 << (2 * i)) | (settings << (16 + 4 * i));
        }
        self.poke_debug_reg(7, dr7)
    }

    /// The DR6 debug-status register.
    pub fn debug_status(&self) -> usize {
        Errno::clear();
        let v = unsafe { libc::ptrace(PTRACE_PEEKUSER, self.tid, debug_reg_user_offset(6), 0) };
        if errno() != 0 {
            return 0;
        }
        v as usize
    }

    pub fn clear_debug_status(&mut self) {
        self.poke_debug_reg(6, 0);
    }

    /// The debug status, clearing it for the next stop.
    pub fn consume_debug_status(&mut self) -> usize {
        let status = self.debug_status();
        self.clear_debug_status();
        status
    }

    fn poke_debug_reg(&self, regno: usize, value: usize) -> bool {
        debug_assert!(regno < NUM_X86_DEBUG_REGS);
        Errno::clear();
        unsafe { libc::ptrace(PTRACE_POKEUSER, self.tid, debug_reg_user_offset(regno), value) };
        errno() == 0 || errno() == ESRCH
    }

    /// The hijack step of the exit handshake: on SYS_exit entry, replace
    /// the syscall number with gettid and let it complete, so cleanup can
    /// run while the tracee is still alive. The IP is backed up by the
    /// length of one syscall instruction so the original exit can be
    /// re-issued afterwards.
    pub fn hijack_exit_to_gettid(&mut self, arch: SupportedArch) {
        let mut r = *self.regs_ref();
        let orig_syscallno = r.original_syscallno();
        r.set_original_syscallno(syscall_number_for_gettid(arch) as isize);
        self.set_regs(&r);
        self.resume_execution(
            ResumeRequest::ResumeSyscall,
            WaitRequest::ResumeWait,
            TicksRequest::ResumeNoTicks,
            None,
        );

        let mut r = *self.regs_ref();
        r.set_original_syscallno(orig_syscallno);
        r.set_syscallno(orig_syscallno);
        let new_ip = r.ip().decrement_by_syscall_insn_length(arch);
        r.set_ip(new_ip);
        self.set_regs(&r);
        self.flush_regs();
    }

    /// Advance the re-issued exit after cleanup. The tracee stops at the
    /// PTRACE_EVENT_EXIT (or is simply gone).
    pub fn advance_real_exit(&mut self) {
        self.resume_execution(
            ResumeRequest::ResumeCont,
            WaitRequest::ResumeWait,
            TicksRequest::ResumeNoTicks,
            None,
        );
    }

    /// Remove this task from its shared structures and reap the zombie.
    /// Skipped for destabilized groups, where waitpid synchronization would
    /// deadlock on futex joins.
    pub fn destroy(&mut self) {
        let unstable = self.task_group().borrow().unstable;
        if !unstable {
            log!(
                LogDebug,
                "task {} (rec: {}) is dying ...",
                self.tid,
                self.rec_tid
            );
            // Detaching from the ptrace-exit stop lets the exit complete;
            // the kernel clears tid_futex and wakes joiners as part of it,
            // and the waitpid below observes the completion.
            self.ptrace_if_alive(
                libc::PTRACE_DETACH as u32,
                RemotePtr::null(),
                ptr::null_mut(),
            );
            let mut raw_status: i32 = 0;
            let ret = unsafe { libc::waitpid(self.tid, &mut raw_status, __WALL) };
            if ret != self.tid {
                log!(
                    LogDebug,
                    "waitpid on dying task {} returned {}",
                    self.tid,
                    ret
                );
            }
        }
        let vm = self.vm();
        vm.task_set().erase(&self.weak_self);
        let tg = self.task_group();
        tg.borrow().task_set().erase(&self.weak_self);
    }

    /// Kill the tracee outright. Only used on shutdown paths.
    pub fn kill(&mut self) {
        unsafe {
            libc::syscall(libc::SYS_tgkill, self.tgid(), self.tid, libc::SIGKILL);
        }
    }

    /// Reset per-address-space bindings after a successful execve. The
    /// caller installs the fresh AddressSpace.
    pub fn post_exec_cleanup(&mut self) {
        self.sighandlers().borrow_mut().reset_user_handlers();
        self.scratch_ptr = RemotePtr::null();
        self.scratch_size = 0;
        self.syscallbuf_child = RemotePtr::null();
        self.syscallbuf_size = 0;
        self.desched_fd_child = -1;
    }

    pub fn name(&self) -> OsString {
        match std::fs::read_to_string(format!("/proc/{}/comm", self.tid)) {
            Ok(s) => OsString::from(s.trim_end()),
            Err(_) => OsString::from("???"),
        }
    }
}

/// Byte offset of u_debugreg[regno] within the kernel `user` struct, for
/// PTRACE_PEEKUSER/POKEUSER.
fn debug_reg_user_offset(regno: usize) -> usize {
    let u = std::mem::MaybeUninit::<libc::user>::uninit();
    let base = u.as_ptr() as usize;
    let dr = unsafe { std::ptr::addr_of!((*u.as_ptr()).u_debugreg) } as usize;
    dr - base + size_of::<usize>() * regno
}

impl Drop for Task {
    fn drop(&mut self) {
        if let Some(session) = self.session_.upgrade() {
            session.on_destroy_task(self.tuid());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        session::{address_space::AddressSpace, sighandlers::Sighandlers, task_group::TaskGroup},
        taskish_uid::AddressSpaceUid,
    };
    use std::ffi::OsStr;

    /// A Task detached from any live tracee or session, for exercising the
    /// pure state machinery.
    fn detached_task() -> Task {
        let vm = Rc::new(AddressSpace::new(
            Weak::new(),
            1000,
            AddressSpaceUid::new_with(1000, 0, 0),
            OsStr::new("/bin/test"),
        ));
        let tg = TaskGroup::new(Weak::new(), 1000, 0);
        let sighandlers = Sighandlers::new();
        Task::new(Weak::new(), 1000, 1000, 0, vm, tg, sighandlers)
    }

    #[test]
    fn debug_reg_offsets_are_increasing() {
        let d0 = debug_reg_user_offset(0);
        let d7 = debug_reg_user_offset(7);
        assert_eq!(d7 - d0, 7 * size_of::<usize>());
    }

    #[test]
    fn ticks_request_bounds() {
        assert!(MAX_TICKS_REQUEST < u64::MAX);
        match TicksRequest::ResumeWithTicksRequest(100) {
            TicksRequest::ResumeWithTicksRequest(t) => assert_eq!(t, 100),
            _ => unreachable!(),
        }
    }

    #[test]
    fn stash_restores_wait_status() {
        let mut t = detached_task();
        let stashed_status = WaitStatus::for_stop_sig(crate::sig::SIGUSR1);
        t.set_status(stashed_status);
        t.stash_sig();
        assert!(t.has_stashed_sig());

        // Another event overwrites the status while the signal is aside.
        t.set_status(WaitStatus::for_syscall());
        assert_ne!(t.status(), stashed_status);

        let stashed = t.pop_stash_sig();
        assert_eq!(t.status(), stashed_status);
        assert_eq!(stashed.status, stashed_status);
        assert!(!t.has_stashed_sig());
    }

    #[test]
    fn synthetic_stash_carries_signal_number() {
        let mut t = detached_task();
        let status = WaitStatus::for_stop_sig(crate::perf_counters::TIME_SLICE_SIGNAL);
        t.stash_synthetic_sig(crate::perf_counters::TIME_SLICE_SIGNAL, status);
        let stashed = t.pop_stash_sig();
        assert_eq!(
            stashed.siginfo.si_signo,
            crate::perf_counters::TIME_SLICE_SIGNAL.as_raw()
        );
    }

    #[test]
    fn event_stack_is_lifo() {
        let mut t = detached_task();
        t.push_event(Event::Sched);
        t.push_event(Event::Exit);
        assert!(matches!(t.current_event(), Some(Event::Exit)));
        assert!(matches!(t.pop_event(), Some(Event::Exit)));
        assert!(matches!(t.pop_event(), Some(Event::Sched)));
        assert!(t.pop_event().is_none());
    }
}
