pub mod address_space;
pub mod record_session;
pub mod replay_session;
pub mod sighandlers;
pub mod task;
pub mod task_group;

use crate::{
    flags::{Checksum, Flags},
    log::{LogDebug, LogError},
    preload_interface::syscallbuf_hdr,
    remote_ptr::RemotePtr,
    scheduler::Scheduler,
    session::{
        address_space::{AddressSpace, AddressSpaceSharedPtr},
        sighandlers::{Sighandlers, SighandlersSharedPtr},
        task::{Task, TaskSharedPtr},
        task_group::{TaskGroup, TaskGroupSharedPtr},
    },
    taskish_uid::{AddressSpaceUid, TaskUid},
    ticks::Ticks,
    trace::{
        trace_frame::{FrameTime, TraceFrame},
        trace_reader::TraceReader,
        trace_writer::TraceWriter,
    },
    util::{checksum_bytes, should_copy_mmap_region},
};
use libc::pid_t;
use nix::sys::stat::stat;
use std::{
    cell::{Cell, Ref, RefCell},
    collections::BTreeMap,
    io::{BufRead, BufReader, Write},
    rc::{Rc, Weak},
};

pub type SessionSharedPtr = Rc<Session>;
pub type SessionSharedWeakPtr = Weak<Session>;

/// Record-only state.
pub struct RecordState {
    pub trace_writer: RefCell<TraceWriter>,
    /// Whether the preload library should buffer syscalls.
    pub use_syscall_buffer: bool,
}

/// Replay-only state.
pub struct ReplayState {
    pub trace_reader: RefCell<TraceReader>,
    pub current_frame: RefCell<TraceFrame>,
}

/// Record vs replay is a tagged variant, not dynamic dispatch; per-variant
/// state stays segregated here.
pub enum SessionKind {
    Record(RecordState),
    Replay(ReplayState),
}

/// Owns the mapping from rec-tid to Task, the collection of AddressSpaces
/// and TaskGroups, and the trace stream. The process-wide mutable state of
/// the original design (synthetic inode counter, task serials) lives here
/// so multiple sessions don't interfere.
pub struct Session {
    kind: SessionKind,
    weak_self: RefCell<SessionSharedWeakPtr>,

    tasks: RefCell<BTreeMap<pid_t, TaskSharedPtr>>,
    task_groups: RefCell<BTreeMap<pid_t, TaskGroupSharedPtr>>,

    scheduler: Scheduler,

    next_task_serial: Cell<u32>,
    next_anonymous_inode: Cell<u64>,
    ticks_processed: Cell<Ticks>,

    /// Tracee state can't be validated before the first exec, because the
    /// engine's own address space layout differs between record and replay.
    done_initial_exec: Cell<bool>,

    /// The number of execs seen, to disambiguate AddressSpaceUids.
    exec_count: Cell<u32>,

    /// Per-address-space patch state; only populated during recording.
    patchers: RefCell<BTreeMap<AddressSpaceUid, Rc<RefCell<crate::monkeypatcher::Monkeypatcher>>>>,
}

impl Session {
    pub fn new_record(trace_writer: TraceWriter, use_syscall_buffer: bool) -> SessionSharedPtr {
        Self::finish_new(SessionKind::Record(RecordState {
            trace_writer: RefCell::new(trace_writer),
            use_syscall_buffer,
        }))
    }

    pub fn new_replay(trace_reader: TraceReader) -> SessionSharedPtr {
        Self::finish_new(SessionKind::Replay(ReplayState {
            trace_reader: RefCell::new(trace_reader),
            current_frame: RefCell::new(TraceFrame::new()),
        }))
    }

    fn finish_new(kind: SessionKind) -> SessionSharedPtr {
        let session = Rc::new(Session {
            kind,
            weak_self: RefCell::new(Weak::new()),
            tasks: RefCell::new(BTreeMap::new()),
            task_groups: RefCell::new(BTreeMap::new()),
            scheduler: Scheduler::new(),
            next_task_serial: Cell::new(1),
            next_anonymous_inode: Cell::new(1),
            ticks_processed: Cell::new(0),
            done_initial_exec: Cell::new(false),
            exec_count: Cell::new(0),
            patchers: RefCell::new(BTreeMap::new()),
        });
        *session.weak_self.borrow_mut() = Rc::downgrade(&session);
        session
    }

    pub fn weak_self(&self) -> SessionSharedWeakPtr {
        self.weak_self.borrow().clone()
    }

    pub fn is_recording(&self) -> bool {
        matches!(self.kind, SessionKind::Record(_))
    }

    pub fn is_replaying(&self) -> bool {
        matches!(self.kind, SessionKind::Replay(_))
    }

    pub fn as_record(&self) -> Option<&RecordState> {
        match &self.kind {
            SessionKind::Record(state) => Some(state),
            SessionKind::Replay(_) => None,
        }
    }

    pub fn as_replay(&self) -> Option<&ReplayState> {
        match &self.kind {
            SessionKind::Replay(state) => Some(state),
            SessionKind::Record(_) => None,
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn current_frame_time(&self) -> FrameTime {
        match &self.kind {
            SessionKind::Record(state) => state.trace_writer.borrow().time(),
            SessionKind::Replay(state) => state.trace_reader.borrow().time(),
        }
    }

    pub fn accumulate_ticks_processed(&self, ticks: Ticks) {
        self.ticks_processed
            .set(self.ticks_processed.get() + ticks);
    }

    pub fn ticks_processed(&self) -> Ticks {
        self.ticks_processed.get()
    }

    pub fn next_task_serial(&self) -> u32 {
        let serial = self.next_task_serial.get();
        self.next_task_serial.set(serial + 1);
        serial
    }

    /// Synthetic inodes distinguish anonymous mappings from one another.
    pub fn next_anonymous_inode(&self) -> u64 {
        let inode = self.next_anonymous_inode.get();
        self.next_anonymous_inode.set(inode + 1);
        inode
    }

    /// Before the first exec the cache can't be populated from /proc/maps;
    /// the lightweight pre-exec initialization searches the engine's own
    /// VDSO for the syscall instruction instead.
    pub fn can_validate(&self) -> bool {
        self.done_initial_exec.get()
    }

    pub fn done_initial_exec(&self) {
        self.done_initial_exec.set(true);
    }

    pub fn find_task(&self, rec_tid: pid_t) -> Option<TaskSharedPtr> {
        self.tasks.borrow().get(&rec_tid).cloned()
    }

    pub fn task_tids(&self) -> Vec<pid_t> {
        self.tasks.borrow().keys().copied().collect()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.borrow().len()
    }

    pub fn tasks(&self) -> Ref<BTreeMap<pid_t, TaskSharedPtr>> {
        self.tasks.borrow()
    }

    pub fn find_task_group(&self, tgid: pid_t) -> Option<TaskGroupSharedPtr> {
        self.task_groups.borrow().get(&tgid).cloned()
    }

    /// The exit status of the first (initial) task group. Groups outlive
    /// their tasks, so this works after everything has been reaped.
    pub fn initial_task_group_exit_status(&self) -> Option<crate::wait_status::WaitStatus> {
        self.task_groups
            .borrow()
            .values()
            .next()
            .map(|tg| tg.borrow().exit_status)
    }

    /// Build the Task/AddressSpace/TaskGroup/Sighandlers quartet for a
    /// freshly spawned tracee.
    pub fn create_initial_task(
        &self,
        tid: pid_t,
        rec_tid: pid_t,
        exe: &std::ffi::OsStr,
    ) -> TaskSharedPtr {
        let serial = self.next_task_serial();
        let vm = Rc::new(AddressSpace::new(
            self.weak_self(),
            tid,
            AddressSpaceUid::new_with(rec_tid, serial, self.exec_count.get()),
            exe,
        ));
        let tg = TaskGroup::new(self.weak_self(), rec_tid, serial);
        let sighandlers = Sighandlers::new();
        self.finish_task(tid, rec_tid, serial, vm, tg, sighandlers)
    }

    /// Create a child Task for a fork/clone, honoring the sharing bits.
    /// Without SHARE_VM, the address space is deep-cloned: breakpoints are
    /// cloned per-breakpoint so their refcounts stay private.
    pub fn create_cloned_task(
        &self,
        parent: &Task,
        flags: task::CloneFlags,
        new_tid: pid_t,
        new_rec_tid: pid_t,
    ) -> TaskSharedPtr {
        let serial = self.next_task_serial();

        let vm = if flags.contains(task::CloneFlags::SHARE_VM) {
            parent.vm()
        } else {
            let parent_vm = parent.vm();
            Rc::new(AddressSpace::clone_into(
                &parent_vm,
                self.weak_self(),
                AddressSpaceUid::new_with(new_rec_tid, serial, self.exec_count.get()),
                new_tid,
            ))
        };

        let tg = if flags.contains(task::CloneFlags::SHARE_TASK_GROUP) {
            parent.task_group()
        } else {
            TaskGroup::new(self.weak_self(), new_rec_tid, serial)
        };

        let sighandlers = if flags.contains(task::CloneFlags::SHARE_SIGHANDLERS) {
            parent.sighandlers()
        } else {
            parent.sighandlers().borrow().clone_table()
        };

        self.finish_task(new_tid, new_rec_tid, serial, vm, tg, sighandlers)
    }

    fn finish_task(
        &self,
        tid: pid_t,
        rec_tid: pid_t,
        serial: u32,
        vm: AddressSpaceSharedPtr,
        tg: TaskGroupSharedPtr,
        sighandlers: SighandlersSharedPtr,
    ) -> TaskSharedPtr {
        let task = Rc::new(RefCell::new(Task::new(
            self.weak_self(),
            tid,
            rec_tid,
            serial,
            vm.clone(),
            tg.clone(),
            sighandlers,
        )));
        task.borrow_mut().set_weak_self(Rc::downgrade(&task));
        vm.task_set().insert(Rc::downgrade(&task));
        tg.borrow().task_set().insert(Rc::downgrade(&task));
        self.tasks.borrow_mut().insert(rec_tid, task.clone());
        self.task_groups
            .borrow_mut()
            .entry(tg.borrow().tgid)
            .or_insert_with(|| tg.clone());
        task
    }

    /// Replace `t`'s address space after a successful execve: the old one
    /// is detached (it keeps only the mem fd, which moves to the successor)
    /// and the new one is populated from the kernel's view.
    pub fn post_exec_vm(&self, t: &mut Task, exe: &std::ffi::OsStr) -> AddressSpaceSharedPtr {
        self.exec_count.set(self.exec_count.get() + 1);
        let old_vm = t.vm();
        old_vm.task_set().erase(&t.weak_self_clone());

        let vm = Rc::new(AddressSpace::new(
            self.weak_self(),
            t.tid,
            AddressSpaceUid::new_with(t.rec_tid, t.serial(), self.exec_count.get()),
            exe,
        ));
        t.set_vm(vm.clone());
        vm.task_set().insert(t.weak_self_clone());
        t.post_exec_cleanup();
        t.open_mem_fd();
        vm.populate_from_kernel(t);
        self.done_initial_exec();
        vm
    }

    /// Remove a dead task from the session's collections. Called from the
    /// Task destructor; the entry may already be gone during kill-all.
    pub fn on_destroy_task(&self, tuid: TaskUid) {
        self.scheduler.on_destroy_task(tuid.tid());
        if let Ok(mut tasks) = self.tasks.try_borrow_mut() {
            tasks.remove(&tuid.tid());
        }
    }

    /// The patcher handling one address space, created on first use.
    pub fn patcher_for(
        &self,
        uid: AddressSpaceUid,
    ) -> Rc<RefCell<crate::monkeypatcher::Monkeypatcher>> {
        self.patchers
            .borrow_mut()
            .entry(uid)
            .or_insert_with(|| {
                Rc::new(RefCell::new(crate::monkeypatcher::Monkeypatcher::new()))
            })
            .clone()
    }

    /// AddressSpace destructor notification.
    pub fn on_destroy_vm(&self, uid: AddressSpaceUid) {
        log!(
            LogDebug,
            "address space for {} (serial {}) destroyed",
            uid.tid(),
            uid.serial()
        );
    }

    /// Forcibly end every tracee. Groups are destabilized first so reaping
    /// doesn't block on futex joins.
    pub fn kill_all_tasks(&self) {
        for tg in self.task_groups.borrow().values() {
            tg.borrow_mut().destabilize();
        }
        let tasks: Vec<TaskSharedPtr> = self.tasks.borrow().values().cloned().collect();
        for t in tasks {
            t.borrow_mut().kill();
        }
        self.tasks.borrow_mut().clear();
    }

    /// Whether checksumming applies at this frame, per the --checksum flag.
    pub fn should_checksum(&self, frame: &TraceFrame) -> bool {
        let checksum = match Flags::get().checksum {
            Some(c) => c,
            None => return false,
        };
        match checksum {
            Checksum::ChecksumAll => true,
            Checksum::ChecksumSyscall => {
                frame.event().is_syscall_event()
                    && frame.event().syscall().state
                        == crate::event::SyscallState::ExitingSyscall
            }
            Checksum::ChecksumAt(time) => time <= frame.time(),
        }
    }

    /// Store or validate one line per mapping: `(checksum) start-end`.
    /// The checksum is an additive sum over the readable 32-bit words.
    /// Mappings whose backing is deemed immutable by the same policy used
    /// at record time, and not writable, are skipped; scratch regions are
    /// skipped on validation; the syscallbuf only contributes its
    /// deterministic prefix.
    pub fn checksum_process_memory(&self, t: &mut Task, global_time: FrameTime, store: bool) {
        let checksums_path = match &self.kind {
            SessionKind::Record(state) => state
                .trace_writer
                .borrow()
                .dir()
                .join(format!("{}_{}", global_time, t.rec_tid)),
            SessionKind::Replay(state) => state
                .trace_reader
                .borrow()
                .dir()
                .join(format!("{}_{}", global_time, t.rec_tid)),
        };

        if store {
            let mut file = match std::fs::File::create(&checksums_path) {
                Ok(f) => f,
                Err(e) => fatal!("Failed to open checksum file {:?}: {:?}", checksums_path, e),
            };
            for (range, sum) in self.collect_checksums(t) {
                writeln!(file, "({:x}) {:x}-{:x}", sum, range.0, range.1).unwrap();
            }
        } else {
            let file = match std::fs::File::open(&checksums_path) {
                Ok(f) => f,
                Err(e) => fatal!("Failed to open checksum file {:?}: {:?}", checksums_path, e),
            };
            let mut lines = BufReader::new(file).lines();
            for (range, sum) in self.collect_checksums(t) {
                let line = match lines.next() {
                    Some(Ok(line)) => line,
                    _ => fatal!("Checksum file truncated at {:x}-{:x}", range.0, range.1),
                };
                let (rec_sum, rec_start, rec_end) = parse_checksum_line(&line);
                ed_assert!(
                    t,
                    rec_start == range.0 && rec_end == range.1,
                    "Segment {:x}-{:x} changed to {:x}-{:x}??",
                    rec_start,
                    rec_end,
                    range.0,
                    range.1
                );
                if t.scratch_ptr.as_usize() == range.0 {
                    // Replay doesn't touch scratch regions, so their
                    // contents are allowed to diverge.
                    log!(LogDebug, "Not validating scratch {:x}-{:x}", range.0, range.1);
                    continue;
                }
                if sum != rec_sum {
                    notify_checksum_error(t, global_time, sum, rec_sum, range);
                }
            }
        }
    }

    /// The checksums of every participating mapping, in address order.
    fn collect_checksums(&self, t: &mut Task) -> Vec<((usize, usize), u32)> {
        let vm = t.vm();
        let mut result = Vec::new();
        for entry in vm.maps() {
            let participates = checksum_segment_filter(&entry);
            let mut mem: Vec<u8> = Vec::new();
            let mut valid_len = 0usize;
            if participates {
                mem.resize(entry.map.size(), 0);
                valid_len = t
                    .read_bytes_fallible(entry.map.start(), &mut mem)
                    .unwrap_or(0);
            }

            if entry.res.is_syscallbuf() {
                // The syscallbuf consists of a region written
                // deterministically wrt the trace events and a region
                // written nondeterministically like scratch; only the
                // deterministic prefix participates.
                let hdr = t.read_val_mem(
                    RemotePtr::<syscallbuf_hdr>::new(entry.map.start().as_usize()),
                    None,
                );
                valid_len = std::cmp::min(
                    valid_len,
                    crate::preload_interface::syscallbuf_data_end(&hdr),
                );
            }

            let sum = checksum_bytes(&mem[..valid_len]);
            result.push((
                (entry.map.start().as_usize(), entry.map.end().as_usize()),
                sum,
            ));
        }
        result
    }
}

/// A mapping is skipped when stat on its backing succeeds AND the file is
/// deemed immutable by the record-time copy policy AND the mapping is not
/// writable. One policy function serves both call sites.
fn checksum_segment_filter(entry: &address_space::MappingEntry) -> bool {
    if entry.res.is_scratch() || entry.res.is_syscallbuf() {
        return true;
    }
    let st = match stat(entry.res.fsname()) {
        Ok(st) => st,
        // No persistent backing: expect it to change.
        Err(_) => return true,
    };
    let may_diverge = should_copy_mmap_region(
        entry.res.fsname(),
        &st,
        entry.map.prot().bits(),
        entry.map.flags().bits(),
        false,
    ) || entry
        .map
        .prot()
        .contains(nix::sys::mman::ProtFlags::PROT_WRITE);
    log!(
        LogDebug,
        "{} {:?}",
        if may_diverge { "CHECKSUMMING" } else { "  skipping" },
        entry.res.fsname()
    );
    may_diverge
}

fn parse_checksum_line(line: &str) -> (u32, usize, usize) {
    // "(sum) start-end"
    fn bad(line: &str) -> ! {
        fatal!("Unparseable checksum line `{}'", line)
    }
    let close = match line.find(')') {
        Some(c) => c,
        None => bad(line),
    };
    let sum = match u32::from_str_radix(&line[1..close], 16) {
        Ok(s) => s,
        Err(_) => bad(line),
    };
    let rest = line[close + 1..].trim();
    let dash = match rest.find('-') {
        Some(d) => d,
        None => bad(line),
    };
    let start = match usize::from_str_radix(&rest[..dash], 16) {
        Ok(s) => s,
        Err(_) => bad(line),
    };
    let end = match usize::from_str_radix(&rest[dash + 1..], 16) {
        Ok(e) => e,
        Err(_) => bad(line),
    };
    (sum, start, end)
}

/// Divergence diagnostic naming the mapping, with a pointer at the dump
/// diff workflow. Execution aborts: replay past divergence is meaningless.
fn notify_checksum_error(
    t: &Task,
    global_time: FrameTime,
    checksum: u32,
    rec_checksum: u32,
    range: (usize, usize),
) {
    log!(
        LogError,
        "Divergence in contents of memory segment {:x}-{:x} at event {}",
        range.0,
        range.1,
        global_time
    );
    ed_assert!(
        t,
        false,
        "Checksum mismatch for {:x}-{:x}: recorded {:#x}, replaying {:#x}.\n\
         Dump memory at this event during recording (--dump-at={}) and diff\n\
         the dumps to find the diverging cells.",
        range.0,
        range.1,
        rec_checksum,
        checksum,
        global_time
    );
}

/// Dump every mapping of `t` to `<trace-dir>/<rec_tid>_<time>_<tag>` in a
/// greppable word-per-line format.
pub fn dump_process_memory(t: &mut Task, dir: &std::path::Path, global_time: FrameTime, tag: &str) {
    let filename = dir.join(format!("{}_{}_{}", t.rec_tid, global_time, tag));
    let mut file = match std::fs::File::create(&filename) {
        Ok(f) => f,
        Err(e) => fatal!("Can't create memory dump {:?}: {:?}", filename, e),
    };

    let vm = t.vm();
    for entry in vm.maps() {
        if t.scratch_ptr == entry.map.start() {
            continue;
        }
        let mut mem = vec![0u8; entry.map.size()];
        let valid_len = t
            .read_bytes_fallible(entry.map.start(), &mut mem)
            .unwrap_or(0);
        writeln!(file, "{} {}", entry.map, entry.res).unwrap();
        for (i, word) in mem[..valid_len].chunks_exact(4).enumerate() {
            let value = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
            writeln!(
                file,
                "0x{:08x} | [{:#x}]",
                value,
                entry.map.start().as_usize() + i * 4
            )
            .unwrap();
        }
    }
}
