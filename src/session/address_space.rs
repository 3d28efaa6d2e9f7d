pub mod maps_iterator;
pub mod mapping;
pub mod mem_range;
pub mod resource;

use crate::{
    kernel_abi::BREAKPOINT_INSN,
    log::{LogDebug, LogError},
    preload_interface::{
        stub_exit_address, SYSCALL_PAGE_ADDR, SYSCALL_PAGE_SIZE, TRACED_STUB_INDEX,
        UNTRACED_STUB_INDEX,
    },
    remote_code_ptr::RemoteCodePtr,
    remote_ptr::{RemotePtr, Void},
    scoped_fd::ScopedFd,
    session::{
        task::{Task, WriteFlags},
        SessionSharedWeakPtr,
    },
    task_set::TaskSet,
    taskish_uid::AddressSpaceUid,
    trace::trace_frame::FrameTime,
    util::{ceil_page_size, find, floor_page_size, page_size},
};
use libc::pid_t;
use self::mapping::Mapping;
use self::maps_iterator::KernelMapsIterator;
use self::mem_range::{MemRange, RangeKey};
use nix::sys::mman::{MapFlags, ProtFlags};
use self::resource::{PseudoDev, Resource};
use std::{
    cell::{Cell, Ref, RefCell},
    cmp::min,
    collections::BTreeMap,
    ffi::{OsStr, OsString},
    fmt::Write as FmtWrite,
    ops::Bound::{Included, Unbounded},
    os::unix::ffi::OsStrExt,
    rc::Rc,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BreakpointType {
    /// Trap for internal purposes, e.g. replaying async signals.
    Internal,
    /// Trap on behalf of a debugger user.
    User,
}

/// These enumeration values match the encodings programmed into x86 debug
/// registers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(usize)]
pub enum WatchType {
    Exec = 0x00,
    Write = 0x01,
    ReadWrite = 0x03,
}

/// A single hardware debug-register assignment.
#[derive(Copy, Clone, Debug)]
pub struct WatchConfig {
    pub addr: RemotePtr<Void>,
    pub num_bytes: usize,
    pub type_: WatchType,
}

impl WatchConfig {
    pub fn new(addr: RemotePtr<Void>, num_bytes: usize, type_: WatchType) -> WatchConfig {
        WatchConfig {
            addr,
            num_bytes,
            type_,
        }
    }
}

pub type DebugRegs = Vec<WatchConfig>;

/// x86 exposes four watch slots.
pub const NUM_X86_WATCHPOINTS: usize = 4;

/// A trap at one address: two refcounts and the byte the trap instruction
/// overwrote. The debugger class wins so the debugger can inspect before
/// internal machinery runs.
#[derive(Copy, Clone, Debug)]
struct Breakpoint {
    user_count: u32,
    internal_count: u32,
    overwritten_data: u8,
}

impl Breakpoint {
    fn new(overwritten_data: u8) -> Breakpoint {
        Breakpoint {
            user_count: 0,
            internal_count: 0,
            overwritten_data,
        }
    }

    fn do_ref(&mut self, which: BreakpointType) {
        match which {
            BreakpointType::User => self.user_count += 1,
            BreakpointType::Internal => self.internal_count += 1,
        }
    }

    /// Returns the remaining total refcount.
    fn do_unref(&mut self, which: BreakpointType) -> u32 {
        match which {
            BreakpointType::User => {
                debug_assert!(self.user_count > 0);
                self.user_count -= 1;
            }
            BreakpointType::Internal => {
                debug_assert!(self.internal_count > 0);
                self.internal_count -= 1;
            }
        }
        self.user_count + self.internal_count
    }

    fn bp_type(&self) -> BreakpointType {
        if self.user_count > 0 {
            BreakpointType::User
        } else {
            debug_assert!(self.internal_count > 0);
            BreakpointType::Internal
        }
    }
}

bitflags! {
    struct RwxBits: u32 {
        const EXEC_BIT = 1 << 0;
        const READ_BIT = 1 << 1;
        const WRITE_BIT = 1 << 2;
        const READ_WRITE_BITS = Self::READ_BIT.bits | Self::WRITE_BIT.bits;
    }
}

/// A logical watchpoint over (addr, len): three refcounted access classes,
/// a snapshot of the watched bytes to suppress spurious write triggers, and
/// the debug registers assigned for exec/read detection.
#[derive(Clone, Debug)]
struct Watchpoint {
    num_bytes: usize,
    exec_count: u32,
    read_count: u32,
    write_count: u32,
    value_bytes: Vec<u8>,
    valid: bool,
    changed: bool,
    debug_regs_for_exec_read: Vec<u8>,
}

impl Watchpoint {
    fn new(num_bytes: usize) -> Watchpoint {
        Watchpoint {
            num_bytes,
            exec_count: 0,
            read_count: 0,
            write_count: 0,
            value_bytes: vec![0u8; num_bytes],
            valid: false,
            changed: false,
            debug_regs_for_exec_read: Vec::new(),
        }
    }

    fn watch(&mut self, which: RwxBits) {
        if which.contains(RwxBits::EXEC_BIT) {
            self.exec_count += 1;
        }
        if which.contains(RwxBits::READ_BIT) {
            self.read_count += 1;
        }
        if which.contains(RwxBits::WRITE_BIT) {
            self.write_count += 1;
        }
    }

    /// Returns the remaining total refcount.
    fn unwatch(&mut self, which: RwxBits) -> u32 {
        if which.contains(RwxBits::EXEC_BIT) {
            debug_assert!(self.exec_count > 0);
            self.exec_count -= 1;
        }
        if which.contains(RwxBits::READ_BIT) {
            debug_assert!(self.read_count > 0);
            self.read_count -= 1;
        }
        if which.contains(RwxBits::WRITE_BIT) {
            debug_assert!(self.write_count > 0);
            self.write_count -= 1;
        }
        self.exec_count + self.read_count + self.write_count
    }

    fn watched_bits(&self) -> RwxBits {
        let mut bits = RwxBits::empty();
        if self.exec_count > 0 {
            bits |= RwxBits::EXEC_BIT;
        }
        if self.read_count > 0 {
            bits |= RwxBits::READ_BIT;
        }
        if self.write_count > 0 {
            bits |= RwxBits::WRITE_BIT;
        }
        bits
    }
}

fn access_bits_of(type_: WatchType) -> RwxBits {
    match type_ {
        WatchType::Exec => RwxBits::EXEC_BIT,
        WatchType::Write => RwxBits::WRITE_BIT,
        WatchType::ReadWrite => RwxBits::READ_WRITE_BITS,
    }
}

/// The stored value of the memory map: one Mapping and the Resource backing
/// it.
#[derive(Clone, Debug)]
pub struct MappingEntry {
    pub map: Mapping,
    pub res: Resource,
}

impl MappingEntry {
    pub fn new(map: Mapping, res: Resource) -> MappingEntry {
        MappingEntry { map, res }
    }
}

pub type MemoryMap = BTreeMap<RangeKey, MappingEntry>;
pub type AddressSpaceSharedPtr = Rc<AddressSpace>;

#[derive(Copy, Clone, Eq, PartialEq)]
enum IterateHow {
    IterateDefault,
    /// Stop iterating at the first discontiguity, matching kernel mprotect
    /// semantics.
    IterateContiguous,
}

#[derive(Copy, Clone, Eq, PartialEq)]
enum HandleHeap {
    TreatHeapAsAnonymous,
    RespectHeap,
}

/// The engine's cached model of one tracee virtual memory map: its
/// mappings, breakpoints and watchpoints. Shared by all Tasks in a CLONE_VM
/// group; mutated only from the Task that trapped on the mutating syscall.
pub struct AddressSpace {
    /// The session owns us; this backref is for notifications only.
    session_: SessionSharedWeakPtr,
    task_set: TaskSet,
    mem: RefCell<MemoryMap>,
    breakpoints: RefCell<BTreeMap<RemoteCodePtr, Breakpoint>>,
    watchpoints: RefCell<BTreeMap<MemRange, Watchpoint>>,
    saved_watchpoints: RefCell<Vec<BTreeMap<MemRange, Watchpoint>>>,
    /// Path of the executable image this address space was exec()'d with.
    exe: RefCell<OsString>,
    leader_tid_: pid_t,
    uid_: AddressSpaceUid,
    /// brk region. The start stays fixed across the program's lifetime;
    /// the end moves with the tracee's brk() calls.
    brk_start: Cell<RemotePtr<Void>>,
    brk_end: Cell<RemotePtr<Void>>,
    /// First mapped byte of the vdso.
    vdso_start_addr: Cell<RemotePtr<Void>>,
    /// Tracee memory is read and written through this fd, opened on the
    /// tracee's /proc/{tid}/mem. Unlike ptrace it works even when the
    /// tracee isn't at a ptrace-stop. Owned by the address space; moved to
    /// the successor on exec.
    child_mem_fd: RefCell<ScopedFd>,
    traced_syscall_ip_: Cell<RemoteCodePtr>,
    untraced_syscall_ip_: Cell<RemoteCodePtr>,
    syscallbuf_enabled_: Cell<bool>,
    /// The time of the first event that ran code for a task in this address
    /// space. 0 if no such event has occurred.
    first_run_event_: Cell<FrameTime>,
}

impl AddressSpace {
    pub fn new(
        session: SessionSharedWeakPtr,
        leader_tid: pid_t,
        uid: AddressSpaceUid,
        exe: &OsStr,
    ) -> AddressSpace {
        AddressSpace {
            session_: session,
            task_set: TaskSet::new(),
            mem: RefCell::new(BTreeMap::new()),
            breakpoints: RefCell::new(BTreeMap::new()),
            watchpoints: RefCell::new(BTreeMap::new()),
            saved_watchpoints: RefCell::new(Vec::new()),
            exe: RefCell::new(exe.to_os_string()),
            leader_tid_: leader_tid,
            uid_: uid,
            brk_start: Cell::new(RemotePtr::null()),
            brk_end: Cell::new(RemotePtr::null()),
            vdso_start_addr: Cell::new(RemotePtr::null()),
            child_mem_fd: RefCell::new(ScopedFd::new()),
            traced_syscall_ip_: Cell::new(RemoteCodePtr::null()),
            untraced_syscall_ip_: Cell::new(RemoteCodePtr::null()),
            syscallbuf_enabled_: Cell::new(false),
            first_run_event_: Cell::new(0),
        }
    }

    pub fn task_set(&self) -> &TaskSet {
        &self.task_set
    }

    pub fn uid(&self) -> AddressSpaceUid {
        self.uid_
    }

    pub fn leader_tid(&self) -> pid_t {
        self.leader_tid_
    }

    pub fn exe_image(&self) -> OsString {
        self.exe.borrow().clone()
    }

    pub fn session_weak(&self) -> &SessionSharedWeakPtr {
        &self.session_
    }

    pub fn mem_fd(&self) -> Ref<ScopedFd> {
        self.child_mem_fd.borrow()
    }

    pub fn set_mem_fd(&self, fd: ScopedFd) {
        *self.child_mem_fd.borrow_mut() = fd;
    }

    /// Take the mem fd, e.g. to move it to the successor on exec.
    pub fn extract_mem_fd(&self) -> ScopedFd {
        std::mem::take(&mut *self.child_mem_fd.borrow_mut())
    }

    pub fn traced_syscall_ip(&self) -> RemoteCodePtr {
        self.traced_syscall_ip_.get()
    }

    pub fn untraced_syscall_ip(&self) -> RemoteCodePtr {
        self.untraced_syscall_ip_.get()
    }

    pub fn syscallbuf_enabled(&self) -> bool {
        self.syscallbuf_enabled_.get()
    }

    pub fn set_syscallbuf_enabled(&self, enabled: bool) {
        self.syscallbuf_enabled_.set(enabled);
    }

    pub fn set_first_run_event(&self, event: FrameTime) {
        self.first_run_event_.set(event);
    }

    pub fn first_run_event(&self) -> FrameTime {
        self.first_run_event_.get()
    }

    pub fn syscall_page_start() -> RemotePtr<Void> {
        SYSCALL_PAGE_ADDR.into()
    }

    pub fn syscall_page_size() -> usize {
        SYSCALL_PAGE_SIZE
    }

    pub fn has_syscall_page(&self) -> bool {
        self.mapping_of(Self::syscall_page_start()).is_some()
    }

    /// Insert the mapping; overlapped existing mappings are unmapped over
    /// the overlap first (kernel MAP_FIXED semantics), then both neighbors
    /// are considered for coalescing.
    pub fn map(
        &self,
        addr: RemotePtr<Void>,
        num_bytes: usize,
        prot: ProtFlags,
        flags: MapFlags,
        offset_bytes: u64,
        res: Resource,
    ) -> Mapping {
        log!(
            LogDebug,
            "mmap({}, {:#x}, {:?}, {:?}, {:#x})",
            addr,
            num_bytes,
            prot,
            flags,
            offset_bytes
        );
        let num_bytes = ceil_page_size(num_bytes);
        debug_assert!(num_bytes > 0);

        let m = Mapping::new(addr, addr + num_bytes, prot, flags, offset_bytes);

        // The overlapped region behaves as if unmapped and remapped per the
        // arguments of the second call.
        self.unmap_internal(addr, num_bytes);

        if res.is_vdso() {
            self.vdso_start_addr.set(addr);
        }

        self.map_and_coalesce(m.clone(), res);
        m
    }

    /// The mapping and resource for the byte at `addr`.
    pub fn mapping_of(&self, addr: RemotePtr<Void>) -> Option<MappingEntry> {
        let key = RangeKey(MemRange::new(addr, 1));
        let mem = self.mem.borrow();
        match mem.get(&key) {
            Some(entry) if entry.map.contains_ptr(addr) => Some(entry.clone()),
            _ => None,
        }
    }

    pub fn has_mapping(&self, addr: RemotePtr<Void>) -> bool {
        self.mapping_of(addr).is_some()
    }

    /// Snapshot of all mappings, ordered by start address.
    pub fn maps(&self) -> Vec<MappingEntry> {
        self.mem.borrow().values().cloned().collect()
    }

    pub fn mapping_count(&self) -> usize {
        self.mem.borrow().len()
    }

    /// Change the protection of [addr, addr + num_bytes) to `prot`,
    /// splitting underflowing and overflowing mappings. Iteration stops at
    /// the first discontiguity, matching the kernel.
    pub fn protect(&self, addr: RemotePtr<Void>, num_bytes: usize, prot: ProtFlags) {
        log!(LogDebug, "mprotect({}, {:#x}, {:?})", addr, num_bytes, prot);

        let mut last_overlap: Option<RangeKey> = None;
        let protector = |slf: &Self, key: RangeKey, rem: MemRange| {
            let entry = slf.mem.borrow().get(&key).unwrap().clone();
            slf.remove_from_map(*key);

            let new_start = rem.start();
            // If the first mapping underflows the region, reinsert the
            // prefix with its previous prot.
            if entry.map.start() < new_start {
                let underflow = MappingEntry::new(
                    entry
                        .map
                        .subrange(entry.map.start(), new_start, entry.res.is_real_device()),
                    entry.res.clone(),
                );
                slf.add_to_map(underflow);
            }
            // The overlapping portion gets the new prot.
            let new_end = min(rem.end(), entry.map.end());
            let new_prot =
                prot & (ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC);
            let overlap = MappingEntry::new(
                entry
                    .map
                    .subrange(new_start, new_end, entry.res.is_real_device())
                    .set_prot(new_prot),
                entry.res.clone(),
            );
            last_overlap = Some(RangeKey(*overlap.map));
            slf.add_to_map(overlap);

            // If the last mapping overflows the region, reinsert the suffix
            // with its previous prot.
            if rem.end() < entry.map.end() {
                let overflow = MappingEntry::new(
                    entry
                        .map
                        .subrange(rem.end(), entry.map.end(), entry.res.is_real_device()),
                    entry.res,
                );
                slf.add_to_map(overflow);
            }
        };

        self.for_each_in_range(addr, num_bytes, protector, IterateHow::IterateContiguous);
        if let Some(last_overlap_key) = last_overlap {
            // Mappings we altered that need coalescing are adjacent to it.
            self.coalesce_around(last_overlap_key);
        }
    }

    /// Move the mapping [old_addr, old_addr + old_num_bytes) to
    /// [new_addr, new_addr + new_num_bytes), preserving metadata. A
    /// zero-length remap is a pure unmap.
    pub fn remap(
        &self,
        old_addr: RemotePtr<Void>,
        old_num_bytes: usize,
        new_addr: RemotePtr<Void>,
        new_num_bytes: usize,
    ) {
        log!(
            LogDebug,
            "mremap({}, {:#x}, {}, {:#x})",
            old_addr,
            old_num_bytes,
            new_addr,
            new_num_bytes
        );
        let old_num_bytes = ceil_page_size(old_num_bytes);

        let entry = self.mapping_of(old_addr).unwrap();
        let km = entry.map.subrange(
            old_addr,
            min(entry.map.end(), old_addr + old_num_bytes),
            entry.res.is_real_device(),
        );

        self.unmap_internal(old_addr, old_num_bytes);
        if new_num_bytes == 0 {
            return;
        }
        let new_num_bytes = ceil_page_size(new_num_bytes);
        self.unmap_internal(new_addr, new_num_bytes);

        self.map_and_coalesce(km.set_range(new_addr, new_addr + new_num_bytes), entry.res);
    }

    /// Make [addr, addr + num_bytes) inaccessible.
    pub fn unmap(&self, addr: RemotePtr<Void>, num_bytes: usize) {
        log!(LogDebug, "munmap({}, {:#x})", addr, num_bytes);
        let num_bytes = ceil_page_size(num_bytes);
        if num_bytes == 0 {
            return;
        }
        self.unmap_internal(addr, num_bytes);
    }

    /// Register the initial brk region. The start never moves afterwards.
    pub fn init_brk(&self, addr: RemotePtr<Void>) {
        debug_assert!(self.brk_start.get().is_null());
        self.brk_start.set(addr);
        self.brk_end.set(addr);
    }

    pub fn current_brk(&self) -> RemotePtr<Void> {
        self.brk_end.get()
    }

    pub fn brk_region_start(&self) -> RemotePtr<Void> {
        self.brk_start.get()
    }

    /// Update the heap mapping for a tracee brk() to `new_end`.
    pub fn brk(&self, new_end: RemotePtr<Void>, prot: ProtFlags) {
        log!(LogDebug, "brk({})", new_end);
        let start = self.brk_start.get();
        debug_assert!(!start.is_null());
        debug_assert!(new_end >= start);

        let old_brk = ceil_page_size(self.brk_end.get().as_usize());
        let new_brk = ceil_page_size(new_end.as_usize());
        if old_brk < new_brk {
            self.map(
                old_brk.into(),
                new_brk - old_brk,
                prot,
                MapFlags::MAP_ANONYMOUS | MapFlags::MAP_PRIVATE,
                0,
                Resource::pseudo(PseudoDev::Heap, OsStr::new("[heap]")),
            );
        } else if new_brk < old_brk {
            self.unmap(new_brk.into(), old_brk - new_brk);
        }
        self.brk_end.set(new_end);
    }

    /// Ensure a breakpoint of `type_` at `addr`. Returns false when the
    /// overwritten byte cannot be read (e.g. the address is unmapped), with
    /// state unchanged.
    pub fn add_breakpoint(
        &self,
        t: &mut Task,
        addr: RemoteCodePtr,
        type_: BreakpointType,
    ) -> bool {
        let found = self.breakpoints.borrow().contains_key(&addr);
        if found {
            self.breakpoints
                .borrow_mut()
                .get_mut(&addr)
                .unwrap()
                .do_ref(type_);
            return true;
        }

        let mut overwritten_data = [0u8; 1];
        match t.read_bytes_fallible(addr.to_data_ptr::<Void>(), &mut overwritten_data) {
            Ok(1) => (),
            _ => return false,
        }

        t.write_bytes_helper(
            addr.to_data_ptr::<Void>(),
            &[BREAKPOINT_INSN],
            None,
            WriteFlags::IS_BREAKPOINT_RELATED,
        );

        let mut bp = Breakpoint::new(overwritten_data[0]);
        bp.do_ref(type_);
        self.breakpoints.borrow_mut().insert(addr, bp);
        true
    }

    /// Drop one `type_` reference; the last reference restores the saved
    /// byte and erases the breakpoint.
    pub fn remove_breakpoint(&self, t: &mut Task, addr: RemoteCodePtr, type_: BreakpointType) {
        let mut destroy = false;
        if let Some(bp) = self.breakpoints.borrow_mut().get_mut(&addr) {
            if bp.do_unref(type_) == 0 {
                destroy = true;
            }
        }
        if destroy {
            self.destroy_breakpoint_at(t, addr);
        }
    }

    /// Destroy all breakpoints in this VM regardless of refcounts.
    pub fn remove_all_breakpoints(&self, t: &mut Task) {
        let addrs: Vec<RemoteCodePtr> = self.breakpoints.borrow().keys().copied().collect();
        for addr in addrs {
            self.destroy_breakpoint_at(t, addr);
        }
    }

    pub fn get_breakpoint_type_at_addr(&self, addr: RemoteCodePtr) -> Option<BreakpointType> {
        self.breakpoints.borrow().get(&addr).map(|bp| bp.bp_type())
    }

    /// The type for a retired instruction whose trap just fired: the
    /// breakpoint lives at the address just before the current IP.
    pub fn get_breakpoint_type_for_retired_insn(&self, ip: RemoteCodePtr) -> Option<BreakpointType> {
        let addr = ip.decrement_by_bkpt_insn_length(crate::kernel_abi::NATIVE_ARCH);
        self.get_breakpoint_type_at_addr(addr)
    }

    /// The byte a breakpoint overwrote, for reads that look through traps.
    pub fn overwritten_breakpoint_byte(&self, addr: RemoteCodePtr) -> Option<u8> {
        self.breakpoints
            .borrow()
            .get(&addr)
            .map(|bp| bp.overwritten_data)
    }

    /// Temporarily remove the breakpoint at `addr`.
    pub fn suspend_breakpoint_at(&self, t: &mut Task, addr: RemoteCodePtr) {
        if let Some(bp) = self.breakpoints.borrow().get(&addr) {
            let data = bp.overwritten_data;
            t.write_bytes_helper(
                addr.to_data_ptr::<Void>(),
                &[data],
                None,
                WriteFlags::IS_BREAKPOINT_RELATED,
            );
        }
    }

    /// Restore a temporarily removed breakpoint at `addr`.
    pub fn restore_breakpoint_at(&self, t: &mut Task, addr: RemoteCodePtr) {
        if self.breakpoints.borrow().contains_key(&addr) {
            t.write_bytes_helper(
                addr.to_data_ptr::<Void>(),
                &[BREAKPOINT_INSN],
                None,
                WriteFlags::IS_BREAKPOINT_RELATED,
            );
        }
    }

    pub fn has_breakpoints(&self) -> bool {
        !self.breakpoints.borrow().is_empty()
    }

    pub fn has_watchpoints(&self) -> bool {
        !self.watchpoints.borrow().is_empty()
    }

    /// Ensure a watchpoint over (addr, num_bytes) of class `type_`, then
    /// project the logical set onto the hardware debug-register budget.
    /// Returns false when the projection cannot fit; the logical watchpoint
    /// just added is removed again and no partial hardware state survives.
    pub fn add_watchpoint(
        &self,
        t: &mut Task,
        addr: RemotePtr<Void>,
        num_bytes: usize,
        type_: WatchType,
    ) -> bool {
        let range = range_for_watchpoint(addr, num_bytes);
        if !self.watchpoints.borrow().contains_key(&range) {
            let mut wp = Watchpoint::new(num_bytes);
            self.update_watchpoint_value(t, &range, &mut wp);
            self.watchpoints.borrow_mut().insert(range, wp);
        }
        self.watchpoints
            .borrow_mut()
            .get_mut(&range)
            .unwrap()
            .watch(access_bits_of(type_));

        if !self.allocate_watchpoints(t) {
            self.remove_watchpoint(t, addr, num_bytes, type_);
            return false;
        }
        true
    }

    pub fn remove_watchpoint(
        &self,
        t: &mut Task,
        addr: RemotePtr<Void>,
        num_bytes: usize,
        type_: WatchType,
    ) {
        let range = range_for_watchpoint(addr, num_bytes);
        let mut erase = false;
        if let Some(wp) = self.watchpoints.borrow_mut().get_mut(&range) {
            if wp.unwatch(access_bits_of(type_)) == 0 {
                erase = true;
            }
        }
        if erase {
            self.watchpoints.borrow_mut().remove(&range);
        }
        self.allocate_watchpoints(t);
    }

    pub fn remove_all_watchpoints(&self, t: &mut Task) {
        self.watchpoints.borrow_mut().clear();
        self.allocate_watchpoints(t);
    }

    pub fn all_watchpoints(&self) -> Vec<WatchConfig> {
        self.get_watch_configs(false)
    }

    /// Push all watchpoint state onto a stack.
    pub fn save_watchpoints(&self) {
        self.saved_watchpoints
            .borrow_mut()
            .push(self.watchpoints.borrow().clone());
    }

    /// Pop watchpoint state from the saved-state stack.
    pub fn restore_watchpoints(&self, t: &mut Task) -> bool {
        debug_assert!(!self.saved_watchpoints.borrow().is_empty());
        *self.watchpoints.borrow_mut() = self.saved_watchpoints.borrow_mut().pop().unwrap();
        self.allocate_watchpoints(t)
    }

    /// At least one watchpoint was hit; recheck them all. Returns true when
    /// any watchpoint actually triggered: the debug status can claim a
    /// write watchpoint hit whose value did not change.
    pub fn notify_watchpoint_fired(&self, t: &mut Task, debug_status: usize) -> bool {
        let mut triggered = false;
        for (_, w) in self.watchpoints.borrow_mut().iter_mut() {
            let watched = w.watched_bits();
            if (watched.contains(RwxBits::READ_BIT) || watched.contains(RwxBits::EXEC_BIT))
                && watchpoint_triggered(debug_status, &w.debug_regs_for_exec_read)
            {
                w.changed = true;
                triggered = true;
            }
        }

        let write_ranges: Vec<MemRange> = self
            .watchpoints
            .borrow()
            .iter()
            .filter(|(_, w)| w.watched_bits().contains(RwxBits::WRITE_BIT))
            .map(|(range, _)| *range)
            .collect();
        for range in write_ranges {
            let mut wp = self.watchpoints.borrow().get(&range).unwrap().clone();
            if self.update_watchpoint_value(t, &range, &mut wp) {
                wp.changed = true;
                triggered = true;
            }
            self.watchpoints.borrow_mut().insert(range, wp);
        }
        triggered
    }

    /// True until consume_watchpoint_changes() clears the changed flags.
    pub fn has_any_watchpoint_changes(&self) -> bool {
        self.watchpoints.borrow().values().any(|w| w.changed)
    }

    /// All changed watchpoints, clearing their changed flags.
    pub fn consume_watchpoint_changes(&self) -> Vec<WatchConfig> {
        self.get_watch_configs(true)
    }

    /// Notify that memory was written by the tracer or kernel so write
    /// watchpoint snapshots stay current.
    pub fn notify_written(&self, t: &mut Task, addr: RemotePtr<Void>, num_bytes: usize) {
        self.update_watchpoint_values(t, addr, addr + num_bytes);
    }

    /// The vdso mapping of this address space; panics when absent.
    pub fn vdso(&self) -> Mapping {
        debug_assert!(!self.vdso_start_addr.get().is_null());
        self.mapping_of(self.vdso_start_addr.get()).unwrap().map
    }

    pub fn vdso_start(&self) -> RemotePtr<Void> {
        self.vdso_start_addr.get()
    }

    /// Verify that this cached address space matches the kernel's view.
    /// Since the engine and kernel merge with slightly different
    /// heuristics, both sides are reduced to a common denominator first:
    /// adjacent segments whose kernel-visible flags and resources match are
    /// merged on both sides, then the merged sequences must match pairwise.
    pub fn verify(&self, t: &Task) {
        log!(LogDebug, "Verifying address space for task {}", t.tid);

        let cached: Vec<(Mapping, Resource)> = self
            .mem
            .borrow()
            .values()
            .map(|e| (e.map.clone(), e.res.clone()))
            .collect();
        let mut cached_it = cached.into_iter().peekable();
        let mut kernel_it = KernelMapsIterator::new(t.tid).peekable();

        loop {
            let vm = next_merged(&mut cached_it);
            let km = next_merged(&mut kernel_it);
            match (vm, km) {
                (None, None) => break,
                (Some(vm), Some(km)) => assert_segments_match(t, &vm, &km),
                _ => {
                    log!(LogError, "cached mmap:\n{}", self.dump());
                    ed_assert!(
                        t,
                        false,
                        "Mapping count mismatch between cache and /proc/{}/maps",
                        t.tid
                    );
                }
            }
        }
    }

    pub fn dump(&self) -> String {
        let mut out = String::new();
        for entry in self.mem.borrow().values() {
            let _ = writeln!(out, "{} {}", entry.map, entry.res);
        }
        out
    }

    /// Build the cache from the kernel's view; used after exec.
    pub fn populate_from_kernel(&self, t: &Task) {
        let mut mem = self.mem.borrow_mut();
        debug_assert!(mem.is_empty());
        for (m, r) in KernelMapsIterator::new(t.tid) {
            if r.is_vdso() {
                self.vdso_start_addr.set(m.start());
            }
            if r.is_heap() {
                self.brk_start.set(m.start());
                self.brk_end.set(m.end());
            }
            mem.insert(RangeKey(*m), MappingEntry::new(m, r));
        }
    }

    /// Register the syscall page mapped by the remote-syscall helper and
    /// publish its traced/untraced entry points.
    pub fn did_map_syscall_page(&self) {
        self.traced_syscall_ip_
            .set(RemoteCodePtr::from_val(stub_exit_address(TRACED_STUB_INDEX))
                .decrement_by_syscall_insn_length(crate::kernel_abi::NATIVE_ARCH));
        self.untraced_syscall_ip_
            .set(RemoteCodePtr::from_val(stub_exit_address(UNTRACED_STUB_INDEX))
                .decrement_by_syscall_insn_length(crate::kernel_abi::NATIVE_ARCH));
    }

    /// Deep-clone for a fork: the memory map is copied; breakpoints are
    /// cloned per-breakpoint so refcounts remain private to each space.
    pub fn clone_into(&self, session: SessionSharedWeakPtr, uid: AddressSpaceUid, leader_tid: pid_t) -> AddressSpace {
        let clone = AddressSpace::new(session, leader_tid, uid, &self.exe.borrow());
        *clone.mem.borrow_mut() = self.mem.borrow().clone();
        *clone.breakpoints.borrow_mut() = self.breakpoints.borrow().clone();
        clone.brk_start.set(self.brk_start.get());
        clone.brk_end.set(self.brk_end.get());
        clone.vdso_start_addr.set(self.vdso_start_addr.get());
        clone.traced_syscall_ip_.set(self.traced_syscall_ip_.get());
        clone.untraced_syscall_ip_.set(self.untraced_syscall_ip_.get());
        clone.syscallbuf_enabled_.set(self.syscallbuf_enabled_.get());
        clone
    }

    fn unmap_internal(&self, addr: RemotePtr<Void>, num_bytes: usize) {
        let unmapper = |slf: &Self, key: RangeKey, rem: MemRange| {
            log!(LogDebug, "  unmapping ({}) ...", rem);

            let entry = slf.mem.borrow().get(&key).unwrap().clone();
            slf.remove_from_map(*key);

            // Reinsert the underflow region.
            if entry.map.start() < rem.start() {
                let underflow = MappingEntry::new(
                    entry
                        .map
                        .subrange(entry.map.start(), rem.start(), entry.res.is_real_device()),
                    entry.res.clone(),
                );
                slf.add_to_map(underflow);
            }
            // Reinsert the overflow region, offset adjusted by the distance
            // from the original start when the backing is a real device.
            if rem.end() < entry.map.end() {
                let overflow = MappingEntry::new(
                    entry
                        .map
                        .subrange(rem.end(), entry.map.end(), entry.res.is_real_device()),
                    entry.res,
                );
                slf.add_to_map(overflow);
            }
        };
        self.for_each_in_range(addr, num_bytes, unmapper, IterateHow::IterateDefault);
    }

    /// For each mapped segment overlapping [addr, addr + num_bytes), call
    /// `f` with the overlapping key and the range remaining to be iterated.
    /// `f` may erase mappings.
    fn for_each_in_range<F: FnMut(&Self, RangeKey, MemRange)>(
        &self,
        addr: RemotePtr<Void>,
        num_bytes: usize,
        mut f: F,
        how: IterateHow,
    ) {
        let region_start: RemotePtr<Void> = floor_page_size(addr.as_usize()).into();
        let region_end: RemotePtr<Void> = ceil_page_size((addr + num_bytes).as_usize()).into();
        let mut last_mapped_end = region_start;
        while last_mapped_end < region_end {
            // Invariant: `rem` is exactly the region remaining to process.
            let rem = MemRange::from_range(last_mapped_end, region_end);

            let range: RangeKey;
            {
                let mem = self.mem.borrow();
                let mut iter = mem.range((Included(RangeKey(MemRange::new(rem.start(), 1))), Unbounded));
                match iter.next() {
                    Some((r, _)) => range = *r,
                    None => {
                        log!(LogDebug, "  not found, done.");
                        return;
                    }
                }
            }

            if rem.end() <= range.start() {
                log!(LogDebug, "  mapping at {} out of range, done.", range.start());
                return;
            }
            if IterateHow::IterateContiguous == how
                && !(range.start() < region_start || rem.start() == range.start())
            {
                log!(LogDebug, "  discontiguous mapping at {}, done.", range.start());
                return;
            }

            f(self, range, rem);

            last_mapped_end = range.end();
        }
    }

    /// Insert `km` and coalesce with any adjacent equivalent mappings.
    fn map_and_coalesce(&self, km: Mapping, res: Resource) {
        log!(LogDebug, "  mapping {}", km);
        let key = RangeKey(*km);
        self.mem.borrow_mut().insert(key, MappingEntry::new(km, res));
        self.coalesce_around(key);
    }

    fn remove_from_map(&self, range: MemRange) {
        self.mem.borrow_mut().remove(&RangeKey(range));
    }

    fn add_to_map(&self, entry: MappingEntry) {
        self.mem.borrow_mut().insert(RangeKey(*entry.map), entry);
    }

    /// Merge the mappings semantically adjacent to `key`: same prot, flags
    /// and equivalent resources with (for real devices) adjacent offsets.
    fn coalesce_around(&self, key: RangeKey) {
        let first_k: RangeKey;
        let last_k: RangeKey;
        let new_entry: MappingEntry;

        {
            let mem = self.mem.borrow();
            let mut backward = mem.range((Unbounded, Included(key)));
            let mut first_kv = backward.next_back().unwrap();
            while let Some(prev_kv) = backward.next_back() {
                if !is_coalescable(prev_kv.1, first_kv.1) {
                    break;
                }
                first_kv = prev_kv;
            }

            let mut forward = mem.range((Included(key), Unbounded));
            let mut last_kv = forward.next().unwrap();
            for next_kv in forward {
                if !is_coalescable(last_kv.1, next_kv.1) {
                    break;
                }
                last_kv = next_kv;
            }

            if first_kv.0 == last_kv.0 {
                log!(LogDebug, "  no mappings to coalesce");
                return;
            }

            new_entry = MappingEntry::new(
                first_kv.1.map.extend(last_kv.0.end()),
                first_kv.1.res.clone(),
            );
            log!(LogDebug, "  coalescing {}", new_entry.map);
            first_k = *first_kv.0;
            last_k = *last_kv.0;
        }

        let to_remove: Vec<RangeKey> = self
            .mem
            .borrow()
            .range((Included(first_k), Included(last_k)))
            .map(|(k, _)| *k)
            .collect();
        for k in to_remove {
            self.mem.borrow_mut().remove(&k);
        }
        let inserted = self
            .mem
            .borrow_mut()
            .insert(RangeKey(*new_entry.map), new_entry);
        debug_assert!(inserted.is_none());
    }

    /// Erase the breakpoint at `addr` and restore the byte it overwrote.
    /// The restore is lenient: the address may have been unmapped since,
    /// in which case the write fails and is ignored.
    fn destroy_breakpoint_at(&self, t: &mut Task, addr: RemoteCodePtr) {
        let data = match self.breakpoints.borrow().get(&addr) {
            Some(bp) => bp.overwritten_data,
            None => return,
        };
        log!(LogDebug, "Writing back {:#x} at {}", data, addr);
        let mut ok = true;
        t.write_bytes_helper(
            addr.to_data_ptr::<Void>(),
            &[data],
            Some(&mut ok),
            WriteFlags::IS_BREAKPOINT_RELATED,
        );
        self.breakpoints.borrow_mut().remove(&addr);
    }

    /// Refresh the stored value of a write watchpoint. Returns true when
    /// the watched bytes changed.
    fn update_watchpoint_value(&self, t: &mut Task, range: &MemRange, wp: &mut Watchpoint) -> bool {
        let mut value_bytes = vec![0u8; range.size()];
        let valid = t
            .read_bytes_fallible(range.start(), &mut value_bytes)
            .map_or(false, |n| n == range.size());

        let changed = wp.valid != valid || wp.value_bytes != value_bytes;
        wp.valid = valid;
        wp.value_bytes = value_bytes;
        changed
    }

    fn update_watchpoint_values(&self, t: &mut Task, start: RemotePtr<Void>, end: RemotePtr<Void>) {
        let r = MemRange::from_range(start, end);
        let ranges: Vec<MemRange> = self
            .watchpoints
            .borrow()
            .keys()
            .filter(|range| range.intersects(&r))
            .copied()
            .collect();
        for range in ranges {
            let mut wp = self.watchpoints.borrow().get(&range).unwrap().clone();
            if self.update_watchpoint_value(t, &range, &mut wp) {
                wp.changed = true;
            }
            self.watchpoints.borrow_mut().insert(range, wp);
        }
    }

    fn get_watch_configs(&self, changed_only: bool) -> Vec<WatchConfig> {
        let mut configs = Vec::new();
        for (range, w) in self.watchpoints.borrow_mut().iter_mut() {
            if changed_only {
                if !w.changed {
                    continue;
                }
                w.changed = false;
            }
            let watching = w.watched_bits();
            if watching.contains(RwxBits::EXEC_BIT) {
                configs.push(WatchConfig::new(range.start(), range.size(), WatchType::Exec));
            }
            if watching.contains(RwxBits::READ_BIT) {
                configs.push(WatchConfig::new(
                    range.start(),
                    range.size(),
                    WatchType::ReadWrite,
                ));
            } else if watching.contains(RwxBits::WRITE_BIT) {
                configs.push(WatchConfig::new(range.start(), range.size(), WatchType::Write));
            }
        }
        configs
    }

    /// Project the logical watchpoint set onto hardware debug registers
    /// and program every task in this address space. On failure all task
    /// debug registers are cleared and false is returned.
    fn allocate_watchpoints(&self, t: &mut Task) -> bool {
        let mut regs: Vec<WatchConfig> = Vec::new();
        let mut assignments: Vec<(MemRange, Vec<u8>)> = Vec::new();

        for (range, w) in self.watchpoints.borrow().iter() {
            let watching = w.watched_bits();
            let mut assigned: Vec<u8> = Vec::new();
            if watching.contains(RwxBits::EXEC_BIT) {
                configure_watch_registers(&mut regs, range, WatchType::Exec, Some(&mut assigned));
            }
            if watching.contains(RwxBits::READ_BIT) {
                configure_watch_registers(
                    &mut regs,
                    range,
                    WatchType::ReadWrite,
                    Some(&mut assigned),
                );
            } else if watching.contains(RwxBits::WRITE_BIT) {
                configure_watch_registers(&mut regs, range, WatchType::Write, None);
            }
            assignments.push((*range, assigned));
        }

        let ok = regs.len() <= NUM_X86_WATCHPOINTS && self.program_all_tasks(t, &regs);
        if ok {
            for (range, assigned) in assignments {
                if let Some(w) = self.watchpoints.borrow_mut().get_mut(&range) {
                    w.debug_regs_for_exec_read = assigned;
                }
            }
            return true;
        }

        let empty: Vec<WatchConfig> = Vec::new();
        self.program_all_tasks(t, &empty);
        for w in self.watchpoints.borrow_mut().values_mut() {
            w.debug_regs_for_exec_read.clear();
        }
        false
    }

    fn program_all_tasks(&self, active: &mut Task, regs: &[WatchConfig]) -> bool {
        let mut ok = true;
        if self.task_set.has(&active.weak_self_clone()) {
            ok &= active.set_debug_regs(regs);
        }
        for t in self.task_set.iter_except(active) {
            ok &= t.borrow_mut().set_debug_regs(regs);
        }
        ok
    }
}

/// We do not allow a watchpoint to watch the last byte of memory
/// addressable by the engine; that would construct a wrapping MemRange.
fn range_for_watchpoint(addr: RemotePtr<Void>, num_bytes: usize) -> MemRange {
    let max_len = usize::MAX - addr.as_usize();
    MemRange::new(addr, min(num_bytes, max_len))
}

/// Split an arbitrary range into pieces programmable as x86 debug
/// registers: power-of-two sizes at matching alignment.
fn split_range(range: &MemRange) -> Vec<MemRange> {
    let mut result = Vec::new();
    let mut r: MemRange = *range;
    while r.size() > 0 {
        if (std::mem::size_of::<usize>() < 8 || !try_split_unaligned_range(&mut r, 8, &mut result))
            && !try_split_unaligned_range(&mut r, 4, &mut result)
            && !try_split_unaligned_range(&mut r, 2, &mut result)
        {
            let ret = try_split_unaligned_range(&mut r, 1, &mut result);
            debug_assert!(ret);
        }
    }
    result
}

fn try_split_unaligned_range(range: &mut MemRange, bytes: usize, result: &mut Vec<MemRange>) -> bool {
    if range.start().as_usize() & (bytes - 1) != 0 || range.size() < bytes {
        return false;
    }
    result.push(MemRange::new(range.start(), bytes));
    range.set_start(range.start() + bytes);
    true
}

fn configure_watch_registers(
    regs: &mut Vec<WatchConfig>,
    range: &MemRange,
    watchtype: WatchType,
    mut assigned_regs: Option<&mut Vec<u8>>,
) {
    // Zero-sized ranges yield no registers and are ignored.
    let mut split_ranges = split_range(range);

    if watchtype == WatchType::Write && range.size() > 1 {
        // Spurious write triggers are suppressed by value comparison, so an
        // unaligned range can be upgraded to an aligned larger one when
        // that conserves registers.
        let align: usize = if range.size() <= 2 {
            2
        } else if range.size() <= 4 || std::mem::size_of::<usize>() <= 4 {
            4
        } else {
            8
        };
        let aligned_start = RemotePtr::new(range.start().as_usize() & !(align - 1));
        let aligned_end = RemotePtr::new((range.end().as_usize() + align - 1) & !(align - 1));
        let split = split_range(&MemRange::from_range(aligned_start, aligned_end));
        if split.len() < split_ranges.len() {
            split_ranges = split;
        }
    }

    for r in &split_ranges {
        if let Some(ref mut assigned) = assigned_regs {
            assigned.push(regs.len() as u8);
        }
        regs.push(WatchConfig::new(r.start(), r.size(), watchtype));
    }
}

const fn dr_watchpoint(n: u32) -> u32 {
    1u32 << n
}

fn watchpoint_triggered(debug_status: usize, regs: &[u8]) -> bool {
    regs.iter()
        .any(|reg| debug_status & dr_watchpoint(*reg as u32) as usize != 0)
}

fn is_coalescable(left: &MappingEntry, right: &MappingEntry) -> bool {
    is_adjacent_mapping(left, right, HandleHeap::RespectHeap, None)
}

/// True iff `left` and `right` are located adjacently in memory with the
/// same metadata and map adjacent locations of the same backing object.
/// The empty-region placeholder short-circuits the resource check.
fn is_adjacent_mapping(
    left: &MappingEntry,
    right: &MappingEntry,
    handle_heap: HandleHeap,
    flags_to_check: Option<MapFlags>,
) -> bool {
    if left.map.end() != right.map.start() {
        return false;
    }
    let flags_to_check = flags_to_check.unwrap_or_else(MapFlags::all);
    if ((left.map.flags() ^ right.map.flags()) & flags_to_check) != MapFlags::empty()
        || left.map.prot() != right.map.prot()
    {
        return false;
    }
    if left.res.is_placeholder() || right.res.is_placeholder() {
        return true;
    }
    if !normalized_resources_equal(&left.res, &right.res, handle_heap) {
        return false;
    }
    if left.res.is_real_device()
        && left.map.file_offset_bytes() + left.map.size() as u64 != right.map.file_offset_bytes()
    {
        return false;
    }
    true
}

fn normalized_resources_equal(r1: &Resource, r2: &Resource, handle_heap: HandleHeap) -> bool {
    if r1.is_stack() || r2.is_stack() {
        // The kernel uses "[stack:<tid>]" for any area containing a
        // thread's stack pointer, and drops the label when that thread
        // exits. Skip the name comparison for stacks.
        return true;
    }
    if handle_heap == HandleHeap::TreatHeapAsAnonymous && (r1.is_heap() || r2.is_heap()) {
        // The kernel's heuristics for labelling anonymous memory "[heap]"
        // are obscure; compare device/inode only.
        return r1.is_real_device() == r2.is_real_device();
    }
    if r1.is_real_device() != r2.is_real_device() {
        return false;
    }
    if r1.is_real_device() {
        // We don't track deletions, so the kernel may have " (deleted)"
        // appended when we don't.
        if strip_deleted(r1.fsname()) != strip_deleted(r2.fsname()) {
            return false;
        }
    }
    r1.equivalent_to(r2)
}

fn strip_deleted(s: &OsStr) -> &OsStr {
    match find(s.as_bytes(), b" (deleted)") {
        Some(loc) => OsStr::from_bytes(&s.as_bytes()[0..loc]),
        None => s,
    }
}

/// Pull the next mapping from `it`, merged with all following mappings
/// that are adjacent per the kernel-visible denominators.
fn next_merged<I: Iterator<Item = (Mapping, Resource)>>(
    it: &mut std::iter::Peekable<I>,
) -> Option<(Mapping, Resource)> {
    let mut cur = it.next()?;
    while let Some(next) = it.peek() {
        if !try_merge_adjacent(&mut cur, next) {
            break;
        }
        it.next();
    }
    Some(cur)
}

/// If the pair is adjacent per the kernel-visible denominators, merge into
/// `left` and return true.
fn try_merge_adjacent(left: &mut (Mapping, Resource), right: &(Mapping, Resource)) -> bool {
    let left_entry = MappingEntry::new(left.0.clone(), left.1.clone());
    let right_entry = MappingEntry::new(right.0.clone(), right.1.clone());
    if is_adjacent_mapping(
        &left_entry,
        &right_entry,
        HandleHeap::TreatHeapAsAnonymous,
        Some(Mapping::CHECKABLE_FLAGS_MASK),
    ) {
        left.0 = left.0.extend(right.0.end());
        return true;
    }
    false
}

fn assert_segments_match(t: &Task, vm: &(Mapping, Resource), km: &(Mapping, Resource)) {
    let mut err: &'static str = "";
    if vm.0.start() != km.0.start() {
        err = "starts differ";
    } else if vm.0.end() != km.0.end() {
        err = "ends differ";
    } else if vm.0.prot() != km.0.prot() {
        err = "prots differ";
    } else if (vm.0.flags() ^ km.0.flags()) & Mapping::CHECKABLE_FLAGS_MASK != MapFlags::empty() {
        err = "flags differ";
    } else if !normalized_resources_equal(&vm.1, &km.1, HandleHeap::TreatHeapAsAnonymous)
        && !km.1.is_vdso()
        && !is_emufs_resource(&vm.1)
    {
        // Mappings backed by the replayer's emulated fs have a different
        // device/inode at the kernel level and are accepted by name.
        // Pre-3.16 kernels also spuriously label the original VDSO address
        // [vdso] after it was unmapped, so [vdso] reports are skipped.
        err = "resources differ";
    }
    if !err.is_empty() {
        log!(LogError, "cached: {} {}\nkernel: {} {}", vm.0, vm.1, km.0, km.1);
        ed_assert!(t, false, "Cached mapping {} should be {}; {}", vm.0, km.0, err);
    }
}

/// Mappings whose backing file lives under the replayer's emulated-fs
/// directory are identified by name.
fn is_emufs_resource(res: &Resource) -> bool {
    find(res.fsname().as_bytes(), b"retrace-emufs").is_some()
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        if let Some(session) = self.session_.upgrade() {
            session.on_destroy_vm(self.uid_);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use std::rc::Weak;

    fn test_vm() -> AddressSpace {
        AddressSpace::new(
            Weak::<Session>::new(),
            100,
            AddressSpaceUid::new_with(100, 0, 0),
            OsStr::new("/bin/test"),
        )
    }

    fn rw() -> ProtFlags {
        ProtFlags::PROT_READ | ProtFlags::PROT_WRITE
    }

    fn anon_flags() -> MapFlags {
        MapFlags::MAP_ANONYMOUS | MapFlags::MAP_PRIVATE
    }

    const PAGE: usize = 4096;

    #[test]
    fn map_and_unmap_anonymous() {
        let vm = test_vm();
        vm.map(
            0x10000.into(),
            2 * PAGE,
            rw(),
            anon_flags(),
            0,
            Resource::anonymous(1),
        );
        assert_eq!(vm.mapping_count(), 1);
        let m = vm.mapping_of(0x10000.into()).unwrap();
        assert_eq!(m.map.size(), 2 * PAGE);

        vm.unmap(0x10000.into(), 2 * PAGE);
        assert_eq!(vm.mapping_count(), 0);
        assert!(vm.mapping_of(0x10000.into()).is_none());
    }

    #[test]
    fn no_mappings_intersect() {
        let vm = test_vm();
        vm.map(0x10000.into(), 4 * PAGE, rw(), anon_flags(), 0, Resource::anonymous(1));
        // Map over the middle; MAP_FIXED semantics unmap the overlap.
        vm.map(
            (0x10000 + PAGE).into(),
            PAGE,
            ProtFlags::PROT_READ,
            anon_flags(),
            0,
            Resource::anonymous(2),
        );

        let maps = vm.maps();
        assert_eq!(maps.len(), 3);
        for w in maps.windows(2) {
            assert!(!w[0].map.intersects(&w[1].map));
            assert!(w[0].map.end() <= w[1].map.start());
        }
    }

    #[test]
    fn unmap_splits_underflow_and_overflow() {
        let vm = test_vm();
        vm.map(0x10000.into(), 4 * PAGE, rw(), anon_flags(), 0, Resource::anonymous(1));
        vm.unmap((0x10000 + PAGE).into(), PAGE);

        let maps = vm.maps();
        assert_eq!(maps.len(), 2);
        assert_eq!(maps[0].map.start().as_usize(), 0x10000);
        assert_eq!(maps[0].map.size(), PAGE);
        assert_eq!(maps[1].map.start().as_usize(), 0x10000 + 2 * PAGE);
        assert_eq!(maps[1].map.size(), 2 * PAGE);
    }

    #[test]
    fn unmap_adjusts_file_offset_of_suffix() {
        let vm = test_vm();
        let res = Resource::new(
            resource::FileId::real(nix::sys::stat::makedev(8, 1), 7),
            OsStr::new("/lib/lib.so"),
        );
        vm.map(
            0x10000.into(),
            4 * PAGE,
            ProtFlags::PROT_READ,
            MapFlags::MAP_PRIVATE,
            0x2000,
            res,
        );
        vm.unmap(0x10000.into(), 2 * PAGE);

        let maps = vm.maps();
        assert_eq!(maps.len(), 1);
        assert_eq!(maps[0].map.start().as_usize(), 0x10000 + 2 * PAGE);
        // offset advanced by (rem.end - m.start).
        assert_eq!(maps[0].map.file_offset_bytes(), 0x2000 + 2 * PAGE as u64);
    }

    #[test]
    fn protect_splits_into_three() {
        let vm = test_vm();
        vm.map(
            0x10000.into(),
            3 * PAGE,
            ProtFlags::PROT_READ | ProtFlags::PROT_EXEC,
            anon_flags(),
            0,
            Resource::anonymous(1),
        );
        vm.protect((0x10000 + PAGE).into(), PAGE, ProtFlags::empty());

        let maps = vm.maps();
        assert_eq!(maps.len(), 3);
        assert_eq!(maps[0].map.prot(), ProtFlags::PROT_READ | ProtFlags::PROT_EXEC);
        assert_eq!(maps[1].map.prot(), ProtFlags::empty());
        assert_eq!(maps[2].map.prot(), ProtFlags::PROT_READ | ProtFlags::PROT_EXEC);
        assert_eq!(maps[1].map.start().as_usize(), 0x10000 + PAGE);
        assert_eq!(maps[1].map.size(), PAGE);
    }

    #[test]
    fn protect_back_coalesces() {
        let vm = test_vm();
        vm.map(0x10000.into(), 3 * PAGE, rw(), anon_flags(), 0, Resource::anonymous(1));
        vm.protect((0x10000 + PAGE).into(), PAGE, ProtFlags::PROT_READ);
        assert_eq!(vm.mapping_count(), 3);
        vm.protect((0x10000 + PAGE).into(), PAGE, rw());
        // Equivalent neighbors re-merge into one mapping.
        assert_eq!(vm.mapping_count(), 1);
        assert_eq!(vm.mapping_of(0x10000.into()).unwrap().map.size(), 3 * PAGE);
    }

    #[test]
    fn adjacent_anonymous_mappings_do_not_merge() {
        let vm = test_vm();
        vm.map(0x10000.into(), PAGE, rw(), anon_flags(), 0, Resource::anonymous(1));
        vm.map((0x10000 + PAGE).into(), PAGE, rw(), anon_flags(), 0, Resource::anonymous(2));
        // Distinct synthetic inodes keep them apart.
        assert_eq!(vm.mapping_count(), 2);

        vm.map((0x10000 + 2 * PAGE).into(), PAGE, rw(), anon_flags(), 0, Resource::anonymous(2));
        // Same resource, adjacent: merges with the second mapping.
        assert_eq!(vm.mapping_count(), 2);
        let m = vm.mapping_of((0x10000 + PAGE).into()).unwrap();
        assert_eq!(m.map.size(), 2 * PAGE);
    }

    #[test]
    fn file_mappings_merge_only_with_adjacent_offsets() {
        let vm = test_vm();
        let res = || {
            Resource::new(
                resource::FileId::real(nix::sys::stat::makedev(8, 1), 7),
                OsStr::new("/lib/lib.so"),
            )
        };
        vm.map(0x10000.into(), PAGE, ProtFlags::PROT_READ, MapFlags::MAP_PRIVATE, 0, res());
        vm.map(
            (0x10000 + PAGE).into(),
            PAGE,
            ProtFlags::PROT_READ,
            MapFlags::MAP_PRIVATE,
            PAGE as u64,
            res(),
        );
        assert_eq!(vm.mapping_count(), 1);

        // A gap in file offsets prevents merging.
        vm.map(
            (0x10000 + 2 * PAGE).into(),
            PAGE,
            ProtFlags::PROT_READ,
            MapFlags::MAP_PRIVATE,
            (4 * PAGE) as u64,
            res(),
        );
        assert_eq!(vm.mapping_count(), 2);
    }

    #[test]
    fn remap_moves_mapping() {
        let vm = test_vm();
        vm.map(0x10000.into(), 2 * PAGE, rw(), anon_flags(), 0, Resource::anonymous(1));
        vm.remap(0x10000.into(), 2 * PAGE, 0x40000.into(), 3 * PAGE);

        assert!(vm.mapping_of(0x10000.into()).is_none());
        let m = vm.mapping_of(0x40000.into()).unwrap();
        assert_eq!(m.map.start().as_usize(), 0x40000);
        assert_eq!(m.map.size(), 3 * PAGE);
    }

    #[test]
    fn zero_length_remap_is_pure_unmap() {
        let vm = test_vm();
        vm.map(0x10000.into(), 2 * PAGE, rw(), anon_flags(), 0, Resource::anonymous(1));
        vm.remap(0x10000.into(), 2 * PAGE, 0x40000.into(), 0);
        assert_eq!(vm.mapping_count(), 0);
    }

    #[test]
    fn brk_grows_and_shrinks_heap() {
        let vm = test_vm();
        vm.init_brk(0x200000.into());
        vm.brk((0x200000 + 2 * PAGE).into(), rw());
        let m = vm.mapping_of(0x200000.into()).unwrap();
        assert!(m.res.is_heap());
        assert_eq!(m.map.size(), 2 * PAGE);
        assert_eq!(vm.current_brk().as_usize(), 0x200000 + 2 * PAGE);
        // The start stays fixed.
        assert_eq!(vm.brk_region_start().as_usize(), 0x200000);

        vm.brk((0x200000 + PAGE).into(), rw());
        let m = vm.mapping_of(0x200000.into()).unwrap();
        assert_eq!(m.map.size(), PAGE);
    }

    #[test]
    fn watch_register_projection() {
        // An aligned 8-byte range takes one register.
        let r = MemRange::new(0x1000.into(), 8);
        assert_eq!(split_range(&r).len(), 1);

        // An unaligned 5-byte range splits into several.
        let r = MemRange::new(0x1001.into(), 5);
        let split = split_range(&r);
        assert!(split.len() > 1);
        let total: usize = split.iter().map(|s| s.size()).sum();
        assert_eq!(total, 5);
        for s in &split {
            assert!(s.start().as_usize() % s.size() == 0);
        }
    }

    #[test]
    fn write_watchpoints_may_upgrade_alignment() {
        let mut regs = Vec::new();
        let range = MemRange::new(0x1001.into(), 5);
        configure_watch_registers(&mut regs, &range, WatchType::Write, None);
        // The aligned upgrade covers [0x1000, 0x1008) with one register.
        assert_eq!(regs.len(), 1);
        assert_eq!(regs[0].addr.as_usize(), 0x1000);
        assert_eq!(regs[0].num_bytes, 8);
    }

    #[test]
    fn watchpoint_trigger_detection() {
        assert!(watchpoint_triggered(0x1, &[0]));
        assert!(!watchpoint_triggered(0x2, &[0]));
        assert!(watchpoint_triggered(0x8, &[1, 3]));
        assert!(!watchpoint_triggered(0x0, &[0, 1, 2, 3]));
    }
}
