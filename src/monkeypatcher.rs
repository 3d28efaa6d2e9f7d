use crate::{
    kernel_abi::{syscall_instruction_length, SupportedArch},
    log::{LogDebug, LogWarn},
    preload_interface::{preload_init_params, syscall_patch_hook},
    remote_code_ptr::RemoteCodePtr,
    remote_ptr::{RemotePtr, Void},
    session::task::{Task, WriteFlags},
    util::{find, page_size},
};
use goblin::elf::Elf;
use goblin::elf64::section_header::{SHF_ALLOC, SHT_NOBITS};
use std::collections::{HashMap, HashSet};
use std::convert::TryInto;
use std::mem::size_of;
use std::path::Path;

const MAX_VDSO_SIZE: usize = 16384;

/// The VDSO entries rewritten in place immediately after exec, with the
/// syscall number each should trap into the kernel with. getcpu stays
/// unbuffered, but its entry still becomes a real syscall so the engine
/// sees and records it.
struct NamedSyscall {
    name: &'static str,
    syscall_number: i32,
}

const SYSCALLS_TO_MONKEYPATCH: [NamedSyscall; 5] = [
    NamedSyscall {
        name: "__vdso_clock_gettime",
        syscall_number: crate::kernel_abi::x64::CLOCK_GETTIME,
    },
    NamedSyscall {
        name: "__vdso_clock_getres",
        syscall_number: crate::kernel_abi::x64::CLOCK_GETRES,
    },
    NamedSyscall {
        name: "__vdso_gettimeofday",
        syscall_number: crate::kernel_abi::x64::GETTIMEOFDAY,
    },
    NamedSyscall {
        name: "__vdso_time",
        syscall_number: crate::kernel_abi::x64::TIME,
    },
    NamedSyscall {
        name: "__vdso_getcpu",
        syscall_number: crate::kernel_abi::x64::GETCPU,
    },
];

/// The buffered-capable entries, rewritten again at preload-init time to
/// call the trampoline. getcpu is deliberately absent.
const SYSCALLS_TO_TRAMPOLINE: [&str; 3] = [
    "__vdso_clock_gettime",
    "__vdso_gettimeofday",
    "__vdso_time",
];

/// mov $syscall_number,%eax; syscall; nop; nop; nop; ret
struct X64VsyscallMonkeypatch;

const X64_VSYSCALL_MONKEYPATCH_BYTES: [u8; 11] =
    [0xb8, 0x0, 0x0, 0x0, 0x0, 0x0f, 0x05, 0x90, 0x90, 0x90, 0xc3];

impl X64VsyscallMonkeypatch {
    const SYSCALL_NUMBER_END: usize = 5;
    const SIZE: usize = X64_VSYSCALL_MONKEYPATCH_BYTES.len();

    fn substitute(buffer: &mut [u8], syscall_number: i32) {
        buffer[0] = X64_VSYSCALL_MONKEYPATCH_BYTES[0];
        buffer[1..1 + size_of::<i32>()].copy_from_slice(&syscall_number.to_le_bytes());
        buffer[Self::SYSCALL_NUMBER_END..Self::SIZE]
            .copy_from_slice(&X64_VSYSCALL_MONKEYPATCH_BYTES[Self::SYSCALL_NUMBER_END..Self::SIZE]);
    }
}

/// call rel32; nop; ... the PC-relative trampoline call installed over a
/// patchable site.
const CALL_INSN_SIZE: usize = 5;

/// Patching state, one instance per tracee address space. The patcher
/// performs three jobs:
///
/// 1) Rewrites the VDSO's user-space-only implementations of certain
/// syscalls to trap into the kernel for real, so the engine can record
/// them (immediately after exec, no tracee cooperation needed: VDSO pages
/// are writable by the tracer without mprotect).
///
/// 2) After the preload library's rendezvous call, rewrites the
/// buffered-capable VDSO entries to call the library's trampoline.
///
/// 3) Patches syscall instructions whose following bytes match a known
/// hook signature to call the trampoline.
///
/// The patcher only runs during recording, never replay.
pub struct Monkeypatcher {
    /// Syscalls in the VDSO patched to be direct syscalls; these can
    /// always be safely redirected to the syscallbuf.
    pub patched_vdso_syscalls: HashSet<RemoteCodePtr>,

    /// The supported syscall patches obtained from the preload library.
    /// Each matches a byte signature for the instructions after a syscall
    /// instruction.
    syscall_hooks: Vec<syscall_patch_hook>,

    /// The trampoline entry published by the preload library.
    hook_trampoline: RemotePtr<Void>,

    /// Sites (keyed by the address of the instruction following the
    /// syscall) where patching has been attempted; each site is attempted
    /// at most once.
    tried_to_patch_syscall_addresses: HashSet<RemoteCodePtr>,

    /// Addresses/lengths of patched regions, for bookkeeping.
    pub patched_sites: HashMap<RemotePtr<Void>, usize>,
}

impl Monkeypatcher {
    pub fn new() -> Monkeypatcher {
        Monkeypatcher {
            patched_vdso_syscalls: HashSet::new(),
            syscall_hooks: Vec::new(),
            hook_trampoline: RemotePtr::null(),
            tried_to_patch_syscall_addresses: HashSet::new(),
            patched_sites: HashMap::new(),
        }
    }

    /// Apply any patching that doesn't depend on the preload library,
    /// immediately after exec.
    pub fn patch_after_exec(&mut self, t: &mut Task) {
        match t.arch() {
            SupportedArch::X64 => self.patch_vdso_after_exec_x64(t),
            SupportedArch::X86 => {
                // 32-bit execution support is out of scope; the VDSO is
                // left alone and those syscalls take the trap path.
                log!(LogWarn, "x86 tracee: skipping VDSO patching");
            }
        }

        let maps = t.vm().maps();
        for entry in maps {
            self.patch_after_mmap(
                t,
                entry.map.start(),
                entry.map.size(),
                (entry.map.file_offset_bytes() / page_size() as u64) as usize,
                entry.res.fsname().to_os_string(),
            );
        }
    }

    /// The preload library made its rendezvous call carrying trampoline
    /// addresses; apply the cooperative patches.
    pub fn patch_at_preload_init(&mut self, t: &mut Task) {
        // The tracee can't be interrupted by a signal here: it masked
        // everything off around the rendezvous.
        let params_addr: RemotePtr<preload_init_params> = t.regs_ref().arg1().into();
        let params = t.read_val_mem(params_addr, None);

        self.hook_trampoline = RemotePtr::new(params.syscall_hook_trampoline as usize);
        let count = params.syscall_patch_hook_count as usize;
        let hooks_addr: RemotePtr<syscall_patch_hook> =
            RemotePtr::new(params.syscall_patch_hooks as usize);
        self.syscall_hooks.clear();
        for i in 0..count {
            let hook = t.read_val_mem(hooks_addr + i, None);
            self.syscall_hooks.push(hook);
        }
        log!(
            LogDebug,
            "preload init: trampoline {} with {} hooks",
            self.hook_trampoline,
            count
        );

        if t.arch() == SupportedArch::X64 {
            self.patch_vdso_entries_to_trampoline(t);
        }
        t.vm().set_syscallbuf_enabled(params.syscallbuf_enabled != 0);
    }

    /// Try to patch the syscall instruction `t` just entered. When false,
    /// patching was declined and the syscall proceeds over the heavier
    /// trap-based path; this is a soft degradation, not an error.
    pub fn try_patch_syscall(&mut self, t: &mut Task) -> bool {
        if self.syscall_hooks.is_empty() {
            // Hooks not set up yet; don't fill
            // tried_to_patch_syscall_addresses with sites that may become
            // patchable later.
            return false;
        }

        let arch = t.arch();
        // The IP points after the syscall instruction at entry.
        let following_ip = t.ip();
        if self.tried_to_patch_syscall_addresses.contains(&following_ip) {
            return false;
        }
        self.tried_to_patch_syscall_addresses.insert(following_ip);

        if t.vm().traced_syscall_ip() == following_ip.decrement_by_syscall_insn_length(arch)
            || t.vm().untraced_syscall_ip()
                == following_ip.decrement_by_syscall_insn_length(arch)
        {
            // Never patch the syscall page's own instructions.
            return false;
        }

        let mut next_bytes = [0u8; 14];
        if t.read_bytes_fallible(following_ip.to_data_ptr::<Void>(), &mut next_bytes)
            .is_err()
        {
            return false;
        }

        let hook = match self
            .syscall_hooks
            .iter()
            .find(|hook| {
                let len = hook.next_instruction_length as usize;
                len <= next_bytes.len()
                    && next_bytes[..len] == hook.next_instruction_bytes[..len]
            })
            .copied()
        {
            Some(hook) => hook,
            None => {
                log!(
                    LogDebug,
                    "declining to patch {}: no signature match",
                    following_ip
                );
                return false;
            }
        };

        let patch_start = following_ip.decrement_by_syscall_insn_length(arch);
        if !self.patch_site_with_trampoline(
            t,
            patch_start.to_data_ptr::<Void>(),
            syscall_instruction_length(arch) + hook.next_instruction_length as usize,
            RemotePtr::new(hook.hook_address as usize),
        ) {
            return false;
        }

        // Resume at the start of the patched sequence.
        let mut r = *t.regs_ref();
        r.set_ip(patch_start);
        t.set_regs(&r);
        log!(LogDebug, "patched syscall site at {}", patch_start);
        true
    }

    /// Apply patching needed after an mmap of a library; used to neuter
    /// lock elision in libc/libpthread, whose hardware transactions can't
    /// be recorded.
    pub fn patch_after_mmap(
        &mut self,
        t: &mut Task,
        start: RemotePtr<Void>,
        size: usize,
        offset_pages: usize,
        fsname: std::ffi::OsString,
    ) {
        if !file_may_need_instrumentation(&fsname) {
            return;
        }
        let path = fsname.clone();
        let data = match std::fs::read(Path::new(&path)) {
            Ok(data) => data,
            Err(_) => return,
        };
        let elf_file = match Elf::parse(&data) {
            Ok(elf_file) => elf_file,
            Err(_) => return,
        };

        for sym in &elf_file.syms {
            if has_name(&elf_file.strtab, sym.st_name, "__elision_aconf") {
                // Setting __elision_aconf.retry_try_xbegin to zero means
                // pthread rwlocks don't try elision at all. See ELIDE_LOCK
                // in glibc's elide.h.
                const ZERO: [u8; 4] = [0, 0, 0, 0];
                self.set_and_record_bytes(
                    t,
                    &elf_file,
                    sym.st_value as usize + 8,
                    &ZERO,
                    start,
                    size,
                    offset_pages,
                );
            }
            if has_name(&elf_file.strtab, sym.st_name, "elision_init") {
                // Make elision_init return without doing anything, leaving
                // __elision_available and __pthread_force_elision zero.
                const RET: [u8; 1] = [0xc3];
                self.set_and_record_bytes(
                    t,
                    &elf_file,
                    sym.st_value as usize,
                    &RET,
                    start,
                    size,
                    offset_pages,
                );
            }
        }
    }

    /// VDSOs are full of overhead-critical time functions. Rewrite each to
    /// trap into the kernel for real so the engine records it. The dynamic
    /// loader or static constructors may call them before the preload
    /// library initializes, so this can't wait for cooperation.
    fn patch_vdso_after_exec_x64(&mut self, t: &mut Task) {
        let vdso = t.vm().vdso();
        let vdso_start = vdso.start();
        let vdso_size = vdso.size();
        if vdso_size > MAX_VDSO_SIZE {
            log!(LogWarn, "VDSO unexpectedly large ({:#x}); not patching", vdso_size);
            return;
        }

        let mut data = vec![0u8; vdso_size];
        t.read_bytes_helper(vdso_start, &mut data, None);
        let elf_file = match Elf::parse(&data) {
            Ok(elf_file) => elf_file,
            Err(e) => fatal!("Error parsing vdso: {:?}", e),
        };

        for syscall in &SYSCALLS_TO_MONKEYPATCH {
            for s in elf_file.dynsyms.iter() {
                match elf_file.dynstrtab.get_at(s.st_name) {
                    Some(name) if name == syscall.name => {
                        let mut file_offset: usize = 0;
                        if !addr_to_offset(&elf_file, s.st_value as usize, &mut file_offset) {
                            log!(LogDebug, "Can't convert address {} to offset", s.st_value);
                            continue;
                        }

                        // Absolutely-addressed symbols claim to start at
                        // the VDSO's expected static base; mask down to a
                        // page-sized offset and add the live start.
                        const VDSO_STATIC_BASE: usize = 0xffffffffff700000;
                        const VDSO_ABS_MASK: usize = 0xffff;
                        let sym_offset = file_offset & VDSO_ABS_MASK;

                        if (file_offset >= VDSO_STATIC_BASE
                            && file_offset < VDSO_STATIC_BASE + vdso_size)
                            || file_offset < vdso_size
                        {
                            let absolute_address = vdso_start.as_usize() + sym_offset;

                            let mut patch = [0u8; X64VsyscallMonkeypatch::SIZE];
                            X64VsyscallMonkeypatch::substitute(&mut patch, syscall.syscall_number);

                            write_and_record_bytes(t, absolute_address.into(), &patch);
                            // Remember the syscall instruction itself,
                            // past the "mov $nr,%eax".
                            self.patched_vdso_syscalls
                                .insert(RemoteCodePtr::from_val(absolute_address + 5));
                            log!(
                                LogDebug,
                                "monkeypatched {} to syscall {} at {:#x} ({:#x})",
                                syscall.name,
                                syscall.syscall_number,
                                absolute_address,
                                file_offset
                            );

                            // Once in a while a duplicate symbol with a
                            // bogus file offset shows up; stop at the
                            // first valid value.
                            break;
                        } else {
                            log!(
                                LogDebug,
                                "Ignoring odd file offset {:#x}; size={:#x}",
                                file_offset,
                                vdso_size
                            );
                        }
                    }
                    _ => (),
                }
            }
        }

        obliterate_debug_info(&elf_file, t, vdso_start);
    }

    /// Rewrite the buffered-capable VDSO entries to call the preload
    /// trampoline. A site farther than ±2 GiB from the trampoline can't
    /// take a rel32 call and is declined with a log message.
    fn patch_vdso_entries_to_trampoline(&mut self, t: &mut Task) {
        let trampoline = self.hook_trampoline;
        if trampoline.is_null() {
            return;
        }

        let vdso = t.vm().vdso();
        let mut data = vec![0u8; vdso.size()];
        t.read_bytes_helper(vdso.start(), &mut data, None);
        let elf_file = match Elf::parse(&data) {
            Ok(elf_file) => elf_file,
            Err(_) => return,
        };

        for name in &SYSCALLS_TO_TRAMPOLINE {
            for s in elf_file.dynsyms.iter() {
                match elf_file.dynstrtab.get_at(s.st_name) {
                    Some(sym_name) if sym_name == *name => {
                        let mut file_offset: usize = 0;
                        if !addr_to_offset(&elf_file, s.st_value as usize, &mut file_offset) {
                            continue;
                        }
                        let site = vdso.start().as_usize() + (file_offset & 0xffff);
                        if !self.patch_site_with_trampoline(
                            t,
                            site.into(),
                            X64VsyscallMonkeypatch::SIZE,
                            trampoline,
                        ) {
                            log!(LogDebug, "declining trampoline patch of {}", sym_name);
                        }
                        break;
                    }
                    _ => (),
                }
            }
        }
    }

    /// Install `call rel32` to the trampoline at `site`, padding the rest
    /// of `patch_len` with no-ops. Declines when the displacement exceeds
    /// ±2 GiB or the site is too short for the call.
    fn patch_site_with_trampoline(
        &mut self,
        t: &mut Task,
        site: RemotePtr<Void>,
        patch_len: usize,
        target: RemotePtr<Void>,
    ) -> bool {
        if patch_len < CALL_INSN_SIZE {
            log!(LogDebug, "patch site at {} too short", site);
            return false;
        }
        let return_addr = site.as_usize() + CALL_INSN_SIZE;
        let displacement = (target.as_usize() as i64) - (return_addr as i64);
        if displacement > i32::MAX as i64 || displacement < i32::MIN as i64 {
            log!(
                LogDebug,
                "declining to patch {}: trampoline out of rel32 range",
                site
            );
            return false;
        }

        let mut patch = vec![0x90u8; patch_len];
        patch[0] = 0xe8;
        patch[1..5].copy_from_slice(&(displacement as i32).to_le_bytes());
        write_and_record_bytes(t, site, &patch);
        self.patched_sites.insert(site, patch_len);
        true
    }

    fn set_and_record_bytes(
        &mut self,
        t: &mut Task,
        elf_file: &Elf,
        elf_addr: usize,
        bytes: &[u8],
        map_start: RemotePtr<Void>,
        map_size: usize,
        map_offset_pages: usize,
    ) {
        let mut file_offset: usize = 0;
        if !addr_to_offset(elf_file, elf_addr, &mut file_offset) {
            log!(LogWarn, "ELF address {:#x} not in file", elf_addr);
            return;
        }
        let map_offset = map_offset_pages * page_size();
        if file_offset < map_offset || file_offset + 32 > map_offset + map_size {
            // Code and data can be mapped in separate partial mmaps, so
            // some symbols land outside this mapped range.
            return;
        }
        let addr = map_start + (file_offset - map_offset);

        log!(LogDebug, "  resolved at address: {}; will be patched", addr);
        let mut ok = true;
        t.write_bytes_helper(addr, bytes, Some(&mut ok), WriteFlags::empty());
        // Writing can fail when the value appears to be in the mapped
        // range but actually lies beyond the file length.
        if ok {
            record_patched_bytes(t, addr, bytes);
        }
    }
}

impl Default for Monkeypatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn has_name(tab: &goblin::strtab::Strtab, index: usize, name: &str) -> bool {
    matches!(tab.get_at(index), Some(found) if found == name)
}

/// Convert a virtual address in an ELF image to a file offset via its
/// section table. Skips sections that occupy no file space or memory.
fn addr_to_offset(elf_file: &Elf, addr: usize, offset: &mut usize) -> bool {
    for section in &elf_file.section_headers {
        if section.sh_type == SHT_NOBITS || (section.sh_flags & SHF_ALLOC as u64) == 0 {
            continue;
        }
        if addr >= section.sh_addr as usize
            && addr - (section.sh_addr as usize) < section.sh_size as usize
        {
            *offset = addr - section.sh_addr as usize + section.sh_offset as usize;
            return true;
        }
    }
    false
}

/// Zero the unwind and note sections of the patched VDSO so debuggers
/// don't try to interpret stale data over our rewrites.
fn obliterate_debug_info(elf_file: &Elf, t: &mut Task, vdso_start: RemotePtr<Void>) {
    for section_name in &[".eh_frame", ".eh_frame_hdr", ".note"] {
        let mut found = false;
        for section in &elf_file.section_headers {
            match elf_file.shdr_strtab.get_at(section.sh_name) {
                Some(name) if name == *section_name => {
                    let zeroes = vec![0u8; section.sh_size as usize];
                    write_and_record_bytes(
                        t,
                        vdso_start + section.sh_offset as usize,
                        &zeroes,
                    );
                    found = true;
                }
                _ => (),
            }
            if found {
                break;
            }
        }
        if !found {
            log!(LogDebug, "Could not find section {} to erase", section_name);
        }
    }
}

fn file_may_need_instrumentation(fsname: &std::ffi::OsStr) -> bool {
    use std::os::unix::ffi::OsStrExt;
    let bytes = fsname.as_bytes();
    let base_start = bytes
        .iter()
        .rposition(|&b| b == b'/')
        .map_or(0, |p| p + 1);
    let base = &bytes[base_start..];
    find(base, b"ld").is_some() || find(base, b"libpthread").is_some()
}

/// Write the patch into the tracee and record it so replay reproduces the
/// patched bytes.
fn write_and_record_bytes(t: &mut Task, addr: RemotePtr<Void>, bytes: &[u8]) {
    t.write_bytes_helper(addr, bytes, None, WriteFlags::empty());
    record_patched_bytes(t, addr, bytes);
}

fn record_patched_bytes(t: &mut Task, addr: RemotePtr<Void>, bytes: &[u8]) {
    if let Some(session) = t.try_session() {
        if let Some(record) = session.as_record() {
            record
                .trace_writer
                .borrow_mut()
                .write_raw(t.rec_tid, bytes, addr.as_usize());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vsyscall_patch_template() {
        let mut patch = [0u8; X64VsyscallMonkeypatch::SIZE];
        X64VsyscallMonkeypatch::substitute(&mut patch, 96);
        // mov $96,%eax
        assert_eq!(patch[0], 0xb8);
        assert_eq!(i32::from_le_bytes(patch[1..5].try_into().unwrap()), 96);
        // syscall
        assert_eq!(&patch[5..7], &[0x0f, 0x05]);
        // ret at the end
        assert_eq!(patch[X64VsyscallMonkeypatch::SIZE - 1], 0xc3);
    }

    #[test]
    fn instrumentation_candidates() {
        use std::ffi::OsStr;
        assert!(file_may_need_instrumentation(OsStr::new(
            "/lib/x86_64-linux-gnu/libpthread.so.0"
        )));
        assert!(file_may_need_instrumentation(OsStr::new(
            "/lib64/ld-linux-x86-64.so.2"
        )));
        assert!(!file_may_need_instrumentation(OsStr::new(
            "/usr/lib/libfoo.so"
        )));
    }
}
