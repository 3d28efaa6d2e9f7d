use crate::{
    kernel_abi::{user_regs_size, SupportedArch, X86UserRegs},
    remote_code_ptr::RemoteCodePtr,
    remote_ptr::{RemotePtr, Void},
};
use libc::user_regs_struct;
use std::{
    fmt::{self, Formatter},
    io,
    io::Write,
    mem::size_of,
};

pub const X86_TF_FLAG: usize = 1 << 8;

/// The tracee register file, tagged by architecture. Stored in the kernel's
/// ptrace layout for that architecture so trace serialization is a plain
/// byte copy (spec: the raw register block follows the kernel's ptrace
/// layout, preceded by an arch byte).
#[derive(Copy, Clone)]
pub struct Registers {
    arch_: SupportedArch,
    x64: user_regs_struct,
    x86: X86UserRegs,
}

fn zeroed_native() -> user_regs_struct {
    unsafe { std::mem::zeroed() }
}

impl Default for Registers {
    fn default() -> Self {
        Registers::new(crate::kernel_abi::NATIVE_ARCH)
    }
}

impl Registers {
    pub fn new(arch: SupportedArch) -> Registers {
        Registers {
            arch_: arch,
            x64: zeroed_native(),
            x86: X86UserRegs::default(),
        }
    }

    pub fn arch(&self) -> SupportedArch {
        self.arch_
    }

    pub fn set_arch(&mut self, arch: SupportedArch) {
        self.arch_ = arch;
    }

    pub fn set_from_ptrace(&mut self, regs: &user_regs_struct) {
        self.arch_ = SupportedArch::X64;
        self.x64 = *regs;
    }

    pub fn get_ptrace(&self) -> user_regs_struct {
        debug_assert_eq!(self.arch_, SupportedArch::X64);
        self.x64
    }

    /// Serialized size of this register file in a trace frame.
    pub fn raw_size(&self) -> usize {
        user_regs_size(self.arch_)
    }

    /// The raw ptrace bytes for this arch, little-endian as stored.
    pub fn raw_bytes(&self) -> Vec<u8> {
        match self.arch_ {
            SupportedArch::X64 => {
                let p = &self.x64 as *const user_regs_struct as *const u8;
                unsafe { std::slice::from_raw_parts(p, size_of::<user_regs_struct>()) }.to_vec()
            }
            SupportedArch::X86 => {
                let p = &self.x86 as *const X86UserRegs as *const u8;
                unsafe { std::slice::from_raw_parts(p, size_of::<X86UserRegs>()) }.to_vec()
            }
        }
    }

    /// Restore from raw ptrace bytes of the given arch. Returns false on a
    /// size mismatch.
    pub fn set_from_raw_bytes(&mut self, arch: SupportedArch, bytes: &[u8]) -> bool {
        if bytes.len() != user_regs_size(arch) {
            return false;
        }
        self.arch_ = arch;
        match arch {
            SupportedArch::X64 => {
                let p = &mut self.x64 as *mut user_regs_struct as *mut u8;
                unsafe {
                    std::ptr::copy_nonoverlapping(bytes.as_ptr(), p, bytes.len());
                }
            }
            SupportedArch::X86 => {
                let p = &mut self.x86 as *mut X86UserRegs as *mut u8;
                unsafe {
                    std::ptr::copy_nonoverlapping(bytes.as_ptr(), p, bytes.len());
                }
            }
        }
        true
    }

    pub fn ip(&self) -> RemoteCodePtr {
        match self.arch_ {
            SupportedArch::X64 => RemoteCodePtr::from_val(self.x64.rip as usize),
            SupportedArch::X86 => RemoteCodePtr::from_val(self.x86.eip as usize),
        }
    }

    pub fn set_ip(&mut self, addr: RemoteCodePtr) {
        match self.arch_ {
            SupportedArch::X64 => self.x64.rip = addr.as_usize() as u64,
            SupportedArch::X86 => self.x86.eip = addr.as_usize() as u32,
        }
    }

    pub fn sp(&self) -> RemotePtr<Void> {
        match self.arch_ {
            SupportedArch::X64 => RemotePtr::new(self.x64.rsp as usize),
            SupportedArch::X86 => RemotePtr::new(self.x86.esp as usize),
        }
    }

    pub fn set_sp(&mut self, addr: RemotePtr<Void>) {
        match self.arch_ {
            SupportedArch::X64 => self.x64.rsp = addr.as_usize() as u64,
            SupportedArch::X86 => self.x86.esp = addr.as_usize() as u32,
        }
    }

    /// The syscall number at entry, before the kernel overwrites the result
    /// register.
    pub fn original_syscallno(&self) -> isize {
        match self.arch_ {
            SupportedArch::X64 => self.x64.orig_rax as i64 as isize,
            SupportedArch::X86 => self.x86.orig_eax as i32 as isize,
        }
    }

    pub fn set_original_syscallno(&mut self, syscallno: isize) {
        match self.arch_ {
            SupportedArch::X64 => self.x64.orig_rax = syscallno as u64,
            SupportedArch::X86 => self.x86.orig_eax = syscallno as u32,
        }
    }

    pub fn syscallno(&self) -> isize {
        match self.arch_ {
            SupportedArch::X64 => self.x64.rax as i64 as isize,
            SupportedArch::X86 => self.x86.eax as i32 as isize,
        }
    }

    pub fn set_syscallno(&mut self, syscallno: isize) {
        match self.arch_ {
            SupportedArch::X64 => self.x64.rax = syscallno as u64,
            SupportedArch::X86 => self.x86.eax = syscallno as u32,
        }
    }

    pub fn syscall_result(&self) -> usize {
        match self.arch_ {
            SupportedArch::X64 => self.x64.rax as usize,
            SupportedArch::X86 => self.x86.eax as usize,
        }
    }

    pub fn syscall_result_signed(&self) -> isize {
        self.syscall_result() as isize
    }

    pub fn set_syscall_result(&mut self, result: usize) {
        match self.arch_ {
            SupportedArch::X64 => self.x64.rax = result as u64,
            SupportedArch::X86 => self.x86.eax = result as u32,
        }
    }

    /// Mark a syscall as failed with the given errno.
    pub fn set_syscall_result_errno(&mut self, err: i32) {
        self.set_syscall_result(-err as isize as usize);
    }

    pub fn arg1(&self) -> usize {
        match self.arch_ {
            SupportedArch::X64 => self.x64.rdi as usize,
            SupportedArch::X86 => self.x86.ebx as usize,
        }
    }

    pub fn set_arg1(&mut self, value: usize) {
        match self.arch_ {
            SupportedArch::X64 => self.x64.rdi = value as u64,
            SupportedArch::X86 => self.x86.ebx = value as u32,
        }
    }

    pub fn arg2(&self) -> usize {
        match self.arch_ {
            SupportedArch::X64 => self.x64.rsi as usize,
            SupportedArch::X86 => self.x86.ecx as usize,
        }
    }

    pub fn set_arg2(&mut self, value: usize) {
        match self.arch_ {
            SupportedArch::X64 => self.x64.rsi = value as u64,
            SupportedArch::X86 => self.x86.ecx = value as u32,
        }
    }

    pub fn arg3(&self) -> usize {
        match self.arch_ {
            SupportedArch::X64 => self.x64.rdx as usize,
            SupportedArch::X86 => self.x86.edx as usize,
        }
    }

    pub fn set_arg3(&mut self, value: usize) {
        match self.arch_ {
            SupportedArch::X64 => self.x64.rdx = value as u64,
            SupportedArch::X86 => self.x86.edx = value as u32,
        }
    }

    pub fn arg4(&self) -> usize {
        match self.arch_ {
            SupportedArch::X64 => self.x64.r10 as usize,
            SupportedArch::X86 => self.x86.esi as usize,
        }
    }

    pub fn set_arg4(&mut self, value: usize) {
        match self.arch_ {
            SupportedArch::X64 => self.x64.r10 = value as u64,
            SupportedArch::X86 => self.x86.esi = value as u32,
        }
    }

    pub fn arg5(&self) -> usize {
        match self.arch_ {
            SupportedArch::X64 => self.x64.r8 as usize,
            SupportedArch::X86 => self.x86.edi as usize,
        }
    }

    pub fn set_arg5(&mut self, value: usize) {
        match self.arch_ {
            SupportedArch::X64 => self.x64.r8 = value as u64,
            SupportedArch::X86 => self.x86.edi = value as u32,
        }
    }

    pub fn arg6(&self) -> usize {
        match self.arch_ {
            SupportedArch::X64 => self.x64.r9 as usize,
            SupportedArch::X86 => self.x86.ebp as usize,
        }
    }

    pub fn set_arg6(&mut self, value: usize) {
        match self.arch_ {
            SupportedArch::X64 => self.x64.r9 = value as u64,
            SupportedArch::X86 => self.x86.ebp = value as u32,
        }
    }

    pub fn cx(&self) -> usize {
        match self.arch_ {
            SupportedArch::X64 => self.x64.rcx as usize,
            SupportedArch::X86 => self.x86.ecx as usize,
        }
    }

    pub fn set_cx(&mut self, value: usize) {
        match self.arch_ {
            SupportedArch::X64 => self.x64.rcx = value as u64,
            SupportedArch::X86 => self.x86.ecx = value as u32,
        }
    }

    pub fn cs(&self) -> usize {
        match self.arch_ {
            SupportedArch::X64 => self.x64.cs as usize,
            SupportedArch::X86 => self.x86.xcs as usize,
        }
    }

    pub fn flags(&self) -> usize {
        match self.arch_ {
            SupportedArch::X64 => self.x64.eflags as usize,
            SupportedArch::X86 => self.x86.eflags as usize,
        }
    }

    pub fn set_flags(&mut self, value: usize) {
        match self.arch_ {
            SupportedArch::X64 => self.x64.eflags = value as u64,
            SupportedArch::X86 => self.x86.eflags = value as u32,
        }
    }

    pub fn singlestep_flag(&self) -> bool {
        self.flags() & X86_TF_FLAG != 0
    }

    pub fn clear_singlestep_flag(&mut self) {
        let f = self.flags();
        self.set_flags(f & !X86_TF_FLAG);
    }

    /// Compare two register files; returns true when they match. Mismatches
    /// are logged when `log_mismatches` so replay divergence reports name
    /// the registers involved.
    pub fn matches(&self, other: &Registers, log_mismatches: bool) -> bool {
        let mut ok = true;
        let pairs: [(&str, usize, usize); 9] = [
            ("ip", self.ip().as_usize(), other.ip().as_usize()),
            ("sp", self.sp().as_usize(), other.sp().as_usize()),
            ("arg1", self.arg1(), other.arg1()),
            ("arg2", self.arg2(), other.arg2()),
            ("arg3", self.arg3(), other.arg3()),
            ("arg4", self.arg4(), other.arg4()),
            ("arg5", self.arg5(), other.arg5()),
            ("arg6", self.arg6(), other.arg6()),
            (
                "orig_syscallno",
                self.original_syscallno() as usize,
                other.original_syscallno() as usize,
            ),
        ];
        for &(name, a, b) in pairs.iter() {
            if a != b {
                ok = false;
                if log_mismatches {
                    log!(
                        crate::log::LogError,
                        "{} {:#x} != {:#x} (recorded)",
                        name,
                        a,
                        b
                    );
                }
            }
        }
        ok
    }

    pub fn write_register_file_compact(&self, out: &mut dyn Write) -> io::Result<()> {
        write!(
            out,
            "ip:{} sp:{} args:({:#x},{:#x},{:#x},{:#x},{:#x},{:#x}) orig_sys:{} res:{:#x}",
            self.ip(),
            self.sp(),
            self.arg1(),
            self.arg2(),
            self.arg3(),
            self.arg4(),
            self.arg5(),
            self.arg6(),
            self.original_syscallno(),
            self.syscall_result()
        )
    }
}

impl fmt::Display for Registers {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ ip:{} sp:{} orig_sys:{} }}",
            self.ip(),
            self.sp(),
            self.original_syscallno()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_bytes_roundtrip_x64() {
        let mut r = Registers::new(SupportedArch::X64);
        r.set_ip(RemoteCodePtr::from_val(0xdeadbeef));
        r.set_sp(RemotePtr::new(0x7fff0000));
        r.set_arg1(1);
        r.set_arg2(0x1000);
        r.set_original_syscallno(1);

        let bytes = r.raw_bytes();
        assert_eq!(bytes.len(), size_of::<user_regs_struct>());

        let mut r2 = Registers::new(SupportedArch::X64);
        assert!(r2.set_from_raw_bytes(SupportedArch::X64, &bytes));
        assert!(r.matches(&r2, false));
        assert_eq!(r2.ip().as_usize(), 0xdeadbeef);
    }

    #[test]
    fn raw_bytes_size_mismatch_rejected() {
        let mut r = Registers::new(SupportedArch::X64);
        assert!(!r.set_from_raw_bytes(SupportedArch::X64, &[0u8; 3]));
        // An x86 block is acceptable for the x86 arch tag.
        assert!(r.set_from_raw_bytes(SupportedArch::X86, &[0u8; 68]));
        assert_eq!(r.arch(), SupportedArch::X86);
    }

    #[test]
    fn singlestep_flag() {
        let mut r = Registers::new(SupportedArch::X64);
        r.set_flags(X86_TF_FLAG | 0x2);
        assert!(r.singlestep_flag());
        r.clear_singlestep_flag();
        assert!(!r.singlestep_flag());
        assert_eq!(r.flags(), 0x2);
    }

    #[test]
    fn syscall_result_errno() {
        let mut r = Registers::new(SupportedArch::X64);
        r.set_syscall_result_errno(libc::ENOSYS);
        assert_eq!(r.syscall_result_signed(), -(libc::ENOSYS as isize));
    }
}
