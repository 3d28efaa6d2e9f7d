use std::fmt;

/// Architectures a trace can carry. Execution support targets the native
/// one; X86 frames remain readable so a 64-bit reader can process 32-bit
/// traces.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SupportedArch {
    X86,
    X64,
}

#[cfg(target_arch = "x86_64")]
pub const NATIVE_ARCH: SupportedArch = SupportedArch::X64;

#[cfg(target_arch = "x86")]
pub const NATIVE_ARCH: SupportedArch = SupportedArch::X86;

impl fmt::Display for SupportedArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupportedArch::X86 => write!(f, "x86"),
            SupportedArch::X64 => write!(f, "x86_64"),
        }
    }
}

impl SupportedArch {
    pub fn from_u8(b: u8) -> Option<SupportedArch> {
        match b {
            0 => Some(SupportedArch::X86),
            1 => Some(SupportedArch::X64),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            SupportedArch::X86 => 0,
            SupportedArch::X64 => 1,
        }
    }
}

/// `int 0x80` on x86, `syscall` on x86-64; both are two bytes, which the
/// exit-handshake IP backup relies on.
pub fn syscall_instruction(arch: SupportedArch) -> &'static [u8] {
    match arch {
        SupportedArch::X86 => &[0xcd, 0x80],
        SupportedArch::X64 => &[0x0f, 0x05],
    }
}

pub fn syscall_instruction_length(arch: SupportedArch) -> usize {
    syscall_instruction(arch).len()
}

/// The x86 trap instruction written over breakpointed bytes.
pub const BREAKPOINT_INSN: u8 = 0xcc;
pub const BREAKPOINT_INSN_LENGTH: usize = 1;

/// The syscall numbers the core dispatches on, for the native (x86-64) ABI.
pub mod x64 {
    pub const READ: i32 = 0;
    pub const WRITE: i32 = 1;
    pub const CLOSE: i32 = 3;
    pub const MMAP: i32 = 9;
    pub const MPROTECT: i32 = 10;
    pub const MUNMAP: i32 = 11;
    pub const BRK: i32 = 12;
    pub const RT_SIGACTION: i32 = 13;
    pub const RT_SIGPROCMASK: i32 = 14;
    pub const MREMAP: i32 = 25;
    pub const MADVISE: i32 = 28;
    pub const SOCKET: i32 = 41;
    pub const CONNECT: i32 = 42;
    pub const SENDMSG: i32 = 46;
    pub const CLONE: i32 = 56;
    pub const FORK: i32 = 57;
    pub const VFORK: i32 = 58;
    pub const EXECVE: i32 = 59;
    pub const EXIT: i32 = 60;
    pub const GETTID: i32 = 186;
    pub const TIME: i32 = 201;
    pub const EXIT_GROUP: i32 = 231;
    pub const CLOCK_GETTIME: i32 = 228;
    pub const CLOCK_GETRES: i32 = 229;
    pub const OPENAT: i32 = 257;
    pub const GETTIMEOFDAY: i32 = 96;
    pub const GETCPU: i32 = 309;
}

pub mod x86 {
    pub const EXIT: i32 = 1;
    pub const READ: i32 = 3;
    pub const WRITE: i32 = 4;
    pub const CLOSE: i32 = 6;
    pub const EXECVE: i32 = 11;
    pub const BRK: i32 = 45;
    pub const MMAP2: i32 = 192;
    pub const MUNMAP: i32 = 91;
    pub const CLONE: i32 = 120;
    pub const MPROTECT: i32 = 125;
    pub const MREMAP: i32 = 163;
    pub const EXIT_GROUP: i32 = 252;
    pub const GETTID: i32 = 224;
}

pub fn syscall_number_for_write(arch: SupportedArch) -> i32 {
    match arch {
        SupportedArch::X86 => x86::WRITE,
        SupportedArch::X64 => x64::WRITE,
    }
}

pub fn syscall_number_for_close(arch: SupportedArch) -> i32 {
    match arch {
        SupportedArch::X86 => x86::CLOSE,
        SupportedArch::X64 => x64::CLOSE,
    }
}

pub fn syscall_number_for_mmap(arch: SupportedArch) -> i32 {
    match arch {
        SupportedArch::X86 => x86::MMAP2,
        SupportedArch::X64 => x64::MMAP,
    }
}

pub fn syscall_number_for_munmap(arch: SupportedArch) -> i32 {
    match arch {
        SupportedArch::X86 => x86::MUNMAP,
        SupportedArch::X64 => x64::MUNMAP,
    }
}

pub fn syscall_number_for_mprotect(arch: SupportedArch) -> i32 {
    match arch {
        SupportedArch::X86 => x86::MPROTECT,
        SupportedArch::X64 => x64::MPROTECT,
    }
}

pub fn syscall_number_for_brk(arch: SupportedArch) -> i32 {
    match arch {
        SupportedArch::X86 => x86::BRK,
        SupportedArch::X64 => x64::BRK,
    }
}

pub fn syscall_number_for_gettid(arch: SupportedArch) -> i32 {
    match arch {
        SupportedArch::X86 => x86::GETTID,
        SupportedArch::X64 => x64::GETTID,
    }
}

pub fn syscall_number_for_exit(arch: SupportedArch) -> i32 {
    match arch {
        SupportedArch::X86 => x86::EXIT,
        SupportedArch::X64 => x64::EXIT,
    }
}

pub fn syscall_number_for_openat(arch: SupportedArch) -> i32 {
    match arch {
        SupportedArch::X86 => 295,
        SupportedArch::X64 => x64::OPENAT,
    }
}

pub fn is_execve_syscall(syscallno: i32, arch: SupportedArch) -> bool {
    match arch {
        SupportedArch::X86 => syscallno == x86::EXECVE,
        SupportedArch::X64 => syscallno == x64::EXECVE,
    }
}

pub fn is_exit_syscall(syscallno: i32, arch: SupportedArch) -> bool {
    match arch {
        SupportedArch::X86 => syscallno == x86::EXIT,
        SupportedArch::X64 => syscallno == x64::EXIT,
    }
}

pub fn is_exit_group_syscall(syscallno: i32, arch: SupportedArch) -> bool {
    match arch {
        SupportedArch::X86 => syscallno == x86::EXIT_GROUP,
        SupportedArch::X64 => syscallno == x64::EXIT_GROUP,
    }
}

pub fn is_mmap_syscall(syscallno: i32, arch: SupportedArch) -> bool {
    syscallno == syscall_number_for_mmap(arch)
}

pub fn is_clone_like_syscall(syscallno: i32, arch: SupportedArch) -> bool {
    match arch {
        SupportedArch::X86 => syscallno == x86::CLONE,
        SupportedArch::X64 => {
            syscallno == x64::CLONE || syscallno == x64::FORK || syscallno == x64::VFORK
        }
    }
}

/// The user_regs_struct layout for 32-bit tracees, needed to size register
/// blocks when reading x86 trace frames on a 64-bit reader.
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct X86UserRegs {
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub eax: u32,
    pub xds: u32,
    pub xes: u32,
    pub xfs: u32,
    pub xgs: u32,
    pub orig_eax: u32,
    pub eip: u32,
    pub xcs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub xss: u32,
}

pub fn user_regs_size(arch: SupportedArch) -> usize {
    match arch {
        SupportedArch::X86 => std::mem::size_of::<X86UserRegs>(),
        SupportedArch::X64 => std::mem::size_of::<libc::user_regs_struct>(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::const_assert_eq;

    const_assert_eq!(std::mem::size_of::<X86UserRegs>(), 68);

    #[test]
    fn syscall_insn_lengths_match() {
        // The exit handshake backs the IP up by one syscall instruction;
        // both ABIs must agree on its length.
        assert_eq!(
            syscall_instruction_length(SupportedArch::X86),
            syscall_instruction_length(SupportedArch::X64)
        );
    }

    #[test]
    fn arch_byte_roundtrip() {
        for &arch in &[SupportedArch::X86, SupportedArch::X64] {
            assert_eq!(SupportedArch::from_u8(arch.as_u8()), Some(arch));
        }
        assert_eq!(SupportedArch::from_u8(7), None);
    }
}
