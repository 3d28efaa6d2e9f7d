use crate::{
    kernel_abi::{syscall_instruction_length, BREAKPOINT_INSN_LENGTH, SupportedArch},
    remote_ptr::RemotePtr,
};
use std::{
    fmt::{self, Display, Formatter},
    ops::{Add, Sub},
};

/// An address in a tracee's address space known to point at code. Kept
/// distinct from RemotePtr so instruction-length arithmetic has a home.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RemoteCodePtr {
    ptr: usize,
}

impl RemoteCodePtr {
    pub fn null() -> RemoteCodePtr {
        RemoteCodePtr { ptr: 0 }
    }

    pub fn from_val(val: usize) -> RemoteCodePtr {
        RemoteCodePtr { ptr: val }
    }

    pub fn as_usize(self) -> usize {
        self.ptr
    }

    pub fn is_null(self) -> bool {
        self.ptr == 0
    }

    pub fn decrement_by_syscall_insn_length(self, arch: SupportedArch) -> RemoteCodePtr {
        self - syscall_instruction_length(arch)
    }

    pub fn increment_by_syscall_insn_length(self, arch: SupportedArch) -> RemoteCodePtr {
        self + syscall_instruction_length(arch)
    }

    pub fn decrement_by_bkpt_insn_length(self, _arch: SupportedArch) -> RemoteCodePtr {
        self - BREAKPOINT_INSN_LENGTH
    }

    pub fn increment_by_bkpt_insn_length(self, _arch: SupportedArch) -> RemoteCodePtr {
        self + BREAKPOINT_INSN_LENGTH
    }

    pub fn to_data_ptr<T>(self) -> RemotePtr<T> {
        RemotePtr::new(self.ptr)
    }

    /// The value as stored in the instruction-pointer register.
    pub fn register_value(self) -> usize {
        self.ptr
    }
}

impl Display for RemoteCodePtr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.ptr)
    }
}

impl Add<usize> for RemoteCodePtr {
    type Output = Self;

    fn add(self, delta: usize) -> Self::Output {
        Self::from_val(self.ptr + delta)
    }
}

impl Sub<usize> for RemoteCodePtr {
    type Output = Self;

    fn sub(self, delta: usize) -> Self::Output {
        Self::from_val(self.ptr - delta)
    }
}

impl From<usize> for RemoteCodePtr {
    fn from(addr: usize) -> Self {
        Self::from_val(addr)
    }
}

impl<T> From<RemotePtr<T>> for RemoteCodePtr {
    fn from(p: RemotePtr<T>) -> Self {
        Self::from_val(p.as_usize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syscall_length_roundtrip() {
        let p = RemoteCodePtr::from_val(0x1000);
        let q = p.increment_by_syscall_insn_length(SupportedArch::X64);
        assert_eq!(p, q.decrement_by_syscall_insn_length(SupportedArch::X64));
        assert_eq!(0x1002, q.as_usize());
    }

    #[test]
    fn bkpt_length() {
        let p = RemoteCodePtr::from_val(0x1000);
        assert_eq!(
            0x1001,
            p.increment_by_bkpt_insn_length(SupportedArch::X64).as_usize()
        );
    }
}
