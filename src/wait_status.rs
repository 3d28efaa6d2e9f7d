use crate::{
    kernel_metadata::{ptrace_event_name, signal_name},
    kernel_supplement::PTRACE_EVENT_STOP,
    sig::{self, Sig},
};
use libc::{SIGSTOP, SIGTRAP, WEXITSTATUS, WIFEXITED, WIFSIGNALED, WIFSTOPPED, WSTOPSIG, WTERMSIG};
use std::{
    convert::TryFrom,
    fmt::{self, Display, Formatter},
};

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum WaitType {
    /// Task exited normally.
    Exit,
    /// Task exited due to fatal signal.
    FatalSignal,
    /// Task is in a signal-delivery-stop.
    SignalStop,
    /// Task is in a group-stop. PTRACE_SEIZE is required for these to be
    /// reported as PTRACE_EVENT_STOP; otherwise they decode as SignalStop.
    GroupStop,
    /// Task is in a syscall-stop under PTRACE_SYSCALL with TRACESYSGOOD.
    SyscallStop,
    /// Task is in a PTRACE_EVENT stop other than PTRACE_EVENT_STOP.
    PtraceEvent,
}

/// A raw waitpid() status word and its decodings.
#[derive(Copy, Clone, Eq, PartialEq, Default)]
pub struct WaitStatus {
    status: i32,
}

impl WaitStatus {
    pub fn new(status: i32) -> WaitStatus {
        WaitStatus { status }
    }

    pub fn wait_type(&self) -> WaitType {
        if self.exit_code().is_some() {
            return WaitType::Exit;
        }
        if self.fatal_sig().is_some() {
            return WaitType::FatalSignal;
        }
        if self.stop_sig().is_some() {
            return WaitType::SignalStop;
        }
        if self.group_stop_sig().is_some() {
            return WaitType::GroupStop;
        }
        if self.is_syscall() {
            return WaitType::SyscallStop;
        }
        if self.ptrace_event().is_some() {
            return WaitType::PtraceEvent;
        }

        fatal!("Status {:#x} not understood", self.status);
    }

    /// Exit code when wait_type() == Exit, otherwise None.
    pub fn exit_code(&self) -> Option<i32> {
        if WIFEXITED(self.status) {
            Some(WEXITSTATUS(self.status))
        } else {
            None
        }
    }

    /// Fatal signal when wait_type() == FatalSignal, otherwise None.
    pub fn fatal_sig(&self) -> Option<Sig> {
        if WIFSIGNALED(self.status) {
            Sig::try_from(WTERMSIG(self.status)).ok()
        } else {
            None
        }
    }

    /// Stop signal when wait_type() == SignalStop, otherwise None. A zero
    /// signal (rare but observed via PTRACE_INTERRUPT) converts to SIGSTOP.
    pub fn stop_sig(&self) -> Option<Sig> {
        // A nonzero event byte in bits 16..24 makes this a ptrace-event or
        // group stop, not a plain signal stop.
        if !WIFSTOPPED(self.status) || ((self.status >> 16) & 0xff) != 0 {
            return None;
        }

        let mut sig = WSTOPSIG(self.status);
        if sig == (SIGTRAP | 0x80) {
            // Syscall-stop under PTRACE_O_TRACESYSGOOD.
            return None;
        }

        sig &= !0x80;
        if sig == 0 {
            sig = SIGSTOP;
        }
        Sig::try_from(sig).ok()
    }

    /// Group-stop signal when wait_type() == GroupStop, otherwise None.
    pub fn group_stop_sig(&self) -> Option<Sig> {
        if !WIFSTOPPED(self.status)
            || ((self.status >> 16) & 0xff) != PTRACE_EVENT_STOP as i32
        {
            return None;
        }

        let mut sig = WSTOPSIG(self.status) & !0x80;
        if sig == 0 {
            sig = SIGSTOP;
        }
        Sig::try_from(sig).ok()
    }

    pub fn is_syscall(&self) -> bool {
        if self.ptrace_event().is_some() || !WIFSTOPPED(self.status) {
            return false;
        }
        WSTOPSIG(self.status) == (SIGTRAP | 0x80)
    }

    /// ptrace event code when wait_type() == PtraceEvent, None otherwise.
    pub fn ptrace_event(&self) -> Option<u32> {
        let event = ((self.status >> 16) & 0xff) as u32;
        if event == PTRACE_EVENT_STOP || event == 0 {
            None
        } else {
            Some(event)
        }
    }

    pub fn is_ptrace_event(&self, event: i32) -> bool {
        self.ptrace_event() == Some(event as u32)
    }

    /// For stops of any kind, the signal involved; None for exits.
    pub fn ptrace_signal(&self) -> Option<Sig> {
        if WIFSTOPPED(self.status) {
            Sig::try_from(WSTOPSIG(self.status) & 0x7f).ok()
        } else {
            None
        }
    }

    pub fn for_exit_code(code: i32) -> WaitStatus {
        debug_assert!(code >= 0 && code < 0x100);
        WaitStatus { status: code << 8 }
    }

    pub fn for_fatal_sig(sig: Sig) -> WaitStatus {
        WaitStatus {
            status: sig.as_raw(),
        }
    }

    pub fn for_stop_sig(sig: Sig) -> WaitStatus {
        WaitStatus {
            status: (sig.as_raw() << 8) | 0x7f,
        }
    }

    pub fn for_group_stop(sig: Sig) -> WaitStatus {
        WaitStatus {
            status: ((PTRACE_EVENT_STOP as i32) << 16) | (sig.as_raw() << 8) | 0x7f,
        }
    }

    pub fn for_syscall() -> WaitStatus {
        WaitStatus {
            status: (((SIGTRAP | 0x80) as i32) << 8) | 0x7f,
        }
    }

    pub fn for_ptrace_event(ptrace_event: i32) -> WaitStatus {
        debug_assert!(ptrace_event >= 1 && ptrace_event < 0x100);
        WaitStatus {
            status: (ptrace_event << 16) | (SIGTRAP << 8) | 0x7f,
        }
    }

    pub fn get(&self) -> i32 {
        self.status
    }
}

impl Display for WaitStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.status)?;
        match self.wait_type() {
            WaitType::Exit => write!(f, " (EXIT-{})", self.exit_code().unwrap()),
            WaitType::FatalSignal => write!(f, " (FATAL-{})", self.fatal_sig().unwrap()),
            WaitType::SignalStop => write!(f, " (STOP-{})", self.stop_sig().unwrap()),
            WaitType::GroupStop => {
                write!(f, " (GROUP-STOP-{})", self.group_stop_sig().unwrap())
            }
            WaitType::SyscallStop => write!(f, " (SYSCALL)"),
            WaitType::PtraceEvent => {
                write!(f, " ({})", ptrace_event_name(self.ptrace_event().unwrap()))
            }
        }
    }
}

impl fmt::Debug for WaitStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// True when a group stop may be the ack of our own PTRACE_INTERRUPT. We
/// sometimes see SIGSTOP at interrupts, though the docs don't mention it.
pub fn is_signal_triggered_by_ptrace_interrupt(group_stop_sig: Option<Sig>) -> bool {
    matches!(group_stop_sig, Some(s) if s == sig::SIGTRAP || s == sig::SIGSTOP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_roundtrip() {
        let ws = WaitStatus::for_exit_code(3);
        assert_eq!(ws.wait_type(), WaitType::Exit);
        assert_eq!(ws.exit_code(), Some(3));
        assert_eq!(ws.stop_sig(), None);
    }

    #[test]
    fn fatal_sig_roundtrip() {
        let ws = WaitStatus::for_fatal_sig(sig::SIGKILL);
        assert_eq!(ws.wait_type(), WaitType::FatalSignal);
        assert_eq!(ws.fatal_sig(), Some(sig::SIGKILL));
    }

    #[test]
    fn stop_sig_roundtrip() {
        let ws = WaitStatus::for_stop_sig(sig::SIGUSR1);
        assert_eq!(ws.wait_type(), WaitType::SignalStop);
        assert_eq!(ws.stop_sig(), Some(sig::SIGUSR1));
        assert_eq!(ws.ptrace_event(), None);
    }

    #[test]
    fn group_stop_roundtrip() {
        let ws = WaitStatus::for_group_stop(sig::SIGSTOP);
        assert_eq!(ws.wait_type(), WaitType::GroupStop);
        assert_eq!(ws.group_stop_sig(), Some(sig::SIGSTOP));
        // A PTRACE_EVENT_STOP code is a group stop, not a ptrace event.
        assert_eq!(ws.ptrace_event(), None);
    }

    #[test]
    fn syscall_stop() {
        let ws = WaitStatus::for_syscall();
        assert_eq!(ws.wait_type(), WaitType::SyscallStop);
        assert!(ws.is_syscall());
        assert_eq!(ws.stop_sig(), None);
    }

    #[test]
    fn ptrace_event_roundtrip() {
        let ws = WaitStatus::for_ptrace_event(libc::PTRACE_EVENT_EXEC);
        assert_eq!(ws.wait_type(), WaitType::PtraceEvent);
        assert_eq!(ws.ptrace_event(), Some(libc::PTRACE_EVENT_EXEC as u32));
        assert!(ws.is_ptrace_event(libc::PTRACE_EVENT_EXEC));
    }

    #[test]
    fn interrupt_ack_detection() {
        assert!(is_signal_triggered_by_ptrace_interrupt(Some(sig::SIGTRAP)));
        assert!(is_signal_triggered_by_ptrace_interrupt(Some(sig::SIGSTOP)));
        assert!(!is_signal_triggered_by_ptrace_interrupt(Some(sig::SIGUSR1)));
        assert!(!is_signal_triggered_by_ptrace_interrupt(None));
    }
}
