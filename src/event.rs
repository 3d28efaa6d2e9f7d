use crate::{
    kernel_abi::SupportedArch,
    kernel_metadata::{signal_name, syscall_name},
    sig::Sig,
};
use std::fmt::{self, Display, Formatter};

/// During recording, sometimes an iteration of the record loop must schedule
/// the same task as the previous iteration; entering a potentially blocking
/// syscall must allow a switch or we risk deadlock.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Switchable {
    PreventSwitch,
    AllowSwitch,
}

/// Distinguishes syscall-entry frames from syscall-exit frames in the trace.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SyscallState {
    EnteringSyscall,
    ExitingSyscall,
}

impl SyscallState {
    pub fn as_u8(self) -> u8 {
        match self {
            SyscallState::EnteringSyscall => 0,
            SyscallState::ExitingSyscall => 1,
        }
    }

    pub fn from_u8(b: u8) -> Option<SyscallState> {
        match b {
            0 => Some(SyscallState::EnteringSyscall),
            1 => Some(SyscallState::ExitingSyscall),
            _ => None,
        }
    }
}

/// Whether a signal was delivered at a deterministic execution point (a trap
/// the program itself raised) or asynchronously.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SignalDeterministic {
    NondeterministicSig,
    DeterministicSig,
}

#[derive(Copy, Clone, Debug)]
pub struct SignalEventData {
    pub sig: Sig,
    pub deterministic: SignalDeterministic,
}

#[derive(Copy, Clone, Debug)]
pub struct SyscallEventData {
    pub arch: SupportedArch,
    pub number: i32,
    pub state: SyscallState,
}

/// Events track Task state during recording and, stored in trace frames,
/// guide replay.
#[derive(Copy, Clone, Debug)]
pub enum Event {
    /// Placeholder for "no event".
    Sentinel,
    /// Task exit; the last frame recorded for a task.
    Exit,
    /// The time-slice signal interrupted the tracee; replay preempts at the
    /// recorded tick count.
    Sched,
    /// A trapped instruction (RDTSC etc.) was emulated.
    InstructionTrap,
    /// A syscall instruction was patched; resume at the patch.
    PatchSyscall,
    /// Signal received.
    Signal(SignalEventData),
    /// Signal delivered to the task (handler about to run or default action).
    SignalDelivery(SignalEventData),
    /// Signal handler frame set up.
    SignalHandler(SignalEventData),
    Syscall(SyscallEventData),
    /// Synthesized when the reader reaches the end of the trace.
    TraceTermination,
}

const EV_SENTINEL: u8 = 0;
const EV_EXIT: u8 = 1;
const EV_SCHED: u8 = 2;
const EV_INSTRUCTION_TRAP: u8 = 3;
const EV_PATCH_SYSCALL: u8 = 4;
const EV_SIGNAL: u8 = 5;
const EV_SIGNAL_DELIVERY: u8 = 6;
const EV_SIGNAL_HANDLER: u8 = 7;
const EV_SYSCALL: u8 = 8;
const EV_TRACE_TERMINATION: u8 = 9;

/// The fixed-size trace encoding of an Event: (type, state, has_exec_info,
/// arch) plus a 32-bit payload (syscall number, signal number with the
/// deterministic bit, or zero). Written little-endian, tightly packed.
#[repr(C)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Debug)]
pub struct EncodedEvent {
    pub event_type: u8,
    pub state: u8,
    pub has_exec_info: u8,
    pub arch: u8,
    pub data: i32,
}

pub const ENCODED_EVENT_SIZE: usize = 8;

impl EncodedEvent {
    pub fn to_bytes(self) -> [u8; ENCODED_EVENT_SIZE] {
        let mut buf = [0u8; ENCODED_EVENT_SIZE];
        buf[0] = self.event_type;
        buf[1] = self.state;
        buf[2] = self.has_exec_info;
        buf[3] = self.arch;
        buf[4..8].copy_from_slice(&self.data.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; ENCODED_EVENT_SIZE]) -> EncodedEvent {
        EncodedEvent {
            event_type: buf[0],
            state: buf[1],
            has_exec_info: buf[2],
            arch: buf[3],
            data: i32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        }
    }
}

const DETERMINISTIC_SIG_BIT: i32 = 1 << 30;

impl Default for Event {
    fn default() -> Self {
        Event::Sentinel
    }
}

impl Event {
    pub fn new_syscall(arch: SupportedArch, number: i32, state: SyscallState) -> Event {
        Event::Syscall(SyscallEventData {
            arch,
            number,
            state,
        })
    }

    pub fn new_signal(sig: Sig, deterministic: SignalDeterministic) -> Event {
        Event::Signal(SignalEventData { sig, deterministic })
    }

    pub fn is_syscall_event(&self) -> bool {
        matches!(self, Event::Syscall(_))
    }

    pub fn is_signal_event(&self) -> bool {
        matches!(
            self,
            Event::Signal(_) | Event::SignalDelivery(_) | Event::SignalHandler(_)
        )
    }

    pub fn syscall(&self) -> &SyscallEventData {
        match self {
            Event::Syscall(s) => s,
            _ => panic!("not a syscall event"),
        }
    }

    pub fn signal(&self) -> &SignalEventData {
        match self {
            Event::Signal(s) | Event::SignalDelivery(s) | Event::SignalHandler(s) => s,
            _ => panic!("not a signal event"),
        }
    }

    /// Events with execution info carry the register file (and ticks) in
    /// their trace frame.
    pub fn has_exec_info(&self) -> bool {
        !matches!(self, Event::Sentinel | Event::TraceTermination)
    }

    pub fn encode(&self) -> EncodedEvent {
        let (event_type, state, arch, data) = match *self {
            Event::Sentinel => (EV_SENTINEL, 0, 0, 0),
            Event::Exit => (EV_EXIT, 0, 0, 0),
            Event::Sched => (EV_SCHED, 0, 0, 0),
            Event::InstructionTrap => (EV_INSTRUCTION_TRAP, 0, 0, 0),
            Event::PatchSyscall => (EV_PATCH_SYSCALL, 0, 0, 0),
            Event::Signal(s) => (EV_SIGNAL, 0, 0, encode_signal(&s)),
            Event::SignalDelivery(s) => (EV_SIGNAL_DELIVERY, 0, 0, encode_signal(&s)),
            Event::SignalHandler(s) => (EV_SIGNAL_HANDLER, 0, 0, encode_signal(&s)),
            Event::Syscall(s) => (EV_SYSCALL, s.state.as_u8(), s.arch.as_u8(), s.number),
            Event::TraceTermination => (EV_TRACE_TERMINATION, 0, 0, 0),
        };
        EncodedEvent {
            event_type,
            state,
            has_exec_info: self.has_exec_info() as u8,
            arch,
            data,
        }
    }

    /// Decode an event from its trace encoding; None means the trace is
    /// corrupt.
    pub fn decode(e: EncodedEvent) -> Option<Event> {
        match e.event_type {
            EV_SENTINEL => Some(Event::Sentinel),
            EV_EXIT => Some(Event::Exit),
            EV_SCHED => Some(Event::Sched),
            EV_INSTRUCTION_TRAP => Some(Event::InstructionTrap),
            EV_PATCH_SYSCALL => Some(Event::PatchSyscall),
            EV_SIGNAL => Some(Event::Signal(decode_signal(e.data)?)),
            EV_SIGNAL_DELIVERY => Some(Event::SignalDelivery(decode_signal(e.data)?)),
            EV_SIGNAL_HANDLER => Some(Event::SignalHandler(decode_signal(e.data)?)),
            EV_SYSCALL => Some(Event::Syscall(SyscallEventData {
                arch: SupportedArch::from_u8(e.arch)?,
                number: e.data,
                state: SyscallState::from_u8(e.state)?,
            })),
            EV_TRACE_TERMINATION => Some(Event::TraceTermination),
            _ => None,
        }
    }
}

fn encode_signal(s: &SignalEventData) -> i32 {
    let mut data = s.sig.as_raw();
    if s.deterministic == SignalDeterministic::DeterministicSig {
        data |= DETERMINISTIC_SIG_BIT;
    }
    data
}

fn decode_signal(data: i32) -> Option<SignalEventData> {
    use std::convert::TryFrom;
    let deterministic = if data & DETERMINISTIC_SIG_BIT != 0 {
        SignalDeterministic::DeterministicSig
    } else {
        SignalDeterministic::NondeterministicSig
    };
    let sig = Sig::try_from(data & !DETERMINISTIC_SIG_BIT).ok()?;
    Some(SignalEventData { sig, deterministic })
}

impl Display for Event {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Event::Sentinel => write!(f, "(none)"),
            Event::Exit => write!(f, "EXIT"),
            Event::Sched => write!(f, "SCHED"),
            Event::InstructionTrap => write!(f, "INSTRUCTION_TRAP"),
            Event::PatchSyscall => write!(f, "PATCH_SYSCALL"),
            Event::Signal(s) => write!(f, "SIGNAL: {}", signal_name(s.sig.as_raw())),
            Event::SignalDelivery(s) => {
                write!(f, "SIGNAL_DELIVERY: {}", signal_name(s.sig.as_raw()))
            }
            Event::SignalHandler(s) => {
                write!(f, "SIGNAL_HANDLER: {}", signal_name(s.sig.as_raw()))
            }
            Event::Syscall(s) => write!(f, "SYSCALL: {}", syscall_name(s.number)),
            Event::TraceTermination => write!(f, "TRACE_TERMINATION"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sig;

    #[test]
    fn syscall_encode_roundtrip() {
        let ev = Event::new_syscall(
            SupportedArch::X64,
            crate::kernel_abi::x64::WRITE,
            SyscallState::EnteringSyscall,
        );
        let enc = ev.encode();
        assert_eq!(enc.has_exec_info, 1);
        let bytes = enc.to_bytes();
        let dec = Event::decode(EncodedEvent::from_bytes(&bytes)).unwrap();
        let s = dec.syscall();
        assert_eq!(s.number, crate::kernel_abi::x64::WRITE);
        assert_eq!(s.state, SyscallState::EnteringSyscall);
        assert_eq!(s.arch, SupportedArch::X64);
    }

    #[test]
    fn signal_encode_roundtrip() {
        let ev = Event::new_signal(sig::SIGALRM, SignalDeterministic::NondeterministicSig);
        let dec = Event::decode(ev.encode()).unwrap();
        assert_eq!(dec.signal().sig, sig::SIGALRM);
        assert_eq!(
            dec.signal().deterministic,
            SignalDeterministic::NondeterministicSig
        );

        let ev = Event::new_signal(sig::SIGSEGV, SignalDeterministic::DeterministicSig);
        let dec = Event::decode(ev.encode()).unwrap();
        assert_eq!(dec.signal().sig, sig::SIGSEGV);
        assert_eq!(
            dec.signal().deterministic,
            SignalDeterministic::DeterministicSig
        );
    }

    #[test]
    fn corrupt_event_rejected() {
        let enc = EncodedEvent {
            event_type: 0xff,
            ..Default::default()
        };
        assert!(Event::decode(enc).is_none());

        let enc = EncodedEvent {
            event_type: super::EV_SYSCALL,
            state: 9,
            ..Default::default()
        };
        assert!(Event::decode(enc).is_none());
    }

    #[test]
    fn exec_info_flags() {
        assert!(!Event::Sentinel.has_exec_info());
        assert!(!Event::TraceTermination.has_exec_info());
        assert!(Event::Sched.has_exec_info());
        assert!(Event::Exit.has_exec_info());
    }
}
