use libc::pid_t;

/// Name of a signal for diagnostics, `SIG...` or `signal(N)` for anything
/// outside the classic range.
pub fn signal_name(sig: i32) -> String {
    if 32 <= sig && sig <= 64 {
        return format!("SIGRT{}", sig);
    }

    match sig {
        libc::SIGHUP => "SIGHUP".into(),
        libc::SIGINT => "SIGINT".into(),
        libc::SIGQUIT => "SIGQUIT".into(),
        libc::SIGILL => "SIGILL".into(),
        libc::SIGTRAP => "SIGTRAP".into(),
        libc::SIGABRT => "SIGABRT".into(),
        libc::SIGBUS => "SIGBUS".into(),
        libc::SIGFPE => "SIGFPE".into(),
        libc::SIGKILL => "SIGKILL".into(),
        libc::SIGUSR1 => "SIGUSR1".into(),
        libc::SIGSEGV => "SIGSEGV".into(),
        libc::SIGUSR2 => "SIGUSR2".into(),
        libc::SIGPIPE => "SIGPIPE".into(),
        libc::SIGALRM => "SIGALRM".into(),
        libc::SIGTERM => "SIGTERM".into(),
        libc::SIGSTKFLT => "SIGSTKFLT".into(),
        libc::SIGCHLD => "SIGCHLD".into(),
        libc::SIGCONT => "SIGCONT".into(),
        libc::SIGSTOP => "SIGSTOP".into(),
        libc::SIGTSTP => "SIGTSTP".into(),
        libc::SIGTTIN => "SIGTTIN".into(),
        libc::SIGTTOU => "SIGTTOU".into(),
        libc::SIGURG => "SIGURG".into(),
        libc::SIGXCPU => "SIGXCPU".into(),
        libc::SIGXFSZ => "SIGXFSZ".into(),
        libc::SIGVTALRM => "SIGVTALRM".into(),
        libc::SIGPROF => "SIGPROF".into(),
        libc::SIGWINCH => "SIGWINCH".into(),
        libc::SIGIO => "SIGIO".into(),
        libc::SIGPWR => "SIGPWR".into(),
        libc::SIGSYS => "SIGSYS".into(),
        _ => format!("signal({})", sig),
    }
}

/// Names for the syscalls the core dispatches on.
pub fn syscall_name(syscallno: i32) -> String {
    match syscallno as i64 {
        libc::SYS_read => "read".into(),
        libc::SYS_write => "write".into(),
        libc::SYS_open => "open".into(),
        libc::SYS_openat => "openat".into(),
        libc::SYS_close => "close".into(),
        libc::SYS_mmap => "mmap".into(),
        libc::SYS_mprotect => "mprotect".into(),
        libc::SYS_munmap => "munmap".into(),
        libc::SYS_mremap => "mremap".into(),
        libc::SYS_brk => "brk".into(),
        libc::SYS_madvise => "madvise".into(),
        libc::SYS_clone => "clone".into(),
        libc::SYS_fork => "fork".into(),
        libc::SYS_vfork => "vfork".into(),
        libc::SYS_execve => "execve".into(),
        libc::SYS_exit => "exit".into(),
        libc::SYS_exit_group => "exit_group".into(),
        libc::SYS_gettid => "gettid".into(),
        libc::SYS_rt_sigaction => "rt_sigaction".into(),
        libc::SYS_rt_sigprocmask => "rt_sigprocmask".into(),
        libc::SYS_rt_sigreturn => "rt_sigreturn".into(),
        libc::SYS_clock_gettime => "clock_gettime".into(),
        libc::SYS_clock_getres => "clock_getres".into(),
        libc::SYS_gettimeofday => "gettimeofday".into(),
        libc::SYS_time => "time".into(),
        libc::SYS_getcpu => "getcpu".into(),
        libc::SYS_socket => "socket".into(),
        libc::SYS_connect => "connect".into(),
        libc::SYS_sendmsg => "sendmsg".into(),
        libc::SYS_alarm => "alarm".into(),
        libc::SYS_getpid => "getpid".into(),
        _ => format!("syscall({})", syscallno),
    }
}

pub fn ptrace_event_name(event: u32) -> String {
    match event as i32 {
        libc::PTRACE_EVENT_FORK => "PTRACE_EVENT_FORK".into(),
        libc::PTRACE_EVENT_VFORK => "PTRACE_EVENT_VFORK".into(),
        libc::PTRACE_EVENT_CLONE => "PTRACE_EVENT_CLONE".into(),
        libc::PTRACE_EVENT_EXEC => "PTRACE_EVENT_EXEC".into(),
        libc::PTRACE_EVENT_VFORK_DONE => "PTRACE_EVENT_VFORK_DONE".into(),
        libc::PTRACE_EVENT_EXIT => "PTRACE_EVENT_EXIT".into(),
        libc::PTRACE_EVENT_SECCOMP => "PTRACE_EVENT_SECCOMP".into(),
        _ => format!("PTRACE_EVENT({})", event),
    }
}

pub fn ptrace_req_name(request: u32) -> String {
    use crate::kernel_supplement::{PTRACE_SYSEMU, PTRACE_SYSEMU_SINGLESTEP};
    match request {
        r if r == libc::PTRACE_CONT as u32 => "PTRACE_CONT".into(),
        r if r == libc::PTRACE_SINGLESTEP as u32 => "PTRACE_SINGLESTEP".into(),
        r if r == libc::PTRACE_SYSCALL as u32 => "PTRACE_SYSCALL".into(),
        r if r == PTRACE_SYSEMU => "PTRACE_SYSEMU".into(),
        r if r == PTRACE_SYSEMU_SINGLESTEP => "PTRACE_SYSEMU_SINGLESTEP".into(),
        r if r == libc::PTRACE_ATTACH as u32 => "PTRACE_ATTACH".into(),
        r if r == libc::PTRACE_SEIZE as u32 => "PTRACE_SEIZE".into(),
        r if r == libc::PTRACE_INTERRUPT as u32 => "PTRACE_INTERRUPT".into(),
        _ => format!("PTRACE_REQUEST({})", request),
    }
}

pub fn errno_name(err: i32) -> String {
    match err {
        0 => "SUCCESS".into(),
        libc::EPERM => "EPERM".into(),
        libc::ENOENT => "ENOENT".into(),
        libc::ESRCH => "ESRCH".into(),
        libc::EINTR => "EINTR".into(),
        libc::EIO => "EIO".into(),
        libc::EBADF => "EBADF".into(),
        libc::ECHILD => "ECHILD".into(),
        libc::EAGAIN => "EAGAIN".into(),
        libc::ENOMEM => "ENOMEM".into(),
        libc::EACCES => "EACCES".into(),
        libc::EFAULT => "EFAULT".into(),
        libc::EBUSY => "EBUSY".into(),
        libc::EEXIST => "EEXIST".into(),
        libc::EXDEV => "EXDEV".into(),
        libc::ENODEV => "ENODEV".into(),
        libc::EINVAL => "EINVAL".into(),
        libc::ENOSPC => "ENOSPC".into(),
        libc::ESPIPE => "ESPIPE".into(),
        libc::EPIPE => "EPIPE".into(),
        libc::ERANGE => "ERANGE".into(),
        libc::ENOSYS => "ENOSYS".into(),
        libc::ENOTSUP => "ENOTSUP".into(),
        _ => format!("errno({})", err),
    }
}

/// Is this task a zombie, according to /proc/<pid>/stat?
pub fn is_zombie_process(pid: pid_t) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(contents) => {
            // The state char follows the parenthesized comm, which may
            // itself contain parentheses.
            match contents.rfind(')') {
                Some(pos) => contents[pos + 1..].trim_start().starts_with('Z'),
                None => true,
            }
        }
        // Can't read the status: treat it as dead.
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_names() {
        assert_eq!(signal_name(libc::SIGKILL), "SIGKILL");
        assert_eq!(signal_name(libc::SIGSTKFLT), "SIGSTKFLT");
        assert_eq!(signal_name(0), "signal(0)");
        assert_eq!(signal_name(40), "SIGRT40");
    }

    #[test]
    fn syscall_names() {
        assert_eq!(syscall_name(libc::SYS_mmap as i32), "mmap");
        assert_eq!(syscall_name(-1), "syscall(-1)");
    }

    #[test]
    fn errno_names() {
        assert_eq!(errno_name(libc::ENOENT), "ENOENT");
        assert_eq!(errno_name(0), "SUCCESS");
    }
}
