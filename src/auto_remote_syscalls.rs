use crate::{
    kernel_abi::{syscall_instruction, NATIVE_ARCH},
    log::LogDebug,
    registers::Registers,
    remote_code_ptr::RemoteCodePtr,
    remote_ptr::{RemotePtr, Void},
    scoped_fd::ScopedFd,
    session::task::{ResumeRequest, Task, TicksRequest, WaitRequest, WriteFlags},
    util::{find_syscall_instruction_in, page_size},
    wait_status::WaitStatus,
};
use libc::{AF_UNIX, SOCK_STREAM};
use nix::sys::{
    socket::{
        accept, bind, listen, recvmsg, ControlMessageOwned, MsgFlags, SockAddr,
    },
    uio::IoVec,
};
use std::mem::size_of;

/// RAII helper to prepare a Task for remote syscalls and undo the
/// preparation on scope exit: registers (and any overwritten code bytes)
/// are restored, so all register changes made inside are lost.
///
/// The IP is pointed at the syscall page's traced entry when the page is
/// mapped; before then (early spawn) a syscall instruction is located by
/// scanning the tracee's VDSO, whose content matches the engine's own
/// before exec.
///
/// The caller must ensure the tracee will not receive signals during the
/// remote syscalls; this code does not attempt to deal with them.
pub struct AutoRemoteSyscalls<'a> {
    t: &'a mut Task,
    initial_regs: Registers,
    restore_wait_status: WaitStatus,
    syscall_ip: RemoteCodePtr,
    /// Bytes replaced by a syscall instruction when no trusted one was
    /// available, restored on drop.
    replaced_bytes: Option<(RemotePtr<Void>, Vec<u8>)>,
    /// Bump allocator for tracee-side scratch, growing down from below
    /// the stack pointer's red zone.
    scratch_top: RemotePtr<Void>,
}

impl<'a> AutoRemoteSyscalls<'a> {
    pub fn new(t: &'a mut Task) -> AutoRemoteSyscalls<'a> {
        let initial_regs = *t.regs_ref();
        let restore_wait_status = t.status();

        let vm = t.vm();
        let mut replaced_bytes = None;
        let syscall_ip = if !vm.traced_syscall_ip().is_null() {
            vm.traced_syscall_ip()
        } else {
            // No syscall page yet: find a syscall instruction in the vdso,
            // or failing that, plant one at the current IP.
            match find_vdso_syscall_ip(t) {
                Some(ip) => ip,
                None => {
                    let insn = syscall_instruction(NATIVE_ARCH);
                    let addr = initial_regs.ip().to_data_ptr::<Void>();
                    let mut old = vec![0u8; insn.len()];
                    t.read_bytes_helper(addr, &mut old, None);
                    t.write_bytes_helper(addr, insn, None, WriteFlags::empty());
                    replaced_bytes = Some((addr, old));
                    initial_regs.ip()
                }
            }
        };

        let scratch_top = RemotePtr::new((initial_regs.sp().as_usize() - 256) & !0xf);
        AutoRemoteSyscalls {
            t,
            initial_regs,
            restore_wait_status,
            syscall_ip,
            replaced_bytes,
            scratch_top,
        }
    }

    pub fn task(&mut self) -> &mut Task {
        self.t
    }

    pub fn initial_regs(&self) -> &Registers {
        &self.initial_regs
    }

    /// Execute one syscall in the tracee and return its raw result.
    pub fn syscall(&mut self, syscallno: i32, args: &[usize]) -> isize {
        debug_assert!(args.len() <= 6);
        let mut regs = self.initial_regs;
        regs.set_ip(self.syscall_ip);
        regs.set_syscallno(syscallno as isize);
        regs.set_original_syscallno(syscallno as isize);
        for (i, &arg) in args.iter().enumerate() {
            match i {
                0 => regs.set_arg1(arg),
                1 => regs.set_arg2(arg),
                2 => regs.set_arg3(arg),
                3 => regs.set_arg4(arg),
                4 => regs.set_arg5(arg),
                _ => regs.set_arg6(arg),
            }
        }
        self.t.set_regs(&regs);

        // Enter the syscall...
        self.t.resume_execution(
            ResumeRequest::ResumeSyscall,
            WaitRequest::ResumeWait,
            TicksRequest::ResumeNoTicks,
            None,
        );
        // ...and exit it.
        self.t.resume_execution(
            ResumeRequest::ResumeSyscall,
            WaitRequest::ResumeWait,
            TicksRequest::ResumeNoTicks,
            None,
        );

        let result = self.t.regs_ref().syscall_result_signed();
        log!(
            LogDebug,
            "remote syscall {} -> {}",
            crate::kernel_metadata::syscall_name(syscallno),
            result
        );
        result
    }

    /// A remote syscall whose failure is a fatal error.
    pub fn infallible_syscall(&mut self, syscallno: i32, args: &[usize]) -> isize {
        let ret = self.syscall(syscallno, args);
        if ret < 0 && ret > -4096 {
            fatal!(
                "remote {} failed with {}",
                crate::kernel_metadata::syscall_name(syscallno),
                crate::kernel_metadata::errno_name((-ret) as i32)
            );
        }
        ret
    }

    /// Remote mmap, returning the mapped address.
    pub fn infallible_mmap_syscall(
        &mut self,
        addr: Option<RemotePtr<Void>>,
        length: usize,
        prot: i32,
        flags: i32,
        child_fd: i32,
        offset: u64,
    ) -> RemotePtr<Void> {
        let ret = self.infallible_syscall(
            crate::kernel_abi::syscall_number_for_mmap(NATIVE_ARCH),
            &[
                addr.map_or(0, |a| a.as_usize()),
                length,
                prot as usize,
                flags as usize,
                child_fd as usize,
                offset as usize,
            ],
        );
        RemotePtr::new(ret as usize)
    }

    pub fn infallible_close_syscall(&mut self, child_fd: i32) {
        self.infallible_syscall(
            crate::kernel_abi::syscall_number_for_close(NATIVE_ARCH),
            &[child_fd as usize],
        );
    }

    /// Scratch space in the tracee for building argument structures,
    /// bump-allocated downward below the stack pointer. The memory is
    /// ordinary stack space; registers are restored on drop so the tracee
    /// never observes the clobber.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> RemotePtr<Void> {
        let addr = RemotePtr::new((self.scratch_top.as_usize() - bytes.len()) & !0xf);
        self.scratch_top = addr;
        self.t
            .write_bytes_helper(addr, bytes, None, WriteFlags::empty());
        addr
    }

    /// Retrieve a file descriptor owned by the tracee: open a listening
    /// AF_UNIX socket, have the tracee connect to it via remote syscalls,
    /// then pass the fd in an SCM_RIGHTS message.
    pub fn retrieve_fd(&mut self, tracee_fd: i32) -> ScopedFd {
        let sock_path = format!(
            "/tmp/retrace-fd-transfer-{}-{}",
            std::process::id(),
            self.t.tid
        );
        let _ = std::fs::remove_file(&sock_path);

        // Tracer side: listening socket.
        let listen_fd = unsafe { libc::socket(AF_UNIX, SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
        if listen_fd < 0 {
            fatal!("Can't create fd-transfer socket");
        }
        let listen_sock = ScopedFd::from_raw(listen_fd);
        let addr = SockAddr::new_unix(sock_path.as_str()).unwrap();
        if bind(listen_sock.as_raw(), &addr).is_err() {
            fatal!("Can't bind fd-transfer socket {}", sock_path);
        }
        if listen(listen_sock.as_raw(), 1).is_err() {
            fatal!("Can't listen on fd-transfer socket");
        }

        // Remote side: socket + connect.
        let child_sock = self.infallible_syscall(
            crate::kernel_abi::x64::SOCKET,
            &[AF_UNIX as usize, SOCK_STREAM as usize, 0],
        ) as i32;

        let mut sockaddr_bytes = vec![0u8; size_of::<libc::sockaddr_un>()];
        sockaddr_bytes[0..2].copy_from_slice(&(AF_UNIX as u16).to_le_bytes());
        sockaddr_bytes[2..2 + sock_path.len()].copy_from_slice(sock_path.as_bytes());
        let remote_addr = self.push_bytes(&sockaddr_bytes);
        self.infallible_syscall(
            crate::kernel_abi::x64::CONNECT,
            &[
                child_sock as usize,
                remote_addr.as_usize(),
                sockaddr_bytes.len(),
            ],
        );

        let conn_fd = match accept(listen_sock.as_raw()) {
            Ok(fd) => ScopedFd::from_raw(fd),
            Err(e) => fatal!("accept on fd-transfer socket failed: {:?}", e),
        };

        // Remote sendmsg carrying the fd in SCM_RIGHTS: iov, msghdr and
        // cmsg all live in tracee scratch.
        let mut payload = [0u8; 1];
        payload[0] = 0x5a;
        let payload_addr = self.push_bytes(&payload);

        let cmsg_space = unsafe { libc::CMSG_SPACE(size_of::<i32>() as u32) } as usize;
        let mut cmsg_buf = vec![0u8; cmsg_space];
        // struct cmsghdr { size_t cmsg_len; int cmsg_level; int cmsg_type; }
        let cmsg_len = unsafe { libc::CMSG_LEN(size_of::<i32>() as u32) } as u64;
        cmsg_buf[0..8].copy_from_slice(&cmsg_len.to_le_bytes());
        cmsg_buf[8..12].copy_from_slice(&libc::SOL_SOCKET.to_le_bytes());
        cmsg_buf[12..16].copy_from_slice(&libc::SCM_RIGHTS.to_le_bytes());
        cmsg_buf[16..20].copy_from_slice(&tracee_fd.to_le_bytes());
        let cmsg_addr = self.push_bytes(&cmsg_buf);

        let mut iov_bytes = vec![0u8; 16];
        iov_bytes[0..8].copy_from_slice(&(payload_addr.as_usize() as u64).to_le_bytes());
        iov_bytes[8..16].copy_from_slice(&1u64.to_le_bytes());
        let iov_addr = self.push_bytes(&iov_bytes);

        // struct msghdr for x86-64.
        let mut msg_bytes = vec![0u8; 56];
        msg_bytes[16..24].copy_from_slice(&(iov_addr.as_usize() as u64).to_le_bytes());
        msg_bytes[24..32].copy_from_slice(&1u64.to_le_bytes());
        msg_bytes[32..40].copy_from_slice(&(cmsg_addr.as_usize() as u64).to_le_bytes());
        msg_bytes[40..48].copy_from_slice(&(cmsg_space as u64).to_le_bytes());
        let msg_addr = self.push_bytes(&msg_bytes);

        self.infallible_syscall(
            crate::kernel_abi::x64::SENDMSG,
            &[child_sock as usize, msg_addr.as_usize(), 0],
        );

        // Tracer side: receive the fd.
        let mut byte_buf = [0u8; 1];
        let iov = [IoVec::from_mut_slice(&mut byte_buf)];
        let mut cmsgspace = nix::cmsg_space!([libc::c_int; 1]);
        let msg = match recvmsg(
            conn_fd.as_raw(),
            &iov,
            Some(&mut cmsgspace),
            MsgFlags::empty(),
        ) {
            Ok(msg) => msg,
            Err(e) => fatal!("recvmsg on fd-transfer socket failed: {:?}", e),
        };

        let mut received = ScopedFd::new();
        for cmsg in msg.cmsgs() {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                if let Some(&fd) = fds.first() {
                    received = ScopedFd::from_raw(fd);
                }
            }
        }
        if !received.is_open() {
            fatal!("Tracee fd {} was not passed", tracee_fd);
        }

        self.infallible_close_syscall(child_sock);
        let _ = std::fs::remove_file(&sock_path);
        received
    }
}

impl<'a> Drop for AutoRemoteSyscalls<'a> {
    fn drop(&mut self) {
        if let Some((addr, old)) = self.replaced_bytes.take() {
            self.t
                .write_bytes_helper(addr, &old, None, WriteFlags::empty());
        }
        let regs = self.initial_regs;
        self.t.set_regs(&regs);
        self.t.flush_regs();
        self.t.set_status(self.restore_wait_status);
    }
}

/// Locate a syscall instruction inside the tracee's VDSO mapping.
fn find_vdso_syscall_ip(t: &mut Task) -> Option<RemoteCodePtr> {
    let vm = t.vm();
    let vdso_start = vm.vdso_start();
    if vdso_start.is_null() {
        return None;
    }
    let vdso = vm.mapping_of(vdso_start)?;
    let len = std::cmp::min(vdso.map.size(), 64 * page_size());
    let mut bytes = vec![0u8; len];
    let nread = t.read_bytes_fallible(vdso.map.start(), &mut bytes).ok()?;
    let offset = find_syscall_instruction_in(&bytes[..nread])?;
    Some(RemoteCodePtr::from_val(vdso.map.start().as_usize() + offset))
}

/// Map the syscall page into the tracee at its fixed address and fill in
/// the traced and untraced stubs: each is a real syscall instruction
/// padded with no-ops.
pub fn map_syscall_page(remote: &mut AutoRemoteSyscalls<'_>) {
    use crate::preload_interface::{
        stub_entry_address, SYSCALL_PAGE_ADDR, SYSCALL_PAGE_SIZE, SYSCALL_STUB_SIZE,
        TRACED_STUB_INDEX, UNTRACED_STUB_INDEX,
    };

    let addr = remote.infallible_mmap_syscall(
        Some(RemotePtr::new(SYSCALL_PAGE_ADDR)),
        SYSCALL_PAGE_SIZE,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
        -1,
        0,
    );
    if addr.as_usize() != SYSCALL_PAGE_ADDR {
        fatal!("Syscall page landed at {} instead of its fixed address", addr);
    }

    let mut page = vec![0x90u8; SYSCALL_PAGE_SIZE];
    let insn = syscall_instruction(NATIVE_ARCH);
    for &index in &[TRACED_STUB_INDEX, UNTRACED_STUB_INDEX] {
        let off = index * SYSCALL_STUB_SIZE;
        page[off..off + insn.len()].copy_from_slice(insn);
        // Return to the caller after the syscall.
        page[off + insn.len()] = 0xc3;
    }
    remote
        .task()
        .write_bytes_helper(RemotePtr::new(SYSCALL_PAGE_ADDR), &page, None, WriteFlags::empty());

    // Seal the page r-x.
    remote.infallible_syscall(
        crate::kernel_abi::syscall_number_for_mprotect(NATIVE_ARCH),
        &[
            SYSCALL_PAGE_ADDR,
            SYSCALL_PAGE_SIZE,
            (libc::PROT_READ | libc::PROT_EXEC) as usize,
        ],
    );

    // Mirror the mapping into the cache and publish the entry points.
    let inode = remote.task().session().next_anonymous_inode();
    let vm = remote.task().vm();
    vm.map(
        RemotePtr::new(stub_entry_address(TRACED_STUB_INDEX) & !(SYSCALL_PAGE_SIZE - 1)),
        SYSCALL_PAGE_SIZE,
        nix::sys::mman::ProtFlags::PROT_READ | nix::sys::mman::ProtFlags::PROT_EXEC,
        nix::sys::mman::MapFlags::MAP_PRIVATE | nix::sys::mman::MapFlags::MAP_ANONYMOUS,
        0,
        crate::session::address_space::resource::Resource::anonymous(inode),
    );
    vm.did_map_syscall_page();
}
