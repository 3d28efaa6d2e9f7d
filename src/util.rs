use crate::{
    log::{LogDebug, LogWarn},
    scoped_fd::ScopedFd,
};
use nix::{
    sys::stat::{stat, FileStat, Mode},
    unistd::{access, mkdir, sysconf, AccessFlags, SysconfVar::PAGE_SIZE},
};
use std::{
    convert::TryInto,
    env,
    ffi::{OsStr, OsString},
    os::unix::ffi::{OsStrExt, OsStringExt},
    path::{Path, PathBuf},
};

pub fn page_size() -> usize {
    4096
}

/// The runtime page size must agree with the constant the address-space
/// arithmetic uses.
pub fn assert_page_size() {
    let ps = sysconf(PAGE_SIZE).unwrap().unwrap() as usize;
    if ps != page_size() {
        fatal!("Unsupported page size {}", ps);
    }
}

pub fn floor_page_size(sz: usize) -> usize {
    sz & !(page_size() - 1)
}

pub fn ceil_page_size(sz: usize) -> usize {
    (sz + page_size() - 1) & !(page_size() - 1)
}

/// First occurrence of `needle` in `haystack`.
pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    memchr::memmem::find(haystack, needle)
}

/// CLOCK_MONOTONIC now, in seconds.
pub fn monotonic_now_sec() -> f64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as f64 + ts.tv_nsec as f64 * 1e-9
}

pub fn to_timeval(t: f64) -> libc::timeval {
    libc::timeval {
        tv_sec: t as i64,
        tv_usec: ((t - (t as i64) as f64) * 1e6) as i64,
    }
}

/// Write all of `buf` to `fd`, dying on error.
pub fn write_all(fd: i32, mut buf: &[u8]) {
    while !buf.is_empty() {
        let ret = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if ret <= 0 {
            fatal!("Can't write {} bytes to fd {}", buf.len(), fd);
        }
        buf = &buf[ret as usize..];
    }
}

/// Read exactly `buf.len()` bytes, Err(()) on failure or short stream.
pub fn read_all_fallible(fd: i32, buf: &mut [u8]) -> Result<(), ()> {
    let mut done = 0;
    while done < buf.len() {
        let ret = unsafe {
            libc::read(
                fd,
                buf[done..].as_mut_ptr() as *mut libc::c_void,
                buf.len() - done,
            )
        };
        if ret <= 0 {
            return Err(());
        }
        done += ret as usize;
    }
    Ok(())
}

/// pwrite the whole buffer, retrying short writes. Err(()) when nothing
/// could be written, otherwise the count written.
pub fn pwrite_all_fallible(fd: i32, buf_initial: &[u8], offset: isize) -> Result<usize, ()> {
    let mut written = 0;
    let mut buf = buf_initial;
    let mut cur_offset = offset;
    while !buf.is_empty() {
        let ret = unsafe {
            libc::pwrite64(
                fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                cur_offset as i64,
            )
        };
        if ret <= 0 {
            if written > 0 {
                return Ok(written);
            }
            return Err(());
        }
        written += ret as usize;
        cur_offset += ret as isize;
        buf = &buf[ret as usize..];
    }
    Ok(written)
}

fn dir_exists<P: AsRef<Path>>(dir: P) -> bool {
    dir.as_ref().is_dir()
}

/// The trace root: `_RR_TRACE_DIR` when set; otherwise prefer
/// `$XDG_DATA_HOME/rr` when it exists, else `~/.rr` when it exists, else
/// `$XDG_DATA_HOME/rr` (created later), else `/tmp/rr`.
pub fn trace_save_dir() -> PathBuf {
    if let Some(dir) = env::var_os("_RR_TRACE_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    default_trace_dir()
}

fn default_trace_dir() -> PathBuf {
    let dot_dir: Option<PathBuf> = env::var_os("HOME")
        .filter(|h| !h.is_empty())
        .map(|h| PathBuf::from(h).join(".rr"));
    let xdg_dir: Option<PathBuf> = match env::var_os("XDG_DATA_HOME") {
        Some(x) if !x.is_empty() => Some(PathBuf::from(x).join("rr")),
        _ => env::var_os("HOME")
            .filter(|h| !h.is_empty())
            .map(|h| PathBuf::from(h).join(".local/share/rr")),
    };

    // If the XDG dir does not exist but ~/.rr does, prefer ~/.rr for
    // backwards compatibility.
    if let Some(ref xdg) = xdg_dir {
        if dir_exists(xdg) {
            return xdg.clone();
        }
    }
    if let Some(ref dot) = dot_dir {
        if dir_exists(dot) {
            return dot.clone();
        }
    }
    if let Some(xdg) = xdg_dir {
        return xdg;
    }
    PathBuf::from("/tmp/rr")
}

pub fn latest_trace_symlink() -> PathBuf {
    trace_save_dir().join("latest-trace")
}

/// mkdir -p with fatal diagnostics, also verifying writability.
pub fn ensure_dir(dir: &Path, mode: Mode) {
    if let Ok(st) = stat(dir) {
        if st.st_mode & libc::S_IFDIR == 0 {
            fatal!("`{:?}' exists but isn't a directory.", dir);
        }
        if access(dir, AccessFlags::W_OK).is_err() {
            fatal!("Can't write to `{:?}'.", dir);
        }
        return;
    }

    match dir.parent() {
        Some(parent) if parent != Path::new("") && parent != Path::new("/") => {
            ensure_dir(parent, mode)
        }
        _ => (),
    }

    // Allow a race with a concurrent recorder creating the same directory.
    match mkdir(dir, mode) {
        Ok(_) => (),
        Err(nix::errno::Errno::EEXIST) => (),
        Err(e) => fatal!("Can't create trace directory `{:?}': {:?}", dir, e),
    }
    if access(dir, AccessFlags::W_OK).is_err() {
        fatal!("Can't write to `{:?}'.", dir);
    }
}

fn has_fs_name(path: &OsStr) -> bool {
    !path.is_empty() && stat(path).is_ok()
}

fn is_tmp_file(path: &OsStr) -> bool {
    if let Ok(tmpdir) = env::var("RETRACE_TMPDIR") {
        if find(path.as_bytes(), tmpdir.as_bytes()) == Some(0) {
            return true;
        }
    }
    match stat(path) {
        // No fs or shm backing: in a tmpfs, the fs magic is unavailable
        // through stat, so approximate with /tmp and /dev/shm prefixes.
        Ok(_) => {
            find(path.as_bytes(), b"/tmp/") == Some(0)
                || find(path.as_bytes(), b"/dev/shm/") == Some(0)
        }
        Err(_) => false,
    }
}

/// One policy for "must the bytes of this file mapping be copied into the
/// trace". The checksum filter shares this function so record-time copies
/// and validation-time skips can't diverge.
pub fn should_copy_mmap_region(
    fsname: &OsStr,
    st: &FileStat,
    prot: i32,
    flags: i32,
    warn_shared_writeable: bool,
) -> bool {
    let private_mapping = flags & libc::MAP_PRIVATE != 0;

    if !has_fs_name(fsname) {
        log!(LogDebug, "  copying unlinked file");
        return true;
    }
    if is_tmp_file(fsname) {
        log!(LogDebug, "  copying file on tmpfs");
        return true;
    }
    if private_mapping && (prot & libc::PROT_EXEC != 0) {
        // We don't record the images that we exec(), so stay consistent by
        // not copying executable private mappings either.
        log!(LogDebug, "  (no copy for +x private mapping {:?})", fsname);
        return false;
    }
    if private_mapping && (0o111 & st.st_mode != 0) {
        // A private mapping of an executable file usually maps the data
        // sections of object files, which change very infrequently.
        log!(LogDebug, "  (no copy for private mapping of +x {:?})", fsname);
        return false;
    }

    let can_write_file = access(fsname, AccessFlags::W_OK).is_ok();

    if !can_write_file && st.st_uid == 0 {
        // Mapping a file owned by root: unless the program is disastrously
        // unlucky, the mapping is effectively PRIVATE even when SHARED.
        log!(LogDebug, "  (no copy for root-owned {:?})", fsname);
        return false;
    }
    if private_mapping {
        // Cache-like files may be mutated at shutdown; err on the safe side.
        log!(LogDebug, "  copying private mapping of non-system -x {:?}", fsname);
        return true;
    }
    if 0o222 & st.st_mode == 0 {
        // Read-only but not a root-owned system file: likely temporary.
        log!(LogDebug, "  copying read-only, non-system file");
        return true;
    }
    if !can_write_file {
        fatal!(
            "Unhandled mmap {:?} (prot: {:#x}{}); uid: {} mode: {:o}",
            fsname,
            prot,
            if flags & libc::MAP_SHARED != 0 {
                "; SHARED"
            } else {
                ""
            },
            st.st_uid,
            st.st_mode
        );
    }
    if prot & libc::PROT_WRITE != 0 && warn_shared_writeable {
        log!(
            LogWarn,
            "{:?} is SHARED|WRITEABLE; optimistically hoping it's not written \
             by programs outside the tracee tree",
            fsname
        );
    }
    true
}

/// Additive checksum over 32-bit words, the memory-validation primitive.
pub fn checksum_bytes(buf: &[u8]) -> u32 {
    let mut checksum: u32 = 0;
    for chunk in buf.chunks_exact(4) {
        checksum = checksum.wrapping_add(u32::from_le_bytes(chunk.try_into().unwrap()));
    }
    checksum
}

/// Fill `out` with random bytes for trace UUIDs.
pub fn good_random(out: &mut [u8]) {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    for b in out.iter_mut() {
        *b = rng.gen();
    }
}

pub fn resource_path() -> OsString {
    match crate::flags::Flags::get().resource_path {
        Some(ref p) => p.clone().into_os_string(),
        None => OsString::from("/usr/share/retrace/"),
    }
}

/// Running under an outer instance of the engine?
pub fn running_under_retrace() -> bool {
    env::var_os("RUNNING_UNDER_RETRACE").is_some()
}

pub fn get_num_cpus() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n < 1 {
        1
    } else {
        n as usize
    }
}

/// Search `bytes` for the syscall instruction of the native arch; used
/// before the first exec, when the engine scans its own VDSO.
pub fn find_syscall_instruction_in(bytes: &[u8]) -> Option<usize> {
    let insn = crate::kernel_abi::syscall_instruction(crate::kernel_abi::NATIVE_ARCH);
    find(bytes, insn)
}

pub fn u8_slice<T>(v: &T) -> &[u8] {
    unsafe { std::slice::from_raw_parts(v as *const T as *const u8, std::mem::size_of::<T>()) }
}

pub fn u8_slice_mut<T>(v: &mut T) -> &mut [u8] {
    unsafe { std::slice::from_raw_parts_mut(v as *mut T as *mut u8, std::mem::size_of::<T>()) }
}

pub fn basename(path: &OsStr) -> OsString {
    match path.as_bytes().iter().rposition(|&b| b == b'/') {
        Some(pos) => OsString::from_vec(path.as_bytes()[pos + 1..].to_vec()),
        None => path.to_os_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_arithmetic() {
        assert_eq!(floor_page_size(4095), 0);
        assert_eq!(floor_page_size(4096), 4096);
        assert_eq!(ceil_page_size(1), 4096);
        assert_eq!(ceil_page_size(4096), 4096);
        assert_eq!(ceil_page_size(0), 0);
    }

    #[test]
    fn checksum_is_additive_over_words() {
        let buf = [1u8, 0, 0, 0, 2, 0, 0, 0];
        assert_eq!(checksum_bytes(&buf), 3);
        // A trailing partial word does not participate.
        let buf = [1u8, 0, 0, 0, 0xff];
        assert_eq!(checksum_bytes(&buf), 1);
        assert_eq!(checksum_bytes(&[]), 0);
    }

    #[test]
    fn find_bytes() {
        assert_eq!(find(b"hello world", b"world"), Some(6));
        assert_eq!(find(b"hello", b"xyz"), None);
        assert_eq!(find(b"aaa", b""), Some(0));
    }

    #[test]
    fn basename_extracts_last_component() {
        assert_eq!(basename(OsStr::new("/usr/lib/libc.so.6")), "libc.so.6");
        assert_eq!(basename(OsStr::new("noslash")), "noslash");
    }

    #[test]
    fn syscall_instruction_search() {
        let mut buf = vec![0x90u8; 64];
        buf[10] = 0x0f;
        buf[11] = 0x05;
        assert_eq!(find_syscall_instruction_in(&buf), Some(10));
    }

    #[test]
    fn monotonic_clock_advances() {
        let a = monotonic_now_sec();
        let b = monotonic_now_sec();
        assert!(b >= a);
    }
}
