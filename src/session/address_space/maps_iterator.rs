use super::{
    mapping::Mapping,
    resource::{FileId, PseudoDev, Resource},
};
use crate::{
    remote_ptr::{RemotePtr, Void},
    util::find,
};
use libc::{ino_t, pid_t};
use nix::sys::{
    mman::{MapFlags, ProtFlags},
    stat::makedev,
};
use std::{
    ffi::OsStr,
    fs::File,
    io::{BufRead, BufReader},
    os::unix::ffi::OsStrExt,
};

/// Iterates /proc/<tid>/maps, yielding the kernel's view of the address
/// space as (Mapping, Resource) pairs.
pub struct KernelMapsIterator {
    tid: pid_t,
    reader: BufReader<File>,
}

impl Iterator for KernelMapsIterator {
    type Item = (Mapping, Resource);

    fn next(&mut self) -> Option<(Mapping, Resource)> {
        let mut raw_line = Vec::new();
        match self.reader.read_until(b'\n', &mut raw_line) {
            Ok(0) => None,
            Ok(_) => Some(parse_maps_line(&raw_line)),
            Err(e) => fatal!("Error reading /proc/{}/maps: {:?}", self.tid, e),
        }
    }
}

impl KernelMapsIterator {
    pub fn new(tid: pid_t) -> KernelMapsIterator {
        let maps_path = format!("/proc/{}/maps", tid);
        match File::open(&maps_path) {
            Ok(file) => KernelMapsIterator {
                tid,
                reader: BufReader::new(file),
            },
            Err(e) => fatal!("Failed to open {}: {:?}", maps_path, e),
        }
    }
}

/// The kernel mapping containing `addr`, straight from /proc.
pub fn read_kernel_mapping(tid: pid_t, addr: RemotePtr<Void>) -> (Mapping, Resource) {
    for (m, r) in KernelMapsIterator::new(tid) {
        if m.contains_ptr(addr) {
            return (m, r);
        }
    }
    fatal!("No kernel mapping at {:#x} for {}", addr.as_usize(), tid);
}

fn parse_maps_line(raw_line: &[u8]) -> (Mapping, Resource) {
    let mut fields = raw_line.splitn(6, |c| *c == b' ');
    let addr_range = String::from_utf8_lossy(fields.next().unwrap());
    let perms = String::from_utf8_lossy(fields.next().unwrap());
    let offset_s = String::from_utf8_lossy(fields.next().unwrap());
    let device = String::from_utf8_lossy(fields.next().unwrap());
    let inode_s = String::from_utf8_lossy(fields.next().unwrap());
    let fsname_raw = fields.next().unwrap_or(b"");

    let mut addrs = addr_range.split('-');
    let start: usize = usize::from_str_radix(addrs.next().unwrap(), 16).unwrap();
    let end: usize = usize::from_str_radix(addrs.next().unwrap(), 16).unwrap();

    let offset = u64::from_str_radix(&offset_s, 16).unwrap();

    let mut devs = device.split(':');
    let dev_major = u64::from_str_radix(devs.next().unwrap(), 16).unwrap();
    let dev_minor = u64::from_str_radix(devs.next().unwrap(), 16).unwrap();
    let inode: ino_t = inode_s.trim().parse().unwrap();

    let fsname = unescape_fsname(fsname_raw);

    let mut prot = ProtFlags::empty();
    if perms.contains('r') {
        prot |= ProtFlags::PROT_READ;
    }
    if perms.contains('w') {
        prot |= ProtFlags::PROT_WRITE;
    }
    if perms.contains('x') {
        prot |= ProtFlags::PROT_EXEC;
    }
    let mut flags = MapFlags::empty();
    if perms.contains('p') {
        flags |= MapFlags::MAP_PRIVATE;
    }
    if perms.contains('s') {
        flags |= MapFlags::MAP_SHARED;
    }

    let name = OsStr::from_bytes(&fsname);
    let resource = resource_for(name, dev_major, dev_minor, inode);
    let mapping = Mapping::new(start.into(), end.into(), prot, flags, offset);
    (mapping, resource)
}

fn resource_for(name: &OsStr, dev_major: u64, dev_minor: u64, inode: ino_t) -> Resource {
    let bytes = name.as_bytes();
    if bytes == b"[heap]" {
        return Resource::pseudo(PseudoDev::Heap, name);
    }
    if bytes == b"[vdso]" {
        return Resource::pseudo(PseudoDev::Vdso, name);
    }
    // The kernel uses "[stack:<tid>]" for any area containing a thread's
    // stack pointer; match the prefix without the closing bracket.
    if find(bytes, b"[stack") == Some(0) {
        return Resource::pseudo(PseudoDev::Stack, name);
    }
    if inode == 0 && dev_major == 0 && dev_minor == 0 && bytes.is_empty() {
        return Resource::anonymous(0);
    }
    Resource::new(
        FileId::real(makedev(dev_major, dev_minor), inode),
        name,
    )
}

/// /proc escapes newlines in filenames as "\012".
fn unescape_fsname(raw: &[u8]) -> Vec<u8> {
    let trimmed: &[u8] = {
        let mut start = 0;
        while start < raw.len() && raw[start] == b' ' {
            start += 1;
        }
        let mut end = raw.len();
        while end > start && (raw[end - 1] == b'\n' || raw[end - 1] == b'\r') {
            end -= 1;
        }
        &raw[start..end]
    };

    let mut out = Vec::with_capacity(trimmed.len());
    let mut it = trimmed.iter().peekable();
    while let Some(&c) = it.next() {
        if c == b'\\' {
            let rest: Vec<u8> = it.clone().take(3).copied().collect();
            if rest == b"012" {
                out.push(b'\n');
                it.next();
                it.next();
                it.next();
                continue;
            }
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_file_backed_line() {
        let line = b"7f1000000000-7f1000021000 r-xp 00002000 08:01 396033     /usr/lib/libc.so.6\n";
        let (m, r) = parse_maps_line(line);
        assert_eq!(m.start().as_usize(), 0x7f1000000000);
        assert_eq!(m.end().as_usize(), 0x7f1000021000);
        assert!(m.prot().contains(ProtFlags::PROT_EXEC));
        assert!(m.flags().contains(MapFlags::MAP_PRIVATE));
        assert_eq!(m.file_offset_bytes(), 0x2000);
        assert!(r.is_real_device());
        assert_eq!(r.inode(), 396033);
        assert_eq!(r.fsname(), "/usr/lib/libc.so.6");
    }

    #[test]
    fn parse_pseudo_lines() {
        let line = b"55d000000000-55d000021000 rw-p 00000000 00:00 0          [heap]\n";
        let (_, r) = parse_maps_line(line);
        assert!(r.is_heap());

        let line = b"7ffc00000000-7ffc00021000 rw-p 00000000 00:00 0          [stack]\n";
        let (_, r) = parse_maps_line(line);
        assert!(r.is_stack());

        let line = b"7ffc00022000-7ffc00023000 r-xp 00000000 00:00 0          [vdso]\n";
        let (_, r) = parse_maps_line(line);
        assert!(r.is_vdso());

        let line = b"7f2000000000-7f2000001000 rw-p 00000000 00:00 0 \n";
        let (_, r) = parse_maps_line(line);
        assert!(!r.is_real_device());
    }

    #[test]
    fn unescape_newline_escapes() {
        assert_eq!(unescape_fsname(b" /tmp/a\\012b\n"), b"/tmp/a\nb".to_vec());
        assert_eq!(unescape_fsname(b" /tmp/plain\n"), b"/tmp/plain".to_vec());
    }

    #[test]
    fn own_maps_are_parseable() {
        let it = KernelMapsIterator::new(nix::unistd::getpid().as_raw());
        let mut count = 0;
        let mut last_start = 0usize;
        for (m, _) in it {
            assert!(m.start().as_usize() >= last_start);
            last_start = m.start().as_usize();
            count += 1;
        }
        assert!(count > 0);
    }
}
