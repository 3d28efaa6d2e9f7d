use libc::{dev_t, ino_t};
use nix::sys::stat::{major, minor};
use std::ffi::{OsStr, OsString};
use std::fmt::{self, Display, Formatter};

/// The closed set of synthetic backing identities for regions without a
/// real file.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum PseudoDev {
    /// Placeholder for an empty region; short-circuits equivalence checks
    /// during coalescing.
    None,
    Anonymous,
    Heap,
    Scratch,
    SharedMmapFile,
    Stack,
    Syscallbuf,
    Vdso,
}

/// Identity of a mapping's backing object: a real device+inode, or one of
/// the pseudo-device kinds. Anonymous allocations are distinguished by a
/// synthetic inode issued by the session.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum FileId {
    Real { device: dev_t, inode: ino_t },
    Pseudo { kind: PseudoDev, inode: ino_t },
}

impl FileId {
    pub fn real(device: dev_t, inode: ino_t) -> FileId {
        FileId::Real { device, inode }
    }

    pub fn pseudo(kind: PseudoDev) -> FileId {
        FileId::Pseudo { kind, inode: 0 }
    }

    pub fn pseudo_with_inode(kind: PseudoDev, inode: ino_t) -> FileId {
        FileId::Pseudo { kind, inode }
    }

    pub fn is_real_device(&self) -> bool {
        matches!(self, FileId::Real { .. })
    }

    pub fn pseudo_kind(&self) -> Option<PseudoDev> {
        match self {
            FileId::Pseudo { kind, .. } => Some(*kind),
            FileId::Real { .. } => None,
        }
    }

    pub fn device(&self) -> dev_t {
        match self {
            FileId::Real { device, .. } => *device,
            FileId::Pseudo { .. } => 0,
        }
    }

    pub fn inode(&self) -> ino_t {
        match self {
            FileId::Real { inode, .. } => *inode,
            FileId::Pseudo { inode, .. } => *inode,
        }
    }

    /// Two ids identify the same backing object. Pseudo kinds must match
    /// exactly (with their synthetic inodes); real devices match on device
    /// and inode, except that a zero major number makes the minor number
    /// untrustworthy on some kernels, so it is then ignored.
    pub fn equivalent_to(&self, other: &FileId) -> bool {
        match (self, other) {
            (
                FileId::Pseudo { kind: k1, inode: i1 },
                FileId::Pseudo { kind: k2, inode: i2 },
            ) => k1 == k2 && i1 == i2,
            (
                FileId::Real {
                    device: d1,
                    inode: i1,
                },
                FileId::Real {
                    device: d2,
                    inode: i2,
                },
            ) => {
                if i1 != i2 {
                    return false;
                }
                if major(*d1) != major(*d2) {
                    return false;
                }
                // Leniency for dev_major == 0.
                major(*d1) == 0 || minor(*d1) == minor(*d2)
            }
            _ => false,
        }
    }
}

/// A backing object: its identity plus the kernel's name for it.
#[derive(Clone, Debug)]
pub struct Resource {
    id: FileId,
    fsname: OsString,
}

impl Resource {
    pub fn new(id: FileId, fsname: &OsStr) -> Resource {
        Resource {
            id,
            fsname: fsname.to_os_string(),
        }
    }

    pub fn anonymous(synthetic_inode: ino_t) -> Resource {
        Resource {
            id: FileId::pseudo_with_inode(PseudoDev::Anonymous, synthetic_inode),
            fsname: OsString::new(),
        }
    }

    pub fn pseudo(kind: PseudoDev, fsname: &OsStr) -> Resource {
        Resource {
            id: FileId::pseudo(kind),
            fsname: fsname.to_os_string(),
        }
    }

    pub fn placeholder() -> Resource {
        Resource {
            id: FileId::pseudo(PseudoDev::None),
            fsname: OsString::new(),
        }
    }

    pub fn id(&self) -> &FileId {
        &self.id
    }

    pub fn fsname(&self) -> &OsStr {
        &self.fsname
    }

    pub fn is_real_device(&self) -> bool {
        self.id.is_real_device()
    }

    pub fn device(&self) -> dev_t {
        self.id.device()
    }

    pub fn inode(&self) -> ino_t {
        self.id.inode()
    }

    pub fn is_placeholder(&self) -> bool {
        self.id.pseudo_kind() == Some(PseudoDev::None)
    }

    pub fn is_heap(&self) -> bool {
        self.id.pseudo_kind() == Some(PseudoDev::Heap)
    }

    pub fn is_stack(&self) -> bool {
        self.id.pseudo_kind() == Some(PseudoDev::Stack)
    }

    pub fn is_vdso(&self) -> bool {
        self.id.pseudo_kind() == Some(PseudoDev::Vdso)
    }

    pub fn is_scratch(&self) -> bool {
        self.id.pseudo_kind() == Some(PseudoDev::Scratch)
    }

    pub fn is_syscallbuf(&self) -> bool {
        self.id.pseudo_kind() == Some(PseudoDev::Syscallbuf)
    }

    pub fn equivalent_to(&self, other: &Resource) -> bool {
        self.id.equivalent_to(&other.id)
    }
}

impl Display for Resource {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.id {
            FileId::Real { device, inode } => write!(
                f,
                "{:02x}:{:02x} {:<10} {:?}",
                major(device),
                minor(device),
                inode,
                self.fsname
            ),
            FileId::Pseudo { kind, inode } => write!(f, "{:?}({}) {:?}", kind, inode, self.fsname),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pseudo_equivalence() {
        let heap1 = Resource::pseudo(PseudoDev::Heap, OsStr::new("[heap]"));
        let heap2 = Resource::pseudo(PseudoDev::Heap, OsStr::new(""));
        let stack = Resource::pseudo(PseudoDev::Stack, OsStr::new("[stack]"));
        assert!(heap1.equivalent_to(&heap2));
        assert!(!heap1.equivalent_to(&stack));
    }

    #[test]
    fn anonymous_inodes_distinguish() {
        let a = Resource::anonymous(1);
        let b = Resource::anonymous(2);
        let a2 = Resource::anonymous(1);
        assert!(!a.equivalent_to(&b));
        assert!(a.equivalent_to(&a2));
    }

    #[test]
    fn real_device_equivalence_with_major_zero_leniency() {
        let makedev = |maj, min| nix::sys::stat::makedev(maj, min);
        let a = Resource::new(FileId::real(makedev(8, 1), 42), OsStr::new("/lib/x.so"));
        let b = Resource::new(FileId::real(makedev(8, 1), 42), OsStr::new("/lib/x.so"));
        let c = Resource::new(FileId::real(makedev(8, 2), 42), OsStr::new("/lib/x.so"));
        let d = Resource::new(FileId::real(makedev(8, 1), 43), OsStr::new("/lib/x.so"));
        assert!(a.equivalent_to(&b));
        assert!(!a.equivalent_to(&c));
        assert!(!a.equivalent_to(&d));

        // Zero major: minor is untrustworthy and ignored.
        let e = Resource::new(FileId::real(makedev(0, 1), 42), OsStr::new("/x"));
        let f = Resource::new(FileId::real(makedev(0, 9), 42), OsStr::new("/x"));
        assert!(e.equivalent_to(&f));
    }

    #[test]
    fn real_never_matches_pseudo() {
        let real = Resource::new(FileId::real(0, 0), OsStr::new(""));
        let anon = Resource::anonymous(0);
        assert!(!real.equivalent_to(&anon));
    }
}
