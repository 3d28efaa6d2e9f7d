use super::mem_range::MemRange;
use crate::{
    remote_ptr::{RemotePtr, Void},
    util::page_size,
};
use libc::{MAP_ANONYMOUS, MAP_GROWSDOWN, MAP_NORESERVE, MAP_PRIVATE, MAP_SHARED, MAP_STACK};
use nix::sys::mman::{MapFlags, ProtFlags};
use std::{
    fmt::{self, Display, Formatter},
    ops::Deref,
};

/// One contiguous virtual range with uniform protection, flags and file
/// offset. Immutable once constructed; every mutation of the memory map
/// replaces Mappings wholesale.
#[derive(Clone, Debug)]
pub struct Mapping {
    mr: MemRange,
    prot_: ProtFlags,
    flags_: MapFlags,
    /// Page-aligned offset into the backing object. Zero for pseudo-device
    /// backings.
    offset_: u64,
}

impl Mapping {
    /// The flags tracked to distinguish adjacent segments. The kernel
    /// considers a NORESERVE anonymous mapping adjacent to a non-NORESERVE
    /// one distinct even when all other metadata agree.
    pub const MAP_FLAGS_MASK: MapFlags = MapFlags::from_bits_truncate(
        MAP_ANONYMOUS | MAP_NORESERVE | MAP_PRIVATE | MAP_SHARED | MAP_STACK | MAP_GROWSDOWN,
    );

    /// The subset of flags observable in /proc/<pid>/maps, used when
    /// reconciling with the kernel's view.
    pub const CHECKABLE_FLAGS_MASK: MapFlags =
        MapFlags::from_bits_truncate(MAP_PRIVATE | MAP_SHARED);

    pub fn new(
        start: RemotePtr<Void>,
        end: RemotePtr<Void>,
        prot: ProtFlags,
        flags: MapFlags,
        offset: u64,
    ) -> Mapping {
        let result = Mapping {
            mr: MemRange::from_range(start, end),
            prot_: prot,
            flags_: flags & Self::MAP_FLAGS_MASK,
            offset_: offset,
        };
        result.assert_valid();
        result
    }

    fn assert_valid(&self) {
        debug_assert!(self.end() >= self.start());
        debug_assert_eq!(self.size() % page_size(), 0);
        debug_assert!((self.flags_ & !Self::MAP_FLAGS_MASK).is_empty());
        debug_assert_eq!(self.offset_ % page_size() as u64, 0);
    }

    pub fn prot(&self) -> ProtFlags {
        self.prot_
    }

    pub fn flags(&self) -> MapFlags {
        self.flags_
    }

    pub fn file_offset_bytes(&self) -> u64 {
        self.offset_
    }

    /// A copy extended to `end`.
    pub fn extend(&self, end: RemotePtr<Void>) -> Mapping {
        debug_assert!(end >= self.end());
        Mapping::new(self.start(), end, self.prot_, self.flags_, self.offset_)
    }

    /// A copy relocated to [start, end), keeping the offset.
    pub fn set_range(&self, start: RemotePtr<Void>, end: RemotePtr<Void>) -> Mapping {
        Mapping::new(start, end, self.prot_, self.flags_, self.offset_)
    }

    /// The sub-mapping [start, end); for real-device backings the offset
    /// advances by the distance from the original start. `offset_adjusts`
    /// tells whether the backing keeps meaningful offsets.
    pub fn subrange(
        &self,
        start: RemotePtr<Void>,
        end: RemotePtr<Void>,
        offset_adjusts: bool,
    ) -> Mapping {
        debug_assert!(start >= self.start() && end <= self.end());
        let delta = if offset_adjusts {
            (start - self.start()) as u64
        } else {
            0
        };
        Mapping::new(start, end, self.prot_, self.flags_, self.offset_ + delta)
    }

    pub fn set_prot(&self, prot: ProtFlags) -> Mapping {
        Mapping::new(self.start(), self.end(), prot, self.flags_, self.offset_)
    }

    fn prot_string(&self) -> String {
        let mut s = String::with_capacity(4);
        s.push(if self.prot_.contains(ProtFlags::PROT_READ) {
            'r'
        } else {
            '-'
        });
        s.push(if self.prot_.contains(ProtFlags::PROT_WRITE) {
            'w'
        } else {
            '-'
        });
        s.push(if self.prot_.contains(ProtFlags::PROT_EXEC) {
            'x'
        } else {
            '-'
        });
        s.push(if self.flags_.contains(MapFlags::MAP_SHARED) {
            's'
        } else {
            'p'
        });
        s
    }
}

impl Deref for Mapping {
    type Target = MemRange;

    fn deref(&self) -> &Self::Target {
        &self.mr
    }
}

impl Display for Mapping {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:8x}-{:8x} {} {:08x}",
            self.start().as_usize(),
            self.end().as_usize(),
            self.prot_string(),
            self.offset_
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(start: usize, end: usize, offset: u64) -> Mapping {
        Mapping::new(
            start.into(),
            end.into(),
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_PRIVATE,
            offset,
        )
    }

    #[test]
    fn flags_are_masked() {
        let m = Mapping::new(
            0x1000.into(),
            0x2000.into(),
            ProtFlags::PROT_READ,
            MapFlags::MAP_PRIVATE | MapFlags::MAP_FIXED,
            0,
        );
        // MAP_FIXED is not part of the tracked set.
        assert_eq!(m.flags(), MapFlags::MAP_PRIVATE);
    }

    #[test]
    fn subrange_adjusts_offset_for_real_backings() {
        let m = map(0x1000, 0x4000, 0x2000);
        let sub = m.subrange(0x2000.into(), 0x3000.into(), true);
        assert_eq!(sub.start().as_usize(), 0x2000);
        assert_eq!(sub.file_offset_bytes(), 0x3000);

        let sub = m.subrange(0x2000.into(), 0x3000.into(), false);
        assert_eq!(sub.file_offset_bytes(), 0x2000);
    }

    #[test]
    fn extend_and_set_range() {
        let m = map(0x1000, 0x2000, 0);
        let e = m.extend(0x3000.into());
        assert_eq!(e.size(), 0x2000);
        assert_eq!(e.file_offset_bytes(), 0);

        let r = m.set_range(0x8000.into(), 0x9000.into());
        assert_eq!(r.start().as_usize(), 0x8000);
        assert_eq!(r.file_offset_bytes(), 0);
    }

    #[test]
    fn display_prot_string() {
        let m = map(0x1000, 0x2000, 0);
        let s = format!("{}", m);
        assert!(s.contains("rw-p"));
    }
}
