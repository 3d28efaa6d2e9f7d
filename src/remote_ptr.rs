use std::{
    cmp::Ordering,
    fmt::{self, Display, Formatter},
    marker::PhantomData,
    ops::{Add, Sub},
};

/// Opaque referent type for untyped tracee addresses.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Void {}

/// An address in a tracee's address space, typed by referent. Arithmetic is
/// scaled by `size_of::<T>()`, like a raw pointer, but the address is never
/// dereferenceable from the tracer.
pub struct RemotePtr<T> {
    ptr: usize,
    phantom: PhantomData<T>,
}

impl<T> RemotePtr<T> {
    pub fn null() -> RemotePtr<T> {
        RemotePtr {
            ptr: 0,
            phantom: PhantomData,
        }
    }

    pub fn new(val: usize) -> RemotePtr<T> {
        RemotePtr {
            ptr: val,
            phantom: PhantomData,
        }
    }

    pub fn as_usize(self) -> usize {
        self.ptr
    }

    pub fn as_isize(self) -> isize {
        self.ptr as isize
    }

    pub fn is_null(self) -> bool {
        self.ptr == 0
    }

    pub fn referent_size(self) -> usize {
        std::mem::size_of::<T>()
    }

    pub fn cast<U>(r: RemotePtr<U>) -> RemotePtr<T> {
        RemotePtr::new(r.ptr)
    }

    pub fn to_void(self) -> RemotePtr<Void> {
        RemotePtr::new(self.ptr)
    }
}

// Manual impls: derive would add bounds on T, which carries no data here.
impl<T> Copy for RemotePtr<T> {}

impl<T> Clone for RemotePtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Default for RemotePtr<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> Display for RemotePtr<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.ptr)
    }
}

impl<T> fmt::Debug for RemotePtr<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.ptr)
    }
}

// `size_of::<Void>()` is zero, so Void pointers fall back to byte-granular
// arithmetic (scale of 1) instead of collapsing to no-ops.
impl<T> Add<usize> for RemotePtr<T> {
    type Output = Self;

    fn add(self, delta: usize) -> Self::Output {
        let scale = std::mem::size_of::<T>().max(1);
        Self::new(self.ptr + delta * scale)
    }
}

impl<T> Sub<usize> for RemotePtr<T> {
    type Output = Self;

    fn sub(self, delta: usize) -> Self::Output {
        let scale = std::mem::size_of::<T>().max(1);
        Self::new(self.ptr - delta * scale)
    }
}

/// Pointer difference in bytes; only meaningful for Void-typed operands,
/// which is what address arithmetic in the engine uses.
impl Sub<RemotePtr<Void>> for RemotePtr<Void> {
    type Output = usize;

    fn sub(self, rhs: RemotePtr<Void>) -> usize {
        debug_assert!(self.ptr >= rhs.ptr);
        self.ptr - rhs.ptr
    }
}

impl<T> PartialOrd for RemotePtr<T> {
    fn partial_cmp(&self, other: &RemotePtr<T>) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for RemotePtr<T> {
    fn cmp(&self, other: &RemotePtr<T>) -> Ordering {
        self.ptr.cmp(&other.ptr)
    }
}

impl<T> PartialEq for RemotePtr<T> {
    fn eq(&self, other: &RemotePtr<T>) -> bool {
        self.ptr == other.ptr
    }
}

impl<T> Eq for RemotePtr<T> {}

impl<T> std::hash::Hash for RemotePtr<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.ptr.hash(state)
    }
}

impl<T> From<usize> for RemotePtr<T> {
    fn from(addr: usize) -> Self {
        RemotePtr::new(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_and_from() {
        let a = RemotePtr::<u64>::null();
        assert!(a.is_null());
        assert_eq!(0, a.as_usize());
        let b: RemotePtr<u64> = 16usize.into();
        assert_eq!(16, b.as_usize());
    }

    #[test]
    fn scaled_arithmetic() {
        let a = RemotePtr::<u64>::null();
        assert_eq!(8, (a + 1).as_usize());
        assert_eq!(0, (a + 1 - 1).as_usize());

        struct Pair(u64, u64);
        let p = RemotePtr::<Pair>::null();
        assert_eq!(16, (p + 1).as_usize());
        let _ = Pair(0, 0);
    }

    #[test]
    fn void_arithmetic_is_byte_granular() {
        let a = RemotePtr::<Void>::new(0x1000);
        assert_eq!(0x1001, (a + 1).as_usize());
        assert_eq!(0x10usize, RemotePtr::<Void>::new(0x1010) - a);
    }

    #[test]
    fn casting_changes_referent() {
        struct Pair(u64, u64);
        let a = RemotePtr::<u64>::new(8);
        let b = RemotePtr::<Pair>::cast(a);
        assert_eq!(16, b.referent_size());
        assert_eq!(8, b.as_usize());
        let _ = Pair(0, 0);
    }

    #[test]
    fn ordering() {
        let c = RemotePtr::<u8>::new(0);
        let d = RemotePtr::<u8>::new(16);
        assert!(c < d);
        assert_ne!(c, d);
    }
}
