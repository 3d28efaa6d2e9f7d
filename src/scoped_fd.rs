use nix::{
    fcntl::{open, OFlag},
    sys::stat::Mode,
    unistd::close,
    NixPath,
};
use std::{
    fmt::{self, Display, Formatter},
    os::unix::io::RawFd,
};

/// An owned fd, closed on drop. -1 means "not open".
pub struct ScopedFd {
    fd: RawFd,
}

impl ScopedFd {
    pub fn new() -> Self {
        ScopedFd { fd: -1 }
    }

    pub fn from_raw(fd: RawFd) -> Self {
        ScopedFd { fd }
    }

    pub fn open_path<P: ?Sized + NixPath>(path: &P, oflag: OFlag) -> Self {
        let fd = open(path, oflag, Mode::empty()).unwrap_or(-1);
        ScopedFd { fd }
    }

    pub fn open_path_with_mode<P: ?Sized + NixPath>(path: &P, oflag: OFlag, mode: Mode) -> Self {
        let fd = open(path, oflag, mode).unwrap_or(-1);
        ScopedFd { fd }
    }

    pub fn close(&mut self) {
        if self.fd >= 0 {
            // Nothing useful to do on a failed close of an fd we own.
            let _ = close(self.fd);
        }
        self.fd = -1;
    }

    pub fn is_open(&self) -> bool {
        self.fd >= 0
    }

    pub fn as_raw(&self) -> RawFd {
        self.fd
    }

    /// Relinquish ownership and return the raw fd.
    pub fn extract(&mut self) -> RawFd {
        let result = self.fd;
        self.fd = -1;
        result
    }
}

impl Default for ScopedFd {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ScopedFd {
    fn drop(&mut self) {
        self.close()
    }
}

impl Display for ScopedFd {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "fd({})", self.fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_by_default() {
        let fd = ScopedFd::new();
        assert!(!fd.is_open());
        assert_eq!(-1, fd.as_raw());
    }

    #[test]
    fn open_and_extract() {
        let mut fd = ScopedFd::open_path("/dev/null", OFlag::O_RDONLY);
        assert!(fd.is_open());
        let raw = fd.extract();
        assert!(raw >= 0);
        assert!(!fd.is_open());
        let _ = nix::unistd::close(raw);
    }

    #[test]
    fn nonexistent_path_is_not_open() {
        let fd = ScopedFd::open_path("/nonexistent/retrace-test", OFlag::O_RDONLY);
        assert!(!fd.is_open());
    }
}
