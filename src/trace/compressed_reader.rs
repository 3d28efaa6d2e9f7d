use super::compressed_writer::BlockHeader;
use crate::scoped_fd::ScopedFd;
use brotli_sys::{BrotliDecoderDecompress, BROTLI_DECODER_RESULT_SUCCESS};
use nix::fcntl::OFlag;
use std::{ffi::OsStr, mem::size_of};

/// CompressedReader opens an input file written by CompressedWriter and
/// decompresses it block by block on the reading thread. The fd position is
/// tracked explicitly and all file reads use pread, so saved states are
/// cheap.
pub struct CompressedReader {
    fd: ScopedFd,
    fd_offset: u64,
    error: bool,
    eof: bool,
    buffer: Vec<u8>,
    buffer_read_pos: usize,

    have_saved_state: bool,
    have_saved_buffer: bool,
    saved_fd_offset: u64,
    saved_buffer: Vec<u8>,
    saved_buffer_read_pos: usize,
}

impl CompressedReader {
    pub fn new(filename: &OsStr) -> CompressedReader {
        let fd = ScopedFd::open_path(filename, OFlag::O_CLOEXEC | OFlag::O_RDONLY);
        let error = !fd.is_open();
        CompressedReader {
            fd,
            fd_offset: 0,
            error,
            eof: false,
            buffer: Vec::new(),
            buffer_read_pos: 0,
            have_saved_state: false,
            have_saved_buffer: false,
            saved_fd_offset: 0,
            saved_buffer: Vec::new(),
            saved_buffer_read_pos: 0,
        }
    }

    pub fn good(&self) -> bool {
        !self.error
    }

    pub fn at_end(&self) -> bool {
        if self.buffer_read_pos < self.buffer.len() {
            return false;
        }
        // Probe for a further block without consuming it.
        if self.eof {
            return true;
        }
        let mut header_bytes = [0u8; size_of::<BlockHeader>()];
        match self.pread_exact(self.fd_offset, &mut header_bytes) {
            Ok(()) => false,
            Err(()) => true,
        }
    }

    /// Read exactly data.len() bytes. Returns false (and sets the error
    /// flag) on a truncated stream.
    pub fn read(&mut self, data: &mut [u8]) -> bool {
        let mut offset = 0;
        while offset < data.len() {
            if self.error {
                return false;
            }
            if self.buffer_read_pos == self.buffer.len() {
                if !self.refill_buffer() {
                    return false;
                }
            }
            let amount = std::cmp::min(
                data.len() - offset,
                self.buffer.len() - self.buffer_read_pos,
            );
            data[offset..offset + amount]
                .copy_from_slice(&self.buffer[self.buffer_read_pos..self.buffer_read_pos + amount]);
            self.buffer_read_pos += amount;
            offset += amount;
        }
        true
    }

    pub fn skip(&mut self, size: usize) -> bool {
        let mut buf = vec![0u8; size];
        self.read(&mut buf)
    }

    pub fn rewind(&mut self) {
        debug_assert!(!self.have_saved_state);
        self.fd_offset = 0;
        self.buffer.clear();
        self.buffer_read_pos = 0;
        self.eof = false;
        self.error = !self.fd.is_open();
    }

    pub fn close(&mut self) {
        self.fd.close();
    }

    /// Save the current position. Nested saves are not allowed.
    pub fn save_state(&mut self) {
        debug_assert!(!self.have_saved_state);
        self.have_saved_state = true;
        self.have_saved_buffer = !self.buffer.is_empty();
        self.saved_fd_offset = self.fd_offset;
        if self.have_saved_buffer {
            self.saved_buffer = self.buffer.clone();
            self.saved_buffer_read_pos = self.buffer_read_pos;
        }
    }

    /// Restore the previously saved position.
    pub fn restore_state(&mut self) {
        debug_assert!(self.have_saved_state);
        self.have_saved_state = false;
        if self.saved_fd_offset < self.fd_offset {
            self.eof = false;
        }
        self.fd_offset = self.saved_fd_offset;
        if self.have_saved_buffer {
            self.buffer = std::mem::take(&mut self.saved_buffer);
            self.buffer_read_pos = self.saved_buffer_read_pos;
        } else {
            self.buffer.clear();
            self.buffer_read_pos = 0;
        }
        self.have_saved_buffer = false;
    }

    /// Discard the saved position.
    pub fn discard_state(&mut self) {
        debug_assert!(self.have_saved_state);
        self.have_saved_state = false;
        self.saved_buffer.clear();
        self.have_saved_buffer = false;
    }

    /// Total uncompressed bytes in the stream, independent of the read
    /// position.
    pub fn uncompressed_bytes(&self) -> u64 {
        self.scan_blocks().0
    }

    pub fn compressed_bytes(&self) -> u64 {
        self.scan_blocks().1
    }

    fn scan_blocks(&self) -> (u64, u64) {
        let mut uncompressed: u64 = 0;
        let mut compressed: u64 = 0;
        let mut offset: u64 = 0;
        loop {
            let mut header_bytes = [0u8; size_of::<BlockHeader>()];
            if self.pread_exact_at(offset, &mut header_bytes).is_err() {
                break;
            }
            let header = decode_header(&header_bytes);
            uncompressed += header.uncompressed_length as u64;
            compressed += header.compressed_length as u64;
            offset += (size_of::<BlockHeader>() + header.compressed_length as usize) as u64;
        }
        (uncompressed, compressed)
    }

    fn refill_buffer(&mut self) -> bool {
        let mut header_bytes = [0u8; size_of::<BlockHeader>()];
        if self.pread_exact(self.fd_offset, &mut header_bytes).is_err() {
            self.eof = true;
            self.error = true;
            return false;
        }
        let header = decode_header(&header_bytes);

        let mut compressed = vec![0u8; header.compressed_length as usize];
        if self
            .pread_exact(
                self.fd_offset + size_of::<BlockHeader>() as u64,
                &mut compressed,
            )
            .is_err()
        {
            self.error = true;
            return false;
        }

        self.buffer.resize(header.uncompressed_length as usize, 0);
        self.buffer_read_pos = 0;
        let mut decoded_size: usize = self.buffer.len();
        let result = unsafe {
            BrotliDecoderDecompress(
                compressed.len(),
                compressed.as_ptr(),
                &mut decoded_size,
                self.buffer.as_mut_ptr(),
            )
        };
        if result != BROTLI_DECODER_RESULT_SUCCESS || decoded_size != self.buffer.len() {
            self.error = true;
            return false;
        }

        self.fd_offset += (size_of::<BlockHeader>() + compressed.len()) as u64;
        true
    }

    fn pread_exact(&self, offset: u64, buf: &mut [u8]) -> Result<(), ()> {
        self.pread_exact_at(offset, buf)
    }

    fn pread_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), ()> {
        let mut done = 0;
        while done < buf.len() {
            let ret = unsafe {
                libc::pread64(
                    self.fd.as_raw(),
                    buf[done..].as_mut_ptr() as *mut libc::c_void,
                    buf.len() - done,
                    (offset + done as u64) as i64,
                )
            };
            if ret <= 0 {
                return Err(());
            }
            done += ret as usize;
        }
        Ok(())
    }
}

impl Drop for CompressedReader {
    fn drop(&mut self) {
        self.close()
    }
}

fn decode_header(bytes: &[u8; size_of::<BlockHeader>()]) -> BlockHeader {
    BlockHeader {
        compressed_length: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        uncompressed_length: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::compressed_writer::CompressedWriter;
    use std::io::Write;

    fn temp_path(name: &str) -> std::path::PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("retrace-cw-test-{}-{}", std::process::id(), name));
        let _ = std::fs::remove_file(&p);
        p
    }

    #[test]
    fn write_read_roundtrip() {
        let path = temp_path("roundtrip");
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        {
            let mut w = CompressedWriter::new(path.as_os_str(), 4096, 2);
            w.write_all(&data).unwrap();
            w.close(None);
            assert!(w.good());
        }

        let mut r = CompressedReader::new(path.as_os_str());
        assert!(r.good());
        let mut out = vec![0u8; data.len()];
        assert!(r.read(&mut out));
        assert_eq!(out, data);
        assert!(r.at_end());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn save_restore_state() {
        let path = temp_path("saverestore");
        let data: Vec<u8> = (0..20_000u32).map(|i| (i * 7 % 253) as u8).collect();
        {
            let mut w = CompressedWriter::new(path.as_os_str(), 1024, 1);
            w.write_all(&data).unwrap();
            w.close(None);
        }

        let mut r = CompressedReader::new(path.as_os_str());
        let mut first = vec![0u8; 5000];
        assert!(r.read(&mut first));

        r.save_state();
        let mut second = vec![0u8; 5000];
        assert!(r.read(&mut second));
        r.restore_state();

        let mut second_again = vec![0u8; 5000];
        assert!(r.read(&mut second_again));
        assert_eq!(second, second_again);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn rewind_restarts_stream() {
        let path = temp_path("rewind");
        let data = b"hello hello hello hello".to_vec();
        {
            let mut w = CompressedWriter::new(path.as_os_str(), 8, 1);
            w.write_all(&data).unwrap();
            w.close(None);
        }

        let mut r = CompressedReader::new(path.as_os_str());
        let mut out = vec![0u8; data.len()];
        assert!(r.read(&mut out));
        r.rewind();
        let mut out2 = vec![0u8; data.len()];
        assert!(r.read(&mut out2));
        assert_eq!(out, out2);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn truncated_stream_is_an_error() {
        let path = temp_path("truncated");
        {
            let mut w = CompressedWriter::new(path.as_os_str(), 1024, 1);
            w.write_all(b"some data").unwrap();
            w.close(None);
        }
        let mut r = CompressedReader::new(path.as_os_str());
        let mut out = vec![0u8; 100];
        // Asking for more than was written fails and flags the reader.
        assert!(!r.read(&mut out));
        assert!(!r.good());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn byte_counts() {
        let path = temp_path("counts");
        let data = vec![42u8; 10_000];
        {
            let mut w = CompressedWriter::new(path.as_os_str(), 1024, 1);
            w.write_all(&data).unwrap();
            w.close(None);
        }
        let r = CompressedReader::new(path.as_os_str());
        assert_eq!(r.uncompressed_bytes(), data.len() as u64);
        // Constant data compresses well.
        assert!(r.compressed_bytes() < data.len() as u64);
        let _ = std::fs::remove_file(&path);
    }
}
