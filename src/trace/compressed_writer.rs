use crate::{scoped_fd::ScopedFd, util::write_all};
use brotli_sys::{
    BrotliEncoderCompressStream, BrotliEncoderCreateInstance, BrotliEncoderDestroyInstance,
    BrotliEncoderSetParameter, BROTLI_OPERATION_FINISH, BROTLI_OPERATION_PROCESS,
    BROTLI_PARAM_QUALITY,
};
use nix::{fcntl::OFlag, sys::stat::Mode, unistd::fsync};
use std::{
    cmp::min,
    ffi::OsStr,
    io::{Error, ErrorKind, Result, Write},
    mem::size_of,
    ptr,
    ptr::copy_nonoverlapping,
    slice,
    sync::{Arc, Condvar, Mutex},
    thread,
    thread::JoinHandle,
};

/// See http://robert.ocallahan.org/2017/07/selecting-compression-algorithm-for-rr.html
const BROTLI_LEVEL: u32 = 5;

#[derive(Copy, Clone, Eq, PartialEq)]
pub enum Sync {
    DontSync,
    Sync,
}

#[derive(Copy, Clone, Eq, PartialEq)]
enum WaitFlag {
    Wait,
    NoWait,
}

/// Each block of compressed data is preceded by these two words.
#[derive(Copy, Clone, Default)]
#[repr(C)]
pub struct BlockHeader {
    pub compressed_length: u32,
    pub uncompressed_length: u32,
}

/// CompressedWriter opens an output file and writes compressed blocks to
/// it. Blocks of `block_size` bytes are compressed independently with
/// brotli and written preceded by a BlockHeader.
///
/// Multiple threads perform compression and are responsible for the actual
/// file writes. The thread that creates the CompressedWriter is the
/// producer thread and must be the only caller of write(); it may block in
/// write() while its data is being compressed.
pub struct CompressedWriter {
    /// Immutable while threads are running.
    fd: ScopedFd,
    block_size: usize,
    mutex: Arc<Mutex<CompressorState>>,
    cond_var: Arc<Condvar>,
    threads: Vec<JoinHandle<()>>,
    /// Producer-only positions in the stream.
    producer_reserved_pos: u64,
    producer_reserved_write_pos: u64,
    producer_reserved_upto_pos: u64,
    error: bool,
    /// The shared ring buffer. The producer writes ahead of
    /// next_thread_end_pos; compressor threads read behind it.
    buffer: Vec<u8>,
}

struct CompressorState {
    /// Stream position each thread is working on; None when idle.
    thread_pos: Vec<Option<u64>>,
    /// Stream position of data to hand to the next thread.
    next_thread_pos: u64,
    /// Stream position of the end of data ready to dispatch.
    next_thread_end_pos: u64,
    closing: bool,
    write_error: bool,
}

struct SharedBuf(*const u8, usize);

unsafe impl Send for SharedBuf {}

impl CompressedWriter {
    pub fn new(filename: &OsStr, block_size: usize, num_threads: usize) -> CompressedWriter {
        let fd = ScopedFd::open_path_with_mode(
            filename,
            OFlag::O_CLOEXEC
                | OFlag::O_WRONLY
                | OFlag::O_CREAT
                | OFlag::O_EXCL
                | OFlag::O_LARGEFILE,
            Mode::S_IRUSR | Mode::S_IWUSR,
        );
        let buffer = vec![0u8; block_size * (num_threads + 2)];

        let state = CompressorState {
            thread_pos: vec![None; num_threads],
            next_thread_pos: 0,
            next_thread_end_pos: 0,
            closing: false,
            write_error: false,
        };

        let mut cw = CompressedWriter {
            error: !fd.is_open(),
            fd,
            block_size,
            mutex: Arc::new(Mutex::new(state)),
            cond_var: Arc::new(Condvar::new()),
            threads: Vec::new(),
            producer_reserved_pos: 0,
            producer_reserved_write_pos: 0,
            producer_reserved_upto_pos: 0,
            buffer,
        };

        if cw.error {
            return cw;
        }

        // Hold the lock so threads don't run until initialization is done.
        {
            let _guard = cw.mutex.lock().unwrap();
            for i in 0..num_threads {
                let mutex = cw.mutex.clone();
                let cond_var = cw.cond_var.clone();
                let shared_buffer = SharedBuf(cw.buffer.as_ptr(), cw.buffer.len());
                let fd_raw = cw.fd.as_raw();
                cw.threads.push(
                    thread::Builder::new()
                        .name(format!("compress{}", i))
                        .spawn(move || {
                            compressor_thread(
                                i,
                                block_size,
                                shared_buffer,
                                fd_raw,
                                mutex,
                                cond_var,
                            )
                        })
                        .unwrap(),
                );
            }
        }

        cw
    }

    pub fn good(&self) -> bool {
        !self.error
    }

    pub fn close(&mut self, maybe_sync: Option<Sync>) {
        if !self.fd.is_open() {
            return;
        }

        self.update_reservation(WaitFlag::NoWait);

        {
            let mut g = self.mutex.lock().unwrap();
            g.closing = true;
        }
        self.cond_var.notify_all();

        while let Some(handle) = self.threads.pop() {
            handle.join().unwrap();
        }

        if maybe_sync.unwrap_or(Sync::DontSync) == Sync::Sync && fsync(self.fd.as_raw()).is_err() {
            self.error = true;
        }

        if self.mutex.lock().unwrap().write_error {
            self.error = true;
        }

        self.fd.close();
    }

    /// Hand buffered data to the compressor threads and refresh the
    /// producer's view of how far ahead it may write.
    fn update_reservation(&mut self, wait_flag: WaitFlag) {
        let mut g = self.mutex.lock().unwrap();

        g.next_thread_end_pos = self.producer_reserved_write_pos;
        self.producer_reserved_pos = self.producer_reserved_write_pos;
        // Wake up threads that might be waiting to consume data.
        self.cond_var.notify_all();

        while !self.error {
            if g.write_error {
                self.error = true;
                break;
            }

            let mut completed_pos = g.next_thread_pos;
            for pos in g.thread_pos.iter().flatten() {
                completed_pos = min(completed_pos, *pos);
            }

            self.producer_reserved_upto_pos = completed_pos + self.buffer.len() as u64;
            if self.producer_reserved_pos < self.producer_reserved_upto_pos
                || wait_flag == WaitFlag::NoWait
            {
                break;
            }

            g = self.cond_var.wait(g).unwrap();
        }
    }
}

fn compressor_thread(
    thread_index: usize,
    block_size: usize,
    shared_buffer: SharedBuf,
    fd_raw: i32,
    mutex: Arc<Mutex<CompressorState>>,
    cond_var: Arc<Condvar>,
) {
    let buffer = unsafe { slice::from_raw_parts(shared_buffer.0, shared_buffer.1) };
    // Slop for incompressible data.
    let mut outputbuf = vec![0u8; (block_size as f64 * 1.1) as usize + size_of::<BlockHeader>()];
    let mut header = BlockHeader::default();

    let mut g = mutex.lock().unwrap();
    loop {
        if !g.write_error
            && g.next_thread_pos < g.next_thread_end_pos
            && (g.closing || g.next_thread_pos + block_size as u64 <= g.next_thread_end_pos)
        {
            g.thread_pos[thread_index] = Some(g.next_thread_pos);
            g.next_thread_pos = min(g.next_thread_end_pos, g.next_thread_pos + block_size as u64);
            // uncompressed_length <= block_size, so it fits easily.
            header.uncompressed_length =
                (g.next_thread_pos - g.thread_pos[thread_index].unwrap()) as u32;

            let offset_in_input = g.thread_pos[thread_index].unwrap();
            drop(g);
            let compressed_length = unsafe {
                do_compress(
                    buffer,
                    offset_in_input,
                    header.uncompressed_length as usize,
                    &mut outputbuf[size_of::<BlockHeader>()..],
                )
            };
            g = mutex.lock().unwrap();

            if compressed_length == 0 {
                g.write_error = true;
            } else {
                header.compressed_length = compressed_length as u32;
            }

            unsafe {
                copy_nonoverlapping(
                    &header as *const BlockHeader as *const u8,
                    outputbuf.as_mut_ptr(),
                    size_of::<BlockHeader>(),
                );
            }

            // Wait until we're the next thread that needs to write.
            while !g.write_error {
                let my_pos = g.thread_pos[thread_index].unwrap();
                let other_thread_writes_first = g
                    .thread_pos
                    .iter()
                    .flatten()
                    .any(|&pos| pos < my_pos);
                if !other_thread_writes_first {
                    break;
                }
                g = cond_var.wait(g).unwrap();
            }

            if !g.write_error {
                drop(g);
                write_all(
                    fd_raw,
                    &outputbuf[0..size_of::<BlockHeader>() + header.compressed_length as usize],
                );
                g = mutex.lock().unwrap();
            }

            g.thread_pos[thread_index] = None;
            // Broadcast: the producer or a compressor waiting to write may
            // need waking.
            cond_var.notify_all();
            continue;
        }

        if g.closing && (g.write_error || g.next_thread_pos == g.next_thread_end_pos) {
            break;
        }

        g = cond_var.wait(g).unwrap();
    }
}

impl Drop for CompressedWriter {
    fn drop(&mut self) {
        self.close(None);
    }
}

impl Write for CompressedWriter {
    fn write(&mut self, data_to_write: &[u8]) -> Result<usize> {
        let mut data = data_to_write;
        while !self.error && !data.is_empty() {
            let reservation_size =
                (self.producer_reserved_upto_pos - self.producer_reserved_write_pos) as usize;
            if reservation_size == 0 {
                self.update_reservation(WaitFlag::Wait);
                continue;
            }
            let buf_offset =
                (self.producer_reserved_write_pos % self.buffer.len() as u64) as usize;
            let amount = min(
                self.buffer.len() - buf_offset,
                min(reservation_size, data.len()),
            );
            self.buffer[buf_offset..buf_offset + amount].copy_from_slice(&data[..amount]);
            self.producer_reserved_write_pos += amount as u64;
            data = &data[amount..];
        }

        if !self.error
            && self.producer_reserved_write_pos - self.producer_reserved_pos
                >= (self.buffer.len() / 2) as u64
        {
            self.update_reservation(WaitFlag::NoWait);
        }

        if self.error {
            return Err(Error::new(ErrorKind::Other, "CompressedWriter error"));
        }
        Ok(data_to_write.len())
    }

    fn flush(&mut self) -> Result<()> {
        // Not buffered from the caller's point of view.
        Ok(())
    }
}

unsafe fn do_compress(
    shared_buf: &[u8],
    mut stream_offset: u64,
    mut uncompressed_len: usize,
    output_buf: &mut [u8],
) -> usize {
    let state = BrotliEncoderCreateInstance(None, None, ptr::null_mut());
    if state.is_null() {
        fatal!("BrotliEncoderCreateInstance failed");
    }
    if 0 == BrotliEncoderSetParameter(state, BROTLI_PARAM_QUALITY, BROTLI_LEVEL) {
        fatal!("Brotli initialization failed");
    }

    let mut total_out: usize = 0;
    let mut avail_out: usize = output_buf.len();
    let mut next_out: *mut u8 = output_buf.as_mut_ptr();
    while uncompressed_len > 0 {
        // The input may wrap around the ring buffer.
        let buf_offset = (stream_offset % shared_buf.len() as u64) as usize;
        let mut avail_in: usize = min(uncompressed_len, shared_buf.len() - buf_offset);
        let mut next_in: *const u8 = shared_buf[buf_offset..].as_ptr();
        let before = avail_in;
        if 0 == BrotliEncoderCompressStream(
            state,
            BROTLI_OPERATION_PROCESS,
            &mut avail_in,
            &mut next_in,
            &mut avail_out,
            &mut next_out,
            &mut total_out,
        ) {
            fatal!("Brotli compression failed");
        }
        let consumed = before - avail_in;
        stream_offset += consumed as u64;
        uncompressed_len -= consumed;
    }
    let mut zero: usize = 0;
    let mut null_in: *const u8 = ptr::null();
    if 0 == BrotliEncoderCompressStream(
        state,
        BROTLI_OPERATION_FINISH,
        &mut zero,
        &mut null_in,
        &mut avail_out,
        &mut next_out,
        &mut total_out,
    ) {
        fatal!("Brotli compression failed");
    }

    BrotliEncoderDestroyInstance(state);
    total_out
}
