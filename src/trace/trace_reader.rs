use crate::{
    event::{EncodedEvent, Event, ENCODED_EVENT_SIZE},
    extra_registers::{ExtraRegisters, Format},
    kernel_abi::{user_regs_size, SupportedArch},
    kernel_supplement::EX_DATAERR,
    log::LogError,
    registers::Registers,
    remote_ptr::{RemotePtr, Void},
    session::address_space::{
        mapping::Mapping,
        resource::{FileId, PseudoDev, Resource},
    },
    trace::{
        compressed_reader::CompressedReader,
        trace_frame::{FrameTime, TraceFrame},
        trace_stream::{
            MappedData, MappedDataSource, Substream, TraceStream, SUBSTREAMS, SUBSTREAM_COUNT,
            TRACE_VERSION,
        },
        trace_task_event::{TraceTaskEvent, TASK_EVENT_CLONE, TASK_EVENT_EXEC, TASK_EVENT_EXIT},
    },
    util::latest_trace_symlink,
    wait_status::WaitStatus,
};
use libc::pid_t;
use nix::sys::{
    mman::{MapFlags, ProtFlags},
    stat::stat,
};
use std::{
    convert::TryInto,
    ffi::{OsStr, OsString},
    os::unix::ffi::OsStringExt,
    path::{Path, PathBuf},
};

/// Whether read_mapped_region should re-stat SourceFile backings and
/// compare against the recorded metadata.
#[derive(Copy, Clone, Eq, PartialEq)]
pub enum ValidateSourceFile {
    Validate,
    DontValidate,
}

/// Whether a read is constrained to entries recorded at the current global
/// time.
#[derive(Copy, Clone, Eq, PartialEq)]
pub enum TimeConstraint {
    CurrentTimeOnly,
    AnyTime,
}

/// A raw-data record as returned to replay.
pub struct RawData {
    pub data: Vec<u8>,
    pub addr: RemotePtr<Void>,
    pub rec_tid: pid_t,
}

/// Reads back the substreams of a recorded trace.
pub struct TraceReader {
    stream: TraceStream,
    readers: Vec<CompressedReader>,
    bind_to_cpu: i32,
    /// The recording CPU's enabled xsave area size, from the generic
    /// stream's header records.
    xsave_size: u32,
}

impl TraceReader {
    /// Open the trace in `maybe_dir`, or the `latest-trace` symlink when
    /// absent. An unreadable or incompatible version file terminates the
    /// process with EX_DATAERR; there is no meaningful recovery.
    pub fn new(maybe_dir: Option<&Path>) -> TraceReader {
        let dir = match maybe_dir {
            Some(dir) => dir.to_path_buf(),
            None => latest_trace_symlink(),
        };
        // Set global time to 0 so the first tick matches the initial
        // recorded time, 1.
        let stream = TraceStream::new(&dir, 0);

        let version_path = stream.version_path();
        let version_contents = match std::fs::read_to_string(&version_path) {
            Ok(contents) => contents,
            Err(_) => {
                eprintln!(
                    "retrace: error: Version file `{:?}' not found or unreadable.\n\
                     There is no trace there, or the trace is corrupted.",
                    version_path
                );
                std::process::exit(EX_DATAERR);
            }
        };
        let version: u32 = version_contents
            .lines()
            .next()
            .and_then(|line| line.trim().parse().ok())
            .unwrap_or(0);
        if version != TRACE_VERSION {
            eprintln!(
                "retrace: error: Recorded trace `{:?}' has an incompatible version {}; expected {}.\n\
                 Replay the trace with the version that recorded it.",
                dir, version, TRACE_VERSION
            );
            std::process::exit(EX_DATAERR);
        }

        let mut readers = Vec::with_capacity(SUBSTREAM_COUNT);
        for &s in SUBSTREAMS.iter() {
            readers.push(CompressedReader::new(stream.path(s).as_os_str()));
        }

        let mut reader = TraceReader {
            stream,
            readers,
            bind_to_cpu: -1,
            xsave_size: 0,
        };
        reader.read_header_records();
        reader
    }

    fn read_header_records(&mut self) {
        let cpu_bytes = self.read_generic_at_any_time();
        if cpu_bytes.len() == 4 {
            self.bind_to_cpu =
                i32::from_le_bytes([cpu_bytes[0], cpu_bytes[1], cpu_bytes[2], cpu_bytes[3]]);
        }
        let xsave_bytes = self.read_generic_at_any_time();
        if xsave_bytes.len() == 4 {
            self.xsave_size =
                u32::from_le_bytes([xsave_bytes[0], xsave_bytes[1], xsave_bytes[2], xsave_bytes[3]]);
        }
    }

    pub fn good(&self) -> bool {
        self.readers.iter().all(|r| r.good())
    }

    pub fn dir(&self) -> &Path {
        self.stream.dir()
    }

    pub fn time(&self) -> FrameTime {
        self.stream.time()
    }

    pub fn bind_to_cpu(&self) -> i32 {
        self.bind_to_cpu
    }

    pub fn xsave_size(&self) -> u32 {
        self.xsave_size
    }

    fn reader(&mut self, s: Substream) -> &mut CompressedReader {
        &mut self.readers[s as usize]
    }

    pub fn at_end(&self) -> bool {
        self.readers[Substream::Events as usize].at_end()
    }

    /// Read the next frame and advance global time. A truncated events
    /// stream is fatal.
    pub fn read_frame(&mut self) -> TraceFrame {
        let mut basic = [0u8; 8 + 4 + ENCODED_EVENT_SIZE + 8 + 8];
        let events = self.reader(Substream::Events);
        if !events.read(&mut basic) {
            fatal!("Trace truncated: can't read frame header");
        }

        let global_time = u64::from_le_bytes(basic[0..8].try_into().unwrap());
        let tid = i32::from_le_bytes(basic[8..12].try_into().unwrap());
        let mut enc = [0u8; ENCODED_EVENT_SIZE];
        enc.copy_from_slice(&basic[12..12 + ENCODED_EVENT_SIZE]);
        let encoded = EncodedEvent::from_bytes(&enc);
        let ev = match Event::decode(encoded) {
            Some(ev) => ev,
            None => fatal!("Corrupt trace: undecodable event {:?}", encoded),
        };
        let ticks = u64::from_le_bytes(basic[20..28].try_into().unwrap());
        let monotonic_sec = f64::from_le_bytes(basic[28..36].try_into().unwrap());

        let mut frame = TraceFrame::new_with(global_time, tid, ev, ticks, monotonic_sec);

        if frame.event().has_exec_info() {
            let mut arch_byte = [0u8; 1];
            if !self.reader(Substream::Events).read(&mut arch_byte) {
                fatal!("Trace truncated: can't read frame arch");
            }
            let arch = match SupportedArch::from_u8(arch_byte[0]) {
                Some(a) => a,
                None => fatal!("Corrupt trace: unknown arch byte {}", arch_byte[0]),
            };

            let mut raw_regs = vec![0u8; user_regs_size(arch)];
            if !self.reader(Substream::Events).read(&mut raw_regs) {
                fatal!("Trace truncated: can't read registers");
            }
            let mut regs = Registers::new(arch);
            let ok = regs.set_from_raw_bytes(arch, &raw_regs);
            debug_assert!(ok);
            frame.set_regs(regs);

            let mut extra_hdr = [0u8; 5];
            if !self.reader(Substream::Events).read(&mut extra_hdr) {
                fatal!("Trace truncated: can't read extra-register header");
            }
            let extra_format = match Format::from_u8(extra_hdr[0]) {
                Some(f) => f,
                None => fatal!("Corrupt trace: unknown extra-register format"),
            };
            let extra_size =
                i32::from_le_bytes(extra_hdr[1..5].try_into().unwrap());
            let mut extra = ExtraRegisters::new(arch);
            if extra_size > 0 {
                let mut data = vec![0u8; extra_size as usize];
                if !self.reader(Substream::Events).read(&mut data) {
                    fatal!("Trace truncated: can't read extra registers");
                }
                if !extra.set_to_raw_data(arch, extra_format, data) {
                    fatal!("Invalid XSAVE data in trace");
                }
            } else if extra_format != Format::None {
                fatal!("Corrupt trace: empty extra registers with format set");
            }
            frame.set_extra_regs(extra);
        }

        self.stream.tick_time();
        debug_assert_eq!(self.stream.time(), frame.time());
        frame
    }

    /// Two consecutive peeks return the same frame; reader state is
    /// unchanged.
    pub fn peek_frame(&mut self) -> Option<TraceFrame> {
        if self.at_end() {
            return None;
        }
        self.reader(Substream::Events).save_state();
        let saved_time = self.stream.time();
        let frame = self.read_frame();
        self.reader(Substream::Events).restore_state();
        self.stream.set_time(saved_time);
        Some(frame)
    }

    /// Restore the reader to the beginning of the trace.
    pub fn rewind(&mut self) {
        for r in self.readers.iter_mut() {
            r.rewind();
        }
        self.stream.set_time(0);
        debug_assert!(self.good());
        // Skip the header records consumed at construction.
        self.read_header_records();
    }

    /// Read the next raw-data record unconditionally. Dies on a truncated
    /// stream.
    pub fn read_raw_data(&mut self) -> RawData {
        let mut hdr = [0u8; 28];
        if !self.reader(Substream::RawDataHeader).read(&mut hdr) {
            fatal!("Trace truncated: can't read raw-data header");
        }
        let _time = u64::from_le_bytes(hdr[0..8].try_into().unwrap());
        let rec_tid = i32::from_le_bytes(hdr[8..12].try_into().unwrap());
        let addr = u64::from_le_bytes(hdr[12..20].try_into().unwrap());
        let size = u64::from_le_bytes(hdr[20..28].try_into().unwrap());

        let mut data = vec![0u8; size as usize];
        if !self.reader(Substream::RawData).read(&mut data) {
            fatal!("Trace truncated: can't read {} raw-data bytes", size);
        }
        RawData {
            data,
            addr: RemotePtr::new(addr as usize),
            rec_tid,
        }
    }

    /// Peek the next raw-data header; if its time belongs to `frame`,
    /// consume the record into `out` and return true. Otherwise leave the
    /// stream untouched and return false.
    pub fn read_raw_data_for_frame(&mut self, frame: &TraceFrame) -> Option<RawData> {
        if self.readers[Substream::RawDataHeader as usize].at_end() {
            return None;
        }
        let mut time_bytes = [0u8; 8];
        let hdr_reader = self.reader(Substream::RawDataHeader);
        hdr_reader.save_state();
        if !hdr_reader.read(&mut time_bytes) {
            hdr_reader.restore_state();
            return None;
        }
        hdr_reader.restore_state();

        let time = u64::from_le_bytes(time_bytes);
        debug_assert!(time >= frame.time());
        if time > frame.time() {
            return None;
        }
        Some(self.read_raw_data())
    }

    /// Read the next task event. None at end of stream.
    pub fn read_task_event(&mut self) -> Option<TraceTaskEvent> {
        if self.readers[Substream::Tasks as usize].at_end() {
            return None;
        }

        let mut hdr = [0u8; 13];
        if !self.reader(Substream::Tasks).read(&mut hdr) {
            return None;
        }
        let _time = u64::from_le_bytes(hdr[0..8].try_into().unwrap());
        let type_tag = hdr[8];
        let tid = i32::from_le_bytes(hdr[9..13].try_into().unwrap());

        match type_tag {
            TASK_EVENT_CLONE => {
                let mut tail = [0u8; 8];
                if !self.reader(Substream::Tasks).read(&mut tail) {
                    fatal!("Corrupt trace: truncated clone task event");
                }
                let parent_tid = i32::from_le_bytes(tail[0..4].try_into().unwrap());
                let clone_flags = u32::from_le_bytes(tail[4..8].try_into().unwrap());
                Some(TraceTaskEvent::for_clone(tid, parent_tid, clone_flags))
            }
            TASK_EVENT_EXEC => {
                let file_name = self.read_os_string(Substream::Tasks);
                let mut count_bytes = [0u8; 4];
                if !self.reader(Substream::Tasks).read(&mut count_bytes) {
                    fatal!("Corrupt trace: truncated exec task event");
                }
                let count = u32::from_le_bytes(count_bytes);
                let mut cmd_line = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    cmd_line.push(self.read_os_string(Substream::Tasks));
                }
                Some(TraceTaskEvent::for_exec(tid, &file_name, cmd_line))
            }
            TASK_EVENT_EXIT => {
                let mut tail = [0u8; 4];
                if !self.reader(Substream::Tasks).read(&mut tail) {
                    fatal!("Corrupt trace: truncated exit task event");
                }
                let status = i32::from_le_bytes(tail);
                Some(TraceTaskEvent::for_exit(tid, WaitStatus::new(status)))
            }
            _ => fatal!("Corrupt trace: unknown task event type {}", type_tag),
        }
    }

    /// Read the next mmaps entry. With CurrentTimeOnly, an entry recorded
    /// at a later time is left unconsumed and None is returned.
    pub fn read_mapped_region(
        &mut self,
        validate: ValidateSourceFile,
        time_constraint: TimeConstraint,
    ) -> Option<(Mapping, Resource, MappedData)> {
        if self.readers[Substream::Mmaps as usize].at_end() {
            return None;
        }

        if time_constraint == TimeConstraint::CurrentTimeOnly {
            let mut time_bytes = [0u8; 8];
            let mmaps = self.reader(Substream::Mmaps);
            mmaps.save_state();
            if !mmaps.read(&mut time_bytes) {
                mmaps.restore_state();
                return None;
            }
            mmaps.restore_state();
            if u64::from_le_bytes(time_bytes) != self.stream.time() {
                return None;
            }
        }

        let mut fixed = [0u8; 8 + 1 + 8 + 8];
        if !self.reader(Substream::Mmaps).read(&mut fixed) {
            fatal!("Corrupt trace: truncated mmap entry");
        }
        let time = u64::from_le_bytes(fixed[0..8].try_into().unwrap());
        let source = match MappedDataSource::from_u8(fixed[8]) {
            Some(s) => s,
            None => fatal!("Corrupt trace: unknown mmap source {}", fixed[8]),
        };
        let start = u64::from_le_bytes(fixed[9..17].try_into().unwrap());
        let end = u64::from_le_bytes(fixed[17..25].try_into().unwrap());
        let original_file_name = self.read_os_string(Substream::Mmaps);

        let mut tail = [0u8; 8 + 8 + 4 + 4 + 8];
        if !self.reader(Substream::Mmaps).read(&mut tail) {
            fatal!("Corrupt trace: truncated mmap entry");
        }
        let device = u64::from_le_bytes(tail[0..8].try_into().unwrap());
        let inode = u64::from_le_bytes(tail[8..16].try_into().unwrap());
        let prot = i32::from_le_bytes(tail[16..20].try_into().unwrap());
        let flags = i32::from_le_bytes(tail[20..24].try_into().unwrap());
        let file_offset_bytes = u64::from_le_bytes(tail[24..32].try_into().unwrap());

        let mut backing_file_name = self.read_os_string(Substream::Mmaps);

        let mut stat_tail = [0u8; 4 + 4 + 8 + 8];
        if !self.reader(Substream::Mmaps).read(&mut stat_tail) {
            fatal!("Corrupt trace: truncated mmap entry");
        }
        let st_mode = u32::from_le_bytes(stat_tail[0..4].try_into().unwrap());
        let st_uid = u32::from_le_bytes(stat_tail[4..8].try_into().unwrap());
        let file_size = i64::from_le_bytes(stat_tail[8..16].try_into().unwrap());
        let mtime = i64::from_le_bytes(stat_tail[16..24].try_into().unwrap());
        let has_stat_buf = st_mode != 0 || st_uid != 0 || mtime != 0;

        let mut data = MappedData {
            time,
            source,
            filename: OsString::new(),
            data_offset_bytes: 0,
            file_size_bytes: file_size as u64,
        };

        if source == MappedDataSource::SourceFile {
            let is_clone = crate::util::find(
                std::os::unix::ffi::OsStrExt::as_bytes(backing_file_name.as_os_str()),
                b"mmap_clone_",
            ) == Some(0);
            let absolute = std::os::unix::ffi::OsStrExt::as_bytes(backing_file_name.as_os_str())
                .first()
                == Some(&b'/');
            if !absolute {
                backing_file_name = self
                    .stream
                    .dir()
                    .join(PathBuf::from(&backing_file_name))
                    .into_os_string();
            }
            if !is_clone && validate == ValidateSourceFile::Validate && has_stat_buf {
                match stat(backing_file_name.as_os_str()) {
                    Ok(st) => {
                        if st.st_ino != inode || st.st_mode != st_mode || st.st_uid != st_uid
                            || st.st_size != file_size || st.st_mtime != mtime
                        {
                            log!(
                                LogError,
                                "Metadata of {:?} changed: replay divergence likely, but \
                                 continuing anyway",
                                original_file_name
                            );
                        }
                    }
                    Err(_) => {
                        fatal!(
                            "Failed to stat {:?}: replay is impossible",
                            backing_file_name
                        );
                    }
                }
            }
            data.filename = backing_file_name;
            data.data_offset_bytes = file_offset_bytes;
        }

        let mapping = Mapping::new(
            (start as usize).into(),
            (end as usize).into(),
            ProtFlags::from_bits_truncate(prot),
            MapFlags::from_bits_truncate(flags),
            file_offset_bytes,
        );
        let resource = resource_from_trace(&original_file_name, device, inode);
        Some((mapping, resource, data))
    }

    /// Generic records at the current frame time only.
    pub fn read_generic_for_frame(&mut self, frame: &TraceFrame) -> Option<Vec<u8>> {
        if self.readers[Substream::Generic as usize].at_end() {
            return None;
        }
        let mut time_bytes = [0u8; 8];
        let generic = self.reader(Substream::Generic);
        generic.save_state();
        if !generic.read(&mut time_bytes) {
            generic.restore_state();
            return None;
        }
        generic.restore_state();
        if u64::from_le_bytes(time_bytes) > frame.time() {
            return None;
        }
        Some(self.read_generic_at_any_time())
    }

    /// Read the next generic record unconditionally.
    pub fn read_generic_at_any_time(&mut self) -> Vec<u8> {
        let mut hdr = [0u8; 16];
        if !self.reader(Substream::Generic).read(&mut hdr) {
            fatal!("Trace truncated: can't read generic record");
        }
        let size = u64::from_le_bytes(hdr[8..16].try_into().unwrap());
        let mut data = vec![0u8; size as usize];
        if !self.reader(Substream::Generic).read(&mut data) {
            fatal!("Trace truncated: can't read generic payload");
        }
        data
    }

    pub fn uncompressed_bytes(&self) -> u64 {
        self.readers.iter().map(|r| r.uncompressed_bytes()).sum()
    }

    pub fn compressed_bytes(&self) -> u64 {
        self.readers.iter().map(|r| r.compressed_bytes()).sum()
    }

    fn read_os_string(&mut self, s: Substream) -> OsString {
        let mut len_bytes = [0u8; 4];
        if !self.reader(s).read(&mut len_bytes) {
            fatal!("Corrupt trace: truncated string");
        }
        let len = u32::from_le_bytes(len_bytes);
        let mut bytes = vec![0u8; len as usize];
        if !self.reader(s).read(&mut bytes) {
            fatal!("Corrupt trace: truncated string payload");
        }
        OsString::from_vec(bytes)
    }
}

fn resource_from_trace(fsname: &OsStr, device: u64, inode: u64) -> Resource {
    let bytes = std::os::unix::ffi::OsStrExt::as_bytes(fsname);
    if bytes == b"[heap]" {
        return Resource::pseudo(PseudoDev::Heap, fsname);
    }
    if bytes == b"[vdso]" {
        return Resource::pseudo(PseudoDev::Vdso, fsname);
    }
    if crate::util::find(bytes, b"[stack") == Some(0) {
        return Resource::pseudo(PseudoDev::Stack, fsname);
    }
    if device == 0 && inode == 0 && bytes.is_empty() {
        return Resource::anonymous(0);
    }
    Resource::new(FileId::real(device, inode), fsname)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        event::{Event, SyscallState},
        kernel_abi::{SupportedArch, NATIVE_ARCH},
        registers::Registers,
        trace::{
            trace_frame::TraceFrame,
            trace_writer::{MappingOrigin, RecordInTrace, TraceWriter},
        },
        util::monotonic_now_sec,
    };
    use std::ffi::OsStr;

    lazy_static! {
        // The trace root is configured through the environment, which is
        // process-global; serialize the tests that touch it.
        static ref TRACE_DIR_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    }

    struct TraceDirGuard {
        root: std::path::PathBuf,
        _env: std::sync::MutexGuard<'static, ()>,
    }

    impl TraceDirGuard {
        /// Point _RR_TRACE_DIR at a private temp root so tests don't touch
        /// the user's traces.
        fn new(tag: &str) -> TraceDirGuard {
            let env = TRACE_DIR_LOCK
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let mut root = std::env::temp_dir();
            root.push(format!("retrace-trace-test-{}-{}", std::process::id(), tag));
            let _ = std::fs::remove_dir_all(&root);
            std::fs::create_dir_all(&root).unwrap();
            std::env::set_var("_RR_TRACE_DIR", &root);
            TraceDirGuard { root, _env: env }
        }
    }

    impl Drop for TraceDirGuard {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.root);
            std::env::remove_var("_RR_TRACE_DIR");
        }
    }

    fn syscall_entry_frame(time: FrameTime, tid: i32, ticks: u64) -> TraceFrame {
        let ev = Event::new_syscall(
            SupportedArch::X64,
            crate::kernel_abi::x64::WRITE,
            SyscallState::EnteringSyscall,
        );
        let mut frame = TraceFrame::new_with(time, tid, ev, ticks, monotonic_now_sec());
        let mut regs = Registers::new(NATIVE_ARCH);
        regs.set_ip(crate::remote_code_ptr::RemoteCodePtr::from_val(0x401000));
        regs.set_original_syscallno(crate::kernel_abi::x64::WRITE as isize);
        regs.set_arg1(1);
        regs.set_arg2(0x7f0000001000);
        regs.set_arg3(3);
        frame.set_regs(regs);
        frame
    }

    #[test]
    fn frames_roundtrip_with_monotonic_times() {
        let _guard = TraceDirGuard::new("frames");
        let dir;
        {
            let mut w = TraceWriter::new(OsStr::new("testprog"), -1);
            dir = w.dir().to_path_buf();
            for time in 1..=5u64 {
                let frame = syscall_entry_frame(time, 1234, time * 10);
                w.write_frame(&frame);
            }
            w.close();
        }

        let mut r = TraceReader::new(Some(&dir));
        for time in 1..=5u64 {
            assert!(!r.at_end());
            let frame = r.read_frame();
            // global_time values are 1, 2, 3, ... with no gaps.
            assert_eq!(frame.time(), time);
            assert_eq!(frame.tid(), 1234);
            assert_eq!(frame.ticks(), time * 10);
            assert_eq!(frame.regs_ref().arg3(), 3);
        }
        assert!(r.at_end());
    }

    #[test]
    fn peek_is_idempotent_and_rewind_restarts() {
        let _guard = TraceDirGuard::new("peek");
        let dir;
        {
            let mut w = TraceWriter::new(OsStr::new("testprog"), -1);
            dir = w.dir().to_path_buf();
            w.write_frame(&syscall_entry_frame(1, 7, 5));
            w.write_frame(&syscall_entry_frame(2, 7, 6));
            w.close();
        }

        let mut r = TraceReader::new(Some(&dir));
        let p1 = r.peek_frame().unwrap();
        let p2 = r.peek_frame().unwrap();
        assert_eq!(p1.time(), p2.time());
        assert_eq!(p1.ticks(), p2.ticks());

        let f1 = r.read_frame();
        assert_eq!(f1.time(), p1.time());
        let f2 = r.read_frame();
        assert_eq!(f2.time(), 2);

        r.rewind();
        let again = r.read_frame();
        assert_eq!(again.time(), 1);
    }

    #[test]
    fn raw_data_pairs_with_frames() {
        let _guard = TraceDirGuard::new("rawdata");
        let dir;
        {
            let mut w = TraceWriter::new(OsStr::new("testprog"), -1);
            dir = w.dir().to_path_buf();
            // Frame 1 carries "hi\n" at the tracee's buffer address.
            w.write_raw(42, b"hi\n", 0x7f0000001000);
            w.write_frame(&syscall_entry_frame(1, 42, 0));
            w.write_frame(&syscall_entry_frame(2, 42, 0));
            w.close();
        }

        let mut r = TraceReader::new(Some(&dir));
        let f1 = r.read_frame();
        let raw = r.read_raw_data_for_frame(&f1).unwrap();
        assert_eq!(raw.data, b"hi\n");
        assert_eq!(raw.rec_tid, 42);
        assert_eq!(raw.addr.as_usize(), 0x7f0000001000);
        // No second record for this frame.
        assert!(r.read_raw_data_for_frame(&f1).is_none());
    }

    #[test]
    fn task_events_roundtrip() {
        let _guard = TraceDirGuard::new("tasks");
        let dir;
        {
            let mut w = TraceWriter::new(OsStr::new("testprog"), -1);
            dir = w.dir().to_path_buf();
            w.write_task_event(&TraceTaskEvent::for_clone(11, 10, 0x11));
            w.write_task_event(&TraceTaskEvent::for_exec(
                11,
                OsStr::new("/bin/true"),
                vec![std::ffi::OsString::from("true")],
            ));
            w.write_task_event(&TraceTaskEvent::for_exit(
                11,
                WaitStatus::for_exit_code(0),
            ));
            w.close();
        }

        let mut r = TraceReader::new(Some(&dir));
        let ev = r.read_task_event().unwrap();
        assert_eq!(ev.tid(), 11);
        match ev.variant() {
            crate::trace::trace_task_event::TaskEventVariant::Clone {
                parent_tid,
                clone_flags,
            } => {
                assert_eq!(*parent_tid, 10);
                assert_eq!(*clone_flags, 0x11);
            }
            _ => panic!("expected clone"),
        }
        let ev = r.read_task_event().unwrap();
        assert!(ev.is_exec());
        let ev = r.read_task_event().unwrap();
        match ev.variant() {
            crate::trace::trace_task_event::TaskEventVariant::Exit { exit_status } => {
                assert_eq!(exit_status.exit_code(), Some(0));
            }
            _ => panic!("expected exit"),
        }
        assert!(r.read_task_event().is_none());
    }

    #[test]
    fn mmap_entries_roundtrip() {
        use crate::session::address_space::{mapping::Mapping, resource::Resource};
        let _guard = TraceDirGuard::new("mmaps");
        let dir;
        {
            let mut w = TraceWriter::new(OsStr::new("testprog"), -1);
            dir = w.dir().to_path_buf();
            let map = Mapping::new(
                0x10000.into(),
                0x12000.into(),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
                0,
            );
            let res = Resource::anonymous(1);
            // Anonymous syscall mappings are zero-filled at replay.
            let record = w.write_mapped_region(&map, &res, None, MappingOrigin::SyscallMapping);
            assert_eq!(record, RecordInTrace::DontRecordInTrace);
            w.write_frame(&syscall_entry_frame(1, 1, 0));
            w.close();
        }

        let mut r = TraceReader::new(Some(&dir));
        let _frame = r.read_frame();
        let (map, res, data) = r
            .read_mapped_region(ValidateSourceFile::DontValidate, TimeConstraint::AnyTime)
            .unwrap();
        assert_eq!(map.start().as_usize(), 0x10000);
        assert_eq!(map.size(), 0x2000);
        assert_eq!(data.source, MappedDataSource::SourceZero);
        assert!(!res.is_real_device());
    }

    #[test]
    fn generic_records_roundtrip() {
        let _guard = TraceDirGuard::new("generic");
        let dir;
        {
            let mut w = TraceWriter::new(OsStr::new("testprog"), -1);
            dir = w.dir().to_path_buf();
            w.write_generic(b"some blob");
            w.close();
        }
        let mut r = TraceReader::new(Some(&dir));
        // The first generic record (CPU binding) was consumed at open.
        let blob = r.read_generic_at_any_time();
        assert_eq!(blob, b"some blob");
    }
}
