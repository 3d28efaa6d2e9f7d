use crate::{
    kernel_supplement::{btrfs_ioctl_clone_range_args, BTRFS_IOC_CLONE, BTRFS_IOC_CLONE_RANGE},
    log::{LogDebug, LogWarn},
    scoped_fd::ScopedFd,
    session::address_space::{mapping::Mapping, resource::Resource},
    trace::{
        compressed_writer::{CompressedWriter, Sync},
        trace_frame::{FrameTime, TraceFrame},
        trace_stream::{
            base_file_name, substream, MappedDataSource, Substream, TraceStream, SUBSTREAMS,
            SUBSTREAM_COUNT, TRACE_VERSION,
        },
        trace_task_event::{TaskEventVariant, TraceTaskEvent},
    },
    util::{
        ensure_dir, find, good_random, latest_trace_symlink, should_copy_mmap_region,
        trace_save_dir, write_all,
    },
};
use libc::pid_t;
use nix::{
    fcntl::OFlag,
    sys::stat::{FileStat, Mode},
};
use std::{
    collections::HashSet,
    ffi::{OsStr, OsString},
    io::Write,
    os::unix::ffi::{OsStrExt, OsStringExt},
    path::{Path, PathBuf},
};

/// How a mapping came to exist, which drives the record-or-reference
/// decision for its bytes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MappingOrigin {
    SyscallMapping,
    /// Just exec()'d an image.
    ExecMapping,
    /// A patch preserved the memory contents.
    PatchMapping,
    RemapMapping,
    /// Engine-internal buffer or trampoline mappings.
    EngineBufferMapping,
}

/// Whether write_mapped_region decided the caller must copy the mapped
/// bytes into the trace's raw-data stream.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RecordInTrace {
    DontRecordInTrace,
    RecordInTrace,
}

/// Writes the six substreams of a new trace directory.
pub struct TraceWriter {
    stream: TraceStream,
    writers: Vec<CompressedWriter>,
    /// Files assumed immutable for the rest of the trace, by
    /// (device, inode).
    files_assumed_immutable: HashSet<(u64, u64)>,
    mmap_count: u32,
    supports_file_data_cloning: bool,
    bind_to_cpu: i32,
    closed: bool,
}

impl TraceWriter {
    /// Create the trace directory, its version file (decimal version, then
    /// a hex UUID on line two), probe for reflink support against the
    /// version file, and record the initial generic data.
    pub fn new(exe_path: &OsStr, bind_to_cpu: i32) -> TraceWriter {
        // Somewhat arbitrarily start the global time from 1.
        let dir = make_trace_dir(exe_path);
        let stream = TraceStream::new(&dir, 1);

        let mut writers = Vec::with_capacity(SUBSTREAM_COUNT);
        for &s in SUBSTREAMS.iter() {
            let info = substream(s);
            writers.push(CompressedWriter::new(
                stream.path(s).as_os_str(),
                info.block_size,
                info.threads,
            ));
        }

        let mut uuid = [0u8; 16];
        good_random(&mut uuid);

        let ver_path = stream.version_path();
        let version_fd = ScopedFd::open_path_with_mode(
            ver_path.as_os_str(),
            OFlag::O_RDWR | OFlag::O_CREAT,
            Mode::S_IRUSR | Mode::S_IWUSR,
        );
        if !version_fd.is_open() {
            fatal!("Unable to create {:?}", ver_path);
        }
        let mut version_contents = format!("{}\n", TRACE_VERSION);
        for b in uuid.iter() {
            version_contents.push_str(&format!("{:02x}", b));
        }
        version_contents.push('\n');
        write_all(version_fd.as_raw(), version_contents.as_bytes());

        // Probe whether this filesystem supports data cloning, which
        // enables the reflink fast path in write_mapped_region.
        let supports_file_data_cloning = {
            let clone_probe_path = dir.join("tmp_clone");
            let clone_fd = ScopedFd::open_path_with_mode(
                clone_probe_path.as_os_str(),
                OFlag::O_WRONLY | OFlag::O_CREAT,
                Mode::S_IRUSR | Mode::S_IWUSR,
            );
            if !clone_fd.is_open() {
                fatal!("Unable to create {:?}", clone_probe_path);
            }
            let clone_args = btrfs_ioctl_clone_range_args {
                src_fd: version_fd.as_raw() as i64,
                src_offset: 0,
                src_length: version_contents.len() as u64,
                dest_offset: 0,
            };
            let ret =
                unsafe { libc::ioctl(clone_fd.as_raw(), BTRFS_IOC_CLONE_RANGE, &clone_args) };
            let _ = std::fs::remove_file(&clone_probe_path);
            ret == 0
        };

        let mut writer = TraceWriter {
            stream,
            writers,
            files_assumed_immutable: HashSet::new(),
            mmap_count: 0,
            supports_file_data_cloning,
            bind_to_cpu,
            closed: false,
        };

        writer.write_generic(&bind_to_cpu.to_le_bytes());
        // The recording CPU's enabled xsave area size; a replay host with
        // a different layout can't interpret the extra-register blocks.
        let xsave_size: u32 = raw_cpuid::CpuId::new()
            .get_extended_state_info()
            .map_or(512, |info| info.xsave_area_size_enabled_features());
        writer.write_generic(&xsave_size.to_le_bytes());
        writer
    }

    pub fn good(&self) -> bool {
        self.writers.iter().all(|w| w.good())
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

    pub fn supports_file_data_cloning(&self) -> bool {
        self.supports_file_data_cloning
    }

    fn writer(&mut self, s: Substream) -> &mut CompressedWriter {
        &mut self.writers[s as usize]
    }

    /// Write the frame and advance global time.
    pub fn write_frame(&mut self, frame: &TraceFrame) {
        let mut buf: Vec<u8> = Vec::with_capacity(64);
        buf.extend_from_slice(&frame.time().to_le_bytes());
        buf.extend_from_slice(&frame.tid().to_le_bytes());
        buf.extend_from_slice(&frame.event().encode().to_bytes());
        buf.extend_from_slice(&frame.ticks().to_le_bytes());
        buf.extend_from_slice(&frame.monotonic_time().to_le_bytes());

        if frame.event().has_exec_info() {
            let regs = frame.regs_ref();
            buf.push(regs.arch().as_u8());
            buf.extend_from_slice(&regs.raw_bytes());

            let extra = frame.extra_regs_ref();
            buf.push(extra.format().as_u8());
            buf.extend_from_slice(&(extra.data_size() as i32).to_le_bytes());
            buf.extend_from_slice(extra.data_bytes());
        }

        let events = self.writer(Substream::Events);
        if events.write_all(&buf).is_err() {
            fatal!("Tried to save {} bytes to the trace, but failed", buf.len());
        }

        self.stream.tick_time();
    }

    /// Task events: {global_time:u64, type:u8, tid:i32} plus per-type tail.
    pub fn write_task_event(&mut self, event: &TraceTaskEvent) {
        let mut buf: Vec<u8> = Vec::with_capacity(32);
        buf.extend_from_slice(&self.stream.time().to_le_bytes());
        buf.push(event.type_tag());
        buf.extend_from_slice(&event.tid().to_le_bytes());
        match event.variant() {
            TaskEventVariant::Clone {
                parent_tid,
                clone_flags,
            } => {
                buf.extend_from_slice(&parent_tid.to_le_bytes());
                buf.extend_from_slice(&clone_flags.to_le_bytes());
            }
            TaskEventVariant::Exec {
                file_name,
                cmd_line,
            } => {
                write_os_string(&mut buf, file_name);
                buf.extend_from_slice(&(cmd_line.len() as u32).to_le_bytes());
                for arg in cmd_line {
                    write_os_string(&mut buf, arg);
                }
            }
            TaskEventVariant::Exit { exit_status } => {
                buf.extend_from_slice(&exit_status.get().to_le_bytes());
            }
        }

        let tasks = self.writer(Substream::Tasks);
        if tasks.write_all(&buf).is_err() {
            fatal!("Failed to write task event");
        }
    }

    /// Raw data: header into `data_header`, payload into `data`.
    pub fn write_raw(&mut self, rec_tid: pid_t, data: &[u8], addr: usize) {
        let time = self.stream.time();
        let mut hdr: Vec<u8> = Vec::with_capacity(28);
        hdr.extend_from_slice(&time.to_le_bytes());
        hdr.extend_from_slice(&rec_tid.to_le_bytes());
        hdr.extend_from_slice(&(addr as u64).to_le_bytes());
        hdr.extend_from_slice(&(data.len() as u64).to_le_bytes());

        if self
            .writer(Substream::RawDataHeader)
            .write_all(&hdr)
            .is_err()
        {
            fatal!("Failed to write raw data header");
        }
        if self.writer(Substream::RawData).write_all(data).is_err() {
            fatal!("Failed to write {} raw data bytes", data.len());
        }
    }

    /// Decide how a tracee mmap will be reproduced at replay and write its
    /// mmaps entry. Returns RecordInTrace when the caller must copy the
    /// mapped bytes into the trace.
    pub fn write_mapped_region(
        &mut self,
        map: &Mapping,
        res: &Resource,
        stat: Option<&FileStat>,
        origin: MappingOrigin,
    ) -> RecordInTrace {
        let mut backing_file_name = OsString::new();
        let fsname = res.fsname().to_os_string();

        let source = if origin == MappingOrigin::RemapMapping
            || origin == MappingOrigin::PatchMapping
        {
            MappedDataSource::SourceZero
        } else if find(fsname.as_bytes(), b"/SYSV") == Some(0) {
            MappedDataSource::SourceTrace
        } else if origin == MappingOrigin::SyscallMapping
            && (res.inode() == 0 || fsname.as_bytes() == b"/dev/zero (deleted)")
        {
            MappedDataSource::SourceZero
        } else if origin == MappingOrigin::EngineBufferMapping {
            MappedDataSource::SourceZero
        } else if !res.is_real_device() {
            MappedDataSource::SourceTrace
        } else {
            let st = stat.expect("file-backed mapping must carry a stat");
            if map.flags().contains(nix::sys::mman::MapFlags::MAP_PRIVATE)
                && self.try_clone_file(&fsname, &mut backing_file_name)
            {
                MappedDataSource::SourceFile
            } else if should_copy_mmap_region(
                &fsname,
                st,
                map.prot().bits(),
                map.flags().bits(),
                true,
            ) && !self
                .files_assumed_immutable
                .contains(&(st.st_dev as u64, st.st_ino as u64))
            {
                MappedDataSource::SourceTrace
            } else {
                // The heuristics determined the file can be referenced in
                // place even if MAP_SHARED. Try cloning anyway to guard
                // against the file changing between record and replay, then
                // fall back to a hard link, then to the original path,
                // marking the inode immutable from here on.
                if !self.try_clone_file(&fsname, &mut backing_file_name) {
                    backing_file_name = self.try_hardlink_file(&fsname);
                    self.files_assumed_immutable
                        .insert((st.st_dev as u64, st.st_ino as u64));
                }
                MappedDataSource::SourceFile
            }
        };

        let (st_mode, st_uid, st_size, st_mtime) = match stat {
            Some(st) => (st.st_mode, st.st_uid, st.st_size, st.st_mtime),
            None => (0, 0, 0, 0),
        };

        let time = self.stream.time();
        let mut buf: Vec<u8> = Vec::with_capacity(128);
        buf.extend_from_slice(&time.to_le_bytes());
        buf.push(source.as_u8());
        buf.extend_from_slice(&(map.start().as_usize() as u64).to_le_bytes());
        buf.extend_from_slice(&(map.end().as_usize() as u64).to_le_bytes());
        write_os_string(&mut buf, &fsname);
        buf.extend_from_slice(&(res.device() as u64).to_le_bytes());
        buf.extend_from_slice(&(res.inode() as u64).to_le_bytes());
        buf.extend_from_slice(&map.prot().bits().to_le_bytes());
        buf.extend_from_slice(&map.flags().bits().to_le_bytes());
        buf.extend_from_slice(&map.file_offset_bytes().to_le_bytes());
        write_os_string(&mut buf, &backing_file_name);
        buf.extend_from_slice(&st_mode.to_le_bytes());
        buf.extend_from_slice(&st_uid.to_le_bytes());
        buf.extend_from_slice(&(st_size as i64).to_le_bytes());
        buf.extend_from_slice(&(st_mtime as i64).to_le_bytes());

        if self.writer(Substream::Mmaps).write_all(&buf).is_err() {
            fatal!("Failed to write mmap entry");
        }

        self.mmap_count += 1;
        if source == MappedDataSource::SourceTrace {
            RecordInTrace::RecordInTrace
        } else {
            RecordInTrace::DontRecordInTrace
        }
    }

    /// Generic records: {global_time:u64, size:u64, payload}.
    pub fn write_generic(&mut self, data: &[u8]) {
        let time = self.stream.time();
        let mut buf: Vec<u8> = Vec::with_capacity(16 + data.len());
        buf.extend_from_slice(&time.to_le_bytes());
        buf.extend_from_slice(&(data.len() as u64).to_le_bytes());
        buf.extend_from_slice(data);
        if self.writer(Substream::Generic).write_all(&buf).is_err() {
            fatal!("Failed to write generic data");
        }
    }

    /// Update the `latest-trace` symlink to this trace. Only one attempt:
    /// if the link reappears after our unlink, a concurrent recorder won
    /// and its link stands.
    pub fn make_latest_trace(&self) {
        let link_name = latest_trace_symlink();
        let _ = nix::unistd::unlink(link_name.as_os_str());
        let target = self.stream.dir().to_path_buf();
        match nix::unistd::symlinkat(target.as_os_str(), None, link_name.as_os_str()) {
            Ok(_) => (),
            Err(nix::errno::Errno::EEXIST) => (),
            Err(e) => fatal!(
                "Failed to update symlink `{:?}' to `{:?}': {:?}",
                link_name,
                target,
                e
            ),
        }
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        for w in self.writers.iter_mut() {
            w.close(Some(Sync::Sync));
        }
        self.closed = true;
    }

    /// Try a reflink-style clone of `file_name` into the trace directory.
    fn try_clone_file(&mut self, file_name: &OsStr, new_name: &mut OsString) -> bool {
        if !self.supports_file_data_cloning {
            return false;
        }

        let base = base_file_name(file_name);
        let mut path = OsString::from(format!("mmap_clone_{}_", self.mmap_count));
        path.push(&base);

        let src = ScopedFd::open_path(file_name, OFlag::O_RDONLY);
        if !src.is_open() {
            return false;
        }
        let dest_path = self.stream.dir().join(PathBuf::from(&path));
        let dest = ScopedFd::open_path_with_mode(
            dest_path.as_os_str(),
            OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_EXCL,
            Mode::S_IRWXU,
        );
        if !dest.is_open() {
            return false;
        }

        let ret = unsafe { libc::ioctl(dest.as_raw(), BTRFS_IOC_CLONE, src.as_raw()) };
        if ret < 0 {
            // Maybe not on the same filesystem, or the filesystem doesn't
            // support clone.
            let _ = std::fs::remove_file(&dest_path);
            return false;
        }

        log!(LogDebug, "Cloned {:?} into trace as {:?}", file_name, path);
        *new_name = path;
        true
    }

    /// Hard-link `file_name` into the trace directory. This avoids replay
    /// failure when the original is deleted or replaced, though not when
    /// overwritten in place. On failure the original name is returned; a
    /// relative result is relative to the trace directory.
    fn try_hardlink_file(&mut self, file_name: &OsStr) -> OsString {
        let base = base_file_name(file_name);
        let mut path = OsString::from(format!("mmap_hardlink_{}_", self.mmap_count));
        path.push(&base);

        let dest = self.stream.dir().join(PathBuf::from(&path));
        let src_c = std::ffi::CString::new(file_name.as_bytes()).unwrap();
        let dst_c = std::ffi::CString::new(dest.as_os_str().as_bytes()).unwrap();
        let ret = unsafe { libc::link(src_c.as_ptr(), dst_c.as_ptr()) };
        if ret < 0 {
            // Maybe a cross-filesystem link attempt.
            log!(LogWarn, "Can't hardlink {:?} into trace", file_name);
            return file_name.to_os_string();
        }
        path
    }
}

impl Drop for TraceWriter {
    fn drop(&mut self) {
        self.close();
    }
}

pub(super) fn write_os_string(buf: &mut Vec<u8>, s: &OsStr) {
    buf.extend_from_slice(&(s.as_bytes().len() as u32).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

/// Find a unique trace directory name under the trace root.
fn make_trace_dir(exe_path: &OsStr) -> PathBuf {
    ensure_dir(&trace_save_dir(), Mode::S_IRWXU);

    let base = base_file_name(exe_path);
    let mut nonce = 0;
    loop {
        let mut name = base.clone();
        name.push(format!("-{}", nonce));
        let dir = trace_save_dir().join(PathBuf::from(OsString::from_vec(
            name.as_bytes().to_vec(),
        )));
        match nix::unistd::mkdir(&dir, Mode::S_IRWXU | Mode::S_IRWXG) {
            Ok(_) => return dir,
            Err(nix::errno::Errno::EEXIST) => {
                nonce += 1;
            }
            Err(e) => fatal!("Unable to create trace directory `{:?}': {:?}", dir, e),
        }
    }
}
