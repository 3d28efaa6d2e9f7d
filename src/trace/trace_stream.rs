use crate::{
    remote_ptr::{RemotePtr, Void},
    trace::trace_frame::FrameTime,
    util::get_num_cpus,
};
use libc::pid_t;
use std::{
    cmp::min,
    ffi::{OsStr, OsString},
    path::{Path, PathBuf},
};

/// The layout and versioning of recorded traces. This version number does
/// not track the release version: trace format changes are rare, but every
/// one of them MUST increment it or old traces become unreplayable without
/// the user knowing why.
pub const TRACE_VERSION: u32 = 1;

/// One entry of the independently compressed on-disk streams making up a
/// trace.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(usize)]
pub enum Substream {
    /// Trace frames.
    Events = 0,
    /// Raw-data descriptors: (global_time, rec_tid, addr, size).
    RawDataHeader = 1,
    /// Raw-data payloads, parallel to the headers.
    RawData = 2,
    /// Metadata about files mmap'd during recording.
    Mmaps = 3,
    /// Task creation, exec and exit events.
    Tasks = 4,
    /// Odds and ends: CPU binding, CPUID/XSAVE layout.
    Generic = 5,
}

pub const SUBSTREAM_COUNT: usize = 6;

pub const SUBSTREAMS: [Substream; SUBSTREAM_COUNT] = [
    Substream::Events,
    Substream::RawDataHeader,
    Substream::RawData,
    Substream::Mmaps,
    Substream::Tasks,
    Substream::Generic,
];

pub struct SubstreamData {
    pub name: &'static str,
    pub block_size: usize,
    pub threads: usize,
}

/// Only the raw-data stream is worth compressing on multiple threads; its
/// worker count is the CPU count capped at a small constant.
pub fn substream(s: Substream) -> SubstreamData {
    let threads = if s == Substream::RawData {
        min(8, get_num_cpus())
    } else {
        1
    };
    let (name, block_size) = match s {
        Substream::Events => ("events", 1024 * 1024),
        Substream::RawDataHeader => ("data_header", 1024 * 1024),
        Substream::RawData => ("data", 1024 * 1024),
        Substream::Mmaps => ("mmaps", 64 * 1024),
        Substream::Tasks => ("tasks", 64 * 1024),
        Substream::Generic => ("generic", 64 * 1024),
    };
    SubstreamData {
        name,
        block_size,
        threads,
    }
}

/// Where to obtain the data for a mapped region at replay.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MappedDataSource {
    /// The data was copied into the trace's raw-data stream.
    SourceTrace,
    /// Map from a (possibly cloned or hardlinked) backing file.
    SourceFile,
    /// Zero-fill; the contents are reconstructed some other way.
    SourceZero,
}

impl MappedDataSource {
    pub fn as_u8(self) -> u8 {
        match self {
            MappedDataSource::SourceTrace => 0,
            MappedDataSource::SourceFile => 1,
            MappedDataSource::SourceZero => 2,
        }
    }

    pub fn from_u8(b: u8) -> Option<MappedDataSource> {
        match b {
            0 => Some(MappedDataSource::SourceTrace),
            1 => Some(MappedDataSource::SourceFile),
            2 => Some(MappedDataSource::SourceZero),
            _ => None,
        }
    }
}

/// Where a replayed mapping's bytes come from.
pub struct MappedData {
    pub time: FrameTime,
    pub source: MappedDataSource,
    /// File to map the data from, when source is SourceFile.
    pub filename: OsString,
    pub data_offset_bytes: u64,
    pub file_size_bytes: u64,
}

/// One raw-data record's descriptor.
pub struct RawDataMetadata {
    pub addr: RemotePtr<Void>,
    pub size: usize,
    pub rec_tid: pid_t,
}

/// State shared between the trace writer and reader: the directory and the
/// global-time counter assigned to frames.
pub struct TraceStream {
    /// Directory of the trace files.
    trace_dir: PathBuf,
    /// The next event's global time, starting at 1. Incremented after each
    /// frame by tick_time().
    global_time: FrameTime,
}

impl TraceStream {
    pub fn new(trace_dir: &Path, initial_time: FrameTime) -> TraceStream {
        TraceStream {
            trace_dir: trace_dir.to_path_buf(),
            global_time: initial_time,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.trace_dir
    }

    pub fn time(&self) -> FrameTime {
        self.global_time
    }

    pub fn set_time(&mut self, time: FrameTime) {
        self.global_time = time;
    }

    pub fn tick_time(&mut self) {
        self.global_time += 1;
    }

    pub fn path(&self, s: Substream) -> PathBuf {
        self.trace_dir.join(substream(s).name)
    }

    pub fn version_path(&self) -> PathBuf {
        self.trace_dir.join("version")
    }

    /// File for the data cloned via the tracee's cloned-file-data fd,
    /// keyed by task uid.
    pub fn file_data_clone_file_name(&self, tid: pid_t, serial: u32) -> PathBuf {
        self.trace_dir
            .join(format!("cloned_data_{}_{}", tid, serial))
    }

    pub fn mmaps_block_size() -> usize {
        substream(Substream::Mmaps).block_size
    }
}

pub fn base_file_name(file_name: &OsStr) -> OsString {
    crate::util::basename(file_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substream_table() {
        assert_eq!(substream(Substream::Events).name, "events");
        assert_eq!(substream(Substream::RawData).name, "data");
        assert!(substream(Substream::RawData).threads >= 1);
        assert!(substream(Substream::RawData).threads <= 8);
        assert_eq!(substream(Substream::Events).threads, 1);
        assert_eq!(substream(Substream::Mmaps).block_size, 64 * 1024);
    }

    #[test]
    fn source_byte_roundtrip() {
        for &s in &[
            MappedDataSource::SourceTrace,
            MappedDataSource::SourceFile,
            MappedDataSource::SourceZero,
        ] {
            assert_eq!(MappedDataSource::from_u8(s.as_u8()), Some(s));
        }
        assert_eq!(MappedDataSource::from_u8(9), None);
    }

    #[test]
    fn tick_time_increments() {
        let mut ts = TraceStream::new(Path::new("/tmp/x"), 1);
        assert_eq!(ts.time(), 1);
        ts.tick_time();
        assert_eq!(ts.time(), 2);
    }
}
