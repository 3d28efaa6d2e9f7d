use crate::kernel_metadata::errno_name;
use nix::errno::errno;
use std::{
    collections::HashMap,
    env,
    fs::{File, OpenOptions},
    io,
    io::{BufWriter, Result, Write},
    path::Path,
    sync::{Mutex, MutexGuard},
};

#[derive(Copy, Clone, Eq, PartialEq, PartialOrd)]
pub enum LogLevel {
    LogFatal,
    LogError,
    LogWarn,
    LogInfo,
    LogDebug,
}

pub use LogLevel::*;

#[derive(Clone)]
struct LogModule {
    name: String,
    level: LogLevel,
}

struct LogGlobals {
    level_map: HashMap<String, LogLevel>,
    module_cache: HashMap<String, LogModule>,
    /// Possibly buffered.
    log_file: Box<dyn Write + Send>,
    default_level: LogLevel,
}

lazy_static! {
    static ref LOG_GLOBALS: Mutex<LogGlobals> = {
        let mut f: Box<dyn Write + Send> = if let Ok(filename) = env::var("RETRACE_LOG_FILE") {
            Box::new(File::create(&filename).unwrap())
        } else if let Ok(filename) = env::var("RETRACE_APPEND_LOG_FILE") {
            Box::new(
                OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(&filename)
                    .unwrap(),
            )
        } else {
            Box::new(io::stderr())
        };

        if let Ok(buf_size) = env::var("RETRACE_LOG_BUFFER") {
            if let Ok(size) = buf_size.parse::<usize>() {
                f = Box::new(BufWriter::with_capacity(size, f));
            }
        }

        let mut level_map: HashMap<String, LogLevel> = HashMap::new();
        let mut default_level = LogWarn;
        if let Ok(spec) = env::var("RETRACE_LOG") {
            for clause in spec.split(',') {
                let mut it = clause.splitn(2, ':');
                match (it.next(), it.next()) {
                    (Some(module), Some(level)) => {
                        let level = level_from_name(level);
                        if module == "all" {
                            default_level = level;
                        } else {
                            level_map.insert(module.to_owned(), level);
                        }
                    }
                    _ => (),
                }
            }
        }

        Mutex::new(LogGlobals {
            level_map,
            module_cache: HashMap::new(),
            log_file: f,
            default_level,
        })
    };
}

fn level_from_name(name: &str) -> LogLevel {
    match name {
        "fatal" => LogFatal,
        "error" => LogError,
        "warn" => LogWarn,
        "info" => LogInfo,
        "debug" => LogDebug,
        _ => LogWarn,
    }
}

fn log_name(level: LogLevel) -> &'static str {
    match level {
        LogFatal => "FATAL",
        LogError => "ERROR",
        LogWarn => "WARN",
        LogInfo => "INFO",
        LogDebug => "DEBUG",
    }
}

/// Filenames are case sensitive on Linux; don't lowercase here.
fn filename_to_module_name(filename: &str) -> String {
    let path = Path::new(filename);
    path.file_stem().unwrap().to_string_lossy().to_string()
}

fn get_log_module(filename: &str, l: &mut MutexGuard<LogGlobals>) -> LogModule {
    if let Some(m) = l.module_cache.get(filename) {
        return m.to_owned();
    }
    let name = filename_to_module_name(filename);
    let level = *l.level_map.get(&name).unwrap_or(&l.default_level);
    let m = LogModule { name, level };
    l.module_cache.insert(filename.to_owned(), m.clone());
    m
}

/// Collects one log line and emits it, newline terminated, on drop.
pub struct NewLineTerminatingOstream {
    enabled: bool,
    message: Vec<u8>,
    lock: MutexGuard<'static, LogGlobals>,
}

impl NewLineTerminatingOstream {
    fn new(
        level: LogLevel,
        filename: &str,
        line: u32,
        module_path: &str,
        always_enabled: bool,
    ) -> NewLineTerminatingOstream {
        let mut lock = LOG_GLOBALS.lock().unwrap();
        let m = get_log_module(filename, &mut lock);
        let enabled = always_enabled || level <= m.level;
        let mut this = NewLineTerminatingOstream {
            message: Vec::new(),
            enabled,
            lock,
        };
        if enabled {
            if level == LogDebug {
                write!(this, "[{}] ", m.name).unwrap();
            } else {
                write_prefix(&mut this, level, filename, line, module_path);
            }
        }

        this
    }
}

impl Drop for NewLineTerminatingOstream {
    fn drop(&mut self) {
        if self.enabled {
            self.write(b"\n").unwrap();
            self.flush().unwrap();
        }
    }
}

impl Write for NewLineTerminatingOstream {
    fn flush(&mut self) -> Result<()> {
        if !self.message.is_empty() && self.enabled {
            self.lock.log_file.write_all(&self.message)?;
            self.lock.log_file.flush()?;
        }
        self.message.clear();
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.enabled {
            self.message.extend_from_slice(buf);
        }
        // Pretend the bytes were written even when disabled, otherwise
        // the write!() machinery reports WriteZero.
        Ok(buf.len())
    }
}

pub fn write_prefix(
    stream: &mut dyn Write,
    level: LogLevel,
    filename: &str,
    line: u32,
    module_path: &str,
) {
    write!(stream, "[{} ", log_name(level)).unwrap();
    if level <= LogError {
        write!(stream, "{}:{} ", filename, line).unwrap();
    }
    write!(stream, "{}", module_path).unwrap();
    let err = errno();
    if level <= LogWarn && err != 0 {
        write!(stream, " errno: {}", errno_name(err)).unwrap();
    }
    write!(stream, "] ").unwrap();
}

pub fn log(
    log_level: LogLevel,
    filename: &str,
    line: u32,
    module_path: &str,
    always_enabled: bool,
) -> NewLineTerminatingOstream {
    NewLineTerminatingOstream::new(log_level, filename, line, module_path, always_enabled)
}

pub fn notifying_abort(bt: backtrace::Backtrace) -> ! {
    eprintln!("{:?}", bt);
    std::process::abort();
}

/// Write a line to the log file (stderr when no log file was configured),
/// then continue normally.
macro_rules! log {
    ($log_level:expr, $($args:tt)+) => {
        {
            use std::io::Write;
            let mut stream = crate::log::log(
                $log_level,
                file!(),
                line!(),
                module_path!(),
                false
            );
            write!(stream, $($args)+).unwrap()
        }
    };
}

/// Log at Fatal, dump a backtrace and abort.
macro_rules! fatal {
    ($($args:tt)+) => {
        {
            {
                use std::io::Write;
                use crate::log::LogFatal;
                let mut stream = crate::log::log(
                    LogFatal,
                    file!(),
                    line!(),
                    module_path!(),
                    true
                );
                write!(stream, $($args)+).unwrap();
            }
            crate::log::notifying_abort(backtrace::Backtrace::new())
        }
    };
}

/// A fatal diagnostic addressed to the user rather than a developer: no
/// backtrace, stable exit.
macro_rules! clean_fatal {
    ($($args:tt)+) => {
        {
            use std::io::Write;
            use crate::log::LogFatal;
            {
                let mut stream = crate::log::log(
                    LogFatal,
                    file!(),
                    line!(),
                    module_path!(),
                    true
                );
                write!(stream, $($args)+).unwrap();
            }
            std::process::exit(1)
        }
    };
}

/// Assertion carrying tracee context. `$t` must offer `tid` and `status()`.
macro_rules! ed_assert {
    ($t:expr, $cond:expr) => {
        if !$cond {
            fatal!(
                "Assertion `{}' failed to hold (task {} at {})",
                stringify!($cond),
                $t.tid,
                $t.status()
            )
        }
    };
    ($t:expr, $cond:expr, $($args:tt)+) => {
        if !$cond {
            use std::io::Write;
            let mut stream = crate::log::log(
                crate::log::LogFatal,
                file!(),
                line!(),
                module_path!(),
                true
            );
            write!(stream, "Assertion `{}' failed to hold (task {} at {}): ",
                stringify!($cond), $t.tid, $t.status()).unwrap();
            write!(stream, $($args)+).unwrap();
            drop(stream);
            crate::log::notifying_abort(backtrace::Backtrace::new())
        }
    };
}

macro_rules! ed_assert_eq {
    ($t:expr, $lhs:expr, $rhs:expr) => {
        ed_assert!($t, $lhs == $rhs)
    };
    ($t:expr, $lhs:expr, $rhs:expr, $($args:tt)+) => {
        ed_assert!($t, $lhs == $rhs, $($args)+)
    };
}
