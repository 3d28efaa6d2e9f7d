use crate::wait_status::WaitStatus;
use libc::pid_t;
use std::ffi::{OsStr, OsString};

/// Wire type tags for the tasks substream:
/// {global_time:u64, type:u8, tid:i32} plus a per-type tail.
pub const TASK_EVENT_CLONE: u8 = 0;
pub const TASK_EVENT_EXEC: u8 = 1;
pub const TASK_EVENT_EXIT: u8 = 2;

#[derive(Clone)]
pub enum TaskEventVariant {
    /// Created by clone(2), fork(2) or vfork(2).
    Clone {
        parent_tid: pid_t,
        clone_flags: u32,
    },
    Exec {
        file_name: OsString,
        cmd_line: Vec<OsString>,
    },
    Exit {
        exit_status: WaitStatus,
    },
}

/// One entry of the tasks substream.
#[derive(Clone)]
pub struct TraceTaskEvent {
    tid_: pid_t,
    variant: TaskEventVariant,
}

impl TraceTaskEvent {
    pub fn for_clone(tid: pid_t, parent_tid: pid_t, clone_flags: u32) -> TraceTaskEvent {
        TraceTaskEvent {
            tid_: tid,
            variant: TaskEventVariant::Clone {
                parent_tid,
                clone_flags,
            },
        }
    }

    pub fn for_exec(tid: pid_t, file_name: &OsStr, cmd_line: Vec<OsString>) -> TraceTaskEvent {
        TraceTaskEvent {
            tid_: tid,
            variant: TaskEventVariant::Exec {
                file_name: file_name.to_os_string(),
                cmd_line,
            },
        }
    }

    pub fn for_exit(tid: pid_t, exit_status: WaitStatus) -> TraceTaskEvent {
        TraceTaskEvent {
            tid_: tid,
            variant: TaskEventVariant::Exit { exit_status },
        }
    }

    pub fn tid(&self) -> pid_t {
        self.tid_
    }

    pub fn variant(&self) -> &TaskEventVariant {
        &self.variant
    }

    pub fn type_tag(&self) -> u8 {
        match self.variant {
            TaskEventVariant::Clone { .. } => TASK_EVENT_CLONE,
            TaskEventVariant::Exec { .. } => TASK_EVENT_EXEC,
            TaskEventVariant::Exit { .. } => TASK_EVENT_EXIT,
        }
    }

    pub fn is_exec(&self) -> bool {
        matches!(self.variant, TaskEventVariant::Exec { .. })
    }
}
