use crate::{
    log::LogDebug,
    session::SessionSharedWeakPtr,
    task_set::TaskSet,
    taskish_uid::TaskGroupUid,
    wait_status::WaitStatus,
};
use libc::pid_t;
use std::{
    cell::RefCell,
    rc::{Rc, Weak},
};

pub type TaskGroupSharedPtr = Rc<RefCell<TaskGroup>>;
pub type TaskGroupSharedWeakPtr = Weak<RefCell<TaskGroup>>;

/// The set of Tasks sharing a tgid: the original group leader (the fork
/// child that became the ancestor of the other threads) and its threads.
/// Each constituent task owns a reference.
pub struct TaskGroup {
    tasks: TaskSet,
    pub tgid: pid_t,

    pub exit_status: WaitStatus,

    /// Marked when a fatal signal was delivered to any member: reaping
    /// logic then skips waitpid synchronization that could deadlock on
    /// futex joins.
    pub unstable: bool,

    /// Whether this group has execed.
    pub execed: bool,

    session_: SessionSharedWeakPtr,
    serial: u32,
}

impl TaskGroup {
    pub fn new(session: SessionSharedWeakPtr, tgid: pid_t, serial: u32) -> TaskGroupSharedPtr {
        Rc::new(RefCell::new(TaskGroup {
            tasks: TaskSet::new(),
            tgid,
            exit_status: WaitStatus::default(),
            unstable: false,
            execed: false,
            session_: session,
            serial,
        }))
    }

    pub fn task_set(&self) -> &TaskSet {
        &self.tasks
    }

    pub fn tguid(&self) -> TaskGroupUid {
        TaskGroupUid::new_with(self.tgid, self.serial)
    }

    pub fn session_weak(&self) -> &SessionSharedWeakPtr {
        &self.session_
    }

    /// Mark the group as unstable: a fatal signal is in flight to every
    /// member, so their exits cannot be synchronized with.
    pub fn destabilize(&mut self) {
        log!(LogDebug, "destabilizing task group {}", self.tgid);
        self.unstable = true;
    }
}
