use libc::pid_t;
use std::marker::PhantomData;

/// An ID unique within a Session (and stable across ReplaySessions of the
/// same trace), used by Tasks, TaskGroups and AddressSpaces. Needed because
/// tids can be recycled during a long-running session.
pub struct TaskishUid<T> {
    tid_: pid_t,
    serial_: u32,
    phantom: PhantomData<T>,
}

impl<T> TaskishUid<T> {
    pub fn new() -> TaskishUid<T> {
        TaskishUid {
            tid_: 0,
            serial_: 0,
            phantom: PhantomData,
        }
    }

    pub fn new_with(tid: pid_t, serial: u32) -> TaskishUid<T> {
        TaskishUid {
            tid_: tid,
            serial_: serial,
            phantom: PhantomData,
        }
    }

    pub fn tid(&self) -> pid_t {
        self.tid_
    }

    pub fn serial(&self) -> u32 {
        self.serial_
    }
}

// Manual impls to avoid spurious bounds on the phantom parameter.
impl<T> Copy for TaskishUid<T> {}

impl<T> Clone for TaskishUid<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Default for TaskishUid<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PartialEq for TaskishUid<T> {
    fn eq(&self, other: &Self) -> bool {
        self.tid_ == other.tid_ && self.serial_ == other.serial_
    }
}

impl<T> Eq for TaskishUid<T> {}

impl<T> PartialOrd for TaskishUid<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for TaskishUid<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.tid_, self.serial_).cmp(&(other.tid_, other.serial_))
    }
}

impl<T> std::hash::Hash for TaskishUid<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.tid_.hash(state);
        self.serial_.hash(state);
    }
}

pub struct TaskStandIn;
pub struct TaskGroupStandIn;
pub struct AddressSpaceStandIn;

pub type TaskUid = TaskishUid<TaskStandIn>;
pub type TaskGroupUid = TaskishUid<TaskGroupStandIn>;

/// An AddressSpace is additionally distinguished by how many execs precede
/// it in its task's lifetime.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct AddressSpaceUid {
    taskish: TaskishUid<AddressSpaceStandIn>,
    exec_count: u32,
}

impl AddressSpaceUid {
    pub fn new() -> AddressSpaceUid {
        AddressSpaceUid {
            taskish: TaskishUid::new(),
            exec_count: 0,
        }
    }

    pub fn new_with(tid: pid_t, serial: u32, exec_count: u32) -> AddressSpaceUid {
        AddressSpaceUid {
            taskish: TaskishUid::new_with(tid, serial),
            exec_count,
        }
    }

    pub fn tid(&self) -> pid_t {
        self.taskish.tid()
    }

    pub fn serial(&self) -> u32 {
        self.taskish.serial()
    }

    pub fn exec_count(&self) -> u32 {
        self.exec_count
    }
}

impl Default for AddressSpaceUid {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_tid_then_serial() {
        let a = TaskUid::new_with(1, 1);
        let b = TaskUid::new_with(0, 9);
        let c = TaskUid::new_with(0, 7);
        assert!(a > b);
        assert!(b > c);
        assert!(a > c);
    }

    #[test]
    fn address_space_uid_ordering() {
        let a = AddressSpaceUid::new_with(1, 1, 2);
        let b = AddressSpaceUid::new_with(0, 2, 3);
        let c = AddressSpaceUid::new_with(0, 1, 4);
        assert!(a > b);
        assert!(b > c);
        assert_eq!(b.tid(), c.tid());
    }
}
