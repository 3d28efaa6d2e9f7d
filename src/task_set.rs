use crate::session::task::{Task, TaskSharedPtr, TaskSharedWeakPtr};
use std::cell::RefCell;

/// A set of weak task references, shared by AddressSpace and TaskGroup.
/// Tasks remove themselves on destruction, so upgrades of present entries
/// always succeed.
pub struct TaskSet {
    tasks: RefCell<Vec<TaskSharedWeakPtr>>,
}

impl TaskSet {
    pub fn new() -> TaskSet {
        TaskSet {
            tasks: RefCell::new(Vec::new()),
        }
    }

    pub fn insert(&self, t: TaskSharedWeakPtr) {
        if !self.has(&t) {
            self.tasks.borrow_mut().push(t);
        }
    }

    pub fn erase(&self, t: &TaskSharedWeakPtr) -> bool {
        let mut tasks = self.tasks.borrow_mut();
        match tasks.iter().position(|w| w.ptr_eq(t)) {
            Some(pos) => {
                tasks.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn has(&self, t: &TaskSharedWeakPtr) -> bool {
        self.tasks.borrow().iter().any(|w| w.ptr_eq(t))
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.borrow().is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.borrow().len()
    }

    /// Strong references to every live member.
    pub fn iter(&self) -> Vec<TaskSharedPtr> {
        self.tasks
            .borrow()
            .iter()
            .filter_map(|w| w.upgrade())
            .collect()
    }

    /// Strong references to every live member except `excluded`.
    pub fn iter_except(&self, excluded: &Task) -> Vec<TaskSharedPtr> {
        self.tasks
            .borrow()
            .iter()
            .filter_map(|w| w.upgrade())
            .filter(|t| !std::ptr::eq(t.as_ptr() as *const Task, excluded as *const Task))
            .collect()
    }

    pub fn any_member(&self) -> Option<TaskSharedPtr> {
        self.tasks.borrow().iter().find_map(|w| w.upgrade())
    }
}

impl Default for TaskSet {
    fn default() -> Self {
        Self::new()
    }
}
