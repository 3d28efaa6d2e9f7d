//! Overview of scheduling:
//!
//! The engine honours priorities set by setpriority(2): the highest priority
//! runnable task is scheduled, and tasks with equal priorities are scheduled
//! in round-robin fashion. Strict priority scheduling helps find bugs due to
//! starvation.
//!
//! The scheduler only runs during recording. During replay the recorded
//! scheduling decisions are simply reproduced.
//!
//! The main interface is `get_next_task`, called after every event to decide
//! which task runs next. The scheduler gives the current task a timeslice, a
//! ticks deadline after which it tries to switch to another task: the branch
//! counter is programmed to overflow at the remaining budget and its signal
//! is the only legitimate source of preemption. The watchdog's
//! PTRACE_INTERRUPT path also lands here, via expire_timeslice.

use crate::{
    session::{
        task::TaskSharedPtr,
        Session,
    },
    ticks::Ticks,
};
use libc::pid_t;
use std::cell::{Cell, RefCell};

/// Using ticks (retired conditional branches) for timeslices is crude since
/// they don't correspond to a unit of time, but empirical insns/rcb
/// distributions mass around 10, suggesting for a nominal 2GHz CPU about
/// 50,000 ticks per millisecond. The default gives roughly 10ms timeslices.
pub const DEFAULT_MAX_TICKS: Ticks = 500_000;

pub struct Scheduler {
    /// The currently scheduled task, or None when the last scheduled task
    /// has been destroyed.
    current_: RefCell<Option<TaskSharedPtr>>,
    /// The tick budget the current task had when scheduled.
    current_timeslice_end_: Cell<Ticks>,
    /// Set when the watchdog interrupted a wait: the timeslice is treated
    /// as exhausted regardless of the tick count.
    timeslice_expired_: Cell<bool>,
    max_ticks_: Cell<Ticks>,
}

impl Scheduler {
    pub fn new() -> Scheduler {
        Scheduler {
            current_: RefCell::new(None),
            current_timeslice_end_: Cell::new(0),
            timeslice_expired_: Cell::new(false),
            max_ticks_: Cell::new(DEFAULT_MAX_TICKS),
        }
    }

    pub fn max_ticks(&self) -> Ticks {
        self.max_ticks_.get()
    }

    pub fn set_max_ticks(&self, max_ticks: Ticks) {
        self.max_ticks_.set(max_ticks);
    }

    pub fn current(&self) -> Option<TaskSharedPtr> {
        self.current_.borrow().clone()
    }

    pub fn set_current(&self, t: Option<TaskSharedPtr>) {
        *self.current_.borrow_mut() = t;
    }

    /// Force the current timeslice to end now. Called when the wait
    /// watchdog had to PTRACE_INTERRUPT the tracee.
    pub fn expire_timeslice(&self) {
        self.timeslice_expired_.set(true);
    }

    pub fn timeslice_expired(&self) -> bool {
        self.timeslice_expired_.get()
    }

    /// The remaining tick budget for the current task.
    pub fn interrupt_after_ticks(&self, t: &crate::session::task::Task) -> Ticks {
        let end = self.current_timeslice_end_.get();
        let now = t.tick_count();
        if end > now {
            end - now
        } else {
            1
        }
    }

    /// Pick the task to run next. The current task keeps running until its
    /// timeslice expires (or it dies); then the runnable task with the
    /// highest priority is chosen, equal priorities rotating in round-robin
    /// order after the current task.
    pub fn get_next_task(&self, session: &Session) -> Option<TaskSharedPtr> {
        let tids: Vec<pid_t> = session.task_tids();
        if tids.is_empty() {
            self.set_current(None);
            return None;
        }

        let current_tid = self.current().map(|t| t.borrow().rec_tid);
        let expired = self.timeslice_expired_.replace(false);

        if !expired {
            if let Some(cur) = self.current() {
                if let Some(now) = current_tid {
                    if session.find_task(now).is_some()
                        && cur.borrow().tick_count() < self.current_timeslice_end_.get()
                    {
                        return Some(cur);
                    }
                }
            }
        }

        // Sort candidates by (priority, tid), rotated past the current task
        // so equal-priority tasks round-robin.
        let mut candidates: Vec<(i32, pid_t)> = tids
            .iter()
            .filter_map(|tid| {
                session
                    .find_task(*tid)
                    .map(|t| (t.borrow().priority, *tid))
            })
            .collect();
        candidates.sort();

        let chosen_tid = match current_tid {
            Some(cur_tid) => {
                let cur_priority = session
                    .find_task(cur_tid)
                    .map(|t| t.borrow().priority)
                    .unwrap_or(0);
                candidates
                    .iter()
                    .find(|&&(p, tid)| p == cur_priority && tid > cur_tid)
                    .or_else(|| candidates.first())
                    .map(|&(_, tid)| tid)
            }
            None => candidates.first().map(|&(_, tid)| tid),
        }?;

        let chosen = session.find_task(chosen_tid)?;
        self.current_timeslice_end_
            .set(chosen.borrow().tick_count() + self.max_ticks_.get());
        self.set_current(Some(chosen.clone()));
        Some(chosen)
    }

    /// Forget a task that is being destroyed.
    pub fn on_destroy_task(&self, rec_tid: pid_t) {
        let is_current = self
            .current()
            .map_or(false, |t| t.borrow().rec_tid == rec_tid);
        if is_current {
            self.set_current(None);
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
