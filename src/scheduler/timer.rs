//! Wall-clock scheduler backed by a monotonic timer.

use std::cell::{Cell, RefCell};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::time::{Duration, Instant};

use super::{Scheduler, Task, TaskId};

struct Entry {
    due: u64,
    sequence: u64,
    id: TaskId,
    task: Task,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.sequence == other.sequence
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.due, self.sequence).cmp(&(other.due, other.sequence))
    }
}

/// The production scheduler: logical time is monotonic wall-clock
/// milliseconds measured from construction.
///
/// Work is queued until the owning thread pumps it with
/// [`drain`](Scheduler::drain), which runs tasks in due-time order and
/// sleeps through gaps until the queue is empty. This keeps the executor
/// single-threaded and cooperative: nothing runs behind the caller's
/// back.
///
/// # Examples
///
/// ```rust
/// use tidewave::scheduler::{Scheduler, TimerScheduler};
/// use std::cell::Cell;
/// use std::rc::Rc;
///
/// let scheduler = TimerScheduler::new();
/// let fired = Rc::new(Cell::new(false));
/// let flag = fired.clone();
///
/// scheduler.delay(Box::new(move || flag.set(true)), 5);
/// scheduler.drain();
///
/// assert!(fired.get());
/// assert!(scheduler.now() >= 5);
/// ```
pub struct TimerScheduler {
    origin: Instant,
    queue: RefCell<BinaryHeap<Reverse<Entry>>>,
    cancelled: RefCell<HashSet<TaskId>>,
    next_id: Cell<u64>,
}

impl TimerScheduler {
    /// Creates a scheduler whose clock starts at zero now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            queue: RefCell::new(BinaryHeap::new()),
            cancelled: RefCell::new(HashSet::new()),
            next_id: Cell::new(0),
        }
    }

    /// Returns `true` when no task is pending.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        let cancelled = self.cancelled.borrow();
        self.queue
            .borrow()
            .iter()
            .all(|Reverse(entry)| cancelled.contains(&entry.id))
    }

    fn schedule(&self, due: u64, task: Task) -> TaskId {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.queue.borrow_mut().push(Reverse(Entry {
            due,
            sequence: id,
            id,
            task,
        }));
        id
    }

    fn pop_next(&self) -> Option<Entry> {
        loop {
            let entry = match self.queue.borrow_mut().pop() {
                Some(Reverse(entry)) => entry,
                None => return None,
            };
            if self.cancelled.borrow_mut().remove(&entry.id) {
                continue;
            }
            return Some(entry);
        }
    }
}

impl Default for TimerScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for TimerScheduler {
    fn asap(&self, task: Task) -> TaskId {
        self.schedule(self.now(), task)
    }

    fn delay(&self, task: Task, delay_ms: u64) -> TaskId {
        self.schedule(self.now().saturating_add(delay_ms), task)
    }

    fn cancel(&self, task: TaskId) {
        if task < self.next_id.get() {
            self.cancelled.borrow_mut().insert(task);
        }
    }

    fn now(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn drain(&self) {
        while let Some(entry) = self.pop_next() {
            let now = self.now();
            if entry.due > now {
                std::thread::sleep(Duration::from_millis(entry.due - now));
            }
            (entry.task)();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::rc::Rc;

    #[rstest]
    fn now_is_monotonic() {
        let scheduler = TimerScheduler::new();
        let first = scheduler.now();
        let second = scheduler.now();
        assert!(second >= first);
    }

    #[rstest]
    fn drain_runs_tasks_in_due_order() {
        let scheduler = TimerScheduler::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        let late = log.clone();
        scheduler.delay(Box::new(move || late.borrow_mut().push(2)), 4);
        let early = log.clone();
        scheduler.asap(Box::new(move || early.borrow_mut().push(1)));

        scheduler.drain();
        assert_eq!(*log.borrow(), vec![1, 2]);
        assert!(scheduler.is_idle());
    }

    #[rstest]
    fn cancelled_tasks_do_not_run() {
        let scheduler = TimerScheduler::new();
        let fired = Rc::new(Cell::new(false));

        let flag = fired.clone();
        let id = scheduler.delay(Box::new(move || flag.set(true)), 2);
        scheduler.cancel(id);
        scheduler.cancel(id);

        scheduler.drain();
        assert!(!fired.get());
    }
}
