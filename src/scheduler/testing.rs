//! Deterministic scheduler with a manual logical clock.

use std::cell::{Cell, RefCell};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};

use super::{Scheduler, Task, TaskId};

/// A pending task keyed by due time and scheduling order.
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

/// A scheduler whose clock advances only when asked.
///
/// `TestScheduler` makes time a plain value: `asap` tasks run on the next
/// [`tick`](TestScheduler::tick), delayed tasks run when
/// [`advance`](TestScheduler::advance) (or
/// [`advance_to`](TestScheduler::advance_to)) moves the clock past their
/// due time, and [`drain`](Scheduler::drain) jumps the clock from task to
/// task until nothing is left. This makes every timing-dependent test
/// deterministic.
///
/// # Examples
///
/// ```rust
/// use tidewave::scheduler::{Scheduler, TestScheduler};
/// use std::cell::Cell;
/// use std::rc::Rc;
///
/// let scheduler = TestScheduler::new();
/// let fired = Rc::new(Cell::new(false));
/// let flag = fired.clone();
///
/// scheduler.delay(Box::new(move || flag.set(true)), 100);
///
/// scheduler.advance(99);
/// assert!(!fired.get());
///
/// scheduler.advance(1);
/// assert!(fired.get());
/// assert_eq!(scheduler.now(), 100);
/// ```
#[derive(Default)]
pub struct TestScheduler {
    clock: Cell<u64>,
    queue: RefCell<BinaryHeap<Reverse<Entry>>>,
    cancelled: RefCell<HashSet<TaskId>>,
    next_id: Cell<u64>,
}

impl TestScheduler {
    /// Creates a scheduler with an empty queue and the clock at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of pending (not cancelled) tasks.
    #[must_use]
    pub fn pending(&self) -> usize {
        let cancelled = self.cancelled.borrow();
        self.queue
            .borrow()
            .iter()
            .filter(|Reverse(entry)| !cancelled.contains(&entry.id))
            .count()
    }

    /// Returns `true` when no task is pending.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }

    /// Runs every task due at the current clock value.
    ///
    /// Tasks scheduled for the same instant run in scheduling order;
    /// tasks they schedule via `asap` run in the same call.
    pub fn tick(&self) {
        let deadline = self.clock.get();
        while let Some(entry) = self.pop_due(deadline) {
            (entry.task)();
        }
    }

    /// Advances the clock by `delta_ms`, running everything that becomes
    /// due along the way in time order.
    pub fn advance(&self, delta_ms: u64) {
        self.advance_to(self.clock.get().saturating_add(delta_ms));
    }

    /// Advances the clock to `deadline`, running everything that becomes
    /// due along the way in time order.
    ///
    /// The clock is stepped to each task's due time before the task
    /// runs, so tasks observe a consistent `now()`. A deadline in the
    /// past is a no-op.
    pub fn advance_to(&self, deadline: u64) {
        if deadline < self.clock.get() {
            return;
        }
        while let Some(entry) = self.pop_due(deadline) {
            if entry.due > self.clock.get() {
                self.clock.set(entry.due);
            }
            (entry.task)();
        }
        self.clock.set(deadline);
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

    /// Removes and returns the earliest live entry due at or before
    /// `deadline`, discarding cancelled entries on the way.
    fn pop_due(&self, deadline: u64) -> Option<Entry> {
        loop {
            let mut queue = self.queue.borrow_mut();
            let due_now = matches!(queue.peek(), Some(Reverse(entry)) if entry.due <= deadline);
            if !due_now {
                return None;
            }
            let Reverse(entry) = queue.pop().expect("peeked entry must exist");
            drop(queue);
            if self.cancelled.borrow_mut().remove(&entry.id) {
                continue;
            }
            return Some(entry);
        }
    }

    /// Removes and returns the earliest live entry regardless of time.
    fn pop_next(&self) -> Option<Entry> {
        self.pop_due(u64::MAX)
    }
}

impl Scheduler for TestScheduler {
    fn asap(&self, task: Task) -> TaskId {
        self.schedule(self.clock.get(), task)
    }

    fn delay(&self, task: Task, delay_ms: u64) -> TaskId {
        self.schedule(self.clock.get().saturating_add(delay_ms), task)
    }

    fn cancel(&self, task: TaskId) {
        if task < self.next_id.get() {
            self.cancelled.borrow_mut().insert(task);
        }
    }

    fn now(&self) -> u64 {
        self.clock.get()
    }

    fn drain(&self) {
        while let Some(entry) = self.pop_next() {
            if entry.due > self.clock.get() {
                self.clock.set(entry.due);
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

    fn record(log: &Rc<RefCell<Vec<u32>>>, value: u32) -> Task {
        let log = log.clone();
        Box::new(move || log.borrow_mut().push(value))
    }

    #[rstest]
    fn asap_does_not_run_synchronously() {
        let scheduler = TestScheduler::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        scheduler.asap(record(&log, 1));
        assert!(log.borrow().is_empty());

        scheduler.tick();
        assert_eq!(*log.borrow(), vec![1]);
    }

    #[rstest]
    fn same_instant_tasks_run_in_scheduling_order() {
        let scheduler = TestScheduler::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        scheduler.asap(record(&log, 1));
        scheduler.asap(record(&log, 2));
        scheduler.delay(record(&log, 3), 0);
        scheduler.tick();

        assert_eq!(*log.borrow(), vec![1, 2, 3]);
    }

    #[rstest]
    fn delayed_tasks_fire_at_their_due_time() {
        let scheduler = TestScheduler::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        scheduler.delay(record(&log, 1), 50);
        scheduler.delay(record(&log, 2), 10);

        scheduler.advance(9);
        assert!(log.borrow().is_empty());

        scheduler.advance(1);
        assert_eq!(*log.borrow(), vec![2]);

        scheduler.advance(40);
        assert_eq!(*log.borrow(), vec![2, 1]);
        assert_eq!(scheduler.now(), 50);
    }

    #[rstest]
    fn tasks_observe_their_due_time_as_now() {
        let scheduler = TestScheduler::new();
        let observed = Rc::new(Cell::new(0));

        // The clock steps to the due time before the task runs, even
        // when the advance overshoots it.
        let seen = observed.clone();
        let handle: Rc<TestScheduler> = Rc::new(scheduler);
        let inner = handle.clone();
        handle.delay(Box::new(move || seen.set(inner.now())), 25);

        handle.advance(100);
        assert_eq!(observed.get(), 25);
        assert_eq!(handle.now(), 100);
    }

    #[rstest]
    fn cancel_removes_a_pending_task() {
        let scheduler = TestScheduler::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        let id = scheduler.delay(record(&log, 1), 10);
        scheduler.cancel(id);
        scheduler.advance(20);

        assert!(log.borrow().is_empty());
        assert!(scheduler.is_idle());
    }

    #[rstest]
    fn cancel_is_idempotent_and_ignores_completed_tasks() {
        let scheduler = TestScheduler::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        let id = scheduler.asap(record(&log, 1));
        scheduler.tick();
        scheduler.cancel(id);
        scheduler.cancel(id);

        // A later task reusing the queue still runs.
        scheduler.asap(record(&log, 2));
        scheduler.tick();
        assert_eq!(*log.borrow(), vec![1, 2]);
    }

    #[rstest]
    fn drain_jumps_the_clock_between_tasks() {
        let scheduler = TestScheduler::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        scheduler.delay(record(&log, 1), 300);
        scheduler.delay(record(&log, 2), 100);
        scheduler.drain();

        assert_eq!(*log.borrow(), vec![2, 1]);
        assert_eq!(scheduler.now(), 300);
    }

    #[rstest]
    fn tasks_scheduled_while_draining_are_drained() {
        let scheduler = Rc::new(TestScheduler::new());
        let log = Rc::new(RefCell::new(Vec::new()));

        let inner_log = log.clone();
        let inner_scheduler = scheduler.clone();
        scheduler.asap(Box::new(move || {
            inner_log.borrow_mut().push(1);
            let nested_log = inner_log.clone();
            inner_scheduler.delay(Box::new(move || nested_log.borrow_mut().push(2)), 5);
        }));

        scheduler.drain();
        assert_eq!(*log.borrow(), vec![1, 2]);
        assert_eq!(scheduler.now(), 5);
    }
}
