//! A FIFO queue with suspending offer and take.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use crate::effect::{Cancellation, Effect, RawResumption};
use crate::scheduler::Scheduler;

struct QueueState<A> {
    items: VecDeque<A>,
    capacity: Option<usize>,
    offer_waiters: VecDeque<(u64, A, RawResumption)>,
    take_waiters: VecDeque<(u64, RawResumption)>,
    next_waiter: u64,
}

/// A bounded (or unbounded) FIFO queue whose operations are effects.
///
/// Offering to a full queue suspends the offerer; taking from an empty
/// queue suspends the taker. At most one of the two waiter lists is
/// non-empty at any time, and order is preserved across the buffer and
/// both waiter lists: a taker always receives the oldest value.
/// Suspended waiters are resumed through the scheduler, never inline.
///
/// Cloning a `Queue` shares the underlying buffer.
///
/// # Examples
///
/// ```rust
/// use std::rc::Rc;
/// use tidewave::concurrent::Queue;
/// use tidewave::effect::{Effect, Runtime};
/// use tidewave::scheduler::TestScheduler;
///
/// let runtime = Runtime::new(Rc::new(TestScheduler::new()));
/// let queue: Queue<i32> = Queue::bounded(2);
///
/// let program: Effect<(), String, i32> = queue
///     .offer(1)
///     .then(queue.offer(2))
///     .then(queue.take());
///
/// assert_eq!(runtime.run_unsafe_sync(program, ()), 1);
/// ```
pub struct Queue<A> {
    state: Rc<RefCell<QueueState<A>>>,
}

impl<A> Clone for Queue<A> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<A> fmt::Debug for Queue<A> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        formatter
            .debug_struct("Queue")
            .field("size", &state.items.len())
            .field("capacity", &state.capacity)
            .field("offer_waiters", &state.offer_waiters.len())
            .field("take_waiters", &state.take_waiters.len())
            .finish()
    }
}

impl<A: 'static> Queue<A> {
    fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            state: Rc::new(RefCell::new(QueueState {
                items: VecDeque::new(),
                capacity,
                offer_waiters: VecDeque::new(),
                take_waiters: VecDeque::new(),
                next_waiter: 0,
            })),
        }
    }

    /// A queue holding at most `capacity` buffered values.
    ///
    /// With capacity 0 the queue is a rendezvous point: every offer
    /// waits for a taker.
    #[must_use]
    pub fn bounded(capacity: usize) -> Self {
        Self::with_capacity(Some(capacity))
    }

    /// A queue that buffers without limit; offers never suspend.
    #[must_use]
    pub fn unbounded() -> Self {
        Self::with_capacity(None)
    }

    /// An effect that allocates a fresh bounded queue per execution.
    pub fn make<R, E>(capacity: usize) -> Effect<R, E, Self>
    where
        R: 'static,
        E: 'static,
    {
        Effect::of_with(move || Self::bounded(capacity))
    }

    /// The configured capacity; `None` when unbounded.
    #[must_use]
    pub fn capacity(&self) -> Option<usize> {
        self.state.borrow().capacity
    }

    /// The number of buffered values.
    pub fn size<R, E>(&self) -> Effect<R, E, usize>
    where
        R: 'static,
        E: 'static,
    {
        let state = self.state.clone();
        Effect::of_with(move || state.borrow().items.len())
    }

    /// Offers a value, suspending while the queue is full.
    ///
    /// If a taker is already waiting the value is handed to it
    /// directly, bypassing the buffer. Cancelling a suspended offer
    /// withdraws it (and its value) from the queue.
    pub fn offer<R, E>(&self, value: A) -> Effect<R, E, ()>
    where
        A: Clone,
        R: 'static,
        E: 'static,
    {
        let state = self.state.clone();
        Effect::from_async_raw(move |_environment, resumption, scheduler| {
            let value = value.clone();
            let mut queue = state.borrow_mut();
            if let Some((_, taker)) = queue.take_waiters.pop_front() {
                drop(queue);
                hand_off(scheduler, taker, value);
                resumption.succeed(Box::new(()));
                Cancellation::none()
            } else if queue
                .capacity
                .map_or(true, |capacity| queue.items.len() < capacity)
            {
                queue.items.push_back(value);
                drop(queue);
                resumption.succeed(Box::new(()));
                Cancellation::none()
            } else {
                let id = queue.next_waiter;
                queue.next_waiter += 1;
                queue.offer_waiters.push_back((id, value, resumption));
                drop(queue);
                let state = state.clone();
                Cancellation::of(move || {
                    state
                        .borrow_mut()
                        .offer_waiters
                        .retain(|(waiter, _, _)| *waiter != id);
                })
            }
        })
    }

    /// Takes the oldest value, suspending while the queue is empty.
    ///
    /// Freeing a buffer slot admits the oldest suspended offerer.
    /// Cancelling a suspended take removes the taker from the waiter
    /// list.
    pub fn take<R, E>(&self) -> Effect<R, E, A>
    where
        R: 'static,
        E: 'static,
    {
        let state = self.state.clone();
        Effect::from_async_raw(move |_environment, resumption, scheduler| {
            let mut queue = state.borrow_mut();
            if let Some(value) = queue.items.pop_front() {
                // The freed slot admits the oldest blocked offerer.
                if let Some((_, pending, offerer)) = queue.offer_waiters.pop_front() {
                    queue.items.push_back(pending);
                    drop(queue);
                    release_offerer(scheduler, offerer);
                } else {
                    drop(queue);
                }
                resumption.succeed(Box::new(value));
                Cancellation::none()
            } else if let Some((_, pending, offerer)) = queue.offer_waiters.pop_front() {
                // Rendezvous: capacity 0, value handed straight through.
                drop(queue);
                release_offerer(scheduler, offerer);
                resumption.succeed(Box::new(pending));
                Cancellation::none()
            } else {
                let id = queue.next_waiter;
                queue.next_waiter += 1;
                queue.take_waiters.push_back((id, resumption));
                drop(queue);
                let state = state.clone();
                Cancellation::of(move || {
                    state
                        .borrow_mut()
                        .take_waiters
                        .retain(|(waiter, _)| *waiter != id);
                })
            }
        })
    }
}

/// Delivers a value to a waiting taker on a later turn.
fn hand_off<A: 'static>(scheduler: &Rc<dyn Scheduler>, taker: RawResumption, value: A) {
    scheduler.asap(Box::new(move || taker.succeed(Box::new(value))));
}

/// Resumes a blocked offerer on a later turn.
fn release_offerer(scheduler: &Rc<dyn Scheduler>, offerer: RawResumption) {
    scheduler.asap(Box::new(move || offerer.succeed(Box::new(()))));
}
