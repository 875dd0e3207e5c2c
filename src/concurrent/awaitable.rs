//! A write-once synchronization cell.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::effect::{deliver_outcome, Cancellation, Effect, Failure, RawResumption};

enum AwaitState<E, A> {
    Unset {
        waiters: Vec<(u64, RawResumption)>,
        next_waiter: u64,
    },
    Set(Result<A, Failure<E>>),
}

/// A write-once cell coordinating fibers.
///
/// [`set`](Await::set) evaluates an effect and installs its outcome
/// (success or failure) exactly once; a second `set` yields `false`.
/// [`get`](Await::get) succeeds (or fails) immediately once the cell is
/// set; before that it suspends the calling fiber. When the first `set`
/// lands, all waiters are resumed in FIFO order through the scheduler,
/// never inline, so the setter is not entangled with the waiters'
/// continuations.
///
/// Cloning an `Await` shares the cell.
///
/// # Examples
///
/// ```rust
/// use std::rc::Rc;
/// use tidewave::concurrent::Await;
/// use tidewave::effect::{Effect, Runtime};
/// use tidewave::scheduler::TestScheduler;
///
/// let runtime = Runtime::new(Rc::new(TestScheduler::new()));
/// let cell: Await<String, i32> = Await::new();
///
/// let program: Effect<(), String, (bool, i32)> = cell
///     .set(Effect::of(7))
///     .zip(cell.get());
///
/// assert_eq!(runtime.run_unsafe_sync(program, ()), (true, 7));
/// ```
pub struct Await<E, A> {
    state: Rc<RefCell<AwaitState<E, A>>>,
}

impl<E, A> Clone for Await<E, A> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<E, A> fmt::Debug for Await<E, A> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.state.borrow() {
            AwaitState::Unset { waiters, .. } => formatter
                .debug_struct("Await")
                .field("set", &false)
                .field("waiters", &waiters.len())
                .finish(),
            AwaitState::Set(_) => formatter.debug_struct("Await").field("set", &true).finish(),
        }
    }
}

impl<E, A> Default for Await<E, A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E, A> Await<E, A> {
    /// Creates an unset cell.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(AwaitState::Unset {
                waiters: Vec::new(),
                next_waiter: 0,
            })),
        }
    }

    /// Returns `true` if the cell has been set.
    ///
    /// A synchronous peek, usable from pure predicates (stream
    /// `halt_when` consults it between elements).
    #[must_use]
    pub fn is_set_now(&self) -> bool {
        matches!(&*self.state.borrow(), AwaitState::Set(_))
    }
}

impl<E: Clone + 'static, A: Clone + 'static> Await<E, A> {
    /// An effect that allocates a fresh cell per execution.
    pub fn make<R: 'static>() -> Effect<R, E, Self> {
        Effect::of_with(Self::new)
    }

    /// An effect reporting whether the cell has been set.
    pub fn is_set<R: 'static>(&self) -> Effect<R, E, bool> {
        let shared = self.clone();
        Effect::of_with(move || shared.is_set_now())
    }

    /// Evaluates `effect` and installs its outcome.
    ///
    /// The outcome (success, typed failure, or defect) becomes the
    /// cell's value either way, and `set` itself succeeds with `true`.
    /// If the cell is already set by then, nothing is installed and
    /// `set` succeeds with `false`.
    pub fn set<R: 'static>(&self, effect: Effect<R, E, A>) -> Effect<R, E, bool> {
        let state = self.state.clone();
        effect.attempt::<E>().chain(move |outcome| {
            let state = state.clone();
            let slot = Rc::new(RefCell::new(Some(outcome)));
            Effect::from_async_raw(move |_environment, resumption, scheduler| {
                let outcome = slot
                    .borrow_mut()
                    .take()
                    .expect("await outcome already installed");
                let waiters = {
                    let mut cell = state.borrow_mut();
                    match &mut *cell {
                        AwaitState::Set(_) => None,
                        unset => {
                            let previous =
                                std::mem::replace(unset, AwaitState::Set(outcome.clone()));
                            match previous {
                                AwaitState::Unset { waiters, .. } => Some(waiters),
                                AwaitState::Set(_) => Some(Vec::new()),
                            }
                        }
                    }
                };
                match waiters {
                    None => resumption.succeed(Box::new(false)),
                    Some(waiters) => {
                        // FIFO, and always through the scheduler.
                        for (_, waiter) in waiters {
                            let outcome = outcome.clone();
                            scheduler
                                .asap(Box::new(move || deliver_outcome(&waiter, outcome)));
                        }
                        resumption.succeed(Box::new(true));
                    }
                }
                Cancellation::none()
            })
        })
    }

    /// Waits for the cell's value.
    ///
    /// Succeeds immediately once set; otherwise suspends until the
    /// first `set`. A cached failure fails the getter the same way the
    /// original effect failed. Cancelling a suspended getter removes it
    /// from the waiter list.
    pub fn get<R: 'static>(&self) -> Effect<R, E, A> {
        let state = self.state.clone();
        Effect::from_async_raw(move |_environment, resumption, _scheduler| {
            let mut resumption = Some(resumption);
            let registered = {
                let mut cell = state.borrow_mut();
                match &mut *cell {
                    AwaitState::Set(outcome) => Err(outcome.clone()),
                    AwaitState::Unset {
                        waiters,
                        next_waiter,
                    } => {
                        let id = *next_waiter;
                        *next_waiter += 1;
                        waiters.push((
                            id,
                            resumption.take().expect("await resumption taken once"),
                        ));
                        Ok(id)
                    }
                }
            };
            match registered {
                Err(outcome) => {
                    if let Some(resumption) = resumption.take() {
                        deliver_outcome(&resumption, outcome);
                    }
                    Cancellation::none()
                }
                Ok(id) => {
                    let state = state.clone();
                    Cancellation::of(move || {
                        if let AwaitState::Unset { waiters, .. } = &mut *state.borrow_mut() {
                            waiters.retain(|(waiter, _)| *waiter != id);
                        }
                    })
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::Runtime;
    use crate::scheduler::TestScheduler;
    use rstest::rstest;

    #[rstest]
    fn a_fresh_cell_is_unset() {
        let cell: Await<String, i32> = Await::new();
        assert!(!cell.is_set_now());
    }

    #[rstest]
    fn set_installs_and_reports_first_write() {
        let runtime = Runtime::new(Rc::new(TestScheduler::new()));
        let cell: Await<String, i32> = Await::new();

        let first: Effect<(), String, bool> = cell.set(Effect::of(1));
        let second: Effect<(), String, bool> = cell.set(Effect::of(2));

        assert!(runtime.run_unsafe_sync(first, ()));
        assert!(!runtime.run_unsafe_sync(second, ()));
        assert!(cell.is_set_now());

        let read: Effect<(), String, i32> = cell.get();
        assert_eq!(runtime.run_unsafe_sync(read, ()), 1);
    }

    #[rstest]
    fn set_caches_a_failure_for_getters() {
        let runtime = Runtime::new(Rc::new(TestScheduler::new()));
        let cell: Await<String, i32> = Await::new();

        let install: Effect<(), String, bool> = cell.set(Effect::reject("down".to_string()));
        assert!(runtime.run_unsafe_sync(install, ()));

        let read: Effect<(), String, i32> = cell.get();
        let outcome = runtime.run_sync(read, ());
        assert_eq!(
            outcome,
            Err(crate::effect::SyncRunError::Failed(Failure::Error(
                "down".to_string()
            )))
        );
    }
}
