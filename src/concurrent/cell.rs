//! A single-cell mutable holder accessed only via effects.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::effect::Effect;

/// A mutable cell whose operations are effects.
///
/// Each operation reads or writes the cell inside a single dispatch
/// step, so it is atomic with respect to every other effect running on
/// the same scheduler. A read-modify-write spanning two effects is
/// *not* atomic; use [`update`](Ref::update) or
/// [`modify`](Ref::modify) instead.
///
/// Cloning a `Ref` shares the cell.
///
/// # Examples
///
/// ```rust
/// use std::rc::Rc;
/// use tidewave::concurrent::Ref;
/// use tidewave::effect::{Effect, Runtime};
/// use tidewave::scheduler::TestScheduler;
///
/// let runtime = Runtime::new(Rc::new(TestScheduler::new()));
///
/// let effect: Effect<(), String, i32> = Ref::make(10)
///     .chain(|counter| {
///         counter
///             .update(|value| value + 1)
///             .then(counter.read())
///     });
///
/// assert_eq!(runtime.run_unsafe_sync(effect, ()), 11);
/// ```
pub struct Ref<A> {
    cell: Rc<RefCell<A>>,
}

impl<A> Clone for Ref<A> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
        }
    }
}

impl<A: fmt::Debug> fmt::Debug for Ref<A> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.debug_tuple("Ref").field(&self.cell.borrow()).finish()
    }
}

impl<A: 'static> Ref<A> {
    /// Creates a cell directly, outside the effect system.
    #[must_use]
    pub fn new(initial: A) -> Self {
        Self {
            cell: Rc::new(RefCell::new(initial)),
        }
    }

    /// An effect that allocates a fresh cell per execution.
    pub fn make<R, E>(initial: A) -> Effect<R, E, Self>
    where
        A: Clone,
        R: 'static,
        E: 'static,
    {
        Effect::of_with(move || Self::new(initial.clone()))
    }

    /// Reads the current value.
    pub fn read<R, E>(&self) -> Effect<R, E, A>
    where
        A: Clone,
        R: 'static,
        E: 'static,
    {
        let cell = self.cell.clone();
        Effect::of_with(move || cell.borrow().clone())
    }

    /// Replaces the value.
    pub fn set<R, E>(&self, value: A) -> Effect<R, E, ()>
    where
        A: Clone,
        R: 'static,
        E: 'static,
    {
        let cell = self.cell.clone();
        Effect::of_with(move || {
            *cell.borrow_mut() = value.clone();
        })
    }

    /// Atomically transforms the value, yielding the new value.
    pub fn update<R, E, F>(&self, function: F) -> Effect<R, E, A>
    where
        A: Clone,
        R: 'static,
        E: 'static,
        F: Fn(A) -> A + 'static,
    {
        let cell = self.cell.clone();
        Effect::of_with(move || {
            let current = cell.borrow().clone();
            let next = function(current);
            *cell.borrow_mut() = next.clone();
            next
        })
    }

    /// Atomically transforms the value, yielding a derived result.
    pub fn modify<R, E, B, F>(&self, function: F) -> Effect<R, E, B>
    where
        A: Clone,
        B: 'static,
        R: 'static,
        E: 'static,
        F: Fn(A) -> (B, A) + 'static,
    {
        let cell = self.cell.clone();
        Effect::of_with(move || {
            let current = cell.borrow().clone();
            let (output, next) = function(current);
            *cell.borrow_mut() = next;
            output
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::Runtime;
    use crate::scheduler::TestScheduler;
    use rstest::rstest;

    fn runtime() -> Runtime {
        Runtime::new(Rc::new(TestScheduler::new()))
    }

    #[rstest]
    fn read_returns_the_initial_value() {
        let cell = Ref::new(7);
        let effect: Effect<(), String, i32> = cell.read();
        assert_eq!(runtime().run_unsafe_sync(effect, ()), 7);
    }

    #[rstest]
    fn set_replaces_the_value() {
        let cell = Ref::new(1);
        let effect: Effect<(), String, i32> = cell.set(5).then(cell.read());
        assert_eq!(runtime().run_unsafe_sync(effect, ()), 5);
    }

    #[rstest]
    fn update_transforms_and_returns_the_new_value() {
        let cell = Ref::new(10);
        let effect: Effect<(), String, i32> = cell.update(|value| value * 3);
        assert_eq!(runtime().run_unsafe_sync(effect, ()), 30);
    }

    #[rstest]
    fn modify_returns_the_derived_result() {
        let cell = Ref::new(10);
        let effect: Effect<(), String, String> =
            cell.modify(|value| (format!("was {value}"), value + 1));
        assert_eq!(runtime().run_unsafe_sync(effect, ()), "was 10");

        let after: Effect<(), String, i32> = cell.read();
        assert_eq!(runtime().run_unsafe_sync(after, ()), 11);
    }

    #[rstest]
    fn make_allocates_a_fresh_cell_per_execution() {
        let effect: Effect<(), String, i32> =
            Ref::make(0).chain(|cell| cell.update(|value| value + 1));

        let runtime = runtime();
        // Two executions never observe each other's increments.
        assert_eq!(runtime.run_unsafe_sync(effect.clone(), ()), 1);
        assert_eq!(runtime.run_unsafe_sync(effect, ()), 1);
    }
}
