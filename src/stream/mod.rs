//! Lazy, fold-based streams layered atop the effect type.
//!
//! # Design
//!
//! A [`Stream<R, E, A>`] carries a single capability: a polymorphic
//! fold. Given an initial state `S`, a continuation predicate
//! `&S -> bool`, and a step `(S, A) -> Effect<R, E, S>`, the stream
//! yields an `Effect<R, E, S>` that drives the source until the
//! predicate declines or the source is exhausted. Every operator
//! (`map`, `chain`, `filter`, `for_each`, `fold_left`) wraps the fold.
//!
//! The state type is erased internally (`Box<dyn Any>`) the same way
//! the instruction algebra erases values, and re-typed at the public
//! `fold` boundary.
//!
//! Backpressure is structural: the source never produces a value until
//! the previous step's effect has completed. Streams are restartable:
//! the effect a fold builds can be executed repeatedly, the initial
//! state being produced afresh per run.
//!
//! # Examples
//!
//! ```rust
//! use std::rc::Rc;
//! use tidewave::effect::{Effect, Runtime};
//! use tidewave::scheduler::TestScheduler;
//! use tidewave::stream::Stream;
//!
//! let runtime = Runtime::new(Rc::new(TestScheduler::new()));
//!
//! let doubled_evens: Effect<(), String, Vec<i64>> = Stream::range(0, 10)
//!     .filter(|value| value % 2 == 0)
//!     .map(|value| value * 2)
//!     .as_vec();
//!
//! assert_eq!(
//!     runtime.run_unsafe_sync(doubled_evens, ()),
//!     vec![0, 4, 8, 12, 16]
//! );
//! ```

mod source;

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use crate::concurrent::Await;
use crate::effect::{AnyValue, Effect};

/// Panic message for impossible stream-state downcasts.
pub(crate) const STATE_MISMATCH: &str = "type mismatch in stream state";

/// Produces the (erased) initial fold state, once per execution.
pub(crate) type InitFn = Rc<dyn Fn() -> AnyValue>;

/// The (erased) continuation predicate consulted before each element.
pub(crate) type ContFn = Rc<dyn Fn(&dyn Any) -> bool>;

/// The (erased) step feeding one element into the fold state.
pub(crate) type StepFn<R, E, A> = Rc<dyn Fn(AnyValue, A) -> Effect<R, E, AnyValue>>;

type FoldFn<R, E, A> = dyn Fn(InitFn, ContFn, StepFn<R, E, A>) -> Effect<R, E, AnyValue>;

/// A lazy sequence of `A`s defined by its fold.
///
/// Finite or infinite; see the [module docs](self) for the fold
/// protocol and [`source`] constructors like
/// [`from_vec`](Stream::from_vec), [`range`](Stream::range),
/// [`interval`](Stream::interval) and
/// [`from_queue`](Stream::from_queue).
pub struct Stream<R, E, A> {
    fold: Rc<FoldFn<R, E, A>>,
}

impl<R, E, A> Clone for Stream<R, E, A> {
    fn clone(&self) -> Self {
        Self {
            fold: self.fold.clone(),
        }
    }
}

impl<R, E, A> fmt::Debug for Stream<R, E, A> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.debug_struct("Stream").finish_non_exhaustive()
    }
}

impl<R: 'static, E: 'static, A: 'static> Stream<R, E, A> {
    pub(crate) fn from_fold<F>(fold: F) -> Self
    where
        F: Fn(InitFn, ContFn, StepFn<R, E, A>) -> Effect<R, E, AnyValue> + 'static,
    {
        Self {
            fold: Rc::new(fold),
        }
    }

    pub(crate) fn fold_raw(
        &self,
        init: InitFn,
        cont: ContFn,
        step: StepFn<R, E, A>,
    ) -> Effect<R, E, AnyValue> {
        (self.fold)(init, cont, step)
    }

    /// Folds the stream: feed each element into `step` while `cont`
    /// holds, yielding the final state.
    ///
    /// The initial state is cloned per execution, which is what makes
    /// the resulting effect restartable.
    pub fn fold<S, C, F>(&self, initial: S, cont: C, step: F) -> Effect<R, E, S>
    where
        S: Clone + 'static,
        C: Fn(&S) -> bool + 'static,
        F: Fn(S, A) -> Effect<R, E, S> + 'static,
    {
        let init: InitFn = Rc::new(move || Box::new(initial.clone()) as AnyValue);
        let gate: ContFn =
            Rc::new(move |state: &dyn Any| cont(state.downcast_ref::<S>().expect(STATE_MISMATCH)));
        let stepper: StepFn<R, E, A> = Rc::new(move |state: AnyValue, value: A| {
            let state = *state.downcast::<S>().expect(STATE_MISMATCH);
            step(state, value).map(|next| Box::new(next) as AnyValue)
        });
        self.fold_raw(init, gate, stepper)
            .map(|state| *state.downcast::<S>().expect(STATE_MISMATCH))
    }

    /// Applies a pure function to every element.
    pub fn map<B, F>(self, function: F) -> Stream<R, E, B>
    where
        B: 'static,
        F: Fn(A) -> B + 'static,
    {
        let function = Rc::new(function);
        Stream::from_fold(move |init, cont, step: StepFn<R, E, B>| {
            let function = function.clone();
            let inner: StepFn<R, E, A> = Rc::new(move |state, value| step(state, function(value)));
            self.fold_raw(init, cont, inner)
        })
    }

    /// Replaces every element with a sub-stream, folded into the same
    /// accumulator.
    pub fn chain<B, F>(self, function: F) -> Stream<R, E, B>
    where
        B: 'static,
        F: Fn(A) -> Stream<R, E, B> + 'static,
    {
        let function = Rc::new(function);
        Stream::from_fold(move |init, cont, step: StepFn<R, E, B>| {
            let function = function.clone();
            let outer_cont = cont.clone();
            let inner: StepFn<R, E, A> = Rc::new(move |state, value| {
                function(value).fold_raw(one_shot_init(state), cont.clone(), step.clone())
            });
            self.fold_raw(init, outer_cont, inner)
        })
    }

    /// Drops elements failing the predicate.
    pub fn filter<P>(self, predicate: P) -> Self
    where
        P: Fn(&A) -> bool + 'static,
    {
        let predicate = Rc::new(predicate);
        Stream::from_fold(move |init, cont, step: StepFn<R, E, A>| {
            let predicate = predicate.clone();
            let inner: StepFn<R, E, A> = Rc::new(move |state, value| {
                if predicate(&value) {
                    step(state, value)
                } else {
                    Effect::of_once(state)
                }
            });
            self.fold_raw(init, cont, inner)
        })
    }

    /// Passes through at most `count` elements.
    #[must_use]
    pub fn take(self, count: usize) -> Self {
        Stream::from_fold(move |init, cont, step| {
            let stream = self.clone();
            Effect::suspend(move || {
                let remaining = Rc::new(Cell::new(count));
                let gate: ContFn = {
                    let remaining = remaining.clone();
                    let cont = cont.clone();
                    Rc::new(move |state: &dyn Any| remaining.get() > 0 && cont(state))
                };
                let counted: StepFn<R, E, A> = {
                    let step = step.clone();
                    Rc::new(move |state, value| {
                        remaining.set(remaining.get().saturating_sub(1));
                        step(state, value)
                    })
                };
                stream.fold_raw(init.clone(), gate, counted)
            })
        })
    }

    /// Halts the fold once `signal` is set, checked between elements.
    #[must_use]
    pub fn halt_when<E2, B>(self, signal: &Await<E2, B>) -> Self
    where
        E2: 'static,
        B: 'static,
    {
        let signal = signal.clone();
        Stream::from_fold(move |init, cont, step| {
            let signal = signal.clone();
            let gate: ContFn = Rc::new(move |state| !signal.is_set_now() && cont(state));
            self.fold_raw(init, gate, step)
        })
    }

    /// Runs `action` for every element, discarding results.
    pub fn for_each<F>(self, action: F) -> Effect<R, E, ()>
    where
        F: Fn(A) -> Effect<R, E, ()> + 'static,
    {
        self.fold((), |_: &()| true, move |(), value| action(value))
    }

    /// Folds every element into an accumulator with a pure function.
    pub fn fold_left<S, F>(self, initial: S, function: F) -> Effect<R, E, S>
    where
        S: Clone + 'static,
        F: Fn(S, A) -> S + 'static,
    {
        self.fold(initial, |_: &S| true, move |state, value| {
            Effect::of_once(function(state, value))
        })
    }

    /// Collects every element into a `Vec`.
    pub fn as_vec(self) -> Effect<R, E, Vec<A>>
    where
        A: Clone,
    {
        self.fold_left(Vec::new(), |mut accumulator, value| {
            accumulator.push(value);
            accumulator
        })
    }
}

/// Wraps a per-run state value as an init thunk for a sub-fold.
pub(crate) fn one_shot_init(state: AnyValue) -> InitFn {
    let slot = RefCell::new(Some(state));
    Rc::new(move || {
        slot.borrow_mut()
            .take()
            .expect("fold state already consumed")
    })
}
