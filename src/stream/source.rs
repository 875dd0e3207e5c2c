//! Stream sources.
//!
//! Each source implements the fold protocol directly: it builds, per
//! execution, a chain of effects that asks the continuation predicate
//! before every element and feeds elements through the step one at a
//! time, which is where structural backpressure comes from.

use std::rc::Rc;

use crate::concurrent::Queue;
use crate::effect::{AnyValue, Effect};

use super::{one_shot_init, ContFn, StepFn, Stream};

impl<R: 'static, E: 'static, A: 'static> Stream<R, E, A> {
    /// A finite stream over the items of a `Vec`.
    pub fn from_vec(items: Vec<A>) -> Self
    where
        A: Clone,
    {
        let items = Rc::new(items);
        Stream::from_fold(move |init, cont, step| {
            let items = items.clone();
            Effect::suspend(move || {
                emit_slice(items.clone(), 0, init(), cont.clone(), step.clone())
            })
        })
    }

    /// A single-element stream.
    pub fn of(value: A) -> Self
    where
        A: Clone,
    {
        Self::from_vec(vec![value])
    }

    /// An infinite stream repeating one value.
    pub fn constant(value: A) -> Self
    where
        A: Clone,
    {
        Stream::from_fold(move |init, cont, step| {
            let value = value.clone();
            Effect::suspend(move || {
                emit_constant(value.clone(), init(), cont.clone(), step.clone())
            })
        })
    }

    /// A stream of the single value an effect produces.
    pub fn from_effect(effect: Effect<R, E, A>) -> Self {
        Stream::from_fold(move |init, cont, step| {
            let effect = effect.clone();
            Effect::suspend(move || {
                let state = init();
                if !cont(&*state) {
                    return Effect::of_once(state);
                }
                let take_state = one_shot_init(state);
                let step = step.clone();
                effect
                    .clone()
                    .chain(move |value| step(take_state(), value))
            })
        })
    }

    /// Pulls elements by repeating `effect` until it yields `None`.
    pub fn produce(effect: Effect<R, E, Option<A>>) -> Self {
        Stream::from_fold(move |init, cont, step| {
            let effect = effect.clone();
            Effect::suspend(move || {
                emit_produce(effect.clone(), init(), cont.clone(), step.clone())
            })
        })
    }

    /// A stream of the values taken from a queue.
    ///
    /// Infinite: it suspends with the queue when empty and keeps
    /// pulling until the fold's continuation predicate (or
    /// [`halt_when`](Stream::halt_when)) declines.
    pub fn from_queue(queue: &Queue<A>) -> Self {
        let queue = queue.clone();
        Stream::from_fold(move |init, cont, step| {
            let queue = queue.clone();
            Effect::suspend(move || {
                emit_queue(queue.clone(), init(), cont.clone(), step.clone())
            })
        })
    }

    /// A stream that fails immediately.
    pub fn reject(error: E) -> Self
    where
        E: Clone,
    {
        Stream::from_fold(move |_init, _cont, _step| Effect::reject(error.clone()))
    }
}

impl<R: 'static, E: 'static> Stream<R, E, i64> {
    /// The integers of `start..end`.
    #[must_use]
    pub fn range(start: i64, end: i64) -> Self {
        Stream::from_fold(move |init, cont, step| {
            Effect::suspend(move || emit_range(start, end, init(), cont.clone(), step.clone()))
        })
    }
}

impl<R: 'static, E: 'static> Stream<R, E, u64> {
    /// Tick numbers `0, 1, 2, ...`, one every `period_ms` logical
    /// milliseconds.
    #[must_use]
    pub fn interval(period_ms: u64) -> Self {
        Stream::from_fold(move |init, cont, step| {
            Effect::suspend(move || {
                emit_interval(0, period_ms, init(), cont.clone(), step.clone())
            })
        })
    }
}

fn emit_slice<R, E, A>(
    items: Rc<Vec<A>>,
    index: usize,
    state: AnyValue,
    cont: ContFn,
    step: StepFn<R, E, A>,
) -> Effect<R, E, AnyValue>
where
    R: 'static,
    E: 'static,
    A: Clone + 'static,
{
    if index >= items.len() || !cont(&*state) {
        return Effect::of_once(state);
    }
    let value = items[index].clone();
    step(state, value).chain(move |state| {
        emit_slice(items.clone(), index + 1, state, cont.clone(), step.clone())
    })
}

fn emit_range<R, E>(
    current: i64,
    end: i64,
    state: AnyValue,
    cont: ContFn,
    step: StepFn<R, E, i64>,
) -> Effect<R, E, AnyValue>
where
    R: 'static,
    E: 'static,
{
    if current >= end || !cont(&*state) {
        return Effect::of_once(state);
    }
    step(state, current)
        .chain(move |state| emit_range(current + 1, end, state, cont.clone(), step.clone()))
}

fn emit_constant<R, E, A>(
    value: A,
    state: AnyValue,
    cont: ContFn,
    step: StepFn<R, E, A>,
) -> Effect<R, E, AnyValue>
where
    R: 'static,
    E: 'static,
    A: Clone + 'static,
{
    if !cont(&*state) {
        return Effect::of_once(state);
    }
    step(state, value.clone()).chain(move |state| {
        emit_constant(value.clone(), state, cont.clone(), step.clone())
    })
}

fn emit_interval<R, E>(
    tick: u64,
    period_ms: u64,
    state: AnyValue,
    cont: ContFn,
    step: StepFn<R, E, u64>,
) -> Effect<R, E, AnyValue>
where
    R: 'static,
    E: 'static,
{
    if !cont(&*state) {
        return Effect::of_once(state);
    }
    let take_state = one_shot_init(state);
    Effect::<R, E, ()>::sleep(period_ms).chain(move |()| {
        step(take_state(), tick).chain({
            let cont = cont.clone();
            let step = step.clone();
            move |state| emit_interval(tick + 1, period_ms, state, cont.clone(), step.clone())
        })
    })
}

fn emit_produce<R, E, A>(
    effect: Effect<R, E, Option<A>>,
    state: AnyValue,
    cont: ContFn,
    step: StepFn<R, E, A>,
) -> Effect<R, E, AnyValue>
where
    R: 'static,
    E: 'static,
    A: 'static,
{
    if !cont(&*state) {
        return Effect::of_once(state);
    }
    let take_state = one_shot_init(state);
    let again = effect.clone();
    effect.chain(move |maybe| match maybe {
        None => Effect::of_once(take_state()),
        Some(value) => step(take_state(), value).chain({
            let again = again.clone();
            let cont = cont.clone();
            let step = step.clone();
            move |state| emit_produce(again.clone(), state, cont.clone(), step.clone())
        }),
    })
}

fn emit_queue<R, E, A>(
    queue: Queue<A>,
    state: AnyValue,
    cont: ContFn,
    step: StepFn<R, E, A>,
) -> Effect<R, E, AnyValue>
where
    R: 'static,
    E: 'static,
    A: 'static,
{
    if !cont(&*state) {
        return Effect::of_once(state);
    }
    let take_state = one_shot_init(state);
    let again = queue.clone();
    queue.take::<R, E>().chain(move |value| {
        step(take_state(), value).chain({
            let queue = again.clone();
            let cont = cont.clone();
            let step = step.clone();
            move |state| emit_queue(queue.clone(), state, cont.clone(), step.clone())
        })
    })
}
