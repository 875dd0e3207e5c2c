//! The `Effect` type and its combinators.
//!
//! # Design Philosophy
//!
//! An `Effect<R, E, A>` *describes* a computation requiring an
//! environment `R` and yielding a success `A` or failure `E`; nothing
//! happens until a [`Runtime`](super::Runtime) executes it. Combinators
//! only build instruction nodes and never run user code, so the same
//! effect value can be executed any number of times and every execution
//! is independent.
//!
//! # Examples
//!
//! ```rust
//! use std::rc::Rc;
//! use tidewave::effect::{Effect, Runtime};
//! use tidewave::scheduler::TestScheduler;
//!
//! let runtime = Runtime::new(Rc::new(TestScheduler::new()));
//!
//! let effect: Effect<(), String, i32> = Effect::of(10)
//!     .chain(|x| Effect::of(x + 1))
//!     .map(|x| x * 2);
//!
//! assert_eq!(runtime.run_unsafe_sync(effect.clone(), ()), 22);
//! // Effects are descriptions: running the same one again is a fresh,
//! // independent execution.
//! assert_eq!(runtime.run_unsafe_sync(effect, ()), 22);
//! ```
//!
//! # Error channel
//!
//! Failures are [`Failure<E>`](super::Failure): a typed error or a
//! defect (a panic captured inside a user function). `catch` receives
//! the whole failure, so both are recoverable:
//!
//! ```rust
//! use std::rc::Rc;
//! use tidewave::effect::{Effect, Failure, Runtime};
//! use tidewave::scheduler::TestScheduler;
//!
//! let runtime = Runtime::new(Rc::new(TestScheduler::new()));
//!
//! let recovered: Effect<(), String, i32> = Effect::reject("boom".to_string())
//!     .catch(|failure| match failure {
//!         Failure::Error(message) => Effect::of(message.len() as i32),
//!         Failure::Defect(_) => Effect::of(-1),
//!     });
//!
//! assert_eq!(runtime.run_unsafe_sync(recovered, ()), 4);
//! ```

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

use super::failure::Failure;
use super::instruction::{
    AnyEnv, AnyFailure, AnyValue, Instr, ENV_MISMATCH, VALUE_MISMATCH,
};
use super::runtime::{
    deliver_outcome, Cancellation, Fiber, FiberHandle, RawResumption, Resumption, Runtime,
};
use crate::scheduler::Scheduler;

/// An immutable description of an asynchronous computation.
///
/// Type parameters:
///
/// - `R`: the environment the computation requires (eliminated with
///   [`provide`](Effect::provide))
/// - `E`: the typed error channel
/// - `A`: the success value
///
/// Cloning is cheap (an `Rc` copy of the instruction tree) and executing
/// a clone is indistinguishable from executing the original.
pub struct Effect<R, E, A> {
    instruction: Rc<Instr>,
    _marker: PhantomData<fn(Rc<R>) -> Result<A, E>>,
}

impl<R, E, A> Clone for Effect<R, E, A> {
    fn clone(&self) -> Self {
        Self {
            instruction: self.instruction.clone(),
            _marker: PhantomData,
        }
    }
}

impl<R, E, A> fmt::Debug for Effect<R, E, A> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_tuple("Effect")
            .field(&self.instruction.tag())
            .finish()
    }
}

impl<R, E, A> Effect<R, E, A> {
    pub(crate) fn from_instruction(instruction: Rc<Instr>) -> Self {
        Self {
            instruction,
            _marker: PhantomData,
        }
    }

    pub(crate) fn into_instruction(self) -> Rc<Instr> {
        self.instruction
    }
}

// =============================================================================
// Constructors
// =============================================================================

impl<R: 'static, E: 'static, A: 'static> Effect<R, E, A> {
    /// An effect that succeeds immediately with `value`.
    ///
    /// Each execution receives its own copy, which is why `A: Clone`.
    /// Use [`of_with`](Effect::of_with) for values that cannot be
    /// cloned.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use tidewave::effect::Effect;
    ///
    /// let effect: Effect<(), String, i32> = Effect::of(42);
    /// ```
    pub fn of(value: A) -> Self
    where
        A: Clone,
    {
        Self::of_with(move || value.clone())
    }

    /// An effect that succeeds with the value `produce` returns.
    ///
    /// `produce` runs once per execution, at the point the effect is
    /// dispatched. A panic inside it is captured as a defect.
    pub fn of_with<F>(produce: F) -> Self
    where
        F: Fn() -> A + 'static,
    {
        Self::from_instruction(Rc::new(Instr::Constant(Rc::new(move || {
            Box::new(produce()) as AnyValue
        }))))
    }

    /// An effect carrying a value produced during the current run.
    ///
    /// Single-use by construction: callers only build it inside
    /// per-execution continuations.
    pub(crate) fn of_once(value: A) -> Self {
        Self::from_instruction(Instr::succeed_once(Box::new(value)))
    }

    pub(crate) fn fail_once_with(failure: AnyFailure) -> Self {
        Self::from_instruction(Instr::fail_once(failure))
    }

    /// An effect that fails immediately with `error`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use tidewave::effect::Effect;
    ///
    /// let effect: Effect<(), String, i32> = Effect::reject("nope".to_string());
    /// ```
    pub fn reject(error: E) -> Self
    where
        E: Clone,
    {
        Self::from_instruction(Rc::new(Instr::Reject(Rc::new(move || {
            AnyFailure::Error(Box::new(error.clone()))
        }))))
    }

    /// An effect that never completes (until cancelled).
    ///
    /// The identity for [`race`](Effect::race).
    #[must_use]
    pub fn never() -> Self {
        Self::from_instruction(Rc::new(Instr::Never))
    }

    /// Defers construction of an effect to evaluation time.
    ///
    /// `thunk` runs once per execution; a panic inside it is a defect.
    pub fn suspend<F>(thunk: F) -> Self
    where
        F: Fn() -> Self + 'static,
    {
        Self::from_instruction(Rc::new(Instr::Suspend(Rc::new(move || {
            thunk().into_instruction()
        }))))
    }

    /// Captures a synchronous, fallible operation as an effect.
    ///
    /// `operation` runs once per execution. An `Err` flows on the typed
    /// error channel; a panic is captured as a defect. Either way the
    /// failure is recoverable with [`catch`](Effect::catch).
    ///
    /// # Examples
    ///
    /// ```rust
    /// use tidewave::effect::Effect;
    ///
    /// let parsed: Effect<(), std::num::ParseIntError, i32> =
    ///     Effect::encase(|| "42".parse::<i32>());
    /// ```
    pub fn encase<F>(operation: F) -> Self
    where
        F: Fn() -> Result<A, E> + 'static,
    {
        Self::from_instruction(Rc::new(Instr::Suspend(Rc::new(
            move || match operation() {
                Ok(value) => Instr::succeed_once(Box::new(value)),
                Err(error) => Instr::fail_once(AnyFailure::Error(Box::new(error))),
            },
        ))))
    }

    /// Integrates a callback-based API as an effect.
    ///
    /// `register` is invoked synchronously when the effect is
    /// dispatched, with the environment, a [`Resumption`] to complete
    /// the effect, and the scheduler. It must return a [`Cancellation`]
    /// ([`Cancellation::none()`] when there is nothing to release) and
    /// may complete the resumption synchronously. Exactly one completion
    /// takes effect; later ones are ignored. A panic inside `register`
    /// is a rejection.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use tidewave::effect::{Cancellation, Effect};
    /// use tidewave::scheduler::Scheduler;
    ///
    /// // Resolve with the environment after one logical millisecond.
    /// let effect: Effect<i32, String, i32> =
    ///     Effect::from_async(|environment, resumption, scheduler| {
    ///         let value = *environment;
    ///         let task = scheduler.delay(
    ///             Box::new(move || resumption.succeed(value)),
    ///             1,
    ///         );
    ///         let scheduler = scheduler.clone();
    ///         Cancellation::of(move || scheduler.cancel(task))
    ///     });
    /// ```
    pub fn from_async<F>(register: F) -> Self
    where
        F: Fn(&R, Resumption<E, A>, &Rc<dyn Scheduler>) -> Cancellation + 'static,
    {
        Self::from_async_raw(move |environment, resumption, scheduler| {
            let environment = environment.downcast_ref::<R>().expect(ENV_MISMATCH);
            register(environment, Resumption::from_raw(resumption), scheduler)
        })
    }

    /// The untyped registration primitive the typed combinators build
    /// on.
    pub(crate) fn from_async_raw<F>(register: F) -> Self
    where
        F: Fn(&AnyEnv, RawResumption, &Rc<dyn Scheduler>) -> Cancellation + 'static,
    {
        Self::from_instruction(Rc::new(Instr::Async(Rc::new(register))))
    }

    /// Integrates a `Future` as an effect.
    ///
    /// `factory` builds a fresh future per execution. The future is
    /// polled cooperatively through the scheduler: promptly after its
    /// waker fires, otherwise once per logical millisecond. Cancelling
    /// the effect drops the future.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use tidewave::effect::Effect;
    ///
    /// let effect: Effect<(), String, i32> =
    ///     Effect::encase_future(|| std::future::ready(Ok(42)));
    /// ```
    pub fn encase_future<F, Fut>(factory: F) -> Self
    where
        F: Fn() -> Fut + 'static,
        Fut: Future<Output = Result<A, E>> + 'static,
    {
        Self::from_async_raw(move |_environment, resumption, scheduler| {
            let future: Pin<Box<dyn Future<Output = Result<A, E>>>> = Box::pin(factory());
            let driver = Rc::new(FutureDriver {
                future: RefCell::new(Some(future)),
                resumption,
                scheduler: scheduler.clone(),
                signal: Arc::new(WakeSignal {
                    woken: AtomicBool::new(false),
                }),
                stopped: Cell::new(false),
            });
            FutureDriver::poll_now(&driver);
            Cancellation::of(move || driver.stop())
        })
    }

    /// Reads a projection of the environment.
    pub fn access<F>(function: F) -> Self
    where
        F: Fn(&R) -> A + 'static,
    {
        Self::from_async_raw(move |environment, resumption, _scheduler| {
            let environment = environment.downcast_ref::<R>().expect(ENV_MISMATCH);
            resumption.succeed(Box::new(function(environment)));
            Cancellation::none()
        })
    }

    /// An effect that succeeds with `value` after `delay_ms` logical
    /// milliseconds.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use tidewave::effect::Effect;
    ///
    /// let effect: Effect<(), String, &str> = Effect::timeout("A", 1000);
    /// ```
    pub fn timeout(value: A, delay_ms: u64) -> Self
    where
        A: Clone,
    {
        Self::from_async_raw(move |_environment, resumption, scheduler| {
            let produced = value.clone();
            let task = scheduler.delay(
                Box::new(move || resumption.succeed(Box::new(produced))),
                delay_ms,
            );
            let scheduler = scheduler.clone();
            Cancellation::of(move || scheduler.cancel(task))
        })
    }
}

impl<R: 'static, E: 'static> Effect<R, E, ()> {
    /// The unit effect.
    #[must_use]
    pub fn unit() -> Self {
        Self::of(())
    }

    /// An effect that succeeds with `()` after `delay_ms` logical
    /// milliseconds.
    #[must_use]
    pub fn sleep(delay_ms: u64) -> Self {
        Self::timeout((), delay_ms)
    }
}

impl<R: Clone + 'static, E: 'static> Effect<R, E, R> {
    /// Reads the whole environment.
    #[must_use]
    pub fn environment() -> Self {
        Self::access(Clone::clone)
    }
}

// =============================================================================
// Composition
// =============================================================================

impl<R: 'static, E: 'static, A: 'static> Effect<R, E, A> {
    /// Applies a pure function to the success value.
    ///
    /// A panic inside `function` is captured as a defect.
    pub fn map<B, F>(self, function: F) -> Effect<R, E, B>
    where
        B: 'static,
        F: Fn(A) -> B + 'static,
    {
        Effect::from_instruction(Rc::new(Instr::Map {
            inner: self.into_instruction(),
            function: Rc::new(move |value: AnyValue| {
                let value = *value.downcast::<A>().expect(VALUE_MISMATCH);
                Box::new(function(value)) as AnyValue
            }),
        }))
    }

    /// Sequences a dependent effect after this one.
    ///
    /// The continuation runs only on success; failures short-circuit
    /// past it.
    pub fn chain<B, F>(self, function: F) -> Effect<R, E, B>
    where
        B: 'static,
        F: Fn(A) -> Effect<R, E, B> + 'static,
    {
        Effect::from_instruction(Rc::new(Instr::Chain {
            inner: self.into_instruction(),
            function: Rc::new(move |value: AnyValue| {
                let value = *value.downcast::<A>().expect(VALUE_MISMATCH);
                function(value).into_instruction()
            }),
        }))
    }

    /// Sequences two effects, discarding this one's value.
    pub fn then<B>(self, next: Effect<R, E, B>) -> Effect<R, E, B>
    where
        B: 'static,
    {
        self.chain(move |_| next.clone())
    }

    /// Recovers from a failure, typed error or defect alike, with a new
    /// effect.
    ///
    /// Skipped entirely on the success path. The handler may change the
    /// error type; a panic inside it is itself a defect.
    pub fn catch<F2, H>(self, handler: H) -> Effect<R, F2, A>
    where
        F2: 'static,
        H: Fn(Failure<E>) -> Effect<R, F2, A> + 'static,
    {
        Effect::from_instruction(Rc::new(Instr::Catch {
            inner: self.into_instruction(),
            handler: Rc::new(move |failure: AnyFailure| {
                handler(failure.into_failure::<E>()).into_instruction()
            }),
        }))
    }

    /// Transforms the typed error; defects pass through untouched.
    pub fn map_error<F2, F>(self, function: F) -> Effect<R, F2, A>
    where
        F2: 'static,
        F: Fn(E) -> F2 + 'static,
    {
        self.catch(move |failure| match failure {
            Failure::Error(error) => {
                Effect::fail_once_with(AnyFailure::Error(Box::new(function(error))))
            }
            Failure::Defect(message) => Effect::fail_once_with(AnyFailure::Defect(message)),
        })
    }

    /// Materializes the outcome, making the effect infallible.
    pub fn attempt<F2>(self) -> Effect<R, F2, Result<A, Failure<E>>>
    where
        F2: 'static,
    {
        self.map(|value| Ok::<A, Failure<E>>(value))
            .catch(|failure| Effect::of_once(Err(failure)))
    }

    /// Supplies the environment, eliminating the requirement.
    ///
    /// The inner effect is forked as a child fiber running against the
    /// supplied environment, whatever environment the outer effect runs
    /// in. Cancelling the outer effect cancels the child.
    pub fn provide<R2>(self, environment: R) -> Effect<R2, E, A>
    where
        R2: 'static,
    {
        let provided: AnyEnv = Rc::new(environment);
        let instruction = self.into_instruction();
        Effect::from_async_raw(move |_outer, resumption, scheduler| {
            let on_success: Box<dyn FnOnce(AnyValue)> = {
                let resumption = resumption.clone();
                Box::new(move |value| resumption.succeed(value))
            };
            let on_failure: Box<dyn FnOnce(AnyFailure)> = {
                let resumption = resumption.clone();
                Box::new(move |failure| resumption.fail(failure))
            };
            let child = fork(
                instruction.clone(),
                provided.clone(),
                scheduler,
                on_success,
                on_failure,
            );
            Cancellation::of(move || child.cancel())
        })
    }

    /// Delays the success value by `delay_ms` logical milliseconds.
    ///
    /// Failures are not delayed; they short-circuit immediately.
    #[must_use]
    pub fn delay(self, delay_ms: u64) -> Self {
        self.chain(move |value| {
            let slot = Rc::new(RefCell::new(Some(value)));
            Effect::from_async_raw(move |_environment, resumption, scheduler| {
                let slot = slot.clone();
                let task = scheduler.delay(
                    Box::new(move || {
                        if let Some(value) = slot.borrow_mut().take() {
                            resumption.succeed(Box::new(value));
                        }
                    }),
                    delay_ms,
                );
                let scheduler = scheduler.clone();
                Cancellation::of(move || scheduler.cancel(task))
            })
        })
    }

    /// Runs both effects concurrently and pairs their results.
    ///
    /// The children are enqueued in argument order; neither starts
    /// synchronously with the parent. If either fails, the other is
    /// cancelled and the pair fails with the first failure. Cancelling
    /// the pair cancels both children.
    pub fn zip<B>(self, other: Effect<R, E, B>) -> Effect<R, E, (A, B)>
    where
        B: 'static,
    {
        let left = self.into_instruction();
        let right = other.into_instruction();
        Effect::from_async_raw(move |environment, resumption, scheduler| {
            let slots: Rc<RefCell<(Option<AnyValue>, Option<AnyValue>)>> =
                Rc::new(RefCell::new((None, None)));
            let settled = Rc::new(Cell::new(false));
            let left_handle: Rc<RefCell<Option<FiberHandle>>> = Rc::new(RefCell::new(None));
            let right_handle: Rc<RefCell<Option<FiberHandle>>> = Rc::new(RefCell::new(None));

            let succeed_side = |store_first: bool| {
                let slots = slots.clone();
                let settled = settled.clone();
                let resumption = resumption.clone();
                Box::new(move |value: AnyValue| {
                    if settled.get() {
                        return;
                    }
                    let pair = {
                        let mut slots = slots.borrow_mut();
                        if store_first {
                            slots.0 = Some(value);
                        } else {
                            slots.1 = Some(value);
                        }
                        if slots.0.is_some() && slots.1.is_some() {
                            Some((
                                slots.0.take().expect("zip slot must be filled"),
                                slots.1.take().expect("zip slot must be filled"),
                            ))
                        } else {
                            None
                        }
                    };
                    if let Some((first, second)) = pair {
                        settled.set(true);
                        resumption.succeed(Box::new((
                            *first.downcast::<A>().expect(VALUE_MISMATCH),
                            *second.downcast::<B>().expect(VALUE_MISMATCH),
                        )));
                    }
                }) as Box<dyn FnOnce(AnyValue)>
            };

            let fail_side = |sibling: &Rc<RefCell<Option<FiberHandle>>>| {
                let sibling = sibling.clone();
                let settled = settled.clone();
                let resumption = resumption.clone();
                Box::new(move |failure: AnyFailure| {
                    if settled.replace(true) {
                        return;
                    }
                    if let Some(handle) = sibling.borrow().as_ref() {
                        handle.cancel();
                    }
                    resumption.fail(failure);
                }) as Box<dyn FnOnce(AnyFailure)>
            };

            *left_handle.borrow_mut() = Some(fork(
                left.clone(),
                environment.clone(),
                scheduler,
                succeed_side(true),
                fail_side(&right_handle),
            ));
            *right_handle.borrow_mut() = Some(fork(
                right.clone(),
                environment.clone(),
                scheduler,
                succeed_side(false),
                fail_side(&left_handle),
            ));

            let cancel_left = left_handle.clone();
            let cancel_right = right_handle.clone();
            Cancellation::of(move || {
                if let Some(handle) = cancel_left.borrow().as_ref() {
                    handle.cancel();
                }
                if let Some(handle) = cancel_right.borrow().as_ref() {
                    handle.cancel();
                }
            })
        })
    }

    /// Runs both effects concurrently; the first terminal event,
    /// success or failure, wins and the loser is cancelled.
    ///
    /// `never()` is the identity: `e.race(Effect::never())` behaves
    /// like `e`.
    pub fn race(self, other: Self) -> Self {
        let left = self.into_instruction();
        let right = other.into_instruction();
        Effect::from_async_raw(move |environment, resumption, scheduler| {
            let settled = Rc::new(Cell::new(false));
            let left_handle: Rc<RefCell<Option<FiberHandle>>> = Rc::new(RefCell::new(None));
            let right_handle: Rc<RefCell<Option<FiberHandle>>> = Rc::new(RefCell::new(None));

            let win_success = |sibling: &Rc<RefCell<Option<FiberHandle>>>| {
                let sibling = sibling.clone();
                let settled = settled.clone();
                let resumption = resumption.clone();
                Box::new(move |value: AnyValue| {
                    if settled.replace(true) {
                        return;
                    }
                    if let Some(handle) = sibling.borrow().as_ref() {
                        handle.cancel();
                    }
                    resumption.succeed(value);
                }) as Box<dyn FnOnce(AnyValue)>
            };

            let win_failure = |sibling: &Rc<RefCell<Option<FiberHandle>>>| {
                let sibling = sibling.clone();
                let settled = settled.clone();
                let resumption = resumption.clone();
                Box::new(move |failure: AnyFailure| {
                    if settled.replace(true) {
                        return;
                    }
                    if let Some(handle) = sibling.borrow().as_ref() {
                        handle.cancel();
                    }
                    resumption.fail(failure);
                }) as Box<dyn FnOnce(AnyFailure)>
            };

            *left_handle.borrow_mut() = Some(fork(
                left.clone(),
                environment.clone(),
                scheduler,
                win_success(&right_handle),
                win_failure(&right_handle),
            ));
            *right_handle.borrow_mut() = Some(fork(
                right.clone(),
                environment.clone(),
                scheduler,
                win_success(&left_handle),
                win_failure(&left_handle),
            ));

            let cancel_left = left_handle.clone();
            let cancel_right = right_handle.clone();
            Cancellation::of(move || {
                if let Some(handle) = cancel_left.borrow().as_ref() {
                    handle.cancel();
                }
                if let Some(handle) = cancel_right.borrow().as_ref() {
                    handle.cancel();
                }
            })
        })
    }

    /// Shares a single execution among every subscriber.
    ///
    /// The first execution starts the work; executions while it is
    /// pending attach as subscribers and are resumed, in order, through
    /// the scheduler once it settles. The outcome, success *or*
    /// failure, is cached and delivered to all later executions
    /// immediately. Cancelling one subscriber detaches it without
    /// stopping the shared work.
    ///
    /// The shared execution runs against the environment of the first
    /// subscriber.
    #[must_use]
    pub fn once(self) -> Self
    where
        A: Clone,
        E: Clone,
    {
        let shared: Rc<OnceShared<A, E>> = Rc::new(OnceShared {
            state: RefCell::new(OnceInner::Idle),
            next_subscriber: Cell::new(0),
        });
        let instruction = self.attempt::<E>().into_instruction();
        Effect::from_async_raw(move |environment, resumption, scheduler| {
            let subscriber = shared.next_subscriber.get();
            shared.next_subscriber.set(subscriber + 1);

            let mut resumption = Some(resumption);
            let (cached, start) = {
                let mut state = shared.state.borrow_mut();
                match &mut *state {
                    OnceInner::Settled(outcome) => (Some(outcome.clone()), false),
                    OnceInner::Running { subscribers } => {
                        subscribers.push((
                            subscriber,
                            resumption.take().expect("subscriber resumption taken once"),
                        ));
                        (None, false)
                    }
                    idle => {
                        *idle = OnceInner::Running {
                            subscribers: vec![(
                                subscriber,
                                resumption.take().expect("subscriber resumption taken once"),
                            )],
                        };
                        (None, true)
                    }
                }
            };

            if let Some(outcome) = cached {
                if let Some(resumption) = resumption.take() {
                    deliver_outcome(&resumption, outcome);
                }
                return Cancellation::none();
            }

            if start {
                let on_success: Box<dyn FnOnce(AnyValue)> = {
                    let shared = shared.clone();
                    let scheduler = scheduler.clone();
                    Box::new(move |value| {
                        let outcome = *value
                            .downcast::<Result<A, Failure<E>>>()
                            .expect(VALUE_MISMATCH);
                        settle_once(&shared, &scheduler, outcome);
                    })
                };
                let on_failure: Box<dyn FnOnce(AnyFailure)> = {
                    let shared = shared.clone();
                    let scheduler = scheduler.clone();
                    Box::new(move |failure| {
                        settle_once(&shared, &scheduler, Err(failure.into_failure::<E>()));
                    })
                };
                fork(
                    instruction.clone(),
                    environment.clone(),
                    scheduler,
                    on_success,
                    on_failure,
                );
            }

            let shared = shared.clone();
            Cancellation::of(move || {
                if let OnceInner::Running { subscribers } = &mut *shared.state.borrow_mut() {
                    subscribers.retain(|(id, _)| *id != subscriber);
                }
            })
        })
    }
}

/// Forks a child fiber through the scheduler (argument-order start).
fn fork(
    instruction: Rc<Instr>,
    environment: AnyEnv,
    scheduler: &Rc<dyn Scheduler>,
    on_success: Box<dyn FnOnce(AnyValue)>,
    on_failure: Box<dyn FnOnce(AnyFailure)>,
) -> FiberHandle {
    Fiber::spawn(
        instruction,
        environment,
        scheduler.clone(),
        Runtime::DEFAULT_TURN_BUDGET,
        on_success,
        on_failure,
    )
}

// =============================================================================
// once() sharing state
// =============================================================================

enum OnceInner<A, E> {
    Idle,
    Running {
        subscribers: Vec<(u64, RawResumption)>,
    },
    Settled(Result<A, Failure<E>>),
}

struct OnceShared<A, E> {
    state: RefCell<OnceInner<A, E>>,
    next_subscriber: Cell<u64>,
}

fn settle_once<A: Clone + 'static, E: Clone + 'static>(
    shared: &Rc<OnceShared<A, E>>,
    scheduler: &Rc<dyn Scheduler>,
    outcome: Result<A, Failure<E>>,
) {
    let subscribers = {
        let mut state = shared.state.borrow_mut();
        match std::mem::replace(&mut *state, OnceInner::Settled(outcome.clone())) {
            OnceInner::Running { subscribers } => subscribers,
            OnceInner::Idle | OnceInner::Settled(_) => Vec::new(),
        }
    };
    // Waiters resume through the scheduler, never inline, so the
    // settling fiber is not entangled with their continuations.
    for (_, subscriber) in subscribers {
        let outcome = outcome.clone();
        scheduler.asap(Box::new(move || deliver_outcome(&subscriber, outcome)));
    }
}

// =============================================================================
// Future integration
// =============================================================================

struct WakeSignal {
    woken: AtomicBool,
}

impl Wake for WakeSignal {
    fn wake(self: Arc<Self>) {
        self.woken.store(true, Ordering::Release);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.woken.store(true, Ordering::Release);
    }
}

/// Polls a future cooperatively through the scheduler.
struct FutureDriver<A, E> {
    future: RefCell<Option<Pin<Box<dyn Future<Output = Result<A, E>>>>>>,
    resumption: RawResumption,
    scheduler: Rc<dyn Scheduler>,
    signal: Arc<WakeSignal>,
    stopped: Cell<bool>,
}

impl<A: 'static, E: 'static> FutureDriver<A, E> {
    fn poll_now(driver: &Rc<Self>) {
        if driver.stopped.get() {
            return;
        }
        let completion = {
            let mut slot = driver.future.borrow_mut();
            let Some(future) = slot.as_mut() else {
                return;
            };
            driver.signal.woken.store(false, Ordering::Release);
            let waker = Waker::from(driver.signal.clone());
            let mut context = Context::from_waker(&waker);
            match future.as_mut().poll(&mut context) {
                Poll::Ready(outcome) => {
                    *slot = None;
                    Some(outcome)
                }
                Poll::Pending => None,
            }
        };
        match completion {
            Some(Ok(value)) => driver.resumption.succeed(Box::new(value)),
            Some(Err(error)) => driver.resumption.fail(AnyFailure::Error(Box::new(error))),
            None => Self::schedule_poll(driver),
        }
    }

    fn schedule_poll(driver: &Rc<Self>) {
        let next = driver.clone();
        let task = Box::new(move || Self::poll_now(&next));
        if driver.signal.woken.load(Ordering::Acquire) {
            driver.scheduler.asap(task);
        } else {
            driver.scheduler.delay(task, 1);
        }
    }

    fn stop(&self) {
        self.stopped.set(true);
        *self.future.borrow_mut() = None;
    }
}
