//! The fiber evaluator.
//!
//! Executing an effect creates a **fiber**: the current instruction (or
//! the value/failure it produced), an explicit stack of continuation
//! frames, the environment, the caller's terminal callbacks, and a
//! cancellation state. The evaluator is a trampolined `loop` over the
//! tagged instruction set. `Chain`, `Map` and `Catch` push frames instead of
//! making native calls, so a chain of a million steps uses O(1) native
//! stack and O(n) heap.
//!
//! # Turn budget
//!
//! One turn of the loop performs a bounded number of dispatches (the
//! runtime's turn budget, 255 by default) and then re-schedules itself
//! through the scheduler, so a long synchronous chain cannot starve
//! other scheduled work. Purely synchronous effects still complete
//! within `drain` because the continuation goes back on the same queue.
//!
//! # Resumptions and staleness
//!
//! Suspending on an `Async` instruction installs a [`RawResumption`]
//! carrying the fiber and a monotonically increasing epoch. A resumption
//! whose epoch no longer matches the fiber's is stale and ignored, which
//! makes double completion and post-cancellation callbacks harmless. A
//! registration may legally complete synchronously while it is still
//! being installed; the evaluator stashes that early completion and
//! continues its own loop instead of recursing.
//!
//! # Cancellation
//!
//! Cancelling a fiber releases whatever it is waiting on (a pending
//! async registration or a scheduled continuation), drops the terminal
//! callbacks so neither ever fires, and is idempotent.

use smallvec::SmallVec;
use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

use super::core::Effect;
use super::failure::{panic_message, Failure, SyncRunError};
use super::instruction::{AnyEnv, AnyFailure, AnyValue, Instr, RecoverFn, ResumeFn, ResumeMFn};
use crate::scheduler::{Scheduler, TaskId};

/// The token an async registration returns so the evaluator can release
/// it on cancellation.
///
/// A registration with nothing to release returns
/// [`Cancellation::none()`]; cancelling it is a successful no-op.
#[derive(Clone, Default)]
pub struct Cancellation {
    action: Option<Rc<dyn Fn()>>,
}

impl Cancellation {
    /// The no-op token: no cancellation is possible or necessary.
    #[must_use]
    pub const fn none() -> Self {
        Self { action: None }
    }

    /// A token running `action` when the registration is released.
    ///
    /// The action must tolerate being called after the registration has
    /// already completed.
    #[must_use]
    pub fn of<F>(action: F) -> Self
    where
        F: Fn() + 'static,
    {
        Self {
            action: Some(Rc::new(action)),
        }
    }

    pub(crate) fn run(&self) {
        if let Some(action) = &self.action {
            action();
        }
    }
}

impl fmt::Debug for Cancellation {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_tuple("Cancellation")
            .field(&self.action.as_ref().map_or("none", |_| "action"))
            .finish()
    }
}

/// A completed async registration: the value or failure it produced.
pub(crate) type Completion = Result<AnyValue, AnyFailure>;

/// What the evaluator holds between dispatches: an instruction to
/// dispatch, or the value/failure the previous dispatch produced.
pub(crate) enum Current {
    Dispatch(Rc<Instr>),
    Succeed(AnyValue),
    Fail(AnyFailure),
}

impl Current {
    fn from_completion(completion: Completion) -> Self {
        match completion {
            Ok(value) => Self::Succeed(value),
            Err(failure) => Self::Fail(failure),
        }
    }
}

/// A pending continuation frame.
///
/// `Resume` applies a pure function to the last produced value (pushed
/// by `Map`); `ResumeM` interprets the function's result as the next
/// instruction (pushed by `Chain`); `Recover` is the error-channel
/// handler (pushed by `Catch`, skipped on the success path).
enum Frame {
    Resume(Rc<ResumeFn>),
    ResumeM(Rc<ResumeMFn>),
    Recover(Rc<RecoverFn>),
}

/// Inline capacity of the continuation stack; short chains never touch
/// the heap for frames.
const FRAME_STACK_INLINE: usize = 8;

enum Phase {
    /// Spawned but not yet started; holds the root instruction.
    Created { instruction: Rc<Instr> },
    /// Inside the dispatch loop.
    Running,
    /// An async registration is being installed; a synchronous
    /// completion is stashed in `early`.
    Registering { early: Option<Completion> },
    /// Suspended on an async registration.
    Suspended { cancellation: Cancellation },
    /// Turn budget exhausted; the continuation is queued as `task`.
    Yielded { task: TaskId },
    /// Terminal: a callback was delivered.
    Done,
    /// Terminal: cancelled, nothing was or will be delivered.
    Cancelled,
}

struct FiberState {
    phase: Phase,
    stack: SmallVec<[Frame; FRAME_STACK_INLINE]>,
    on_success: Option<Box<dyn FnOnce(AnyValue)>>,
    on_failure: Option<Box<dyn FnOnce(AnyFailure)>>,
    epoch: u64,
}

impl FiberState {
    fn clear(&mut self) {
        self.stack.clear();
        self.on_success = None;
        self.on_failure = None;
    }
}

/// A single top-level execution of an effect.
pub(crate) struct Fiber {
    scheduler: Rc<dyn Scheduler>,
    turn_budget: usize,
    environment: AnyEnv,
    state: RefCell<FiberState>,
}

enum Release {
    Registration(Cancellation),
    Turn(TaskId),
    Nothing,
}

impl Fiber {
    /// Creates a fiber and enqueues its start through the scheduler, so
    /// fibers started earlier dispatch earlier and no fiber runs
    /// synchronously with its spawner.
    pub(crate) fn spawn(
        instruction: Rc<Instr>,
        environment: AnyEnv,
        scheduler: Rc<dyn Scheduler>,
        turn_budget: usize,
        on_success: Box<dyn FnOnce(AnyValue)>,
        on_failure: Box<dyn FnOnce(AnyFailure)>,
    ) -> FiberHandle {
        let fiber = Rc::new(Self {
            scheduler: scheduler.clone(),
            turn_budget,
            environment,
            state: RefCell::new(FiberState {
                phase: Phase::Created { instruction },
                stack: SmallVec::new(),
                on_success: Some(on_success),
                on_failure: Some(on_failure),
                epoch: 0,
            }),
        });
        let starter = fiber.clone();
        scheduler.asap(Box::new(move || starter.start()));
        FiberHandle { fiber }
    }

    fn start(self: Rc<Self>) {
        let instruction = {
            let mut state = self.state.borrow_mut();
            match std::mem::replace(&mut state.phase, Phase::Running) {
                Phase::Created { instruction } => instruction,
                previous => {
                    // Cancelled before the start task ran.
                    state.phase = previous;
                    return;
                }
            }
        };
        self.resume(Current::Dispatch(instruction));
    }

    fn is_cancelled(&self) -> bool {
        matches!(self.state.borrow().phase, Phase::Cancelled)
    }

    /// The dispatch loop: one call runs at most `turn_budget` dispatches
    /// and either terminates the fiber, suspends it, or re-schedules the
    /// continuation.
    #[allow(clippy::too_many_lines)]
    fn resume(self: Rc<Self>, mut current: Current) {
        let mut steps = 0_usize;
        loop {
            // A cancelled fiber dispatches nothing further; a user
            // closure may have cancelled the handle mid-turn.
            if self.is_cancelled() {
                return;
            }

            if steps >= self.turn_budget {
                let continuation = self.clone();
                let task = self
                    .scheduler
                    .asap(Box::new(move || continuation.continue_turn(current)));
                self.state.borrow_mut().phase = Phase::Yielded { task };
                return;
            }
            steps += 1;

            current = match current {
                Current::Dispatch(instruction) => match &*instruction {
                    Instr::Constant(produce) => {
                        match catch_unwind(AssertUnwindSafe(|| produce())) {
                            Ok(value) => Current::Succeed(value),
                            Err(payload) => {
                                Current::Fail(AnyFailure::Defect(panic_message(payload)))
                            }
                        }
                    }
                    Instr::Reject(produce) => match catch_unwind(AssertUnwindSafe(|| produce())) {
                        Ok(failure) => Current::Fail(failure),
                        Err(payload) => Current::Fail(AnyFailure::Defect(panic_message(payload))),
                    },
                    Instr::Map { inner, function } => {
                        self.state
                            .borrow_mut()
                            .stack
                            .push(Frame::Resume(function.clone()));
                        Current::Dispatch(inner.clone())
                    }
                    Instr::Chain { inner, function } => {
                        self.state
                            .borrow_mut()
                            .stack
                            .push(Frame::ResumeM(function.clone()));
                        Current::Dispatch(inner.clone())
                    }
                    Instr::Catch { inner, handler } => {
                        self.state
                            .borrow_mut()
                            .stack
                            .push(Frame::Recover(handler.clone()));
                        Current::Dispatch(inner.clone())
                    }
                    Instr::Suspend(thunk) => match catch_unwind(AssertUnwindSafe(|| thunk())) {
                        Ok(next) => Current::Dispatch(next),
                        Err(payload) => Current::Fail(AnyFailure::Defect(panic_message(payload))),
                    },
                    Instr::Never => {
                        let mut state = self.state.borrow_mut();
                        state.epoch += 1;
                        state.phase = Phase::Suspended {
                            cancellation: Cancellation::none(),
                        };
                        return;
                    }
                    Instr::Async(register) => {
                        let epoch = {
                            let mut state = self.state.borrow_mut();
                            state.epoch += 1;
                            state.phase = Phase::Registering { early: None };
                            state.epoch
                        };
                        let resumption = RawResumption {
                            fiber: self.clone(),
                            epoch,
                        };
                        let registered = catch_unwind(AssertUnwindSafe(|| {
                            register(&self.environment, resumption, &self.scheduler)
                        }));
                        match registered {
                            // A registration that throws synchronously
                            // is a rejection.
                            Err(payload) => {
                                self.state.borrow_mut().phase = Phase::Running;
                                Current::Fail(AnyFailure::Defect(panic_message(payload)))
                            }
                            Ok(cancellation) => {
                                let mut state = self.state.borrow_mut();
                                match std::mem::replace(&mut state.phase, Phase::Running) {
                                    Phase::Registering {
                                        early: Some(completion),
                                    } => Current::from_completion(completion),
                                    Phase::Registering { early: None } => {
                                        state.phase = Phase::Suspended { cancellation };
                                        return;
                                    }
                                    Phase::Cancelled => {
                                        // Cancelled re-entrantly during
                                        // registration: release it.
                                        state.phase = Phase::Cancelled;
                                        drop(state);
                                        cancellation.run();
                                        return;
                                    }
                                    previous => {
                                        state.phase = previous;
                                        return;
                                    }
                                }
                            }
                        }
                    }
                },
                Current::Succeed(value) => {
                    let frame = self.state.borrow_mut().stack.pop();
                    match frame {
                        None => {
                            self.deliver_success(value);
                            return;
                        }
                        Some(Frame::Resume(function)) => {
                            match catch_unwind(AssertUnwindSafe(|| function(value))) {
                                Ok(next) => Current::Succeed(next),
                                Err(payload) => {
                                    Current::Fail(AnyFailure::Defect(panic_message(payload)))
                                }
                            }
                        }
                        Some(Frame::ResumeM(function)) => {
                            match catch_unwind(AssertUnwindSafe(|| function(value))) {
                                Ok(next) => Current::Dispatch(next),
                                Err(payload) => {
                                    Current::Fail(AnyFailure::Defect(panic_message(payload)))
                                }
                            }
                        }
                        // The success path skips recovery frames.
                        Some(Frame::Recover(_)) => Current::Succeed(value),
                    }
                }
                Current::Fail(failure) => {
                    // Unwind to the nearest recovery frame.
                    let handler = loop {
                        match self.state.borrow_mut().stack.pop() {
                            None => break None,
                            Some(Frame::Recover(handler)) => break Some(handler),
                            Some(Frame::Resume(_) | Frame::ResumeM(_)) => {}
                        }
                    };
                    match handler {
                        None => {
                            self.deliver_failure(failure);
                            return;
                        }
                        Some(handler) => {
                            match catch_unwind(AssertUnwindSafe(|| handler(failure))) {
                                Ok(next) => Current::Dispatch(next),
                                Err(payload) => {
                                    Current::Fail(AnyFailure::Defect(panic_message(payload)))
                                }
                            }
                        }
                    }
                }
            };
        }
    }

    /// Re-enters the loop after a turn-budget yield.
    fn continue_turn(self: Rc<Self>, current: Current) {
        {
            let mut state = self.state.borrow_mut();
            if matches!(state.phase, Phase::Cancelled | Phase::Done) {
                return;
            }
            state.phase = Phase::Running;
        }
        self.resume(current);
    }

    /// Re-enters the loop when an async registration completes.
    fn resume_from_async(self: Rc<Self>, epoch: u64, completion: Completion) {
        let mut completion = Some(completion);
        let proceed = {
            let mut state = self.state.borrow_mut();
            if state.epoch != epoch {
                // Stale resumption from a superseded registration.
                false
            } else if let Phase::Registering { early } = &mut state.phase {
                // Fired synchronously during registration; the
                // evaluator picks this up without recursing.
                if early.is_none() {
                    *early = completion.take();
                }
                false
            } else if matches!(state.phase, Phase::Suspended { .. }) {
                state.phase = Phase::Running;
                true
            } else {
                // Done, cancelled, or a duplicate callback.
                false
            }
        };
        if proceed {
            if let Some(completion) = completion {
                self.resume(Current::from_completion(completion));
            }
        }
    }

    fn deliver_success(&self, value: AnyValue) {
        let callback = {
            let mut state = self.state.borrow_mut();
            state.phase = Phase::Done;
            let callback = state.on_success.take();
            state.clear();
            callback
        };
        if let Some(callback) = callback {
            callback(value);
        }
    }

    fn deliver_failure(&self, failure: AnyFailure) {
        let callback = {
            let mut state = self.state.borrow_mut();
            state.phase = Phase::Done;
            let callback = state.on_failure.take();
            state.clear();
            callback
        };
        if let Some(callback) = callback {
            callback(failure);
        }
    }

    /// Cancels the fiber: releases whatever it waits on, drops the
    /// callbacks, dispatches nothing further. Idempotent; a no-op on a
    /// completed fiber.
    fn cancel(&self) {
        let release = {
            let mut state = self.state.borrow_mut();
            match std::mem::replace(&mut state.phase, Phase::Cancelled) {
                Phase::Done => {
                    state.phase = Phase::Done;
                    return;
                }
                Phase::Cancelled => return,
                Phase::Suspended { cancellation } => {
                    state.clear();
                    Release::Registration(cancellation)
                }
                Phase::Yielded { task } => {
                    state.clear();
                    Release::Turn(task)
                }
                Phase::Created { .. } | Phase::Running | Phase::Registering { .. } => {
                    state.clear();
                    Release::Nothing
                }
            }
        };
        match release {
            Release::Registration(cancellation) => cancellation.run(),
            Release::Turn(task) => self.scheduler.cancel(task),
            Release::Nothing => {}
        }
    }
}

/// Completes a fiber resumption with a typed outcome.
pub(crate) fn deliver_outcome<A: 'static, E: 'static>(
    resumption: &RawResumption,
    outcome: Result<A, Failure<E>>,
) {
    match outcome {
        Ok(value) => resumption.succeed(Box::new(value)),
        Err(failure) => resumption.fail(AnyFailure::from_failure(failure)),
    }
}

/// The untyped resumption handle installed by an `Async` dispatch.
///
/// Holds the fiber and the epoch of the registration it belongs to;
/// exactly one completion is honored, everything else is stale.
#[derive(Clone)]
pub(crate) struct RawResumption {
    fiber: Rc<Fiber>,
    epoch: u64,
}

impl RawResumption {
    pub(crate) fn succeed(&self, value: AnyValue) {
        self.fiber.clone().resume_from_async(self.epoch, Ok(value));
    }

    pub(crate) fn fail(&self, failure: AnyFailure) {
        self.fiber
            .clone()
            .resume_from_async(self.epoch, Err(failure));
    }
}

/// The typed resumption handle passed to `Effect::from_async`
/// registrations.
///
/// Exactly one of [`succeed`](Resumption::succeed) /
/// [`fail`](Resumption::fail) takes effect; later calls (and calls after
/// cancellation) are ignored. The handle is cheap to clone so it can be
/// captured by both a completion callback and a timeout path.
pub struct Resumption<E, A> {
    raw: RawResumption,
    _marker: PhantomData<fn(E, A)>,
}

impl<E, A> Clone for Resumption<E, A> {
    fn clone(&self) -> Self {
        Self {
            raw: self.raw.clone(),
            _marker: PhantomData,
        }
    }
}

impl<E: 'static, A: 'static> Resumption<E, A> {
    pub(crate) fn from_raw(raw: RawResumption) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    /// Completes the suspended effect with a success value.
    pub fn succeed(&self, value: A) {
        self.raw.succeed(Box::new(value));
    }

    /// Completes the suspended effect with a typed failure.
    pub fn fail(&self, error: E) {
        self.raw.fail(AnyFailure::Error(Box::new(error)));
    }

    /// Completes the suspended effect with a full failure, defects
    /// included.
    pub fn fail_with(&self, failure: Failure<E>) {
        self.raw.fail(AnyFailure::from_failure(failure));
    }
}

/// The cancel token returned by [`Runtime::execute`].
///
/// Cancelling aborts the fiber: pending async registrations are
/// released and neither terminal callback will ever fire. Cancellation
/// is idempotent, and cancelling a completed fiber is a no-op.
#[derive(Clone)]
pub struct FiberHandle {
    fiber: Rc<Fiber>,
}

impl FiberHandle {
    /// Cancels the fiber.
    pub fn cancel(&self) {
        self.fiber.cancel();
    }

    /// Returns `true` once a terminal callback has been delivered.
    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(self.fiber.state.borrow().phase, Phase::Done)
    }

    /// Returns `true` once the fiber has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.fiber.is_cancelled()
    }
}

impl fmt::Debug for FiberHandle {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self.fiber.state.borrow().phase {
            Phase::Created { .. } => "created",
            Phase::Running => "running",
            Phase::Registering { .. } => "registering",
            Phase::Suspended { .. } => "suspended",
            Phase::Yielded { .. } => "yielded",
            Phase::Done => "done",
            Phase::Cancelled => "cancelled",
        };
        formatter.debug_tuple("FiberHandle").field(&phase).finish()
    }
}

/// The interpreter: launches fibers against a scheduler.
///
/// A runtime is a plain value, with no hidden globals: it holds the
/// scheduler every suspension point yields through and the per-turn
/// dispatch budget.
///
/// # Examples
///
/// ```rust
/// use std::rc::Rc;
/// use tidewave::effect::{Effect, Runtime};
/// use tidewave::scheduler::TestScheduler;
///
/// let runtime = Runtime::new(Rc::new(TestScheduler::new()));
/// let effect: Effect<(), String, i32> = Effect::of(20).map(|x| x + 1);
///
/// assert_eq!(runtime.run_unsafe_sync(effect, ()), 21);
/// ```
pub struct Runtime {
    scheduler: Rc<dyn Scheduler>,
    turn_budget: usize,
}

impl Runtime {
    /// Default number of dispatches per turn before the evaluator yields
    /// back through the scheduler.
    pub const DEFAULT_TURN_BUDGET: usize = 255;

    /// Creates a runtime over the given scheduler with the default turn
    /// budget.
    #[must_use]
    pub fn new(scheduler: Rc<dyn Scheduler>) -> Self {
        Self {
            scheduler,
            turn_budget: Self::DEFAULT_TURN_BUDGET,
        }
    }

    /// Replaces the per-turn dispatch budget.
    ///
    /// A smaller budget yields more often (better fairness with other
    /// scheduled work); a larger one dispatches longer synchronous runs
    /// per turn.
    ///
    /// # Panics
    ///
    /// Panics if `turn_budget` is 0.
    #[must_use]
    pub fn with_turn_budget(mut self, turn_budget: usize) -> Self {
        assert!(turn_budget > 0, "turn_budget must be greater than 0");
        self.turn_budget = turn_budget;
        self
    }

    /// The scheduler this runtime yields through.
    #[must_use]
    pub fn scheduler(&self) -> Rc<dyn Scheduler> {
        self.scheduler.clone()
    }

    /// Starts a fiber executing `effect` against `environment`.
    ///
    /// The fiber's first dispatch is enqueued through the scheduler, so
    /// two fibers started in order dispatch their first steps in order.
    /// Exactly one of `on_success`, `on_failure`, or cancelled silence
    /// is observed per call.
    pub fn execute<R, E, A, S, F>(
        &self,
        effect: Effect<R, E, A>,
        environment: R,
        on_success: S,
        on_failure: F,
    ) -> FiberHandle
    where
        R: 'static,
        E: 'static,
        A: 'static,
        S: FnOnce(A) + 'static,
        F: FnOnce(Failure<E>) + 'static,
    {
        use super::instruction::VALUE_MISMATCH;

        let environment: AnyEnv = Rc::new(environment);
        Fiber::spawn(
            effect.into_instruction(),
            environment,
            self.scheduler.clone(),
            self.turn_budget,
            Box::new(move |value| on_success(*value.downcast::<A>().expect(VALUE_MISMATCH))),
            Box::new(move |failure| on_failure(failure.into_failure::<E>())),
        )
    }

    /// Executes `effect` and drains the scheduler, returning the
    /// outcome.
    ///
    /// With a [`TestScheduler`](crate::scheduler::TestScheduler) this is
    /// fully deterministic; draining advances the logical clock through
    /// any delays the effect schedules. Returns
    /// [`SyncRunError::Pending`] if the queue empties before the effect
    /// completes.
    ///
    /// # Errors
    ///
    /// [`SyncRunError::Failed`] when the effect fails,
    /// [`SyncRunError::Pending`] when it cannot complete.
    pub fn run_sync<R, E, A>(
        &self,
        effect: Effect<R, E, A>,
        environment: R,
    ) -> Result<A, SyncRunError<E>>
    where
        R: 'static,
        E: 'static,
        A: 'static,
    {
        let outcome: Rc<RefCell<Option<Result<A, Failure<E>>>>> = Rc::new(RefCell::new(None));
        let succeeded = outcome.clone();
        let failed = outcome.clone();
        self.execute(
            effect,
            environment,
            move |value| *succeeded.borrow_mut() = Some(Ok(value)),
            move |failure| *failed.borrow_mut() = Some(Err(failure)),
        );
        self.scheduler.drain();
        let result = outcome.borrow_mut().take();
        match result {
            Some(Ok(value)) => Ok(value),
            Some(Err(failure)) => Err(SyncRunError::Failed(failure)),
            None => Err(SyncRunError::Pending),
        }
    }

    /// Executes `effect` synchronously and returns its success value.
    ///
    /// # Panics
    ///
    /// Panics if the effect fails or is still pending after the
    /// scheduler has been drained. Use [`run_sync`](Self::run_sync) for
    /// a non-panicking variant.
    pub fn run_unsafe_sync<R, E, A>(&self, effect: Effect<R, E, A>, environment: R) -> A
    where
        R: 'static,
        E: fmt::Debug + 'static,
        A: 'static,
    {
        match self.run_sync(effect, environment) {
            Ok(value) => value,
            Err(error) => panic!("{error}"),
        }
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Runtime")
            .field("turn_budget", &self.turn_budget)
            .finish_non_exhaustive()
    }
}
