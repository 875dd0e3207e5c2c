//! The tagged instruction algebra.
//!
//! An [`Effect`](super::Effect) is a typed facade over a closed set of
//! tagged instruction nodes. Values and errors flow through the
//! interpreter type-erased as `Box<dyn Any>`; the typed combinators wrap
//! user functions so that erasure and re-typing happen exactly at the
//! effect boundary. This is the same discipline the crate uses for
//! stream state: a tight, tag-dispatched `while` loop over plain data,
//! with `downcast().expect(..)` guarding invariants that hold by
//! construction.
//!
//! Instruction trees are immutable and `Rc`-shared, so cloning an effect
//! is cheap and executing it twice walks the same tree with independent
//! fiber state. Closures stored in instructions are `Rc<dyn Fn ..>` for
//! the same reason.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use super::failure::Failure;
use super::runtime::{Cancellation, RawResumption};
use crate::scheduler::Scheduler;

/// A type-erased success value.
pub(crate) type AnyValue = Box<dyn Any>;

/// A type-erased environment, shared by every instruction of a fiber.
pub(crate) type AnyEnv = Rc<dyn Any>;

/// Panic message for impossible value downcasts.
pub(crate) const VALUE_MISMATCH: &str = "type mismatch in effect value";

/// Panic message for impossible error downcasts.
pub(crate) const ERROR_MISMATCH: &str = "type mismatch in effect error";

/// Panic message for impossible environment downcasts.
pub(crate) const ENV_MISMATCH: &str = "type mismatch in effect environment";

/// A type-erased failure travelling the error channel.
pub(crate) enum AnyFailure {
    /// A typed `E`, boxed.
    Error(AnyValue),
    /// A captured panic message.
    Defect(String),
}

impl AnyFailure {
    /// Re-types an erased failure at the effect boundary.
    pub(crate) fn into_failure<E: 'static>(self) -> Failure<E> {
        match self {
            Self::Error(error) => Failure::Error(*error.downcast::<E>().expect(ERROR_MISMATCH)),
            Self::Defect(message) => Failure::Defect(message),
        }
    }

    /// Erases a typed failure.
    pub(crate) fn from_failure<E: 'static>(failure: Failure<E>) -> Self {
        match failure {
            Failure::Error(error) => Self::Error(Box::new(error)),
            Failure::Defect(message) => Self::Defect(message),
        }
    }
}

/// A pure continuation applied to the last produced value (`Map`).
pub(crate) type ResumeFn = dyn Fn(AnyValue) -> AnyValue;

/// A continuation producing the next instruction to evaluate (`Chain`).
pub(crate) type ResumeMFn = dyn Fn(AnyValue) -> Rc<Instr>;

/// A recovery continuation for the error channel (`Catch`).
pub(crate) type RecoverFn = dyn Fn(AnyFailure) -> Rc<Instr>;

/// An async registration: receives the environment, a resumption handle
/// and the scheduler; returns the token that releases the registration.
pub(crate) type RegisterFn = dyn Fn(&AnyEnv, RawResumption, &Rc<dyn Scheduler>) -> Cancellation;

/// The closed instruction set the evaluator dispatches on.
pub(crate) enum Instr {
    /// Succeed immediately with the produced value.
    Constant(Rc<dyn Fn() -> AnyValue>),
    /// Fail immediately with the produced failure.
    Reject(Rc<dyn Fn() -> AnyFailure>),
    /// Evaluate `inner`, then apply the pure function to its value.
    Map {
        /// The instruction producing the input value.
        inner: Rc<Instr>,
        /// The pure continuation.
        function: Rc<ResumeFn>,
    },
    /// Evaluate `inner`, then interpret the function's result next.
    Chain {
        /// The instruction producing the input value.
        inner: Rc<Instr>,
        /// The instruction-returning continuation.
        function: Rc<ResumeMFn>,
    },
    /// Evaluate `inner`; on failure, interpret the handler's result.
    Catch {
        /// The guarded instruction.
        inner: Rc<Instr>,
        /// The recovery continuation.
        handler: Rc<RecoverFn>,
    },
    /// Defer construction of the next instruction to evaluation time.
    Suspend(Rc<dyn Fn() -> Rc<Instr>>),
    /// Yield to an external registration until a callback fires.
    Async(Rc<RegisterFn>),
    /// Never complete (until cancelled).
    Never,
}

impl Instr {
    /// The tag name, for `Debug` output.
    pub(crate) const fn tag(&self) -> &'static str {
        match self {
            Self::Constant(_) => "Constant",
            Self::Reject(_) => "Reject",
            Self::Map { .. } => "Map",
            Self::Chain { .. } => "Chain",
            Self::Catch { .. } => "Catch",
            Self::Suspend(_) => "Suspend",
            Self::Async(_) => "Async",
            Self::Never => "Never",
        }
    }

    /// A `Constant` holding a value produced during the current run.
    ///
    /// The node is built fresh each time a run reaches the closure that
    /// creates it, so the value is taken exactly once; a second take
    /// (impossible by construction) surfaces as a defect.
    pub(crate) fn succeed_once(value: AnyValue) -> Rc<Self> {
        let slot = RefCell::new(Some(value));
        Rc::new(Self::Constant(Rc::new(move || {
            slot.borrow_mut()
                .take()
                .expect("single-use effect value already consumed")
        })))
    }

    /// A `Reject` holding a failure produced during the current run.
    pub(crate) fn fail_once(failure: AnyFailure) -> Rc<Self> {
        let slot = RefCell::new(Some(failure));
        Rc::new(Self::Reject(Rc::new(move || {
            slot.borrow_mut()
                .take()
                .expect("single-use effect failure already consumed")
        })))
    }
}

thread_local! {
    /// Shared sentinel swapped into unlinked child slots during teardown.
    static DETACHED: Rc<Instr> = Rc::new(Instr::Never);
}

fn detached() -> Rc<Instr> {
    DETACHED.with(Rc::clone)
}

/// Moves the node's children onto the explicit teardown stack.
fn unlink_children(node: &mut Instr, pending: &mut Vec<Rc<Instr>>) {
    match node {
        Instr::Map { inner, .. } | Instr::Chain { inner, .. } | Instr::Catch { inner, .. } => {
            pending.push(std::mem::replace(inner, detached()));
        }
        Instr::Constant(_)
        | Instr::Reject(_)
        | Instr::Suspend(_)
        | Instr::Async(_)
        | Instr::Never => {}
    }
}

// A chain of a million nodes must not tear down by native recursion any
// more than it may evaluate by it: children are unlinked onto an
// explicit stack and dropped iteratively.
impl Drop for Instr {
    fn drop(&mut self) {
        let mut pending: Vec<Rc<Instr>> = Vec::new();
        unlink_children(self, &mut pending);
        while let Some(node) = pending.pop() {
            if let Some(mut owned) = Rc::into_inner(node) {
                unlink_children(&mut owned, &mut pending);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn tags_name_every_variant() {
        assert_eq!(Instr::Never.tag(), "Never");
        assert_eq!(
            Instr::Constant(Rc::new(|| Box::new(1_i32) as AnyValue)).tag(),
            "Constant"
        );
    }

    #[rstest]
    fn succeed_once_yields_its_value_exactly_once() {
        let node = Instr::succeed_once(Box::new(7_i32));
        let Instr::Constant(produce) = &*node else {
            panic!("expected a Constant node");
        };

        let value = produce();
        assert_eq!(*value.downcast::<i32>().expect("i32 value"), 7);
    }

    #[rstest]
    fn dropping_a_deep_chain_does_not_recurse() {
        let mut node: Rc<Instr> = Instr::succeed_once(Box::new(0_i32));
        for _ in 0..1_000_000 {
            node = Rc::new(Instr::Map {
                inner: node,
                function: Rc::new(|value| value),
            });
        }
        drop(node);
    }
}
