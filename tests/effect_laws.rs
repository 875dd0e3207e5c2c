//! Property-based tests for Effect laws.
//!
//! This module verifies that the effect type satisfies the monad laws:
//! - Left Identity: of(a).chain(f) == f(a)
//! - Right Identity: e.chain(of) == e
//! - Associativity: e.chain(f).chain(g) == e.chain(|x| f(x).chain(g))
//! plus functor fusion and the catch laws.

use std::rc::Rc;

use proptest::prelude::*;
use tidewave::effect::{Effect, Failure, Runtime, SyncRunError};
use tidewave::scheduler::TestScheduler;

type TestEffect = Effect<(), String, i32>;

fn run(effect: TestEffect) -> i32 {
    let runtime = Runtime::new(Rc::new(TestScheduler::new()));
    runtime.run_unsafe_sync(effect, ())
}

fn run_outcome(effect: TestEffect) -> Result<i32, SyncRunError<String>> {
    let runtime = Runtime::new(Rc::new(TestScheduler::new()));
    runtime.run_sync(effect, ())
}

// =============================================================================
// Monad Laws
// =============================================================================

proptest! {
    /// Left Identity Law: of(a).chain(f) == f(a)
    #[test]
    fn prop_left_identity(value: i32) {
        let function = |n: i32| -> TestEffect { Effect::of(n.wrapping_mul(2)) };

        let left_result = run(Effect::of(value).chain(function));
        let right_result = run(function(value));

        prop_assert_eq!(left_result, right_result);
    }

    /// Right Identity Law: e.chain(of) == e
    #[test]
    fn prop_right_identity(value: i32) {
        let left_result = run(Effect::of(value).chain(Effect::of));
        let right_result = run(Effect::of(value));

        prop_assert_eq!(left_result, right_result);
    }

    /// Associativity Law:
    /// e.chain(f).chain(g) == e.chain(|x| f(x).chain(g))
    #[test]
    fn prop_associativity(value: i32) {
        let function1 = |n: i32| -> TestEffect { Effect::of(n.wrapping_add(1)) };
        let function2 = |n: i32| -> TestEffect { Effect::of(n.wrapping_mul(2)) };

        let left_result = run(Effect::of(value).chain(function1).chain(function2));
        let right_result = run(
            Effect::of(value).chain(move |x| function1(x).chain(function2)),
        );

        prop_assert_eq!(left_result, right_result);
    }
}

// =============================================================================
// Functor Laws
// =============================================================================

proptest! {
    /// Functor Identity Law: map(id) == id
    #[test]
    fn prop_functor_identity(value: i32) {
        let left_result = run(Effect::of(value).map(|x| x));
        prop_assert_eq!(left_result, value);
    }

    /// Map Fusion: e.map(f).map(g) == e.map(|x| g(f(x)))
    #[test]
    fn prop_map_fusion(value: i32) {
        let function1 = |x: i32| x.wrapping_add(1);
        let function2 = |x: i32| x.wrapping_mul(2);

        let left_result = run(Effect::of(value).map(function1).map(function2));
        let right_result = run(Effect::of(value).map(move |x| function2(function1(x))));

        prop_assert_eq!(left_result, right_result);
    }
}

// =============================================================================
// Catch Laws
// =============================================================================

proptest! {
    /// Catch skips on success: of(a).catch(h) == of(a)
    #[test]
    fn prop_catch_skips_on_success(value: i32) {
        let recovered = run(Effect::of(value).catch(|_: Failure<String>| Effect::of(0)));
        prop_assert_eq!(recovered, value);
    }

    /// Catch recovers on failure: reject(e).catch(h) == h(e)
    #[test]
    fn prop_catch_recovers_on_failure(message in "[a-z]{1,8}") {
        let handler = |failure: Failure<String>| -> TestEffect {
            match failure {
                Failure::Error(error) => Effect::of(i32::try_from(error.len()).unwrap_or(0)),
                Failure::Defect(_) => Effect::of(-1),
            }
        };

        let left_result = run(Effect::reject(message.clone()).catch(handler));
        let right_result = run(handler(Failure::Error(message)));

        prop_assert_eq!(left_result, right_result);
    }

    /// then discards the first value.
    #[test]
    fn prop_then_discards_first(a: i32, b: i32) {
        let left_result = run(Effect::of(a).then(Effect::of(b)));
        prop_assert_eq!(left_result, b);
    }

    /// map_error rewrites typed errors only.
    #[test]
    fn prop_map_error_rewrites_typed_errors(message in "[a-z]{1,8}") {
        let effect: TestEffect = Effect::reject(message.clone());
        let mapped = effect.map_error(|error| format!("wrapped: {error}"));

        let runtime = Runtime::new(Rc::new(TestScheduler::new()));
        let outcome = runtime.run_sync(mapped, ());
        prop_assert_eq!(
            outcome,
            Err(SyncRunError::Failed(Failure::Error(format!(
                "wrapped: {message}"
            ))))
        );
    }
}

// =============================================================================
// Referential Transparency
// =============================================================================

#[test]
fn test_executing_a_clone_is_independent() {
    let effect: TestEffect = Effect::of(10).map(|x| x * 2).chain(|x| Effect::of(x + 5));
    assert_eq!(run(effect.clone()), 25);
    assert_eq!(run(effect), 25);
}

#[test]
fn test_attempt_materializes_both_channels() {
    let success: TestEffect = Effect::of(3);
    let failure: TestEffect = Effect::reject("down".to_string());

    let runtime = Runtime::new(Rc::new(TestScheduler::new()));
    assert_eq!(
        runtime.run_unsafe_sync(success.attempt::<String>(), ()),
        Ok(3)
    );
    assert_eq!(
        runtime.run_unsafe_sync(failure.attempt::<String>(), ()),
        Err(Failure::Error("down".to_string()))
    );
}

#[test]
fn test_run_sync_reports_pending_effects() {
    let effect: TestEffect = Effect::never();
    assert_eq!(run_outcome(effect), Err(SyncRunError::Pending));
}
