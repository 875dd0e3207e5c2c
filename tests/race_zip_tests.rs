//! Tests for parallel composition: race and zip coordination, sibling
//! cancellation, and timing.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use rstest::rstest;
use tidewave::effect::{Effect, Failure, Runtime};
use tidewave::scheduler::{Scheduler, TestScheduler};

fn fixture() -> (Rc<TestScheduler>, Runtime) {
    let scheduler = Rc::new(TestScheduler::new());
    let runtime = Runtime::new(scheduler.clone());
    (scheduler, runtime)
}

// =============================================================================
// Race
// =============================================================================

#[rstest]
fn test_race_earlier_timer_wins_and_loser_never_lands() {
    let (scheduler, runtime) = fixture();
    let outcomes: Rc<RefCell<Vec<&str>>> = Rc::new(RefCell::new(Vec::new()));

    let effect: Effect<(), String, &str> =
        Effect::timeout("A", 1000).race(Effect::timeout("B", 2000));
    let capture = outcomes.clone();
    runtime.execute(
        effect,
        (),
        move |value| capture.borrow_mut().push(value),
        |_| panic!("race must not fail"),
    );

    scheduler.advance(999);
    assert!(outcomes.borrow().is_empty());

    scheduler.advance(1);
    assert_eq!(*outcomes.borrow(), vec!["A"]);
    assert_eq!(scheduler.now(), 1000);

    // Advancing past the loser's due time delivers nothing further;
    // its timer was cancelled with it.
    scheduler.advance(2000);
    assert_eq!(*outcomes.borrow(), vec!["A"]);
    assert!(scheduler.is_idle());
}

#[rstest]
fn test_race_first_failure_wins() {
    let (scheduler, runtime) = fixture();
    let failure: Rc<RefCell<Option<Failure<String>>>> = Rc::new(RefCell::new(None));

    let losing: Effect<(), String, i32> = Effect::timeout(1, 100);
    let failing: Effect<(), String, i32> =
        Effect::<(), String, ()>::sleep(10).then(Effect::reject("early crash".to_string()));

    let capture = failure.clone();
    runtime.execute(
        losing.race(failing),
        (),
        |_| panic!("the failure arrives first"),
        move |f| *capture.borrow_mut() = Some(f),
    );
    scheduler.drain();

    assert_eq!(
        *failure.borrow(),
        Some(Failure::Error("early crash".to_string()))
    );
}

#[rstest]
fn test_never_is_the_race_identity() {
    let (scheduler, runtime) = fixture();
    let effect: Effect<(), String, i32> = Effect::timeout(5, 10).race(Effect::never());

    let result = Rc::new(Cell::new(0));
    let capture = result.clone();
    runtime.execute(effect, (), move |v| capture.set(v), |_| {});
    scheduler.drain();

    assert_eq!(result.get(), 5);
}

#[rstest]
fn test_cancelling_the_race_cancels_both_children() {
    let (scheduler, runtime) = fixture();
    let effect: Effect<(), String, i32> = Effect::timeout(1, 100).race(Effect::timeout(2, 200));

    let fired = Rc::new(Cell::new(false));
    let flag = fired.clone();
    let handle = runtime.execute(effect, (), move |_| flag.set(true), |_| {});
    scheduler.tick();

    handle.cancel();
    scheduler.advance(500);

    assert!(!fired.get());
    assert!(scheduler.is_idle());
}

// =============================================================================
// Zip
// =============================================================================

#[rstest]
fn test_zip_pairs_results_when_both_complete() {
    let (scheduler, runtime) = fixture();
    let effect: Effect<(), String, (i32, &str)> =
        Effect::timeout(7, 50).zip(Effect::timeout("seven", 30));

    let result: Rc<RefCell<Option<(i32, &str)>>> = Rc::new(RefCell::new(None));
    let capture = result.clone();
    runtime.execute(
        effect,
        (),
        move |pair| *capture.borrow_mut() = Some(pair),
        |_| panic!("zip must not fail"),
    );

    scheduler.advance(30);
    assert_eq!(*result.borrow(), None);
    scheduler.advance(20);
    assert_eq!(*result.borrow(), Some((7, "seven")));
}

#[rstest]
fn test_zip_failure_cancels_the_sibling() {
    let (scheduler, runtime) = fixture();

    let slow: Effect<(), String, i32> = Effect::timeout(1, 100);
    let failing: Effect<(), String, i32> =
        Effect::<(), String, ()>::sleep(50).then(Effect::reject("err".to_string()));

    let failure: Rc<RefCell<Option<Failure<String>>>> = Rc::new(RefCell::new(None));
    let capture = failure.clone();
    runtime.execute(
        slow.zip(failing),
        (),
        |_| panic!("zip fails before the pair completes"),
        move |f| *capture.borrow_mut() = Some(f),
    );

    scheduler.advance(50);
    assert_eq!(*failure.borrow(), Some(Failure::Error("err".to_string())));
    assert_eq!(scheduler.now(), 50);

    // The sibling's 100ms timer was cancelled; nothing resolves later.
    scheduler.advance(100);
    assert!(scheduler.is_idle());
}

#[rstest]
fn test_zip_runs_children_concurrently() {
    let (scheduler, runtime) = fixture();
    // Two 100ms waits in parallel finish at 100, not 200.
    let effect: Effect<(), String, (i32, i32)> =
        Effect::timeout(1, 100).zip(Effect::timeout(2, 100));

    let done = Rc::new(Cell::new(false));
    let flag = done.clone();
    runtime.execute(effect, (), move |_| flag.set(true), |_| {});

    scheduler.advance(100);
    assert!(done.get());
    assert_eq!(scheduler.now(), 100);
}

#[rstest]
fn test_zip_children_start_in_argument_order() {
    let (scheduler, runtime) = fixture();
    let order = Rc::new(RefCell::new(Vec::new()));

    let first = order.clone();
    let left: Effect<(), String, ()> = Effect::of_with(move || first.borrow_mut().push("left"));
    let second = order.clone();
    let right: Effect<(), String, ()> = Effect::of_with(move || second.borrow_mut().push("right"));

    runtime.execute(left.zip(right), (), |_| {}, |_| {});
    scheduler.drain();

    assert_eq!(*order.borrow(), vec!["left", "right"]);
}
