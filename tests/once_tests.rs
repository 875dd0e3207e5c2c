//! Tests for once(): shared execution, cached outcomes (success and
//! failure), pending subscribers, and subscriber cancellation.

use std::cell::Cell;
use std::rc::Rc;

use rstest::rstest;
use tidewave::effect::{Effect, Failure, Runtime, SyncRunError};
use tidewave::scheduler::{Scheduler, TestScheduler};

fn fixture() -> (Rc<TestScheduler>, Runtime) {
    let scheduler = Rc::new(TestScheduler::new());
    let runtime = Runtime::new(scheduler.clone());
    (scheduler, runtime)
}

fn counted(counter: &Rc<Cell<u32>>) -> Effect<(), String, i32> {
    let counter = counter.clone();
    Effect::of_with(move || {
        counter.set(counter.get() + 1);
        7
    })
}

#[rstest]
fn test_later_executions_reuse_the_cached_result() {
    let (_, runtime) = fixture();
    let executions = Rc::new(Cell::new(0));
    let shared = counted(&executions).once();

    assert_eq!(runtime.run_unsafe_sync(shared.clone(), ()), 7);
    assert_eq!(runtime.run_unsafe_sync(shared.clone(), ()), 7);
    assert_eq!(runtime.run_unsafe_sync(shared, ()), 7);
    assert_eq!(executions.get(), 1);
}

#[rstest]
fn test_pending_subscribers_attach_to_the_running_execution() {
    let (scheduler, runtime) = fixture();
    let shared: Effect<(), String, i32> = Effect::timeout(42, 100).once();

    let first = Rc::new(Cell::new(0));
    let second = Rc::new(Cell::new(0));
    let capture_first = first.clone();
    let capture_second = second.clone();
    runtime.execute(shared.clone(), (), move |v| capture_first.set(v), |_| {});
    runtime.execute(shared, (), move |v| capture_second.set(v), |_| {});

    scheduler.advance(99);
    assert_eq!((first.get(), second.get()), (0, 0));

    scheduler.advance(1);
    scheduler.drain();
    assert_eq!((first.get(), second.get()), (42, 42));
    // One timer, one execution: nothing left at 200.
    assert!(scheduler.is_idle());
}

#[rstest]
fn test_failures_are_cached_and_delivered_to_all_subscribers() {
    let (_, runtime) = fixture();
    let attempts = Rc::new(Cell::new(0));
    let counter = attempts.clone();
    let failing: Effect<(), String, i32> = Effect::encase(move || {
        counter.set(counter.get() + 1);
        Err(format!("attempt {}", counter.get()))
    });
    let shared = failing.once();

    let first = runtime.run_sync(shared.clone(), ());
    let second = runtime.run_sync(shared, ());

    // The failure is cached: the second subscriber sees the first
    // attempt's error and the work never re-runs.
    assert_eq!(
        first,
        Err(SyncRunError::Failed(Failure::Error(
            "attempt 1".to_string()
        )))
    );
    assert_eq!(second, first);
    assert_eq!(attempts.get(), 1);
}

#[rstest]
fn test_cancelling_one_subscriber_leaves_the_others_attached() {
    let (scheduler, runtime) = fixture();
    let executions = Rc::new(Cell::new(0));
    let counter = executions.clone();
    let slow: Effect<(), String, i32> = Effect::<(), String, ()>::sleep(50).chain(move |()| {
        let counter = counter.clone();
        Effect::of_with(move || {
            counter.set(counter.get() + 1);
            9
        })
    });
    let shared = slow.once();

    let cancelled = Rc::new(Cell::new(false));
    let flag = cancelled.clone();
    let handle = runtime.execute(shared.clone(), (), move |_| flag.set(true), |_| {});
    let kept = Rc::new(Cell::new(0));
    let capture = kept.clone();
    runtime.execute(shared, (), move |v| capture.set(v), |_| {});

    scheduler.tick();
    handle.cancel();
    scheduler.advance(100);
    scheduler.drain();

    assert!(!cancelled.get());
    assert_eq!(kept.get(), 9);
    assert_eq!(executions.get(), 1);
}
