//! # tidewave
//!
//! A pure, typed effect system for Rust: a reified description of
//! asynchronous computations together with a stack-safe, trampolined
//! interpreter that executes them on a cooperative single-threaded
//! scheduler.
//!
//! ## Overview
//!
//! The central type is [`Effect<R, E, A>`](effect::Effect): an immutable
//! description of a computation that requires an environment `R` and
//! eventually produces either a success `A`, a failure `E`, or never
//! completes. Effects are built from combinators (`map`, `chain`, `catch`,
//! `zip`, `race`, ...), compiled to a closed set of tagged instructions,
//! and interpreted by a [`Runtime`](effect::Runtime) that never recurses
//! into the native stack no matter how deeply effects are chained.
//!
//! The crate is organized as:
//!
//! - **Scheduler**: the cooperative task queue and logical clock the
//!   runtime yields through ([`scheduler`])
//! - **Effect**: the effect type, its combinators, and the fiber
//!   evaluator ([`effect`])
//! - **Concurrency primitives**: `Ref`, `Await`, and `Queue`, all
//!   expressed as effects ([`concurrent`])
//! - **Stream**: a lazy, fold-based sequence abstraction layered atop the
//!   effect type ([`stream`])
//!
//! ## Example
//!
//! ```rust
//! use std::rc::Rc;
//! use tidewave::effect::{Effect, Runtime};
//! use tidewave::scheduler::TestScheduler;
//!
//! let scheduler = Rc::new(TestScheduler::new());
//! let runtime = Runtime::new(scheduler);
//!
//! let effect: Effect<(), String, i32> = Effect::of(10)
//!     .map(|x| x + 1)
//!     .chain(|x| Effect::of(x * 2));
//!
//! assert_eq!(runtime.run_unsafe_sync(effect, ()), 22);
//! ```
//!
//! ## Threading model
//!
//! Everything in this crate is single-threaded and cooperative: effects,
//! fibers, and schedulers are `Rc`-based and deliberately not `Send`.
//! "Parallel" composition (`zip`, `race`) means interleaved dispatch on
//! one queue, not OS threads.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
// Note: fibers and schedulers are intentionally Rc-based; the crate is
// single-threaded by design.
#![allow(clippy::module_name_repetitions)]

/// Prelude module for convenient imports.
///
/// Re-exports commonly used types and traits.
///
/// # Usage
///
/// ```rust
/// use tidewave::prelude::*;
/// ```
pub mod prelude {
    pub use crate::concurrent::{Await, Queue, Ref};
    pub use crate::effect::{
        Cancellation, Effect, Failure, FiberHandle, Resumption, Runtime, SyncRunError,
    };
    pub use crate::scheduler::{Scheduler, TaskId, TestScheduler, TimerScheduler};
    pub use crate::stream::Stream;
}

pub mod concurrent;
pub mod effect;
pub mod scheduler;
pub mod stream;

#[cfg(test)]
mod tests {
    #[test]
    fn library_compiles() {
        // Basic smoke test to ensure the library compiles
    }
}
