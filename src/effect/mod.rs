//! The effect type, its combinators, and the fiber evaluator.
//!
//! # Architecture
//!
//! - [`Effect<R, E, A>`]: the public, typed description of a computation
//! - instruction algebra (crate-private): the closed set of tagged nodes
//!   combinators compile to
//! - [`Runtime`]: the trampolined interpreter walking instruction trees
//!   against an environment, yielding through a
//!   [`Scheduler`](crate::scheduler::Scheduler)
//! - [`Failure<E>`]: the error channel, typed errors and captured
//!   panics (defects), both recoverable with `catch`
//!
//! # Examples
//!
//! ```rust
//! use std::rc::Rc;
//! use tidewave::effect::{Effect, Runtime};
//! use tidewave::scheduler::{Scheduler, TestScheduler};
//!
//! let scheduler = Rc::new(TestScheduler::new());
//! let runtime = Runtime::new(scheduler.clone());
//!
//! // Race two delayed values; the earlier one wins, the loser is
//! // cancelled.
//! let winner: Effect<(), String, &str> =
//!     Effect::timeout("A", 1000).race(Effect::timeout("B", 2000));
//!
//! assert_eq!(runtime.run_unsafe_sync(winner, ()), "A");
//! assert_eq!(scheduler.now(), 1000);
//! ```

mod core;
mod eff_macro;
mod failure;
mod instruction;
mod runtime;

pub use self::core::Effect;
pub use failure::{Failure, SyncRunError};
pub use runtime::{Cancellation, FiberHandle, Resumption, Runtime};

pub(crate) use instruction::AnyValue;
pub(crate) use runtime::{deliver_outcome, RawResumption};
