//! Concurrency building blocks, expressed as effects.
//!
//! Only these primitives mediate state shared between fibers:
//!
//! - [`Ref`]: a single-cell mutable holder whose operations each occupy
//!   one dispatch step, making them atomic under cooperative scheduling
//! - [`Await`]: a write-once cell; waiters suspend until the first `set`
//!   and resume in FIFO order through the scheduler
//! - [`Queue`]: a bounded (or unbounded) FIFO with offer- and
//!   take-waiters
//!
//! Because scheduling is cooperative, a single instruction dispatch is
//! atomic; a read-then-write spanning two dispatches is not, which is
//! what [`Ref::update`] exists for.

mod awaitable;
mod cell;
mod queue;

pub use awaitable::Await;
pub use cell::Ref;
pub use queue::Queue;
