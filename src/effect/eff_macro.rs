//! Do-notation for effect chains.
//!
//! Deeply nested `chain` closures read inside-out; [`eff!`] flattens
//! them into a straight-line block:
//!
//! ```text
//! eff! {
//!     user <= fetch_user(id);         // bind: chain on the value
//!     let name = user.name;           // plain binding between steps
//!     render(name)                    // the resulting effect
//! }
//! ```
//!
//! The bind arrow is spelled `<=` only because Rust gives macros no
//! better token: `<-` does not survive tokenization in a matcher, and
//! `<=` is the closest thing to an arrow that does. A binding on the
//! left of `<=` may be a plain name, `_`, or a parenthesized tuple.
//!
//! # Examples
//!
//! ```rust
//! use std::rc::Rc;
//! use tidewave::eff;
//! use tidewave::effect::{Effect, Runtime};
//! use tidewave::scheduler::TestScheduler;
//!
//! let runtime = Runtime::new(Rc::new(TestScheduler::new()));
//!
//! let effect: Effect<(), String, i32> = eff! {
//!     x <= Effect::of(5);
//!     y <= Effect::of(10);
//!     let z = x + y;
//!     Effect::of(z * 2)
//! };
//!
//! assert_eq!(runtime.run_unsafe_sync(effect, ()), 30);
//! ```

/// Flattens a sequence of effect binds into nested
/// [`chain`](crate::effect::Effect::chain) calls.
///
/// Three statement forms are accepted, tried in this order:
///
/// 1. `binding <= effect;` runs `effect` and brings its success value
///    into scope for the remaining statements. Because this is plain
///    `chain`, a failure skips everything after it.
/// 2. `let binding = expression;` evaluates a pure expression while the
///    block is being built; no effect runs.
/// 3. A trailing expression, which must itself be an effect: it becomes
///    the tail of the chain and decides the block's type.
///
/// The binding position takes one token tree, so `x`, `_`, and
/// `(a, b)` all work:
///
/// ```rust
/// use std::rc::Rc;
/// use tidewave::eff;
/// use tidewave::effect::{Effect, Runtime};
/// use tidewave::scheduler::TestScheduler;
///
/// let runtime = Runtime::new(Rc::new(TestScheduler::new()));
///
/// let effect: Effect<(), String, i32> = eff! {
///     (low, high) <= Effect::of((2, 40));
///     _ <= Effect::unit();
///     Effect::of(low + high)
/// };
/// assert_eq!(runtime.run_unsafe_sync(effect, ()), 42);
/// ```
#[macro_export]
macro_rules! eff {
    // binding <= effect; ...   (one token tree covers x, _, and (a, b))
    ($binding:tt <= $effect:expr ; $($rest:tt)+) => {
        $effect.chain(move |$binding| $crate::eff!($($rest)+))
    };

    // let binding = expression; ...   (pure, nothing is chained)
    (let $binding:tt = $value:expr ; $($rest:tt)+) => {{
        let $binding = $value;
        $crate::eff!($($rest)+)
    }};

    // trailing expression: the effect the whole block evaluates to
    ($last:expr) => {
        $last
    };
}
