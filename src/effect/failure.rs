//! Failure taxonomy for the effect system.
//!
//! An effect can end badly in two distinct ways:
//!
//! - a **typed failure**: an `E` value produced via `reject` or a failing
//!   async registration, flowing on the error channel;
//! - a **defect**: a panic raised inside a user function (a `map` or
//!   `chain` closure, a `catch` handler, an `encase` operation, an async
//!   registration). The panic is captured at the boundary and carried as
//!   its message.
//!
//! Both are recoverable with `catch`, which receives the whole
//! [`Failure`]. Cancellation is neither: a cancelled fiber delivers
//! nothing.

use std::any::Any;
use std::fmt;

/// The error channel of an effect: a typed error or a captured panic.
///
/// # Examples
///
/// ```rust
/// use tidewave::effect::Failure;
///
/// let typed: Failure<String> = Failure::Error("boom".to_string());
/// assert!(typed.is_error());
///
/// let defect: Failure<String> = Failure::Defect("index out of bounds".to_string());
/// assert!(defect.is_defect());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure<E> {
    /// A typed failure produced through the error channel.
    Error(E),
    /// A panic captured inside a user function, carried as its message.
    Defect(String),
}

impl<E> Failure<E> {
    /// Returns `true` for a typed failure.
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Returns `true` for a captured panic.
    pub const fn is_defect(&self) -> bool {
        matches!(self, Self::Defect(_))
    }

    /// Extracts the typed error, if any.
    pub fn into_error(self) -> Option<E> {
        match self {
            Self::Error(error) => Some(error),
            Self::Defect(_) => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for Failure<E> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(error) => write!(formatter, "error: {error}"),
            Self::Defect(message) => write!(formatter, "defect: {message}"),
        }
    }
}

impl<E: fmt::Display + fmt::Debug> std::error::Error for Failure<E> {}

/// Error returned by a synchronous run that did not produce a success.
///
/// Returned by `Runtime::run_sync` when the effect either failed or is
/// still pending after the scheduler queue has been drained (for
/// example, an effect suspended on `never()` or on an async registration
/// nothing will ever complete).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncRunError<E> {
    /// The scheduler queue is empty but the effect has not completed.
    Pending,
    /// The effect failed.
    Failed(Failure<E>),
}

impl<E: fmt::Debug> fmt::Display for SyncRunError<E> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(
                formatter,
                "effect is still pending after draining the scheduler"
            ),
            Self::Failed(failure) => write!(formatter, "effect failed: {failure:?}"),
        }
    }
}

impl<E: fmt::Debug> std::error::Error for SyncRunError<E> {}

/// Extracts a human-readable message from a panic payload.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn failure_display_distinguishes_errors_from_defects() {
        let typed: Failure<&str> = Failure::Error("boom");
        let defect: Failure<&str> = Failure::Defect("overflow".to_string());

        assert_eq!(format!("{typed}"), "error: boom");
        assert_eq!(format!("{defect}"), "defect: overflow");
    }

    #[rstest]
    fn into_error_returns_the_typed_error_only() {
        let typed: Failure<i32> = Failure::Error(7);
        let defect: Failure<i32> = Failure::Defect("oops".to_string());

        assert_eq!(typed.into_error(), Some(7));
        assert_eq!(defect.into_error(), None);
    }

    #[rstest]
    fn sync_run_error_display() {
        let pending: SyncRunError<i32> = SyncRunError::Pending;
        assert_eq!(
            format!("{pending}"),
            "effect is still pending after draining the scheduler"
        );

        let failed: SyncRunError<i32> = SyncRunError::Failed(Failure::Error(3));
        assert_eq!(format!("{failed}"), "effect failed: Error(3)");
    }

    #[rstest]
    fn panic_message_extracts_str_and_string_payloads() {
        assert_eq!(panic_message(Box::new("static message")), "static message");
        assert_eq!(
            panic_message(Box::new("owned message".to_string())),
            "owned message"
        );
        assert_eq!(panic_message(Box::new(42_u8)), "unknown panic");
    }
}
