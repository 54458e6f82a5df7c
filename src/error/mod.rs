//! Error definitions
//!
//! This module provides the crate's [`Error`] type and [`AsyncError`], the
//! record published when an uncaught error escapes a tracked context.

use std::any::Any;
use std::backtrace::Backtrace;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use thiserror::Error;

/// Main error type for turnkit
#[derive(Error, Debug)]
pub enum Error {
    /// A future did not complete within the given amount of virtual time.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// The event loop ran out of work while a future was still pending.
    #[error("Event loop stalled: future pending with {waiting} task(s) waiting and nothing left to run")]
    Stalled {
        /// Spawned tasks that were parked without a wake-up.
        waiting: usize,
    },

    /// The tracked action panicked and the panic was captured.
    #[error("Tracked action failed: {0}")]
    ActionFailed(String),
}

impl Error {
    /// Create an action failure error.
    #[must_use]
    pub fn action_failed(message: impl Into<String>) -> Self {
        Self::ActionFailed(message.into())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// An uncaught error captured inside a tracked context.
///
/// Carries the original error value (a panic payload, or whatever was passed
/// to [`Context::report_error`](crate::context::Context::report_error)) so
/// listeners can downcast it back to its concrete type, plus the trace of
/// where the failing callback was scheduled when long stack traces are on.
pub struct AsyncError {
    payload: Box<dyn Any + Send>,
    trace: Option<Rc<Backtrace>>,
}

impl AsyncError {
    /// Wraps an arbitrary error value.
    ///
    /// # Example
    ///
    /// ```rust
    /// use turnkit::AsyncError;
    ///
    /// let error = AsyncError::new(std::io::Error::other("disk on fire"));
    /// assert!(error.is::<std::io::Error>());
    /// ```
    #[must_use]
    pub fn new<E: Any + Send>(error: E) -> Self {
        Self::from_panic(Box::new(error))
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        Self {
            payload,
            trace: None,
        }
    }

    pub(crate) fn with_trace(mut self, trace: Option<Rc<Backtrace>>) -> Self {
        if self.trace.is_none() {
            self.trace = trace;
        }
        self
    }

    /// Returns the error message when the payload is a string.
    ///
    /// `panic!("literal")` produces a `&'static str` payload and formatted
    /// panics produce a `String`; both are recognised here.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        if let Some(s) = self.payload.downcast_ref::<&'static str>() {
            Some(s)
        } else if let Some(s) = self.payload.downcast_ref::<String>() {
            Some(s.as_str())
        } else {
            None
        }
    }

    /// Returns a reference to the original error if it is of type `T`.
    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }

    /// Returns `true` if the original error is of type `T`.
    #[must_use]
    pub fn is<T: Any>(&self) -> bool {
        self.payload.is::<T>()
    }

    /// Where the failing callback was scheduled, if captured.
    #[must_use]
    pub fn trace(&self) -> Option<&Backtrace> {
        self.trace.as_deref()
    }

    /// Consumes the record and returns the original payload.
    #[must_use]
    pub fn into_payload(self) -> Box<dyn Any + Send> {
        self.payload
    }
}

impl fmt::Debug for AsyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncError")
            .field("message", &self.message())
            .field("has_trace", &self.trace.is_some())
            .finish()
    }
}

impl fmt::Display for AsyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(message) => f.write_str(message),
            None => f.write_str("<non-string error payload>"),
        }
    }
}
