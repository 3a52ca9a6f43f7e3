//! Error types surfaced by the loop.

use crate::callback::CallbackId;

use std::any::Any;
use std::fmt;

use thiserror::Error;

/// Errors returned by driver and accessor operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The operation referenced an unknown or already-invalidated callback id.
    ///
    /// Raised by `enable`, `reference` and `unreference`; `disable` and
    /// `cancel` are silent on unknown ids instead.
    #[error("unknown or invalidated callback identifier: {0}")]
    InvalidCallback(CallbackId),

    /// The operation is not permitted in the loop's current state.
    #[error("{0}")]
    InvalidState(&'static str),

    /// The active backend cannot provide the requested capability.
    #[error("{0} is not supported by the {1} backend")]
    UnsupportedFeature(&'static str, &'static str),
}

/// Errors surfaced by [`Suspension::suspend`](crate::Suspension::suspend).
#[derive(Error, Debug)]
pub enum SuspendError {
    /// The loop ran out of referenced callbacks, or was stopped, before a
    /// resume arrived; nothing could ever have unparked the caller.
    #[error("event loop terminated without resuming the suspension")]
    Deadlock,

    /// The suspension was resumed with an error via `throw`.
    #[error("{0}")]
    Thrown(Box<dyn std::error::Error>),

    /// An operation-level error occurred while parking.
    #[error(transparent)]
    State(#[from] Error),
}

/// The payload of a panic raised by a user callback or microtask.
///
/// Routed to the handler installed with `set_error_handler`. [`message`]
/// recovers the panic message for the common string payloads produced by
/// `panic!`.
///
/// [`message`]: UserError::message
pub struct UserError {
    payload: Box<dyn Any + Send>,
}

impl UserError {
    pub(crate) fn new(payload: Box<dyn Any + Send>) -> Self {
        Self { payload }
    }

    /// The panic message, when the payload is a string.
    pub fn message(&self) -> Option<&str> {
        if let Some(message) = self.payload.downcast_ref::<&'static str>() {
            Some(message)
        } else if let Some(message) = self.payload.downcast_ref::<String>() {
            Some(message)
        } else {
            None
        }
    }

    /// Consumes the wrapper, returning the raw panic payload.
    pub fn into_payload(self) -> Box<dyn Any + Send> {
        self.payload
    }
}

impl fmt::Display for UserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(message) => write!(f, "callback panicked: {}", message),
            None => write!(f, "callback panicked with a non-string payload"),
        }
    }
}

impl fmt::Debug for UserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserError({})", self)
    }
}

impl std::error::Error for UserError {}
