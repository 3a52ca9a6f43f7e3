//! Parking and resuming the main context against the loop.
//!
//! `suspend` does not block a thread: it re-enters the driver's run loop with
//! an extra exit predicate, so the parked code and the loop share one stack.
//! `resume`/`throw` store the outcome, and the loop hands control back at the
//! next tick boundary.

use crate::driver::Driver;
use crate::error::{Error, SuspendError};

use std::cell::RefCell;
use std::mem;
use std::rc::Rc;

enum State<T> {
    Idle,
    Parked,
    Resolved(Result<T, Box<dyn std::error::Error>>),
}

/// A handoff object pairing the main execution context with a driver.
///
/// Clones share one state, so a callback can hold the handle that resumes
/// the parked caller. A suspension is reusable: after each
/// suspend/resume roundtrip it returns to idle.
///
/// # Example
/// ```ignore
/// let suspension = pulse::suspension::<i32>();
/// let resumer = suspension.clone();
/// pulse::delay(Duration::from_millis(10), move |_| {
///     resumer.resume(42).unwrap();
/// });
/// assert_eq!(suspension.suspend().unwrap(), 42);
/// ```
pub struct Suspension<T> {
    driver: Driver,
    state: Rc<RefCell<State<T>>>,
}

impl<T> Clone for Suspension<T> {
    fn clone(&self) -> Self {
        Self {
            driver: self.driver.clone(),
            state: self.state.clone(),
        }
    }
}

impl<T> Suspension<T> {
    /// Creates a suspension bound to `driver`'s main context.
    pub fn new(driver: &Driver) -> Self {
        Self {
            driver: driver.clone(),
            state: Rc::new(RefCell::new(State::Idle)),
        }
    }

    /// Parks the caller until a [`resume`] or [`throw`] arrives, running the
    /// loop in the meantime.
    ///
    /// Fails with [`SuspendError::Deadlock`] when the loop drains or is
    /// stopped before anything resumes us, and with an `InvalidState` error
    /// when called from within a callback (the loop is already running).
    ///
    /// [`resume`]: Suspension::resume
    /// [`throw`]: Suspension::throw
    pub fn suspend(&self) -> Result<T, SuspendError> {
        {
            let mut state = self.state.borrow_mut();

            match *state {
                State::Idle => *state = State::Parked,
                _ => return Err(Error::InvalidState("the suspension is already in use").into()),
            }
        }

        let observer = self.state.clone();
        let parked = self
            .driver
            .run_while(move || matches!(*observer.borrow(), State::Parked));

        if let Err(error) = parked {
            *self.state.borrow_mut() = State::Idle;
            return Err(error.into());
        }

        match mem::replace(&mut *self.state.borrow_mut(), State::Idle) {
            State::Resolved(Ok(value)) => Ok(value),
            State::Resolved(Err(error)) => Err(SuspendError::Thrown(error)),
            // Still parked: the loop drained or was stopped under us.
            _ => Err(SuspendError::Deadlock),
        }
    }

    /// Resumes the parked context with `value`, effective at the next tick
    /// boundary. Fails with `InvalidState` when the context is not parked or
    /// was already resumed.
    pub fn resume(&self, value: T) -> Result<(), Error> {
        self.settle(Ok(value))
    }

    /// Resumes the parked context with an error; `suspend` returns it as
    /// [`SuspendError::Thrown`].
    pub fn throw(&self, error: impl Into<Box<dyn std::error::Error>>) -> Result<(), Error> {
        self.settle(Err(error.into()))
    }

    fn settle(&self, outcome: Result<T, Box<dyn std::error::Error>>) -> Result<(), Error> {
        let mut state = self.state.borrow_mut();

        match *state {
            State::Parked => {
                *state = State::Resolved(outcome);
                Ok(())
            }
            State::Idle => Err(Error::InvalidState("the suspension is not parked")),
            State::Resolved(_) => Err(Error::InvalidState("the suspension was already resumed")),
        }
    }
}
