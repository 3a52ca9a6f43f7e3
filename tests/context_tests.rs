// The implicit driver is thread-local and the test harness runs every test
// on its own thread, so these tests cannot see each other's state.

use pulse::{Driver, Error};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

#[test]
fn test_facade_registers_and_runs() {
    let order = Rc::new(RefCell::new(Vec::new()));

    {
        let order = order.clone();
        pulse::defer(move |_| order.borrow_mut().push("deferred"));
    }
    {
        let order = order.clone();
        pulse::delay(Duration::from_millis(10), move |_| {
            order.borrow_mut().push("delayed")
        });
    }

    pulse::run().expect("run failed");
    assert_eq!(*order.borrow(), vec!["deferred", "delayed"]);
}

#[test]
fn test_facade_info_tracks_cancellation() {
    let id = pulse::delay(Duration::from_secs(1), |_| {});
    assert_eq!(pulse::info().delay.enabled, 1);

    pulse::cancel(id);
    assert_eq!(pulse::info().delay.enabled, 0);
}

#[test]
fn test_current_returns_the_same_driver() {
    let first = pulse::current();
    let id = first.defer(|_| {});

    // The facade and the explicit handle share one registry.
    assert_eq!(pulse::info().defer.enabled, 1);
    pulse::cancel(id);
    assert_eq!(first.info().defer.enabled, 0);
}

#[test]
fn test_set_driver_swaps_and_reclaims() {
    let old = pulse::current();
    old.defer(|_| {});
    assert_eq!(pulse::info().defer.enabled, 1);

    let replacement = Driver::new().expect("failed to create driver");
    let previous = pulse::set_driver(replacement).expect("swap failed");

    let previous = previous.expect("there was a driver to replace");
    assert_eq!(
        previous.info().defer.enabled,
        0,
        "the old driver's registrations are reclaimed during the swap"
    );
    assert_eq!(pulse::info().defer.enabled, 0);

    // The fresh driver works.
    let fired = Rc::new(RefCell::new(false));
    {
        let fired = fired.clone();
        pulse::defer(move |_| *fired.borrow_mut() = true);
    }
    pulse::run().expect("run failed");
    assert!(*fired.borrow());
}

#[test]
fn test_set_driver_while_running_is_rejected() {
    let attempted = Rc::new(RefCell::new(None));

    {
        let attempted = attempted.clone();
        pulse::defer(move |_| {
            let replacement = Driver::new().expect("failed to create driver");
            *attempted.borrow_mut() = Some(pulse::set_driver(replacement));
        });
    }

    pulse::run().expect("run failed");

    let result = attempted.borrow_mut().take().expect("callback ran");
    assert!(matches!(result, Err(Error::InvalidState(_))));
}

#[test]
fn test_backend_handle_and_waker_are_exposed() {
    let driver = Driver::new().expect("failed to create driver");

    #[cfg(target_os = "linux")]
    assert!(driver.handle().is_some(), "epoll exposes its descriptor");

    assert!(driver.waker().is_some());
}

#[test]
fn test_suspension_via_facade() {
    let suspension = pulse::suspension::<&'static str>();

    {
        let resumer = suspension.clone();
        pulse::delay(Duration::from_millis(10), move |_| {
            resumer.resume("handed off").expect("resume failed");
        });
    }

    assert_eq!(suspension.suspend().expect("suspend failed"), "handed off");
}
