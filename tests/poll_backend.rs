// The driver must behave identically over the portable poll(2) backend,
// which is what DriverBuilder's backend injection is for.

use pulse::{Driver, DriverBuilder, PollBackend};
use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

fn poll_driver() -> Driver {
    let backend = PollBackend::new().expect("failed to create poll backend");
    DriverBuilder::new()
        .backend(Box::new(backend))
        .build()
        .expect("failed to build driver")
}

#[test]
fn test_defers_and_microtasks_over_poll() {
    let driver = poll_driver();
    let order = Rc::new(RefCell::new(Vec::new()));

    {
        let order = order.clone();
        let handle = driver.clone();
        driver.defer(move |_| {
            order.borrow_mut().push("a");

            let order = order.clone();
            handle.queue(move || order.borrow_mut().push("microtask"));
        });
    }
    {
        let order = order.clone();
        driver.defer(move |_| order.borrow_mut().push("b"));
    }

    driver.run().expect("run failed");
    assert_eq!(*order.borrow(), vec!["a", "microtask", "b"]);
}

#[test]
fn test_delay_over_poll() {
    let driver = poll_driver();
    let fired = Rc::new(RefCell::new(false));

    {
        let fired = fired.clone();
        driver.delay(Duration::from_millis(20), move |_| {
            *fired.borrow_mut() = true
        });
    }

    let start = Instant::now();
    driver.run().expect("run failed");

    assert!(*fired.borrow());
    assert!(start.elapsed() >= Duration::from_millis(20));
}

#[test]
fn test_pipe_readiness_over_poll() {
    let driver = poll_driver();
    let data = Rc::new(RefCell::new(Vec::new()));

    let mut fds = [0 as libc::c_int; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0, "pipe() failed");
    let (read_fd, write_fd): (RawFd, RawFd) = (fds[0], fds[1]);

    unsafe {
        libc::write(write_fd, b"poll".as_ptr() as *const libc::c_void, 4);
    }

    {
        let data = data.clone();
        let handle = driver.clone();
        driver.on_readable(read_fd, move |id, fd| {
            let mut buf = [0u8; 16];
            let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };

            if n > 0 {
                data.borrow_mut().extend_from_slice(&buf[..n as usize]);
            }

            handle.cancel(id);
        });
    }

    driver.run().expect("run failed");
    assert_eq!(*data.borrow(), b"poll");

    unsafe {
        libc::close(read_fd);
        libc::close(write_fd);
    }
}
