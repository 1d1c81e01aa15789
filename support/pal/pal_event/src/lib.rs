// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A counting event backed by a Linux
//! [eventfd](https://man7.org/linux/man-pages/man2/eventfd.2.html).
//!
//! The event is the signaling primitive shared with in-kernel virtio
//! backends: the guest signals it to kick a queue, and the backend signals
//! it when the queue has completions.

#![cfg(target_os = "linux")]
#![warn(missing_docs)]
// UNSAFETY: FFI into eventfd.
#![expect(unsafe_code)]

use std::io;
use std::os::unix::prelude::*;

/// Runs f() until it stop failing with EINTR (as indicated by errno).
fn while_eintr<F, R>(mut f: F) -> io::Result<R>
where
    F: FnMut() -> io::Result<R>,
{
    loop {
        match f() {
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            r => break r,
        }
    }
}

fn syscall_result<T: PartialOrd + Default>(result: T) -> io::Result<T> {
    if result >= T::default() {
        Ok(result)
    } else {
        Err(io::Error::last_os_error())
    }
}

/// A non-blocking eventfd.
#[derive(Debug)]
pub struct Event(OwnedFd);

impl Event {
    /// Creates a new, unsignaled event.
    pub fn new() -> io::Result<Self> {
        // SAFETY: calling eventfd as documented and validating the result
        // before taking ownership of it.
        let fd = unsafe {
            let fd = syscall_result(libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC))?;
            OwnedFd::from_raw_fd(fd)
        };
        Ok(Self(fd))
    }

    /// Signals the event, adding one to its counter.
    pub fn signal(&self) {
        let c: u64 = 1;
        // SAFETY: fd is a valid, open eventfd and the buffer is a live u64.
        let r = while_eintr(|| unsafe {
            syscall_result(libc::write(
                self.0.as_raw_fd(),
                std::ptr::from_ref(&c).cast::<libc::c_void>(),
                size_of_val(&c),
            ))
        });
        match r {
            Ok(n) if n == size_of_val(&c) as isize => {}
            // The counter is saturated, so the event is already signaled.
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            r => panic!("unexpected eventfd write result: {:?}", r),
        }
    }

    /// Consumes the pending signals.
    ///
    /// Returns the number of times the event was signaled since the last
    /// successful call, or `None` if it is not signaled.
    pub fn try_wait(&self) -> Option<u64> {
        let mut c: u64 = 0;
        // SAFETY: fd is a valid, open eventfd and the buffer is a live u64.
        let r = while_eintr(|| unsafe {
            syscall_result(libc::read(
                self.0.as_raw_fd(),
                std::ptr::from_mut(&mut c).cast::<libc::c_void>(),
                size_of_val(&c),
            ))
        });
        match r {
            Ok(n) => {
                assert_eq!(n, size_of_val(&c) as isize);
                Some(c)
            }
            Err(err) => {
                assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
                None
            }
        }
    }

    /// Duplicates the underlying file descriptor.
    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(Self(self.0.try_clone()?))
    }
}

impl From<Event> for OwnedFd {
    fn from(event: Event) -> Self {
        event.0
    }
}

impl AsFd for Event {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}
