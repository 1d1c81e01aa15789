// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Interrupt handling for user-mode device drivers.

use parking_lot::Mutex;
use std::future::poll_fn;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::Acquire;
use std::sync::atomic::Ordering::Release;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::task::Waker;

struct InterruptSlot {
    signaled: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

impl InterruptSlot {
    fn poll(&self, cx: &mut Context<'_>) -> Poll<()> {
        if self.signaled.swap(false, Acquire) {
            return Poll::Ready(());
        }
        let _old_waker;
        let mut waker = self.waker.lock();
        // Check again under the lock.
        if self.signaled.swap(false, Acquire) {
            return Poll::Ready(());
        }
        if waker.as_ref().is_none_or(|w| !w.will_wake(cx.waker())) {
            _old_waker = waker.replace(cx.waker().clone());
        }
        Poll::Pending
    }

    fn signal(&self) {
        self.signaled.store(true, Release);
        if let Some(waker) = self.waker.lock().take() {
            waker.wake();
        }
    }
}

/// The driver's end of a device interrupt.
pub struct DeviceInterrupt {
    slot: Arc<InterruptSlot>,
}

impl DeviceInterrupt {
    /// Polls the interrupt, returning `Poll::Ready` and clearing the signal if
    /// it was signaled.
    pub fn poll(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        self.slot.poll(cx)
    }

    /// Waits for the interrupt to be signaled.
    pub async fn wait(&mut self) {
        poll_fn(|cx| self.poll(cx)).await
    }
}

/// The device's end of an interrupt.
///
/// Sources are cheap to clone; each clone signals the same
/// [`DeviceInterrupt`]. Signals that arrive before the driver polls are
/// coalesced.
#[derive(Clone)]
pub struct DeviceInterruptSource {
    slot: Arc<InterruptSlot>,
}

impl DeviceInterruptSource {
    /// Creates a new interrupt, returning the device and driver ends.
    pub fn new() -> (Self, DeviceInterrupt) {
        let slot = Arc::new(InterruptSlot {
            signaled: AtomicBool::new(false),
            waker: Mutex::new(None),
        });
        (Self { slot: slot.clone() }, DeviceInterrupt { slot })
    }

    /// Signals the interrupt.
    pub fn signal(&self) {
        self.slot.signal();
    }
}

#[cfg(test)]
mod tests {
    use super::DeviceInterruptSource;
    use futures::task::noop_waker_ref;
    use std::task::Context;
    use std::task::Poll;

    #[test]
    fn test_interrupt() {
        let (source, mut target) = DeviceInterruptSource::new();
        let mut cx = Context::from_waker(noop_waker_ref());
        assert!(target.poll(&mut cx).is_pending());
        source.signal();
        source.clone().signal();
        assert_eq!(target.poll(&mut cx), Poll::Ready(()));
        assert!(target.poll(&mut cx).is_pending());
    }

    #[test]
    fn wait_from_another_thread() {
        let (source, mut target) = DeviceInterruptSource::new();
        let thread = std::thread::spawn(move || source.signal());
        futures::executor::block_on(target.wait());
        thread.join().unwrap();
    }
}
