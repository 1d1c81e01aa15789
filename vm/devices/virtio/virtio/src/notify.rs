// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Signaling between a ring and its host.

use pal_event::Event;
use std::sync::Arc;
use thiserror::Error;
use user_driver::interrupt::DeviceInterruptSource;

/// Queue notification for a device assigned by the hypervisor.
pub trait QueueNotify: Send + Sync {
    /// Tells the device that queue `queue` has new available buffers.
    fn notify_queue(&self, queue: u16);
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("waking the wait is not supported for event-driven queues")]
    WakeUnsupported,
}

/// How a ring kicks the host and how its waiter is woken.
pub enum Notifier {
    /// The host watches an event for kicks. Completions are signaled on a
    /// separate event that the external event loop owns.
    Event(Event),
    /// A hypervisor-assigned device. Kicks go through the device, and the
    /// device's interrupt callback wakes the waiter.
    Device {
        device: Arc<dyn QueueNotify>,
        queue: u16,
        wake: DeviceInterruptSource,
    },
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Notifier::Event(event) => f.debug_tuple("Event").field(event).finish(),
            Notifier::Device { queue, .. } => {
                f.debug_struct("Device").field("queue", queue).finish()
            }
        }
    }
}

impl Notifier {
    /// Signals the host that new work is available.
    pub fn notify(&self) {
        match self {
            Notifier::Event(event) => event.signal(),
            Notifier::Device { device, queue, .. } => device.notify_queue(*queue),
        }
    }

    /// Forces the waiter on this queue to re-check the ring.
    pub fn wake_wait(&self) -> Result<(), NotifyError> {
        match self {
            Notifier::Event(_) => Err(NotifyError::WakeUnsupported),
            Notifier::Device { wake, .. } => {
                wake.signal();
                Ok(())
            }
        }
    }
}
