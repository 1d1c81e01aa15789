// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Host backends the device can run on.

pub mod assigned;
pub mod tap;
pub mod vhost;

use crate::features::Negotiated;
use crate::mac_address::MacAddress;
use crate::queue_pair::QueuePair;
use assigned::AssignedDevice;
use pal_event::Event;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use user_driver::interrupt::DeviceInterrupt;
use vhost::VhostControl;

/// How the host signals completions on one queue.
pub enum HostSignal {
    /// A call eventfd, for the caller's event loop to wait on.
    Event(Event),
    /// An interrupt raised through the assigned device's callback.
    Interrupt(DeviceInterrupt),
}

impl std::fmt::Debug for HostSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostSignal::Event(event) => f.debug_tuple("Event").field(event).finish(),
            HostSignal::Interrupt(_) => f.write_str("Interrupt"),
        }
    }
}

impl HostSignal {
    /// Consumes a pending signal, if any.
    ///
    /// Event signals never register `cx`; the owner of the event loop waits
    /// on the fd.
    pub fn poll_signal(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        match self {
            HostSignal::Event(event) => match event.try_wait() {
                Some(_) => Poll::Ready(()),
                None => Poll::Pending,
            },
            HostSignal::Interrupt(interrupt) => interrupt.poll(cx),
        }
    }
}

/// Keeps the backend alive for as long as the rings are in use.
pub(crate) enum BackendHandle {
    #[expect(dead_code)]
    Vhost {
        control: Box<dyn VhostControl>,
        tap: OwnedFd,
    },
    Assigned(Arc<dyn AssignedDevice>),
}

/// Everything a backend produces during bring-up.
pub(crate) struct BackendParts {
    pub queues: QueuePair,
    pub negotiated: Negotiated,
    pub mac: MacAddress,
    /// Indexed by queue number.
    pub signals: [HostSignal; 2],
    pub handle: BackendHandle,
}
