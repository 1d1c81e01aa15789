// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Counting of free descriptor slots.

use std::task::Context;
use std::task::Poll;
use std::task::Waker;

/// A counting semaphore over the free descriptors of one ring.
///
/// Posting consumes credits and completion handlers return them. Both sides
/// run on the same task, so this needs no locking; the waker lets a suspended
/// refill resume once completions release credits.
#[derive(Debug)]
pub struct DescriptorCredits {
    available: usize,
    waker: Option<Waker>,
}

impl DescriptorCredits {
    pub fn new(available: usize) -> Self {
        Self {
            available,
            waker: None,
        }
    }

    /// The number of credits that can be acquired right now.
    pub fn current(&self) -> usize {
        self.available
    }

    /// Takes `n` credits if that many are available, without waiting.
    pub fn try_acquire(&mut self, n: usize) -> bool {
        if n <= self.available {
            self.available -= n;
            true
        } else {
            false
        }
    }

    /// Takes `n` credits, or registers the waker to be woken by a later
    /// [`Self::release`].
    pub fn poll_acquire(&mut self, cx: &mut Context<'_>, n: usize) -> Poll<()> {
        if self.try_acquire(n) {
            Poll::Ready(())
        } else {
            if self.waker.as_ref().is_none_or(|w| !w.will_wake(cx.waker())) {
                self.waker = Some(cx.waker().clone());
            }
            Poll::Pending
        }
    }

    /// Returns `n` credits.
    pub fn release(&mut self, n: usize) {
        self.available += n;
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }
}
