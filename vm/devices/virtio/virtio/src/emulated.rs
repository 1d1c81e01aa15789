// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The host's end of a ring, for exercising drivers without a real backend.

use crate::ring_memory::RingMemory;
use crate::spec::queue as spec;
use std::sync::atomic;

/// A descriptor chain popped from the available ring.
#[derive(Debug, Clone)]
pub struct HostChain {
    pub head: u16,
    pub descriptors: Vec<spec::Descriptor>,
}

impl HostChain {
    /// The total length of the device-writable descriptors.
    pub fn writeable_len(&self) -> u32 {
        self.descriptors
            .iter()
            .filter(|d| d.flags().write())
            .map(|d| d.length.get())
            .sum()
    }
}

/// Consumes available entries and produces used entries, the way a backend
/// would.
#[derive(Debug)]
pub struct HostRing {
    mem: RingMemory,
    last_avail: u16,
    used_idx: u16,
    published: u16,
}

impl HostRing {
    pub fn new(mem: RingMemory) -> Self {
        Self {
            mem,
            last_avail: 0,
            used_idx: 0,
            published: 0,
        }
    }

    pub fn memory(&self) -> &RingMemory {
        &self.mem
    }

    /// The number of chains the driver has made available and the host has
    /// not popped.
    pub fn pending(&self) -> u16 {
        self.mem.avail_idx().wrapping_sub(self.last_avail)
    }

    /// Pops the next available chain.
    ///
    /// Panics if the chain has a loop, since a correct driver never builds
    /// one.
    pub fn pop(&mut self) -> Option<HostChain> {
        if self.pending() == 0 {
            return None;
        }
        let head = self.mem.read_avail_entry(self.last_avail);
        self.last_avail = self.last_avail.wrapping_add(1);
        let size = self.mem.layout().size;
        let mut descriptors = Vec::new();
        let mut index = head;
        loop {
            assert!(descriptors.len() < size as usize, "descriptor chain loops");
            let descriptor = self.mem.read_descriptor(index);
            descriptors.push(descriptor);
            if !descriptor.flags().next() {
                break;
            }
            index = descriptor.next.get();
        }
        Some(HostChain { head, descriptors })
    }

    /// Pops every available chain.
    pub fn pop_all(&mut self) -> Vec<HostChain> {
        std::iter::from_fn(|| self.pop()).collect()
    }

    /// Writes a used entry without publishing it.
    pub fn push_used(&mut self, id: u32, len: u32) {
        self.mem.write_used_entry(
            self.used_idx,
            &spec::UsedElement {
                id: id.into(),
                len: len.into(),
            },
        );
        self.used_idx = self.used_idx.wrapping_add(1);
    }

    /// Publishes all pushed used entries.
    ///
    /// Returns whether the driver asked to be signaled for them.
    pub fn publish(&mut self) -> bool {
        let old = self.published;
        self.published = self.used_idx;
        self.mem.publish_used_idx(self.used_idx);
        // Ensure the used index write is visible before reading the field that
        // determines whether to signal.
        atomic::fence(atomic::Ordering::SeqCst);
        let used_event = self.mem.used_event();
        // Signal if used_event falls in [old, new).
        self.used_idx.wrapping_sub(used_event).wrapping_sub(1) < self.used_idx.wrapping_sub(old)
    }

    /// Completes `chain` with `len` bytes written and publishes it.
    pub fn complete(&mut self, chain: &HostChain, len: u32) -> bool {
        self.push_used(chain.head.into(), len);
        self.publish()
    }

    /// Publishes a raw used index, for simulating a misbehaving host.
    pub fn publish_raw_used_idx(&mut self, idx: u16) {
        self.used_idx = idx;
        self.published = idx;
        self.mem.publish_used_idx(idx);
    }

    /// Sets or clears the used-ring flag that suppresses driver kicks.
    pub fn set_no_notify(&self, no_notify: bool) {
        self.mem
            .set_used_flags(spec::UsedFlags::new().with_no_notify(no_notify));
    }

    /// Asks to be kicked when the driver publishes available index `idx + 1`.
    pub fn set_avail_event(&self, idx: u16) {
        self.mem.set_avail_event(idx);
    }
}
