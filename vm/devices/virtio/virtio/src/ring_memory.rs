// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Access to ring memory shared with the host.
//!
//! The host reads and writes this memory concurrently, so every accessor
//! returns an owned copy and the index fields go through atomics with the
//! ordering the virtio protocol requires.

use crate::spec::queue as spec;
use crate::spec::u16_le;
use std::sync::atomic::Ordering;
use user_driver::memory::MemoryBlock;

/// Byte offsets of the three parts of a split virtqueue within a single
/// contiguous allocation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RingLayout {
    /// The number of descriptors.
    pub size: u16,
    /// Offset of the available ring. The descriptor table is at offset 0.
    pub avail_offset: usize,
    /// Offset of the used ring.
    pub used_offset: usize,
    /// Total bytes needed, rounded up to a page.
    pub len: usize,
}

impl RingLayout {
    pub fn new(size: u16) -> Self {
        let n = size as usize;
        let avail_offset = n * size_of::<spec::Descriptor>();
        let avail_end =
            avail_offset + spec::AVAIL_OFFSET_RING + spec::AVAIL_ELEMENT_SIZE * n + size_of::<u16>();
        let used_offset = avail_end.next_multiple_of(spec::USED_RING_ALIGN);
        let used_end =
            used_offset + spec::USED_OFFSET_RING + spec::USED_ELEMENT_SIZE * n + size_of::<u16>();
        Self {
            size,
            avail_offset,
            used_offset,
            len: used_end.next_multiple_of(user_driver::memory::PAGE_SIZE),
        }
    }

    fn used_event_offset(&self) -> usize {
        self.avail_offset + spec::AVAIL_OFFSET_RING + spec::AVAIL_ELEMENT_SIZE * self.size as usize
    }

    fn avail_event_offset(&self) -> usize {
        self.used_offset + spec::USED_OFFSET_RING + spec::USED_ELEMENT_SIZE * self.size as usize
    }
}

/// Device addresses of the three parts of a ring.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RingAddresses {
    pub descriptors: u64,
    pub avail: u64,
    pub used: u64,
}

/// A view of one virtqueue's shared memory.
///
/// Both the driver side ([`crate::Ring`]) and the emulated host side
/// ([`crate::emulated::HostRing`]) go through this type. Slot arguments are
/// ring positions and are masked by the ring size here.
#[derive(Debug, Clone)]
pub struct RingMemory {
    mem: MemoryBlock,
    layout: RingLayout,
}

impl RingMemory {
    /// Wraps `mem`, which must be at least `layout.len` bytes.
    pub(crate) fn new(mem: MemoryBlock, layout: RingLayout) -> Self {
        assert!(mem.len() >= layout.len);
        Self { mem, layout }
    }

    pub fn layout(&self) -> &RingLayout {
        &self.layout
    }

    pub fn addresses(&self) -> RingAddresses {
        let base = self.mem.device_address();
        RingAddresses {
            descriptors: base,
            avail: base + self.layout.avail_offset as u64,
            used: base + self.layout.used_offset as u64,
        }
    }

    fn slot(&self, index: u16) -> usize {
        (index & (self.layout.size - 1)) as usize
    }

    fn load_u16(&self, offset: usize, ordering: Ordering) -> u16 {
        u16::from_le(self.mem.as_atomic_u16(offset).load(ordering))
    }

    fn store_u16(&self, offset: usize, value: u16, ordering: Ordering) {
        self.mem
            .as_atomic_u16(offset)
            .store(value.to_le(), ordering)
    }

    fn descriptor_offset(&self, index: u16) -> usize {
        assert!(index < self.layout.size);
        index as usize * size_of::<spec::Descriptor>()
    }

    fn avail_entry_offset(&self, index: u16) -> usize {
        self.layout.avail_offset + spec::AVAIL_OFFSET_RING + spec::AVAIL_ELEMENT_SIZE * self.slot(index)
    }

    fn used_entry_offset(&self, index: u16) -> usize {
        self.layout.used_offset + spec::USED_OFFSET_RING + spec::USED_ELEMENT_SIZE * self.slot(index)
    }

    // Driver side.

    pub fn write_descriptor(&self, index: u16, descriptor: &spec::Descriptor) {
        self.mem.write_obj(self.descriptor_offset(index), descriptor);
    }

    pub fn write_avail_entry(&self, index: u16, head: u16) {
        self.mem
            .write_obj::<u16_le>(self.avail_entry_offset(index), &head.into());
    }

    /// Publishes the available index. All prior descriptor and available
    /// entry writes are visible to the host before the new index is.
    pub fn publish_avail_idx(&self, idx: u16) {
        self.store_u16(
            self.layout.avail_offset + spec::AVAIL_OFFSET_IDX,
            idx,
            Ordering::Release,
        );
    }

    /// Loads the used index. All used entries before it are visible once this
    /// returns.
    pub fn used_idx(&self) -> u16 {
        self.load_u16(self.layout.used_offset + spec::USED_OFFSET_IDX, Ordering::Acquire)
    }

    pub fn read_used_entry(&self, index: u16) -> spec::UsedElement {
        self.mem.read_obj(self.used_entry_offset(index))
    }

    pub fn used_flags(&self) -> spec::UsedFlags {
        self.load_u16(self.layout.used_offset + spec::USED_OFFSET_FLAGS, Ordering::Relaxed)
            .into()
    }

    pub fn avail_event(&self) -> u16 {
        self.load_u16(self.layout.avail_event_offset(), Ordering::Relaxed)
    }

    pub fn set_used_event(&self, idx: u16) {
        self.store_u16(self.layout.used_event_offset(), idx, Ordering::Relaxed);
    }

    // Host side.

    pub fn read_descriptor(&self, index: u16) -> spec::Descriptor {
        self.mem.read_obj(self.descriptor_offset(index))
    }

    pub fn avail_idx(&self) -> u16 {
        self.load_u16(
            self.layout.avail_offset + spec::AVAIL_OFFSET_IDX,
            Ordering::Acquire,
        )
    }

    pub fn read_avail_entry(&self, index: u16) -> u16 {
        self.mem
            .read_obj::<u16_le>(self.avail_entry_offset(index))
            .get()
    }

    pub fn write_used_entry(&self, index: u16, entry: &spec::UsedElement) {
        self.mem.write_obj(self.used_entry_offset(index), entry);
    }

    pub fn publish_used_idx(&self, idx: u16) {
        self.store_u16(
            self.layout.used_offset + spec::USED_OFFSET_IDX,
            idx,
            Ordering::Release,
        );
    }

    pub fn set_used_flags(&self, flags: spec::UsedFlags) {
        self.store_u16(
            self.layout.used_offset + spec::USED_OFFSET_FLAGS,
            flags.into(),
            Ordering::Relaxed,
        );
    }

    pub fn set_avail_event(&self, idx: u16) {
        self.store_u16(self.layout.avail_event_offset(), idx, Ordering::Relaxed);
    }

    pub fn used_event(&self) -> u16 {
        self.load_u16(self.layout.used_event_offset(), Ordering::Relaxed)
    }
}
