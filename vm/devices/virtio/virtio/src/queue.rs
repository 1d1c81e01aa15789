// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Driver-side split virtqueue.

use crate::credits::DescriptorCredits;
use crate::notify::Notifier;
use crate::ring_memory::RingAddresses;
use crate::ring_memory::RingLayout;
use crate::ring_memory::RingMemory;
use crate::spec::queue as spec;
use std::sync::atomic;
use thiserror::Error;
use user_driver::DmaClient;

/// The largest ring the split layout can describe.
pub const MAX_RING_SIZE: u16 = 0x8000;

#[derive(Debug, Error)]
pub enum RingError {
    #[error("ring size {0} is not a power of two between 2 and 32768")]
    InvalidSize(u16),
    #[error("failed to allocate ring memory")]
    Allocation(#[source] anyhow::Error),
    #[error("used index {used_idx} is more than {size} entries past {last_used}")]
    UsedIndexOverrun {
        used_idx: u16,
        last_used: u16,
        size: u16,
    },
    #[error("used entry references descriptor {0}, which is out of range")]
    InvalidDescriptorId(u32),
    #[error("used entry references descriptor {0}, which is not the head of an in-flight chain")]
    NotInFlight(u32),
}

/// Ring features negotiated with the host.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct RingFeatures {
    pub event_index: bool,
    pub indirect: bool,
    pub mergeable_buffers: bool,
}

/// The fixed layout of a ring, for handing to the host.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RingConfig {
    pub size: u16,
    pub addresses: RingAddresses,
    pub features: RingFeatures,
}

/// One physically contiguous piece of a buffer chain.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Buffer {
    pub addr: u64,
    pub len: u32,
    /// The host writes to this buffer rather than reading from it.
    pub writeable: bool,
}

/// A logical unit of transfer, posted as one descriptor chain.
///
/// The ring holds the chain until the host completes it, so any memory the
/// chain owns stays alive while the host may access it.
pub trait BufferChain {
    fn buffers(&self) -> impl Iterator<Item = Buffer> + '_;
}

#[derive(Debug, Copy, Clone, Default)]
struct Slot {
    next: u16,
    has_next: bool,
}

/// The guest's private copy of descriptor linkage.
///
/// The shared descriptor table is never read back, so the host cannot
/// corrupt the free list.
#[derive(Debug)]
struct DescriptorArena {
    slots: Vec<Slot>,
    free_head: Option<u16>,
    free_tail: Option<u16>,
    free_count: usize,
}

impl DescriptorArena {
    fn new(size: u16) -> Self {
        let slots = (0..size)
            .map(|i| Slot {
                next: i.wrapping_add(1),
                has_next: false,
            })
            .collect();
        Self {
            slots,
            free_head: Some(0),
            free_tail: Some(size - 1),
            free_count: size as usize,
        }
    }

    fn allocate(&mut self) -> u16 {
        let Some(id) = self.free_head else {
            panic!("descriptor free list exhausted");
        };
        if self.free_tail == Some(id) {
            self.free_head = None;
            self.free_tail = None;
        } else {
            self.free_head = Some(self.slots[id as usize].next);
        }
        self.free_count -= 1;
        id
    }

    fn link(&mut self, id: u16, next: Option<u16>) {
        self.slots[id as usize] = Slot {
            next: next.unwrap_or(0),
            has_next: next.is_some(),
        };
    }

    /// Appends the chain starting at `head` to the free list, returning its
    /// length.
    fn free_chain(&mut self, head: u16) -> usize {
        match self.free_tail {
            Some(tail) => self.slots[tail as usize].next = head,
            None => self.free_head = Some(head),
        }
        let mut id = head;
        let mut count = 1;
        while self.slots[id as usize].has_next {
            id = self.slots[id as usize].next;
            count += 1;
        }
        self.free_tail = Some(id);
        self.free_count += count;
        count
    }
}

/// The driver's end of a split virtqueue.
///
/// `C` is the per-chain state handed back on completion.
#[derive(Debug)]
pub struct Ring<C> {
    mem: RingMemory,
    config: RingConfig,
    notifier: Notifier,
    arena: DescriptorArena,
    chains: Vec<Option<C>>,
    avail_head: u16,
    added_since_kick: u16,
    used_tail: u16,
    credits: DescriptorCredits,
}

impl<C: BufferChain> Ring<C> {
    /// Allocates and initializes a ring of `size` descriptors.
    pub fn new(
        dma: &dyn DmaClient,
        size: u16,
        features: RingFeatures,
        notifier: Notifier,
    ) -> Result<Self, RingError> {
        if !size.is_power_of_two() || size < 2 || size > MAX_RING_SIZE {
            return Err(RingError::InvalidSize(size));
        }
        let layout = RingLayout::new(size);
        let mem = dma
            .allocate_dma_buffer(layout.len)
            .map_err(RingError::Allocation)?;
        let mem = RingMemory::new(mem, layout);
        let config = RingConfig {
            size,
            addresses: mem.addresses(),
            features,
        };
        tracing::debug!(
            size,
            descriptors = config.addresses.descriptors,
            avail = config.addresses.avail,
            used = config.addresses.used,
            event_index = features.event_index,
            "ring created"
        );
        Ok(Self {
            mem,
            config,
            notifier,
            arena: DescriptorArena::new(size),
            chains: (0..size).map(|_| None).collect(),
            avail_head: 0,
            added_since_kick: 0,
            used_tail: 0,
            credits: DescriptorCredits::new(size as usize),
        })
    }

    pub fn config(&self) -> &RingConfig {
        &self.config
    }

    pub fn size(&self) -> u16 {
        self.config.size
    }

    /// The shared memory of the ring.
    pub fn memory(&self) -> &RingMemory {
        &self.mem
    }

    pub fn credits(&self) -> &DescriptorCredits {
        &self.credits
    }

    pub fn credits_mut(&mut self) -> &mut DescriptorCredits {
        &mut self.credits
    }

    /// The number of descriptors on the free list.
    pub fn free_descriptors(&self) -> usize {
        self.arena.free_count
    }

    /// The number of chains posted but not yet completed.
    pub fn in_flight(&self) -> usize {
        self.chains.iter().filter(|c| c.is_some()).count()
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    fn mask(&self) -> u16 {
        self.config.size - 1
    }

    /// Posts `chains` to the available ring and kicks the host if needed.
    ///
    /// The caller must already hold descriptor credits for every buffer of
    /// every chain. Returns the number of chains posted.
    pub fn post(&mut self, chains: impl IntoIterator<Item = C>) -> usize {
        let mut posted = 0;
        for chain in chains {
            let count = chain.buffers().count();
            assert!(count > 0, "empty buffer chain");
            assert!(
                count <= self.arena.free_count,
                "posting {count} descriptors with {} free",
                self.arena.free_count
            );
            let head = self.write_chain(&chain);
            let prev = self.chains[head as usize].replace(chain);
            assert!(prev.is_none(), "descriptor {head} already in flight");
            self.mem.write_avail_entry(self.avail_head & self.mask(), head);
            self.avail_head = self.avail_head.wrapping_add(1);
            self.added_since_kick = self.added_since_kick.wrapping_add(1);
            posted += 1;
        }
        if posted > 0 {
            self.mem.publish_avail_idx(self.avail_head);
            self.kick();
        }
        posted
    }

    fn write_chain(&mut self, chain: &C) -> u16 {
        let mut buffers = chain.buffers().peekable();
        let head = self.arena.allocate();
        let mut id = head;
        while let Some(buffer) = buffers.next() {
            let next = buffers.peek().is_some().then(|| self.arena.allocate());
            let flags = spec::DescriptorFlags::new()
                .with_write(buffer.writeable)
                .with_next(next.is_some());
            self.mem.write_descriptor(
                id,
                &spec::Descriptor::new(buffer.addr, buffer.len, flags, next.unwrap_or(0)),
            );
            self.arena.link(id, next);
            if let Some(next) = next {
                id = next;
            }
        }
        head
    }

    fn kick(&mut self) {
        // Make sure the host's view of the fresh index is ordered before
        // reading its notification state.
        atomic::fence(atomic::Ordering::SeqCst);
        let need_kick = if self.config.features.event_index {
            let avail_event = self.mem.avail_event();
            self.avail_head.wrapping_sub(avail_event).wrapping_sub(1) < self.added_since_kick
        } else {
            if self.mem.used_flags().no_notify() {
                return;
            }
            true
        };
        if need_kick || self.added_since_kick >= u16::MAX / 2 {
            tracing::trace!(added = self.added_since_kick, "kick");
            self.notifier.notify();
            self.added_since_kick = 0;
        }
    }

    /// Drains the used ring, returning each completed chain with the number
    /// of bytes the host reported.
    ///
    /// Descriptors are back on the free list when this returns; credits are
    /// left for the caller to release. Returns the number of completions.
    pub fn poll_used(&mut self, completed: &mut Vec<(C, u32)>) -> Result<usize, RingError> {
        let used_idx = self.mem.used_idx();
        let count = used_idx.wrapping_sub(self.used_tail);
        if count > self.config.size {
            return Err(RingError::UsedIndexOverrun {
                used_idx,
                last_used: self.used_tail,
                size: self.config.size,
            });
        }
        for _ in 0..count {
            let entry = self.mem.read_used_entry(self.used_tail & self.mask());
            let id = entry.id.get();
            if id >= self.config.size as u32 {
                return Err(RingError::InvalidDescriptorId(id));
            }
            let chain = self.chains[id as usize]
                .take()
                .ok_or(RingError::NotInFlight(id))?;
            self.used_tail = self.used_tail.wrapping_add(1);
            let freed = self.arena.free_chain(id as u16);
            tracing::trace!(id, len = entry.len.get(), freed, "used");
            completed.push((chain, entry.len.get()));
        }
        if count > 0 && self.config.features.event_index {
            self.mem.set_used_event(self.used_tail);
        }
        Ok(count as usize)
    }
}
