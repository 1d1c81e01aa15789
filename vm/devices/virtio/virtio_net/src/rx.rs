// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The receive queue.

use crate::packet::OffloadInfo;
use crate::packet::Packet;
use crate::spec::VirtioNetHeader;
use std::sync::Arc;
use std::task::ready;
use std::task::Context;
use std::task::Poll;
use thiserror::Error;
use user_driver::memory::MemoryBlock;
use user_driver::DmaClient;
use virtio::Buffer;
use virtio::BufferChain;
use virtio::Notifier;
use virtio::Ring;
use virtio::RingConfig;
use virtio::RingError;
use virtio::RingFeatures;
use virtio::RingMemory;

/// The size of each posted receive buffer.
pub const RX_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Error)]
pub enum RxError {
    #[error("failed to allocate receive buffers")]
    Allocation(#[source] anyhow::Error),
}

#[derive(Debug, Error)]
enum MalformedPacket {
    #[error("used length {len} exceeds the {capacity} byte buffer")]
    Overflow { len: usize, capacity: usize },
    #[error("first buffer holds {len} bytes, less than the {header_len} byte header")]
    ShortHeader { len: usize, header_len: usize },
    #[error("header reports zero buffers")]
    ZeroBuffers,
    #[error("header reports {0} buffers, more than the ring holds")]
    TooManyBuffers(u16),
}

#[derive(Debug, Copy, Clone, Default)]
pub struct RxStats {
    pub packets: u64,
    pub bytes: u64,
    pub fragments: u64,
    /// Packets dropped because the host described them inconsistently.
    pub malformed: u64,
}

struct RxBuffer(MemoryBlock);

impl BufferChain for RxBuffer {
    fn buffers(&self) -> impl Iterator<Item = Buffer> + '_ {
        std::iter::once(Buffer {
            addr: self.0.device_address(),
            len: self.0.len() as u32,
            writeable: true,
        })
    }
}

/// The packet being reassembled from mergeable buffers.
#[derive(Default)]
struct Reassembly {
    remaining: u16,
    fragments: Vec<MemoryBlock>,
    offload: OffloadInfo,
}

pub struct RxQueue {
    ring: Ring<RxBuffer>,
    dma: Arc<dyn DmaClient>,
    header_len: usize,
    mergeable: bool,
    rx_csum: bool,
    current: Reassembly,
    /// Buffers still owed to a dropped packet. They carry no header.
    discarding: u16,
    completed: Vec<(RxBuffer, u32)>,
    stats: RxStats,
}

impl RxQueue {
    pub fn new(
        dma: Arc<dyn DmaClient>,
        size: u16,
        features: RingFeatures,
        notifier: Notifier,
        header_len: usize,
        rx_csum: bool,
    ) -> Result<Self, RingError> {
        let ring = Ring::new(dma.as_ref(), size, features, notifier)?;
        Ok(Self {
            ring,
            dma,
            header_len,
            mergeable: features.mergeable_buffers,
            rx_csum,
            current: Reassembly::default(),
            discarding: 0,
            completed: Vec::new(),
            stats: RxStats::default(),
        })
    }

    pub fn ring_config(&self) -> &RingConfig {
        self.ring.config()
    }

    pub fn ring_memory(&self) -> &RingMemory {
        self.ring.memory()
    }

    pub fn free_descriptors(&self) -> usize {
        self.ring.free_descriptors()
    }

    pub fn credits(&self) -> usize {
        self.ring.credits().current()
    }

    pub fn stats(&self) -> RxStats {
        self.stats
    }

    /// Posts fresh buffers into every free slot.
    ///
    /// Pending until at least one slot is free. On allocation failure the
    /// buffers allocated so far are still posted.
    pub fn poll_refill(&mut self, cx: &mut Context<'_>) -> Poll<Result<usize, RxError>> {
        ready!(self.ring.credits_mut().poll_acquire(cx, 1));
        let extra = self.ring.credits().current();
        let acquired = self.ring.credits_mut().try_acquire(extra);
        assert!(acquired);
        let count = 1 + extra;

        let mut buffers = Vec::with_capacity(count);
        let mut result = Ok(count);
        for _ in 0..count {
            match self.dma.allocate_dma_buffer(RX_BUFFER_SIZE) {
                Ok(mem) => buffers.push(RxBuffer(mem)),
                Err(err) => {
                    result = Err(RxError::Allocation(err));
                    break;
                }
            }
        }
        self.ring.credits_mut().release(count - buffers.len());
        let posted = self.ring.post(buffers);
        tracing::trace!(posted, "refilled receive ring");
        Poll::Ready(result)
    }

    /// Drains completed buffers, appending finished packets to `packets`.
    ///
    /// Returns the number of used entries consumed.
    pub fn poll_completions(&mut self, packets: &mut Vec<Packet>) -> Result<usize, RingError> {
        let count = self.ring.poll_used(&mut self.completed)?;
        let mut completed = std::mem::take(&mut self.completed);
        for (RxBuffer(mem), len) in completed.drain(..) {
            if self.discarding > 0 {
                self.discarding -= 1;
                self.ring.credits_mut().release(1);
                continue;
            }
            match self.complete_buffer(mem, len as usize) {
                Ok(Some(packet)) => packets.push(packet),
                Ok(None) => {}
                Err(err) => {
                    let dropped = self.current.fragments.len() + 1;
                    // A failed buffer in the middle of a packet still counts
                    // against the packet's announced buffers.
                    self.discarding = self.current.remaining.saturating_sub(1);
                    self.current = Reassembly::default();
                    self.ring.credits_mut().release(dropped);
                    self.stats.malformed += 1;
                    tracing::warn!(
                        error = &err as &dyn std::error::Error,
                        dropped,
                        discarding = self.discarding,
                        "dropping malformed receive packet"
                    );
                }
            }
        }
        self.completed = completed;
        Ok(count)
    }

    fn complete_buffer(
        &mut self,
        mem: MemoryBlock,
        len: usize,
    ) -> Result<Option<Packet>, MalformedPacket> {
        if len > mem.len() {
            return Err(MalformedPacket::Overflow {
                len,
                capacity: mem.len(),
            });
        }
        let fragment = if self.current.remaining == 0 {
            if len < self.header_len {
                return Err(MalformedPacket::ShortHeader {
                    len,
                    header_len: self.header_len,
                });
            }
            let header: VirtioNetHeader = mem.read_obj(0);
            let num_buffers = if self.mergeable {
                header.num_buffers.get()
            } else {
                1
            };
            if num_buffers == 0 {
                return Err(MalformedPacket::ZeroBuffers);
            }
            if num_buffers > self.ring.size() {
                return Err(MalformedPacket::TooManyBuffers(num_buffers));
            }
            self.current.remaining = num_buffers;
            self.current.offload = OffloadInfo {
                rx_csum_valid: self.rx_csum && header.flags().data_valid(),
                ..Default::default()
            };
            mem.subblock(self.header_len, len - self.header_len)
        } else {
            mem.subblock(0, len)
        };
        self.current.fragments.push(fragment);
        self.current.remaining -= 1;
        if self.current.remaining > 0 {
            return Ok(None);
        }

        let current = std::mem::take(&mut self.current);
        let packet = Packet::new(current.fragments).with_offload(current.offload);
        self.ring.credits_mut().release(packet.nr_frags());
        self.stats.packets += 1;
        self.stats.bytes += packet.len() as u64;
        self.stats.fragments += packet.nr_frags() as u64;
        Ok(Some(packet))
    }
}
