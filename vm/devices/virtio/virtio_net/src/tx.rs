// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The transmit queue.

use crate::features::HwFeatures;
use crate::features::ETHERNET_HEADER_LEN;
use crate::packet::L4Protocol;
use crate::packet::OffloadInfo;
use crate::packet::Packet;
use crate::spec;
use crate::spec::VirtioNetHeader;
use crate::spec::VirtioNetHeaderFlags;
use std::collections::VecDeque;
use user_driver::memory::MemoryBlock;
use user_driver::memory::PAGE_SIZE;
use user_driver::DmaClient;
use virtio::Buffer;
use virtio::BufferChain;
use virtio::Notifier;
use virtio::Ring;
use virtio::RingConfig;
use virtio::RingError;
use virtio::RingFeatures;
use virtio::RingMemory;
use zerocopy::IntoBytes;

const TCP_CSUM_OFFSET: u16 = 16;
const UDP_CSUM_OFFSET: u16 = 6;
const HEADER_SLOT_SIZE: usize = 16;

/// Builds the header describing the offloads `offload` asks for, limited to
/// what `hw` enables.
pub fn build_header(offload: &OffloadInfo, packet_len: usize, hw: &HwFeatures) -> VirtioNetHeader {
    let mut header = VirtioNetHeader::default();
    if !hw.tx_csum_l4_offload {
        return header;
    }
    let ip_end = ETHERNET_HEADER_LEN as u16 + u16::from(offload.ip_hdr_len);
    let (csum_offset, l4_hdr_len) = match offload.protocol {
        L4Protocol::Tcp => (TCP_CSUM_OFFSET, offload.tcp_hdr_len),
        L4Protocol::Udp => (UDP_CSUM_OFFSET, offload.udp_hdr_len),
        L4Protocol::Other => return header,
    };
    if offload.needs_csum {
        header.flags = VirtioNetHeaderFlags::new().with_needs_csum(true).into();
        header.csum_start = ip_end.into();
        header.csum_offset = csum_offset.into();
    }
    match offload.protocol {
        L4Protocol::Tcp if hw.tx_tso && offload.tso_seg_size != 0 => {
            header.gso_type = spec::GSO_TCPV4;
            header.hdr_len = (ip_end + u16::from(l4_hdr_len)).into();
            header.gso_size = offload.tso_seg_size.into();
        }
        L4Protocol::Udp
            if hw.tx_ufo && packet_len > usize::from(hw.mtu) + ETHERNET_HEADER_LEN =>
        {
            header.gso_type = spec::GSO_UDP;
            header.hdr_len = (ip_end + u16::from(l4_hdr_len)).into();
            header.gso_size = (hw.mtu
                - u16::from(offload.ip_hdr_len)
                - u16::from(l4_hdr_len))
            .into();
        }
        _ => {}
    }
    header
}

#[derive(Debug, Copy, Clone, Default)]
pub struct TxStats {
    pub packets: u64,
    pub bytes: u64,
    /// Stack fragments posted, not counting headers.
    pub fragments: u64,
}

/// A posted packet and the header slot prepended to it.
struct TxChain {
    packet: Packet,
    header_slot: u16,
}

/// Descriptor lengths are 32 bits; larger fragments are a caller bug.
fn descriptor_len(len: usize) -> u32 {
    match u32::try_from(len) {
        Ok(len) => len,
        Err(_) => panic!("fragment of {len:#x} bytes does not fit in a descriptor"),
    }
}

impl BufferChain for TxChain {
    fn buffers(&self) -> impl Iterator<Item = Buffer> + '_ {
        self.packet.fragments().iter().map(|fragment| Buffer {
            addr: fragment.device_address(),
            len: descriptor_len(fragment.len()),
            writeable: false,
        })
    }
}

pub struct TxQueue {
    ring: Ring<TxChain>,
    hw: HwFeatures,
    header_len: usize,
    headers: MemoryBlock,
    free_headers: Vec<u16>,
    completed: Vec<(TxChain, u32)>,
    stats: TxStats,
}

impl TxQueue {
    pub fn new(
        dma: &dyn DmaClient,
        size: u16,
        features: RingFeatures,
        notifier: Notifier,
        hw: HwFeatures,
        header_len: usize,
    ) -> Result<Self, RingError> {
        let ring = Ring::new(dma, size, features, notifier)?;
        let headers = dma
            .allocate_dma_buffer((usize::from(size) * HEADER_SLOT_SIZE).next_multiple_of(PAGE_SIZE))
            .map_err(RingError::Allocation)?;
        Ok(Self {
            ring,
            hw,
            header_len,
            headers,
            free_headers: (0..size).rev().collect(),
            completed: Vec::new(),
            stats: TxStats::default(),
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

    pub fn stats(&self) -> TxStats {
        self.stats
    }

    /// Posts packets from the front of `packets` while the ring has room for
    /// each one plus its header (`nr_frags + 1` descriptors).
    ///
    /// Returns the number of packets posted; the rest stay queued.
    pub fn post(&mut self, packets: &mut VecDeque<Packet>) -> usize {
        let mut batch = Vec::new();
        let mut bytes = 0;
        let mut fragments = 0;
        while packets
            .front()
            .is_some_and(|packet| packet.nr_frags() < self.ring.credits().current())
        {
            let Some(mut packet) = packets.pop_front() else {
                break;
            };
            bytes += packet.len();
            fragments += packet.nr_frags();

            let header = build_header(packet.offload_info(), packet.len(), &self.hw);
            // Every chain holds at least two descriptors, so slots cannot run
            // out before credits do.
            let Some(slot) = self.free_headers.pop() else {
                panic!("transmit header slots exhausted");
            };
            let block = self
                .headers
                .subblock(usize::from(slot) * HEADER_SLOT_SIZE, self.header_len);
            block.write_at(0, &header.as_bytes()[..self.header_len]);
            packet.prepend(block);

            let acquired = self.ring.credits_mut().try_acquire(packet.nr_frags());
            assert!(acquired);
            batch.push(TxChain {
                packet,
                header_slot: slot,
            });
        }

        let posted = self.ring.post(batch);
        if posted > 0 {
            self.stats.packets += posted as u64;
            self.stats.bytes += bytes as u64;
            self.stats.fragments += fragments as u64;
            tracing::trace!(posted, bytes, "transmit");
        }
        posted
    }

    /// Reclaims completed packets, returning their credits and headers.
    pub fn poll_completions(&mut self) -> Result<usize, RingError> {
        let count = self.ring.poll_used(&mut self.completed)?;
        for (chain, _) in self.completed.drain(..) {
            self.ring.credits_mut().release(chain.packet.nr_frags());
            self.free_headers.push(chain.header_slot);
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::build_header;
    use super::descriptor_len;
    use crate::features::HwFeatures;
    use crate::packet::L4Protocol;
    use crate::packet::OffloadInfo;
    use crate::spec;

    fn hw(tso: bool, ufo: bool) -> HwFeatures {
        HwFeatures {
            tx_csum_l4_offload: true,
            rx_csum_offload: true,
            rx_lro: false,
            tx_tso: tso,
            tx_ufo: ufo,
            mtu: 1500,
            max_packet_len: 65535 - 14,
        }
    }

    fn tcp(tso_seg_size: u16) -> OffloadInfo {
        OffloadInfo {
            protocol: L4Protocol::Tcp,
            needs_csum: true,
            tso_seg_size,
            ..Default::default()
        }
    }

    #[test]
    fn tcp_tso() {
        let header = build_header(&tcp(1400), 20000, &hw(true, false));
        assert!(header.flags().needs_csum());
        assert_eq!(header.gso_type, spec::GSO_TCPV4);
        assert_eq!(header.gso_size.get(), 1400);
        assert_eq!(header.hdr_len.get(), 54);
        assert_eq!(header.csum_start.get(), 34);
        assert_eq!(header.csum_offset.get(), 16);

        let header = build_header(&tcp(1400), 20000, &hw(false, false));
        assert!(header.flags().needs_csum());
        assert_eq!(header.gso_type, spec::GSO_NONE);
        assert_eq!(header.gso_size.get(), 0);
    }

    #[test]
    fn udp_ufo_only_above_mtu() {
        let udp = OffloadInfo {
            protocol: L4Protocol::Udp,
            needs_csum: true,
            ..Default::default()
        };
        let header = build_header(&udp, 1514, &hw(false, true));
        assert_eq!(header.csum_offset.get(), 6);
        assert_eq!(header.gso_type, spec::GSO_NONE);

        let header = build_header(&udp, 1515, &hw(false, true));
        assert_eq!(header.gso_type, spec::GSO_UDP);
        assert_eq!(header.hdr_len.get(), 42);
        assert_eq!(header.gso_size.get(), 1472);
    }

    #[test]
    fn no_offload() {
        let mut features = hw(true, true);
        features.tx_csum_l4_offload = false;
        assert_eq!(
            build_header(&tcp(1400), 20000, &features),
            spec::VirtioNetHeader::default()
        );
        let other = OffloadInfo {
            needs_csum: true,
            ..Default::default()
        };
        assert_eq!(
            build_header(&other, 100, &hw(true, true)),
            spec::VirtioNetHeader::default()
        );
    }

    #[test]
    fn descriptor_lengths() {
        assert_eq!(descriptor_len(4096), 4096);
        assert_eq!(descriptor_len(u32::MAX as usize), u32::MAX);
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    #[should_panic(expected = "does not fit in a descriptor")]
    fn oversized_fragment() {
        descriptor_len(1 << 32);
    }
}
