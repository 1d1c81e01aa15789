// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Packets exchanged with the network stack.

use user_driver::memory::MemoryBlock;
use user_driver::memory::PAGE_SIZE;
use user_driver::DmaClient;

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum L4Protocol {
    Tcp,
    Udp,
    #[default]
    Other,
}

/// Offload metadata attached to a packet by the stack on transmit, or by the
/// driver on receive.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct OffloadInfo {
    pub protocol: L4Protocol,
    /// The stack left the L4 checksum for the device to fill in.
    pub needs_csum: bool,
    pub ip_hdr_len: u8,
    pub tcp_hdr_len: u8,
    pub udp_hdr_len: u8,
    /// Nonzero to request TCP segmentation into segments of this size.
    pub tso_seg_size: u16,
    /// Set on receive when the device validated the checksum.
    pub rx_csum_valid: bool,
}

impl Default for OffloadInfo {
    fn default() -> Self {
        Self {
            protocol: L4Protocol::Other,
            needs_csum: false,
            ip_hdr_len: 20,
            tcp_hdr_len: 20,
            udp_hdr_len: 8,
            tso_seg_size: 0,
            rx_csum_valid: false,
        }
    }
}

/// A packet made of DMA-visible fragments.
#[derive(Debug, Clone, Default)]
pub struct Packet {
    fragments: Vec<MemoryBlock>,
    offload: OffloadInfo,
}

impl Packet {
    pub fn new(fragments: Vec<MemoryBlock>) -> Self {
        Self {
            fragments,
            offload: OffloadInfo::default(),
        }
    }

    pub fn with_offload(mut self, offload: OffloadInfo) -> Self {
        self.offload = offload;
        self
    }

    /// Copies `data` into a fresh single-fragment packet.
    pub fn copy_from(dma: &dyn DmaClient, data: &[u8]) -> anyhow::Result<Self> {
        let len = data.len().max(1).next_multiple_of(PAGE_SIZE);
        let mem = dma.allocate_dma_buffer(len)?;
        mem.write_at(0, data);
        Ok(Self::new(vec![mem.subblock(0, data.len())]))
    }

    /// The total length of all fragments.
    pub fn len(&self) -> usize {
        self.fragments.iter().map(MemoryBlock::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn nr_frags(&self) -> usize {
        self.fragments.len()
    }

    pub fn fragments(&self) -> &[MemoryBlock] {
        &self.fragments
    }

    pub fn offload_info(&self) -> &OffloadInfo {
        &self.offload
    }

    pub fn offload_info_mut(&mut self) -> &mut OffloadInfo {
        &mut self.offload
    }

    /// Inserts `fragment` before the existing fragments.
    pub fn prepend(&mut self, fragment: MemoryBlock) {
        self.fragments.insert(0, fragment);
    }

    /// Copies the packet's contents out.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.len());
        for fragment in &self.fragments {
            data.extend_from_slice(&fragment.to_vec());
        }
        data
    }
}

#[cfg(test)]
mod tests {
    use super::L4Protocol;
    use super::OffloadInfo;
    use super::Packet;
    use user_driver::heap::HeapDmaClient;
    use user_driver::DmaClient;

    #[test]
    fn fragments() {
        let dma = HeapDmaClient::new();
        let mut packet = Packet::copy_from(&dma, b"payload").unwrap();
        assert_eq!(packet.len(), 7);
        assert_eq!(packet.nr_frags(), 1);

        let header = dma.allocate_dma_buffer(4096).unwrap().subblock(0, 3);
        header.write_at(0, b"hdr");
        packet.prepend(header);
        assert_eq!(packet.nr_frags(), 2);
        assert_eq!(packet.to_vec(), b"hdrpayload");
    }

    #[test]
    fn offload_defaults() {
        let offload = OffloadInfo::default();
        assert_eq!(offload.protocol, L4Protocol::Other);
        assert_eq!(
            (offload.ip_hdr_len, offload.tcp_hdr_len, offload.udp_hdr_len),
            (20, 20, 8)
        );
        assert!(!offload.needs_csum);
        assert_eq!(offload.tso_seg_size, 0);

        let packet = Packet::new(Vec::new()).with_offload(OffloadInfo {
            needs_csum: true,
            ..Default::default()
        });
        assert!(packet.is_empty());
        assert!(packet.offload_info().needs_csum);
    }
}
