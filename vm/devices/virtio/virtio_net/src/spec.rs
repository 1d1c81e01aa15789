// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! virtio-net definitions.

use bitfield_struct::bitfield;
use std::mem::offset_of;
use virtio::spec::u16_le;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

// These correspond to VIRTIO_NET_F_ flags, plus the transport-independent
// ring and version bits that share the feature word.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct NetworkFeatures {
    pub csum: bool,
    pub guest_csum: bool,
    pub ctrl_guest_offloads: bool,
    pub mtu: bool,
    _reserved: bool,
    pub mac: bool,
    _reserved2: bool,
    pub guest_tso4: bool,
    pub guest_tso6: bool,
    pub guest_ecn: bool,
    pub guest_ufo: bool,
    pub host_tso4: bool,
    pub host_tso6: bool,
    pub host_ecn: bool,
    pub host_ufo: bool,
    pub mrg_rxbuf: bool,
    pub status: bool,
    pub ctrl_vq: bool,
    pub ctrl_rx: bool,
    pub ctrl_vlan: bool,
    _reserved3: bool,
    pub guest_announce: bool,
    pub mq: bool,
    pub ctrl_mac_addr: bool,
    #[bits(4)]
    _reserved4: u8,
    pub ring_indirect_desc: bool,
    pub ring_event_idx: bool,
    #[bits(2)]
    _reserved5: u8,
    pub version_1: bool,
    #[bits(31)]
    _reserved6: u32,
}

// These correspond to VIRTIO_NET_S_ flags.
#[bitfield(u16)]
pub struct NetStatus {
    pub link_up: bool,
    pub announce: bool,
    #[bits(14)]
    _reserved: u16,
}

/// The start of the device configuration space.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct NetConfig {
    pub mac: [u8; 6],
    pub status: u16_le,
    pub max_virtqueue_pairs: u16_le,
}

// These correspond to VIRTIO_NET_HDR_F_ flags.
#[bitfield(u8)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct VirtioNetHeaderFlags {
    pub needs_csum: bool,
    pub data_valid: bool,
    pub rsc_info: bool,
    #[bits(5)]
    _reserved: u8,
}

// These correspond to VIRTIO_NET_HDR_GSO_ values.
pub const GSO_NONE: u8 = 0;
pub const GSO_TCPV4: u8 = 1;
pub const GSO_UDP: u8 = 3;

/// The header that precedes every packet on the rings.
///
/// `num_buffers` is only present when mergeable receive buffers were
/// negotiated; otherwise the header ends before it.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct VirtioNetHeader {
    pub flags: u8,
    pub gso_type: u8,
    pub hdr_len: u16_le,
    pub gso_size: u16_le,
    pub csum_start: u16_le,
    pub csum_offset: u16_le,
    pub num_buffers: u16_le,
}

impl VirtioNetHeader {
    pub fn flags(&self) -> VirtioNetHeaderFlags {
        self.flags.into()
    }
}

/// The size of the header on the wire.
pub const fn header_size(mergeable_rx_buffers: bool) -> usize {
    if mergeable_rx_buffers {
        size_of::<VirtioNetHeader>()
    } else {
        offset_of!(VirtioNetHeader, num_buffers)
    }
}

const _: () = assert!(header_size(true) == 12);
const _: () = assert!(header_size(false) == 10);
