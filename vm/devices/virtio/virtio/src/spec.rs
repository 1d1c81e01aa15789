// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Constants and layouts defined by the virtio spec

pub use packed_nums::*;

#[allow(non_camel_case_types)]
mod packed_nums {
    pub type u16_le = zerocopy::U16<zerocopy::LittleEndian>;
    pub type u32_le = zerocopy::U32<zerocopy::LittleEndian>;
    pub type u64_le = zerocopy::U64<zerocopy::LittleEndian>;
}

// Transport-independent feature bits, as masks over the 64-bit feature set.
pub const VIRTIO_F_RING_INDIRECT_DESC: u64 = 1 << 28;
pub const VIRTIO_F_RING_EVENT_IDX: u64 = 1 << 29;
pub const VIRTIO_F_VERSION_1: u64 = 1 << 32;

/// Split virtqueue definitions.
pub mod queue {
    use super::u16_le;
    use super::u32_le;
    use super::u64_le;
    use bitfield_struct::bitfield;

    use zerocopy::FromBytes;
    use zerocopy::Immutable;
    use zerocopy::IntoBytes;
    use zerocopy::KnownLayout;

    /// Used rings start on this boundary relative to the descriptor table.
    pub const USED_RING_ALIGN: usize = 4096;

    #[repr(C)]
    #[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct Descriptor {
        pub address: u64_le,
        pub length: u32_le,
        pub flags_raw: u16_le,
        pub next: u16_le,
    }

    const _: () = assert!(size_of::<Descriptor>() == 16);

    impl Descriptor {
        pub fn new(address: u64, length: u32, flags: DescriptorFlags, next: u16) -> Self {
            Self {
                address: address.into(),
                length: length.into(),
                flags_raw: u16::from(flags).into(),
                next: next.into(),
            }
        }

        pub fn flags(&self) -> DescriptorFlags {
            self.flags_raw.get().into()
        }
    }

    #[bitfield(u16)]
    #[derive(PartialEq, Eq)]
    pub struct DescriptorFlags {
        pub next: bool,
        pub write: bool,
        pub indirect: bool,
        #[bits(13)]
        _reserved: u16,
    }

    /*
    struct virtq_avail {
        le16 flags;
        le16 idx;
        le16 ring[ /* Queue Size */ ];
        le16 used_event;
    }
    */
    pub const AVAIL_OFFSET_FLAGS: usize = 0;
    pub const AVAIL_OFFSET_IDX: usize = 2;
    pub const AVAIL_OFFSET_RING: usize = 4;
    pub const AVAIL_ELEMENT_SIZE: usize = size_of::<u16>();

    /*
    struct virtq_used {
        le16 flags;
        le16 idx;
        struct virtq_used_elem ring[ /* Queue Size */];
        le16 avail_event;
    };
    */
    pub const USED_OFFSET_FLAGS: usize = 0;
    pub const USED_OFFSET_IDX: usize = 2;
    pub const USED_OFFSET_RING: usize = 4;
    pub const USED_ELEMENT_SIZE: usize = size_of::<UsedElement>();

    #[repr(C)]
    #[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct UsedElement {
        pub id: u32_le,
        pub len: u32_le,
    }

    #[bitfield(u16)]
    pub struct UsedFlags {
        pub no_notify: bool,
        #[bits(15)]
        _reserved: u16,
    }
}
