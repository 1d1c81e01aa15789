// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! vhost and vhost-net bindings.

use nix::ioctl_none;
use nix::ioctl_read;
use nix::ioctl_write_ptr;
use nix::ioctl_write_ptr_bad;
use nix::request_code_write;
use std::os::raw::c_int;

const VHOST_VIRTIO: u8 = 0xaf;

#[repr(C)]
#[derive(Debug, Copy, Clone, Default)]
pub struct vhost_vring_state {
    pub index: u32,
    pub num: u32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Default)]
pub struct vhost_vring_file {
    pub index: u32,
    /// Pass -1 to unbind from file.
    pub fd: c_int,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Default)]
pub struct vhost_vring_addr {
    pub index: u32,
    /// Option flags.
    pub flags: u32,
    pub desc_user_addr: u64,
    pub used_user_addr: u64,
    pub avail_user_addr: u64,
    pub log_guest_addr: u64,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Default)]
pub struct vhost_memory_region {
    pub guest_phys_addr: u64,
    pub memory_size: u64,
    pub userspace_addr: u64,
    /// No flags are currently specified.
    pub flags_padding: u64,
}

/// The header of `struct vhost_memory`, which is followed by `nregions`
/// regions.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default)]
pub struct vhost_memory {
    pub nregions: u32,
    pub padding: u32,
}

/// A `struct vhost_memory` with exactly one region.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default)]
pub struct vhost_memory_single {
    pub header: vhost_memory,
    pub regions: [vhost_memory_region; 1],
}

const _: () = assert!(size_of::<vhost_vring_addr>() == 40);
const _: () = assert!(size_of::<vhost_memory_single>() == 40);

// #define VHOST_GET_FEATURES _IOR(VHOST_VIRTIO, 0x00, __u64)
ioctl_read!(vhost_get_features, VHOST_VIRTIO, 0x00, u64);
// #define VHOST_SET_FEATURES _IOW(VHOST_VIRTIO, 0x00, __u64)
ioctl_write_ptr!(vhost_set_features, VHOST_VIRTIO, 0x00, u64);
// #define VHOST_SET_OWNER _IO(VHOST_VIRTIO, 0x01)
ioctl_none!(vhost_set_owner, VHOST_VIRTIO, 0x01);

// #define VHOST_SET_MEM_TABLE _IOW(VHOST_VIRTIO, 0x03, struct vhost_memory)
//
// The request size only covers the header; the regions trail it.
ioctl_write_ptr_bad!(
    vhost_set_mem_table,
    request_code_write!(VHOST_VIRTIO, 0x03, size_of::<vhost_memory>()),
    vhost_memory_single
);

// #define VHOST_SET_VRING_NUM _IOW(VHOST_VIRTIO, 0x10, struct vhost_vring_state)
ioctl_write_ptr!(vhost_set_vring_num, VHOST_VIRTIO, 0x10, vhost_vring_state);
// #define VHOST_SET_VRING_ADDR _IOW(VHOST_VIRTIO, 0x11, struct vhost_vring_addr)
ioctl_write_ptr!(vhost_set_vring_addr, VHOST_VIRTIO, 0x11, vhost_vring_addr);
// #define VHOST_SET_VRING_BASE _IOW(VHOST_VIRTIO, 0x12, struct vhost_vring_state)
ioctl_write_ptr!(vhost_set_vring_base, VHOST_VIRTIO, 0x12, vhost_vring_state);

// #define VHOST_SET_VRING_KICK _IOW(VHOST_VIRTIO, 0x20, struct vhost_vring_file)
ioctl_write_ptr!(vhost_set_vring_kick, VHOST_VIRTIO, 0x20, vhost_vring_file);
// #define VHOST_SET_VRING_CALL _IOW(VHOST_VIRTIO, 0x21, struct vhost_vring_file)
ioctl_write_ptr!(vhost_set_vring_call, VHOST_VIRTIO, 0x21, vhost_vring_file);

// #define VHOST_NET_SET_BACKEND _IOW(VHOST_VIRTIO, 0x30, struct vhost_vring_file)
ioctl_write_ptr!(vhost_net_set_backend, VHOST_VIRTIO, 0x30, vhost_vring_file);
