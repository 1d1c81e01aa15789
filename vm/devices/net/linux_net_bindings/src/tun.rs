// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! TUN/TAP device bindings.

use nix::ioctl_write_int_bad;
use nix::ioctl_write_ptr_bad;
use nix::request_code_write;
use std::os::raw::c_char;
use std::os::raw::c_int;
use std::os::raw::c_short;
use std::os::raw::c_uint;

pub const IFNAMSIZ: usize = 16;

// ifr_flags
pub const IFF_TAP: c_short = 0x0002;
pub const IFF_NO_PI: c_short = 0x1000;
pub const IFF_ONE_QUEUE: c_short = 0x2000;
pub const IFF_VNET_HDR: c_short = 0x4000;

// TUNSETOFFLOAD flags
pub const TUN_F_CSUM: c_uint = 0x01;
pub const TUN_F_TSO4: c_uint = 0x02;
pub const TUN_F_TSO6: c_uint = 0x04;
pub const TUN_F_TSO_ECN: c_uint = 0x08;
pub const TUN_F_UFO: c_uint = 0x10;

/// `struct ifreq`, restricted to the flags member of the request union.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct ifreq {
    pub ifr_name: [c_char; IFNAMSIZ],
    pub ifr_flags: c_short,
    pub _pad: [u8; 22],
}

impl Default for ifreq {
    fn default() -> Self {
        Self {
            ifr_name: [0; IFNAMSIZ],
            ifr_flags: 0,
            _pad: [0; 22],
        }
    }
}

const _: () = assert!(size_of::<ifreq>() == 40);

// #define TUNSETIFF     _IOW('T', 202, int)
ioctl_write_ptr_bad!(
    tun_set_iff,
    request_code_write!(b'T', 202, size_of::<c_int>()),
    ifreq
);

// #define TUNSETOFFLOAD  _IOW('T', 208, unsigned int)
//
// The offload flags are passed by value.
ioctl_write_int_bad!(
    tun_set_offload,
    request_code_write!(b'T', 208, size_of::<c_uint>())
);

// #define TUNSETVNETHDRSZ _IOW('T', 216, int)
ioctl_write_ptr_bad!(
    tun_set_vnet_hdr_sz,
    request_code_write!(b'T', 216, size_of::<c_int>()),
    c_int
);
