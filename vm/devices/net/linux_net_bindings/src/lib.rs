// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

// C API bindings based on /usr/include/linux/if.h,
// /usr/include/linux/if_tun.h and /usr/include/linux/vhost.h.

#![cfg(target_os = "linux")]
// UNSAFETY: ioctl wrappers generated by nix.
#![expect(unsafe_code)]
#![expect(missing_docs)]
#![allow(non_camel_case_types)]

pub mod tun;
pub mod vhost;
