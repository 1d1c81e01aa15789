// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The TAP interface that vhost-net forwards packets to.

// UNSAFETY: Calling TUN ioctls.
#![expect(unsafe_code)]

use crate::features::HwFeatures;
use linux_net_bindings::tun;
use std::ffi::CString;
use std::io;
use std::os::fd::OwnedFd;
use std::os::raw::c_int;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::prelude::AsRawFd;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TapError {
    #[error("TAP interface name is too long: {0:#}")]
    TapNameTooLong(usize),
    #[error("TAP name conversion to C string failed")]
    TapNameConversion(#[source] std::ffi::NulError),
    #[error("failed to open /dev/net/tun")]
    OpenTunFailed(#[source] io::Error),
    #[error("TUNSETIFF ioctl failed")]
    SetTapAttributes(#[source] io::Error),
    #[error("TUNSETOFFLOAD ioctl failed")]
    SetOffload(#[source] io::Error),
    #[error("TUNSETVNETHDRSZ ioctl failed")]
    SetVnetHeaderSize(#[source] io::Error),
}

/// Opens and configures the TAP interface handed to vhost-net.
pub trait TapOpen {
    /// Attaches to TAP interface `name` with virtio-net headers of
    /// `vnet_hdr_len` bytes and the `TUN_F_*` offloads in `offload`.
    fn open_tap(&mut self, name: &str, offload: u32, vnet_hdr_len: usize)
        -> Result<OwnedFd, TapError>;
}

/// The `TUN_F_*` offloads to enable on the TAP interface for `hw`.
///
/// Checksum offload is only enabled when it is active in both directions.
/// TUNSETOFFLOAD rejects segmentation offloads without it.
pub fn offload_flags(hw: &HwFeatures) -> u32 {
    let mut flags = 0;
    if hw.tx_csum_l4_offload && hw.rx_csum_offload {
        flags |= tun::TUN_F_CSUM;
        if hw.tx_tso {
            flags |= tun::TUN_F_TSO4;
        }
        if hw.tx_ufo {
            flags |= tun::TUN_F_UFO;
        }
    }
    flags
}

/// Opens TAP interfaces through `/dev/net/tun`.
#[derive(Debug, Default)]
pub struct LinuxTap;

impl TapOpen for LinuxTap {
    fn open_tap(
        &mut self,
        name: &str,
        offload: u32,
        vnet_hdr_len: usize,
    ) -> Result<OwnedFd, TapError> {
        let tap_file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open("/dev/net/tun")
            .map_err(TapError::OpenTunFailed)?;

        let mut ifreq = tun::ifreq::default();
        let tap_name_cstr = CString::new(name.as_bytes()).map_err(TapError::TapNameConversion)?;
        let tap_name_bytes = tap_name_cstr.as_bytes_with_nul();
        if tap_name_bytes.len() > ifreq.ifr_name.len() {
            return Err(TapError::TapNameTooLong(tap_name_bytes.len()));
        }
        for (dst, &src) in ifreq.ifr_name.iter_mut().zip(tap_name_bytes) {
            *dst = src as libc::c_char;
        }
        ifreq.ifr_flags = tun::IFF_TAP | tun::IFF_NO_PI | tun::IFF_ONE_QUEUE | tun::IFF_VNET_HDR;

        // SAFETY: the fd is open and ifreq is a valid, initialized request.
        unsafe { tun::tun_set_iff(tap_file.as_raw_fd(), &ifreq) }
            .map_err(|err| TapError::SetTapAttributes(err.into()))?;

        // SAFETY: TUNSETOFFLOAD takes its flags by value.
        unsafe { tun::tun_set_offload(tap_file.as_raw_fd(), offload as c_int) }
            .map_err(|err| TapError::SetOffload(err.into()))?;

        let hdr_len = vnet_hdr_len as c_int;
        // SAFETY: the fd is open and hdr_len outlives the call.
        unsafe { tun::tun_set_vnet_hdr_sz(tap_file.as_raw_fd(), &hdr_len) }
            .map_err(|err| TapError::SetVnetHeaderSize(err.into()))?;

        tracing::info!(name, offload, vnet_hdr_len, "opened tap interface");
        Ok(tap_file.into())
    }
}

#[cfg(test)]
mod tests {
    use super::offload_flags;
    use crate::features::HwFeatures;
    use linux_net_bindings::tun;

    #[test]
    fn offloads() {
        let mut hw = HwFeatures {
            tx_csum_l4_offload: true,
            rx_csum_offload: true,
            rx_lro: true,
            tx_tso: true,
            tx_ufo: false,
            mtu: 1500,
            max_packet_len: 65535 - 14,
        };
        assert_eq!(offload_flags(&hw), tun::TUN_F_CSUM | tun::TUN_F_TSO4);

        hw.tx_ufo = true;
        assert_eq!(
            offload_flags(&hw),
            tun::TUN_F_CSUM | tun::TUN_F_TSO4 | tun::TUN_F_UFO
        );

        hw.tx_tso = false;
        hw.tx_ufo = false;
        assert_eq!(offload_flags(&hw), tun::TUN_F_CSUM);
    }

    #[test]
    fn segmentation_requires_checksum() {
        let hw = HwFeatures {
            tx_csum_l4_offload: true,
            rx_csum_offload: false,
            rx_lro: false,
            tx_tso: true,
            tx_ufo: true,
            mtu: 1500,
            max_packet_len: 65535 - 14,
        };
        assert_eq!(offload_flags(&hw), 0);
    }
}
