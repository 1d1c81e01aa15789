// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Setup of the in-kernel vhost-net backend.
//!
//! vhost-net services the rings directly from this process's address space,
//! so ring and buffer addresses are process virtual addresses and the memory
//! table maps guest physical addresses to them one to one.

// UNSAFETY: Calling vhost ioctls.
#![expect(unsafe_code)]

use super::tap::offload_flags;
use super::tap::TapError;
use super::tap::TapOpen;
use super::BackendParts;
use super::HostSignal;
use crate::features::driver_features;
use crate::features::Negotiated;
use crate::mac_address::MacAddress;
use crate::options::VirtioNetOptions;
use crate::queue_pair::QueuePair;
use crate::spec::NetworkFeatures;
use linux_net_bindings::vhost;
use pal_event::Event;
use std::fs::File;
use std::io;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::sync::Arc;
use thiserror::Error;
use user_driver::DmaClient;
use virtio::Notifier;
use virtio::RingAddresses;
use virtio::RingConfig;
use virtio::RingError;

const VHOST_NET_PATH: &str = "/dev/vhost-net";

/// The extent of the identity-mapped region: the user half of the address
/// space, less the final page.
pub const MEMORY_REGION_SIZE: u64 = (1 << 47) - 4096;

#[derive(Debug, Error)]
pub enum VhostError {
    #[error("failed to open /dev/vhost-net")]
    Open(#[source] io::Error),
    #[error("{op} failed")]
    Ioctl {
        op: &'static str,
        #[source]
        err: io::Error,
    },
    #[error("failed to create queue event")]
    Event(#[source] io::Error),
    #[error("failed to set up tap interface")]
    Tap(#[source] TapError),
    #[error("failed to create rings")]
    Ring(#[source] RingError),
}

/// A region of the vhost memory table.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    pub guest_phys_addr: u64,
    pub memory_size: u64,
    pub userspace_addr: u64,
}

impl MemoryRegion {
    /// Maps guest physical addresses onto the same user addresses.
    pub const IDENTITY: Self = Self {
        guest_phys_addr: 0,
        memory_size: MEMORY_REGION_SIZE,
        userspace_addr: 0,
    };
}

/// The vhost control operations the driver issues, in the order
/// [`attach_queues`] issues them.
pub trait VhostControl: Send {
    fn get_features(&mut self) -> io::Result<u64>;
    fn set_features(&mut self, features: u64) -> io::Result<()>;
    fn set_owner(&mut self) -> io::Result<()>;
    fn set_mem_table(&mut self, region: &MemoryRegion) -> io::Result<()>;
    fn set_vring_num(&mut self, index: u32, num: u16) -> io::Result<()>;
    fn set_vring_base(&mut self, index: u32, base: u16) -> io::Result<()>;
    fn set_vring_addr(&mut self, index: u32, addresses: &RingAddresses) -> io::Result<()>;
    fn set_vring_kick(&mut self, index: u32, fd: BorrowedFd<'_>) -> io::Result<()>;
    fn set_vring_call(&mut self, index: u32, fd: BorrowedFd<'_>) -> io::Result<()>;
    fn set_backend(&mut self, index: u32, fd: BorrowedFd<'_>) -> io::Result<()>;
}

/// An open `/dev/vhost-net` instance.
#[derive(Debug)]
pub struct VhostNet {
    file: File,
}

impl VhostNet {
    pub fn open() -> Result<Self, VhostError> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(VHOST_NET_PATH)
            .map_err(VhostError::Open)?;
        Ok(Self { file })
    }
}

fn vring_file(index: u32, fd: BorrowedFd<'_>) -> vhost::vhost_vring_file {
    vhost::vhost_vring_file {
        index,
        fd: fd.as_raw_fd(),
    }
}

impl VhostControl for VhostNet {
    fn get_features(&mut self) -> io::Result<u64> {
        let mut features = 0u64;
        // SAFETY: the fd is an open vhost device and features is a live u64.
        unsafe { vhost::vhost_get_features(self.file.as_raw_fd(), &mut features) }?;
        Ok(features)
    }

    fn set_features(&mut self, features: u64) -> io::Result<()> {
        // SAFETY: the fd is an open vhost device and features is a live u64.
        unsafe { vhost::vhost_set_features(self.file.as_raw_fd(), &features) }?;
        Ok(())
    }

    fn set_owner(&mut self) -> io::Result<()> {
        // SAFETY: the fd is an open vhost device.
        unsafe { vhost::vhost_set_owner(self.file.as_raw_fd()) }?;
        Ok(())
    }

    fn set_mem_table(&mut self, region: &MemoryRegion) -> io::Result<()> {
        let table = vhost::vhost_memory_single {
            header: vhost::vhost_memory {
                nregions: 1,
                padding: 0,
            },
            regions: [vhost::vhost_memory_region {
                guest_phys_addr: region.guest_phys_addr,
                memory_size: region.memory_size,
                userspace_addr: region.userspace_addr,
                flags_padding: 0,
            }],
        };
        // SAFETY: the table holds exactly the one region its header reports.
        unsafe { vhost::vhost_set_mem_table(self.file.as_raw_fd(), &table) }?;
        Ok(())
    }

    fn set_vring_num(&mut self, index: u32, num: u16) -> io::Result<()> {
        let state = vhost::vhost_vring_state {
            index,
            num: num.into(),
        };
        // SAFETY: the fd is an open vhost device and state is a valid request.
        unsafe { vhost::vhost_set_vring_num(self.file.as_raw_fd(), &state) }?;
        Ok(())
    }

    fn set_vring_base(&mut self, index: u32, base: u16) -> io::Result<()> {
        let state = vhost::vhost_vring_state {
            index,
            num: base.into(),
        };
        // SAFETY: the fd is an open vhost device and state is a valid request.
        unsafe { vhost::vhost_set_vring_base(self.file.as_raw_fd(), &state) }?;
        Ok(())
    }

    fn set_vring_addr(&mut self, index: u32, addresses: &RingAddresses) -> io::Result<()> {
        let addr = vhost::vhost_vring_addr {
            index,
            flags: 0,
            desc_user_addr: addresses.descriptors,
            used_user_addr: addresses.used,
            avail_user_addr: addresses.avail,
            log_guest_addr: 0,
        };
        // SAFETY: the addresses refer to ring memory that outlives the
        // vhost instance.
        unsafe { vhost::vhost_set_vring_addr(self.file.as_raw_fd(), &addr) }?;
        Ok(())
    }

    fn set_vring_kick(&mut self, index: u32, fd: BorrowedFd<'_>) -> io::Result<()> {
        let file = vring_file(index, fd);
        // SAFETY: the request is valid and fd stays open for the call.
        unsafe { vhost::vhost_set_vring_kick(self.file.as_raw_fd(), &file) }?;
        Ok(())
    }

    fn set_vring_call(&mut self, index: u32, fd: BorrowedFd<'_>) -> io::Result<()> {
        let file = vring_file(index, fd);
        // SAFETY: the request is valid and fd stays open for the call.
        unsafe { vhost::vhost_set_vring_call(self.file.as_raw_fd(), &file) }?;
        Ok(())
    }

    fn set_backend(&mut self, index: u32, fd: BorrowedFd<'_>) -> io::Result<()> {
        let file = vring_file(index, fd);
        // SAFETY: the request is valid and fd stays open for the call.
        unsafe { vhost::vhost_net_set_backend(self.file.as_raw_fd(), &file) }?;
        Ok(())
    }
}

fn ioctl<T>(op: &'static str, result: io::Result<T>) -> Result<T, VhostError> {
    result.map_err(|err| VhostError::Ioctl { op, err })
}

/// Negotiates features with vhost, returning what was acknowledged.
pub fn negotiate_features(
    control: &mut dyn VhostControl,
    options: &VirtioNetOptions,
) -> Result<Negotiated, VhostError> {
    let offered = NetworkFeatures::from(ioctl("VHOST_GET_FEATURES", control.get_features())?);
    let negotiated = Negotiated::new(options, offered);
    ioctl(
        "VHOST_SET_FEATURES",
        control.set_features(negotiated.features.into()),
    )?;
    Ok(negotiated)
}

/// Hands the rings, their events and the tap interface to vhost.
///
/// `rings`, `kicks` and `calls` are indexed by queue number.
pub fn attach_queues(
    control: &mut dyn VhostControl,
    rings: &[RingConfig; 2],
    kicks: &[Event; 2],
    calls: &[Event; 2],
    tap: BorrowedFd<'_>,
) -> Result<(), VhostError> {
    ioctl("VHOST_SET_OWNER", control.set_owner())?;
    ioctl(
        "VHOST_SET_MEM_TABLE",
        control.set_mem_table(&MemoryRegion::IDENTITY),
    )?;
    for (index, ring) in (0..).zip(rings) {
        ioctl("VHOST_SET_VRING_NUM", control.set_vring_num(index, ring.size))?;
        ioctl("VHOST_SET_VRING_BASE", control.set_vring_base(index, 0))?;
    }
    for (index, ring) in (0..).zip(rings) {
        ioctl(
            "VHOST_SET_VRING_ADDR",
            control.set_vring_addr(index, &ring.addresses),
        )?;
    }
    for (index, (kick, call)) in (0..).zip(kicks.iter().zip(calls)) {
        ioctl("VHOST_SET_VRING_KICK", control.set_vring_kick(index, kick.as_fd()))?;
        ioctl("VHOST_SET_VRING_CALL", control.set_vring_call(index, call.as_fd()))?;
    }
    for index in 0..2 {
        ioctl("VHOST_NET_SET_BACKEND", control.set_backend(index, tap))?;
    }
    Ok(())
}

/// Brings up the device on vhost-net: negotiation, tap setup, ring creation,
/// then ring hand-off.
pub(crate) fn bring_up(
    mut control: Box<dyn VhostControl>,
    tap: &mut dyn TapOpen,
    options: &VirtioNetOptions,
    dma: Arc<dyn DmaClient>,
) -> Result<BackendParts, VhostError> {
    let negotiated = negotiate_features(control.as_mut(), options)?;
    tracing::debug!(
        driver = u64::from(driver_features(options)),
        negotiated = u64::from(negotiated.features),
        "vhost features"
    );

    let tap_fd = tap
        .open_tap(
            &options.tap_device,
            offload_flags(&negotiated.hw),
            negotiated.header_len(),
        )
        .map_err(VhostError::Tap)?;

    let kicks = [
        Event::new().map_err(VhostError::Event)?,
        Event::new().map_err(VhostError::Event)?,
    ];
    let calls = [
        Event::new().map_err(VhostError::Event)?,
        Event::new().map_err(VhostError::Event)?,
    ];
    let notifiers = [
        Notifier::Event(kicks[0].try_clone().map_err(VhostError::Event)?),
        Notifier::Event(kicks[1].try_clone().map_err(VhostError::Event)?),
    ];
    let queues = QueuePair::new(
        dma,
        options.ring_size,
        options.ring_size,
        &negotiated,
        notifiers,
    )
    .map_err(VhostError::Ring)?;

    attach_queues(
        control.as_mut(),
        &queues.ring_configs(),
        &kicks,
        &calls,
        tap_fd.as_fd(),
    )?;

    let [rx_call, tx_call] = calls;
    let mac = options.mac.unwrap_or(MacAddress::VHOST_DEFAULT);
    tracing::info!(%mac, tap = %options.tap_device, "vhost-net device ready");
    Ok(BackendParts {
        queues,
        negotiated,
        mac,
        signals: [HostSignal::Event(rx_call), HostSignal::Event(tx_call)],
        handle: super::BackendHandle::Vhost {
            control,
            tap: tap_fd,
        },
    })
}
