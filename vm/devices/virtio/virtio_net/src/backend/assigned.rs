// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Setup of a virtio-net device assigned by the hypervisor.

use super::BackendHandle;
use super::BackendParts;
use super::HostSignal;
use crate::features::driver_features;
use crate::features::Negotiated;
use crate::mac_address::MacAddress;
use crate::options::VirtioNetOptions;
use crate::queue_pair::QueuePair;
use crate::queue_pair::RX_QUEUE;
use crate::queue_pair::TX_QUEUE;
use crate::spec::NetConfig;
use crate::spec::NetStatus;
use crate::spec::NetworkFeatures;
use std::sync::Arc;
use thiserror::Error;
use user_driver::interrupt::DeviceInterruptSource;
use user_driver::DmaClient;
use virtio::Notifier;
use virtio::QueueNotify;
use virtio::RingError;
use virtio::MAX_RING_SIZE;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

/// The transport operations of an assigned virtio device.
pub trait AssignedDevice: Send + Sync {
    /// Acknowledges the device and accepts `driver_features & device
    /// features`, returning the accepted set.
    fn init_features(&self, driver_features: u64) -> u64;
    /// The number of descriptors the device requires for queue `queue`.
    fn queue_size(&self, queue: u16) -> u16;
    /// Reads device configuration space at `offset`.
    fn read_config(&self, offset: usize, data: &mut [u8]);
    /// Tells the device where queue `queue`'s descriptor table lives. The
    /// other parts of the ring follow at their fixed offsets.
    fn set_queue_address(&self, queue: u16, descriptors: u64);
    /// Registers `handler` to be called from the device's interrupt for
    /// queue `queue`.
    fn enable_interrupt(&self, queue: u16, handler: Box<dyn Fn() + Send + Sync>);
    fn set_driver_ok(&self);
    /// Notifies the device of new available buffers on queue `queue`.
    fn kick(&self, queue: u16);
    /// The allocator for memory the device can reach.
    fn dma_client(&self) -> Arc<dyn DmaClient>;
}

#[derive(Debug, Error)]
pub enum AssignedError {
    #[error("device does not report a mac address")]
    MacNotSupported,
    #[error("device queue {queue} has invalid size {size}")]
    InvalidQueueSize { queue: u16, size: u16 },
    #[error("failed to create rings")]
    Ring(#[source] RingError),
}

struct DeviceKick(Arc<dyn AssignedDevice>);

impl QueueNotify for DeviceKick {
    fn notify_queue(&self, queue: u16) {
        self.0.kick(queue);
    }
}

fn notifier(kick: &Arc<dyn QueueNotify>, queue: u16, wake: &DeviceInterruptSource) -> Notifier {
    Notifier::Device {
        device: kick.clone(),
        queue,
        wake: wake.clone(),
    }
}

/// The handler for queue `queue`'s interrupt, waking the ring's waiter.
fn interrupt_handler(notifier: Notifier, queue: u16) -> Box<dyn Fn() + Send + Sync> {
    Box::new(move || {
        if let Err(err) = notifier.wake_wait() {
            tracing::error!(
                queue,
                error = &err as &dyn std::error::Error,
                "failed to wake queue"
            );
        }
    })
}

fn queue_size(device: &dyn AssignedDevice, queue: u16) -> Result<u16, AssignedError> {
    let size = device.queue_size(queue);
    if !size.is_power_of_two() || size < 2 || size > MAX_RING_SIZE {
        return Err(AssignedError::InvalidQueueSize { queue, size });
    }
    Ok(size)
}

/// Brings up an assigned device: feature acknowledgement, configuration
/// read, ring creation and registration, then driver-ok.
pub(crate) fn bring_up(
    device: Arc<dyn AssignedDevice>,
    options: &VirtioNetOptions,
) -> Result<BackendParts, AssignedError> {
    let accepted =
        NetworkFeatures::from(device.init_features(driver_features(options).into()));
    if !accepted.mac() {
        return Err(AssignedError::MacNotSupported);
    }
    let negotiated = Negotiated::new(options, accepted);

    let mut config = NetConfig::new_zeroed();
    device.read_config(0, config.as_mut_bytes());
    let mac = MacAddress::new(config.mac);
    let status = NetStatus::from(config.status.get());

    let rx_size = queue_size(device.as_ref(), RX_QUEUE)?;
    let tx_size = queue_size(device.as_ref(), TX_QUEUE)?;

    let kick: Arc<dyn QueueNotify> = Arc::new(DeviceKick(device.clone()));
    let (rx_wake, rx_interrupt) = DeviceInterruptSource::new();
    let (tx_wake, tx_interrupt) = DeviceInterruptSource::new();
    let notifiers = [
        notifier(&kick, RX_QUEUE, &rx_wake),
        notifier(&kick, TX_QUEUE, &tx_wake),
    ];
    let queues = QueuePair::new(
        device.dma_client(),
        rx_size,
        tx_size,
        &negotiated,
        notifiers,
    )
    .map_err(AssignedError::Ring)?;

    let [rx_config, tx_config] = queues.ring_configs();
    device.set_queue_address(RX_QUEUE, rx_config.addresses.descriptors);
    device.set_queue_address(TX_QUEUE, tx_config.addresses.descriptors);
    device.enable_interrupt(
        RX_QUEUE,
        interrupt_handler(notifier(&kick, RX_QUEUE, &rx_wake), RX_QUEUE),
    );
    device.enable_interrupt(
        TX_QUEUE,
        interrupt_handler(notifier(&kick, TX_QUEUE, &tx_wake), TX_QUEUE),
    );
    device.set_driver_ok();

    tracing::info!(
        %mac,
        link_up = status.link_up(),
        rx_size,
        tx_size,
        "assigned virtio-net device ready"
    );
    Ok(BackendParts {
        queues,
        negotiated,
        mac,
        signals: [
            HostSignal::Interrupt(rx_interrupt),
            HostSignal::Interrupt(tx_interrupt),
        ],
        handle: BackendHandle::Assigned(device),
    })
}
