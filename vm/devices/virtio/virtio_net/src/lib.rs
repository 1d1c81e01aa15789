// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A guest-side virtio-net driver.
//!
//! The device runs one transmit and one receive ring against either the
//! in-kernel vhost-net backend or a virtio device assigned by the
//! hypervisor. Use [`DeviceBuilder`] to negotiate features and bring the
//! device up, then drive it with [`VirtioNetDevice::poll`].

#![expect(missing_docs)]

pub mod backend;
pub mod features;
pub mod mac_address;
pub mod options;
pub mod packet;
pub mod queue_pair;
pub mod rx;
pub mod spec;
pub mod tx;


pub use queue_pair::QueueError;
pub use queue_pair::Stats;
pub use queue_pair::RX_QUEUE;
pub use queue_pair::TX_QUEUE;
pub use rx::RxError;
pub use rx::RxStats;
pub use rx::RX_BUFFER_SIZE;
pub use tx::build_header;
pub use tx::TxStats;

use backend::assigned::AssignedDevice;
use backend::assigned::AssignedError;
use backend::tap::LinuxTap;
use backend::tap::TapOpen;
use backend::vhost::VhostControl;
use backend::vhost::VhostError;
use backend::vhost::VhostNet;
use backend::BackendHandle;
use backend::BackendParts;
use backend::HostSignal;
use features::HwFeatures;
use mac_address::MacAddress;
use options::OptionsError;
use options::VirtioNetOptions;
use packet::Packet;
use queue_pair::QueuePair;
use spec::NetworkFeatures;
use std::collections::VecDeque;
use std::sync::Arc;
use std::task::Context;
use thiserror::Error;
use user_driver::heap::HeapDmaClient;
use user_driver::DmaClient;
use virtio::RingConfig;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("invalid options")]
    Options(#[source] OptionsError),
    #[error("vhost-net bring-up failed")]
    Vhost(#[source] VhostError),
    #[error("assigned device bring-up failed")]
    Assigned(#[source] AssignedError),
    #[error("queue error")]
    Queue(#[source] QueueError),
    #[error("device is faulted")]
    Faulted,
}

type ReceiveHandler = Box<dyn FnMut(Packet) + Send>;

/// Negotiates with a backend and brings up a [`VirtioNetDevice`].
pub struct DeviceBuilder {
    options: VirtioNetOptions,
    assigned: Option<Arc<dyn AssignedDevice>>,
    receive: Option<ReceiveHandler>,
}

impl DeviceBuilder {
    pub fn new(options: VirtioNetOptions) -> Self {
        Self {
            options,
            assigned: None,
            receive: None,
        }
    }

    /// Sets the hypervisor-assigned device found at startup, if any.
    pub fn assigned_device(mut self, device: Option<Arc<dyn AssignedDevice>>) -> Self {
        self.assigned = device;
        self
    }

    /// Sets the handler that received packets are delivered to.
    pub fn on_receive(mut self, handler: impl FnMut(Packet) + Send + 'static) -> Self {
        self.receive = Some(Box::new(handler));
        self
    }

    /// Brings the device up on the assigned device if there is one, and on
    /// vhost-net otherwise.
    pub fn build(mut self) -> Result<VirtioNetDevice, DeviceError> {
        match self.assigned.take() {
            Some(device) => self.build_assigned(device),
            None => self.build_vhost(),
        }
    }

    /// Brings the device up on `/dev/vhost-net` and the configured tap
    /// interface.
    pub fn build_vhost(self) -> Result<VirtioNetDevice, DeviceError> {
        self.options.validate().map_err(DeviceError::Options)?;
        let control = VhostNet::open().map_err(DeviceError::Vhost)?;
        self.build_vhost_with(
            Box::new(control),
            &mut LinuxTap,
            Arc::new(HeapDmaClient::new()),
        )
    }

    /// Brings the device up on vhost with the given control interface, tap
    /// opener and ring memory allocator.
    ///
    /// `dma` must hand out memory whose device addresses are addresses in
    /// this process.
    pub fn build_vhost_with(
        self,
        control: Box<dyn VhostControl>,
        tap: &mut dyn TapOpen,
        dma: Arc<dyn DmaClient>,
    ) -> Result<VirtioNetDevice, DeviceError> {
        self.options.validate().map_err(DeviceError::Options)?;
        let parts = backend::vhost::bring_up(control, tap, &self.options, dma.clone())
            .map_err(DeviceError::Vhost)?;
        Ok(self.finish(parts, dma))
    }

    pub fn build_assigned(
        self,
        device: Arc<dyn AssignedDevice>,
    ) -> Result<VirtioNetDevice, DeviceError> {
        self.options.validate().map_err(DeviceError::Options)?;
        let dma = device.dma_client();
        let parts =
            backend::assigned::bring_up(device, &self.options).map_err(DeviceError::Assigned)?;
        Ok(self.finish(parts, dma))
    }

    fn finish(self, parts: BackendParts, dma: Arc<dyn DmaClient>) -> VirtioNetDevice {
        let BackendParts {
            queues,
            negotiated,
            mac,
            signals,
            handle,
        } = parts;
        VirtioNetDevice {
            queues,
            features: negotiated.features,
            hw: negotiated.hw,
            mac,
            signals,
            backend: handle,
            receive: self.receive.unwrap_or_else(|| Box::new(|_: Packet| {})),
            delivered: Vec::new(),
            faulted: false,
            dma,
        }
    }
}

/// A running virtio-net device with a single queue pair.
pub struct VirtioNetDevice {
    queues: QueuePair,
    features: NetworkFeatures,
    hw: HwFeatures,
    mac: MacAddress,
    signals: [HostSignal; 2],
    backend: BackendHandle,
    receive: ReceiveHandler,
    delivered: Vec<Packet>,
    faulted: bool,
    dma: Arc<dyn DmaClient>,
}

impl VirtioNetDevice {
    /// The negotiated feature bits.
    pub fn features(&self) -> NetworkFeatures {
        self.features
    }

    pub fn hw_features(&self) -> &HwFeatures {
        &self.hw
    }

    pub fn mac_address(&self) -> MacAddress {
        self.mac
    }

    /// The allocator for packet memory the host can reach.
    pub fn dma_client(&self) -> &Arc<dyn DmaClient> {
        &self.dma
    }

    /// The assigned device, when running on one.
    pub fn assigned_device(&self) -> Option<&Arc<dyn AssignedDevice>> {
        match &self.backend {
            BackendHandle::Vhost { .. } => None,
            BackendHandle::Assigned(device) => Some(device),
        }
    }

    /// The ring configurations, indexed by queue number.
    pub fn ring_configs(&self) -> [RingConfig; 2] {
        self.queues.ring_configs()
    }

    /// How the host signals completions on `queue`.
    pub fn host_signal(&self, queue: u16) -> &HostSignal {
        &self.signals[usize::from(queue)]
    }

    pub fn stats(&self) -> Stats {
        self.queues.stats()
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted
    }

    /// Posts as many packets from the front of `packets` as the transmit ring
    /// has room for, returning how many were taken.
    pub fn send(&mut self, packets: &mut VecDeque<Packet>) -> Result<usize, DeviceError> {
        if self.faulted {
            return Err(DeviceError::Faulted);
        }
        Ok(self.queues.send(packets))
    }

    /// Starts filling the receive ring. Received packets go to the handler
    /// set with [`DeviceBuilder::on_receive`].
    pub fn start_receive(&mut self) {
        tracing::debug!("starting receive");
        self.queues.start_receive();
    }

    /// Processes host signals, transmit completions, received packets and
    /// receive refill. Returns whether any work was done.
    ///
    /// A ring protocol violation by the host faults the device; every later
    /// call fails.
    pub fn poll(&mut self, cx: &mut Context<'_>) -> Result<bool, DeviceError> {
        if self.faulted {
            return Err(DeviceError::Faulted);
        }
        // Consume signals before looking at the rings so that none are lost.
        let mut progress = false;
        for signal in &mut self.signals {
            progress |= signal.poll_signal(cx).is_ready();
        }
        let result = self.queues.poll(cx, &mut self.delivered);
        for packet in self.delivered.drain(..) {
            (self.receive)(packet);
        }
        match result {
            Ok(work) => Ok(progress || work),
            Err(err @ QueueError::Refill(_)) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "receive refill failed"
                );
                Err(DeviceError::Queue(err))
            }
            Err(err) => {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "host violated the ring protocol, faulting device"
                );
                self.faulted = true;
                Err(DeviceError::Queue(err))
            }
        }
    }
}
