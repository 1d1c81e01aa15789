// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A transmit and receive ring serving one network interface.

use crate::features::Negotiated;
use crate::packet::Packet;
use crate::rx::RxError;
use crate::rx::RxQueue;
use crate::rx::RxStats;
use crate::tx::TxQueue;
use crate::tx::TxStats;
use std::collections::VecDeque;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use thiserror::Error;
use user_driver::DmaClient;
use virtio::Notifier;
use virtio::RingConfig;
use virtio::RingError;

/// Queue indices as the backends number them.
pub const RX_QUEUE: u16 = 0;
pub const TX_QUEUE: u16 = 1;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("transmit ring fault")]
    Tx(#[source] RingError),
    #[error("receive ring fault")]
    Rx(#[source] RingError),
    #[error("receive refill failed")]
    Refill(#[source] RxError),
}

#[derive(Debug, Copy, Clone, Default)]
pub struct Stats {
    pub tx: TxStats,
    pub rx: RxStats,
}

pub struct QueuePair {
    rx: RxQueue,
    tx: TxQueue,
    receiving: bool,
}

impl QueuePair {
    /// Creates both rings. `notifiers` is indexed by queue number.
    pub fn new(
        dma: Arc<dyn DmaClient>,
        rx_size: u16,
        tx_size: u16,
        negotiated: &Negotiated,
        notifiers: [Notifier; 2],
    ) -> Result<Self, RingError> {
        let [rx_notifier, tx_notifier] = notifiers;
        let header_len = negotiated.header_len();
        let tx = TxQueue::new(
            dma.as_ref(),
            tx_size,
            negotiated.ring_features(false),
            tx_notifier,
            negotiated.hw,
            header_len,
        )?;
        let rx = RxQueue::new(
            dma,
            rx_size,
            negotiated.ring_features(negotiated.features.mrg_rxbuf()),
            rx_notifier,
            header_len,
            negotiated.hw.rx_csum_offload,
        )?;
        Ok(Self {
            rx,
            tx,
            receiving: false,
        })
    }

    /// The ring configurations, indexed by queue number.
    pub fn ring_configs(&self) -> [RingConfig; 2] {
        [*self.rx.ring_config(), *self.tx.ring_config()]
    }

    pub fn rx(&self) -> &RxQueue {
        &self.rx
    }

    pub fn tx(&self) -> &TxQueue {
        &self.tx
    }

    pub fn stats(&self) -> Stats {
        Stats {
            tx: self.tx.stats(),
            rx: self.rx.stats(),
        }
    }

    /// Posts as many of `packets` as fit. See [`TxQueue::post`].
    pub fn send(&mut self, packets: &mut VecDeque<Packet>) -> usize {
        self.tx.post(packets)
    }

    /// Starts keeping the receive ring filled, from the next poll on.
    pub fn start_receive(&mut self) {
        self.receiving = true;
    }

    /// Processes completions on both rings and refills the receive ring.
    ///
    /// Received packets are appended to `packets`. Returns whether any work
    /// was done.
    pub fn poll(
        &mut self,
        cx: &mut Context<'_>,
        packets: &mut Vec<Packet>,
    ) -> Result<bool, QueueError> {
        let mut progress = self.tx.poll_completions().map_err(QueueError::Tx)? > 0;
        progress |= self.rx.poll_completions(packets).map_err(QueueError::Rx)? > 0;
        if self.receiving {
            if let Poll::Ready(result) = self.rx.poll_refill(cx) {
                result.map_err(QueueError::Refill)?;
                progress = true;
            }
        }
        Ok(progress)
    }
}
