// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Feature negotiation.

use crate::options::VirtioNetOptions;
use crate::spec::header_size;
use crate::spec::NetworkFeatures;
use virtio::RingFeatures;

pub const ETHERNET_HEADER_LEN: usize = 14;
pub const DEFAULT_MTU: u16 = 1500;

/// The offloads the stack may rely on, after negotiation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HwFeatures {
    pub tx_csum_l4_offload: bool,
    pub rx_csum_offload: bool,
    pub rx_lro: bool,
    pub tx_tso: bool,
    pub tx_ufo: bool,
    pub mtu: u16,
    /// The largest frame, including the Ethernet header, the stack may hand
    /// to the driver.
    pub max_packet_len: usize,
}

/// The features this driver requests for `options`.
///
/// Segmentation offloads are only requested alongside the checksum offload
/// they depend on.
pub fn driver_features(options: &VirtioNetOptions) -> NetworkFeatures {
    let csum = options.csum_offload;
    NetworkFeatures::new()
        .with_ring_indirect_desc(true)
        .with_mrg_rxbuf(true)
        .with_mac(true)
        .with_ring_event_idx(options.event_index)
        .with_csum(csum)
        .with_guest_csum(csum)
        .with_host_tso4(csum && options.tso)
        .with_guest_tso4(csum && options.lro)
        .with_host_ufo(csum && options.ufo)
        .with_guest_ufo(csum && options.ufo)
}

/// The outcome of negotiating with a backend.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Negotiated {
    /// `driver & backend`.
    pub features: NetworkFeatures,
    pub hw: HwFeatures,
}

impl Negotiated {
    /// Negotiates the driver's features for `options` against the features
    /// the backend offers.
    pub fn new(options: &VirtioNetOptions, offered: NetworkFeatures) -> Self {
        let features =
            NetworkFeatures::from(u64::from(driver_features(options)) & u64::from(offered));
        let tx_csum = options.csum_offload && features.csum();
        let rx_csum = options.csum_offload && features.guest_csum();
        let tx_tso = tx_csum && options.tso && features.host_tso4();
        let tx_ufo = tx_csum && options.ufo && features.host_ufo();
        let mtu = DEFAULT_MTU;
        let max_packet_len = if tx_tso || tx_ufo {
            usize::from(u16::MAX) - ETHERNET_HEADER_LEN
        } else {
            usize::from(mtu) + ETHERNET_HEADER_LEN
        };
        let hw = HwFeatures {
            tx_csum_l4_offload: tx_csum,
            rx_csum_offload: rx_csum,
            rx_lro: rx_csum && options.lro && features.guest_tso4(),
            tx_tso,
            tx_ufo,
            mtu,
            max_packet_len,
        };
        tracing::info!(
            offered = u64::from(offered),
            negotiated = u64::from(features),
            ?hw,
            "negotiated features"
        );
        Self { features, hw }
    }

    /// The length of the header preceding each packet on the rings.
    pub fn header_len(&self) -> usize {
        header_size(self.features.mrg_rxbuf())
    }

    pub fn ring_features(&self, mergeable_buffers: bool) -> RingFeatures {
        RingFeatures {
            event_index: self.features.ring_event_idx(),
            // Advertised, but chains are always posted direct.
            indirect: false,
            mergeable_buffers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::driver_features;
    use super::Negotiated;
    use crate::options::VirtioNetOptions;
    use crate::spec::NetworkFeatures;

    fn all() -> NetworkFeatures {
        NetworkFeatures::from(!0u64)
    }

    #[test]
    fn default_driver_features() {
        let features = driver_features(&VirtioNetOptions::default());
        assert!(features.ring_indirect_desc());
        assert!(features.mrg_rxbuf());
        assert!(features.mac());
        assert!(features.ring_event_idx());
        assert!(features.csum() && features.guest_csum());
        assert!(features.host_tso4() && features.guest_tso4());
        assert!(features.host_ufo() && features.guest_ufo());
        assert!(!features.version_1());
        assert!(!features.ctrl_vq());
    }

    #[test]
    fn options_remove_features() {
        let options: VirtioNetOptions = "event-index=off,tso=off".parse().unwrap();
        let features = driver_features(&options);
        assert!(!features.ring_event_idx());
        assert!(!features.host_tso4());
        assert!(features.guest_tso4());

        let options: VirtioNetOptions = "csum-offload=off".parse().unwrap();
        let features = driver_features(&options);
        assert!(!features.csum() && !features.guest_csum());
        assert!(!features.host_tso4() && !features.guest_tso4() && !features.host_ufo());
    }

    #[test]
    fn negotiated_is_intersection() {
        let options = VirtioNetOptions::default();
        let offered = NetworkFeatures::new()
            .with_csum(true)
            .with_host_tso4(true)
            .with_mac(true)
            .with_ctrl_vq(true)
            .with_ring_event_idx(true);
        let negotiated = Negotiated::new(&options, offered);
        assert_eq!(
            negotiated.features,
            NetworkFeatures::new()
                .with_csum(true)
                .with_host_tso4(true)
                .with_mac(true)
                .with_ring_event_idx(true)
        );
        assert_eq!(negotiated.header_len(), 10);
        assert!(negotiated.ring_features(true).event_index);
        assert!(negotiated.hw.tx_csum_l4_offload);
        assert!(!negotiated.hw.rx_csum_offload);
        assert!(negotiated.hw.tx_tso);
        assert!(!negotiated.hw.tx_ufo);
        assert!(!negotiated.hw.rx_lro);
        assert_eq!(negotiated.hw.max_packet_len, 65535 - 14);
    }

    #[test]
    fn hw_features_need_option_and_bit() {
        let options: VirtioNetOptions = "tso=off,ufo=off".parse().unwrap();
        let negotiated = Negotiated::new(&options, all());
        assert_eq!(negotiated.header_len(), 12);
        assert!(negotiated.hw.tx_csum_l4_offload && negotiated.hw.rx_csum_offload);
        assert!(negotiated.hw.rx_lro);
        assert!(!negotiated.hw.tx_tso && !negotiated.hw.tx_ufo);
        assert_eq!(negotiated.hw.mtu, 1500);
        assert_eq!(negotiated.hw.max_packet_len, 1514);

        let negotiated = Negotiated::new(&VirtioNetOptions::default(), NetworkFeatures::new());
        assert_eq!(u64::from(negotiated.features), 0);
        assert!(!negotiated.hw.tx_csum_l4_offload);
        assert!(!negotiated.ring_features(false).event_index);
    }
}
