// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Driver configuration.

use crate::mac_address::InvalidMacAddress;
use crate::mac_address::MacAddress;
use std::str::FromStr;
use thiserror::Error;
use virtio::MAX_RING_SIZE;

pub const DEFAULT_RING_SIZE: u16 = 256;
pub const DEFAULT_TAP_DEVICE: &str = "tap0";

/// User-selectable driver options.
///
/// Parses from a comma-separated `key=value` list, for example
/// `event-index=off,tso=off,ring-size=512`. Offload switches take `on` or
/// `off`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtioNetOptions {
    /// Negotiate the event-index kick/interrupt suppression.
    pub event_index: bool,
    /// Transmit and receive checksum offload.
    pub csum_offload: bool,
    /// TCP segmentation offload on transmit.
    pub tso: bool,
    /// UDP fragmentation offload.
    pub ufo: bool,
    /// Large receive offload.
    pub lro: bool,
    /// Descriptors per ring.
    pub ring_size: u16,
    /// The tap interface vhost attaches to.
    pub tap_device: String,
    /// Overrides the vhost MAC address.
    pub mac: Option<MacAddress>,
}

impl Default for VirtioNetOptions {
    fn default() -> Self {
        Self {
            event_index: true,
            csum_offload: true,
            tso: true,
            ufo: true,
            lro: true,
            ring_size: DEFAULT_RING_SIZE,
            tap_device: DEFAULT_TAP_DEVICE.to_owned(),
            mac: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum OptionsError {
    #[error("unknown option '{0}'")]
    UnknownOption(String),
    #[error("option '{0}' requires a value")]
    MissingValue(String),
    #[error("invalid value '{value}' for '{key}', expected 'on' or 'off'")]
    InvalidSwitch { key: String, value: String },
    #[error("invalid ring size '{0}'")]
    InvalidRingSize(String),
    #[error("ring size {0} must be a power of two between 2 and 32768")]
    RingSizeOutOfRange(u16),
    #[error("invalid mac address '{0}'")]
    InvalidMac(String, #[source] InvalidMacAddress),
}

fn parse_switch(key: &str, value: &str) -> Result<bool, OptionsError> {
    match value {
        "on" => Ok(true),
        "off" => Ok(false),
        _ => Err(OptionsError::InvalidSwitch {
            key: key.to_owned(),
            value: value.to_owned(),
        }),
    }
}

impl VirtioNetOptions {
    pub fn validate(&self) -> Result<(), OptionsError> {
        let size = self.ring_size;
        if !size.is_power_of_two() || size < 2 || size > MAX_RING_SIZE {
            return Err(OptionsError::RingSizeOutOfRange(size));
        }
        Ok(())
    }
}

impl FromStr for VirtioNetOptions {
    type Err = OptionsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut options = Self::default();
        for opt in s.split(',').map(str::trim).filter(|opt| !opt.is_empty()) {
            let (key, value) = opt
                .split_once('=')
                .ok_or_else(|| OptionsError::MissingValue(opt.to_owned()))?;
            match key {
                "event-index" => options.event_index = parse_switch(key, value)?,
                "csum-offload" => options.csum_offload = parse_switch(key, value)?,
                "tso" => options.tso = parse_switch(key, value)?,
                "ufo" => options.ufo = parse_switch(key, value)?,
                "lro" => options.lro = parse_switch(key, value)?,
                "ring-size" | "virtio-ring-size" => {
                    options.ring_size = value
                        .parse()
                        .map_err(|_| OptionsError::InvalidRingSize(value.to_owned()))?;
                }
                "tap-device" => options.tap_device = value.to_owned(),
                "mac" => {
                    options.mac = Some(
                        value
                            .parse()
                            .map_err(|err| OptionsError::InvalidMac(value.to_owned(), err))?,
                    );
                }
                _ => return Err(OptionsError::UnknownOption(key.to_owned())),
            }
        }
        options.validate()?;
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::OptionsError;
    use super::VirtioNetOptions;
    use crate::mac_address::MacAddress;

    #[test]
    fn defaults() {
        let options: VirtioNetOptions = "".parse().unwrap();
        assert_eq!(options, VirtioNetOptions::default());
        assert!(options.event_index && options.csum_offload && options.lro);
        assert_eq!(options.ring_size, 256);
        assert_eq!(options.tap_device, "tap0");
    }

    #[test]
    fn parse_all() {
        let options: VirtioNetOptions =
            "event-index=off, csum-offload=off,tso=off,ufo=off,lro=off,ring-size=1024,tap-device=vtap1,mac=02:00:00:00:00:01"
                .parse()
                .unwrap();
        assert_eq!(
            options,
            VirtioNetOptions {
                event_index: false,
                csum_offload: false,
                tso: false,
                ufo: false,
                lro: false,
                ring_size: 1024,
                tap_device: "vtap1".into(),
                mac: Some(MacAddress::new([2, 0, 0, 0, 0, 1])),
            }
        );
    }

    #[test]
    fn errors() {
        assert!(matches!(
            "jumbo=on".parse::<VirtioNetOptions>(),
            Err(OptionsError::UnknownOption(k)) if k == "jumbo"
        ));
        assert!(matches!(
            "tso=yes".parse::<VirtioNetOptions>(),
            Err(OptionsError::InvalidSwitch { .. })
        ));
        assert!(matches!(
            "tso".parse::<VirtioNetOptions>(),
            Err(OptionsError::MissingValue(_))
        ));
        assert!(matches!(
            "ring-size=300".parse::<VirtioNetOptions>(),
            Err(OptionsError::RingSizeOutOfRange(300))
        ));
        assert!(matches!(
            "ring-size=65536".parse::<VirtioNetOptions>(),
            Err(OptionsError::InvalidRingSize(_))
        ));
        assert!(matches!(
            "virtio-ring-size=1".parse::<VirtioNetOptions>(),
            Err(OptionsError::RingSizeOutOfRange(1))
        ));
        assert!(matches!(
            "mac=zz".parse::<VirtioNetOptions>(),
            Err(OptionsError::InvalidMac(..))
        ));
    }
}
