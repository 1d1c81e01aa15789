// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Ethernet MAC addresses.

use std::fmt::Display;
use std::str::FromStr;
use thiserror::Error;

/// A 48-bit Ethernet MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    /// The address reported for vhost-backed devices, which have no
    /// configuration space to read one from.
    pub const VHOST_DEFAULT: Self = Self([0x12, 0x23, 0x34, 0x56, 0x67, 0x78]);

    pub const fn new(value: [u8; 6]) -> Self {
        Self(value)
    }

    pub const fn to_bytes(self) -> [u8; 6] {
        self.0
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(value: [u8; 6]) -> Self {
        Self::new(value)
    }
}

impl Display for MacAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// Error returned when parsing a [`MacAddress`] fails.
#[derive(Debug, Error)]
#[error("invalid mac address")]
pub struct InvalidMacAddress;

impl FromStr for MacAddress {
    type Err = InvalidMacAddress;

    fn from_str(val: &str) -> Result<Self, InvalidMacAddress> {
        let sep = match val.as_bytes().get(2) {
            Some(b':') => ':',
            Some(b'-') => '-',
            _ => return Err(InvalidMacAddress),
        };
        let mut mac = [0u8; 6];
        let mut parts = val.split(sep);
        for dst in &mut mac {
            let src = parts.next().ok_or(InvalidMacAddress)?;
            if src.len() != 2 || !src.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(InvalidMacAddress);
            }
            *dst = u8::from_str_radix(src, 16).map_err(|_| InvalidMacAddress)?;
        }
        if parts.next().is_some() {
            return Err(InvalidMacAddress);
        }
        Ok(Self(mac))
    }
}

#[cfg(test)]
mod tests {
    use super::InvalidMacAddress;
    use super::MacAddress;

    #[test]
    fn parse_mac_address() {
        let bad_macs = [
            "",
            "00:00:00-00-00-00",
            "00:00:00:00:00",
            "00:00:00:00:00:00:",
            "00:00:00:00:00::0",
            "00:00:00:00:00:0g",
            "+0:00:00:00:00:00",
        ];
        for mac in bad_macs {
            assert!(
                matches!(mac.parse::<MacAddress>(), Err(InvalidMacAddress)),
                "{mac}"
            );
        }

        let good_macs = [
            ("12:23:34:56:67:78", MacAddress::VHOST_DEFAULT.to_bytes()),
            ("01-23-45-67-89-AB", [0x01, 0x23, 0x45, 0x67, 0x89, 0xab]),
        ];
        for (mac, parsed) in good_macs {
            assert_eq!(mac.parse::<MacAddress>().unwrap().to_bytes(), parsed);
        }
        assert_eq!(MacAddress::VHOST_DEFAULT.to_string(), "12:23:34:56:67:78");
    }
}
