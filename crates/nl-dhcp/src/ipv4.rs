//! 32-bit IPv4 value type with wrapping increment, used by the pool
//! allocator. `std::net::Ipv4Addr` stays the type of record at the
//! wire/packet layer; this one exists for address arithmetic.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
#[error("invalid ipv4: {0}")]
pub struct InvalidIpv4(String);

/// An IPv4 address as a host-order integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ipv4(u32);

impl Ipv4 {
    pub const UNSPECIFIED: Ipv4 = Ipv4(0);

    /// Wrapping increment: 255.255.255.255 rolls over to 0.0.0.0.
    pub fn inc(&mut self) {
        self.0 = self.0.wrapping_add(1);
    }

    /// Successor of this address, leaving `self` untouched.
    pub fn next(self) -> Ipv4 {
        Ipv4(self.0.wrapping_add(1))
    }

    pub fn is_unspecified(self) -> bool {
        self.0 == 0
    }
}

impl FromStr for Ipv4 {
    type Err = InvalidIpv4;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u32; 4];
        let mut count = 0;

        for group in s.split('.') {
            // Reject anything u32::from_str would wave through (signs,
            // whitespace) by requiring plain decimal digits.
            if count == 4
                || group.is_empty()
                || !group.bytes().all(|b| b.is_ascii_digit())
            {
                return Err(InvalidIpv4(s.to_string()));
            }
            let value: u32 = group.parse().map_err(|_| InvalidIpv4(s.to_string()))?;
            if value > 255 {
                return Err(InvalidIpv4(s.to_string()));
            }
            octets[count] = value;
            count += 1;
        }

        if count != 4 {
            return Err(InvalidIpv4(s.to_string()));
        }

        Ok(Ipv4(
            octets[0] << 24 | octets[1] << 16 | octets[2] << 8 | octets[3],
        ))
    }
}

impl fmt::Display for Ipv4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.0 >> 24 & 0xff,
            self.0 >> 16 & 0xff,
            self.0 >> 8 & 0xff,
            self.0 & 0xff
        )
    }
}

impl From<u32> for Ipv4 {
    fn from(value: u32) -> Self {
        Ipv4(value)
    }
}

impl From<Ipv4> for u32 {
    fn from(ip: Ipv4) -> Self {
        ip.0
    }
}

impl From<Ipv4Addr> for Ipv4 {
    fn from(addr: Ipv4Addr) -> Self {
        Ipv4(u32::from(addr))
    }
}

impl From<Ipv4> for Ipv4Addr {
    fn from(ip: Ipv4) -> Self {
        Ipv4Addr::from(ip.0)
    }
}

impl Serialize for Ipv4 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Ipv4 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}
