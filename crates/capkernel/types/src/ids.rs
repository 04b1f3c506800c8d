use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::SlotParseError;

/// Identifier of a vat, assigned at genesis in registration order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VatId(pub u32);

/// Identifier of a kernel-hosted device, assigned at genesis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub u32);

impl fmt::Display for VatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "d{}", self.0)
    }
}

fn parse_prefixed(s: &str, prefix: char) -> Result<u32, SlotParseError> {
    s.strip_prefix(prefix)
        .and_then(|n| n.parse::<u32>().ok())
        .ok_or_else(|| SlotParseError::Malformed(s.to_string()))
}

impl FromStr for VatId {
    type Err = SlotParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_prefixed(s, 'v').map(VatId)
    }
}

impl FromStr for DeviceId {
    type Err = SlotParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_prefixed(s, 'd').map(DeviceId)
    }
}

impl Serialize for VatId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for VatId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl Serialize for DeviceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DeviceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
