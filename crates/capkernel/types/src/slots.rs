//! Kernel-wide and vat-local capability references.
//!
//! A [`KernelSlot`] is globally unique: `ko<N>`, `kp<N>`, `kd<N>`.
//! A [`VatSlot`] lives in one vat's numbering space: `o+N`, `p-N`, `d-N`.
//! The sign of a vat slot records who allocated it: `+` for the vat itself
//! (exports and vat-created promises), `-` for the kernel (imports).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::SlotParseError;

/// The three kinds of reference the kernel tracks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SlotKind {
    Object,
    Promise,
    Device,
}

impl SlotKind {
    fn vat_tag(self) -> char {
        match self {
            SlotKind::Object => 'o',
            SlotKind::Promise => 'p',
            SlotKind::Device => 'd',
        }
    }

    fn from_vat_tag(c: char) -> Option<Self> {
        match c {
            'o' => Some(SlotKind::Object),
            'p' => Some(SlotKind::Promise),
            'd' => Some(SlotKind::Device),
            _ => None,
        }
    }
}

impl fmt::Display for SlotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SlotKind::Object => "object",
            SlotKind::Promise => "promise",
            SlotKind::Device => "device",
        };
        f.write_str(name)
    }
}

fn parse_index(digits: &str, whole: &str) -> Result<u64, SlotParseError> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(SlotParseError::Malformed(whole.to_string()));
    }
    digits
        .parse::<u64>()
        .map_err(|_| SlotParseError::Malformed(whole.to_string()))
}

/// A kernel-wide reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KernelSlot {
    pub kind: SlotKind,
    pub index: u64,
}

impl KernelSlot {
    pub fn object(index: u64) -> Self {
        Self {
            kind: SlotKind::Object,
            index,
        }
    }

    pub fn promise(index: u64) -> Self {
        Self {
            kind: SlotKind::Promise,
            index,
        }
    }

    pub fn device(index: u64) -> Self {
        Self {
            kind: SlotKind::Device,
            index,
        }
    }

    pub fn is_promise(&self) -> bool {
        self.kind == SlotKind::Promise
    }
}

impl fmt::Display for KernelSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "k{}{}", self.kind.vat_tag(), self.index)
    }
}

impl FromStr for KernelSlot {
    type Err = SlotParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix('k')
            .ok_or_else(|| SlotParseError::Malformed(s.to_string()))?;
        let mut chars = rest.chars();
        let kind = chars
            .next()
            .and_then(SlotKind::from_vat_tag)
            .ok_or_else(|| SlotParseError::UnknownKind(s.to_string()))?;
        let index = parse_index(chars.as_str(), s)?;
        Ok(Self { kind, index })
    }
}

/// A reference expressed in one vat's local numbering space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VatSlot {
    pub kind: SlotKind,
    /// `true` for `+` slots (allocated by the vat), `false` for `-` slots.
    pub allocated_by_vat: bool,
    pub index: u64,
}

impl VatSlot {
    /// A slot the vat allocated itself (`o+N`, `p+N`).
    pub fn exported(kind: SlotKind, index: u64) -> Self {
        Self {
            kind,
            allocated_by_vat: true,
            index,
        }
    }

    /// A slot the kernel allocated on import (`o-N`, `p-N`, `d-N`).
    pub fn imported(kind: SlotKind, index: u64) -> Self {
        Self {
            kind,
            allocated_by_vat: false,
            index,
        }
    }

    /// The root object every vat exports first.
    pub fn root() -> Self {
        Self::exported(SlotKind::Object, 0)
    }

    pub fn is_promise(&self) -> bool {
        self.kind == SlotKind::Promise
    }
}

impl fmt::Display for VatSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.allocated_by_vat { '+' } else { '-' };
        write!(f, "{}{}{}", self.kind.vat_tag(), sign, self.index)
    }
}

impl FromStr for VatSlot {
    type Err = SlotParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        let kind = chars
            .next()
            .and_then(SlotKind::from_vat_tag)
            .ok_or_else(|| SlotParseError::UnknownKind(s.to_string()))?;
        let allocated_by_vat = match chars.next() {
            Some('+') => true,
            Some('-') => false,
            _ => return Err(SlotParseError::Malformed(s.to_string())),
        };
        let index = parse_index(chars.as_str(), s)?;
        if kind == SlotKind::Device && allocated_by_vat {
            return Err(SlotParseError::VatAllocatedDevice(s.to_string()));
        }
        Ok(Self {
            kind,
            allocated_by_vat,
            index,
        })
    }
}

macro_rules! string_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

string_serde!(KernelSlot);
string_serde!(VatSlot);

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn kernel_slot_display() {
        assert_eq!(KernelSlot::object(20).to_string(), "ko20");
        assert_eq!(KernelSlot::promise(41).to_string(), "kp41");
        assert_eq!(KernelSlot::device(30).to_string(), "kd30");
    }

    #[test]
    fn vat_slot_sign_records_origin() {
        let export: VatSlot = "o+3".parse().unwrap();
        assert!(export.allocated_by_vat);
        let import: VatSlot = "p-8".parse().unwrap();
        assert!(!import.allocated_by_vat);
        assert_eq!(import.kind, SlotKind::Promise);
        assert_eq!(VatSlot::root().to_string(), "o+0");
    }

    #[test]
    fn vat_allocated_device_is_rejected() {
        assert!(matches!(
            "d+1".parse::<VatSlot>(),
            Err(SlotParseError::VatAllocatedDevice(_))
        ));
        assert!("d-1".parse::<VatSlot>().is_ok());
    }

    #[test]
    fn malformed_slots_are_rejected() {
        for bad in ["", "x+1", "o1", "o+", "o+-1", "o++1", "o+1x"] {
            assert!(bad.parse::<VatSlot>().is_err(), "{bad} should not parse");
        }
        for bad in ["", "kq1", "ko", "ko+1", "o+1"] {
            assert!(bad.parse::<KernelSlot>().is_err(), "{bad} should not parse");
        }
        assert!("ko".parse::<KernelSlot>().is_err());
        assert!("o+".parse::<VatSlot>().is_err());
    }

    #[test]
    fn slots_serialize_as_strings() {
        let json = serde_json::to_string(&VatSlot::imported(SlotKind::Object, 1)).unwrap();
        assert_eq!(json, "\"o-1\"");
        let k: KernelSlot = serde_json::from_str("\"kp40\"").unwrap();
        assert_eq!(k, KernelSlot::promise(40));
    }

    fn arb_kind() -> impl Strategy<Value = SlotKind> {
        prop_oneof![
            Just(SlotKind::Object),
            Just(SlotKind::Promise),
            Just(SlotKind::Device),
        ]
    }

    proptest! {
        #[test]
        fn kernel_slot_text_form_is_stable(kind in arb_kind(), index in any::<u64>()) {
            let slot = KernelSlot { kind, index };
            prop_assert_eq!(slot.to_string().parse::<KernelSlot>().unwrap(), slot);
        }

        #[test]
        fn vat_slot_text_form_is_stable(kind in arb_kind(), plus in any::<bool>(), index in any::<u64>()) {
            let slot = VatSlot { kind, allocated_by_vat: plus && kind != SlotKind::Device, index };
            prop_assert_eq!(slot.to_string().parse::<VatSlot>().unwrap(), slot);
        }
    }
}
