use std::fmt;
use std::str::FromStr;

use serde_with::SerializeDisplay;
use thiserror::Error;

const MAC_OCTETS: usize = 6;
const UNICAST_MIN: u16 = 0x0001;
const UNICAST_MAX: u16 = 0x7FFF;
const GROUP_MIN: u16 = 0xC000;
const GROUP_MAX: u16 = 0xFEFF;

/// Errors returned while parsing or validating addresses.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum AddressError {
    #[error("invalid device address `{value}`; expected six colon- or dash-separated hex octets")]
    InvalidDeviceAddress { value: String },
    #[error("unicast address 0x{value:04X} is outside the valid range 0x0001..=0x7FFF")]
    UnicastOutOfRange { value: u16 },
    #[error("group address 0x{value:04X} is outside the valid range 0xC000..=0xFEFF")]
    GroupOutOfRange { value: u16 },
}

/// A physical device (MAC) address in canonical form.
///
/// Addresses are canonicalized at the boundary to lowercase colon-separated
/// octets; no other form circulates inside the crate.
///
/// ```
/// use meshfleet::DeviceAddress;
///
/// let address: DeviceAddress = "AA:BB:cc-DD:ee:0F".parse().expect("mixed form should parse");
/// assert_eq!("aa:bb:cc:dd:ee:0f", address.as_str());
/// ```
#[derive(Debug, Clone, Eq, PartialEq, Hash, PartialOrd, Ord, SerializeDisplay)]
pub struct DeviceAddress {
    canonical: String,
}

impl DeviceAddress {
    /// Returns the canonical lowercase colon-separated form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.canonical
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl FromStr for DeviceAddress {
    type Err = AddressError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let octets: Vec<&str> = value.split([':', '-']).collect();
        if octets.len() != MAC_OCTETS {
            return Err(AddressError::InvalidDeviceAddress {
                value: value.to_string(),
            });
        }

        let mut canonical = String::with_capacity(MAC_OCTETS * 3 - 1);
        for (index, octet) in octets.iter().enumerate() {
            if octet.len() != 2 || !octet.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(AddressError::InvalidDeviceAddress {
                    value: value.to_string(),
                });
            }
            if index > 0 {
                canonical.push(':');
            }
            canonical.push_str(&octet.to_ascii_lowercase());
        }

        Ok(Self { canonical })
    }
}

/// A mesh address identifying exactly one node element.
///
/// ```
/// use meshfleet::UnicastAddress;
///
/// let address = UnicastAddress::try_from(0x0005).expect("0x0005 should be unicast");
/// assert_eq!("0x0005", address.to_string());
/// ```
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord, SerializeDisplay)]
pub struct UnicastAddress(u16);

impl UnicastAddress {
    /// Returns the raw 16-bit mesh address.
    #[must_use]
    pub const fn value(self) -> u16 {
        self.0
    }
}

impl fmt::Display for UnicastAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

impl TryFrom<u16> for UnicastAddress {
    type Error = AddressError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        if !(UNICAST_MIN..=UNICAST_MAX).contains(&value) {
            return Err(AddressError::UnicastOutOfRange { value });
        }
        Ok(Self(value))
    }
}

/// A mesh address identifying a set of subscribed nodes.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord, SerializeDisplay)]
pub struct GroupAddress(u16);

impl GroupAddress {
    /// Returns the raw 16-bit mesh address.
    #[must_use]
    pub const fn value(self) -> u16 {
        self.0
    }
}

impl fmt::Display for GroupAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

impl TryFrom<u16> for GroupAddress {
    type Error = AddressError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        if !(GROUP_MIN..=GROUP_MAX).contains(&value) {
            return Err(AddressError::GroupOutOfRange { value });
        }
        Ok(Self(value))
    }
}

/// Destination of an outbound mesh message.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, derive_more::Display, derive_more::From)]
pub enum Destination {
    /// A single node element.
    #[display("{_0}")]
    Unicast(UnicastAddress),
    /// A subscription group.
    #[display("{_0}")]
    Group(GroupAddress),
}

impl Destination {
    /// Returns the raw 16-bit mesh address.
    #[must_use]
    pub const fn value(self) -> u16 {
        match self {
            Self::Unicast(address) => address.value(),
            Self::Group(address) => address.value(),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("AA:BB:CC:DD:EE:FF", "aa:bb:cc:dd:ee:ff")]
    #[case("aa-bb-cc-dd-ee-ff", "aa:bb:cc:dd:ee:ff")]
    #[case("0A:1b:2C:3d:4E:5f", "0a:1b:2c:3d:4e:5f")]
    fn device_address_canonicalizes_all_accepted_forms(
        #[case] input: &str,
        #[case] expected: &str,
    ) {
        let address: DeviceAddress = input.parse().expect("address should parse");
        assert_eq!(expected, address.as_str());
    }

    #[rstest]
    #[case("aa:bb:cc:dd:ee")]
    #[case("aa:bb:cc:dd:ee:ff:00")]
    #[case("aabb:cc:dd:ee:ff")]
    #[case("gg:bb:cc:dd:ee:ff")]
    #[case("")]
    fn device_address_rejects_malformed_input(#[case] input: &str) {
        let parsed = input.parse::<DeviceAddress>();
        assert_matches!(parsed, Err(AddressError::InvalidDeviceAddress { .. }));
    }

    #[rstest]
    #[case(0x0000)]
    #[case(0x8000)]
    #[case(0xC000)]
    fn unicast_rejects_out_of_range_values(#[case] value: u16) {
        assert_matches!(
            UnicastAddress::try_from(value),
            Err(AddressError::UnicastOutOfRange { .. })
        );
    }

    #[rstest]
    #[case(0xBFFF)]
    #[case(0xFF00)]
    #[case(0x0001)]
    fn group_rejects_out_of_range_values(#[case] value: u16) {
        assert_matches!(
            GroupAddress::try_from(value),
            Err(AddressError::GroupOutOfRange { .. })
        );
    }

    #[test]
    fn destination_exposes_raw_address_value() {
        let unicast = UnicastAddress::try_from(0x0042).expect("0x0042 should be unicast");
        let group = GroupAddress::try_from(0xC001).expect("0xC001 should be a group");

        assert_eq!(0x0042, Destination::from(unicast).value());
        assert_eq!(0xC001, Destination::from(group).value());
    }
}
