//! 20-byte account addresses derived from public keys.

use serde::de::{Error as DeError, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Address length in bytes.
pub const ADDRESS_LEN: usize = 20;

/// Fixed-size 20-byte address identifying accounts on the chain.
///
/// Derived from the uncompressed secp256k1 public key via Keccak-256,
/// taking the last 20 bytes. This type is `Copy` for efficient passing in
/// validation and lookup operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Hash, Ord, PartialOrd)]
pub struct Address(pub [u8; ADDRESS_LEN]);

impl Address {
    /// Creates a zero-valued address.
    ///
    /// Stands in for the absent recipient of a contract creation when a
    /// concrete address is required (e.g. in the signing hash).
    pub const fn zero() -> Address {
        Address([0u8; ADDRESS_LEN])
    }

    /// Returns the address as a byte slice.
    pub const fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Creates an address from a byte slice.
    ///
    /// Returns `None` if the slice length is not exactly [`ADDRESS_LEN`] bytes.
    pub fn from_slice(slice: &[u8]) -> Option<Address> {
        if slice.len() != ADDRESS_LEN {
            return None;
        }
        let mut bytes = [0u8; ADDRESS_LEN];
        bytes.copy_from_slice(slice);
        Some(Address(bytes))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x")?;
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct AddressVisitor;

        impl<'de> Visitor<'de> for AddressVisitor {
            type Value = Address;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{ADDRESS_LEN} bytes")
            }

            fn visit_bytes<E: DeError>(self, v: &[u8]) -> Result<Address, E> {
                Address::from_slice(v).ok_or_else(|| E::invalid_length(v.len(), &self))
            }
        }

        deserializer.deserialize_bytes(AddressVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_address_is_all_zeroes() {
        assert!(Address::zero().0.iter().all(|&b| b == 0));
    }

    #[test]
    fn from_slice_rejects_wrong_length() {
        assert!(Address::from_slice(&[1u8; 19]).is_none());
        assert!(Address::from_slice(&[1u8; 21]).is_none());
        assert_eq!(
            Address::from_slice(&[1u8; 20]),
            Some(Address([1u8; ADDRESS_LEN]))
        );
    }

    #[test]
    fn display_is_prefixed_hex() {
        let addr = Address([0xab; ADDRESS_LEN]);
        assert_eq!(addr.to_string(), format!("0x{}", "ab".repeat(20)));
    }

    #[test]
    fn serde_roundtrip() {
        let addr = Address([7u8; ADDRESS_LEN]);
        let encoded = rmp_serde::to_vec(&addr).unwrap();
        let decoded: Address = rmp_serde::from_slice(&encoded).unwrap();
        assert_eq!(addr, decoded);
    }
}
