//! Recoverable ECDSA key pairs on secp256k1.

use crate::types::address::{Address, ADDRESS_LEN};
use crate::types::hash::Hash;
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use rand_core::OsRng;

/// Length of a recoverable signature: `r (32) || s (32) || recovery id (1)`.
pub const SIGNATURE_LEN: usize = 65;

/// Private key for signing transactions.
///
/// Generated using cryptographically secure randomness from the OS.
/// Never serialized or transmitted over the network.
#[derive(Clone)]
pub struct PrivateKey {
    key: SigningKey,
}

/// Public key for signature verification and address derivation.
///
/// The address is the last 20 bytes of the Keccak-256 hash of the
/// uncompressed curve point, excluding its leading tag byte.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicKey {
    pub key: VerifyingKey,
    pub address: Address,
}

impl PrivateKey {
    /// Generates a new random private key using OS-provided entropy.
    pub fn new() -> Self {
        let mut rng = OsRng;
        Self {
            key: SigningKey::random(&mut rng),
        }
    }

    /// Creates a private key from raw bytes.
    ///
    /// Returns `None` if the bytes do not represent a valid scalar for
    /// secp256k1.
    pub fn from_bytes(bytes: &[u8; 32]) -> Option<Self> {
        SigningKey::from_bytes(bytes.into()).ok().map(|key| Self { key })
    }

    /// Derives the corresponding public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey::new(self)
    }

    /// Returns the address of the corresponding public key.
    pub fn address(&self) -> Address {
        self.public_key().address
    }

    /// Signs a 32-byte digest, producing a 65-byte recoverable signature.
    ///
    /// The signature layout is `r || s || recovery_id` with `recovery_id`
    /// in {0, 1}. The `s` component is always in the lower half of the
    /// curve order.
    pub fn sign_digest(&self, digest: &Hash) -> Option<[u8; SIGNATURE_LEN]> {
        let (signature, recovery_id) = self.key.sign_prehash_recoverable(digest.as_slice()).ok()?;

        let mut out = [0u8; SIGNATURE_LEN];
        out[..64].copy_from_slice(&signature.to_bytes());
        out[64] = recovery_id.to_byte();
        Some(out)
    }
}

impl Default for PrivateKey {
    fn default() -> Self {
        Self::new()
    }
}

impl PublicKey {
    /// Derives a public key from a private key and computes its address.
    pub(crate) fn new(private: &PrivateKey) -> Self {
        let vk = *private.key.verifying_key();
        PublicKey {
            key: vk,
            address: address_of(&vk),
        }
    }
}

/// Derives the account address from a verifying key.
///
/// Address derivation: Keccak-256(uncompressed_point[1..65])[12..32]
fn address_of(key: &VerifyingKey) -> Address {
    let point = key.to_encoded_point(false);
    let full = Hash::keccak_of(&point.as_bytes()[1..]);

    let mut addr = [0u8; ADDRESS_LEN];
    addr.copy_from_slice(&full.as_slice()[12..]);
    Address(addr)
}

/// Recovers the signing address from a digest and a raw 64-byte `r || s`
/// signature plus its recovery id.
///
/// Returns `None` if the signature components do not form a valid curve
/// signature, the recovery id is out of range, or the recovered point is
/// not a valid uncompressed public key.
pub fn recover_address(digest: &Hash, signature: &[u8; 64], recovery_id: u8) -> Option<Address> {
    let signature = Signature::from_slice(signature).ok()?;
    let recovery_id = RecoveryId::from_byte(recovery_id)?;
    let key = VerifyingKey::recover_from_prehash(digest.as_slice(), &signature, recovery_id).ok()?;

    // The recovered key must encode to a 65-byte uncompressed point with
    // the 0x04 tag; anything else is a malformed signature.
    let point = key.to_encoded_point(false);
    let bytes = point.as_bytes();
    if bytes.len() != SIGNATURE_LEN || bytes[0] != 4 {
        return None;
    }
    Some(address_of(&key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_recover_roundtrip() {
        let key = PrivateKey::new();
        let digest = Hash::keccak_of(b"message");

        let sig = key.sign_digest(&digest).expect("signing failed");
        let mut rs = [0u8; 64];
        rs.copy_from_slice(&sig[..64]);

        let recovered = recover_address(&digest, &rs, sig[64]);
        assert_eq!(recovered, Some(key.address()));
    }

    #[test]
    fn recovery_with_wrong_digest_yields_other_address() {
        let key = PrivateKey::new();
        let digest = Hash::keccak_of(b"original");

        let sig = key.sign_digest(&digest).expect("signing failed");
        let mut rs = [0u8; 64];
        rs.copy_from_slice(&sig[..64]);

        let other = Hash::keccak_of(b"tampered");
        let recovered = recover_address(&other, &rs, sig[64]);
        assert_ne!(recovered, Some(key.address()));
    }

    #[test]
    fn recover_rejects_zero_signature() {
        let digest = Hash::keccak_of(b"anything");
        assert!(recover_address(&digest, &[0u8; 64], 0).is_none());
    }

    #[test]
    fn recover_rejects_invalid_recovery_id() {
        let key = PrivateKey::new();
        let digest = Hash::keccak_of(b"message");

        let sig = key.sign_digest(&digest).expect("signing failed");
        let mut rs = [0u8; 64];
        rs.copy_from_slice(&sig[..64]);

        assert!(recover_address(&digest, &rs, 4).is_none());
    }

    #[test]
    fn from_bytes_with_zero_key_fails() {
        assert!(PrivateKey::from_bytes(&[0u8; 32]).is_none());
    }

    #[test]
    fn from_bytes_produces_deterministic_address() {
        let bytes: [u8; 32] = [
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e,
            0x0f, 0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, 0x19, 0x1a, 0x1b, 0x1c,
            0x1d, 0x1e, 0x1f, 0x20,
        ];
        let key1 = PrivateKey::from_bytes(&bytes).unwrap();
        let key2 = PrivateKey::from_bytes(&bytes).unwrap();
        assert_eq!(key1.address(), key2.address());
    }

    #[test]
    fn address_uniqueness() {
        let key1 = PrivateKey::new();
        let key2 = PrivateKey::new();
        assert_ne!(key1.address(), key2.address());
    }
}
