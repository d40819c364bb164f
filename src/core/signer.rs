//! Chain-bound transaction signing and sender recovery.

use crate::core::transaction::Transaction;
use crate::crypto::key_pair::{recover_address, PrivateKey};
use crate::types::address::Address;
use crate::types::hash::Hash;
use num_bigint::{BigInt, Sign};
use num_traits::{ToPrimitive, Zero};
use std::sync::OnceLock;
use thiserror::Error;

/// Errors surfaced while signing a transaction or deriving its sender.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SignerError {
    /// The transaction's embedded chain id does not match the signer's.
    #[error("invalid chain id for signer")]
    InvalidChainId,
    /// The signature values are malformed or do not recover to a valid
    /// public key.
    #[error("invalid transaction signature")]
    InvalidSignature,
    /// Signature generation failed for the given key and digest.
    #[error("signature generation failed")]
    SigningFailed,
}

/// Signer bound to a single chain id.
///
/// The chain id is folded into the signature's recovery value, preventing
/// transactions signed for one chain from replaying on another. Two signers
/// compare equal iff their chain ids do, and the per-transaction sender
/// cache is keyed accordingly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signer {
    chain_id: u64,
}

impl Signer {
    pub fn new(chain_id: u64) -> Self {
        Signer { chain_id }
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Computes the digest a sender signs for the given transaction.
    ///
    /// Keccak-256 over the MessagePack encoding of the ordered tuple
    /// (nonce, recipient-or-zero, amount, payload, chain id, 0, 0). The
    /// explicit chain id and the trailing zeros bind the signature to this
    /// chain.
    pub fn hash_to_sign(&self, tx: &Transaction) -> Hash {
        let mut buf = Vec::new();

        let encode_failure = "transaction signing hash encoding cannot fail";
        rmp_serde::encode::write(&mut buf, &tx.nonce()).expect(encode_failure);
        rmp_serde::encode::write(&mut buf, tx.recipient().unwrap_or(&Address::zero()))
            .expect(encode_failure);
        rmp_serde::encode::write(&mut buf, &tx.amount().cloned().unwrap_or_default())
            .expect(encode_failure);
        rmp_serde::encode::write(&mut buf, tx.payload()).expect(encode_failure);
        rmp_serde::encode::write(&mut buf, &self.chain_id).expect(encode_failure);
        rmp_serde::encode::write(&mut buf, &0u32).expect(encode_failure);
        rmp_serde::encode::write(&mut buf, &0u32).expect(encode_failure);

        Hash::keccak_of(&buf)
    }

    /// Signs the transaction with the given key, returning a copy carrying
    /// the wire signature values.
    pub fn sign(&self, tx: &Transaction, key: &PrivateKey) -> Result<Transaction, SignerError> {
        let digest = self.hash_to_sign(tx);
        let signature = key.sign_digest(&digest).ok_or(SignerError::SigningFailed)?;
        let (r, s, v) = self.signature_values(&signature);
        Ok(tx.with_signature_values(r, s, v))
    }

    /// Splits a 65-byte `r || s || recovery_id` signature into the wire
    /// (r, s, v) values, folding the chain id into v.
    fn signature_values(&self, signature: &[u8; 65]) -> (BigInt, BigInt, BigInt) {
        let r = BigInt::from_bytes_be(Sign::Plus, &signature[..32]);
        let s = BigInt::from_bytes_be(Sign::Plus, &signature[32..64]);
        let recovery_id = signature[64] as u64;

        let v = if self.chain_id == 0 {
            BigInt::from(recovery_id + 27)
        } else {
            BigInt::from(recovery_id + 35) + BigInt::from(self.chain_id) * 2
        };
        (r, s, v)
    }

    /// Returns the address that signed the transaction.
    ///
    /// The result is cached on the transaction, keyed by this signer's
    /// chain id; a lookup through a signer with a different chain id
    /// recomputes instead of reusing the cache.
    pub fn sender(&self, tx: &Transaction) -> Result<Address, SignerError> {
        if let Some(addr) = tx.sender_cache().get(self.chain_id) {
            return Ok(addr);
        }

        if derive_chain_id(tx.v()) != BigInt::from(self.chain_id) {
            return Err(SignerError::InvalidChainId);
        }
        // Strip the chain id from v, leaving the legacy 27/28 form.
        let v = if self.chain_id == 0 {
            tx.v().clone()
        } else {
            tx.v() - BigInt::from(self.chain_id) * 2 - 8
        };

        let addr = recover_plain(&self.hash_to_sign(tx), tx.r(), tx.s(), &v)?;
        tx.sender_cache().store(self.chain_id, addr);
        Ok(addr)
    }
}

/// Recovers the signing address from a digest and (r, s, v) with v in the
/// legacy 27/28 form.
fn recover_plain(digest: &Hash, r: &BigInt, s: &BigInt, v: &BigInt) -> Result<Address, SignerError> {
    if v.bits() > 8 {
        return Err(SignerError::InvalidSignature);
    }
    let recovery_id = v
        .to_u64()
        .and_then(|v| v.checked_sub(27))
        .ok_or(SignerError::InvalidSignature)?;
    if !valid_signature_values(r, s, recovery_id) {
        return Err(SignerError::InvalidSignature);
    }

    // Left-pad r and s to the fixed 64-byte signature layout.
    let mut signature = [0u8; 64];
    let (_, r_bytes) = r.to_bytes_be();
    let (_, s_bytes) = s.to_bytes_be();
    signature[32 - r_bytes.len()..32].copy_from_slice(&r_bytes);
    signature[64 - s_bytes.len()..64].copy_from_slice(&s_bytes);

    recover_address(digest, &signature, recovery_id as u8).ok_or(SignerError::InvalidSignature)
}

/// Checks r, s and the recovery id against the secp256k1 curve order
/// bounds, rejecting malleable upper-half s values.
fn valid_signature_values(r: &BigInt, s: &BigInt, recovery_id: u64) -> bool {
    if recovery_id > 1 {
        return false;
    }
    let one = BigInt::from(1u32);
    if r < &one || s < &one {
        return false;
    }
    r < curve_order() && s <= half_curve_order()
}

/// Derives the chain id embedded in a wire v value.
///
/// Legacy 27/28 values carry no chain id; everything else encodes
/// `recovery_id + 35 + 2 * chain_id`.
pub fn derive_chain_id(v: &BigInt) -> BigInt {
    if v.bits() <= 64 {
        if let Some(v) = v.to_u64() {
            if v == 27 || v == 28 {
                return BigInt::zero();
            }
            return BigInt::from(v.wrapping_sub(35) / 2);
        }
    }
    (v - 35) / 2
}

fn curve_order() -> &'static BigInt {
    static ORDER: OnceLock<BigInt> = OnceLock::new();
    ORDER.get_or_init(|| {
        BigInt::parse_bytes(
            b"FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFEBAAEDCE6AF48A03BBFD25E8CD0364141",
            16,
        )
        .expect("secp256k1 curve order is a valid hex constant")
    })
}

fn half_curve_order() -> &'static BigInt {
    static HALF: OnceLock<BigInt> = OnceLock::new();
    HALF.get_or_init(|| curve_order() >> 1)
}
