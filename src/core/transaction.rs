//! Transaction structure with lazily cached identity data.

use crate::types::address::Address;
use crate::types::bytes::Bytes;
use crate::types::hash::Hash;
use num_bigint::BigInt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// A signed transaction as it travels on the wire.
///
/// The canonical encoding is MessagePack over the fields in declaration
/// order, signature included. The transaction hash and encoded size are
/// derived from that encoding and cached on first access; the recovered
/// sender is cached per signer chain id (see [`SenderCache`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    /// Monotonic counter preventing replay for the sender.
    nonce: u64,
    /// Recipient account; `None` denotes a contract creation.
    recipient: Option<Address>,
    /// Native token amount to transfer. The wire format permits a missing
    /// amount; admission rejects such transactions.
    amount: Option<BigInt>,
    /// Arbitrary transaction payload.
    payload: Bytes,
    /// ECDSA signature component r.
    r: BigInt,
    /// ECDSA signature component s.
    s: BigInt,
    /// ECDSA recovery value with the chain id folded in.
    v: BigInt,

    /// Cached (hash, size) of the canonical encoding, do not use directly.
    #[serde(skip)]
    cached_encoding: EncodingCache,
    /// Cached recovered sender keyed by signer chain id, do not use directly.
    #[serde(skip)]
    cached_sender: SenderCache,
}

impl Transaction {
    /// Creates a new unsigned transaction.
    ///
    /// The signature components are zero until the transaction is signed
    /// through a `Signer`.
    pub fn new(
        nonce: u64,
        recipient: Option<Address>,
        amount: impl Into<Option<BigInt>>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Transaction {
            nonce,
            recipient,
            amount: amount.into(),
            payload: payload.into(),
            r: BigInt::default(),
            s: BigInt::default(),
            v: BigInt::default(),
            cached_encoding: EncodingCache::default(),
            cached_sender: SenderCache::default(),
        }
    }

    /// Returns a copy of this transaction carrying the given signature
    /// values. The derived-data caches start out empty on the copy.
    pub(crate) fn with_signature_values(&self, r: BigInt, s: BigInt, v: BigInt) -> Self {
        Transaction {
            nonce: self.nonce,
            recipient: self.recipient,
            amount: self.amount.clone(),
            payload: self.payload.clone(),
            r,
            s,
            v,
            cached_encoding: EncodingCache::default(),
            cached_sender: SenderCache::default(),
        }
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn recipient(&self) -> Option<&Address> {
        self.recipient.as_ref()
    }

    pub fn amount(&self) -> Option<&BigInt> {
        self.amount.as_ref()
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn r(&self) -> &BigInt {
        &self.r
    }

    pub fn s(&self) -> &BigInt {
        &self.s
    }

    pub fn v(&self) -> &BigInt {
        &self.v
    }

    /// Total balance the sender must hold for this transaction to be
    /// admitted. In this system the cost equals the transferred amount.
    ///
    /// A missing amount costs zero; admission rejects such transactions
    /// before the cost is ever consulted.
    pub fn cost(&self) -> BigInt {
        self.amount.clone().unwrap_or_default()
    }

    /// Returns the unique transaction identifier.
    ///
    /// Computed as the Keccak-256 hash of the canonical encoding including
    /// the signature. Result is cached.
    pub fn hash(&self) -> Hash {
        self.encoding_meta().0
    }

    /// Returns the length in bytes of the canonical encoding. Result is
    /// cached alongside the hash.
    pub fn size(&self) -> usize {
        self.encoding_meta().1
    }

    pub(crate) fn sender_cache(&self) -> &SenderCache {
        &self.cached_sender
    }

    fn encoding_meta(&self) -> (Hash, usize) {
        self.cached_encoding.get_or_compute(|| {
            let encoded = rmp_serde::to_vec(self)
                .expect("canonical transaction encoding cannot fail");
            (Hash::keccak_of(&encoded), encoded.len())
        })
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        // Caches are derived data; equality is over the wire fields only.
        self.nonce == other.nonce
            && self.recipient == other.recipient
            && self.amount == other.amount
            && self.payload == other.payload
            && self.r == other.r
            && self.s == other.s
            && self.v == other.v
    }
}

impl Eq for Transaction {}

/// Lazily computed (hash, size) of a transaction's canonical encoding.
///
/// Cloning copies the cached value; two caches always compare equal since
/// the content is fully derived from the owning transaction.
#[derive(Debug, Default)]
pub(crate) struct EncodingCache {
    cached: Mutex<Option<(Hash, usize)>>,
}

impl EncodingCache {
    fn get_or_compute(&self, f: impl FnOnce() -> (Hash, usize)) -> (Hash, usize) {
        let mut guard = self.cached.lock();
        match *guard {
            Some(meta) => meta,
            None => {
                let meta = f();
                *guard = Some(meta);
                meta
            }
        }
    }
}

impl Clone for EncodingCache {
    fn clone(&self) -> Self {
        EncodingCache {
            cached: Mutex::new(*self.cached.lock()),
        }
    }
}

/// Chain-aware sender cache that invalidates when the signer chain id
/// changes.
///
/// Stores the `(chain_id, sender)` pair of the most recent successful
/// derivation: a lookup with a different chain id misses, so a sender
/// recovered under one signer is never reused by another.
#[derive(Debug, Default)]
pub(crate) struct SenderCache {
    cached: Mutex<Option<(u64, Address)>>,
}

impl SenderCache {
    /// Returns the cached sender if the chain id matches.
    pub(crate) fn get(&self, chain_id: u64) -> Option<Address> {
        match *self.cached.lock() {
            Some((cached_chain_id, addr)) if cached_chain_id == chain_id => Some(addr),
            _ => None,
        }
    }

    /// Replaces the cached entry with the given derivation result.
    pub(crate) fn store(&self, chain_id: u64, addr: Address) {
        *self.cached.lock() = Some((chain_id, addr));
    }
}

impl Clone for SenderCache {
    fn clone(&self) -> Self {
        SenderCache {
            cached: Mutex::new(*self.cached.lock()),
        }
    }
}
