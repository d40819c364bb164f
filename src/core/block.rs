//! Block and header structures as consumed by the pool.
//!
//! The pool never validates or executes blocks; it only needs headers to
//! follow head changes and block bodies to reconcile transactions across
//! reorganizations.

use crate::core::transaction::Transaction;
use crate::types::hash::Hash;
use serde::Serialize;
use std::sync::Arc;
use std::sync::OnceLock;

/// Block header carrying the chain linkage the pool tracks.
#[derive(Clone, Debug, Serialize)]
pub struct Header {
    /// Block index in the chain (genesis = 0).
    pub number: u64,
    /// Hash of the parent block, forming the chain.
    pub parent_hash: Hash,
    /// Root of the account state after executing this block.
    pub state_root: Hash,
    /// Unix timestamp of block production.
    pub timestamp: u64,

    /// Lazily computed header hash, do not use directly.
    #[serde(skip)]
    cached_hash: OnceLock<Hash>,
}

impl Header {
    pub fn new(number: u64, parent_hash: Hash, state_root: Hash, timestamp: u64) -> Self {
        Header {
            number,
            parent_hash,
            state_root,
            timestamp,
            cached_hash: OnceLock::new(),
        }
    }

    /// Returns the header hash, computing and caching it on first call.
    pub fn hash(&self) -> Hash {
        *self.cached_hash.get_or_init(|| {
            let encoded =
                rmp_serde::to_vec(self).expect("canonical header encoding cannot fail");
            Hash::keccak_of(&encoded)
        })
    }
}

/// Immutable block containing a header and its transactions.
///
/// Transactions are reference-counted so the pool can reinject them after
/// a reorganization without copying payloads.
#[derive(Clone, Debug)]
pub struct Block {
    pub header: Header,
    pub transactions: Vec<Arc<Transaction>>,
}

impl Block {
    pub fn new(header: Header, transactions: Vec<Arc<Transaction>>) -> Self {
        Block {
            header,
            transactions,
        }
    }

    /// Returns the block hash (the hash of its header).
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    /// Returns the block number.
    pub fn number(&self) -> u64 {
        self.header.number
    }
}
