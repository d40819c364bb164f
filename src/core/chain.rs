//! Interfaces to the blockchain and account state the pool validates
//! against.
//!
//! The embedding node implements [`Blockchain`] and [`StateDb`]; the pool
//! only ever reads through them. [`ManagedState`] layers the pool's own
//! nonce expectations on top of a state snapshot without writing back.

use crate::core::block::Block;
use crate::types::address::Address;
use crate::types::hash::Hash;
use num_bigint::BigInt;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors returned by the blockchain accessor.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainError {
    /// No state snapshot is available for the requested root.
    #[error("no state found for root {0}")]
    UnknownStateRoot(Hash),
}

/// Notification that the chain adopted a new head block.
#[derive(Clone, Debug)]
pub struct ChainHeadEvent {
    pub block: Arc<Block>,
}

/// Read access to account state at a fixed chain position.
pub trait StateDb: Send + Sync {
    /// Returns the next valid nonce for the account.
    fn nonce(&self, addr: &Address) -> u64;
    /// Returns the spendable balance of the account.
    fn balance(&self, addr: &Address) -> BigInt;
}

/// Read access to the chain the pool tracks.
pub trait Blockchain: Send + Sync {
    /// Returns the current head block.
    fn current_block(&self) -> Arc<Block>;
    /// Returns the block with the given hash and number, if known.
    fn block(&self, hash: Hash, number: u64) -> Option<Arc<Block>>;
    /// Returns the account state at the given state root.
    fn state_at(&self, root: Hash) -> Result<Arc<dyn StateDb>, ChainError>;
    /// Subscribes to chain head changes. The channel closes when the chain
    /// shuts down, which terminates the pool's event loop.
    fn subscribe_chain_head(&self) -> mpsc::Receiver<ChainHeadEvent>;
}

/// Virtual nonce overlay on top of a state snapshot.
///
/// Tracks the next expected nonce per sender as pending transactions
/// accumulate. Reads fall through to the underlying snapshot for accounts
/// without an overlay entry; nothing is ever written back.
pub struct ManagedState {
    db: Arc<dyn StateDb>,
    nonces: HashMap<Address, u64>,
}

impl ManagedState {
    pub fn new(db: Arc<dyn StateDb>) -> Self {
        ManagedState {
            db,
            nonces: HashMap::new(),
        }
    }

    /// Returns the overlay nonce if one was set, the snapshot nonce
    /// otherwise.
    pub fn nonce(&self, addr: &Address) -> u64 {
        match self.nonces.get(addr) {
            Some(&nonce) => nonce,
            None => self.db.nonce(addr),
        }
    }

    /// Sets the virtual nonce for the account.
    pub fn set_nonce(&mut self, addr: Address, nonce: u64) {
        self.nonces.insert(addr, nonce);
    }
}
