//! In-memory chain and state fixtures for pool tests.

use crate::core::block::{Block, Header};
use crate::core::chain::{Blockchain, ChainError, ChainHeadEvent, StateDb};
use crate::core::signer::Signer;
use crate::core::transaction::Transaction;
use crate::crypto::key_pair::PrivateKey;
use crate::types::address::Address;
use crate::types::hash::Hash;
use num_bigint::BigInt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

static COUNTER: AtomicU64 = AtomicU64::new(1);

/// Returns a hash unique within the test process.
pub fn unique_hash() -> Hash {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut value = [0u8; 32];
    value[..8].copy_from_slice(&n.to_le_bytes());
    Hash(value)
}

/// Mutable in-memory account state.
///
/// Accounts default to nonce zero and an empty balance until set.
pub struct TestState {
    nonces: Mutex<HashMap<Address, u64>>,
    balances: Mutex<HashMap<Address, BigInt>>,
}

impl TestState {
    pub fn new() -> Arc<TestState> {
        Arc::new(TestState {
            nonces: Mutex::new(HashMap::new()),
            balances: Mutex::new(HashMap::new()),
        })
    }

    pub fn set_nonce(&self, addr: Address, nonce: u64) {
        self.nonces.lock().insert(addr, nonce);
    }

    pub fn set_balance(&self, addr: Address, balance: impl Into<BigInt>) {
        self.balances.lock().insert(addr, balance.into());
    }
}

impl StateDb for TestState {
    fn nonce(&self, addr: &Address) -> u64 {
        self.nonces.lock().get(addr).copied().unwrap_or(0)
    }

    fn balance(&self, addr: &Address) -> BigInt {
        self.balances.lock().get(addr).cloned().unwrap_or_default()
    }
}

/// In-memory chain with a registry of blocks and state snapshots.
pub struct TestChain {
    head: Mutex<Arc<Block>>,
    blocks: Mutex<HashMap<Hash, Arc<Block>>>,
    states: Mutex<HashMap<Hash, Arc<TestState>>>,
    subscribers: Mutex<Vec<mpsc::Sender<ChainHeadEvent>>>,
}

impl TestChain {
    /// Creates a chain holding only a genesis block, returning it together
    /// with the genesis account state.
    pub fn new() -> (Arc<TestChain>, Arc<TestState>) {
        let state = TestState::new();
        let root = unique_hash();
        let genesis = Arc::new(Block::new(Header::new(0, Hash::zero(), root, 0), Vec::new()));

        let chain = TestChain {
            head: Mutex::new(genesis.clone()),
            blocks: Mutex::new(HashMap::from([(genesis.hash(), genesis)])),
            states: Mutex::new(HashMap::from([(root, state.clone())])),
            subscribers: Mutex::new(Vec::new()),
        };
        (Arc::new(chain), state)
    }

    pub fn head(&self) -> Arc<Block> {
        self.head.lock().clone()
    }

    /// Builds, registers and returns a child of `parent` executing against
    /// the given state.
    pub fn make_child(
        &self,
        parent: &Block,
        state: Arc<TestState>,
        transactions: Vec<Arc<Transaction>>,
    ) -> Arc<Block> {
        let root = unique_hash();
        // A unique timestamp keeps sibling blocks distinguishable.
        let header = Header::new(
            parent.number() + 1,
            parent.hash(),
            root,
            COUNTER.fetch_add(1, Ordering::Relaxed),
        );
        let block = Arc::new(Block::new(header, transactions));

        self.blocks.lock().insert(block.hash(), block.clone());
        self.states.lock().insert(root, state);
        block
    }

    /// Adopts the block as the new head and notifies subscribers.
    pub async fn announce(&self, block: Arc<Block>) {
        *self.head.lock() = block.clone();
        let subscribers = self.subscribers.lock().clone();
        for subscriber in subscribers {
            let _ = subscriber
                .send(ChainHeadEvent {
                    block: block.clone(),
                })
                .await;
        }
    }
}

impl Blockchain for TestChain {
    fn current_block(&self) -> Arc<Block> {
        self.head()
    }

    fn block(&self, hash: Hash, _number: u64) -> Option<Arc<Block>> {
        self.blocks.lock().get(&hash).cloned()
    }

    fn state_at(&self, root: Hash) -> Result<Arc<dyn StateDb>, ChainError> {
        match self.states.lock().get(&root) {
            Some(state) => Ok(state.clone()),
            None => Err(ChainError::UnknownStateRoot(root)),
        }
    }

    fn subscribe_chain_head(&self) -> mpsc::Receiver<ChainHeadEvent> {
        let (tx, rx) = mpsc::channel(10);
        self.subscribers.lock().push(tx);
        rx
    }
}

/// Builds a signed transfer of `amount` with an empty payload.
pub fn signed_tx(signer: &Signer, key: &PrivateKey, nonce: u64, amount: u64) -> Arc<Transaction> {
    signed_tx_with_payload(signer, key, nonce, amount, b"")
}

/// Builds a signed transfer carrying the given payload.
pub fn signed_tx_with_payload(
    signer: &Signer,
    key: &PrivateKey,
    nonce: u64,
    amount: u64,
    payload: &[u8],
) -> Arc<Transaction> {
    let tx = Transaction::new(
        nonce,
        Some(Address([0xee; 20])),
        BigInt::from(amount),
        payload,
    );
    Arc::new(signer.sign(&tx, key).expect("signing failed"))
}
