//! Two-tier transaction pool.
//!
//! Transactions enter the pool when they are received from the network or
//! submitted locally, and leave it when they are included in a block. The
//! pool separates processable transactions (appliable to the current state)
//! from future transactions; entries move between the two tiers as chain
//! state advances and nonce gaps fill.

pub(crate) mod journal;
pub(crate) mod list;

use self::journal::TxJournal;
use self::list::TxList;
use crate::core::block::{Block, Header};
use crate::core::chain::{Blockchain, ChainError, ChainHeadEvent, ManagedState, StateDb};
use crate::core::signer::Signer;
use crate::core::transaction::Transaction;
use crate::types::address::Address;
use crate::types::hash::Hash;
use num_bigint::Sign;
use parking_lot::{Mutex, RwLock};
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::interval_at;
use tracing::{debug, error, info, trace, warn};

/// Heuristic limit rejecting transactions over 32KiB to prevent DoS.
const MAX_TX_SIZE: usize = 32 * 1024;
/// Reorgs deeper than this are not repaired (they happen during fast sync).
const MAX_REORG_DEPTH: u64 = 64;
/// Time interval to report transaction pool stats.
const STATS_REPORT_INTERVAL: Duration = Duration::from_secs(8);
/// Time interval to check for evictable transactions.
const EVICTION_INTERVAL: Duration = Duration::from_secs(60);
/// Buffered capacity of the new-transaction event feed.
const EVENT_CHANNEL_SIZE: usize = 1024;

/// Errors surfaced while admitting a transaction into the pool.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// A transaction with this hash is already pooled.
    #[error("known transaction: {0}")]
    KnownTransaction(Hash),
    /// The encoded transaction exceeds the 32KiB heuristic limit.
    #[error("oversized data")]
    OversizedData,
    /// The transaction carries no amount at all.
    #[error("transaction amount is missing")]
    NilAmount,
    /// The transaction carries a negative amount.
    #[error("negative value")]
    NegativeValue,
    /// Sender recovery failed or the chain id does not match.
    #[error("invalid sender")]
    InvalidSender,
    /// The nonce is lower than the sender's current account nonce.
    #[error("nonce too low")]
    NonceTooLow,
    /// The sender cannot cover the transaction cost.
    #[error("insufficient funds for value")]
    InsufficientFunds,
    /// Both pool tiers are at capacity.
    #[error("transaction pool is full")]
    PoolFull,
}

/// The status of a transaction as seen by the pool.
///
/// `Included` is not observable from the pool alone: inclusion is only
/// seen indirectly through chain head resets, so lookups report `Unknown`
/// for anything no longer pooled. Cross-checking the chain is left to the
/// embedding node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Unknown,
    Queued,
    Pending,
    Included,
}

/// Event emitted for every transaction entering the pending tier, whether
/// by promotion or by direct replacement.
#[derive(Debug, Clone)]
pub struct TxEvent {
    pub tx: Arc<Transaction>,
}

/// Configuration parameters of the transaction pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Whether local transaction handling should be disabled.
    pub no_locals: bool,
    /// Journal of local transactions to survive node restarts; `None`
    /// disables journaling.
    pub journal: Option<PathBuf>,
    /// Time interval to regenerate the local transaction journal.
    pub rejournal: Duration,
    /// Minimum number of executable transaction slots guaranteed per account.
    pub account_slots: u64,
    /// Maximum number of executable transaction slots for all accounts.
    pub global_slots: u64,
    /// Maximum number of non-executable transaction slots permitted per
    /// non-local account.
    pub account_queue: u64,
    /// Maximum number of non-executable transaction slots for all accounts.
    pub global_queue: u64,
    /// Maximum amount of time non-executable transactions are queued.
    pub lifetime: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            no_locals: false,
            journal: Some(PathBuf::from("transactions.msgp")),
            rejournal: Duration::from_secs(60 * 60),
            account_slots: 16,
            global_slots: 4096,
            account_queue: 64,
            global_queue: 1024,
            lifetime: Duration::from_secs(3 * 60 * 60),
        }
    }
}

impl PoolConfig {
    /// Raises unworkable settings to their minimum sane values.
    fn sanitize(mut self) -> Self {
        if self.rejournal < Duration::from_secs(1) {
            warn!(
                provided = ?self.rejournal,
                "Sanitizing invalid txpool journal time"
            );
            self.rejournal = Duration::from_secs(1);
        }
        self
    }
}

/// Set of addresses with a bound signer for sender derivations.
struct AccountSet {
    accounts: HashSet<Address>,
    signer: Signer,
}

impl AccountSet {
    fn new(signer: Signer) -> Self {
        AccountSet {
            accounts: HashSet::new(),
            signer,
        }
    }

    fn contains(&self, addr: &Address) -> bool {
        self.accounts.contains(addr)
    }

    /// Checks whether the sender of the transaction is in the set. A
    /// failed derivation reports false.
    fn contains_tx(&self, tx: &Transaction) -> bool {
        match self.signer.sender(tx) {
            Ok(addr) => self.contains(&addr),
            Err(_) => false,
        }
    }

    fn add(&mut self, addr: Address) {
        self.accounts.insert(addr);
    }
}

/// Snapshot of the pool's drop accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolCounters {
    /// Pending insertions refused by the replacement policy.
    pub pending_discard: u64,
    /// Pending transactions dropped by the global cap.
    pub pending_ratelimit: u64,
    /// Pending transactions dropped for lack of funds.
    pub pending_nofunds: u64,
    /// Queued transactions dropped by per-account or global caps.
    pub queued_ratelimit: u64,
    /// Queued transactions dropped for lack of funds.
    pub queued_nofunds: u64,
    /// Transactions refused by validation.
    pub invalid: u64,
}

#[derive(Debug, Default)]
struct AtomicCounters {
    pending_discard: AtomicU64,
    pending_ratelimit: AtomicU64,
    pending_nofunds: AtomicU64,
    queued_ratelimit: AtomicU64,
    queued_nofunds: AtomicU64,
    invalid: AtomicU64,
}

fn bump(counter: &AtomicU64, amount: u64) {
    counter.fetch_add(amount, Ordering::Relaxed);
}

/// All mutable pool state, guarded by the single pool lock.
struct PoolInner {
    /// Account state at the current chain head.
    current_state: Arc<dyn StateDb>,
    /// Virtual nonce overlay tracking the next expected nonce per sender.
    pending_state: ManagedState,
    /// Senders exempt from eviction rules and journaled to disk.
    locals: AccountSet,
    /// Journal of local transactions to back up to disk.
    journal: Option<TxJournal>,
    /// All currently processable transactions.
    pending: HashMap<Address, TxList>,
    /// Queued but non-processable transactions.
    queued: HashMap<Address, TxList>,
    /// Last heartbeat from each known account.
    beats: HashMap<Address, Instant>,
    /// All transactions, allowing lookups by hash.
    all: HashMap<Hash, Arc<Transaction>>,
}

/// Transaction pool gathering, sorting and filtering inbound transactions.
///
/// The public API is thread-safe: read-only queries take the pool lock
/// shared, everything else takes it exclusively. The pool lives inside a
/// Tokio runtime: new-transaction events are dispatched on background
/// tasks, and a background event loop follows chain head changes, reports
/// stats, evicts idle accounts and rotates the local journal until
/// [`TxPool::stop`] is awaited.
pub struct TxPool {
    config: PoolConfig,
    signer: Signer,
    chain: Arc<dyn Blockchain>,
    inner: RwLock<PoolInner>,
    events: broadcast::Sender<TxEvent>,
    counters: AtomicCounters,
    shutdown: Notify,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl TxPool {
    /// Creates a new transaction pool against the given chain and spawns
    /// its event loop. Must be called from within a Tokio runtime.
    ///
    /// When locals are enabled and a journal path is configured, the
    /// journal is loaded (re-injecting surviving transactions) and rotated
    /// before the pool starts serving.
    pub fn new(
        config: PoolConfig,
        chain_id: u64,
        chain: Arc<dyn Blockchain>,
    ) -> Result<Arc<TxPool>, ChainError> {
        let config = config.sanitize();
        let signer = Signer::new(chain_id);

        let head = chain.current_block();
        let state = chain.state_at(head.header.state_root)?;
        let inner = PoolInner {
            current_state: state.clone(),
            pending_state: ManagedState::new(state),
            locals: AccountSet::new(signer.clone()),
            journal: None,
            pending: HashMap::new(),
            queued: HashMap::new(),
            beats: HashMap::new(),
            all: HashMap::new(),
        };

        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let pool = Arc::new(TxPool {
            config,
            signer,
            chain: chain.clone(),
            inner: RwLock::new(inner),
            events,
            counters: AtomicCounters::default(),
            shutdown: Notify::new(),
            loop_handle: Mutex::new(None),
        });

        // If local transactions and journaling are enabled, load from disk.
        if !pool.config.no_locals {
            if let Some(path) = pool.config.journal.clone() {
                let mut journal = TxJournal::new(path);
                if let Err(err) = journal.load(|tx| pool.add_local(Arc::new(tx))) {
                    warn!(%err, "Failed to load transaction journal");
                }
                let mut inner = pool.inner.write();
                let snapshot = Self::local_snapshot(&mut inner);
                if let Err(err) = journal.rotate(&snapshot) {
                    warn!(%err, "Failed to rotate transaction journal");
                }
                inner.journal = Some(journal);
            }
        }

        let head_events = chain.subscribe_chain_head();
        let handle = tokio::spawn(Self::run_loop(pool.clone(), head_events));
        *pool.loop_handle.lock() = Some(handle);

        Ok(pool)
    }

    /// Terminates the transaction pool: stops the event loop, waits for it
    /// to exit and closes the journal. Mutating the pool afterwards is
    /// undefined.
    pub async fn stop(&self) {
        self.shutdown.notify_one();
        let handle = self.loop_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let mut inner = self.inner.write();
        if let Some(journal) = inner.journal.as_mut() {
            if let Err(err) = journal.close() {
                warn!(%err, "Failed to close transaction journal");
            }
        }
        info!("Transaction pool stopped");
    }

    /// Subscribes to the new-transaction event feed.
    pub fn subscribe(&self) -> broadcast::Receiver<TxEvent> {
        self.events.subscribe()
    }

    /// Enqueues a single transaction, marking the sender as local so its
    /// transactions are journaled and exempt from eviction rules.
    pub fn add_local(&self, tx: Arc<Transaction>) -> Result<(), PoolError> {
        self.add_tx(tx, !self.config.no_locals)
    }

    /// Enqueues a single transaction received from the network.
    pub fn add_remote(&self, tx: Arc<Transaction>) -> Result<(), PoolError> {
        self.add_tx(tx, false)
    }

    /// Enqueues a batch of local transactions, returning one result per
    /// input in order.
    pub fn add_locals(&self, txs: Vec<Arc<Transaction>>) -> Vec<Result<(), PoolError>> {
        self.add_txs(txs, !self.config.no_locals)
    }

    /// Enqueues a batch of remote transactions, returning one result per
    /// input in order.
    pub fn add_remotes(&self, txs: Vec<Arc<Transaction>>) -> Vec<Result<(), PoolError>> {
        self.add_txs(txs, false)
    }

    /// Returns the number of pending and queued transactions.
    pub fn stats(&self) -> (usize, usize) {
        let inner = self.inner.read();
        Self::stats_locked(&inner)
    }

    /// Returns a transaction if it is contained in the pool.
    pub fn get(&self, hash: Hash) -> Option<Arc<Transaction>> {
        self.inner.read().all.get(&hash).cloned()
    }

    /// Returns the status of a batch of transactions identified by hash.
    pub fn status(&self, hashes: &[Hash]) -> Vec<TxStatus> {
        let inner = self.inner.read();
        hashes
            .iter()
            .map(|hash| {
                let Some(tx) = inner.all.get(hash) else {
                    return TxStatus::Unknown;
                };
                let Ok(from) = self.signer.sender(tx) else {
                    return TxStatus::Unknown;
                };
                let pending = inner
                    .pending
                    .get(&from)
                    .is_some_and(|list| list.get(tx.nonce()).is_some());
                if pending {
                    TxStatus::Pending
                } else {
                    TxStatus::Queued
                }
            })
            .collect()
    }

    /// Returns the next nonce the pool expects from the account, taking
    /// its pending transactions into account.
    pub fn pending_nonce(&self, addr: &Address) -> u64 {
        self.inner.read().pending_state.nonce(addr)
    }

    /// Returns true if the sender of the transaction was flagged local.
    /// A failed sender derivation reports false.
    pub fn is_local(&self, tx: &Transaction) -> bool {
        self.inner.read().locals.contains_tx(tx)
    }

    /// Returns the full pool content grouped by account and sorted by
    /// nonce: first the pending map, then the queued map.
    #[allow(clippy::type_complexity)]
    pub fn content(
        &self,
    ) -> (
        HashMap<Address, Vec<Arc<Transaction>>>,
        HashMap<Address, Vec<Arc<Transaction>>>,
    ) {
        let mut inner = self.inner.write();
        let pending = inner
            .pending
            .iter_mut()
            .map(|(addr, list)| (*addr, list.flatten()))
            .collect();
        let queued = inner
            .queued
            .iter_mut()
            .map(|(addr, list)| (*addr, list.flatten()))
            .collect();
        (pending, queued)
    }

    /// Returns all currently processable transactions grouped by origin
    /// account and sorted by nonce. The returned set is a copy.
    pub fn pending(&self) -> HashMap<Address, Vec<Arc<Transaction>>> {
        let mut inner = self.inner.write();
        inner
            .pending
            .iter_mut()
            .map(|(addr, list)| (*addr, list.flatten()))
            .collect()
    }

    /// Returns a snapshot of the pool's drop accounting.
    pub fn counters(&self) -> PoolCounters {
        PoolCounters {
            pending_discard: self.counters.pending_discard.load(Ordering::Relaxed),
            pending_ratelimit: self.counters.pending_ratelimit.load(Ordering::Relaxed),
            pending_nofunds: self.counters.pending_nofunds.load(Ordering::Relaxed),
            queued_ratelimit: self.counters.queued_ratelimit.load(Ordering::Relaxed),
            queued_nofunds: self.counters.queued_nofunds.load(Ordering::Relaxed),
            invalid: self.counters.invalid.load(Ordering::Relaxed),
        }
    }

    /// Wrapper around `reset` taking the pool lock. Exists for tests only
    /// and must not be called while the event loop is processing head
    /// events on the same pool.
    pub fn locked_reset(&self, old_head: Option<&Header>, new_head: &Header) {
        let mut inner = self.inner.write();
        self.reset(&mut inner, old_head, new_head);
    }

    /// The pool's main event loop, reacting to chain head changes and
    /// driving periodic reporting, eviction and journal rotation.
    async fn run_loop(pool: Arc<TxPool>, mut head_events: mpsc::Receiver<ChainHeadEvent>) {
        let start = tokio::time::Instant::now();
        let mut report = interval_at(start + STATS_REPORT_INTERVAL, STATS_REPORT_INTERVAL);
        let mut evict = interval_at(start + EVICTION_INTERVAL, EVICTION_INTERVAL);
        let mut journal = interval_at(start + pool.config.rejournal, pool.config.rejournal);

        let (mut prev_pending, mut prev_queued) = (0, 0);
        // Track the previous head for transaction reorgs.
        let mut head = pool.chain.current_block();

        loop {
            tokio::select! {
                event = head_events.recv() => match event {
                    Some(event) => {
                        let old_header = head.header.clone();
                        let mut inner = pool.inner.write();
                        pool.reset(&mut inner, Some(&old_header), &event.block.header);
                        drop(inner);
                        head = event.block;
                    }
                    // The subscription ended, the chain is shutting down.
                    None => break,
                },

                _ = report.tick() => {
                    let (pending, queued) = pool.stats();
                    if pending != prev_pending || queued != prev_queued {
                        debug!(executable = pending, queued, "Transaction pool status report");
                        (prev_pending, prev_queued) = (pending, queued);
                    }
                },

                _ = evict.tick() => {
                    let mut inner = pool.inner.write();
                    pool.evict_stale(&mut inner);
                },

                _ = journal.tick() => {
                    let mut inner = pool.inner.write();
                    pool.rotate_journal(&mut inner);
                },

                _ = pool.shutdown.notified() => break,
            }
        }
    }

    /// Drops every queued transaction of non-local accounts whose last
    /// pool activity is older than the configured lifetime.
    fn evict_stale(&self, inner: &mut PoolInner) {
        let stale: Vec<Address> = inner
            .queued
            .keys()
            .filter(|addr| !inner.locals.contains(addr))
            .filter(|addr| {
                inner
                    .beats
                    .get(addr)
                    .map_or(true, |beat| beat.elapsed() > self.config.lifetime)
            })
            .copied()
            .collect();

        for addr in stale {
            let hashes: Vec<Hash> = match inner.queued.get_mut(&addr) {
                Some(list) => list.flatten().iter().map(|tx| tx.hash()).collect(),
                None => continue,
            };
            for hash in hashes {
                self.remove_tx(inner, hash);
            }
        }
    }

    /// Regenerates the journal from the current local transactions.
    fn rotate_journal(&self, inner: &mut PoolInner) {
        if inner.journal.is_none() {
            return;
        }
        let snapshot = Self::local_snapshot(inner);
        if let Some(journal) = inner.journal.as_mut() {
            if let Err(err) = journal.rotate(&snapshot) {
                warn!(%err, "Failed to rotate local tx journal");
            }
        }
    }

    /// Collects all transactions of local accounts, grouped by origin and
    /// sorted by nonce.
    fn local_snapshot(inner: &mut PoolInner) -> HashMap<Address, Vec<Arc<Transaction>>> {
        let mut txs: HashMap<Address, Vec<Arc<Transaction>>> = HashMap::new();
        let locals: Vec<Address> = inner.locals.accounts.iter().copied().collect();
        for addr in locals {
            let mut entries = Vec::new();
            if let Some(list) = inner.pending.get_mut(&addr) {
                entries.extend(list.flatten());
            }
            if let Some(list) = inner.queued.get_mut(&addr) {
                entries.extend(list.flatten());
            }
            if !entries.is_empty() {
                txs.insert(addr, entries);
            }
        }
        txs
    }

    fn stats_locked(inner: &PoolInner) -> (usize, usize) {
        let pending = inner.pending.values().map(|list| list.len()).sum();
        let queued = inner.queued.values().map(|list| list.len()).sum();
        (pending, queued)
    }

    /// Ensures the pool content is valid with regard to the chain state
    /// after a head change, reinjecting transactions dropped by a reorg.
    fn reset(&self, inner: &mut PoolInner, old_head: Option<&Header>, new_head: &Header) {
        // If we're reorging an old state, gather all dropped transactions.
        let mut reinject: Vec<Arc<Transaction>> = Vec::new();
        if let Some(old_head) = old_head {
            if old_head.hash() != new_head.parent_hash {
                let depth = old_head.number.abs_diff(new_head.number);
                if depth > MAX_REORG_DEPTH {
                    debug!(depth, "Skipping deep transaction reorg");
                } else {
                    match self.reorg_difference(old_head, new_head) {
                        Some(dropped) => reinject = dropped,
                        None => return,
                    }
                }
            }
        }

        // Reload the internal state to the new head.
        let state = match self.chain.state_at(new_head.state_root) {
            Ok(state) => state,
            Err(err) => {
                error!(%err, "Failed to reset txpool state");
                return;
            }
        };
        inner.current_state = state.clone();
        inner.pending_state = ManagedState::new(state);

        // Inject any transactions discarded due to reorgs.
        debug!(count = reinject.len(), "Reinjecting stale transactions");
        self.add_txs_locked(inner, reinject, false);

        // Validate the pending pool: drop anything included in a block or
        // invalidated by another transaction.
        self.demote_unexecutables(inner);

        // Update all accounts to the latest known pending nonce.
        let PoolInner {
            pending,
            pending_state,
            ..
        } = inner;
        for (addr, list) in pending.iter_mut() {
            if let Some(last) = list.flatten().last() {
                pending_state.set_nonce(*addr, last.nonce() + 1);
            }
        }

        // Check the queue and move transactions over to pending if possible.
        self.promote_executables(inner, None);
    }

    /// Walks the abandoned and adopted branches back to their common
    /// ancestor and returns the transactions present only on the abandoned
    /// one. `None` means a branch could not be resolved and the reset must
    /// abort.
    fn reorg_difference(
        &self,
        old_head: &Header,
        new_head: &Header,
    ) -> Option<Vec<Arc<Transaction>>> {
        let mut discarded: Vec<Arc<Transaction>> = Vec::new();
        let mut included: Vec<Arc<Transaction>> = Vec::new();

        let Some(mut rem) = self.chain.block(old_head.hash(), old_head.number) else {
            error!(block = old_head.number, hash = %old_head.hash(), "Unrooted old chain seen by tx pool");
            return None;
        };
        let Some(mut add) = self.chain.block(new_head.hash(), new_head.number) else {
            error!(block = new_head.number, hash = %new_head.hash(), "Unrooted new chain seen by tx pool");
            return None;
        };

        while rem.number() > add.number() {
            discarded.extend(rem.transactions.iter().cloned());
            match self.parent_of(&rem) {
                Some(parent) => rem = parent,
                None => {
                    error!(block = old_head.number, hash = %old_head.hash(), "Unrooted old chain seen by tx pool");
                    return None;
                }
            }
        }
        while add.number() > rem.number() {
            included.extend(add.transactions.iter().cloned());
            match self.parent_of(&add) {
                Some(parent) => add = parent,
                None => {
                    error!(block = new_head.number, hash = %new_head.hash(), "Unrooted new chain seen by tx pool");
                    return None;
                }
            }
        }
        while rem.hash() != add.hash() {
            discarded.extend(rem.transactions.iter().cloned());
            match self.parent_of(&rem) {
                Some(parent) => rem = parent,
                None => {
                    error!(block = old_head.number, hash = %old_head.hash(), "Unrooted old chain seen by tx pool");
                    return None;
                }
            }
            included.extend(add.transactions.iter().cloned());
            match self.parent_of(&add) {
                Some(parent) => add = parent,
                None => {
                    error!(block = new_head.number, hash = %new_head.hash(), "Unrooted new chain seen by tx pool");
                    return None;
                }
            }
        }

        let included: HashSet<Hash> = included.iter().map(|tx| tx.hash()).collect();
        Some(
            discarded
                .into_iter()
                .filter(|tx| !included.contains(&tx.hash()))
                .collect(),
        )
    }

    fn parent_of(&self, block: &Block) -> Option<Arc<Block>> {
        let number = block.number().checked_sub(1)?;
        self.chain.block(block.header.parent_hash, number)
    }

    /// Checks a transaction against the consensus rules and the heuristic
    /// limits of the local node.
    fn validate_tx(&self, inner: &PoolInner, tx: &Transaction) -> Result<(), PoolError> {
        if tx.size() > MAX_TX_SIZE {
            return Err(PoolError::OversizedData);
        }
        // A decoded transaction always carries an amount, but one built
        // through the RPC may not.
        let Some(amount) = tx.amount() else {
            return Err(PoolError::NilAmount);
        };
        if amount.sign() == Sign::Minus {
            return Err(PoolError::NegativeValue);
        }
        // Make sure the transaction is signed properly.
        let from = self.signer.sender(tx).map_err(|err| {
            debug!(%err, "Discarding transaction with invalid signature");
            PoolError::InvalidSender
        })?;
        // Ensure the transaction adheres to nonce ordering.
        if inner.current_state.nonce(&from) > tx.nonce() {
            return Err(PoolError::NonceTooLow);
        }
        // The sender should have enough funds to cover the cost.
        if inner.current_state.balance(&from) < tx.cost() {
            return Err(PoolError::InsufficientFunds);
        }
        Ok(())
    }

    /// Validates a transaction and inserts it into the non-executable
    /// queue for later promotion. If it replaces an already pending
    /// transaction, it is inserted directly and `true` is returned so the
    /// caller can skip the promotion pass.
    fn add(&self, inner: &mut PoolInner, tx: Arc<Transaction>, local: bool) -> Result<bool, PoolError> {
        // If the transaction is already known, discard it.
        let hash = tx.hash();
        if inner.all.contains_key(&hash) {
            trace!(%hash, "Discarding already known transaction");
            return Err(PoolError::KnownTransaction(hash));
        }
        // If the transaction fails basic validation, discard it.
        if let Err(err) = self.validate_tx(inner, &tx) {
            trace!(%hash, %err, "Discarding invalid transaction");
            bump(&self.counters.invalid, 1);
            return Err(err);
        }
        if inner.all.len() as u64 >= self.config.global_slots + self.config.global_queue {
            return Err(PoolError::PoolFull);
        }

        let from = self.signer.sender(&tx).map_err(|_| PoolError::InvalidSender)?; // already validated

        // If the transaction is replacing an already pending one, do it
        // directly and notify subsystems of the swap.
        let replaces_pending = inner
            .pending
            .get(&from)
            .is_some_and(|list| list.overlaps(&tx));
        if replaces_pending {
            if let Some(list) = inner.pending.get_mut(&from) {
                let (_, old) = list.add(tx.clone());
                if let Some(old) = old {
                    inner.all.remove(&old.hash());
                }
            }
            inner.all.insert(hash, tx.clone());
            self.journal_tx(inner, from, &tx);
            trace!(%hash, from = %from, "Pooled new executable transaction");
            self.notify(tx);
            return Ok(true);
        }

        // New transaction isn't replacing a pending one, push into queue.
        let replaced = self.enqueue_tx(inner, tx.clone());
        // Mark local addresses and journal local transactions.
        if local {
            inner.locals.add(from);
        }
        self.journal_tx(inner, from, &tx);
        trace!(%hash, from = %from, "Pooled new future transaction");
        Ok(replaced)
    }

    /// Inserts a transaction into the non-executable queue, recording a
    /// heartbeat for its sender. Returns whether an occupant was replaced.
    fn enqueue_tx(&self, inner: &mut PoolInner, tx: Arc<Transaction>) -> bool {
        let Ok(from) = self.signer.sender(&tx) else {
            return false; // already validated at insertion
        };
        let hash = tx.hash();

        let list = inner
            .queued
            .entry(from)
            .or_insert_with(|| TxList::new(false));
        let (_, old) = list.add(tx.clone());
        if let Some(old) = &old {
            inner.all.remove(&old.hash());
        }
        inner.all.insert(hash, tx);
        inner.beats.insert(from, Instant::now());
        old.is_some()
    }

    /// Notifies subscribers of a transaction entering the pending tier.
    ///
    /// Dispatched on a fresh task so the pool lock is not held while
    /// subscribers are notified.
    fn notify(&self, tx: Arc<Transaction>) {
        let events = self.events.clone();
        tokio::spawn(async move {
            let _ = events.send(TxEvent { tx });
        });
    }

    /// Adds the transaction to the disk journal if its sender is local.
    fn journal_tx(&self, inner: &mut PoolInner, from: Address, tx: &Transaction) {
        if !inner.locals.contains(&from) {
            return;
        }
        if let Some(journal) = inner.journal.as_mut() {
            if let Err(err) = journal.insert(tx) {
                warn!(%err, "Failed to journal local transaction");
            }
        }
    }

    /// Moves a transaction into the pending (processable) list, bumping
    /// the account heartbeat and pending nonce and notifying subscribers.
    fn promote_tx(&self, inner: &mut PoolInner, addr: Address, tx: Arc<Transaction>) {
        let hash = tx.hash();
        let list = inner.pending.entry(addr).or_insert_with(|| TxList::new(true));

        let (inserted, old) = list.add(tx.clone());
        if !inserted {
            // An older transaction was better, discard this one.
            inner.all.remove(&hash);
            bump(&self.counters.pending_discard, 1);
            return;
        }
        if let Some(old) = old {
            inner.all.remove(&old.hash());
        }
        // Failsafe to work around direct pending inserts (tests).
        inner.all.entry(hash).or_insert_with(|| tx.clone());

        inner.beats.insert(addr, Instant::now());
        inner.pending_state.set_nonce(addr, tx.nonce() + 1);
        self.notify(tx);
    }

    /// Enqueues a single transaction if it is valid.
    fn add_tx(&self, tx: Arc<Transaction>, local: bool) -> Result<(), PoolError> {
        let mut inner = self.inner.write();

        let replace = self.add(&mut inner, tx.clone(), local)?;
        // If we added a new transaction, run promotion checks.
        if !replace {
            if let Ok(from) = self.signer.sender(&tx) {
                self.promote_executables(&mut inner, Some(vec![from]));
            }
        }
        Ok(())
    }

    /// Enqueues a batch of transactions if they are valid.
    fn add_txs(&self, txs: Vec<Arc<Transaction>>, local: bool) -> Vec<Result<(), PoolError>> {
        let mut inner = self.inner.write();
        self.add_txs_locked(&mut inner, txs, local)
    }

    /// Batch admission with the pool lock already held.
    fn add_txs_locked(
        &self,
        inner: &mut PoolInner,
        txs: Vec<Arc<Transaction>>,
        local: bool,
    ) -> Vec<Result<(), PoolError>> {
        let mut dirty: HashSet<Address> = HashSet::new();
        let mut results = Vec::with_capacity(txs.len());

        for tx in txs {
            let result = self.add(inner, tx.clone(), local);
            if let Ok(false) = result {
                if let Ok(from) = self.signer.sender(&tx) {
                    dirty.insert(from);
                }
            }
            results.push(result.map(|_| ()));
        }

        // Only reprocess the internal state if something was actually added.
        if !dirty.is_empty() {
            self.promote_executables(inner, Some(dirty.into_iter().collect()));
        }
        results
    }

    /// Removes a single transaction from the pool, moving all subsequent
    /// pending transactions of the account back to the future queue.
    fn remove_tx(&self, inner: &mut PoolInner, hash: Hash) {
        let Some(tx) = inner.all.remove(&hash) else {
            return;
        };
        let Ok(addr) = self.signer.sender(&tx) else {
            return; // recovered during insertion
        };

        // Remove the transaction from the pending lists and reset the
        // account nonce.
        let mut in_pending = false;
        let mut invalids = Vec::new();
        if let Some(list) = inner.pending.get_mut(&addr) {
            let (removed, invalidated) = list.remove(&tx);
            in_pending = removed;
            invalids = invalidated;
        }
        if in_pending {
            if inner.pending.get(&addr).is_some_and(|list| list.is_empty()) {
                inner.pending.remove(&addr);
                inner.beats.remove(&addr);
            }
            // Postpone any invalidated transactions.
            for tx in invalids {
                self.enqueue_tx(inner, tx);
            }
            // Update the account nonce if needed.
            if inner.pending_state.nonce(&addr) > tx.nonce() {
                inner.pending_state.set_nonce(addr, tx.nonce());
            }
            return;
        }

        // Transaction is in the future queue.
        let mut now_empty = false;
        if let Some(list) = inner.queued.get_mut(&addr) {
            list.remove(&tx);
            now_empty = list.is_empty();
        }
        if now_empty {
            inner.queued.remove(&addr);
        }
    }

    /// Moves transactions that have become processable from the future
    /// queue to the pending set, dropping anything invalidated on the way,
    /// then enforces the global pending and queued caps.
    fn promote_executables(&self, inner: &mut PoolInner, accounts: Option<Vec<Address>>) {
        // Gather all the accounts potentially needing updates.
        let accounts = accounts.unwrap_or_else(|| inner.queued.keys().copied().collect());

        for addr in accounts {
            let state_nonce = inner.current_state.nonce(&addr);
            let balance = inner.current_state.balance(&addr);
            let pending_nonce = inner.pending_state.nonce(&addr);
            let is_local = inner.locals.contains(&addr);

            let Some(list) = inner.queued.get_mut(&addr) else {
                continue; // just in case someone calls with a non existing account
            };
            // Drop all transactions that are deemed too old (low nonce).
            let forwarded = list.forward(state_nonce);
            // Drop all transactions that are too costly (low balance).
            let (drops, _) = list.filter(&balance);
            // Gather all executable transactions to promote.
            let readies = list.ready(pending_nonce);
            // Cap the queue allowance of non-local accounts.
            let capped = if is_local {
                Vec::new()
            } else {
                list.cap(self.config.account_queue as usize)
            };
            let now_empty = list.is_empty();

            for tx in forwarded {
                let hash = tx.hash();
                trace!(%hash, "Removed old queued transaction");
                inner.all.remove(&hash);
            }
            for tx in drops {
                let hash = tx.hash();
                trace!(%hash, "Removed unpayable queued transaction");
                inner.all.remove(&hash);
                bump(&self.counters.queued_nofunds, 1);
            }
            for tx in readies {
                trace!(hash = %tx.hash(), "Promoting queued transaction");
                self.promote_tx(inner, addr, tx);
            }
            for tx in capped {
                let hash = tx.hash();
                inner.all.remove(&hash);
                bump(&self.counters.queued_ratelimit, 1);
                trace!(%hash, "Removed cap-exceeding queued transaction");
            }
            // Delete the entire queue entry if it became empty.
            if now_empty {
                inner.queued.remove(&addr);
            }
        }

        self.enforce_pending_cap(inner);
        self.enforce_queue_cap(inner);
    }

    /// Equalizes per-account allowances until the global pending cap is
    /// met, penalizing the largest non-local transactors first.
    fn enforce_pending_cap(&self, inner: &mut PoolInner) {
        let mut pending: u64 = inner.pending.values().map(|list| list.len() as u64).sum();
        if pending <= self.config.global_slots {
            return;
        }
        let pending_before = pending;

        // Assemble a spam order to penalize large transactors first.
        let mut spammers: BinaryHeap<(usize, Address)> = BinaryHeap::new();
        for (addr, list) in inner.pending.iter() {
            // Only evict transactions from high rollers.
            if !inner.locals.contains(addr) && list.len() as u64 > self.config.account_slots {
                spammers.push((list.len(), *addr));
            }
        }

        // Gradually drop transactions from offenders.
        let mut offenders: Vec<Address> = Vec::new();
        while pending > self.config.global_slots {
            let Some((_, offender)) = spammers.pop() else {
                break;
            };
            offenders.push(offender);

            if offenders.len() > 1 {
                // Equalize the previous offenders down to the newcomer's
                // list size.
                let threshold = inner.pending.get(&offender).map_or(0, |list| list.len());
                loop {
                    if pending <= self.config.global_slots {
                        break;
                    }
                    let runner_up = offenders[offenders.len() - 2];
                    if inner.pending.get(&runner_up).map_or(0, |list| list.len()) <= threshold {
                        break;
                    }
                    for i in 0..offenders.len() - 1 {
                        pending -= self.shrink_pending_by_one(inner, offenders[i]);
                    }
                }
            }
        }

        // If still above threshold, reduce all offenders to the minimum
        // per-account allowance.
        if pending > self.config.global_slots && !offenders.is_empty() {
            loop {
                let last = offenders[offenders.len() - 1];
                let last_len = inner.pending.get(&last).map_or(0, |list| list.len()) as u64;
                if pending <= self.config.global_slots || last_len <= self.config.account_slots {
                    break;
                }
                for addr in &offenders {
                    pending -= self.shrink_pending_by_one(inner, *addr);
                }
            }
        }
        bump(&self.counters.pending_ratelimit, pending_before - pending);
    }

    /// Drops the highest-nonce pending transaction of the account,
    /// rolling the virtual nonce back. Returns the number removed.
    fn shrink_pending_by_one(&self, inner: &mut PoolInner, addr: Address) -> u64 {
        let Some(list) = inner.pending.get_mut(&addr) else {
            return 0;
        };
        let capped = list.cap(list.len().saturating_sub(1));
        let removed = capped.len() as u64;
        for tx in capped {
            let hash = tx.hash();
            inner.all.remove(&hash);
            if inner.pending_state.nonce(&addr) > tx.nonce() {
                inner.pending_state.set_nonce(addr, tx.nonce());
            }
            trace!(%hash, "Removed fairness-exceeding pending transaction");
        }
        removed
    }

    /// Drops queued transactions of non-local accounts, oldest heartbeat
    /// first, until the global queue cap is met.
    fn enforce_queue_cap(&self, inner: &mut PoolInner) {
        let queued: u64 = inner.queued.values().map(|list| list.len() as u64).sum();
        if queued <= self.config.global_queue {
            return;
        }

        // Sort all non-local accounts with queued transactions by their
        // last activity.
        let mut addresses: Vec<(Address, Option<Instant>)> = inner
            .queued
            .keys()
            .filter(|addr| !inner.locals.contains(addr)) // don't drop locals
            .map(|addr| (*addr, inner.beats.get(addr).copied()))
            .collect();
        addresses.sort_by_key(|&(_, beat)| beat);

        // Drop transactions until the total is below the limit or only
        // locals remain.
        let mut drop_budget = queued - self.config.global_queue;
        for (addr, _) in addresses {
            if drop_budget == 0 {
                break;
            }
            let hashes: Vec<Hash> = match inner.queued.get_mut(&addr) {
                Some(list) => list.flatten().iter().map(|tx| tx.hash()).collect(),
                None => continue,
            };

            let size = hashes.len() as u64;
            if size <= drop_budget {
                // The whole account fits the budget, drop everything.
                for hash in hashes {
                    self.remove_tx(inner, hash);
                }
                drop_budget -= size;
                bump(&self.counters.queued_ratelimit, size);
            } else {
                // Otherwise drop only the highest-nonce suffix.
                for hash in hashes.iter().rev().take(drop_budget as usize) {
                    self.remove_tx(inner, *hash);
                }
                bump(&self.counters.queued_ratelimit, drop_budget);
                drop_budget = 0;
            }
        }
    }

    /// Removes invalid and processed transactions from the pending queue;
    /// anything rendered non-executable moves back to the future queue.
    fn demote_unexecutables(&self, inner: &mut PoolInner) {
        let accounts: Vec<Address> = inner.pending.keys().copied().collect();
        for addr in accounts {
            let nonce = inner.current_state.nonce(&addr);
            let balance = inner.current_state.balance(&addr);

            let Some(list) = inner.pending.get_mut(&addr) else {
                continue;
            };
            // Drop all transactions that are deemed too old (low nonce).
            let forwarded = list.forward(nonce);
            // Drop all unpayable transactions, keeping the invalidated
            // tail for re-queueing.
            let (drops, invalids) = list.filter(&balance);
            // If there's a gap in front, postpone everything (should never
            // happen).
            let gapped = if list.len() > 0 && list.get(nonce).is_none() {
                list.cap(0)
            } else {
                Vec::new()
            };
            let now_empty = list.is_empty();

            for tx in forwarded {
                let hash = tx.hash();
                trace!(%hash, "Removed old pending transaction");
                inner.all.remove(&hash);
            }
            for tx in drops {
                let hash = tx.hash();
                trace!(%hash, "Removed unpayable pending transaction");
                inner.all.remove(&hash);
                bump(&self.counters.pending_nofunds, 1);
            }
            // Delete the entire pending entry if it became empty.
            if now_empty {
                inner.pending.remove(&addr);
                inner.beats.remove(&addr);
            }
            for tx in invalids {
                trace!(hash = %tx.hash(), "Demoting pending transaction");
                self.enqueue_tx(inner, tx);
            }
            for tx in gapped {
                error!(hash = %tx.hash(), "Demoting invalidated transaction");
                self.enqueue_tx(inner, tx);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::key_pair::PrivateKey;
    use crate::test_utils::{signed_tx, signed_tx_with_payload, TestChain, TestState};
    use num_bigint::BigInt;

    const CHAIN_ID: u64 = 7;

    fn config() -> PoolConfig {
        PoolConfig {
            journal: None,
            ..PoolConfig::default()
        }
    }

    fn signer() -> Signer {
        Signer::new(CHAIN_ID)
    }

    fn new_pool(config: PoolConfig) -> (Arc<TxPool>, Arc<TestChain>, Arc<TestState>) {
        let (chain, state) = TestChain::new();
        let pool = TxPool::new(config, CHAIN_ID, chain.clone()).expect("pool construction failed");
        (pool, chain, state)
    }

    fn funded_key(state: &TestState, balance: u64) -> PrivateKey {
        let key = PrivateKey::new();
        state.set_balance(key.address(), BigInt::from(balance));
        key
    }

    /// Checks the structural pool invariants: the lookup map is exactly
    /// the union of both tiers, (sender, nonce) pairs are unique, and
    /// pending runs are contiguous.
    fn assert_invariants(pool: &TxPool) {
        let mut inner = pool.inner.write();
        let PoolInner {
            pending,
            queued,
            all,
            ..
        } = &mut *inner;

        let mut union: HashSet<Hash> = HashSet::new();
        let mut nonces: HashSet<(Address, u64)> = HashSet::new();

        for (addr, list) in pending.iter_mut() {
            let txs = list.flatten();
            for pair in txs.windows(2) {
                assert_eq!(
                    pair[1].nonce(),
                    pair[0].nonce() + 1,
                    "pending nonces must be contiguous"
                );
            }
            for tx in &txs {
                assert!(union.insert(tx.hash()), "hash pooled twice");
                assert!(nonces.insert((*addr, tx.nonce())), "duplicate (sender, nonce)");
            }
        }
        for (addr, list) in queued.iter_mut() {
            for tx in &list.flatten() {
                assert!(union.insert(tx.hash()), "hash pooled twice");
                assert!(nonces.insert((*addr, tx.nonce())), "duplicate (sender, nonce)");
            }
        }

        assert_eq!(union.len(), all.len(), "lookup map out of sync");
        for hash in union {
            assert!(all.contains_key(&hash), "listed transaction missing from lookup");
        }
    }

    // ==================== Validation ====================

    #[tokio::test]
    async fn duplicate_submission_is_rejected_as_known() {
        let (pool, _chain, state) = new_pool(config());
        let key = funded_key(&state, 1_000);

        let tx = signed_tx(&signer(), &key, 0, 1);
        pool.add_remote(tx.clone()).unwrap();

        assert_eq!(
            pool.add_remote(tx.clone()),
            Err(PoolError::KnownTransaction(tx.hash()))
        );
        assert_eq!(pool.stats(), (1, 0));
    }

    #[tokio::test]
    async fn oversized_transaction_is_rejected() {
        let (pool, _chain, state) = new_pool(config());
        let key = funded_key(&state, 1_000);

        let tx = signed_tx_with_payload(&signer(), &key, 0, 1, &vec![0u8; 33 * 1024]);
        assert_eq!(pool.add_remote(tx), Err(PoolError::OversizedData));
        assert_eq!(pool.counters().invalid, 1);
    }

    #[tokio::test]
    async fn missing_amount_is_rejected() {
        let (pool, _chain, state) = new_pool(config());
        let key = funded_key(&state, 1_000);

        let unsigned = Transaction::new(0, None, None, b"");
        let tx = Arc::new(signer().sign(&unsigned, &key).unwrap());
        assert_eq!(pool.add_remote(tx), Err(PoolError::NilAmount));
    }

    #[tokio::test]
    async fn negative_amount_is_rejected() {
        let (pool, _chain, state) = new_pool(config());
        let key = funded_key(&state, 1_000);

        let unsigned = Transaction::new(0, None, BigInt::from(-1), b"");
        let tx = Arc::new(signer().sign(&unsigned, &key).unwrap());
        assert_eq!(pool.add_remote(tx), Err(PoolError::NegativeValue));
    }

    #[tokio::test]
    async fn unsigned_transaction_is_rejected() {
        let (pool, _chain, _state) = new_pool(config());

        let tx = Arc::new(Transaction::new(0, None, BigInt::from(1), b""));
        assert_eq!(pool.add_remote(tx), Err(PoolError::InvalidSender));
    }

    #[tokio::test]
    async fn foreign_chain_signature_is_rejected() {
        let (pool, _chain, state) = new_pool(config());
        let key = funded_key(&state, 1_000);

        let foreign = Signer::new(CHAIN_ID + 1);
        let tx = signed_tx(&foreign, &key, 0, 1);
        assert_eq!(pool.add_remote(tx), Err(PoolError::InvalidSender));
    }

    #[tokio::test]
    async fn stale_nonce_is_rejected() {
        let (pool, _chain, state) = new_pool(config());
        let key = funded_key(&state, 1_000);
        state.set_nonce(key.address(), 10);

        let tx = signed_tx(&signer(), &key, 9, 1);
        assert_eq!(pool.add_remote(tx), Err(PoolError::NonceTooLow));
        assert_eq!(pool.stats(), (0, 0));
    }

    #[tokio::test]
    async fn unpayable_transaction_is_rejected() {
        let (pool, _chain, state) = new_pool(config());
        let key = funded_key(&state, 5);

        let tx = signed_tx(&signer(), &key, 0, 10);
        assert_eq!(pool.add_remote(tx), Err(PoolError::InsufficientFunds));
    }

    #[tokio::test]
    async fn full_pool_rejects_admission() {
        let mut cfg = config();
        cfg.global_slots = 1;
        cfg.global_queue = 1;
        let (pool, _chain, state) = new_pool(cfg);
        let signer = signer();

        for _ in 0..2 {
            let key = funded_key(&state, 1_000);
            pool.add_remote(signed_tx(&signer, &key, 0, 1)).unwrap();
        }
        let key = funded_key(&state, 1_000);
        assert_eq!(
            pool.add_remote(signed_tx(&signer, &key, 0, 1)),
            Err(PoolError::PoolFull)
        );
    }

    // ==================== Promotion ====================

    #[tokio::test]
    async fn gap_fill_promotes_contiguous_run() {
        let (pool, _chain, state) = new_pool(config());
        let signer = signer();
        let key = funded_key(&state, 1_000);
        state.set_nonce(key.address(), 5);

        pool.add_remote(signed_tx(&signer, &key, 6, 1)).unwrap();
        pool.add_remote(signed_tx(&signer, &key, 7, 1)).unwrap();
        assert_eq!(pool.stats(), (0, 2));

        pool.add_remote(signed_tx(&signer, &key, 5, 1)).unwrap();
        assert_eq!(pool.stats(), (3, 0));
        assert_eq!(pool.pending_nonce(&key.address()), 8);

        let pending = pool.pending();
        let nonces: Vec<u64> = pending[&key.address()].iter().map(|tx| tx.nonce()).collect();
        assert_eq!(nonces, vec![5, 6, 7]);
        assert_invariants(&pool);
    }

    #[tokio::test]
    async fn nonce_gap_keeps_transaction_queued() {
        let (pool, _chain, state) = new_pool(config());
        let key = funded_key(&state, 1_000);

        let tx = signed_tx(&signer(), &key, 3, 1);
        pool.add_remote(tx.clone()).unwrap();

        assert_eq!(pool.stats(), (0, 1));
        assert_eq!(pool.status(&[tx.hash()]), vec![TxStatus::Queued]);
    }

    #[tokio::test]
    async fn replacement_of_pending_keeps_latest_and_emits_one_extra_event() {
        let (pool, _chain, state) = new_pool(config());
        let signer = signer();
        let key = funded_key(&state, 1_000);
        let mut events = pool.subscribe();

        let first = signed_tx_with_payload(&signer, &key, 0, 1, b"first");
        let second = signed_tx_with_payload(&signer, &key, 0, 1, b"second");

        pool.add_remote(first.clone()).unwrap();
        pool.add_remote(second.clone()).unwrap();

        assert_eq!(pool.stats(), (1, 0));
        assert!(pool.get(first.hash()).is_none());
        assert!(pool.get(second.hash()).is_some());

        // One event for the initial promotion plus one for the
        // replacement; dispatch happens on background tasks.
        let mut seen = HashSet::new();
        for _ in 0..2 {
            let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
                .await
                .expect("event feed timed out")
                .expect("event feed closed");
            seen.insert(event.tx.hash());
        }
        assert_eq!(seen, HashSet::from([first.hash(), second.hash()]));
        tokio::task::yield_now().await;
        assert!(events.try_recv().is_err());
        assert_invariants(&pool);
    }

    #[tokio::test]
    async fn queued_replacement_keeps_latest() {
        let (pool, _chain, state) = new_pool(config());
        let signer = signer();
        let key = funded_key(&state, 1_000);

        let first = signed_tx_with_payload(&signer, &key, 4, 1, b"first");
        let second = signed_tx_with_payload(&signer, &key, 4, 1, b"second");

        pool.add_remote(first.clone()).unwrap();
        pool.add_remote(second.clone()).unwrap();

        assert_eq!(pool.stats(), (0, 1));
        assert!(pool.get(first.hash()).is_none());
        assert!(pool.get(second.hash()).is_some());
        assert_invariants(&pool);
    }

    #[tokio::test]
    async fn per_account_queue_cap_trims_non_locals() {
        let mut cfg = config();
        cfg.account_queue = 2;
        let (pool, _chain, state) = new_pool(cfg);
        let signer = signer();

        let remote = funded_key(&state, 1_000);
        for nonce in 1..=4 {
            let _ = pool.add_remote(signed_tx(&signer, &remote, nonce, 1));
        }
        assert_eq!(pool.stats(), (0, 2));
        assert_eq!(pool.counters().queued_ratelimit, 2);

        let local = funded_key(&state, 1_000);
        for nonce in 1..=4 {
            pool.add_local(signed_tx(&signer, &local, nonce, 1)).unwrap();
        }
        let (_, queued) = pool.content();
        assert_eq!(queued[&local.address()].len(), 4);
    }

    // ==================== Status and lookups ====================

    #[tokio::test]
    async fn status_reports_the_tier_of_each_hash() {
        let (pool, _chain, state) = new_pool(config());
        let signer = signer();
        let key = funded_key(&state, 1_000);

        let executable = signed_tx(&signer, &key, 0, 1);
        let future = signed_tx(&signer, &key, 5, 1);
        pool.add_remote(executable.clone()).unwrap();
        pool.add_remote(future.clone()).unwrap();

        assert_eq!(
            pool.status(&[executable.hash(), future.hash(), Hash::zero()]),
            vec![TxStatus::Pending, TxStatus::Queued, TxStatus::Unknown]
        );
        assert!(pool.get(executable.hash()).is_some());
        assert!(pool.get(Hash::zero()).is_none());
    }

    #[tokio::test]
    async fn local_flag_follows_the_sender() {
        let (pool, _chain, state) = new_pool(config());
        let signer = signer();
        let local = funded_key(&state, 1_000);
        let remote = funded_key(&state, 1_000);

        pool.add_local(signed_tx(&signer, &local, 0, 1)).unwrap();
        pool.add_remote(signed_tx(&signer, &remote, 0, 1)).unwrap();

        assert!(pool.is_local(&signed_tx(&signer, &local, 1, 1)));
        assert!(!pool.is_local(&signed_tx(&signer, &remote, 1, 1)));
    }

    #[tokio::test]
    async fn batch_admission_returns_parallel_results() {
        let (pool, _chain, state) = new_pool(config());
        let signer = signer();
        let key = funded_key(&state, 1_000);
        state.set_nonce(key.address(), 5);

        let good = signed_tx(&signer, &key, 5, 1);
        let stale = signed_tx(&signer, &key, 2, 1);
        let follow_up = signed_tx(&signer, &key, 6, 1);

        let results = pool.add_remotes(vec![good, stale, follow_up]);
        assert_eq!(
            results,
            vec![Ok(()), Err(PoolError::NonceTooLow), Ok(())]
        );
        assert_eq!(pool.stats(), (2, 0));
    }

    // ==================== Capacity enforcement ====================

    #[tokio::test]
    async fn pending_cap_equalizes_spamming_accounts() {
        let mut cfg = config();
        cfg.account_slots = 1;
        cfg.global_slots = 2;
        let (pool, _chain, state) = new_pool(cfg);
        let signer = signer();

        let mut batch = Vec::new();
        let mut keys = Vec::new();
        for _ in 0..2 {
            let key = funded_key(&state, 1_000);
            for nonce in 0..3 {
                batch.push(signed_tx(&signer, &key, nonce, 1));
            }
            keys.push(key);
        }

        let results = pool.add_remotes(batch);
        assert!(results.iter().all(|r| r.is_ok()));

        let (pending, _) = pool.stats();
        assert_eq!(pending, 2);
        assert_eq!(pool.counters().pending_ratelimit, 4);
        // Both accounts kept their lowest nonce and had the virtual nonce
        // rolled back.
        for key in &keys {
            assert_eq!(pool.pending_nonce(&key.address()), 1);
        }
        assert_invariants(&pool);
    }

    #[tokio::test]
    async fn pending_cap_spares_local_accounts() {
        let mut cfg = config();
        cfg.account_slots = 1;
        cfg.global_slots = 2;
        let (pool, _chain, state) = new_pool(cfg);
        let signer = signer();

        let key = funded_key(&state, 1_000);
        let batch = (0..3).map(|n| signed_tx(&signer, &key, n, 1)).collect();
        let results = pool.add_locals(batch);
        assert!(results.iter().all(|r| r.is_ok()));

        // Over the global cap, but the only over-allowance account is local.
        assert_eq!(pool.stats(), (3, 0));
        assert_eq!(pool.counters().pending_ratelimit, 0);
    }

    #[tokio::test]
    async fn queue_cap_drops_oldest_heartbeat_first() {
        let mut cfg = config();
        cfg.global_queue = 2;
        let (pool, _chain, state) = new_pool(cfg);
        let signer = signer();

        let mut txs = Vec::new();
        for _ in 0..3 {
            let key = funded_key(&state, 1_000);
            let tx = signed_tx(&signer, &key, 5, 1); // gapped, stays queued
            pool.add_remote(tx.clone()).unwrap();
            txs.push(tx);
            std::thread::sleep(Duration::from_millis(2));
        }

        // The third submission pushed the queue over the cap: the account
        // with the oldest heartbeat lost its entry.
        assert_eq!(pool.stats(), (0, 2));
        assert!(pool.get(txs[0].hash()).is_none());
        assert!(pool.get(txs[1].hash()).is_some());
        assert!(pool.get(txs[2].hash()).is_some());
        assert_invariants(&pool);
    }

    #[tokio::test]
    async fn queue_cap_never_drops_locals() {
        let mut cfg = config();
        cfg.global_queue = 1;
        let (pool, _chain, state) = new_pool(cfg);
        let signer = signer();

        let local = funded_key(&state, 1_000);
        pool.add_local(signed_tx(&signer, &local, 5, 1)).unwrap();
        std::thread::sleep(Duration::from_millis(2));

        let remote = funded_key(&state, 1_000);
        let remote_tx = signed_tx(&signer, &remote, 5, 1);
        pool.add_remote(remote_tx.clone()).unwrap();

        // Only the remote entry is eligible, despite the local being older.
        assert!(pool.get(remote_tx.hash()).is_none());
        let (_, queued) = pool.content();
        assert_eq!(queued[&local.address()].len(), 1);
    }

    // ==================== Eviction ====================

    #[tokio::test]
    async fn idle_eviction_skips_local_accounts() {
        let mut cfg = config();
        cfg.lifetime = Duration::from_millis(1);
        let (pool, _chain, state) = new_pool(cfg);
        let signer = signer();

        let local = funded_key(&state, 1_000);
        let remote = funded_key(&state, 1_000);
        let local_tx = signed_tx(&signer, &local, 5, 1);
        let remote_tx = signed_tx(&signer, &remote, 5, 1);
        pool.add_local(local_tx.clone()).unwrap();
        pool.add_remote(remote_tx.clone()).unwrap();

        std::thread::sleep(Duration::from_millis(5));
        {
            let mut inner = pool.inner.write();
            pool.evict_stale(&mut inner);
        }

        assert!(pool.get(local_tx.hash()).is_some());
        assert!(pool.get(remote_tx.hash()).is_none());
        assert_invariants(&pool);
    }

    // ==================== Chain head resets ====================

    #[tokio::test]
    async fn reset_drops_included_transactions() {
        let (pool, chain, state) = new_pool(config());
        let signer = signer();
        let key = funded_key(&state, 1_000);

        let tx = signed_tx(&signer, &key, 0, 1);
        pool.add_remote(tx.clone()).unwrap();
        assert_eq!(pool.stats(), (1, 0));

        // The next block includes the transaction and bumps the nonce.
        let state2 = TestState::new();
        state2.set_nonce(key.address(), 1);
        state2.set_balance(key.address(), BigInt::from(1_000u32));
        let genesis = chain.head();
        let child = chain.make_child(&genesis, state2, vec![tx.clone()]);

        pool.locked_reset(Some(&genesis.header), &child.header);

        assert_eq!(pool.stats(), (0, 0));
        assert!(pool.get(tx.hash()).is_none());
    }

    #[tokio::test]
    async fn reset_demotes_unpayable_tail_back_to_queue() {
        let (pool, chain, state) = new_pool(config());
        let signer = signer();
        let key = funded_key(&state, 1_000);

        for (nonce, amount) in [(0u64, 40u64), (1, 60), (2, 10)] {
            pool.add_remote(signed_tx(&signer, &key, nonce, amount)).unwrap();
        }
        assert_eq!(pool.stats(), (3, 0));

        // The balance shrinks below the middle transaction's cost.
        let state2 = TestState::new();
        state2.set_balance(key.address(), BigInt::from(50u32));
        let genesis = chain.head();
        let child = chain.make_child(&genesis, state2, Vec::new());

        pool.locked_reset(Some(&genesis.header), &child.header);

        // The unpayable middle is gone, the tail is queued again.
        assert_eq!(pool.stats(), (1, 1));
        assert_eq!(pool.counters().pending_nofunds, 1);
        assert_eq!(pool.pending_nonce(&key.address()), 1);
        assert_invariants(&pool);
    }

    #[tokio::test]
    async fn reorg_reinjects_transactions_dropped_from_old_branch() {
        let (pool, chain, state) = new_pool(config());
        let signer = signer();

        let keys: Vec<PrivateKey> = (0..3).map(|_| funded_key(&state, 1_000)).collect();
        let tx_a = signed_tx(&signer, &keys[0], 0, 1);
        let tx_b = signed_tx(&signer, &keys[1], 0, 1);
        let tx_c = signed_tx(&signer, &keys[2], 0, 1);

        let genesis = chain.head();
        let old_head = chain.make_child(&genesis, state.clone(), vec![tx_a.clone(), tx_b.clone()]);
        let new_head = chain.make_child(&genesis, state.clone(), vec![tx_b.clone(), tx_c.clone()]);

        pool.locked_reset(Some(&old_head.header), &new_head.header);

        // Only the transaction exclusive to the abandoned branch returns.
        assert!(pool.get(tx_a.hash()).is_some());
        assert!(pool.get(tx_b.hash()).is_none());
        assert!(pool.get(tx_c.hash()).is_none());
        assert_eq!(pool.status(&[tx_a.hash()]), vec![TxStatus::Pending]);
        assert_invariants(&pool);
    }

    #[tokio::test]
    async fn deep_reorg_is_skipped_but_state_still_reloads() {
        let (pool, chain, state) = new_pool(config());
        let signer = signer();
        let key = funded_key(&state, 1_000);
        let tx = signed_tx(&signer, &key, 0, 1);

        // Build a far-away head that is not parent-linked to the old one.
        let genesis = chain.head();
        let mut head = genesis.clone();
        for _ in 0..(MAX_REORG_DEPTH + 2) {
            head = chain.make_child(&head, state.clone(), Vec::new());
        }
        let old_branch = chain.make_child(&genesis, state.clone(), vec![tx.clone()]);

        pool.locked_reset(Some(&old_branch.header), &head.header);

        // No reinjection happened, but the pool tracks the new state.
        assert!(pool.get(tx.hash()).is_none());
        assert_eq!(pool.stats(), (0, 0));
    }

    #[tokio::test]
    async fn reset_aborts_on_missing_state() {
        let (pool, chain, state) = new_pool(config());
        let signer = signer();
        let key = funded_key(&state, 1_000);
        pool.add_remote(signed_tx(&signer, &key, 0, 1)).unwrap();

        // A header whose state root was never registered.
        let orphan = Header::new(1, chain.head().hash(), Hash::zero(), 99);
        pool.locked_reset(Some(&chain.head().header), &orphan);

        // The reset aborted without touching the pool.
        assert_eq!(pool.stats(), (1, 0));
    }

    // ==================== Event loop ====================

    #[tokio::test]
    async fn chain_head_events_drive_the_pool() {
        let (pool, chain, state) = new_pool(config());
        let signer = signer();
        let key = funded_key(&state, 1_000);

        let tx = signed_tx(&signer, &key, 0, 1);
        pool.add_remote(tx.clone()).unwrap();
        assert_eq!(pool.stats(), (1, 0));

        let state2 = TestState::new();
        state2.set_nonce(key.address(), 1);
        state2.set_balance(key.address(), BigInt::from(1_000u32));
        let child = chain.make_child(&chain.head(), state2, vec![tx.clone()]);
        chain.announce(child).await;

        for _ in 0..200 {
            if pool.stats() == (0, 0) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(pool.stats(), (0, 0));
        pool.stop().await;
    }

    #[tokio::test]
    async fn stop_terminates_the_event_loop() {
        let (pool, _chain, _state) = new_pool(config());
        pool.stop().await;
        assert!(pool.loop_handle.lock().is_none());
        // A second stop is a no-op.
        pool.stop().await;
    }

    // ==================== Journal ====================

    #[tokio::test]
    async fn journal_restores_local_transactions_across_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config();
        cfg.journal = Some(dir.path().join("transactions.msgp"));

        let (chain, state) = TestChain::new();
        let signer = signer();
        let key = funded_key(&state, 1_000);
        let tx = signed_tx(&signer, &key, 0, 1);

        let pool = TxPool::new(cfg.clone(), CHAIN_ID, chain.clone()).unwrap();
        pool.add_local(tx.clone()).unwrap();
        pool.stop().await;

        let restarted = TxPool::new(cfg, CHAIN_ID, chain).unwrap();
        assert!(restarted.get(tx.hash()).is_some());
        assert!(restarted.is_local(&tx));
        restarted.stop().await;
    }

    #[tokio::test]
    async fn no_locals_disables_journaling() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transactions.msgp");
        let mut cfg = config();
        cfg.journal = Some(path.clone());
        cfg.no_locals = true;

        let (chain, state) = TestChain::new();
        let key = funded_key(&state, 1_000);

        let pool = TxPool::new(cfg, CHAIN_ID, chain).unwrap();
        pool.add_local(signed_tx(&signer(), &key, 0, 1)).unwrap();
        pool.stop().await;

        assert!(!path.exists());
    }

    #[tokio::test]
    async fn rejournal_interval_is_sanitized() {
        let mut cfg = config();
        cfg.rejournal = Duration::from_millis(10);
        let (pool, _chain, _state) = new_pool(cfg);
        assert_eq!(pool.config.rejournal, Duration::from_secs(1));
    }
}
