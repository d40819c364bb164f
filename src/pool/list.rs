//! Per-account nonce-ordered transaction list.

use crate::core::transaction::Transaction;
use num_bigint::BigInt;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Nonce-sorted transaction storage with a cached flattened view.
///
/// The cache is invalidated on every mutation and rebuilt lazily, so
/// repeated snapshots between changes stay cheap.
#[derive(Debug, Default)]
struct TxSortedMap {
    items: BTreeMap<u64, Arc<Transaction>>,
    cache: Option<Vec<Arc<Transaction>>>,
}

impl TxSortedMap {
    fn get(&self, nonce: u64) -> Option<&Arc<Transaction>> {
        self.items.get(&nonce)
    }

    fn put(&mut self, tx: Arc<Transaction>) -> Option<Arc<Transaction>> {
        self.cache = None;
        self.items.insert(tx.nonce(), tx)
    }

    fn remove(&mut self, nonce: u64) -> bool {
        let removed = self.items.remove(&nonce).is_some();
        if removed {
            self.cache = None;
        }
        removed
    }

    /// Removes and returns every transaction with a nonce below the
    /// threshold.
    fn forward(&mut self, threshold: u64) -> Vec<Arc<Transaction>> {
        let kept = self.items.split_off(&threshold);
        let removed = std::mem::replace(&mut self.items, kept);
        if !removed.is_empty() {
            self.cache = None;
        }
        removed.into_values().collect()
    }

    /// Removes and returns every transaction matching the predicate.
    fn filter(&mut self, mut drop: impl FnMut(&Transaction) -> bool) -> Vec<Arc<Transaction>> {
        let mut removed = Vec::new();
        self.items.retain(|_, tx| {
            if drop(tx) {
                removed.push(tx.clone());
                false
            } else {
                true
            }
        });
        if !removed.is_empty() {
            self.cache = None;
        }
        removed
    }

    /// Removes and returns the contiguous run of transactions starting at
    /// the lowest stored nonce, provided that nonce is not above `start`.
    fn ready(&mut self, start: u64) -> Vec<Arc<Transaction>> {
        let mut next = match self.items.first_key_value() {
            Some((&first, _)) if first <= start => first,
            _ => return Vec::new(),
        };

        let mut ready = Vec::new();
        while let Some(tx) = self.items.remove(&next) {
            ready.push(tx);
            next += 1;
        }
        self.cache = None;
        ready
    }

    /// Trims the map down to the `threshold` lowest nonces, returning the
    /// removed overflow.
    fn cap(&mut self, threshold: usize) -> Vec<Arc<Transaction>> {
        if self.items.len() <= threshold {
            return Vec::new();
        }
        let mut removed = Vec::new();
        while self.items.len() > threshold {
            match self.items.pop_last() {
                Some((_, tx)) => removed.push(tx),
                None => break,
            }
        }
        removed.reverse();
        self.cache = None;
        removed
    }

    fn flatten(&mut self) -> Vec<Arc<Transaction>> {
        if self.cache.is_none() {
            self.cache = Some(self.items.values().cloned().collect());
        }
        self.cache.clone().unwrap_or_default()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// Per-account list of transactions keyed by nonce.
///
/// Pending lists are *strict*: they hold a gapless run of executable
/// transactions, so removing one invalidates everything queued behind it.
/// Queued lists tolerate gaps.
#[derive(Debug)]
pub(crate) struct TxList {
    strict: bool,
    txs: TxSortedMap,
}

impl TxList {
    pub(crate) fn new(strict: bool) -> Self {
        TxList {
            strict,
            txs: TxSortedMap::default(),
        }
    }

    /// Returns true if a transaction already occupies the given nonce.
    pub(crate) fn overlaps(&self, tx: &Transaction) -> bool {
        self.txs.get(tx.nonce()).is_some()
    }

    /// Inserts the transaction at its nonce, displacing any occupant.
    ///
    /// Without a fee market every replacement is accepted, so the insert
    /// always succeeds; the displaced transaction is returned for cleanup.
    pub(crate) fn add(&mut self, tx: Arc<Transaction>) -> (bool, Option<Arc<Transaction>>) {
        let old = self.txs.put(tx);
        (true, old)
    }

    /// Removes and returns every transaction with `nonce < threshold`.
    pub(crate) fn forward(&mut self, threshold: u64) -> Vec<Arc<Transaction>> {
        self.txs.forward(threshold)
    }

    /// Removes every transaction the balance can no longer cover.
    ///
    /// Returns the unpayable drops and, for strict lists, the transactions
    /// queued behind the lowest dropped nonce so the caller can re-queue
    /// them.
    pub(crate) fn filter(
        &mut self,
        balance: &BigInt,
    ) -> (Vec<Arc<Transaction>>, Vec<Arc<Transaction>>) {
        let drops = self.txs.filter(|tx| tx.cost() > *balance);
        if !self.strict || drops.is_empty() {
            return (drops, Vec::new());
        }

        let lowest = drops.iter().map(|tx| tx.nonce()).min().unwrap_or(u64::MAX);
        let invalids = self.txs.filter(|tx| tx.nonce() > lowest);
        (drops, invalids)
    }

    /// Removes and returns the contiguous executable prefix starting at
    /// `start`.
    pub(crate) fn ready(&mut self, start: u64) -> Vec<Arc<Transaction>> {
        self.txs.ready(start)
    }

    /// Trims the list to the `threshold` lowest nonces, returning the
    /// overflow.
    pub(crate) fn cap(&mut self, threshold: usize) -> Vec<Arc<Transaction>> {
        self.txs.cap(threshold)
    }

    /// Removes the transaction at the given transaction's nonce.
    ///
    /// For strict lists every transaction behind the removed nonce is
    /// returned as invalidated.
    pub(crate) fn remove(&mut self, tx: &Transaction) -> (bool, Vec<Arc<Transaction>>) {
        let nonce = tx.nonce();
        if !self.txs.remove(nonce) {
            return (false, Vec::new());
        }
        let invalids = if self.strict {
            self.txs.filter(|t| t.nonce() > nonce)
        } else {
            Vec::new()
        };
        (true, invalids)
    }

    pub(crate) fn get(&self, nonce: u64) -> Option<&Arc<Transaction>> {
        self.txs.get(nonce)
    }

    /// Returns a nonce-sorted copy of the list contents.
    pub(crate) fn flatten(&mut self) -> Vec<Arc<Transaction>> {
        self.txs.flatten()
    }

    pub(crate) fn len(&self) -> usize {
        self.txs.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.txs.len() == 0
    }
}
