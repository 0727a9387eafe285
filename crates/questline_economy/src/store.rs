//! # Economy Store
//!
//! The backing tables shared by the ledger, claims and inventory, plus the
//! unit of work that makes a multi-table change atomic.
//!
//! ## Locking
//!
//! ```text
//! user_id ──crc32──> shard index ──> Mutex<Shard>
//!                                      ├─ accounts      (cached balances)
//!                                      ├─ transactions  (append-only logs)
//!                                      ├─ claims        (unique keys)
//!                                      └─ inventory     (user, item) -> qty
//! ```
//!
//! A unit of work is scoped to one user and holds that user's shard lock
//! from `begin` to `commit`/`rollback`. Operations for one user serialize;
//! users on different shards proceed in parallel. There are no cross-user
//! operations, so a unit of work never takes a second shard lock.
//!
//! ## Commit protocol
//!
//! 1. Changes apply to the shard as they are made, each with an undo entry
//! 2. `commit()` appends all changes as one WAL record
//! 3. If the WAL write fails, the undo entries are replayed in reverse
//!
//! Dropping an uncommitted unit of work rolls it back.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::claims::{ClaimKey, ClaimTracker};
use crate::config::StorageConfig;
use crate::error::EconomyResult;
use crate::inventory::InventoryStore;
use crate::ledger::{LedgerStore, Transaction};
use crate::types::{ItemId, TransactionId, UserId};
use crate::wal::{WalOperation, WriteAheadLog};

/// Tables for the users hashed onto one shard.
#[derive(Debug, Default)]
pub(crate) struct Shard {
    accounts: HashMap<UserId, i64>,
    transactions: HashMap<UserId, Vec<Transaction>>,
    claims: HashSet<ClaimKey>,
    inventory: HashMap<UserId, BTreeMap<ItemId, u64>>,
}

/// How to reverse one applied operation.
#[derive(Debug)]
enum Undo {
    Transaction { user_id: UserId, amount: i64 },
    Claim(ClaimKey),
    Quantity { user_id: UserId, item_id: ItemId, previous: Option<u64> },
}

impl Shard {
    pub(crate) fn balance(&self, user_id: &str) -> i64 {
        self.accounts.get(user_id).copied().unwrap_or(0)
    }

    pub(crate) fn transactions(&self, user_id: &str) -> &[Transaction] {
        self.transactions.get(user_id).map_or(&[], Vec::as_slice)
    }

    pub(crate) fn last_transaction(&self, user_id: &str) -> Option<&Transaction> {
        self.transactions(user_id).last()
    }

    pub(crate) fn has_claim(&self, key: &ClaimKey) -> bool {
        self.claims.contains(key)
    }

    pub(crate) fn quantity(&self, user_id: &str, item_id: &str) -> u64 {
        self.inventory
            .get(user_id)
            .and_then(|items| items.get(item_id))
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn quantities(&self, user_id: &str) -> BTreeMap<ItemId, u64> {
        self.inventory.get(user_id).cloned().unwrap_or_default()
    }

    /// Applies one operation. Live commits and WAL replay share this path.
    fn apply(&mut self, op: &WalOperation) -> Undo {
        match op {
            WalOperation::AppendTransaction(tx) => {
                let balance = self.accounts.entry(tx.user_id.clone()).or_insert(0);
                *balance = balance.saturating_add(tx.amount);
                self.transactions
                    .entry(tx.user_id.clone())
                    .or_default()
                    .push(tx.clone());
                Undo::Transaction {
                    user_id: tx.user_id.clone(),
                    amount: tx.amount,
                }
            }
            WalOperation::InsertClaim(key) => {
                self.claims.insert(key.clone());
                Undo::Claim(key.clone())
            }
            WalOperation::SetQuantity { user_id, item_id, quantity, .. } => {
                let previous = self
                    .inventory
                    .entry(user_id.clone())
                    .or_default()
                    .insert(item_id.clone(), *quantity);
                Undo::Quantity {
                    user_id: user_id.clone(),
                    item_id: item_id.clone(),
                    previous,
                }
            }
        }
    }

    fn undo(&mut self, undo: Undo) {
        match undo {
            Undo::Transaction { user_id, amount } => {
                if let Some(log) = self.transactions.get_mut(&user_id) {
                    log.pop();
                }
                if let Some(balance) = self.accounts.get_mut(&user_id) {
                    *balance = balance.saturating_sub(amount);
                }
            }
            Undo::Claim(key) => {
                self.claims.remove(&key);
            }
            Undo::Quantity { user_id, item_id, previous } => {
                if let Some(items) = self.inventory.get_mut(&user_id) {
                    match previous {
                        Some(quantity) => {
                            items.insert(item_id, quantity);
                        }
                        None => {
                            items.remove(&item_id);
                        }
                    }
                }
            }
        }
    }
}

/// The tables of the economy, optionally backed by a write-ahead log.
///
/// `EconomyStore` is `Send + Sync`; share it behind an `Arc` or a reference.
pub struct EconomyStore {
    shards: Box<[Mutex<Shard>]>,
    wal: Option<WriteAheadLog>,
    next_transaction_id: AtomicU64,
}

impl std::fmt::Debug for EconomyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EconomyStore")
            .field("shards", &self.shards.len())
            .field("wal", &self.wal)
            .finish_non_exhaustive()
    }
}

impl EconomyStore {
    /// Creates a volatile store. Nothing survives the process.
    #[must_use]
    pub fn in_memory(shard_count: usize) -> Self {
        Self {
            shards: Self::empty_shards(shard_count),
            wal: None,
            next_transaction_id: AtomicU64::new(1),
        }
    }

    /// Opens the store described by `config`, replaying its WAL if it has one.
    ///
    /// # Errors
    ///
    /// Returns `Persistence` if the WAL cannot be opened or recovered.
    pub fn open(config: &StorageConfig) -> EconomyResult<Self> {
        let Some(path) = &config.wal_path else {
            return Ok(Self::in_memory(config.shard_count));
        };

        let (wal, commits) = WriteAheadLog::open(path, config.sync_on_commit)?;
        let store = Self {
            shards: Self::empty_shards(config.shard_count),
            wal: Some(wal),
            next_transaction_id: AtomicU64::new(1),
        };

        let mut max_id: TransactionId = 0;
        let mut replayed_ops = 0usize;
        for commit in &commits {
            for op in &commit.operations {
                if let WalOperation::AppendTransaction(tx) = op {
                    max_id = max_id.max(tx.id);
                }
                store.shard(op.user_id()).lock().apply(op);
                replayed_ops += 1;
            }
        }
        store.next_transaction_id.store(max_id + 1, Ordering::SeqCst);

        tracing::info!(
            commits = commits.len(),
            operations = replayed_ops,
            next_transaction_id = max_id + 1,
            "economy store recovered"
        );

        Ok(store)
    }

    fn empty_shards(count: usize) -> Box<[Mutex<Shard>]> {
        (0..count.max(1)).map(|_| Mutex::new(Shard::default())).collect()
    }

    fn shard(&self, user_id: &str) -> &Mutex<Shard> {
        let index = crc32fast::hash(user_id.as_bytes()) as usize % self.shards.len();
        &self.shards[index]
    }

    /// Returns true if commits are written to a WAL.
    #[must_use]
    pub const fn is_durable(&self) -> bool {
        self.wal.is_some()
    }

    /// Ledger reads and single-row appends.
    #[must_use]
    pub const fn ledger(&self) -> LedgerStore<'_> {
        LedgerStore::new(self)
    }

    /// Inventory reads and single-item writes.
    #[must_use]
    pub const fn inventory(&self) -> InventoryStore<'_> {
        InventoryStore::new(self)
    }

    /// Claim lookups and single claims.
    #[must_use]
    pub const fn claims(&self) -> ClaimTracker<'_> {
        ClaimTracker::new(self)
    }

    /// Opens a unit of work for one user. Blocks while another unit of work
    /// for a user on the same shard is open.
    #[must_use]
    pub fn begin(&self, user_id: &str) -> UnitOfWork<'_> {
        UnitOfWork {
            store: self,
            user_id: user_id.to_string(),
            shard: self.shard(user_id).lock(),
            ops: Vec::new(),
            undo: Vec::new(),
            finished: false,
        }
    }

    /// Runs `f` in a unit of work: commits on `Ok`, rolls back on `Err`.
    ///
    /// # Errors
    ///
    /// Returns the error of `f`, or `Persistence` if the commit fails.
    pub fn unit_of_work<T>(
        &self,
        user_id: &str,
        f: impl FnOnce(&mut UnitOfWork<'_>) -> EconomyResult<T>,
    ) -> EconomyResult<T> {
        let mut uow = self.begin(user_id);
        match f(&mut uow) {
            Ok(value) => {
                uow.commit()?;
                Ok(value)
            }
            Err(e) => {
                uow.rollback();
                Err(e)
            }
        }
    }

    /// Runs a read against a user's shard.
    pub(crate) fn with_shard<T>(&self, user_id: &str, f: impl FnOnce(&Shard) -> T) -> T {
        f(&self.shard(user_id).lock())
    }

    #[cfg(test)]
    pub(crate) fn wal(&self) -> Option<&WriteAheadLog> {
        self.wal.as_ref()
    }

    pub(crate) fn next_transaction_id(&self) -> TransactionId {
        self.next_transaction_id.fetch_add(1, Ordering::SeqCst)
    }
}

/// An open, single-user atomic change to the store.
///
/// Reads through a unit of work see its own uncommitted writes. Other
/// readers of the same shard wait until it finishes, so they never see a
/// partial change.
pub struct UnitOfWork<'s> {
    store: &'s EconomyStore,
    user_id: UserId,
    shard: MutexGuard<'s, Shard>,
    ops: Vec<WalOperation>,
    undo: Vec<Undo>,
    finished: bool,
}

impl<'s> UnitOfWork<'s> {
    /// The user this unit of work is scoped to.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Number of row changes made so far.
    #[must_use]
    pub fn pending_operations(&self) -> usize {
        self.ops.len()
    }

    pub(crate) fn store(&self) -> &'s EconomyStore {
        self.store
    }

    pub(crate) fn shard(&self) -> &Shard {
        &self.shard
    }

    pub(crate) fn apply(&mut self, op: WalOperation) {
        debug_assert_eq!(op.user_id(), self.user_id);
        let undo = self.shard.apply(&op);
        self.undo.push(undo);
        self.ops.push(op);
    }

    /// Makes every change durable and visible. Returns the WAL LSN, or
    /// `None` for an in-memory store or an empty unit of work.
    ///
    /// # Errors
    ///
    /// Returns `Persistence` if the WAL write fails; the unit of work is
    /// then rolled back.
    pub fn commit(mut self) -> EconomyResult<Option<u64>> {
        let store = self.store;
        let lsn = match (&store.wal, self.ops.is_empty()) {
            (Some(wal), false) => match wal.append_commit(&self.ops) {
                Ok(lsn) => Some(lsn),
                Err(e) => {
                    tracing::warn!(user_id = %self.user_id, error = %e, "commit failed, rolling back");
                    self.undo_all();
                    self.finished = true;
                    return Err(e);
                }
            },
            _ => None,
        };
        self.finished = true;
        Ok(lsn)
    }

    /// Discards every change.
    pub fn rollback(mut self) {
        self.undo_all();
        self.finished = true;
    }

    fn undo_all(&mut self) {
        while let Some(undo) = self.undo.pop() {
            self.shard.undo(undo);
        }
        self.ops.clear();
    }
}

impl Drop for UnitOfWork<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.undo_all();
        }
    }
}
