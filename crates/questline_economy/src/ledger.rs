//! # Ledger
//!
//! Append-only point transactions with a cached balance per user.
//!
//! The balance on the account row is a read cache. The transaction log is
//! the source of truth: for every user, `balance == sum(amount)` holds at
//! every observation point because both move inside the same unit of work.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::error::{EconomyError, EconomyResult};
use crate::store::{EconomyStore, UnitOfWork};
use crate::types::{SourceType, TransactionGroup, TransactionId, UserId};
use crate::wal::WalOperation;

/// Rows fetched per shard lock while iterating a transaction log.
const CURSOR_PAGE_SIZE: usize = 64;

/// An immutable ledger row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    /// Store-wide unique id, increasing in commit order.
    pub id: TransactionId,
    /// Owner of the row.
    pub user_id: UserId,
    /// Signed point delta.
    pub amount: i64,
    /// What produced this row.
    pub source_type: SourceType,
    /// Economic event this row belongs to.
    pub transaction_group: TransactionGroup,
    /// Creation time, non-decreasing within one user's log.
    pub created_at: DateTime<Utc>,
    /// Free-form audit details (task id, code, reward item).
    pub metadata: BTreeMap<String, String>,
}

/// A ledger row before the store assigns its id and timestamp.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewTransaction {
    /// Signed point delta.
    pub amount: i64,
    /// What produced this row.
    pub source_type: SourceType,
    /// Economic event this row belongs to.
    pub transaction_group: TransactionGroup,
    /// Free-form audit details.
    pub metadata: BTreeMap<String, String>,
}

impl NewTransaction {
    /// Creates a row with empty metadata.
    #[must_use]
    pub fn new(amount: i64, source_type: SourceType, transaction_group: TransactionGroup) -> Self {
        Self {
            amount,
            source_type,
            transaction_group,
            metadata: BTreeMap::new(),
        }
    }

    /// Adds one metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Narrows a transaction listing. The default matches everything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransactionFilter {
    /// Only rows of this source.
    pub source_type: Option<SourceType>,
    /// Only rows of this economic event.
    pub transaction_group: Option<TransactionGroup>,
    /// Only rows created at or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Only rows created strictly before this instant.
    pub until: Option<DateTime<Utc>>,
}

impl TransactionFilter {
    /// Matches rows of one source.
    #[must_use]
    pub fn source(source_type: SourceType) -> Self {
        Self {
            source_type: Some(source_type),
            ..Self::default()
        }
    }

    /// Matches rows of one economic event.
    #[must_use]
    pub fn group(transaction_group: TransactionGroup) -> Self {
        Self {
            transaction_group: Some(transaction_group),
            ..Self::default()
        }
    }

    /// Returns true if `tx` passes every set criterion.
    #[must_use]
    pub fn matches(&self, tx: &Transaction) -> bool {
        self.source_type.map_or(true, |s| tx.source_type == s)
            && self.transaction_group.map_or(true, |g| tx.transaction_group == g)
            && self.since.map_or(true, |t| tx.created_at >= t)
            && self.until.map_or(true, |t| tx.created_at < t)
    }
}

impl UnitOfWork<'_> {
    /// Appends a row and moves the cached balance by its amount.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the balance would overflow.
    pub fn append(&mut self, new: NewTransaction) -> EconomyResult<Transaction> {
        let balance = self.balance();
        if balance.checked_add(new.amount).is_none() {
            return Err(EconomyError::Validation(format!(
                "balance overflow: {balance} + {}",
                new.amount
            )));
        }

        let now = Utc::now();
        let created_at = self
            .shard()
            .last_transaction(self.user_id())
            .map_or(now, |last| last.created_at.max(now));

        let tx = Transaction {
            id: self.store().next_transaction_id(),
            user_id: self.user_id().to_string(),
            amount: new.amount,
            source_type: new.source_type,
            transaction_group: new.transaction_group,
            created_at,
            metadata: new.metadata,
        };

        self.apply(WalOperation::AppendTransaction(tx.clone()));
        Ok(tx)
    }

    /// Returns the cached balance, including this unit's own writes.
    #[must_use]
    pub fn balance(&self) -> i64 {
        self.shard().balance(self.user_id())
    }
}

/// Ledger access outside an engine operation.
///
/// Each write opens and commits its own unit of work.
#[derive(Clone, Copy, Debug)]
pub struct LedgerStore<'s> {
    store: &'s EconomyStore,
}

impl<'s> LedgerStore<'s> {
    pub(crate) const fn new(store: &'s EconomyStore) -> Self {
        Self { store }
    }

    /// Appends one row and applies it to the balance atomically.
    ///
    /// # Errors
    ///
    /// Returns `Persistence` if the WAL write fails (nothing is applied),
    /// or `Validation` on balance overflow.
    pub fn append(&self, user_id: &str, new: NewTransaction) -> EconomyResult<Transaction> {
        self.store.unit_of_work(user_id, |uow| uow.append(new))
    }

    /// Returns the cached balance (0 for users with no rows).
    #[must_use]
    pub fn balance(&self, user_id: &str) -> i64 {
        self.store.with_shard(user_id, |shard| shard.balance(user_id))
    }

    /// Returns a lazy, restartable, oldest-first cursor over a user's rows.
    #[must_use]
    pub fn transactions(&self, user_id: &str, filter: TransactionFilter) -> TransactionCursor<'s> {
        TransactionCursor {
            store: self.store,
            user_id: user_id.to_string(),
            filter,
            position: 0,
            page: Vec::new(),
            exhausted: false,
        }
    }

    /// Sums a user's rows straight from the log, bypassing the cache.
    #[must_use]
    pub fn recomputed_balance(&self, user_id: &str) -> i64 {
        self.transactions(user_id, TransactionFilter::default())
            .map(|tx| tx.amount)
            .sum()
    }
}

/// Oldest-first iterator over one user's transaction log.
///
/// Reads a page at a time so the shard lock is never held across `next()`
/// calls. Rows are append-only, so positions stay valid between pages and
/// rows committed after the cursor was created are picked up when reached.
#[derive(Clone, Debug)]
pub struct TransactionCursor<'s> {
    store: &'s EconomyStore,
    user_id: UserId,
    filter: TransactionFilter,
    /// Index of the next unread row in the user's log.
    position: usize,
    /// Matching rows of the current page, reversed for cheap `pop()`.
    page: Vec<Transaction>,
    exhausted: bool,
}

impl TransactionCursor<'_> {
    /// Restarts the cursor from the oldest row.
    pub fn rewind(&mut self) {
        self.position = 0;
        self.page.clear();
        self.exhausted = false;
    }

    fn fill_page(&mut self) {
        while self.page.is_empty() && !self.exhausted {
            let (rows, next, end) = self.store.with_shard(&self.user_id, |shard| {
                let log = shard.transactions(&self.user_id);
                let end = (self.position + CURSOR_PAGE_SIZE).min(log.len());
                let rows: Vec<Transaction> = log[self.position.min(end)..end]
                    .iter()
                    .filter(|tx| self.filter.matches(tx))
                    .cloned()
                    .collect();
                (rows, end, end == log.len())
            });
            self.position = next;
            self.exhausted = end;
            self.page = rows;
            self.page.reverse();
        }
    }
}

impl Iterator for TransactionCursor<'_> {
    type Item = Transaction;

    fn next(&mut self) -> Option<Transaction> {
        if self.page.is_empty() {
            self.fill_page();
        }
        self.page.pop()
    }
}
