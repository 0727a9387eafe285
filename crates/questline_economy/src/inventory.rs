//! # Inventory
//!
//! Per-user quantities of named items and materials.
//!
//! Quantities are `u64`, so a negative quantity is unrepresentable; a debit
//! that would cross zero is refused before anything is written. Batch debits
//! check every line first, which is what keeps crafting all-or-nothing.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{EconomyError, EconomyResult};
use crate::store::{EconomyStore, UnitOfWork};
use crate::types::{ItemId, TransactionGroup};
use crate::wal::WalOperation;

/// One line of a batch debit or credit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemQuantity {
    /// The item.
    pub item_id: ItemId,
    /// How many units.
    pub quantity: u64,
}

impl ItemQuantity {
    /// Creates a new line.
    #[must_use]
    pub fn new(item_id: impl Into<ItemId>, quantity: u64) -> Self {
        Self {
            item_id: item_id.into(),
            quantity,
        }
    }
}

fn positive(item_id: &str, quantity: u64) -> EconomyResult<()> {
    if quantity == 0 {
        return Err(EconomyError::InvalidQuantity {
            item_id: item_id.to_string(),
            quantity: 0,
        });
    }
    Ok(())
}

impl UnitOfWork<'_> {
    /// Returns the current quantity of one item (0 if never held).
    #[must_use]
    pub fn quantity(&self, item_id: &str) -> u64 {
        self.shard().quantity(self.user_id(), item_id)
    }

    /// Returns a snapshot of every item row the user has.
    #[must_use]
    pub fn quantities(&self) -> BTreeMap<ItemId, u64> {
        self.shard().quantities(self.user_id())
    }

    /// Adds `quantity` units of an item.
    ///
    /// # Errors
    ///
    /// - `InvalidQuantity` if `quantity` is zero
    /// - `Validation` if the quantity would overflow
    pub fn credit(&mut self, item_id: &str, quantity: u64, group: Option<TransactionGroup>) -> EconomyResult<u64> {
        positive(item_id, quantity)?;
        let current = self.quantity(item_id);
        let updated = current.checked_add(quantity).ok_or_else(|| {
            EconomyError::Validation(format!("quantity overflow for {item_id}"))
        })?;
        self.set_quantity(item_id, updated, group);
        Ok(updated)
    }

    /// Removes `quantity` units of an item.
    ///
    /// # Errors
    ///
    /// - `InvalidQuantity` if `quantity` is zero
    /// - `InsufficientInventory` if fewer than `quantity` units are held
    pub fn debit(&mut self, item_id: &str, quantity: u64, group: Option<TransactionGroup>) -> EconomyResult<u64> {
        positive(item_id, quantity)?;
        let available = self.quantity(item_id);
        if available < quantity {
            return Err(EconomyError::InsufficientInventory {
                item_id: item_id.to_string(),
                required: quantity,
                available,
            });
        }
        let updated = available - quantity;
        self.set_quantity(item_id, updated, group);
        Ok(updated)
    }

    /// Checks that every line can be debited, without writing anything.
    ///
    /// Lines naming the same item are summed before checking.
    ///
    /// # Errors
    ///
    /// Returns the first failing line, in input order.
    pub fn check_debit_all(&self, lines: &[ItemQuantity]) -> EconomyResult<()> {
        let mut required: BTreeMap<&str, u64> = BTreeMap::new();
        for line in lines {
            positive(&line.item_id, line.quantity)?;
            let total = required.entry(line.item_id.as_str()).or_insert(0);
            *total = total.saturating_add(line.quantity);
            let available = self.quantity(&line.item_id);
            if available < *total {
                return Err(EconomyError::InsufficientInventory {
                    item_id: line.item_id.clone(),
                    required: *total,
                    available,
                });
            }
        }
        Ok(())
    }

    /// Debits every line or none of them.
    ///
    /// # Errors
    ///
    /// Same as [`UnitOfWork::check_debit_all`]; nothing is written on error.
    pub fn debit_all(&mut self, lines: &[ItemQuantity], group: Option<TransactionGroup>) -> EconomyResult<()> {
        self.check_debit_all(lines)?;
        for line in lines {
            self.debit(&line.item_id, line.quantity, group)?;
        }
        Ok(())
    }

    /// Credits every line or none of them.
    ///
    /// # Errors
    ///
    /// `InvalidQuantity` for a zero line, checked before any write.
    pub fn credit_all(&mut self, lines: &[ItemQuantity], group: Option<TransactionGroup>) -> EconomyResult<()> {
        for line in lines {
            positive(&line.item_id, line.quantity)?;
        }
        for line in lines {
            self.credit(&line.item_id, line.quantity, group)?;
        }
        Ok(())
    }

    fn set_quantity(&mut self, item_id: &str, quantity: u64, group: Option<TransactionGroup>) {
        let op = WalOperation::SetQuantity {
            user_id: self.user_id().to_string(),
            item_id: item_id.to_string(),
            quantity,
            group,
        };
        self.apply(op);
    }
}

/// Inventory access outside an engine operation.
#[derive(Clone, Copy, Debug)]
pub struct InventoryStore<'s> {
    store: &'s EconomyStore,
}

impl<'s> InventoryStore<'s> {
    pub(crate) const fn new(store: &'s EconomyStore) -> Self {
        Self { store }
    }

    /// Adds units of an item in its own unit of work.
    ///
    /// # Errors
    ///
    /// `InvalidQuantity` for zero, `Persistence` on storage failure.
    pub fn credit(&self, user_id: &str, item_id: &str, quantity: u64) -> EconomyResult<u64> {
        self.store
            .unit_of_work(user_id, |uow| uow.credit(item_id, quantity, None))
    }

    /// Removes units of an item in its own unit of work.
    ///
    /// # Errors
    ///
    /// `InvalidQuantity` for zero, `InsufficientInventory` on shortfall,
    /// `Persistence` on storage failure.
    pub fn debit(&self, user_id: &str, item_id: &str, quantity: u64) -> EconomyResult<u64> {
        self.store
            .unit_of_work(user_id, |uow| uow.debit(item_id, quantity, None))
    }

    /// Returns a snapshot of `item_id -> quantity` for a user.
    #[must_use]
    pub fn quantities(&self, user_id: &str) -> BTreeMap<ItemId, u64> {
        self.store.with_shard(user_id, |shard| shard.quantities(user_id))
    }

    /// Returns the quantity of one item (0 if never held).
    #[must_use]
    pub fn quantity(&self, user_id: &str, item_id: &str) -> u64 {
        self.store.with_shard(user_id, |shard| shard.quantity(user_id, item_id))
    }
}
