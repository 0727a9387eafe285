//! # Top3 Registry Boundary
//!
//! The economy charges for a Top3 selection but does not own it. The task
//! service implements [`Top3Registry`]; the engine calls it inside the unit
//! of work that debits the cost, so a registry failure undoes the debit.
//!
//! ```text
//! economy defines:          task service implements:
//! ┌──────────────────┐      ┌──────────────────────┐
//! │ trait Top3Registry│ <── │ impl Top3Registry    │
//! └──────────────────┘      └──────────────────────┘
//! ```

use std::collections::HashMap;

use chrono::NaiveDate;
use parking_lot::Mutex;

use crate::error::{EconomyError, EconomyResult};
use crate::types::UserId;

/// Where Top3 selections live.
pub trait Top3Registry: Send + Sync {
    /// Returns true if the user already has a selection for `date`.
    ///
    /// # Errors
    ///
    /// `Persistence` if the registry cannot be read.
    fn has_selection(&self, user_id: &str, date: NaiveDate) -> EconomyResult<bool>;

    /// Stores the selection.
    ///
    /// # Errors
    ///
    /// `Conflict` if one already exists for `(user, date)`, `Persistence` on
    /// storage failure.
    fn save_selection(&self, user_id: &str, date: NaiveDate, task_ids: &[String]) -> EconomyResult<()>;

    /// Removes a selection. Used to compensate when the paying commit fails.
    ///
    /// # Errors
    ///
    /// `Persistence` on storage failure.
    fn remove_selection(&self, user_id: &str, date: NaiveDate) -> EconomyResult<()>;
}

/// Process-local registry.
#[derive(Debug, Default)]
pub struct InMemoryTop3Registry {
    selections: Mutex<HashMap<(UserId, NaiveDate), Vec<String>>>,
}

impl InMemoryTop3Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the stored selection, if any.
    #[must_use]
    pub fn selection(&self, user_id: &str, date: NaiveDate) -> Option<Vec<String>> {
        self.selections
            .lock()
            .get(&(user_id.to_string(), date))
            .cloned()
    }
}

impl Top3Registry for InMemoryTop3Registry {
    fn has_selection(&self, user_id: &str, date: NaiveDate) -> EconomyResult<bool> {
        Ok(self.selections.lock().contains_key(&(user_id.to_string(), date)))
    }

    fn save_selection(&self, user_id: &str, date: NaiveDate, task_ids: &[String]) -> EconomyResult<()> {
        let mut selections = self.selections.lock();
        let key = (user_id.to_string(), date);
        if selections.contains_key(&key) {
            return Err(EconomyError::Conflict(format!(
                "top3 already selected for {user_id} on {date}"
            )));
        }
        selections.insert(key, task_ids.to_vec());
        Ok(())
    }

    fn remove_selection(&self, user_id: &str, date: NaiveDate) -> EconomyResult<()> {
        self.selections.lock().remove(&(user_id.to_string(), date));
        Ok(())
    }
}
