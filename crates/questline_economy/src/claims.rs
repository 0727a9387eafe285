//! # Claim Tracker
//!
//! Idempotency markers that stop a reward from being granted twice.
//!
//! A claim key moves `UNCLAIMED -> CLAIMED` exactly once and never back.
//! It gates money only; the task's own `pending <-> completed` status is
//! owned by the task domain and may toggle freely.
//!
//! The tracker is scope-agnostic. Callers pick the scope per call through
//! [`ClaimScope`]: once-ever keys carry no period, once-per-period keys carry
//! the period in its own field, so no event id can collide with a period.

use std::fmt;

use crate::error::EconomyResult;
use crate::store::{EconomyStore, UnitOfWork};
use crate::types::{SourceType, UserId};
use crate::wal::WalOperation;

/// Unique key of a claim row.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClaimKey {
    /// The rewarded user.
    pub user_id: UserId,
    /// Identifier of the rewarded event.
    pub earning_event_id: String,
    /// Period the claim covers; `None` for once-ever claims.
    pub period: Option<String>,
    /// What kind of reward the claim gates.
    pub source_type: SourceType,
}

/// How long a claim blocks repeat rewards for the same event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClaimScope<'a> {
    /// At most one reward for this event, ever.
    OnceEver,
    /// At most one reward per period (typically an ISO date).
    OncePerPeriod(&'a str),
}

impl<'a> ClaimScope<'a> {
    /// The period this scope stores, if any.
    #[must_use]
    pub const fn period(self) -> Option<&'a str> {
        match self {
            Self::OnceEver => None,
            Self::OncePerPeriod(period) => Some(period),
        }
    }
}

impl ClaimKey {
    /// Builds the key of `event_id` under `scope`.
    #[must_use]
    pub fn new(user_id: &str, event_id: &str, scope: ClaimScope<'_>, source_type: SourceType) -> Self {
        Self {
            user_id: user_id.to_string(),
            earning_event_id: event_id.to_string(),
            period: scope.period().map(str::to_string),
            source_type,
        }
    }
}

/// Outcome of a claim attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This call inserted the claim; the caller grants the reward.
    Claimed,
    /// A claim already existed; the caller must skip the grant.
    AlreadyClaimed,
}

impl ClaimOutcome {
    /// Returns true if this call won the claim.
    #[must_use]
    pub const fn is_claimed(self) -> bool {
        matches!(self, Self::Claimed)
    }
}

impl fmt::Display for ClaimOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Claimed => f.write_str("claimed"),
            Self::AlreadyClaimed => f.write_str("already_claimed"),
        }
    }
}

impl UnitOfWork<'_> {
    /// Inserts a claim unless one exists. The existing row is the
    /// "already claimed" signal, not an error.
    pub fn try_claim(&mut self, event_id: &str, scope: ClaimScope<'_>, source_type: SourceType) -> ClaimOutcome {
        let key = ClaimKey::new(self.user_id(), event_id, scope, source_type);
        if self.shard().has_claim(&key) {
            return ClaimOutcome::AlreadyClaimed;
        }
        self.apply(WalOperation::InsertClaim(key));
        ClaimOutcome::Claimed
    }
}

/// Claim access outside an engine operation.
#[derive(Clone, Copy, Debug)]
pub struct ClaimTracker<'s> {
    store: &'s EconomyStore,
}

impl<'s> ClaimTracker<'s> {
    pub(crate) const fn new(store: &'s EconomyStore) -> Self {
        Self { store }
    }

    /// Attempts to insert a claim in its own unit of work.
    ///
    /// # Errors
    ///
    /// Returns `Persistence` if the claim could not be made durable; the
    /// claim is then not recorded.
    pub fn try_claim(
        &self,
        user_id: &str,
        event_id: &str,
        scope: ClaimScope<'_>,
        source_type: SourceType,
    ) -> EconomyResult<ClaimOutcome> {
        self.store
            .unit_of_work(user_id, |uow| Ok(uow.try_claim(event_id, scope, source_type)))
    }

    /// Returns true if the scoped event has been claimed.
    #[must_use]
    pub fn is_claimed(&self, user_id: &str, event_id: &str, scope: ClaimScope<'_>, source_type: SourceType) -> bool {
        let key = ClaimKey::new(user_id, event_id, scope, source_type);
        self.store.with_shard(user_id, |shard| shard.has_claim(&key))
    }
}
