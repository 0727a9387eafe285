//! # Economy Error Types
//!
//! All errors that can occur in the economy engine.
//!
//! "Already claimed" is deliberately absent: re-rewarding an event is a
//! normal zero-value result, never an error.

use thiserror::Error;

/// Errors that can occur in the economy engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EconomyError {
    /// Malformed input (too many Top3 tasks, negative points, unknown recipe).
    #[error("validation failed: {0}")]
    Validation(String),

    /// The user does not have enough points.
    #[error("insufficient balance: need {required}, have {available}")]
    InsufficientBalance {
        /// Points required by the operation.
        required: i64,
        /// Points currently on the account.
        available: i64,
    },

    /// The user does not have enough of an item.
    #[error("insufficient inventory: need {required} of {item_id}, have {available}")]
    InsufficientInventory {
        /// The first item that fell short.
        item_id: String,
        /// The amount required.
        required: u64,
        /// The amount available.
        available: u64,
    },

    /// A credit or debit was asked for a non-positive quantity.
    #[error("invalid quantity {quantity} for item {item_id}")]
    InvalidQuantity {
        /// The item the quantity was for.
        item_id: String,
        /// The rejected quantity.
        quantity: i64,
    },

    /// The operation collides with existing state (duplicate Top3 for a date).
    #[error("conflict: {0}")]
    Conflict(String),

    /// The redemption code is not configured.
    #[error("unknown redemption code: {0}")]
    UnknownCode(String),

    /// Invalid configuration. Fatal at boot.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Storage failure. The unit of work was not applied.
    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl EconomyError {
    /// Returns true if the caller may retry the same request unchanged.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Persistence(_))
    }

    /// Returns true for business-rule violations the user can correct.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::InsufficientBalance { .. }
                | Self::InsufficientInventory { .. }
                | Self::InvalidQuantity { .. }
                | Self::Conflict(_)
                | Self::UnknownCode(_)
        )
    }
}

/// Result type for economy operations.
pub type EconomyResult<T> = Result<T, EconomyError>;
