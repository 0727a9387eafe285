//! Shared identifiers for the economy engine.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a user account, as issued by the auth layer.
pub type UserId = String;

/// Identifier of an inventory item or material (e.g. `"crystal_shard"`).
pub type ItemId = String;

/// Store-wide, monotonically increasing transaction identifier.
pub type TransactionId = u64;

/// Tag linking every ledger row and inventory change of one economic event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionGroup(Uuid);

impl TransactionGroup {
    /// Allocates a fresh random group.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Rebuilds a group from its 16 raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Returns the 16 raw bytes of this group.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for TransactionGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What produced a ledger row or claim.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SourceType {
    /// Points for completing a task.
    TaskComplete = 1,
    /// Points spent on a Top3 selection.
    Top3Cost = 2,
    /// Points won in the Top3 lottery.
    LotteryPoints = 3,
    /// Zero-amount audit row for an item won in the Top3 lottery.
    LotteryReward = 4,
    /// Points from the welcome gift bundle.
    WelcomeGift = 5,
    /// Points from a redemption code.
    RedeemCode = 6,
    /// Daily gate on the Top3 lottery. Claims only, never a ledger row.
    Top3Lottery = 7,
}

impl SourceType {
    /// Stable wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TaskComplete => "task_complete",
            Self::Top3Cost => "top3_cost",
            Self::LotteryPoints => "lottery_points",
            Self::LotteryReward => "lottery_reward",
            Self::WelcomeGift => "welcome_gift",
            Self::RedeemCode => "redeem_code",
            Self::Top3Lottery => "top3_lottery",
        }
    }

    /// Converts from the WAL tag.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::TaskComplete),
            2 => Some(Self::Top3Cost),
            3 => Some(Self::LotteryPoints),
            4 => Some(Self::LotteryReward),
            5 => Some(Self::WelcomeGift),
            6 => Some(Self::RedeemCode),
            7 => Some(Self::Top3Lottery),
            _ => None,
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
