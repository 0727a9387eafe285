//! # Questline Economy
//!
//! The reward ledger behind Questline's gamification: points for completed
//! tasks, paid Top3 selections, a daily lottery, crafting and welcome gifts.
//!
//! ## Design Principles
//!
//! 1. **Exactly-once crediting** - a claim key gates every one-time reward;
//!    task status may toggle freely without paying twice
//! 2. **One unit of work per operation** - ledger, claims and inventory
//!    change together or not at all
//! 3. **Integer points** - balances are `i64`, quantities are `u64`
//! 4. **External configuration** - economy values load from TOML at startup
//!
//! ## Thread Safety
//!
//! [`EconomyEngine`] is `Send + Sync`. Operations for the same user
//! serialize on that user's shard; different users run in parallel.
//!
//! ## Example
//!
//! ```rust,ignore
//! use questline_economy::{EconomyConfig, EconomyEngine, SeededRandom};
//!
//! let config = EconomyConfig::load("config/economy.toml")?;
//! let engine = EconomyEngine::in_memory(config)?;
//!
//! let award = engine.award_task_completion("user-1", "task-1", "task-1", 10)?;
//! assert_eq!(award.points_awarded, 10);
//!
//! let mut random = SeededRandom::from_entropy();
//! let draw = engine.resolve_top3_lottery("user-1", &mut random)?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod claims;
pub mod config;
pub mod crafting;
pub mod engine;
pub mod error;
pub mod inventory;
pub mod ledger;
pub mod lottery;
pub mod store;
pub mod top3;
pub mod types;
pub mod wal;

pub use claims::{ClaimKey, ClaimOutcome, ClaimScope, ClaimTracker};
pub use config::{EconomyConfig, RedeemAction, RedeemCodeConfig, StorageConfig, WelcomeGiftConfig};
pub use crafting::{Material, Recipe, RecipeBook};
pub use engine::{
    parse_date, AuditReport, AwardResult, CraftResult, DailyLotteryResult, EconomyEngine,
    LotteryResult, PurchaseResult, RedeemResult, RewardType, WelcomeGiftResult,
};
pub use error::{EconomyError, EconomyResult};
pub use inventory::{InventoryStore, ItemQuantity};
pub use ledger::{LedgerStore, NewTransaction, Transaction, TransactionCursor, TransactionFilter};
pub use lottery::{
    LotteryConfig, LotteryOutcome, LotteryResolver, RandomSource, ScriptedDraws, SeededRandom,
};
pub use store::{EconomyStore, UnitOfWork};
pub use top3::{InMemoryTop3Registry, Top3Registry};
pub use types::{ItemId, SourceType, TransactionGroup, TransactionId, UserId};
pub use wal::{WalOperation, WriteAheadLog};
