//! # Economy Engine
//!
//! The operations the task service calls. Each one is a single unit of work
//! on one user's shard:
//!
//! ```text
//! request -> validate input -> begin(user) -> claim? -> ledger/inventory writes
//!                                                   -> commit (one WAL record)
//!                                                   -> typed result
//! ```
//!
//! Any error before the commit rolls every table back. "Already claimed" is
//! a successful result with nothing awarded.
//!
//! Claim scopes per operation:
//!
//! | Operation              | Scope                 | Source          |
//! |------------------------|-----------------------|-----------------|
//! | task completion        | once ever             | `task_complete` |
//! | daily Top3 lottery     | once per date         | `top3_lottery`  |
//! | `once_per_user` code   | once ever             | `redeem_code`   |
//! | welcome gift           | none (repeatable)     |                 |

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::NaiveDate;
use tracing::{debug, error, info, warn};

use crate::claims::ClaimScope;
use crate::config::{EconomyConfig, RedeemAction};
use crate::crafting::{Recipe, RecipeBook};
use crate::error::{EconomyError, EconomyResult};
use crate::inventory::ItemQuantity;
use crate::ledger::{NewTransaction, Transaction, TransactionCursor, TransactionFilter};
use crate::lottery::{LotteryConfig, LotteryOutcome, LotteryResolver, RandomSource};
use crate::store::{EconomyStore, UnitOfWork};
use crate::top3::{InMemoryTop3Registry, Top3Registry};
use crate::types::{ItemId, SourceType, TransactionGroup};

/// Most tasks a Top3 selection may hold.
pub const MAX_TOP3_TASKS: usize = 3;

/// Claim event id of the daily Top3 lottery.
const TOP3_LOTTERY_EVENT: &str = "top3_lottery";

/// Parses an ISO `YYYY-MM-DD` date.
///
/// # Errors
///
/// Returns `Validation` for anything else.
pub fn parse_date(value: &str) -> EconomyResult<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|e| EconomyError::Validation(format!("invalid date {value:?}: {e}")))
}

/// Why an award paid what it paid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RewardType {
    /// First completion of the event; points were credited.
    TaskComplete,
    /// The event was already rewarded; nothing was credited.
    TaskAlreadyCompletedOnce,
}

impl RewardType {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TaskComplete => "task_complete",
            Self::TaskAlreadyCompletedOnce => "task_already_completed_once",
        }
    }
}

impl fmt::Display for RewardType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a task completion award.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AwardResult {
    /// Points credited by this call (0 on a repeat).
    pub points_awarded: i64,
    /// Whether this call won the claim.
    pub reward_type: RewardType,
    /// The ledger row, if points were credited.
    pub transaction: Option<Transaction>,
    /// Balance after the call.
    pub balance: i64,
}

/// Result of a Top3 purchase.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PurchaseResult {
    /// Day the selection is for.
    pub date: NaiveDate,
    /// The selected tasks.
    pub task_ids: Vec<String>,
    /// The debit row.
    pub transaction: Transaction,
    /// Balance after the debit.
    pub balance: i64,
}

/// Result of one lottery resolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LotteryResult {
    /// What was drawn.
    pub outcome: LotteryOutcome,
    /// Group shared by every change of the draw.
    pub transaction_group: TransactionGroup,
    /// Ledger rows written (one per outcome).
    pub transactions: Vec<Transaction>,
    /// Balance after the draw.
    pub balance: i64,
}

/// Result of the date-gated daily lottery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DailyLotteryResult {
    /// First resolution for the date.
    Resolved(LotteryResult),
    /// The lottery for this date already ran; nothing changed.
    AlreadyResolved {
        /// The date asked for.
        date: NaiveDate,
    },
}

impl DailyLotteryResult {
    /// The outcome, if this call resolved the lottery.
    #[must_use]
    pub fn outcome(&self) -> Option<&LotteryOutcome> {
        match self {
            Self::Resolved(result) => Some(&result.outcome),
            Self::AlreadyResolved { .. } => None,
        }
    }
}

/// Result of a welcome gift grant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WelcomeGiftResult {
    /// Group shared by the points row and the item credits.
    pub transaction_group: TransactionGroup,
    /// Points credited.
    pub points_awarded: i64,
    /// Items credited.
    pub items: Vec<ItemQuantity>,
    /// The points row.
    pub transaction: Transaction,
    /// Balance after the grant.
    pub balance: i64,
}

/// Result of a craft.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CraftResult {
    /// Recipe used.
    pub recipe_id: String,
    /// Item produced (one unit).
    pub item_id: ItemId,
    /// Materials consumed.
    pub consumed: Vec<ItemQuantity>,
    /// Group tagging the inventory changes.
    pub transaction_group: TransactionGroup,
    /// Every item row of the user after the craft.
    pub quantities: BTreeMap<ItemId, u64>,
}

/// Result of a code redemption.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RedeemResult {
    /// The code credited points.
    BonusPoints {
        /// Canonical (upper-case) code.
        code: String,
        /// Points credited.
        points_awarded: i64,
        /// The points row.
        transaction: Transaction,
        /// Balance after redemption.
        balance: i64,
    },
    /// The code ran the welcome gift.
    WelcomeGift {
        /// Canonical (upper-case) code.
        code: String,
        /// The gift that was granted.
        gift: WelcomeGiftResult,
    },
}

impl RedeemResult {
    /// Balance after redemption.
    #[must_use]
    pub const fn balance(&self) -> i64 {
        match self {
            Self::BonusPoints { balance, .. } => *balance,
            Self::WelcomeGift { gift, .. } => gift.balance,
        }
    }
}

/// Consistency check of one user's tables.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuditReport {
    /// Balance on the account row.
    pub cached_balance: i64,
    /// Sum of the transaction log.
    pub recomputed_balance: i64,
    /// Rows in the transaction log.
    pub transaction_count: usize,
    /// Item rows held, zeroed rows included.
    pub item_rows: usize,
}

impl AuditReport {
    /// True if the cached balance equals the log sum.
    #[must_use]
    pub const fn is_consistent(&self) -> bool {
        self.cached_balance == self.recomputed_balance
    }
}

/// The reward economy. Build one at startup and share it by reference.
pub struct EconomyEngine {
    store: EconomyStore,
    config: EconomyConfig,
    lottery: LotteryConfig,
    recipes: RecipeBook,
    top3: Arc<dyn Top3Registry>,
}

impl fmt::Debug for EconomyEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EconomyEngine")
            .field("store", &self.store)
            .field("lottery", &self.lottery)
            .field("recipes", &self.recipes.len())
            .finish_non_exhaustive()
    }
}

impl EconomyEngine {
    /// Builds an engine over an existing store.
    ///
    /// # Errors
    ///
    /// Returns `Config` if `config` does not validate.
    pub fn new(config: EconomyConfig, store: EconomyStore, top3: Arc<dyn Top3Registry>) -> EconomyResult<Self> {
        config.validate()?;
        let lottery = config.lottery();
        let recipes = config.recipe_book()?;

        info!(
            durable = store.is_durable(),
            recipes = recipes.len(),
            points_probability = lottery.points_probability,
            "economy engine ready"
        );

        Ok(Self {
            store,
            config,
            lottery,
            recipes,
            top3,
        })
    }

    /// Opens the store named by `config.storage` and builds an engine on it.
    ///
    /// # Errors
    ///
    /// `Config` for an invalid config, `Persistence` if the WAL cannot be
    /// recovered.
    pub fn open(config: EconomyConfig, top3: Arc<dyn Top3Registry>) -> EconomyResult<Self> {
        config.validate()?;
        let store = EconomyStore::open(&config.storage)?;
        Self::new(config, store, top3)
    }

    /// A volatile engine with an in-memory Top3 registry.
    ///
    /// # Errors
    ///
    /// Returns `Config` if `config` does not validate.
    pub fn in_memory(config: EconomyConfig) -> EconomyResult<Self> {
        let store = EconomyStore::in_memory(config.storage.shard_count);
        Self::new(config, store, Arc::new(InMemoryTop3Registry::new()))
    }

    /// The loaded configuration.
    #[must_use]
    pub const fn config(&self) -> &EconomyConfig {
        &self.config
    }

    /// The recipe book.
    #[must_use]
    pub const fn recipes(&self) -> &RecipeBook {
        &self.recipes
    }

    /// The backing store.
    #[must_use]
    pub const fn store(&self) -> &EconomyStore {
        &self.store
    }

    // =========================================================================
    // Task completion
    // =========================================================================

    /// Credits `points_value` once per `completion_instance_id`.
    ///
    /// Repeat calls for the same completion, including after the task was
    /// un-completed, return `points_awarded == 0`.
    ///
    /// # Errors
    ///
    /// `Validation` for negative points, `Persistence` on storage failure.
    pub fn award_task_completion(
        &self,
        user_id: &str,
        task_id: &str,
        completion_instance_id: &str,
        points_value: i64,
    ) -> EconomyResult<AwardResult> {
        if points_value < 0 {
            return Err(EconomyError::Validation(format!(
                "task points must not be negative, got {points_value}"
            )));
        }

        let result = self.store.unit_of_work(user_id, |uow| {
            let outcome = uow.try_claim(completion_instance_id, ClaimScope::OnceEver, SourceType::TaskComplete);
            if !outcome.is_claimed() {
                return Ok(AwardResult {
                    points_awarded: 0,
                    reward_type: RewardType::TaskAlreadyCompletedOnce,
                    transaction: None,
                    balance: uow.balance(),
                });
            }

            let tx = uow.append(
                NewTransaction::new(points_value, SourceType::TaskComplete, TransactionGroup::new())
                    .with_metadata("task_id", task_id)
                    .with_metadata("completion_instance_id", completion_instance_id),
            )?;
            Ok(AwardResult {
                points_awarded: points_value,
                reward_type: RewardType::TaskComplete,
                transaction: Some(tx),
                balance: uow.balance(),
            })
        })?;

        match result.reward_type {
            RewardType::TaskComplete => info!(
                user_id,
                task_id,
                completion_instance_id,
                points = result.points_awarded,
                balance = result.balance,
                "task completion rewarded"
            ),
            RewardType::TaskAlreadyCompletedOnce => debug!(
                user_id,
                task_id,
                completion_instance_id,
                "task completion already rewarded"
            ),
        }
        Ok(result)
    }

    /// [`Self::award_task_completion`] at the configured `normal_task_points`.
    ///
    /// # Errors
    ///
    /// `Persistence` on storage failure.
    pub fn award_normal_task_completion(
        &self,
        user_id: &str,
        task_id: &str,
        completion_instance_id: &str,
    ) -> EconomyResult<AwardResult> {
        self.award_task_completion(user_id, task_id, completion_instance_id, self.config.normal_task_points)
    }

    // =========================================================================
    // Top3
    // =========================================================================

    /// Charges `cost` points and stores the Top3 selection for `date`.
    ///
    /// The debit and the registry write succeed or fail together.
    ///
    /// # Errors
    ///
    /// - `Validation` for an empty list, more than three tasks, duplicate
    ///   ids or a negative cost
    /// - `Conflict` if a selection for `(user, date)` exists
    /// - `InsufficientBalance` if the balance is below `cost`
    /// - the registry's error if it fails to save
    /// - `Persistence` on storage failure
    pub fn purchase_top3(
        &self,
        user_id: &str,
        date: NaiveDate,
        task_ids: &[String],
        cost: i64,
    ) -> EconomyResult<PurchaseResult> {
        validate_top3_tasks(task_ids)?;
        if cost < 0 {
            return Err(EconomyError::Validation(format!("top3 cost must not be negative, got {cost}")));
        }

        let mut uow = self.store.begin(user_id);

        if self.top3.has_selection(user_id, date)? {
            return Err(EconomyError::Conflict(format!(
                "top3 already selected for {date}"
            )));
        }

        let available = uow.balance();
        if available < cost {
            return Err(EconomyError::InsufficientBalance {
                required: cost,
                available,
            });
        }

        let transaction = uow.append(
            NewTransaction::new(-cost, SourceType::Top3Cost, TransactionGroup::new())
                .with_metadata("date", date.to_string())
                .with_metadata("task_ids", task_ids.join(",")),
        )?;
        let balance = uow.balance();

        if let Err(e) = self.top3.save_selection(user_id, date, task_ids) {
            uow.rollback();
            warn!(user_id, %date, error = %e, "top3 selection not saved, debit rolled back");
            return Err(e);
        }

        if let Err(e) = uow.commit() {
            if let Err(undo) = self.top3.remove_selection(user_id, date) {
                error!(user_id, %date, error = %undo, "top3 selection left without payment");
            }
            return Err(e);
        }

        info!(user_id, %date, cost, balance, tasks = task_ids.len(), "top3 purchased");
        Ok(PurchaseResult {
            date,
            task_ids: task_ids.to_vec(),
            transaction,
            balance,
        })
    }

    /// [`Self::purchase_top3`] at the configured `top3_cost_points`.
    ///
    /// # Errors
    ///
    /// Same as [`Self::purchase_top3`].
    pub fn purchase_top3_at_list_price(
        &self,
        user_id: &str,
        date: NaiveDate,
        task_ids: &[String],
    ) -> EconomyResult<PurchaseResult> {
        self.purchase_top3(user_id, date, task_ids, self.config.top3_cost_points)
    }

    // =========================================================================
    // Lottery
    // =========================================================================

    /// Draws once with the configured lottery and applies the outcome.
    ///
    /// # Errors
    ///
    /// `Persistence` on storage failure.
    pub fn resolve_top3_lottery(
        &self,
        user_id: &str,
        random: &mut impl RandomSource,
    ) -> EconomyResult<LotteryResult> {
        let outcome = LotteryResolver::resolve(&self.lottery, random);
        let result = self
            .store
            .unit_of_work(user_id, |uow| apply_lottery_outcome(uow, outcome))?;
        log_lottery(user_id, &result);
        Ok(result)
    }

    /// Draws once with an explicit lottery configuration.
    ///
    /// # Errors
    ///
    /// `Config` if `config` does not validate, `Persistence` on storage
    /// failure.
    pub fn resolve_lottery_with(
        &self,
        user_id: &str,
        config: &LotteryConfig,
        random: &mut impl RandomSource,
    ) -> EconomyResult<LotteryResult> {
        config.validate()?;
        let outcome = LotteryResolver::resolve(config, random);
        let result = self
            .store
            .unit_of_work(user_id, |uow| apply_lottery_outcome(uow, outcome))?;
        log_lottery(user_id, &result);
        Ok(result)
    }

    /// Resolves the daily Top3 lottery at most once per user and date.
    ///
    /// No draw is taken on a repeat call.
    ///
    /// # Errors
    ///
    /// `Persistence` on storage failure.
    pub fn resolve_top3_lottery_for_date(
        &self,
        user_id: &str,
        date: NaiveDate,
        random: &mut impl RandomSource,
    ) -> EconomyResult<DailyLotteryResult> {
        let period = date.to_string();
        let result = self.store.unit_of_work(user_id, |uow| {
            let claim = uow.try_claim(
                TOP3_LOTTERY_EVENT,
                ClaimScope::OncePerPeriod(&period),
                SourceType::Top3Lottery,
            );
            if !claim.is_claimed() {
                return Ok(DailyLotteryResult::AlreadyResolved { date });
            }
            let outcome = LotteryResolver::resolve(&self.lottery, random);
            apply_lottery_outcome(uow, outcome).map(DailyLotteryResult::Resolved)
        })?;

        match &result {
            DailyLotteryResult::Resolved(lottery) => log_lottery(user_id, lottery),
            DailyLotteryResult::AlreadyResolved { .. } => {
                debug!(user_id, %date, "daily lottery already resolved");
            }
        }
        Ok(result)
    }

    // =========================================================================
    // Welcome gift
    // =========================================================================

    /// Grants the configured welcome bundle. Repeatable; every call is a new
    /// group.
    ///
    /// # Errors
    ///
    /// `Validation` on balance overflow, `Persistence` on storage failure.
    pub fn claim_welcome_gift(&self, user_id: &str) -> EconomyResult<WelcomeGiftResult> {
        let gift = self
            .store
            .unit_of_work(user_id, |uow| self.grant_welcome_gift(uow, None))?;
        info!(
            user_id,
            group = %gift.transaction_group,
            points = gift.points_awarded,
            items = gift.items.len(),
            balance = gift.balance,
            "welcome gift granted"
        );
        Ok(gift)
    }

    fn grant_welcome_gift(&self, uow: &mut UnitOfWork<'_>, code: Option<&str>) -> EconomyResult<WelcomeGiftResult> {
        let gift = &self.config.welcome_gift;
        let group = TransactionGroup::new();

        let mut row = NewTransaction::new(gift.points, SourceType::WelcomeGift, group);
        if let Some(code) = code {
            row = row.with_metadata("code", code);
        }
        let transaction = uow.append(row)?;
        uow.credit_all(&gift.items, Some(group))?;

        Ok(WelcomeGiftResult {
            transaction_group: group,
            points_awarded: gift.points,
            items: gift.items.clone(),
            transaction,
            balance: uow.balance(),
        })
    }

    // =========================================================================
    // Crafting
    // =========================================================================

    /// Consumes a recipe's materials and credits one result item.
    ///
    /// Every material is checked before anything is debited; on shortfall the
    /// first insufficient material is reported and nothing changes. Crafting
    /// writes no ledger row.
    ///
    /// # Errors
    ///
    /// `Config` for a malformed recipe, `InsufficientInventory` on shortfall,
    /// `Persistence` on storage failure.
    pub fn craft(&self, user_id: &str, recipe: &Recipe) -> EconomyResult<CraftResult> {
        recipe.validate()?;
        let lines = recipe.debit_lines();
        let group = TransactionGroup::new();

        let result = self.store.unit_of_work(user_id, |uow| {
            uow.check_debit_all(&lines)?;
            uow.debit_all(&lines, Some(group))?;
            uow.credit(&recipe.result_item, 1, Some(group))?;
            Ok(CraftResult {
                recipe_id: recipe.id.clone(),
                item_id: recipe.result_item.clone(),
                consumed: lines.clone(),
                transaction_group: group,
                quantities: uow.quantities(),
            })
        });

        match &result {
            Ok(craft) => info!(user_id, recipe = %craft.recipe_id, item = %craft.item_id, "item crafted"),
            Err(e) => debug!(user_id, recipe = %recipe.id, error = %e, "craft refused"),
        }
        result
    }

    /// Crafts a recipe from the recipe book.
    ///
    /// # Errors
    ///
    /// `Validation` for an unknown recipe id, otherwise as [`Self::craft`].
    pub fn craft_by_id(&self, user_id: &str, recipe_id: &str) -> EconomyResult<CraftResult> {
        let recipe = self
            .recipes
            .get(recipe_id)
            .ok_or_else(|| EconomyError::Validation(format!("unknown recipe {recipe_id}")))?;
        self.craft(user_id, recipe)
    }

    // =========================================================================
    // Redemption codes
    // =========================================================================

    /// Redeems a configured code. Codes match case-insensitively.
    ///
    /// # Errors
    ///
    /// - `UnknownCode` if the code is not configured
    /// - `Conflict` if a `once_per_user` code was already redeemed
    /// - `Persistence` on storage failure
    pub fn redeem(&self, user_id: &str, code: &str) -> EconomyResult<RedeemResult> {
        let entry = self
            .config
            .redeem_code(code)
            .ok_or_else(|| EconomyError::UnknownCode(code.trim().to_string()))?;
        let canonical = entry.code.trim().to_ascii_uppercase();

        let result = self.store.unit_of_work(user_id, |uow| {
            if entry.once_per_user
                && !uow
                    .try_claim(&canonical, ClaimScope::OnceEver, SourceType::RedeemCode)
                    .is_claimed()
            {
                return Err(EconomyError::Conflict(format!("code {canonical} already redeemed")));
            }

            match entry.action {
                RedeemAction::BonusPoints { amount } => {
                    let transaction = uow.append(
                        NewTransaction::new(amount, SourceType::RedeemCode, TransactionGroup::new())
                            .with_metadata("code", canonical.as_str()),
                    )?;
                    Ok(RedeemResult::BonusPoints {
                        code: canonical.clone(),
                        points_awarded: amount,
                        transaction,
                        balance: uow.balance(),
                    })
                }
                RedeemAction::WelcomeGift => Ok(RedeemResult::WelcomeGift {
                    code: canonical.clone(),
                    gift: self.grant_welcome_gift(uow, Some(canonical.as_str()))?,
                }),
            }
        });

        match &result {
            Ok(redeemed) => info!(user_id, code = %canonical, balance = redeemed.balance(), "code redeemed"),
            Err(e) => debug!(user_id, code = %canonical, error = %e, "code refused"),
        }
        result
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Current balance.
    #[must_use]
    pub fn balance(&self, user_id: &str) -> i64 {
        self.store.ledger().balance(user_id)
    }

    /// Snapshot of every item row.
    #[must_use]
    pub fn quantities(&self, user_id: &str) -> BTreeMap<ItemId, u64> {
        self.store.inventory().quantities(user_id)
    }

    /// Oldest-first cursor over the user's ledger.
    #[must_use]
    pub fn transactions(&self, user_id: &str, filter: TransactionFilter) -> TransactionCursor<'_> {
        self.store.ledger().transactions(user_id, filter)
    }

    /// Recomputes the balance from the log under one shard lock.
    #[must_use]
    pub fn audit_user(&self, user_id: &str) -> AuditReport {
        self.store.with_shard(user_id, |shard| {
            let log = shard.transactions(user_id);
            AuditReport {
                cached_balance: shard.balance(user_id),
                recomputed_balance: log.iter().map(|tx| tx.amount).sum(),
                transaction_count: log.len(),
                item_rows: shard.quantities(user_id).len(),
            }
        })
    }
}

fn validate_top3_tasks(task_ids: &[String]) -> EconomyResult<()> {
    if task_ids.is_empty() {
        return Err(EconomyError::Validation("top3 needs at least one task".to_string()));
    }
    if task_ids.len() > MAX_TOP3_TASKS {
        return Err(EconomyError::Validation(format!(
            "top3 allows at most {MAX_TOP3_TASKS} tasks, got {}",
            task_ids.len()
        )));
    }
    let mut seen = HashSet::new();
    for task_id in task_ids {
        if !seen.insert(task_id.as_str()) {
            return Err(EconomyError::Validation(format!("task {task_id} selected twice")));
        }
    }
    Ok(())
}

fn apply_lottery_outcome(uow: &mut UnitOfWork<'_>, outcome: LotteryOutcome) -> EconomyResult<LotteryResult> {
    let group = TransactionGroup::new();
    let transaction = match &outcome {
        LotteryOutcome::Points { amount } => {
            uow.append(NewTransaction::new(*amount, SourceType::LotteryPoints, group))?
        }
        LotteryOutcome::Reward { item_id } => {
            uow.credit(item_id, 1, Some(group))?;
            // Zero-amount row keeps the reward visible in the ledger.
            uow.append(
                NewTransaction::new(0, SourceType::LotteryReward, group)
                    .with_metadata("reward_item", item_id.as_str()),
            )?
        }
    };

    Ok(LotteryResult {
        outcome,
        transaction_group: group,
        transactions: vec![transaction],
        balance: uow.balance(),
    })
}

fn log_lottery(user_id: &str, result: &LotteryResult) {
    info!(
        user_id,
        kind = result.outcome.kind(),
        points = result.outcome.points_amount().unwrap_or(0),
        reward_item = result.outcome.reward_item().unwrap_or(""),
        balance = result.balance,
        "lottery resolved"
    );
}
