//! # Economy Configuration
//!
//! Loaded once at process start from TOML. Every field has a default, so a
//! file only needs the values it changes:
//!
//! ```toml
//! normal_task_points = 10
//! top3_cost_points = 300
//! lottery_points_probability = 0.5
//! lottery_points_amount = 100
//! default_rewards = ["focus_potion", "streak_shield"]
//!
//! [[default_recipes]]
//! id = "time_crystal"
//! result_item = "time_crystal"
//! materials = [{ item_id = "crystal_shard", quantity = 3 }]
//!
//! [[redeem_codes]]
//! code = "QUESTLINE100"
//! once_per_user = true
//! action = { kind = "bonus_points", amount = 100 }
//!
//! [storage]
//! wal_path = "data/economy.wal"
//! ```
//!
//! [`EconomyConfig::validate`] must pass before an engine is built; a bad
//! lottery or a recipe cycle blocks startup.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::crafting::{Material, Recipe, RecipeBook};
use crate::error::{EconomyError, EconomyResult};
use crate::inventory::ItemQuantity;
use crate::lottery::LotteryConfig;
use crate::types::ItemId;

/// Where and how the store keeps its tables.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// WAL file. `None` keeps everything in memory.
    pub wal_path: Option<PathBuf>,
    /// fsync after every commit.
    pub sync_on_commit: bool,
    /// Number of per-user lock shards.
    pub shard_count: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            wal_path: None,
            sync_on_commit: true,
            shard_count: 64,
        }
    }
}

/// The fixed bundle granted by a welcome gift.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WelcomeGiftConfig {
    /// Points credited per claim.
    pub points: i64,
    /// Items credited per claim. Item ids must be distinct.
    pub items: Vec<ItemQuantity>,
}

impl Default for WelcomeGiftConfig {
    fn default() -> Self {
        Self {
            points: 1000,
            items: vec![
                ItemQuantity::new("focus_potion", 1),
                ItemQuantity::new("streak_shield", 1),
                ItemQuantity::new("crystal_shard", 3),
            ],
        }
    }
}

/// What a redemption code grants.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RedeemAction {
    /// Credits a fixed number of points.
    BonusPoints {
        /// Points credited.
        amount: i64,
    },
    /// Runs the welcome gift.
    WelcomeGift,
}

/// A static redemption code.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedeemCodeConfig {
    /// The code as users type it. Matched case-insensitively.
    pub code: String,
    /// What redeeming it does.
    pub action: RedeemAction,
    /// Whether each user may redeem it only once.
    #[serde(default)]
    pub once_per_user: bool,
}

/// Top-level economy configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EconomyConfig {
    /// Points for completing a normal task.
    pub normal_task_points: i64,
    /// Price of one Top3 selection.
    pub top3_cost_points: i64,
    /// Chance that the daily lottery pays points.
    pub lottery_points_probability: f64,
    /// Chance that it pays an item. Defaults to `1 - points`.
    pub lottery_reward_probability: Option<f64>,
    /// Points paid by a points outcome.
    pub lottery_points_amount: i64,
    /// Lottery reward pool.
    pub default_rewards: Vec<ItemId>,
    /// Crafting recipes.
    pub default_recipes: Vec<Recipe>,
    /// Welcome gift bundle.
    pub welcome_gift: WelcomeGiftConfig,
    /// Redemption codes.
    pub redeem_codes: Vec<RedeemCodeConfig>,
    /// Storage backend.
    pub storage: StorageConfig,
}

impl Default for EconomyConfig {
    fn default() -> Self {
        Self {
            normal_task_points: 10,
            top3_cost_points: 300,
            lottery_points_probability: 0.5,
            lottery_reward_probability: None,
            lottery_points_amount: 100,
            default_rewards: vec![
                "focus_potion".to_string(),
                "streak_shield".to_string(),
                "crystal_shard".to_string(),
            ],
            default_recipes: vec![
                Recipe::new(
                    "time_crystal",
                    "time_crystal",
                    vec![Material::new("crystal_shard", 3), Material::new("stardust", 1)],
                ),
                Recipe::new(
                    "workbench",
                    "workbench",
                    vec![Material::new("wood", 4), Material::new("stone", 2)],
                ),
            ],
            welcome_gift: WelcomeGiftConfig::default(),
            redeem_codes: vec![
                RedeemCodeConfig {
                    code: "WELCOME".to_string(),
                    action: RedeemAction::WelcomeGift,
                    once_per_user: false,
                },
                RedeemCodeConfig {
                    code: "QUESTLINE100".to_string(),
                    action: RedeemAction::BonusPoints { amount: 100 },
                    once_per_user: true,
                },
            ],
            storage: StorageConfig::default(),
        }
    }
}

impl EconomyConfig {
    /// Parses a TOML document. Does not validate.
    ///
    /// # Errors
    ///
    /// Returns `Config` on malformed TOML or unknown fields.
    pub fn from_toml_str(content: &str) -> EconomyResult<Self> {
        toml::from_str(content).map_err(|e| EconomyError::Config(format!("parse error: {e}")))
    }

    /// Reads, parses and validates a TOML file.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the file cannot be read, parsed or validated.
    pub fn load(path: impl AsRef<Path>) -> EconomyResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| EconomyError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config = Self::from_toml_str(&content)?;
        config.validate()?;

        tracing::info!(
            path = %path.display(),
            recipes = config.default_recipes.len(),
            redeem_codes = config.redeem_codes.len(),
            durable = config.storage.wal_path.is_some(),
            "economy config loaded"
        );
        Ok(config)
    }

    /// The lottery parameters, with the reward probability resolved.
    #[must_use]
    pub fn lottery(&self) -> LotteryConfig {
        LotteryConfig {
            points_probability: self.lottery_points_probability,
            reward_probability: self
                .lottery_reward_probability
                .unwrap_or(1.0 - self.lottery_points_probability),
            points_amount: self.lottery_points_amount,
            reward_pool: self.default_rewards.clone(),
        }
    }

    /// Builds the recipe book.
    ///
    /// # Errors
    ///
    /// Returns `Config` for an invalid recipe, a duplicate id or a cycle.
    pub fn recipe_book(&self) -> EconomyResult<RecipeBook> {
        RecipeBook::from_recipes(self.default_recipes.iter().cloned())
    }

    /// Looks up a redemption code, ignoring case.
    #[must_use]
    pub fn redeem_code(&self, code: &str) -> Option<&RedeemCodeConfig> {
        let code = code.trim();
        self.redeem_codes
            .iter()
            .find(|c| c.code.eq_ignore_ascii_case(code))
    }

    /// Checks every section.
    ///
    /// # Errors
    ///
    /// Returns the first `Config` problem found.
    pub fn validate(&self) -> EconomyResult<()> {
        if self.normal_task_points < 0 {
            return Err(EconomyError::Config(format!(
                "normal_task_points must not be negative, got {}",
                self.normal_task_points
            )));
        }
        if self.top3_cost_points < 0 {
            return Err(EconomyError::Config(format!(
                "top3_cost_points must not be negative, got {}",
                self.top3_cost_points
            )));
        }

        self.lottery().validate()?;
        self.recipe_book()?;
        self.validate_welcome_gift()?;
        self.validate_redeem_codes()?;

        if self.storage.shard_count == 0 {
            return Err(EconomyError::Config("storage.shard_count must be at least 1".to_string()));
        }
        Ok(())
    }

    fn validate_welcome_gift(&self) -> EconomyResult<()> {
        let gift = &self.welcome_gift;
        if gift.points < 0 {
            return Err(EconomyError::Config(format!(
                "welcome_gift.points must not be negative, got {}",
                gift.points
            )));
        }
        let mut seen = HashSet::new();
        for item in &gift.items {
            if item.quantity == 0 {
                return Err(EconomyError::Config(format!(
                    "welcome_gift item {} has zero quantity",
                    item.item_id
                )));
            }
            if !seen.insert(item.item_id.as_str()) {
                return Err(EconomyError::Config(format!(
                    "welcome_gift lists {} twice",
                    item.item_id
                )));
            }
        }
        Ok(())
    }

    fn validate_redeem_codes(&self) -> EconomyResult<()> {
        let mut seen = HashSet::new();
        for entry in &self.redeem_codes {
            let normalized = entry.code.trim().to_ascii_uppercase();
            if normalized.is_empty() {
                return Err(EconomyError::Config("redeem code must not be empty".to_string()));
            }
            if !seen.insert(normalized) {
                return Err(EconomyError::Config(format!(
                    "redeem code {} is listed twice",
                    entry.code
                )));
            }
            if let RedeemAction::BonusPoints { amount } = entry.action {
                if amount < 0 {
                    return Err(EconomyError::Config(format!(
                        "redeem code {} grants negative points",
                        entry.code
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = EconomyConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.top3_cost_points, 300);
        assert_eq!(config.welcome_gift.points, 1000);
        assert_eq!(config.welcome_gift.items.len(), 3);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EconomyConfig::from_toml_str(
            r#"
            normal_task_points = 25
            lottery_points_probability = 0.8

            [storage]
            shard_count = 8
            "#,
        )
        .unwrap();

        assert_eq!(config.normal_task_points, 25);
        assert_eq!(config.top3_cost_points, 300);
        assert_eq!(config.storage.shard_count, 8);
        assert!(config.storage.sync_on_commit);

        let lottery = config.lottery();
        assert!((lottery.reward_probability - 0.2).abs() < 1e-9);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_probability_sum_is_rejected() {
        let config = EconomyConfig::from_toml_str(
            r#"
            lottery_points_probability = 0.5
            lottery_reward_probability = 0.6
            "#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(EconomyError::Config(_))));
    }

    #[test]
    fn test_redeem_codes_parse() {
        let config = EconomyConfig::from_toml_str(
            r#"
            [[redeem_codes]]
            code = "Spring25"
            once_per_user = true
            action = { kind = "bonus_points", amount = 250 }

            [[redeem_codes]]
            code = "hello"
            action = { kind = "welcome_gift" }
            "#,
        )
        .unwrap();
        assert!(config.validate().is_ok());

        let spring = config.redeem_code("SPRING25").unwrap();
        assert_eq!(spring.action, RedeemAction::BonusPoints { amount: 250 });
        assert!(spring.once_per_user);
        assert!(!config.redeem_code("Hello").unwrap().once_per_user);
        assert!(config.redeem_code("nope").is_none());
    }

    #[test]
    fn test_duplicate_codes_rejected() {
        let mut config = EconomyConfig::default();
        config.redeem_codes.push(RedeemCodeConfig {
            code: "welcome".to_string(),
            action: RedeemAction::WelcomeGift,
            once_per_user: false,
        });
        assert!(matches!(config.validate(), Err(EconomyError::Config(_))));
    }

    #[test]
    fn test_recipe_cycle_blocks_config() {
        let config = EconomyConfig::from_toml_str(
            r#"
            [[default_recipes]]
            id = "a"
            result_item = "a"
            materials = [{ item_id = "b", quantity = 1 }]

            [[default_recipes]]
            id = "b"
            result_item = "b"
            materials = [{ item_id = "a", quantity = 1 }]
            "#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(EconomyError::Config(_))));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result = EconomyConfig::from_toml_str("top3_cost = 5");
        assert!(matches!(result, Err(EconomyError::Config(_))));
    }

    #[test]
    fn test_welcome_gift_duplicates_rejected() {
        let mut config = EconomyConfig::default();
        config.welcome_gift.items.push(ItemQuantity::new("focus_potion", 2));
        assert!(matches!(config.validate(), Err(EconomyError::Config(_))));
    }

    #[test]
    fn test_load_missing_file() {
        let result = EconomyConfig::load("/nonexistent/questline/economy.toml");
        assert!(matches!(result, Err(EconomyError::Config(_))));
    }
}
