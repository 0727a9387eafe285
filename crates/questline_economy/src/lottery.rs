//! # Lottery
//!
//! **Points-or-Reward Draws from an Injectable Random Source**
//!
//! One uniform draw in `[0, 1)` decides the outcome kind:
//!
//! ```text
//! 0.0                 points_probability                1.0
//!  ├──────── points ──────────┼────────── reward ─────────┤
//! ```
//!
//! A reward outcome consumes a second draw to pick an item uniformly from
//! the pool. Resolution is a pure function of the configuration and the
//! draws, so a [`ScriptedDraws`] source reproduces any outcome exactly.
//!
//! Probabilities are validated when the configuration loads, never per draw.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::error::{EconomyError, EconomyResult};
use crate::types::ItemId;

/// Tolerance for `points_probability + reward_probability == 1.0`.
const PROBABILITY_EPSILON: f64 = 1e-9;

/// Source of uniform draws for the lottery.
pub trait RandomSource {
    /// Returns a uniform value in `[0, 1)`.
    fn next_unit(&mut self) -> f64;

    /// Returns a uniform index in `0..len`. `len` is never zero.
    fn next_index(&mut self, len: usize) -> usize {
        // Clamp guards against a source that returns exactly 1.0.
        let scaled = (self.next_unit() * len as f64) as usize;
        scaled.min(len - 1)
    }
}

/// ChaCha8-backed source. Seed it to reproduce a run.
#[derive(Clone, Debug)]
pub struct SeededRandom {
    rng: ChaCha8Rng,
}

impl SeededRandom {
    /// Creates a reproducible source from a seed.
    #[must_use]
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Creates a source seeded from the operating system.
    #[must_use]
    pub fn from_entropy() -> Self {
        Self {
            rng: ChaCha8Rng::from_entropy(),
        }
    }
}

impl RandomSource for SeededRandom {
    fn next_unit(&mut self) -> f64 {
        self.rng.gen::<f64>()
    }

    fn next_index(&mut self, len: usize) -> usize {
        self.rng.gen_range(0..len)
    }
}

/// Replays a fixed list of draws, cycling when exhausted.
#[derive(Clone, Debug)]
pub struct ScriptedDraws {
    draws: Vec<f64>,
    next: usize,
}

impl ScriptedDraws {
    /// Creates a source that returns `draws` in order.
    ///
    /// # Panics
    ///
    /// Panics if `draws` is empty.
    #[must_use]
    pub fn new(draws: Vec<f64>) -> Self {
        assert!(!draws.is_empty(), "ScriptedDraws needs at least one draw");
        Self { draws, next: 0 }
    }

    /// A source that always returns `value`.
    #[must_use]
    pub fn constant(value: f64) -> Self {
        Self::new(vec![value])
    }
}

impl RandomSource for ScriptedDraws {
    fn next_unit(&mut self) -> f64 {
        let value = self.draws[self.next % self.draws.len()];
        self.next += 1;
        value
    }
}

/// Lottery parameters. Built from the economy configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LotteryConfig {
    /// Chance of a points outcome.
    pub points_probability: f64,
    /// Chance of a reward outcome.
    pub reward_probability: f64,
    /// Points paid on a points outcome.
    pub points_amount: i64,
    /// Items a reward outcome picks from, uniformly.
    pub reward_pool: Vec<ItemId>,
}

impl LotteryConfig {
    /// Checks the probabilities and the pool.
    ///
    /// # Errors
    ///
    /// Returns `Config` if a probability is outside `[0, 1]`, the two do not
    /// sum to 1.0, the points amount is negative, or rewards are possible
    /// with an empty pool.
    pub fn validate(&self) -> EconomyResult<()> {
        for (name, p) in [
            ("points_probability", self.points_probability),
            ("reward_probability", self.reward_probability),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(EconomyError::Config(format!(
                    "lottery {name} must be within [0, 1], got {p}"
                )));
            }
        }

        let sum = self.points_probability + self.reward_probability;
        if (sum - 1.0).abs() > PROBABILITY_EPSILON {
            return Err(EconomyError::Config(format!(
                "lottery probabilities must sum to 1.0, got {sum}"
            )));
        }

        if self.points_amount < 0 {
            return Err(EconomyError::Config(format!(
                "lottery points_amount must not be negative, got {}",
                self.points_amount
            )));
        }

        if self.reward_probability > 0.0 && self.reward_pool.is_empty() {
            return Err(EconomyError::Config(
                "lottery reward_pool is empty but reward_probability > 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// The result of one lottery draw.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LotteryOutcome {
    /// The user wins points.
    Points {
        /// Points won.
        amount: i64,
    },
    /// The user wins one unit of an item.
    Reward {
        /// The item won.
        item_id: ItemId,
    },
}

impl LotteryOutcome {
    /// Stable wire name of the outcome kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Points { .. } => "points",
            Self::Reward { .. } => "reward",
        }
    }

    /// Points won, if this is a points outcome.
    #[must_use]
    pub const fn points_amount(&self) -> Option<i64> {
        match self {
            Self::Points { amount } => Some(*amount),
            Self::Reward { .. } => None,
        }
    }

    /// Item won, if this is a reward outcome.
    #[must_use]
    pub fn reward_item(&self) -> Option<&str> {
        match self {
            Self::Points { .. } => None,
            Self::Reward { item_id } => Some(item_id),
        }
    }
}

/// Stateless outcome selector.
#[derive(Clone, Copy, Debug, Default)]
pub struct LotteryResolver;

impl LotteryResolver {
    /// Draws one outcome.
    ///
    /// `config` must have passed [`LotteryConfig::validate`]. An unvalidated
    /// config with an empty pool falls back to a points outcome.
    pub fn resolve(config: &LotteryConfig, random: &mut impl RandomSource) -> LotteryOutcome {
        let draw = random.next_unit();
        if draw < config.points_probability || config.reward_pool.is_empty() {
            return LotteryOutcome::Points {
                amount: config.points_amount,
            };
        }

        let index = random.next_index(config.reward_pool.len());
        LotteryOutcome::Reward {
            item_id: config.reward_pool[index].clone(),
        }
    }
}
