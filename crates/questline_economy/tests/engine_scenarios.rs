//! End-to-end tests of the economy engine.

use std::collections::HashSet;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use chrono::NaiveDate;
use questline_economy::{
    parse_date, EconomyConfig, EconomyEngine, EconomyError, EconomyResult, InMemoryTop3Registry,
    LotteryConfig, LotteryOutcome, LotteryResolver, Material, Recipe, RewardType, ScriptedDraws,
    SeededRandom, SourceType, StorageConfig, Top3Registry, TransactionFilter,
};

fn temp_wal_path() -> std::path::PathBuf {
    let id = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("test_questline_engine_{id}.wal"))
}

fn engine() -> EconomyEngine {
    EconomyEngine::in_memory(EconomyConfig::default()).unwrap()
}

fn durable_config(path: &std::path::Path) -> EconomyConfig {
    EconomyConfig {
        storage: StorageConfig {
            wal_path: Some(path.to_path_buf()),
            sync_on_commit: false,
            shard_count: 8,
        },
        ..EconomyConfig::default()
    }
}

fn tasks(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|s| (*s).to_string()).collect()
}

fn new_year() -> NaiveDate {
    parse_date("2025-01-01").unwrap()
}

fn assert_balance_matches_log(engine: &EconomyEngine, user_id: &str) {
    let sum: i64 = engine
        .transactions(user_id, TransactionFilter::default())
        .map(|tx| tx.amount)
        .sum();
    assert_eq!(engine.balance(user_id), sum, "balance drifted from log for {user_id}");
    assert!(engine.audit_user(user_id).is_consistent());
}

/// Registry that refuses every save.
struct FailingRegistry;

impl Top3Registry for FailingRegistry {
    fn has_selection(&self, _user_id: &str, _date: NaiveDate) -> EconomyResult<bool> {
        Ok(false)
    }

    fn save_selection(&self, _user_id: &str, _date: NaiveDate, _task_ids: &[String]) -> EconomyResult<()> {
        Err(EconomyError::Persistence("task store offline".to_string()))
    }

    fn remove_selection(&self, _user_id: &str, _date: NaiveDate) -> EconomyResult<()> {
        Ok(())
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[test]
fn test_scenario_a_completion_pays_once_across_toggles() {
    let engine = engine();
    assert_eq!(engine.balance("u"), 0);

    let first = engine.award_task_completion("u", "task1", "evt1", 10).unwrap();
    assert_eq!(first.points_awarded, 10);
    assert_eq!(first.reward_type, RewardType::TaskComplete);
    assert_eq!(engine.balance("u"), 10);

    // The task is un-completed and completed again by the task domain.
    let second = engine.award_task_completion("u", "task1", "evt1", 10).unwrap();
    assert_eq!(second.points_awarded, 0);
    assert_eq!(second.reward_type.as_str(), "task_already_completed_once");
    assert!(second.transaction.is_none());
    assert_eq!(engine.balance("u"), 10);

    assert_eq!(engine.transactions("u", TransactionFilter::default()).count(), 1);
    assert_balance_matches_log(&engine, "u");
}

#[test]
fn test_scenario_b_top3_purchase_debits_cost() {
    let engine = engine();
    engine.award_task_completion("u", "seed", "seed", 300).unwrap();

    let result = engine
        .purchase_top3("u", new_year(), &tasks(&["t1", "t2", "t3"]), 300)
        .unwrap();
    assert_eq!(result.balance, 0);
    assert_eq!(engine.balance("u"), 0);

    let debits: Vec<_> = engine
        .transactions("u", TransactionFilter::source(SourceType::Top3Cost))
        .collect();
    assert_eq!(debits.len(), 1);
    assert_eq!(debits[0].amount, -300);
    assert_eq!(debits[0].source_type.as_str(), "top3_cost");
    assert_balance_matches_log(&engine, "u");
}

#[test]
fn test_scenario_c_insufficient_balance_changes_nothing() {
    let registry = Arc::new(InMemoryTop3Registry::new());
    let engine = EconomyEngine::new(
        EconomyConfig::default(),
        questline_economy::EconomyStore::in_memory(4),
        registry.clone(),
    )
    .unwrap();
    engine.award_task_completion("u", "seed", "seed", 299).unwrap();

    let result = engine.purchase_top3("u", new_year(), &tasks(&["t1", "t2", "t3"]), 300);
    assert_eq!(
        result,
        Err(EconomyError::InsufficientBalance {
            required: 300,
            available: 299,
        })
    );
    assert_eq!(engine.balance("u"), 299);
    assert_eq!(
        engine
            .transactions("u", TransactionFilter::source(SourceType::Top3Cost))
            .count(),
        0
    );
    assert!(registry.selection("u", new_year()).is_none());
}

#[test]
fn test_scenario_d_welcome_gift_is_repeatable() {
    let engine = engine();

    let first = engine.claim_welcome_gift("u").unwrap();
    let second = engine.claim_welcome_gift("u").unwrap();

    assert_eq!(engine.balance("u"), 2000);
    assert_ne!(first.transaction_group, second.transaction_group);

    let groups: HashSet<_> = engine
        .transactions("u", TransactionFilter::source(SourceType::WelcomeGift))
        .map(|tx| tx.transaction_group)
        .collect();
    assert_eq!(groups.len(), 2);

    let quantities = engine.quantities("u");
    assert_eq!(quantities.len(), 3);
    for item in &first.items {
        assert_eq!(quantities.get(&item.item_id), Some(&(item.quantity * 2)));
    }
    assert_balance_matches_log(&engine, "u");
}

#[test]
fn test_scenario_e_lottery_is_deterministic_given_draws() {
    let config = LotteryConfig {
        points_probability: 0.5,
        reward_probability: 0.5,
        points_amount: 100,
        reward_pool: vec!["focus_potion".to_string()],
    };
    config.validate().unwrap();

    let low = LotteryResolver::resolve(&config, &mut ScriptedDraws::constant(0.3));
    assert_eq!(low, LotteryOutcome::Points { amount: 100 });

    let high = LotteryResolver::resolve(&config, &mut ScriptedDraws::constant(0.7));
    assert_eq!(high.kind(), "reward");
}

// =============================================================================
// Atomicity
// =============================================================================

#[test]
fn test_registry_failure_rolls_back_debit() {
    let engine = EconomyEngine::new(
        EconomyConfig::default(),
        questline_economy::EconomyStore::in_memory(4),
        Arc::new(FailingRegistry),
    )
    .unwrap();
    engine.award_task_completion("u", "seed", "seed", 500).unwrap();

    let result = engine.purchase_top3_at_list_price("u", new_year(), &tasks(&["t1"]));
    assert!(matches!(result, Err(EconomyError::Persistence(_))));
    assert!(result.unwrap_err().is_retryable());
    assert_eq!(engine.balance("u"), 500);
    assert_eq!(engine.transactions("u", TransactionFilter::default()).count(), 1);
}

#[test]
fn test_craft_with_two_of_three_materials_changes_nothing() {
    let engine = engine();
    let inventory = engine.store().inventory();
    inventory.credit("u", "wood", 5).unwrap();
    inventory.credit("u", "stone", 5).unwrap();
    inventory.credit("u", "gem", 1).unwrap();

    let recipe = Recipe::new(
        "amulet",
        "amulet",
        vec![
            Material::new("wood", 2),
            Material::new("stone", 2),
            Material::new("gem", 2),
        ],
    );

    let before = engine.quantities("u");
    let result = engine.craft("u", &recipe);
    assert_eq!(
        result,
        Err(EconomyError::InsufficientInventory {
            item_id: "gem".to_string(),
            required: 2,
            available: 1,
        })
    );
    assert_eq!(engine.quantities("u"), before);
}

#[test]
fn test_craft_reports_first_missing_material() {
    let engine = engine();
    let recipe = Recipe::new(
        "amulet",
        "amulet",
        vec![Material::new("wood", 1), Material::new("gem", 1)],
    );
    let result = engine.craft("u", &recipe);
    assert!(matches!(
        result,
        Err(EconomyError::InsufficientInventory { ref item_id, .. }) if item_id == "wood"
    ));
    assert!(engine.quantities("u").is_empty());
}

#[test]
fn test_craft_conserves_materials() {
    let engine = engine();
    engine.claim_welcome_gift("u").unwrap();
    engine.store().inventory().credit("u", "stardust", 1).unwrap();

    let result = engine.craft_by_id("u", "time_crystal").unwrap();
    assert_eq!(result.item_id, "time_crystal");
    assert_eq!(result.quantities.get("crystal_shard"), Some(&0));
    assert_eq!(result.quantities.get("stardust"), Some(&0));
    assert_eq!(result.quantities.get("time_crystal"), Some(&1));

    // Only the welcome gift row; crafting writes none.
    assert_eq!(engine.transactions("u", TransactionFilter::default()).count(), 1);
}

#[test]
fn test_lottery_reward_shares_one_group() {
    let engine = engine();
    let result = engine
        .resolve_top3_lottery("u", &mut ScriptedDraws::new(vec![0.99, 0.5]))
        .unwrap();

    let item = result.outcome.reward_item().unwrap().to_string();
    assert_eq!(engine.quantities("u").get(&item), Some(&1));

    let rows: Vec<_> = engine
        .transactions("u", TransactionFilter::group(result.transaction_group))
        .collect();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].source_type, SourceType::LotteryReward);
    assert_eq!(rows[0].metadata.get("reward_item"), Some(&item));
}

// =============================================================================
// Concurrency
// =============================================================================

#[test]
fn test_concurrent_duplicate_awards_credit_once() {
    let engine = Arc::new(engine());
    let credited = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let credited = Arc::clone(&credited);
            thread::spawn(move || {
                let result = engine.award_task_completion("u", "task1", "evt1", 10).unwrap();
                if result.points_awarded > 0 {
                    credited.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(credited.load(Ordering::SeqCst), 1);
    assert_eq!(engine.balance("u"), 10);
}

#[test]
fn test_parallel_users_stay_consistent() {
    let engine = Arc::new(engine());

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                let user = format!("user-{t}");
                let mut random = SeededRandom::from_seed(t);
                for i in 0..50 {
                    engine
                        .award_task_completion(&user, "task", &format!("evt-{i}"), 10)
                        .unwrap();
                    engine.resolve_top3_lottery(&user, &mut random).unwrap();
                }
                engine.claim_welcome_gift(&user).unwrap();
                user
            })
        })
        .collect();

    for h in handles {
        let user = h.join().unwrap();
        assert_balance_matches_log(&engine, &user);
        assert!(engine.balance(&user) >= 1500);
    }
}

// =============================================================================
// Durability
// =============================================================================

#[test]
fn test_reopen_restores_every_table() {
    let path = temp_wal_path();
    let config = durable_config(&path);

    {
        let engine = EconomyEngine::open(config.clone(), Arc::new(InMemoryTop3Registry::new())).unwrap();
        engine.award_task_completion("u", "task1", "evt1", 10).unwrap();
        engine.claim_welcome_gift("u").unwrap();
        engine.redeem("u", "QUESTLINE100").unwrap();
        engine
            .resolve_top3_lottery_for_date("u", new_year(), &mut ScriptedDraws::constant(0.1))
            .unwrap();
    }

    let engine = EconomyEngine::open(config, Arc::new(InMemoryTop3Registry::new())).unwrap();
    assert_eq!(engine.balance("u"), 10 + 1000 + 100 + 100);
    assert_eq!(engine.quantities("u").get("crystal_shard"), Some(&3));
    assert_balance_matches_log(&engine, "u");

    // Claims survived the restart.
    assert_eq!(
        engine.award_task_completion("u", "task1", "evt1", 10).unwrap().points_awarded,
        0
    );
    assert!(matches!(
        engine.redeem("u", "questline100"),
        Err(EconomyError::Conflict(_))
    ));
    assert!(engine
        .resolve_top3_lottery_for_date("u", new_year(), &mut ScriptedDraws::constant(0.1))
        .unwrap()
        .outcome()
        .is_none());

    drop(engine);
    std::fs::remove_file(&path).ok();
}

#[test]
fn test_torn_tail_is_discarded_on_reopen() {
    let path = temp_wal_path();
    let config = durable_config(&path);

    {
        let engine = EconomyEngine::open(config.clone(), Arc::new(InMemoryTop3Registry::new())).unwrap();
        engine.award_task_completion("u", "task1", "evt1", 10).unwrap();
    }

    // Simulate a crash in the middle of the next record.
    {
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[7, 0, 0, 0, 0, 0, 0, 0, 1, 200]).unwrap();
    }

    let engine = EconomyEngine::open(config.clone(), Arc::new(InMemoryTop3Registry::new())).unwrap();
    assert_eq!(engine.balance("u"), 10);
    engine.award_task_completion("u", "task2", "evt2", 5).unwrap();
    drop(engine);

    let engine = EconomyEngine::open(config, Arc::new(InMemoryTop3Registry::new())).unwrap();
    assert_eq!(engine.balance("u"), 15);

    drop(engine);
    std::fs::remove_file(&path).ok();
}

#[test]
fn test_bad_lottery_config_blocks_startup() {
    let config = EconomyConfig {
        lottery_points_probability: 0.7,
        lottery_reward_probability: Some(0.7),
        ..EconomyConfig::default()
    };
    assert!(matches!(
        EconomyEngine::in_memory(config),
        Err(EconomyError::Config(_))
    ));
}

#[test]
fn test_welcome_gift_rolls_back_points_when_an_item_credit_fails() {
    let engine = engine();
    let inventory = engine.store().inventory();
    inventory.credit("alice", "crystal_shard", u64::MAX - 1).unwrap();

    // Points row and the first two items are written before crystal_shard overflows.
    let result = engine.claim_welcome_gift("alice");
    assert!(matches!(result, Err(EconomyError::Validation(ref msg)) if msg.contains("overflow")));

    assert_eq!(engine.balance("alice"), 0);
    assert_eq!(engine.transactions("alice", TransactionFilter::default()).count(), 0);
    assert_eq!(inventory.quantity("alice", "focus_potion"), 0);
    assert_eq!(inventory.quantity("alice", "streak_shield"), 0);
    assert_eq!(inventory.quantity("alice", "crystal_shard"), u64::MAX - 1);
    assert_balance_matches_log(&engine, "alice");
}

#[test]
fn test_transaction_time_window_is_half_open() {
    let engine = engine();
    let mut rows = Vec::new();
    for event in ["evt-a", "evt-b", "evt-c"] {
        let award = engine.award_task_completion("alice", "task", event, 10).unwrap();
        rows.push(award.transaction.unwrap());
        thread::sleep(std::time::Duration::from_millis(2));
    }
    let (a, b, c) = (&rows[0], &rows[1], &rows[2]);

    let ids = |filter: TransactionFilter| -> Vec<u64> {
        engine.transactions("alice", filter).map(|tx| tx.id).collect()
    };

    let since_b = TransactionFilter {
        since: Some(b.created_at),
        ..TransactionFilter::default()
    };
    assert_eq!(ids(since_b), vec![b.id, c.id]);

    let until_b = TransactionFilter {
        until: Some(b.created_at),
        ..TransactionFilter::default()
    };
    assert_eq!(ids(until_b), vec![a.id]);

    let window = TransactionFilter {
        since: Some(a.created_at),
        until: Some(c.created_at),
        ..TransactionFilter::default()
    };
    assert_eq!(ids(window), vec![a.id, b.id]);
}

#[test]
fn test_shipped_config_starts_with_fresh_data_directory() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/economy.toml");
    let mut config = EconomyConfig::load(&path).unwrap();
    let dir = temp_wal_path().with_extension("d");
    config.storage.wal_path = Some(dir.join("data").join("economy.wal"));
    config.storage.sync_on_commit = false;

    let engine = EconomyEngine::open(config, Arc::new(InMemoryTop3Registry::new())).unwrap();
    engine.redeem("alice", "QUESTLINE100").unwrap();
    assert_eq!(engine.balance("alice"), 100);

    std::fs::remove_dir_all(&dir).ok();
}
