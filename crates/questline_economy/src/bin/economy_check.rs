//! # Economy Check
//!
//! Validates an economy config, opens its store (replaying the WAL) and
//! prints a summary. Exits with status 1 if the economy could not start.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use questline_economy::{EconomyConfig, EconomyEngine, EconomyError, InMemoryTop3Registry, RedeemAction};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("Usage: economy_check [config.toml] [options]");
        println!();
        println!("Options:");
        println!("  --wal <path>    Override storage.wal_path");
        println!("  --user <id>     Audit one user after recovery");
        println!("  --verbose       Debug logging (RUST_LOG takes precedence)");
        return ExitCode::SUCCESS;
    }

    let verbose = args.iter().any(|a| a == "--verbose");
    let level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("questline_economy={level}"))),
        )
        .init();

    let flag_value = |name: &str| {
        args.iter()
            .position(|a| a == name)
            .and_then(|i| args.get(i + 1))
            .cloned()
    };
    let config_path = args
        .get(1)
        .filter(|a| !a.starts_with("--"))
        .map(PathBuf::from);
    let wal_override = flag_value("--wal").map(PathBuf::from);
    let audit_user = flag_value("--user");

    let mut config = match &config_path {
        Some(path) => match EconomyConfig::load(path) {
            Ok(config) => config,
            Err(e) => return fail(&e),
        },
        None => EconomyConfig::default(),
    };
    if let Some(wal) = wal_override {
        config.storage.wal_path = Some(wal);
    }

    let engine = match EconomyEngine::open(config, Arc::new(InMemoryTop3Registry::new())) {
        Ok(engine) => engine,
        Err(e) => return fail(&e),
    };
    let config = engine.config();

    println!("== QUESTLINE ECONOMY ==");
    println!(
        "config:        {}",
        config_path
            .as_ref()
            .map_or_else(|| "(built-in defaults)".to_string(), |p| p.display().to_string())
    );
    println!("task points:   {}", config.normal_task_points);
    println!("top3 cost:     {}", config.top3_cost_points);

    let lottery = config.lottery();
    println!(
        "lottery:       {:.2} points ({}) / {:.2} reward from {} items",
        lottery.points_probability,
        lottery.points_amount,
        lottery.reward_probability,
        lottery.reward_pool.len()
    );

    println!("welcome gift:  {} points + {} items", config.welcome_gift.points, config.welcome_gift.items.len());

    println!("recipes:       {}", engine.recipes().len());
    for recipe in engine.recipes().iter() {
        let materials: Vec<String> = recipe
            .materials
            .iter()
            .map(|m| format!("{}x{}", m.quantity, m.item_id))
            .collect();
        println!("  {} -> {} [{}]", recipe.id, recipe.result_item, materials.join(", "));
    }

    println!("redeem codes:  {}", config.redeem_codes.len());
    for code in &config.redeem_codes {
        let action = match code.action {
            RedeemAction::BonusPoints { amount } => format!("+{amount} points"),
            RedeemAction::WelcomeGift => "welcome gift".to_string(),
        };
        let scope = if code.once_per_user { "once per user" } else { "repeatable" };
        println!("  {} -> {action} ({scope})", code.code);
    }

    match &config.storage.wal_path {
        Some(path) => println!("storage:       {} ({} shards)", path.display(), config.storage.shard_count),
        None => println!("storage:       in memory ({} shards)", config.storage.shard_count),
    }

    if let Some(user_id) = audit_user {
        let report = engine.audit_user(&user_id);
        println!();
        println!("audit {user_id}:");
        println!("  balance:      {}", report.cached_balance);
        println!("  recomputed:   {}", report.recomputed_balance);
        println!("  transactions: {}", report.transaction_count);
        println!("  item rows:    {}", report.item_rows);
        for (item_id, quantity) in engine.quantities(&user_id) {
            println!("    {item_id}: {quantity}");
        }
        if !report.is_consistent() {
            println!("  MISMATCH: cached balance differs from the log");
            return ExitCode::FAILURE;
        }
    }

    ExitCode::SUCCESS
}

fn fail(error: &EconomyError) -> ExitCode {
    tracing::error!(error = %error, "economy failed to start");
    eprintln!("error: {error}");
    ExitCode::FAILURE
}
