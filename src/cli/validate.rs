//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! validate 子命令：检查配置文件并打印生效的设置。

use crate::cli::{load_config, Overrides, ValidateArgs};
use crate::config::Config;
use crate::sync::decision::DecisionEngine;
use crate::utils::redaction::redact_connection_string;
use anyhow::Result;
use secrecy::ExposeSecret;

pub fn execute(args: &ValidateArgs) -> Result<()> {
    let config = load_config(Some(&args.config), &Overrides::default())?;
    print_summary(&config);
    Ok(())
}

fn print_summary(config: &Config) {
    let engine = DecisionEngine::from_config(&config.consistency);

    println!("=== Configuration OK ===\n");
    println!("Listen:      {}", config.server.listen_addr);
    println!("Workers:     {}", config.server.effective_workers());
    println!(
        "Store:       {:?} ({})",
        config.store.backend,
        config.store.path.display()
    );
    println!("Endpoints:");
    for endpoint in &config.cache.endpoints {
        println!("  - {}", redact_connection_string(endpoint.expose_secret()));
    }
    println!("In-flight:   {}", config.cache.max_in_flight);
    if config.consistency.staleness_bound_ms == 0 {
        println!("Writes:      synchronous decision");
    } else {
        println!(
            "Writes:      coalesced every {}ms",
            config.consistency.staleness_bound_ms
        );
    }
    println!("Policy:      {}", engine.policy_name());
    let costs = engine.costs();
    println!(
        "Costs:       C_I={} C_U={} C_D={} (C_M={})",
        costs.invalidate_cost,
        costs.update_cost,
        costs.store_read_cost,
        costs.miss_cost()
    );
    if engine.policy_name() == "static_cost" {
        println!("Crossing:    ew > {:.3} invalidates", engine.crossing_point());
    }
    match config.consistency.overload_threshold {
        Some(threshold) => println!("Overload:    invalidate when CPU load > {}", threshold),
        None => println!("Overload:    disabled"),
    }
}
