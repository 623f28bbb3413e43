//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了CLI命令行接口。

use crate::config::{Config, PolicyKind, StoreBackend};
use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use secrecy::SecretString;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "freshcache")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(name = "serve", about = "Run the coordinator")]
    Serve(ServeArgs),

    #[command(name = "validate", about = "Check a configuration file and print the effective settings")]
    Validate(ValidateArgs),
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum PolicyArg {
    StaticCost,
    SizeSensitive,
}

impl From<PolicyArg> for PolicyKind {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::StaticCost => PolicyKind::StaticCost,
            PolicyArg::SizeSensitive => PolicyKind::SizeSensitive,
        }
    }
}

/// 可以覆盖配置文件的选项
#[derive(Args, Debug, Default)]
pub struct Overrides {
    #[arg(long, help = "Listen address, e.g. 0.0.0.0:50051")]
    pub listen: Option<String>,

    #[arg(long, help = "Persistent store directory")]
    pub store_path: Option<PathBuf>,

    #[arg(long, help = "Use the in-process store instead of sled")]
    pub memory_store: bool,

    #[arg(long = "endpoint", help = "Cache tier endpoint (repeatable)")]
    pub endpoints: Vec<String>,

    #[arg(long, help = "Staleness bound in milliseconds, 0 disables coalescing")]
    pub staleness_ms: Option<u64>,

    #[arg(long, help = "Maximum concurrent cache tier calls")]
    pub max_in_flight: Option<usize>,

    #[arg(long, help = "Execution slots, 0 = hardware parallelism")]
    pub workers: Option<usize>,

    #[arg(long, value_enum, help = "Decision policy")]
    pub policy: Option<PolicyArg>,

    #[arg(long, help = "Overload threshold for the CPU load signal (0, 1]")]
    pub overload_threshold: Option<f64>,

    #[arg(long, help = "Log filter, e.g. info or freshcache=debug")]
    pub log_filter: Option<String>,
}

impl Overrides {
    pub fn apply(&self, config: &mut Config) {
        if let Some(listen) = &self.listen {
            config.server.listen_addr = listen.clone();
        }
        if let Some(path) = &self.store_path {
            config.store.path = path.clone();
        }
        if self.memory_store {
            config.store.backend = StoreBackend::Memory;
        }
        if !self.endpoints.is_empty() {
            config.cache.endpoints = self
                .endpoints
                .iter()
                .map(|e| SecretString::new(e.clone().into()))
                .collect();
        }
        if let Some(ms) = self.staleness_ms {
            config.consistency.staleness_bound_ms = ms;
        }
        if let Some(max) = self.max_in_flight {
            config.cache.max_in_flight = max;
        }
        if let Some(workers) = self.workers {
            config.server.worker_threads = workers;
        }
        if let Some(policy) = self.policy {
            config.consistency.policy = policy.into();
        }
        if let Some(threshold) = self.overload_threshold {
            config.consistency.overload_threshold = Some(threshold);
        }
        if let Some(filter) = &self.log_filter {
            config.global.log_filter = filter.clone();
        }
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    #[arg(short, long, help = "Configuration file (TOML)")]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: Overrides,
}

#[derive(Args, Debug)]
pub struct ValidateArgs {
    #[arg(short, long, help = "Configuration file (TOML)")]
    pub config: PathBuf,
}

mod serve;
mod validate;

/// 加载配置文件，未指定时使用默认配置
pub fn load_config(path: Option<&Path>, overrides: &Overrides) -> Result<Config> {
    let mut config = match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => Config::default(),
    };
    overrides.apply(&mut config);
    config
        .validate()
        .map_err(|e| anyhow!("invalid configuration: {}", e))?;
    Ok(config)
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Serve(args) => serve::execute(args).await,
        Commands::Validate(args) => validate::execute(args),
    }
}
