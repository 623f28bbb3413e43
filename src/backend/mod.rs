//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了协调器两侧的外部协作者：持久化存储和旁路缓存层。

pub mod redis_tier;
pub mod store;
pub mod tier;

use crate::config::{CacheTierConfig, MEMORY_ENDPOINT};
use crate::error::Result;
use secrecy::ExposeSecret;
use std::sync::Arc;
use tier::{CacheTier, MemoryTier};

/// 按配置连接所有缓存层端点
pub async fn connect_tiers(config: &CacheTierConfig) -> Result<Vec<Arc<dyn CacheTier>>> {
    let mut tiers: Vec<Arc<dyn CacheTier>> = Vec::with_capacity(config.endpoints.len());
    for endpoint in &config.endpoints {
        if endpoint.expose_secret() == MEMORY_ENDPOINT {
            tiers.push(Arc::new(MemoryTier::new()));
        } else {
            let tier =
                redis_tier::RedisTier::connect(endpoint, config.connection_timeout_ms).await?;
            tiers.push(Arc::new(tier));
        }
    }
    Ok(tiers)
}
