//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了协调器的服务端：请求分发和 HTTP 传输，以及按配置装配所有组件。

pub mod dispatcher;
pub mod http;

pub use dispatcher::{DispatcherComponents, Request, RequestDispatcher, Response};

use crate::backend::{connect_tiers, store::open_store};
use crate::client::{CacheClient, ClientConfig};
use crate::config::Config;
use crate::error::Result;
use crate::metrics::{LoadAccounting, RequestGauges};
use crate::monitor::ResourceMonitor;
use crate::sync::consistency::ConsistencyPipeline;
use crate::sync::decision::DecisionEngine;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

/// 按配置装配分发器
///
/// 打开持久化存储、连接缓存层，任何一步失败都直接返回错误。
#[instrument(skip(config), level = "info")]
pub async fn build(config: &Config) -> Result<RequestDispatcher> {
    let store = open_store(&config.store)?;
    let tiers = connect_tiers(&config.cache).await?;
    let client = CacheClient::new(tiers, ClientConfig::from(&config.cache))?;

    let accounting = Arc::new(LoadAccounting::new());
    let gauges = Arc::new(RequestGauges::new());
    let monitor = ResourceMonitor::new(
        Duration::from_millis(config.monitor.sample_interval_ms),
        gauges.clone(),
        client.clone(),
    );

    let mut pipeline = ConsistencyPipeline::new(
        DecisionEngine::from_config(&config.consistency),
        client,
        accounting.clone(),
    );
    if let Some(threshold) = config.consistency.overload_threshold {
        // 过载覆盖需要持续的负载信号
        monitor.start(None).await?;
        pipeline = pipeline.with_load_signal(Arc::new(monitor.clone()));
        info!("overload override enabled, threshold={}", threshold);
    }

    RequestDispatcher::new(
        DispatcherComponents {
            store,
            pipeline: Arc::new(pipeline),
            accounting,
            gauges,
            monitor,
        },
        &config.consistency,
        config.server.effective_workers(),
    )
    .await
}
