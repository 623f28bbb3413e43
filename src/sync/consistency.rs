//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块把决策结果落实为缓存层调用和负载记账。

use crate::client::CacheClient;
use crate::error::Result;
use crate::metrics::LoadAccounting;
use crate::sync::decision::{Action, DecisionEngine, WriteWeight};
use crate::utils::redaction::DisplayKey;
use std::sync::Arc;
use tracing::{debug, instrument};

/// 当前负载信号，取值 `[0, 1]`
pub trait LoadSignal: Send + Sync {
    fn current_load(&self) -> f64;
}

/// 一致性管线
///
/// 决策后以不等待结果的方式派发缓存层调用。调用方只会在并发闸门处等待。
pub struct ConsistencyPipeline {
    engine: DecisionEngine,
    client: CacheClient,
    accounting: Arc<LoadAccounting>,
    load_signal: Option<Arc<dyn LoadSignal>>,
}

impl std::fmt::Debug for ConsistencyPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsistencyPipeline")
            .field("engine", &self.engine)
            .field("client", &self.client)
            .field("load_signal", &self.load_signal.is_some())
            .finish()
    }
}

impl ConsistencyPipeline {
    pub fn new(engine: DecisionEngine, client: CacheClient, accounting: Arc<LoadAccounting>) -> Self {
        Self {
            engine,
            client,
            accounting,
            load_signal: None,
        }
    }

    pub fn with_load_signal(mut self, signal: Arc<dyn LoadSignal>) -> Self {
        self.load_signal = Some(signal);
        self
    }

    pub fn engine(&self) -> &DecisionEngine {
        &self.engine
    }

    pub fn client(&self) -> &CacheClient {
        &self.client
    }

    fn current_load(&self) -> Option<f64> {
        self.engine.overload_threshold()?;
        self.load_signal.as_ref().map(|s| s.current_load())
    }

    /// 对一次写入做决策并派发
    ///
    /// 只有并发闸门关闭或等待超时才会返回错误；远程调用失败由客户端记录。
    #[instrument(skip(self, key, value), level = "debug", fields(key = %DisplayKey(&key)))]
    pub async fn apply(&self, key: Vec<u8>, value: Vec<u8>, weight: WriteWeight) -> Result<Action> {
        let action = self.engine.decide(&key, &value, weight, self.current_load());
        let costs = self.engine.costs();
        match action {
            Action::Invalidate => {
                self.client.invalidate(key).await?.detach();
                self.accounting.add_load(costs.invalidate_cost);
                self.accounting.increment_invalidation();
            }
            Action::Update => {
                self.client.update(key, value).await?.detach();
                self.accounting.add_load(costs.update_cost);
            }
            Action::NoAction => {}
        }
        debug!("consistency action dispatched: {}", action);
        Ok(action)
    }
}
