//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了测试的通用工具函数和设置。

#![allow(dead_code)]

use async_trait::async_trait;
use freshcache::backend::store::{KvStore, MemoryStore};
use freshcache::backend::tier::CacheTier;
use freshcache::client::{CacheClient, ClientConfig};
use freshcache::config::ConsistencyConfig;
use freshcache::error::{CoordinatorError, Result};
use freshcache::metrics::{LoadAccounting, RequestGauges};
use freshcache::monitor::ResourceMonitor;
use freshcache::server::{DispatcherComponents, RequestDispatcher};
use freshcache::sync::consistency::ConsistencyPipeline;
use freshcache::sync::decision::DecisionEngine;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

pub fn setup_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_span_events(FmtSpan::CLOSE)
            .with_env_filter(EnvFilter::new("debug"))
            .try_init()
            .ok();
    });
}

/// 缓存层收到的调用
#[derive(Debug, Clone, PartialEq)]
pub enum TierCall {
    Get(Vec<u8>),
    Set(Vec<u8>, Vec<u8>, Option<u64>),
    Invalidate(Vec<u8>),
    Update(Vec<u8>, Vec<u8>),
    SetTtl(u64),
    MissRatio,
}

/// 可编排的缓存层
///
/// 记录每个到达的调用；`gated` 模式下调用在 `release` 之前一直挂起。
#[derive(Debug, Default)]
pub struct ScriptedTier {
    calls: Mutex<Vec<TierCall>>,
    gate: Option<Semaphore>,
    fail: AtomicBool,
}

impl ScriptedTier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::default()
        }
    }

    /// 放行 `n` 个挂起的调用
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    pub fn fail_all(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<TierCall> {
        self.calls.lock().unwrap().clone()
    }

    /// 已经到达缓存层的调用数
    pub fn started(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    async fn enter(&self, call: TierCall) -> Result<()> {
        self.calls.lock().unwrap().push(call);
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|_| CoordinatorError::CacheTier("gate closed".to_string()))?
                .forget();
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(CoordinatorError::CacheTier("scripted failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheTier for ScriptedTier {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.enter(TierCall::Get(key.to_vec())).await?;
        Ok(None)
    }

    async fn set(&self, key: &[u8], value: &[u8], ttl: Option<u64>) -> Result<bool> {
        self.enter(TierCall::Set(key.to_vec(), value.to_vec(), ttl)).await?;
        Ok(true)
    }

    async fn invalidate(&self, key: &[u8]) -> Result<bool> {
        self.enter(TierCall::Invalidate(key.to_vec())).await?;
        Ok(true)
    }

    async fn update(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        self.enter(TierCall::Update(key.to_vec(), value.to_vec())).await?;
        Ok(true)
    }

    async fn set_ttl(&self, ttl: u64) -> Result<bool> {
        self.enter(TierCall::SetTtl(ttl)).await?;
        Ok(true)
    }

    async fn miss_ratio(&self) -> Result<f64> {
        self.enter(TierCall::MissRatio).await?;
        Ok(0.0)
    }

    fn endpoint(&self) -> String {
        "scripted://".to_string()
    }
}

/// 每次操作都阻塞一段时间的存储，用来占满工作槽位
#[derive(Debug)]
pub struct SlowStore {
    inner: MemoryStore,
    delay: Duration,
    pub active: AtomicUsize,
    pub peak: AtomicUsize,
}

impl SlowStore {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: MemoryStore::new(),
            delay,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    fn slow<T>(&self, op: impl FnOnce() -> T) -> T {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        let out = op();
        self.active.fetch_sub(1, Ordering::SeqCst);
        out
    }
}

impl KvStore for SlowStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.slow(|| self.inner.get(key))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.slow(|| self.inner.put(key, value))
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.slow(|| self.inner.delete(key))
    }
}

/// 测试装配
pub struct Harness {
    pub dispatcher: RequestDispatcher,
    pub tier: Arc<ScriptedTier>,
    pub client: CacheClient,
    pub accounting: Arc<LoadAccounting>,
}

pub fn consistency(staleness_bound_ms: u64) -> ConsistencyConfig {
    ConsistencyConfig {
        staleness_bound_ms,
        ..ConsistencyConfig::default()
    }
}

pub async fn harness(tier: ScriptedTier, consistency: ConsistencyConfig, workers: usize) -> Harness {
    harness_with_store(tier, Arc::new(MemoryStore::new()), consistency, workers).await
}

pub async fn harness_with_store(
    tier: ScriptedTier,
    store: Arc<dyn KvStore>,
    consistency: ConsistencyConfig,
    workers: usize,
) -> Harness {
    setup_logging();
    let tier = Arc::new(tier);
    let client = CacheClient::new(vec![tier.clone()], ClientConfig::default()).unwrap();
    let accounting = Arc::new(LoadAccounting::new());
    let gauges = Arc::new(RequestGauges::new());
    let monitor = ResourceMonitor::new(Duration::from_millis(100), gauges.clone(), client.clone());
    let pipeline = Arc::new(ConsistencyPipeline::new(
        DecisionEngine::from_config(&consistency),
        client.clone(),
        accounting.clone(),
    ));

    let dispatcher = RequestDispatcher::new(
        DispatcherComponents {
            store,
            pipeline,
            accounting: accounting.clone(),
            gauges,
            monitor,
        },
        &consistency,
        workers,
    )
    .await
    .unwrap();

    Harness {
        dispatcher,
        tier,
        client,
        accounting,
    }
}

/// 检查本地 Redis 是否可用，地址可由 `REDIS_URL` 覆盖
pub async fn is_redis_available_default() -> bool {
    if std::env::var("FRESHCACHE_SKIP_REDIS_TESTS").is_ok() {
        return false;
    }
    let redis_url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let client = match redis::Client::open(redis_url.as_str()) {
        Ok(c) => c,
        Err(_) => return false,
    };
    matches!(
        tokio::time::timeout(
            Duration::from_secs(1),
            client.get_multiplexed_async_connection(),
        )
        .await,
        Ok(Ok(_))
    )
}
