//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了面向缓存层的异步调用管线。
//!
//! 调用方只在并发闸门处等待；远程调用本身在独立任务中执行，结果推入完成队列，
//! 由完成处理任务成批取出、兑现调用句柄并归还并发槽位。

pub mod sharding;

use crate::backend::tier::CacheTier;
use crate::config::CacheTierConfig;
use crate::error::{CoordinatorError, Result};
use crate::utils::redaction::DisplayKey;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

/// 缓存调用管线配置
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// 最大并发在途调用数
    pub max_in_flight: usize,
    /// 完成队列单批最多处理的事件数
    pub completion_batch_size: usize,
    /// 完成处理任务数
    pub completion_workers: usize,
    /// 单次远程调用超时
    pub call_timeout: Duration,
    /// 等待并发槽位的超时，None 表示一直等待
    pub acquire_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::from(&CacheTierConfig::default())
    }
}

impl From<&CacheTierConfig> for ClientConfig {
    fn from(config: &CacheTierConfig) -> Self {
        Self {
            max_in_flight: config.max_in_flight,
            completion_batch_size: config.completion_batch_size,
            completion_workers: config.completion_workers,
            call_timeout: Duration::from_millis(config.call_timeout_ms),
            acquire_timeout: config.acquire_timeout_ms.map(Duration::from_millis),
        }
    }
}

/// 远程调用类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Get,
    Set,
    Invalidate,
    Update,
    SetTtl,
    GetMissRatio,
}

impl CallKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallKind::Get => "get",
            CallKind::Set => "set",
            CallKind::Invalidate => "invalidate",
            CallKind::Update => "update",
            CallKind::SetTtl => "set_ttl",
            CallKind::GetMissRatio => "get_miss_ratio",
        }
    }

    /// 调用失败时兑现给句柄的值
    fn failure(&self) -> CallOutput {
        match self {
            CallKind::Get => CallOutput::Value(None),
            CallKind::GetMissRatio => CallOutput::Ratio(None),
            _ => CallOutput::Ack(false),
        }
    }
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
enum CallOutput {
    Ack(bool),
    Value(Option<Vec<u8>>),
    Ratio(Option<f64>),
}

/// 在途调用
///
/// 持有一个并发许可，完成处理时许可随之释放。
struct InFlightCall {
    kind: CallKind,
    key: Option<Vec<u8>>,
    endpoint: String,
    outcome: Result<CallOutput>,
    reply: oneshot::Sender<CallOutput>,
    permit: OwnedSemaphorePermit,
}

impl InFlightCall {
    fn complete(self, stats: &ClientStatsInner) {
        let key = self.key.as_deref().map(DisplayKey);
        let output = match self.outcome {
            Ok(output) => {
                if let CallOutput::Ack(false) = output {
                    debug!(kind = %self.kind, key = ?key, endpoint = %self.endpoint, "cache tier reported failure");
                }
                stats.completed.fetch_add(1, Ordering::Relaxed);
                output
            }
            Err(e) => {
                warn!(kind = %self.kind, key = ?key, endpoint = %self.endpoint, "cache tier call failed: {}", e);
                stats.failed.fetch_add(1, Ordering::Relaxed);
                self.kind.failure()
            }
        };
        drop(self.permit);
        // 调用方可能已经放弃句柄
        let _ = self.reply.send(output);
    }
}

/// 调用句柄
///
/// 远程调用完成或失败后兑现；失败兑现为 `false` / `None`。丢弃句柄不会取消调用。
#[must_use = "drop the handle explicitly with `detach` for fire-and-forget calls"]
pub struct CallHandle<T> {
    kind: CallKind,
    rx: oneshot::Receiver<CallOutput>,
    extract: fn(CallOutput) -> Option<T>,
}

impl<T: Default> CallHandle<T> {
    pub fn kind(&self) -> CallKind {
        self.kind
    }

    /// 等待远程结果
    pub async fn wait(self) -> T {
        match self.rx.await {
            Ok(output) => (self.extract)(output).unwrap_or_default(),
            Err(_) => T::default(),
        }
    }

    /// 不关心结果
    pub fn detach(self) {}
}

impl<T> fmt::Debug for CallHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallHandle").field("kind", &self.kind).finish()
    }
}

fn extract_ack(output: CallOutput) -> Option<bool> {
    match output {
        CallOutput::Ack(ok) => Some(ok),
        _ => None,
    }
}

fn extract_value(output: CallOutput) -> Option<Option<Vec<u8>>> {
    match output {
        CallOutput::Value(value) => Some(value),
        _ => None,
    }
}

fn extract_ratio(output: CallOutput) -> Option<Option<f64>> {
    match output {
        CallOutput::Ratio(ratio) => Some(ratio),
        _ => None,
    }
}

#[derive(Debug, Default)]
struct ClientStatsInner {
    issued: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// 调用统计快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClientStats {
    pub issued: u64,
    pub completed: u64,
    pub failed: u64,
    pub in_flight: usize,
}

struct ClientInner {
    endpoints: Vec<Arc<dyn CacheTier>>,
    gate: Arc<Semaphore>,
    config: ClientConfig,
    completions: mpsc::UnboundedSender<InFlightCall>,
    stats: Arc<ClientStatsInner>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// 缓存层客户端
///
/// 并发在途调用数不超过 `max_in_flight`；超出时调用方在闸门处等待，不丢弃也不无界排队。
/// 不做任何自动重试。
#[derive(Clone)]
pub struct CacheClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for CacheClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheClient")
            .field("endpoints", &self.inner.endpoints.len())
            .field("max_in_flight", &self.inner.config.max_in_flight)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl CacheClient {
    /// 创建客户端并启动完成处理任务
    ///
    /// 必须在 tokio 运行时内调用。
    pub fn new(endpoints: Vec<Arc<dyn CacheTier>>, config: ClientConfig) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(CoordinatorError::ConfigError(
                "cache client needs at least one endpoint".to_string(),
            ));
        }
        if config.max_in_flight == 0 {
            return Err(CoordinatorError::ConfigError(
                "max_in_flight cannot be zero".to_string(),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(Mutex::new(rx));
        let stats = Arc::new(ClientStatsInner::default());
        let shutdown = CancellationToken::new();
        let batch_size = config.completion_batch_size.max(1);

        let workers = (0..config.completion_workers.max(1))
            .map(|id| {
                tokio::spawn(run_completions(
                    id,
                    rx.clone(),
                    batch_size,
                    stats.clone(),
                    shutdown.clone(),
                ))
            })
            .collect();

        info!(
            "cache client ready: endpoints={}, max_in_flight={}",
            endpoints.len(),
            config.max_in_flight
        );

        Ok(Self {
            inner: Arc::new(ClientInner {
                endpoints,
                gate: Arc::new(Semaphore::new(config.max_in_flight)),
                config,
                completions: tx,
                stats,
                shutdown,
                closed: AtomicBool::new(false),
                workers: Mutex::new(workers),
            }),
        })
    }

    pub fn max_in_flight(&self) -> usize {
        self.inner.config.max_in_flight
    }

    /// 当前在途调用数
    pub fn in_flight(&self) -> usize {
        if self.inner.gate.is_closed() {
            return 0;
        }
        self.inner
            .config
            .max_in_flight
            .saturating_sub(self.inner.gate.available_permits())
    }

    pub fn endpoint_count(&self) -> usize {
        self.inner.endpoints.len()
    }

    pub fn stats(&self) -> ClientStats {
        let stats = &self.inner.stats;
        ClientStats {
            issued: stats.issued.load(Ordering::Relaxed),
            completed: stats.completed.load(Ordering::Relaxed),
            failed: stats.failed.load(Ordering::Relaxed),
            in_flight: self.in_flight(),
        }
    }

    fn route(&self, key: &[u8]) -> Arc<dyn CacheTier> {
        let idx = sharding::shard_for(key, self.inner.endpoints.len());
        self.inner.endpoints[idx].clone()
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        let acquire = self.inner.gate.clone().acquire_owned();
        let permit = match self.inner.config.acquire_timeout {
            Some(limit) => timeout(limit, acquire).await.map_err(|_| {
                CoordinatorError::Timeout(format!(
                    "no cache call slot freed within {}ms",
                    limit.as_millis()
                ))
            })?,
            None => acquire.await,
        };
        permit.map_err(|_| CoordinatorError::ShutdownError("cache client is shut down".to_string()))
    }

    /// 获取并发槽位后派发远程调用
    async fn issue<F, Fut>(
        &self,
        kind: CallKind,
        key: Option<Vec<u8>>,
        endpoint: String,
        call: F,
    ) -> Result<oneshot::Receiver<CallOutput>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<CallOutput>> + Send + 'static,
    {
        let permit = self.acquire().await?;
        self.inner.stats.issued.fetch_add(1, Ordering::Relaxed);

        let (reply, rx) = oneshot::channel();
        let completions = self.inner.completions.clone();
        let stats = self.inner.stats.clone();
        let call_timeout = self.inner.config.call_timeout;

        tokio::spawn(async move {
            let outcome = match timeout(call_timeout, call()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(CoordinatorError::Timeout(format!(
                    "{} exceeded {}ms",
                    kind,
                    call_timeout.as_millis()
                ))),
            };
            let in_flight = InFlightCall {
                kind,
                key,
                endpoint,
                outcome,
                reply,
                permit,
            };
            // 完成队列已关闭时就地兑现
            if let Err(mpsc::error::SendError(in_flight)) = completions.send(in_flight) {
                in_flight.complete(&stats);
            }
        });

        Ok(rx)
    }

    /// 异步失效
    #[instrument(skip(self, key), level = "trace", fields(key = %DisplayKey(&key)))]
    pub async fn invalidate(&self, key: Vec<u8>) -> Result<CallHandle<bool>> {
        let tier = self.route(&key);
        let endpoint = tier.endpoint();
        let log_key = key.clone();
        let rx = self
            .issue(CallKind::Invalidate, Some(log_key), endpoint, move || async move {
                tier.invalidate(&key).await.map(CallOutput::Ack)
            })
            .await?;
        Ok(CallHandle {
            kind: CallKind::Invalidate,
            rx,
            extract: extract_ack,
        })
    }

    /// 异步更新
    #[instrument(skip(self, key, value), level = "trace", fields(key = %DisplayKey(&key), value_len = value.len()))]
    pub async fn update(&self, key: Vec<u8>, value: Vec<u8>) -> Result<CallHandle<bool>> {
        let tier = self.route(&key);
        let endpoint = tier.endpoint();
        let log_key = key.clone();
        let rx = self
            .issue(CallKind::Update, Some(log_key), endpoint, move || async move {
                tier.update(&key, &value).await.map(CallOutput::Ack)
            })
            .await?;
        Ok(CallHandle {
            kind: CallKind::Update,
            rx,
            extract: extract_ack,
        })
    }

    /// 异步读取
    pub async fn get(&self, key: Vec<u8>) -> Result<CallHandle<Option<Vec<u8>>>> {
        let tier = self.route(&key);
        let endpoint = tier.endpoint();
        let log_key = key.clone();
        let rx = self
            .issue(CallKind::Get, Some(log_key), endpoint, move || async move {
                tier.get(&key).await.map(CallOutput::Value)
            })
            .await?;
        Ok(CallHandle {
            kind: CallKind::Get,
            rx,
            extract: extract_value,
        })
    }

    /// 异步写入
    pub async fn set(
        &self,
        key: Vec<u8>,
        value: Vec<u8>,
        ttl: Option<u64>,
    ) -> Result<CallHandle<bool>> {
        let tier = self.route(&key);
        let endpoint = tier.endpoint();
        let log_key = key.clone();
        let rx = self
            .issue(CallKind::Set, Some(log_key), endpoint, move || async move {
                tier.set(&key, &value, ttl).await.map(CallOutput::Ack)
            })
            .await?;
        Ok(CallHandle {
            kind: CallKind::Set,
            rx,
            extract: extract_ack,
        })
    }

    /// 向所有端点设置默认过期时间，全部成功才算成功
    pub async fn set_ttl(&self, ttl: u64) -> Result<CallHandle<bool>> {
        let endpoints = self.inner.endpoints.clone();
        let rx = self
            .issue(CallKind::SetTtl, None, "*".to_string(), move || async move {
                let results =
                    futures::future::join_all(endpoints.iter().map(|tier| tier.set_ttl(ttl)))
                        .await;
                let mut all_ok = true;
                for result in results {
                    all_ok &= result?;
                }
                Ok(CallOutput::Ack(all_ok))
            })
            .await?;
        Ok(CallHandle {
            kind: CallKind::SetTtl,
            rx,
            extract: extract_ack,
        })
    }

    /// 所有端点未命中率的平均值
    pub async fn miss_ratio(&self) -> Result<CallHandle<Option<f64>>> {
        let endpoints = self.inner.endpoints.clone();
        let rx = self
            .issue(CallKind::GetMissRatio, None, "*".to_string(), move || async move {
                let results =
                    futures::future::join_all(endpoints.iter().map(|tier| tier.miss_ratio()))
                        .await;
                let mut sum = 0.0;
                for result in &results {
                    match result {
                        Ok(ratio) => sum += ratio,
                        Err(e) => return Err(CoordinatorError::CacheTier(e.to_string())),
                    }
                }
                Ok(CallOutput::Ratio(Some(sum / results.len() as f64)))
            })
            .await?;
        Ok(CallHandle {
            kind: CallKind::GetMissRatio,
            rx,
            extract: extract_ratio,
        })
    }

    /// 优雅关闭
    ///
    /// 等待在途调用全部完成，关闭闸门，之后的调用返回 `ShutdownError`，再停止完成处理任务。
    #[instrument(skip(self), level = "info")]
    pub async fn shutdown(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("draining {} in-flight cache calls", self.in_flight());

        let all = self.inner.config.max_in_flight as u32;
        let drained = self
            .inner
            .gate
            .clone()
            .acquire_many_owned(all)
            .await
            .map_err(|_| CoordinatorError::ShutdownError("gate closed twice".to_string()))?;
        self.inner.gate.close();
        drop(drained);

        self.inner.shutdown.cancel();
        let workers = std::mem::take(&mut *self.inner.workers.lock().await);
        for result in futures::future::join_all(workers).await {
            if let Err(e) = result {
                warn!("completion worker ended abnormally: {}", e);
            }
        }

        let stats = self.stats();
        info!(
            "cache client stopped: issued={}, completed={}, failed={}",
            stats.issued, stats.completed, stats.failed
        );
        Ok(())
    }
}

/// 完成处理循环
///
/// 每次最多取出 `batch_size` 个已完成调用，成批兑现以摊薄唤醒开销。
async fn run_completions(
    id: usize,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<InFlightCall>>>,
    batch_size: usize,
    stats: Arc<ClientStatsInner>,
    shutdown: CancellationToken,
) {
    let mut batch = Vec::with_capacity(batch_size);
    loop {
        let received = {
            let mut rx = tokio::select! {
                guard = rx.lock() => guard,
                _ = shutdown.cancelled() => break,
            };
            tokio::select! {
                biased;
                n = rx.recv_many(&mut batch, batch_size) => n,
                _ = shutdown.cancelled() => 0,
            }
        };
        if received == 0 {
            break;
        }
        trace!(worker = id, "completing {} cache calls", received);
        for call in batch.drain(..) {
            call.complete(&stats);
        }
    }
    debug!(worker = id, "completion worker stopped");
}
