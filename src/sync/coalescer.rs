//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了按陈旧度窗口合并写入的缓冲区。
//!
//! 同一窗口内对同一个键的多次写入只保留最后一次，窗口到期时整体取出并逐条交给一致性管线。

use crate::error::{CoordinatorError, Result};
use crate::sync::consistency::ConsistencyPipeline;
use crate::sync::decision::WriteWeight;
use ahash::AHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// 待决策的写入
#[derive(Debug, Clone, PartialEq)]
pub struct PendingWrite {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub weight: WriteWeight,
}

/// 写入合并缓冲区
pub struct WriteCoalescingBuffer {
    pending: Mutex<AHashMap<Vec<u8>, PendingWrite>>,
    pipeline: Arc<ConsistencyPipeline>,
    window: Duration,
    flush_on_shutdown: bool,
    cancel: CancellationToken,
    ticker: AsyncMutex<Option<JoinHandle<()>>>,
    windows_flushed: AtomicU64,
    writes_replayed: AtomicU64,
}

impl std::fmt::Debug for WriteCoalescingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteCoalescingBuffer")
            .field("window", &self.window)
            .field("pending", &self.len())
            .field("flush_on_shutdown", &self.flush_on_shutdown)
            .finish()
    }
}

impl WriteCoalescingBuffer {
    /// 创建缓冲区，窗口必须大于零
    pub fn new(
        pipeline: Arc<ConsistencyPipeline>,
        window: Duration,
        flush_on_shutdown: bool,
    ) -> Result<Self> {
        if window.is_zero() {
            return Err(CoordinatorError::ConfigError(
                "coalescing window must be positive".to_string(),
            ));
        }
        Ok(Self {
            pending: Mutex::new(AHashMap::new()),
            pipeline,
            window,
            flush_on_shutdown,
            cancel: CancellationToken::new(),
            ticker: AsyncMutex::new(None),
            windows_flushed: AtomicU64::new(0),
            writes_replayed: AtomicU64::new(0),
        })
    }

    // 持锁期间不会 panic，中毒的锁照常使用
    fn lock(&self) -> MutexGuard<'_, AHashMap<Vec<u8>, PendingWrite>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// 暂存一次写入，返回是否覆盖了同一个键的旧条目
    pub fn stage(&self, key: Vec<u8>, value: Vec<u8>, weight: WriteWeight) -> bool {
        let entry = PendingWrite {
            key: key.clone(),
            value,
            weight,
        };
        self.lock().insert(key, entry).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// 一次性取出并清空当前窗口的全部条目
    pub fn take(&self) -> Vec<PendingWrite> {
        let drained = std::mem::take(&mut *self.lock());
        drained.into_values().collect()
    }

    /// 刷新当前窗口
    ///
    /// 在锁外逐条重放，刷新期间到达的写入属于下一个窗口。返回重放的条目数。
    #[instrument(skip(self), level = "debug")]
    pub async fn flush(&self) -> usize {
        let batch = self.take();
        if batch.is_empty() {
            return 0;
        }
        let count = batch.len();
        for write in batch {
            if let Err(e) = self.pipeline.apply(write.key, write.value, write.weight).await {
                warn!("coalesced write could not be dispatched: {}", e);
            }
        }
        self.windows_flushed.fetch_add(1, Ordering::Relaxed);
        self.writes_replayed.fetch_add(count as u64, Ordering::Relaxed);
        debug!("flushed {} coalesced writes", count);
        count
    }

    pub fn windows_flushed(&self) -> u64 {
        self.windows_flushed.load(Ordering::Relaxed)
    }

    pub fn writes_replayed(&self) -> u64 {
        self.writes_replayed.load(Ordering::Relaxed)
    }

    /// 启动周期刷新任务，重复调用无效
    pub async fn start(self: &Arc<Self>) {
        let mut ticker = self.ticker.lock().await;
        if ticker.is_some() {
            return;
        }
        let buffer = Arc::clone(self);
        let cancel = self.cancel.clone();
        let window = self.window;
        *ticker = Some(tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + window, window);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        buffer.flush().await;
                    }
                }
            }
        }));
        info!("write coalescing started, window={}ms", window.as_millis());
    }

    /// 停止周期刷新
    ///
    /// 按配置刷新或丢弃剩余条目，返回处理的条目数。
    pub async fn stop(&self) -> usize {
        self.cancel.cancel();
        if let Some(handle) = self.ticker.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("coalescing ticker ended abnormally: {}", e);
            }
        }

        if self.flush_on_shutdown {
            let flushed = self.flush().await;
            info!("write coalescing stopped, flushed {} pending writes", flushed);
            flushed
        } else {
            let discarded = self.take().len();
            if discarded > 0 {
                warn!("write coalescing stopped, discarded {} pending writes", discarded);
            }
            discarded
        }
    }
}
