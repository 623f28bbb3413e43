//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了请求分发器：接收不受限，执行受工作槽位限制。
//!
//! 每个请求对应一个任务，状态依次为 Accepted -> Executing -> Replied，且只回复一次。

use crate::backend::store::KvStore;
use crate::config::ConsistencyConfig;
use crate::error::{CoordinatorError, Result};
use crate::metrics::{LoadAccounting, RequestGauges};
use crate::monitor::ResourceMonitor;
use crate::sync::coalescer::WriteCoalescingBuffer;
use crate::sync::consistency::ConsistencyPipeline;
use crate::sync::decision::WriteWeight;
use crate::utils::redaction::DisplayKey;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, debug_span, error, info, instrument, warn, Instrument};
use uuid::Uuid;

/// 请求
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Put { key: Vec<u8>, value: Vec<u8>, ew: f64 },
    Get { key: Vec<u8> },
    Delete { key: Vec<u8> },
    GetLoad,
    GetReadCount,
    GetWriteCount,
    StartRecord { target: PathBuf },
}

impl Request {
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Put { .. } => "put",
            Request::Get { .. } => "get",
            Request::Delete { .. } => "delete",
            Request::GetLoad => "get_load",
            Request::GetReadCount => "get_read_count",
            Request::GetWriteCount => "get_write_count",
            Request::StartRecord { .. } => "start_record",
        }
    }
}

/// 响应
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Put { success: bool },
    Get { value: Vec<u8>, found: bool },
    Delete { success: bool },
    GetLoad { load: u64, success: bool },
    ReadCount { read_count: u64 },
    WriteCount { write_count: u64 },
    StartRecord { success: bool },
    /// 分发器已关闭，请求未执行
    Unavailable,
}

/// 写入后的一致性路径，启动时按陈旧度上限二选一
#[derive(Debug)]
enum WritePath {
    Direct,
    Buffered(Arc<WriteCoalescingBuffer>),
}

/// 分发器依赖的组件
#[derive(Debug)]
pub struct DispatcherComponents {
    pub store: Arc<dyn KvStore>,
    pub pipeline: Arc<ConsistencyPipeline>,
    pub accounting: Arc<LoadAccounting>,
    pub gauges: Arc<RequestGauges>,
    pub monitor: ResourceMonitor,
}

struct DispatcherInner {
    store: Arc<dyn KvStore>,
    pipeline: Arc<ConsistencyPipeline>,
    write_path: WritePath,
    accounting: Arc<LoadAccounting>,
    gauges: Arc<RequestGauges>,
    monitor: ResourceMonitor,
    slots: Arc<Semaphore>,
    workers: usize,
    closed: AtomicBool,
}

/// 请求分发器
#[derive(Clone)]
pub struct RequestDispatcher {
    inner: Arc<DispatcherInner>,
}

impl std::fmt::Debug for RequestDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestDispatcher")
            .field("workers", &self.inner.workers)
            .field("write_path", &self.inner.write_path)
            .field("accepted", &self.accepted())
            .field("executing", &self.executing())
            .finish()
    }
}

impl RequestDispatcher {
    /// 创建分发器
    ///
    /// 陈旧度上限为 0 时写入同步决策，否则进入合并缓冲区并启动刷新任务。
    pub async fn new(
        components: DispatcherComponents,
        consistency: &ConsistencyConfig,
        workers: usize,
    ) -> Result<Self> {
        if workers == 0 {
            return Err(CoordinatorError::ConfigError(
                "dispatcher needs at least one worker".to_string(),
            ));
        }

        let write_path = if consistency.staleness_bound_ms == 0 {
            WritePath::Direct
        } else {
            let buffer = Arc::new(WriteCoalescingBuffer::new(
                components.pipeline.clone(),
                consistency.staleness_bound(),
                consistency.flush_on_shutdown,
            )?);
            buffer.start().await;
            WritePath::Buffered(buffer)
        };

        info!(
            "request dispatcher ready: workers={}, policy={}, write_path={}",
            workers,
            components.pipeline.engine().policy_name(),
            match write_path {
                WritePath::Direct => "direct",
                WritePath::Buffered(_) => "buffered",
            }
        );

        Ok(Self {
            inner: Arc::new(DispatcherInner {
                store: components.store,
                pipeline: components.pipeline,
                write_path,
                accounting: components.accounting,
                gauges: components.gauges,
                monitor: components.monitor,
                slots: Arc::new(Semaphore::new(workers)),
                workers,
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn workers(&self) -> usize {
        self.inner.workers
    }

    /// 已接收尚未开始执行的请求数
    pub fn accepted(&self) -> usize {
        self.inner.gauges.accepted()
    }

    pub fn executing(&self) -> usize {
        self.inner.gauges.executing()
    }

    pub fn accounting(&self) -> &Arc<LoadAccounting> {
        &self.inner.accounting
    }

    pub fn pipeline(&self) -> &Arc<ConsistencyPipeline> {
        &self.inner.pipeline
    }

    pub fn monitor(&self) -> &ResourceMonitor {
        &self.inner.monitor
    }

    /// 合并缓冲区，同步模式下为 None
    pub fn coalescer(&self) -> Option<&Arc<WriteCoalescingBuffer>> {
        match &self.inner.write_path {
            WritePath::Direct => None,
            WritePath::Buffered(buffer) => Some(buffer),
        }
    }

    /// 接收请求
    ///
    /// 不等待任何东西：请求立即交给独立任务，执行在工作槽位空出后开始。
    pub fn submit(&self, request: Request) -> oneshot::Receiver<Response> {
        let (reply, rx) = oneshot::channel();
        if self.inner.closed.load(Ordering::Acquire) {
            let _ = reply.send(Response::Unavailable);
            return rx;
        }

        self.inner.gauges.accept();
        let inner = self.inner.clone();
        let span = debug_span!("request", id = %Uuid::new_v4(), kind = request.kind());
        tokio::spawn(async move {
            let slot = match inner.slots.clone().acquire_owned().await {
                Ok(slot) => slot,
                Err(_) => {
                    inner.gauges.abandon();
                    let _ = reply.send(Response::Unavailable);
                    return;
                }
            };
            let executing = inner.gauges.begin();
            let response = inner.handle(request).await;
            drop(executing);
            drop(slot);
            // 调用方可能已经放弃等待
            let _ = reply.send(response);
        }
        .instrument(span));
        rx
    }

    /// 接收请求并等待回复
    pub async fn call(&self, request: Request) -> Response {
        self.submit(request).await.unwrap_or(Response::Unavailable)
    }

    /// 优雅关闭
    ///
    /// 停止接收新请求，等待已接收的请求执行完，然后按顺序停止合并缓冲区、
    /// 缓存层客户端和资源采样，最后落盘存储。
    #[instrument(skip(self), level = "info")]
    pub async fn shutdown(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(
            "dispatcher shutting down: accepted={}, executing={}",
            self.accepted(),
            self.executing()
        );

        let drained = self
            .inner
            .slots
            .clone()
            .acquire_many_owned(self.inner.workers as u32)
            .await
            .map_err(|_| CoordinatorError::ShutdownError("worker slots already closed".to_string()))?;
        self.inner.slots.close();
        drop(drained);

        if let WritePath::Buffered(buffer) = &self.inner.write_path {
            buffer.stop().await;
        }
        self.inner.pipeline.client().shutdown().await?;
        self.inner.monitor.stop().await;

        let store = self.inner.store.clone();
        tokio::task::spawn_blocking(move || store.flush())
            .await
            .map_err(|e| CoordinatorError::ShutdownError(format!("store flush task failed: {}", e)))??;

        info!("dispatcher stopped");
        Ok(())
    }
}

impl DispatcherInner {
    async fn handle(&self, request: Request) -> Response {
        debug!("executing request");
        match request {
            Request::Put { key, value, ew } => self.put(key, value, ew).await,
            Request::Get { key } => self.get(key).await,
            Request::Delete { key } => self.delete(key).await,
            Request::GetLoad => Response::GetLoad {
                load: self.accounting.poll_and_reset_load(),
                success: true,
            },
            Request::GetReadCount => Response::ReadCount {
                read_count: self.accounting.read_count(),
            },
            Request::GetWriteCount => Response::WriteCount {
                write_count: self.accounting.write_count(),
            },
            Request::StartRecord { target } => {
                let success = match self.monitor.start(Some(target)).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("failed to start resource recording: {}", e);
                        false
                    }
                };
                Response::StartRecord { success }
            }
        }
    }

    /// 在阻塞线程池上执行存储操作
    async fn with_store<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn KvStore) -> Result<T> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || op(store.as_ref()))
            .await
            .map_err(|e| CoordinatorError::Store(format!("store task failed: {}", e)))?
    }

    async fn put(&self, key: Vec<u8>, value: Vec<u8>, ew: f64) -> Response {
        // 非法写权重直接拒绝，不写存储，避免存储与缓存层分叉
        let weight = match WriteWeight::parse(ew) {
            Ok(weight) => weight,
            Err(e) => {
                warn!(key = %DisplayKey(&key), "put rejected: {}", e);
                return Response::Put { success: false };
            }
        };

        let (k, v) = (key.clone(), value.clone());
        let success = match self.with_store(move |store| store.put(&k, &v)).await {
            Ok(()) => true,
            Err(e) => {
                error!(key = %DisplayKey(&key), "store put failed: {}", e);
                false
            }
        };

        match (weight, &self.write_path) {
            (WriteWeight::Ttl, _) => {}
            (weight, WritePath::Direct) => {
                if let Err(e) = self.pipeline.apply(key, value, weight).await {
                    warn!("consistency action not dispatched: {}", e);
                }
            }
            (weight, WritePath::Buffered(buffer)) => {
                buffer.stage(key, value, weight);
            }
        }

        self.accounting.increment_write();
        Response::Put { success }
    }

    async fn get(&self, key: Vec<u8>) -> Response {
        let k = key.clone();
        let response = match self.with_store(move |store| store.get(&k)).await {
            Ok(Some(value)) => Response::Get { value, found: true },
            Ok(None) => Response::Get {
                value: Vec::new(),
                found: false,
            },
            Err(e) => {
                error!(key = %DisplayKey(&key), "store get failed: {}", e);
                Response::Get {
                    value: Vec::new(),
                    found: false,
                }
            }
        };
        self.accounting
            .add_load(self.pipeline.engine().costs().miss_cost());
        self.accounting.increment_read();
        response
    }

    async fn delete(&self, key: Vec<u8>) -> Response {
        let k = key.clone();
        let success = match self.with_store(move |store| store.delete(&k)).await {
            Ok(()) => true,
            Err(e) => {
                error!(key = %DisplayKey(&key), "store delete failed: {}", e);
                false
            }
        };
        Response::Delete { success }
    }
}
