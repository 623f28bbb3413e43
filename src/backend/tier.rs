//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了旁路缓存层的调用接口，以及一个进程内实现。

use crate::error::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 缓存层接口
///
/// 缓存层的存储与淘汰由其自身负责，这里只描述协调器会发起的调用。
/// 所有调用对缓存层而言都是幂等的，协调器不做重试。
#[async_trait]
pub trait CacheTier: Send + Sync + std::fmt::Debug {
    /// 读取缓存值
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// 写入缓存值，`ttl` 为秒，None 表示使用缓存层的默认过期时间
    async fn set(&self, key: &[u8], value: &[u8], ttl: Option<u64>) -> Result<bool>;

    /// 使缓存项失效
    async fn invalidate(&self, key: &[u8]) -> Result<bool>;

    /// 用新值刷新缓存项
    async fn update(&self, key: &[u8], value: &[u8]) -> Result<bool>;

    /// 设置缓存层的默认过期时间（秒），0 表示不过期
    async fn set_ttl(&self, ttl: u64) -> Result<bool>;

    /// 缓存层当前的未命中率
    async fn miss_ratio(&self) -> Result<f64>;

    /// 端点描述（已脱敏），用于日志
    fn endpoint(&self) -> String;
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// 进程内缓存层
///
/// 单机部署（端点 `memory://`）和测试使用。不做容量淘汰，只按过期时间丢弃。
#[derive(Debug, Default)]
pub struct MemoryTier {
    entries: DashMap<Vec<u8>, MemoryEntry>,
    default_ttl: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoryTier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 不计入命中统计地查看缓存项
    pub fn peek(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.entries
            .get(key)
            .filter(|e| !e.is_expired())
            .map(|e| e.value.clone())
    }

    fn expiry(&self, ttl: Option<u64>) -> Option<Instant> {
        let secs = ttl.unwrap_or_else(|| self.default_ttl.load(Ordering::Relaxed));
        (secs > 0).then(|| Instant::now() + Duration::from_secs(secs))
    }
}

#[async_trait]
impl CacheTier for MemoryTier {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let found = self.peek(key);
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.entries.remove_if(key, |_, e| e.is_expired());
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        Ok(found)
    }

    async fn set(&self, key: &[u8], value: &[u8], ttl: Option<u64>) -> Result<bool> {
        let entry = MemoryEntry {
            value: value.to_vec(),
            expires_at: self.expiry(ttl),
        };
        self.entries.insert(key.to_vec(), entry);
        Ok(true)
    }

    async fn invalidate(&self, key: &[u8]) -> Result<bool> {
        self.entries.remove(key);
        Ok(true)
    }

    async fn update(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        self.set(key, value, None).await
    }

    async fn set_ttl(&self, ttl: u64) -> Result<bool> {
        self.default_ttl.store(ttl, Ordering::Relaxed);
        Ok(true)
    }

    async fn miss_ratio(&self) -> Result<f64> {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return Ok(0.0);
        }
        Ok(misses as f64 / total as f64)
    }

    fn endpoint(&self) -> String {
        crate::config::MEMORY_ENDPOINT.to_string()
    }
}
