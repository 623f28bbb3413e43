//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了持久化存储的接口及其实现。

use crate::config::{StoreBackend, StoreConfig};
use crate::error::Result;
use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// 持久化键值存储
///
/// 实现必须能被多个工作线程同时调用。方法是阻塞的，调用方负责把它们放到阻塞线程池上执行。
pub trait KvStore: Send + Sync + std::fmt::Debug {
    /// 读取键，不存在时返回 None
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// 写入键值
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// 删除键，键不存在不是错误
    fn delete(&self, key: &[u8]) -> Result<()>;

    /// 将缓冲中的数据落盘
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// 基于 sled 的持久化存储
#[derive(Debug, Clone)]
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    /// 打开（不存在时创建）存储目录
    #[instrument(skip(path), level = "info", fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::Config::new()
            .path(path.as_ref())
            .mode(sled::Mode::HighThroughput)
            .open()?;
        info!("sled store opened, recovered={}", db.was_recovered());
        Ok(Self { db })
    }
}

impl KvStore for SledStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key)?.map(|v| v.to_vec()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.db.insert(key, value)?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.db.remove(key)?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let bytes = self.db.flush()?;
        debug!("sled flushed {} bytes", bytes);
        Ok(())
    }
}

/// 进程内存储
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<Vec<u8>, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.entries.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

/// 按配置打开持久化存储
///
/// 打开失败对进程是致命的，由调用方决定退出。
pub fn open_store(config: &StoreConfig) -> Result<Arc<dyn KvStore>> {
    match config.backend {
        StoreBackend::Sled => Ok(Arc::new(SledStore::open(&config.path)?)),
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
    }
}
