//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了基于Redis的缓存层实现。

use crate::backend::tier::CacheTier;
use crate::error::{CoordinatorError, Result};
use crate::utils::redaction::redact_connection_string;
use async_trait::async_trait;
use redis::{aio::ConnectionManager, Client};
use secrecy::{ExposeSecret, SecretString};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::{timeout, Duration};
use tracing::{debug, instrument};

/// Redis缓存层
///
/// 失效对应 `DEL`，更新对应 `SET`。Redis 没有全局默认过期时间，
/// `set_ttl` 设置的值保存在本地，之后的写入都带上 `EX`。
pub struct RedisTier {
    manager: ConnectionManager,
    endpoint: String,
    default_ttl: AtomicU64,
}

impl std::fmt::Debug for RedisTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisTier")
            .field("endpoint", &self.endpoint)
            .field("default_ttl", &self.default_ttl.load(Ordering::Relaxed))
            .finish()
    }
}

impl RedisTier {
    /// 连接Redis端点
    ///
    /// # 参数
    ///
    /// * `connection_string` - Redis连接字符串
    /// * `connection_timeout_ms` - 建立连接超时（毫秒）
    #[instrument(skip(connection_string), level = "info")]
    pub async fn connect(
        connection_string: &SecretString,
        connection_timeout_ms: u64,
    ) -> Result<Self> {
        let raw = connection_string.expose_secret();
        let endpoint = redact_connection_string(raw);
        let client = Client::open(raw)?;
        let manager = match timeout(
            Duration::from_millis(connection_timeout_ms),
            client.get_connection_manager(),
        )
        .await
        {
            Ok(res) => res?,
            Err(_) => {
                return Err(CoordinatorError::CacheTier(format!(
                    "Connection timed out after {}ms. Target: {}",
                    connection_timeout_ms, endpoint
                )));
            }
        };
        debug!("connected to cache tier {}", endpoint);
        Ok(Self {
            manager,
            endpoint,
            default_ttl: AtomicU64::new(0),
        })
    }

    async fn write(&self, key: &[u8], value: &[u8], ttl: Option<u64>) -> Result<bool> {
        let ttl = ttl.unwrap_or_else(|| self.default_ttl.load(Ordering::Relaxed));
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if ttl > 0 {
            cmd.arg("EX").arg(ttl);
        }
        let mut conn = self.manager.clone();
        let reply: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(reply.is_some())
    }
}

#[async_trait]
impl CacheTier for RedisTier {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut conn = self.manager.clone();
        let value: Option<Vec<u8>> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &[u8], value: &[u8], ttl: Option<u64>) -> Result<bool> {
        self.write(key, value, ttl).await
    }

    async fn invalidate(&self, key: &[u8]) -> Result<bool> {
        let mut conn = self.manager.clone();
        // 键本来就不在缓存里也算失效成功
        let _removed: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(true)
    }

    async fn update(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        self.write(key, value, None).await
    }

    async fn set_ttl(&self, ttl: u64) -> Result<bool> {
        self.default_ttl.store(ttl, Ordering::Relaxed);
        Ok(true)
    }

    async fn miss_ratio(&self) -> Result<f64> {
        let mut conn = self.manager.clone();
        let info: String = redis::cmd("INFO").arg("stats").query_async(&mut conn).await?;
        Ok(parse_miss_ratio(&info))
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }
}

/// 从 `INFO stats` 输出中计算未命中率
fn parse_miss_ratio(info: &str) -> f64 {
    let field = |name: &str| -> u64 {
        info.lines()
            .filter_map(|line| line.trim().strip_prefix(name))
            .filter_map(|rest| rest.strip_prefix(':'))
            .find_map(|v| v.trim().parse().ok())
            .unwrap_or(0)
    };
    let hits = field("keyspace_hits");
    let misses = field("keyspace_misses");
    if hits + misses == 0 {
        return 0.0;
    }
    misses as f64 / (hits + misses) as f64
}
