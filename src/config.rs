//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了协调器的配置结构和解析逻辑。

use crate::error::{CoordinatorError, Result};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_VERSION: u32 = 1;

/// 内存缓存层的端点标识
pub const MEMORY_ENDPOINT: &str = "memory://";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub config_version: Option<u32>,
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub cache: CacheTierConfig,
    #[serde(default)]
    pub consistency: ConsistencyConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
}

/// 全局配置
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct GlobalConfig {
    /// 日志过滤表达式，`RUST_LOG` 优先
    pub log_filter: String,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_filter: "info".to_string(),
        }
    }
}

/// 服务端配置
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ServerConfig {
    /// 监听地址
    pub listen_addr: String,
    /// 执行请求的工作线程数，0 表示按硬件并行度
    pub worker_threads: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:50051".to_string(),
            worker_threads: 0,
        }
    }
}

impl ServerConfig {
    /// 实际使用的工作线程数
    pub fn effective_workers(&self) -> usize {
        if self.worker_threads > 0 {
            return self.worker_threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

/// 持久化存储类型
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// sled 嵌入式存储
    #[default]
    Sled,
    /// 进程内存储，仅用于测试和本地调试
    Memory,
}

/// 持久化存储配置
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// 数据目录
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Sled,
            path: PathBuf::from("fresh.db"),
        }
    }
}

/// 缓存层配置
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct CacheTierConfig {
    /// 缓存层端点，多个端点时按键哈希分片
    pub endpoints: Vec<SecretString>,
    /// 最大并发在途调用数
    pub max_in_flight: usize,
    /// 完成队列单批最多处理的事件数
    pub completion_batch_size: usize,
    /// 完成处理任务数
    pub completion_workers: usize,
    /// 单次远程调用超时（毫秒）
    pub call_timeout_ms: u64,
    /// 建立连接超时（毫秒）
    pub connection_timeout_ms: u64,
    /// 等待并发槽位的超时（毫秒），None 表示一直等待
    pub acquire_timeout_ms: Option<u64>,
}

impl Default for CacheTierConfig {
    fn default() -> Self {
        Self {
            endpoints: vec![SecretString::new(
                "redis://127.0.0.1:6379".to_string().into(),
            )],
            max_in_flight: 1000,
            completion_batch_size: 10,
            completion_workers: 1,
            call_timeout_ms: 3000,
            connection_timeout_ms: 5000,
            acquire_timeout_ms: None,
        }
    }
}

/// 决策策略选择
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// 固定成本常数
    #[default]
    StaticCost,
    /// 按键值大小计算成本
    SizeSensitive,
}

/// 一致性配置
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ConsistencyConfig {
    /// 陈旧度上限（毫秒），0 表示写入时同步决策
    pub staleness_bound_ms: u64,
    pub policy: PolicyKind,
    /// 失效调用成本 C_I
    pub invalidate_cost: u64,
    /// 更新调用成本 C_U
    pub update_cost: u64,
    /// 未命中后读持久化存储的成本 C_D
    pub store_read_cost: u64,
    /// 过载阈值，当前负载超过该值时强制失效
    pub overload_threshold: Option<f64>,
    /// 关闭时是否刷新缓冲区中剩余的写入
    pub flush_on_shutdown: bool,
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            staleness_bound_ms: 0,
            policy: PolicyKind::StaticCost,
            invalidate_cost: 10,
            update_cost: 46,
            store_read_cost: 500,
            overload_threshold: None,
            flush_on_shutdown: true,
        }
    }
}

impl ConsistencyConfig {
    pub fn staleness_bound(&self) -> Duration {
        Duration::from_millis(self.staleness_bound_ms)
    }
}

/// 资源监控配置
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct MonitorConfig {
    /// 采样间隔（毫秒）
    pub sample_interval_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 1000,
        }
    }
}

impl Config {
    /// 从TOML文件加载配置
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content).map_err(|e| {
            CoordinatorError::ConfigError(format!("{}: {}", path.display(), e))
        })
    }

    /// 从TOML字符串解析配置
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| CoordinatorError::ConfigError(e.to_string()))
    }

    /// 验证配置
    ///
    /// 检查配置的有效性，确保所有必需的字段都已设置，并且值在合理范围内
    pub fn validate(&self) -> std::result::Result<(), String> {
        if let Some(version) = self.config_version {
            if version > CONFIG_VERSION {
                return Err(format!(
                    "Configuration version {} is not supported. Current version is {}.",
                    version, CONFIG_VERSION
                ));
            }
        }

        if self.server.listen_addr.trim().is_empty() {
            return Err("server.listen_addr cannot be empty".to_string());
        }

        if self.server.worker_threads > 4096 {
            return Err("server.worker_threads cannot exceed 4096".to_string());
        }

        if self.store.backend == StoreBackend::Sled && self.store.path.as_os_str().is_empty() {
            return Err("store.path cannot be empty for the sled backend".to_string());
        }

        // 验证缓存层配置
        let cache = &self.cache;
        if cache.endpoints.is_empty() {
            return Err("cache.endpoints must list at least one endpoint".to_string());
        }

        for endpoint in &cache.endpoints {
            let raw = endpoint.expose_secret();
            if raw != MEMORY_ENDPOINT
                && !raw.starts_with("redis://")
                && !raw.starts_with("rediss://")
            {
                return Err(format!(
                    "cache endpoint '{}' must be a redis:// URL or {}",
                    crate::utils::redaction::redact_connection_string(raw),
                    MEMORY_ENDPOINT
                ));
            }
        }

        if cache.max_in_flight == 0 {
            return Err("cache.max_in_flight cannot be zero".to_string());
        }

        // Semaphore 许可数上限
        if cache.max_in_flight > (u32::MAX >> 3) as usize {
            return Err("cache.max_in_flight is too large".to_string());
        }

        if cache.completion_batch_size == 0 || cache.completion_batch_size > 10000 {
            return Err("cache.completion_batch_size must be between 1 and 10000".to_string());
        }

        if cache.completion_workers == 0 || cache.completion_workers > 64 {
            return Err("cache.completion_workers must be between 1 and 64".to_string());
        }

        if !(10..=60000).contains(&cache.call_timeout_ms) {
            return Err("cache.call_timeout_ms must be between 10 and 60000 ms".to_string());
        }

        if !(100..=30000).contains(&cache.connection_timeout_ms) {
            return Err("cache.connection_timeout_ms must be between 100 and 30000 ms".to_string());
        }

        if let Some(timeout) = cache.acquire_timeout_ms {
            if timeout == 0 {
                return Err("cache.acquire_timeout_ms cannot be zero when set".to_string());
            }
        }

        // 验证一致性配置
        let consistency = &self.consistency;
        if consistency.staleness_bound_ms > 3_600_000 {
            return Err("consistency.staleness_bound_ms cannot exceed one hour".to_string());
        }

        if consistency.invalidate_cost == 0 || consistency.update_cost == 0 {
            return Err("consistency invalidate_cost and update_cost must be positive".to_string());
        }

        // C_M = C_I + C_U + C_D，失效侧成本 C_I + C_M 也必须可表示
        let within_range = consistency
            .invalidate_cost
            .checked_add(consistency.update_cost)
            .and_then(|sum| sum.checked_add(consistency.store_read_cost))
            .and_then(|miss| miss.checked_add(consistency.invalidate_cost))
            .is_some();
        if !within_range {
            return Err("consistency cost constants overflow when combined".to_string());
        }

        if let Some(threshold) = consistency.overload_threshold {
            if !threshold.is_finite() || threshold <= 0.0 || threshold > 1.0 {
                return Err("consistency.overload_threshold must be in (0, 1]".to_string());
            }
        }

        if !(100..=60000).contains(&self.monitor.sample_interval_ms) {
            return Err("monitor.sample_interval_ms must be between 100 and 60000 ms".to_string());
        }

        Ok(())
    }
}
