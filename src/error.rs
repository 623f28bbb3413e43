//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了协调器的错误类型和处理机制。

use thiserror::Error;

/// 协调器错误类型枚举
///
/// 单个请求内可恢复的错误（存储未命中、缓存层调用失败）由遇到它的组件吸收，
/// 只有资源初始化失败会一路传播到进程入口。
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// 持久化存储操作失败
    #[error("Store operation failed: {0}")]
    Store(String),

    /// sled 存储错误
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),

    /// 缓存层调用失败
    #[error("Cache tier call failed: {0}")]
    CacheTier(String),

    /// Redis错误
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// 非法参数（例如格式错误的写权重）
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// 配置错误
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// IO错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 超时错误
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// 关闭错误
    #[error("Shutdown error: {0}")]
    ShutdownError(String),
}

/// 协调器操作结果类型别名
pub type Result<T> = std::result::Result<T, CoordinatorError>;
