//! freshcache - 数据层一致性协调器
//!
//! 位于持久化键值存储和旁路缓存层之间，每次写入时按成本在失效和更新之间选择，
//! 让缓存层的陈旧度保持在给定窗口内，同时不阻塞主读写路径。

#![doc(html_root_url = "https://docs.rs/freshcache/0.1.0")]

pub use tokio;

pub mod backend;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod metrics;
pub mod monitor;
pub mod server;
pub mod sync;
pub mod telemetry;
pub mod utils;

// Re-export commonly used items
pub use client::{CacheClient, CallHandle, ClientConfig};
pub use config::Config;
pub use error::{CoordinatorError, Result};
pub use metrics::LoadAccounting;
pub use server::{Request, RequestDispatcher, Response};
pub use sync::decision::{Action, DecisionEngine, WriteWeight};

/// freshcache 版本号
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
