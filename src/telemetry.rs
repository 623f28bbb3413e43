//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了协调器的日志和链路追踪初始化。

use crate::error::{CoordinatorError, Result};
use opentelemetry::global;
use opentelemetry::trace::TracerProvider;
use opentelemetry_sdk::trace::TracerProvider as SdkTracerProvider;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

/// 追踪守卫，drop 时关闭全局 tracer provider
#[must_use = "dropping the guard shuts down tracing immediately"]
pub struct TelemetryGuard {
    _provider: SdkTracerProvider,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        global::shutdown_tracer_provider();
    }
}

/// 构造日志过滤器
///
/// `RUST_LOG` 优先，否则使用配置中的过滤规则。
pub fn build_filter(default_filter: &str) -> Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .map_err(|e| CoordinatorError::ConfigError(format!("invalid log filter: {}", e)))
}

/// 初始化日志和 OpenTelemetry 追踪
///
/// 应该在进程启动时调用一次。span 进入 OpenTelemetry layer，事件由 fmt layer 输出到标准错误。
///
/// # 参数
///
/// * `service_name` - 服务名称
/// * `log_filter` - 默认日志过滤规则
pub fn init_tracing(service_name: &str, log_filter: &str) -> Result<TelemetryGuard> {
    let filter = build_filter(log_filter)?;

    // 未配置导出器时 provider 只在进程内生成 span 上下文
    let provider = SdkTracerProvider::builder().build();
    global::set_tracer_provider(provider.clone());
    let tracer = provider.tracer(service_name.to_string());

    let subscriber = Registry::default()
        .with(filter)
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(tracing_opentelemetry::layer().with_tracer(tracer));

    tracing::subscriber::set_global_default(subscriber).map_err(|e| {
        CoordinatorError::ConfigError(format!("tracing already initialized: {}", e))
    })?;

    Ok(TelemetryGuard {
        _provider: provider,
    })
}
