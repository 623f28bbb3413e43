//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! serve 子命令：装配组件并在 HTTP 上提供服务，直到收到 Ctrl-C。

use crate::cli::{load_config, ServeArgs};
use crate::server::{self, http};
use crate::telemetry;
use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{info, warn};

pub async fn execute(args: &ServeArgs) -> Result<()> {
    let config = load_config(args.config.as_deref(), &args.overrides)?;
    let _guard = telemetry::init_tracing("freshcache", &config.global.log_filter)?;

    info!("freshcache {} starting", crate::VERSION);
    let dispatcher = server::build(&config)
        .await
        .context("failed to initialize the coordinator")?;

    let listener = TcpListener::bind(&config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen_addr))?;

    http::serve(listener, dispatcher.clone(), shutdown_signal()).await?;

    info!("transport stopped, draining");
    dispatcher.shutdown().await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
