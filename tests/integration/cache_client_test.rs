//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 缓存层客户端集成测试

use crate::common::{setup_logging, ScriptedTier, TierCall};
use freshcache::backend::tier::CacheTier;
use freshcache::client::{CacheClient, ClientConfig};
use freshcache::error::CoordinatorError;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

#[path = "../common/mod.rs"]
mod common;

fn config(max_in_flight: usize) -> ClientConfig {
    ClientConfig {
        max_in_flight,
        ..ClientConfig::default()
    }
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

/// 第 MAX+1 个调用在前 MAX 个之一完成前不会派发，所有调用最终都会兑现
#[tokio::test]
async fn test_in_flight_cap_blocks_the_next_issuer() {
    setup_logging();
    const MAX: usize = 4;
    let tier = Arc::new(ScriptedTier::gated());
    let client = CacheClient::new(vec![tier.clone()], config(MAX)).unwrap();

    let mut handles = Vec::new();
    for i in 0..MAX {
        handles.push(client.invalidate(format!("k{}", i).into_bytes()).await.unwrap());
    }
    wait_until(|| tier.started() == MAX).await;
    assert_eq!(client.in_flight(), MAX);

    // 第 MAX+1 个调用在闸门处等待
    let blocked = timeout(Duration::from_millis(100), client.invalidate(b"extra".to_vec())).await;
    assert!(blocked.is_err());

    let issuer = {
        let client = client.clone();
        tokio::spawn(async move { client.invalidate(b"extra".to_vec()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(tier.started(), MAX);
    assert!(!issuer.is_finished());

    tier.release(1);
    let extra = issuer.await.unwrap().unwrap();
    wait_until(|| tier.started() == MAX + 1).await;
    assert!(client.in_flight() <= MAX);

    tier.release(MAX);
    handles.push(extra);
    for handle in handles {
        assert!(handle.wait().await);
    }
    assert_eq!(client.in_flight(), 0);
    client.shutdown().await.unwrap();
}

/// 失败兑现为 false，不自动重试
#[tokio::test]
async fn test_failure_resolves_false_without_retry() {
    setup_logging();
    let tier = Arc::new(ScriptedTier::new());
    tier.fail_all();
    let client = CacheClient::new(vec![tier.clone()], config(8)).unwrap();

    assert!(!client.update(b"k".to_vec(), b"v".to_vec()).await.unwrap().wait().await);
    assert_eq!(client.get(b"k".to_vec()).await.unwrap().wait().await, None);
    assert_eq!(client.miss_ratio().await.unwrap().wait().await, None);

    client.shutdown().await.unwrap();
    assert_eq!(tier.started(), 3);
    let stats = client.stats();
    assert_eq!((stats.issued, stats.failed), (3, 3));
}

/// 远程调用超时按失败处理并释放槽位
#[tokio::test]
async fn test_call_timeout_frees_the_slot() {
    let tier = Arc::new(ScriptedTier::gated());
    let client = CacheClient::new(
        vec![tier.clone()],
        ClientConfig {
            max_in_flight: 1,
            call_timeout: Duration::from_millis(50),
            ..ClientConfig::default()
        },
    )
    .unwrap();

    let handle = client.invalidate(b"stuck".to_vec()).await.unwrap();
    assert!(!handle.wait().await);
    assert_eq!(client.in_flight(), 0);
    assert_eq!(client.stats().failed, 1);
    client.shutdown().await.unwrap();
}

/// 配置了等待超时时，闸门满返回 Timeout
#[tokio::test]
async fn test_acquire_timeout_reports_timeout() {
    let tier = Arc::new(ScriptedTier::gated());
    let client = CacheClient::new(
        vec![tier.clone()],
        ClientConfig {
            max_in_flight: 1,
            acquire_timeout: Some(Duration::from_millis(30)),
            ..ClientConfig::default()
        },
    )
    .unwrap();

    let first = client.invalidate(b"a".to_vec()).await.unwrap();
    let err = client.invalidate(b"b".to_vec()).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::Timeout(_)));

    tier.release(1);
    assert!(first.wait().await);
    client.shutdown().await.unwrap();
}

/// 关闭等待在途调用排空
#[tokio::test]
async fn test_shutdown_drains_in_flight_calls() {
    let tier = Arc::new(ScriptedTier::gated());
    let client = CacheClient::new(vec![tier.clone()], config(8)).unwrap();

    let handles: Vec<_> = futures::future::join_all(
        (0..3).map(|i| client.update(vec![i], vec![i])),
    )
    .await
    .into_iter()
    .map(|h| h.unwrap())
    .collect();

    let shutdown = {
        let client = client.clone();
        tokio::spawn(async move { client.shutdown().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!shutdown.is_finished());

    tier.release(3);
    shutdown.await.unwrap().unwrap();
    for handle in handles {
        assert!(handle.wait().await);
    }

    let err = client.update(vec![9], vec![9]).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::ShutdownError(_)));
}

/// 键稳定地路由到同一个端点
#[tokio::test]
async fn test_keys_route_stably_across_endpoints() {
    let a = Arc::new(ScriptedTier::new());
    let b = Arc::new(ScriptedTier::new());
    let endpoints: Vec<Arc<dyn CacheTier>> = vec![a.clone(), b.clone()];
    let client = CacheClient::new(endpoints, config(16)).unwrap();
    assert_eq!(client.endpoint_count(), 2);

    for round in 0..2 {
        for i in 0..64 {
            let key = format!("user:{}", i).into_bytes();
            assert!(client.invalidate(key).await.unwrap().wait().await, "round {}", round);
        }
    }
    client.shutdown().await.unwrap();

    let (calls_a, calls_b) = (a.calls(), b.calls());
    assert_eq!(calls_a.len() + calls_b.len(), 128);
    assert!(!calls_a.is_empty() && !calls_b.is_empty());
    for call in &calls_a {
        assert!(!calls_b.contains(call));
    }
}

/// 设置过期时间广播到所有端点
#[tokio::test]
async fn test_set_ttl_broadcasts() {
    let a = Arc::new(ScriptedTier::new());
    let b = Arc::new(ScriptedTier::new());
    let client = CacheClient::new(vec![a.clone(), b.clone()], config(4)).unwrap();

    assert!(client.set_ttl(60).await.unwrap().wait().await);
    assert!(client.set(b"k".to_vec(), b"v".to_vec(), Some(5)).await.unwrap().wait().await);
    client.shutdown().await.unwrap();

    assert!(a.calls().contains(&TierCall::SetTtl(60)));
    assert!(b.calls().contains(&TierCall::SetTtl(60)));
    assert_eq!(client.stats().issued, 2);
}

/// 小批量、多完成任务下所有调用都能兑现
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_calls_with_small_batches() {
    let tier = Arc::new(ScriptedTier::new());
    let client = CacheClient::new(
        vec![tier.clone()],
        ClientConfig {
            max_in_flight: 16,
            completion_batch_size: 1,
            completion_workers: 3,
            ..ClientConfig::default()
        },
    )
    .unwrap();

    let mut handles = Vec::new();
    for i in 0..300u32 {
        handles.push(client.get(i.to_be_bytes().to_vec()).await.unwrap());
    }
    for handle in handles {
        assert_eq!(handle.wait().await, None);
    }
    client.shutdown().await.unwrap();
    let stats = client.stats();
    assert_eq!((stats.issued, stats.completed, stats.failed), (300, 300, 0));
}
