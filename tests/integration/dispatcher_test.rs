//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 请求分发集成测试

use crate::common::{consistency, harness, harness_with_store, ScriptedTier, SlowStore, TierCall};
use freshcache::server::{Request, Response};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

#[path = "../common/mod.rs"]
mod common;

fn put(key: &str, value: &str, ew: f64) -> Request {
    Request::Put {
        key: key.as_bytes().to_vec(),
        value: value.as_bytes().to_vec(),
        ew,
    }
}

fn get(key: &str) -> Request {
    Request::Get {
        key: key.as_bytes().to_vec(),
    }
}

/// TTL 写权重不会触发任何缓存层调用
#[tokio::test]
async fn test_ttl_put_never_calls_cache_tier() {
    let h = harness(ScriptedTier::new(), consistency(0), 2).await;

    let response = h.dispatcher.call(put("k", "v", -2.0)).await;
    assert_eq!(response, Response::Put { success: true });

    h.dispatcher.shutdown().await.unwrap();
    assert!(h.tier.calls().is_empty());
    assert_eq!(h.client.stats().issued, 0);
    assert_eq!(h.accounting.write_count(), 1);
    assert_eq!(h.accounting.load(), 0);
}

/// 按写权重选择失效或更新，并计入负载
#[tokio::test]
async fn test_put_dispatches_by_cost() {
    let h = harness(ScriptedTier::new(), consistency(0), 2).await;

    h.dispatcher.call(put("hot", "v1", 20.0)).await;
    h.dispatcher.call(put("cold", "v2", 0.5)).await;
    h.dispatcher.call(put("forced", "v3", -4.0)).await;
    h.dispatcher.call(put("hint", "v4", -1.0)).await;

    h.dispatcher.shutdown().await.unwrap();

    let calls = h.tier.calls();
    assert_eq!(calls.len(), 4);
    assert!(calls.contains(&TierCall::Invalidate(b"hot".to_vec())));
    assert!(calls.contains(&TierCall::Update(b"cold".to_vec(), b"v2".to_vec())));
    assert!(calls.contains(&TierCall::Update(b"forced".to_vec(), b"v3".to_vec())));
    assert!(calls.contains(&TierCall::Invalidate(b"hint".to_vec())));

    assert_eq!(h.accounting.invalidation_count(), 2);
    assert_eq!(h.accounting.write_count(), 4);
    assert_eq!(h.accounting.load(), 2 * 10 + 2 * 46);
}

/// 非法写权重的写入被拒绝，存储与缓存层都保持原值
#[tokio::test]
async fn test_malformed_weight_rejects_put() {
    let h = harness(ScriptedTier::new(), consistency(0), 2).await;

    let response = h.dispatcher.call(put("k", "old", 0.5)).await;
    assert_eq!(response, Response::Put { success: true });

    for ew in [-7.5, -0.5, f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
        let response = h.dispatcher.call(put("k", "new", ew)).await;
        assert_eq!(response, Response::Put { success: false }, "ew={}", ew);
    }

    assert_eq!(
        h.dispatcher.call(get("k")).await,
        Response::Get {
            value: b"old".to_vec(),
            found: true
        }
    );

    h.dispatcher.shutdown().await.unwrap();
    assert_eq!(
        h.tier.calls(),
        vec![TierCall::Update(b"k".to_vec(), b"old".to_vec())]
    );
    assert_eq!(h.accounting.write_count(), 1);
    assert_eq!(h.dispatcher.executing(), 0);
}

/// 读取未命中不是错误
#[tokio::test]
async fn test_get_miss_returns_not_found() {
    let h = harness(ScriptedTier::new(), consistency(0), 2).await;

    let response = h.dispatcher.call(get("absent")).await;
    assert_eq!(
        response,
        Response::Get {
            value: Vec::new(),
            found: false
        }
    );
    assert_eq!(h.accounting.read_count(), 1);
    assert_eq!(h.accounting.load(), 556);

    h.dispatcher.shutdown().await.unwrap();
    assert!(h.tier.calls().is_empty());
}

/// GetLoad 读出后清零
#[tokio::test]
async fn test_get_load_is_read_and_clear() {
    let h = harness(ScriptedTier::new(), consistency(0), 2).await;

    h.dispatcher.call(get("a")).await;
    h.dispatcher.call(put("a", "1", 0.5)).await;

    assert_eq!(
        h.dispatcher.call(Request::GetLoad).await,
        Response::GetLoad {
            load: 556 + 46,
            success: true
        }
    );
    assert_eq!(
        h.dispatcher.call(Request::GetLoad).await,
        Response::GetLoad {
            load: 0,
            success: true
        }
    );

    // 轮询不影响单调计数
    assert_eq!(
        h.dispatcher.call(Request::GetReadCount).await,
        Response::ReadCount { read_count: 1 }
    );
    assert_eq!(
        h.dispatcher.call(Request::GetWriteCount).await,
        Response::WriteCount { write_count: 1 }
    );

    h.dispatcher.shutdown().await.unwrap();
}

/// K 个并发读取使读计数恰好增加 K
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_gets_count_exactly() {
    const K: usize = 500;
    let h = harness(ScriptedTier::new(), consistency(0), 8).await;

    let pending: Vec<_> = (0..K)
        .map(|i| h.dispatcher.submit(get(&format!("key-{}", i % 17))))
        .collect();
    for rx in pending {
        assert!(matches!(rx.await.unwrap(), Response::Get { .. }));
    }

    assert_eq!(h.accounting.read_count(), K as u64);
    assert_eq!(h.accounting.poll_and_reset_load(), K as u64 * 556);
    h.dispatcher.shutdown().await.unwrap();
}

/// 删除只作用于持久化存储
#[tokio::test]
async fn test_delete_touches_only_the_store() {
    let h = harness(ScriptedTier::new(), consistency(0), 2).await;

    h.dispatcher.call(put("k", "v", -2.0)).await;
    let reads = h.accounting.read_count();
    let writes = h.accounting.write_count();
    let load = h.accounting.load();

    assert_eq!(
        h.dispatcher
            .call(Request::Delete {
                key: b"k".to_vec()
            })
            .await,
        Response::Delete { success: true }
    );
    // 删除不存在的键同样成功
    assert_eq!(
        h.dispatcher
            .call(Request::Delete {
                key: b"never".to_vec()
            })
            .await,
        Response::Delete { success: true }
    );

    assert_eq!(h.accounting.read_count(), reads);
    assert_eq!(h.accounting.write_count(), writes);
    assert_eq!(h.accounting.load(), load);

    h.dispatcher.shutdown().await.unwrap();
    assert!(h.tier.calls().is_empty());
}

/// 缓存层失败不影响写入结果
#[tokio::test]
async fn test_cache_failure_is_contained() {
    let tier = ScriptedTier::new();
    tier.fail_all();
    let h = harness(tier, consistency(0), 2).await;

    let response = h.dispatcher.call(put("k", "v", 20.0)).await;
    assert_eq!(response, Response::Put { success: true });

    h.dispatcher.shutdown().await.unwrap();
    let stats = h.client.stats();
    assert_eq!(stats.failed, 1);
    // 不重试
    assert_eq!(h.tier.started(), 1);
}

/// 执行并发受工作槽位限制，接收不受限
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_execution_is_bounded_but_acceptance_is_not() {
    let store = Arc::new(SlowStore::new(Duration::from_millis(150)));
    let h = harness_with_store(ScriptedTier::new(), store.clone(), consistency(0), 2).await;

    let pending: Vec<_> = (0..6).map(|i| h.dispatcher.submit(get(&i.to_string()))).collect();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.dispatcher.executing(), 2);
    assert_eq!(h.dispatcher.accepted(), 4);

    for rx in pending {
        rx.await.unwrap();
    }
    assert_eq!(store.peak.load(Ordering::SeqCst), 2);
    assert_eq!(h.dispatcher.accepted(), 0);
    assert_eq!(h.dispatcher.executing(), 0);
    h.dispatcher.shutdown().await.unwrap();
}

/// 重复开始记录是成功的空操作
#[tokio::test]
async fn test_start_record_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("record.log");
    let h = harness(ScriptedTier::new(), consistency(0), 2).await;

    for _ in 0..2 {
        let response = h
            .dispatcher
            .call(Request::StartRecord {
                target: target.clone(),
            })
            .await;
        assert_eq!(response, Response::StartRecord { success: true });
    }
    assert!(h.dispatcher.monitor().is_running().await);
    assert_eq!(h.dispatcher.monitor().target(), Some(PathBuf::from(&target)));

    h.dispatcher.shutdown().await.unwrap();
    assert!(!h.dispatcher.monitor().is_running().await);
}

/// 记录文件无法创建时 StartRecord 报告失败
#[tokio::test]
async fn test_start_record_reports_unwritable_target() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(ScriptedTier::new(), consistency(0), 2).await;

    let response = h
        .dispatcher
        .call(Request::StartRecord {
            target: dir.path().join("no_such_dir").join("record.log"),
        })
        .await;
    assert_eq!(response, Response::StartRecord { success: false });
    assert!(!h.dispatcher.monitor().is_running().await);

    h.dispatcher.shutdown().await.unwrap();
}

/// 关闭后的请求得到 Unavailable
#[tokio::test]
async fn test_requests_after_shutdown_are_rejected() {
    let h = harness(ScriptedTier::new(), consistency(0), 2).await;
    h.dispatcher.shutdown().await.unwrap();
    h.dispatcher.shutdown().await.unwrap();

    assert_eq!(h.dispatcher.call(get("k")).await, Response::Unavailable);
    assert_eq!(h.accounting.read_count(), 0);
}
