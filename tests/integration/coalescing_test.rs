//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 写入合并集成测试

use crate::common::{consistency, harness, ScriptedTier, TierCall};
use freshcache::config::ConsistencyConfig;
use freshcache::server::{Request, Response};
use freshcache::sync::decision::WriteWeight;
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

/// 一个窗口内同一个键的两次写入只产生一次决策，且以最后一次为准
#[tokio::test]
async fn test_hot_key_collapses_to_last_write() {
    let h = harness(ScriptedTier::new(), consistency(60_000), 2).await;
    let buffer = h.dispatcher.coalescer().expect("buffered mode").clone();

    assert_eq!(h.dispatcher.call(put("k", "v1", 0.5)).await, Response::Put { success: true });
    assert_eq!(h.dispatcher.call(put("k", "v2", 0.9)).await, Response::Put { success: true });
    assert_eq!(buffer.len(), 1);
    assert!(h.tier.calls().is_empty());

    assert_eq!(buffer.flush().await, 1);
    assert!(buffer.is_empty());

    h.dispatcher.shutdown().await.unwrap();
    assert_eq!(h.tier.calls(), vec![TierCall::Update(b"k".to_vec(), b"v2".to_vec())]);
    assert_eq!(h.accounting.write_count(), 2);
    assert_eq!(h.accounting.load(), 46);
}

/// 计时器按窗口刷新
#[tokio::test]
async fn test_timer_flushes_each_window() {
    let h = harness(ScriptedTier::new(), consistency(50), 2).await;

    h.dispatcher.call(put("a", "1", 20.0)).await;
    h.dispatcher.call(put("b", "2", 0.5)).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    let buffer = h.dispatcher.coalescer().unwrap();
    assert!(buffer.is_empty());
    assert!(buffer.windows_flushed() >= 1);
    assert_eq!(buffer.writes_replayed(), 2);

    h.dispatcher.shutdown().await.unwrap();
    let calls = h.tier.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls.contains(&TierCall::Invalidate(b"a".to_vec())));
    assert!(calls.contains(&TierCall::Update(b"b".to_vec(), b"2".to_vec())));
}

/// TTL 写入不进入缓冲区
#[tokio::test]
async fn test_ttl_writes_are_not_staged() {
    let h = harness(ScriptedTier::new(), consistency(60_000), 2).await;

    h.dispatcher.call(put("k", "v", -2.0)).await;
    assert!(h.dispatcher.coalescer().unwrap().is_empty());
    assert_eq!(h.accounting.write_count(), 1);

    h.dispatcher.shutdown().await.unwrap();
    assert!(h.tier.calls().is_empty());
}

/// 刷新时先整体取出，之后到达的写入属于下一个窗口
#[tokio::test]
async fn test_writes_after_take_belong_to_next_window() {
    let h = harness(ScriptedTier::new(), consistency(60_000), 2).await;
    let buffer = h.dispatcher.coalescer().unwrap().clone();

    buffer.stage(b"k".to_vec(), b"old".to_vec(), WriteWeight::Ratio(0.5));
    let drained = buffer.take();
    buffer.stage(b"k".to_vec(), b"new".to_vec(), WriteWeight::Ratio(0.5));

    assert_eq!(drained.len(), 1);
    assert_eq!(drained[0].value, b"old".to_vec());
    assert_eq!(buffer.take()[0].value, b"new".to_vec());

    h.dispatcher.shutdown().await.unwrap();
}

/// 关闭时按配置刷新剩余条目
#[tokio::test]
async fn test_shutdown_flushes_pending_writes() {
    let h = harness(ScriptedTier::new(), consistency(60_000), 2).await;
    h.dispatcher.call(put("k", "v", -3.0)).await;

    h.dispatcher.shutdown().await.unwrap();
    assert_eq!(h.tier.calls(), vec![TierCall::Invalidate(b"k".to_vec())]);
    assert_eq!(h.accounting.invalidation_count(), 1);
}

/// 关闭时按配置丢弃剩余条目
#[tokio::test]
async fn test_shutdown_discards_pending_writes() {
    let config = ConsistencyConfig {
        flush_on_shutdown: false,
        ..consistency(60_000)
    };
    let h = harness(ScriptedTier::new(), config, 2).await;
    h.dispatcher.call(put("k", "v", -3.0)).await;

    h.dispatcher.shutdown().await.unwrap();
    assert!(h.tier.calls().is_empty());
    assert_eq!(h.accounting.invalidation_count(), 0);
}
