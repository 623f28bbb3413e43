//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了协调器的负载计量：读/写/失效计数器和一个可轮询清零的累计成本。

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// 负载计量
///
/// 所有计数器都是无锁原子量。读、写、失效计数在进程生命周期内单调递增；
/// 累计成本在每次轮询时原子地读出并清零。
#[derive(Debug, Default)]
pub struct LoadAccounting {
    reads: AtomicU64,
    writes: AtomicU64,
    invalidations: AtomicU64,
    load: AtomicU64,
}

/// 计量快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadSnapshot {
    pub read_count: u64,
    pub write_count: u64,
    pub invalidation_count: u64,
    /// 当前累计成本（不清零）
    pub load: u64,
}

impl LoadAccounting {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_invalidation(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    /// 累加成本
    pub fn add_load(&self, cost: u64) {
        self.load.fetch_add(cost, Ordering::AcqRel);
    }

    /// 读出累计成本并清零
    ///
    /// 读与清零是同一个 `swap`，与之竞争的 `add_load` 要么计入本次，要么计入下一次。
    pub fn poll_and_reset_load(&self) -> u64 {
        self.load.swap(0, Ordering::AcqRel)
    }

    /// 查看当前累计成本，不清零
    pub fn load(&self) -> u64 {
        self.load.load(Ordering::Acquire)
    }

    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn invalidation_count(&self) -> u64 {
        self.invalidations.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> LoadSnapshot {
        LoadSnapshot {
            read_count: self.read_count(),
            write_count: self.write_count(),
            invalidation_count: self.invalidation_count(),
            load: self.load(),
        }
    }

    /// 将计量格式化为文本，用于监控系统采集
    pub fn render(&self) -> String {
        let snapshot = self.snapshot();
        let mut output = String::new();
        let _ = writeln!(output, "freshcache_reads_total {}", snapshot.read_count);
        let _ = writeln!(output, "freshcache_writes_total {}", snapshot.write_count);
        let _ = writeln!(
            output,
            "freshcache_invalidations_total {}",
            snapshot.invalidation_count
        );
        let _ = writeln!(output, "freshcache_pending_load {}", snapshot.load);
        output
    }
}

/// 请求状态计数
///
/// 已接收但尚未执行的请求计入 `accepted`，正在执行的计入 `executing`。
#[derive(Debug, Default)]
pub struct RequestGauges {
    accepted: AtomicUsize,
    executing: AtomicUsize,
}

impl RequestGauges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&self) {
        self.accepted.fetch_add(1, Ordering::AcqRel);
    }

    /// Accepted -> Executing
    ///
    /// 返回的守卫释放时转入 Replied，处理过程 panic 时同样释放。
    pub fn begin(&self) -> ExecutingGuard<'_> {
        self.executing.fetch_add(1, Ordering::AcqRel);
        self.accepted.fetch_sub(1, Ordering::AcqRel);
        ExecutingGuard { gauges: self }
    }

    /// 未进入执行就被放弃的请求
    pub fn abandon(&self) {
        self.accepted.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::Acquire)
    }

    pub fn executing(&self) -> usize {
        self.executing.load(Ordering::Acquire)
    }
}

/// 执行中计数守卫
#[derive(Debug)]
#[must_use = "dropping the guard ends execution immediately"]
pub struct ExecutingGuard<'a> {
    gauges: &'a RequestGauges,
}

impl Drop for ExecutingGuard<'_> {
    fn drop(&mut self) {
        self.gauges.executing.fetch_sub(1, Ordering::AcqRel);
    }
}
