//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了资源采样服务：周期读取 CPU、网络和磁盘统计，
//! 维护 CPU 负载的滑动平均，并可按需把采样结果追加到记录文件。
//!
//! 利用率、网卡计数和 loadavg 来自 sysinfo；sysinfo 没有的 CPU 时间细分
//! （iowait、steal 等）和磁盘字节数仍读取 `/proc`。

use crate::client::CacheClient;
use crate::error::Result;
use crate::metrics::RequestGauges;
use crate::sync::consistency::LoadSignal;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use sysinfo::{CpuRefreshKind, Networks, RefreshKind, System};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SECTOR_BYTES: u64 = 512;

/// `/proc/stat` 首行的 CPU 时间
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

impl CpuTimes {
    pub fn total(&self) -> u64 {
        self.user
            + self.nice
            + self.system
            + self.idle
            + self.iowait
            + self.irq
            + self.softirq
            + self.steal
    }
}

/// `/proc` 的一次采样
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sample {
    pub cpu: CpuTimes,
    pub disk_read: u64,
    pub disk_write: u64,
}

/// sysinfo 的一次读数，均为自上次刷新以来的值
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SystemReading {
    /// 繁忙时间占比 `[0, 1]`
    pub utilization: f64,
    pub net_recv: u64,
    pub net_send: u64,
}

/// 两次采样之间的差值
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SampleDelta {
    pub system: SystemReading,
    pub usr_pct: f64,
    pub sys_pct: f64,
    pub idle_pct: f64,
    pub iowait_pct: f64,
    pub steal_pct: f64,
    pub disk_read: u64,
    pub disk_write: u64,
}

impl Sample {
    /// 读取当前 `/proc` 统计，非 Linux 系统得到全零
    pub async fn read() -> Self {
        let cpu = tokio::fs::read_to_string("/proc/stat")
            .await
            .ok()
            .and_then(|s| parse_cpu_line(&s))
            .unwrap_or_default();
        let (disk_read, disk_write) = tokio::fs::read_to_string("/proc/diskstats")
            .await
            .map(|s| parse_diskstats(&s, is_whole_disk))
            .unwrap_or_default();
        Self {
            cpu,
            disk_read,
            disk_write,
        }
    }

    pub fn delta_since(&self, previous: &Sample, system: SystemReading) -> SampleDelta {
        let total = self.cpu.total().saturating_sub(previous.cpu.total());
        let pct = |now: u64, before: u64| {
            if total == 0 {
                0.0
            } else {
                now.saturating_sub(before) as f64 / total as f64 * 100.0
            }
        };
        SampleDelta {
            system,
            usr_pct: pct(self.cpu.user, previous.cpu.user),
            sys_pct: pct(self.cpu.system, previous.cpu.system),
            idle_pct: pct(self.cpu.idle, previous.cpu.idle),
            iowait_pct: pct(self.cpu.iowait, previous.cpu.iowait),
            steal_pct: pct(self.cpu.steal, previous.cpu.steal),
            disk_read: self.disk_read.saturating_sub(previous.disk_read),
            disk_write: self.disk_write.saturating_sub(previous.disk_write),
        }
    }
}

fn parse_cpu_line(stat: &str) -> Option<CpuTimes> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .take(8)
        .map(|v| v.parse().unwrap_or(0))
        .collect();
    if fields.len() < 4 {
        return None;
    }
    let at = |i: usize| fields.get(i).copied().unwrap_or(0);
    Some(CpuTimes {
        user: at(0),
        nice: at(1),
        system: at(2),
        idle: at(3),
        iowait: at(4),
        irq: at(5),
        softirq: at(6),
        steal: at(7),
    })
}

/// 汇总磁盘读写字节数，分区不重复计入
fn parse_diskstats(content: &str, is_disk: impl Fn(&str) -> bool) -> (u64, u64) {
    content
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let device = fields.get(2)?;
            if !is_disk(device) {
                return None;
            }
            let read = fields.get(5)?.parse::<u64>().ok()?;
            let written = fields.get(9)?.parse::<u64>().ok()?;
            Some((read * SECTOR_BYTES, written * SECTOR_BYTES))
        })
        .fold((0, 0), |(r, w), (read, written)| (r + read, w + written))
}

fn is_whole_disk(device: &str) -> bool {
    !device.starts_with("loop")
        && !device.starts_with("ram")
        && Path::new("/sys/block").join(device).exists()
}

/// sysinfo 句柄，归采样任务独占
struct SystemStats {
    system: System,
    networks: Networks,
}

impl SystemStats {
    fn new() -> Self {
        Self {
            system: System::new_with_specifics(
                RefreshKind::new().with_cpu(CpuRefreshKind::new().with_cpu_usage()),
            ),
            networks: Networks::new_with_refreshed_list(),
        }
    }

    fn refresh(&mut self) -> SystemReading {
        self.system.refresh_cpu();
        self.networks.refresh();

        let cpus = self.system.cpus();
        let utilization = if cpus.is_empty() {
            0.0
        } else {
            let usage: f32 = cpus.iter().map(|cpu| cpu.cpu_usage()).sum();
            (usage / cpus.len() as f32 / 100.0).clamp(0.0, 1.0) as f64
        };
        let (net_recv, net_send) = sum_interfaces(
            self.networks
                .list()
                .iter()
                .map(|(name, data)| (name.as_str(), data.received(), data.transmitted())),
        );
        SystemReading {
            utilization,
            net_recv,
            net_send,
        }
    }
}

/// 汇总除回环外所有网卡的收发字节数
fn sum_interfaces<'a>(interfaces: impl Iterator<Item = (&'a str, u64, u64)>) -> (u64, u64) {
    interfaces
        .filter(|(name, _, _)| !name.starts_with("lo"))
        .fold((0, 0), |(r, s), (_, recv, send)| {
            (r.saturating_add(recv), s.saturating_add(send))
        })
}

#[derive(Default)]
struct SamplerState {
    task: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

struct MonitorInner {
    interval: Duration,
    /// 滑动平均 CPU 负载，f64 位模式
    cpu_load: AtomicU64,
    target: Mutex<Option<PathBuf>>,
    gauges: Arc<RequestGauges>,
    client: CacheClient,
}

impl MonitorInner {
    fn target(&self) -> Option<PathBuf> {
        self.target
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_target(&self, target: Option<PathBuf>) {
        *self.target.lock().unwrap_or_else(PoisonError::into_inner) = target;
    }

    fn record_utilization(&self, utilization: f64) -> f64 {
        let previous = f64::from_bits(self.cpu_load.load(Ordering::Acquire));
        let smoothed = previous * 0.5 + utilization * 0.5;
        self.cpu_load.store(smoothed.to_bits(), Ordering::Release);
        smoothed
    }
}

/// 资源采样服务
///
/// 显式启动和停止，按需注入。同时只有一个采样任务。
#[derive(Clone)]
pub struct ResourceMonitor {
    inner: Arc<MonitorInner>,
    state: Arc<AsyncMutex<SamplerState>>,
}

impl std::fmt::Debug for ResourceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceMonitor")
            .field("interval", &self.inner.interval)
            .field("target", &self.inner.target())
            .field("cpu_load", &self.current_load())
            .finish()
    }
}

impl ResourceMonitor {
    pub fn new(interval: Duration, gauges: Arc<RequestGauges>, client: CacheClient) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                interval,
                cpu_load: AtomicU64::new(0f64.to_bits()),
                target: Mutex::new(None),
                gauges,
                client,
            }),
            state: Arc::new(AsyncMutex::new(SamplerState::default())),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.state
            .lock()
            .await
            .task
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    pub fn target(&self) -> Option<PathBuf> {
        self.inner.target()
    }

    /// 启动采样
    ///
    /// 已在运行时不重复启动；如果运行中的采样还没有记录文件，则挂上 `target`。
    /// 记录文件在这里创建，无法打开时返回错误且不改变采样状态。
    pub async fn start(&self, target: Option<PathBuf>) -> Result<()> {
        let mut state = self.state.lock().await;
        let running = state.task.as_ref().is_some_and(|t| !t.is_finished());
        if running {
            match (self.inner.target(), target) {
                (None, Some(target)) => {
                    open_target(&target).await?;
                    info!("resource recording attached to {}", target.display());
                    self.inner.set_target(Some(target));
                }
                (Some(current), Some(requested)) if current != requested => {
                    debug!(
                        "resource recording already writes to {}, ignoring {}",
                        current.display(),
                        requested.display()
                    );
                }
                _ => {}
            }
            return Ok(());
        }

        if let Some(target) = &target {
            open_target(target).await?;
            info!("resource recording started, target={}", target.display());
        }
        self.inner.set_target(target);
        let cancel = CancellationToken::new();
        state.cancel = cancel.clone();
        state.task = Some(tokio::spawn(run_sampler(self.inner.clone(), cancel)));
        Ok(())
    }

    /// 停止采样并清除记录目标
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        state.cancel.cancel();
        if let Some(task) = state.task.take() {
            if let Err(e) = task.await {
                warn!("resource sampler ended abnormally: {}", e);
            }
        }
        self.inner.set_target(None);
    }
}

impl LoadSignal for ResourceMonitor {
    fn current_load(&self) -> f64 {
        f64::from_bits(self.inner.cpu_load.load(Ordering::Acquire))
    }
}

async fn run_sampler(inner: Arc<MonitorInner>, cancel: CancellationToken) {
    let mut stats = SystemStats::new();
    let mut previous = Sample::read().await;
    let mut ticker = tokio::time::interval(inner.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // 第一次 tick 立即完成
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let current = Sample::read().await;
        let delta = current.delta_since(&previous, stats.refresh());
        previous = current;
        let smoothed = inner.record_utilization(delta.system.utilization);

        if let Some(target) = inner.target() {
            let line = format_record(&delta, smoothed, &inner);
            if let Err(e) = append_line(&target, &line).await {
                warn!("failed to append resource record to {}: {}", target.display(), e);
            }
        }
    }
    debug!("resource sampler stopped");
}

fn format_record(delta: &SampleDelta, smoothed: f64, inner: &MonitorInner) -> String {
    let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
    let loadavg = System::load_average();
    format!(
        "{} - CPU Utilization: {:.2}% (avg {:.2}%) | usr: {:.2}%, sys: {:.2}%, idle: {:.2}%, iowait: {:.2}%, steal: {:.2}% | Network recv: {} bytes, send: {} bytes | Disk read: {} bytes, write: {} bytes | loadavg: {:.2} {:.2} {:.2} | executing: {}, in_flight: {}\n",
        timestamp,
        delta.system.utilization * 100.0,
        smoothed * 100.0,
        delta.usr_pct,
        delta.sys_pct,
        delta.idle_pct,
        delta.iowait_pct,
        delta.steal_pct,
        delta.system.net_recv,
        delta.system.net_send,
        delta.disk_read,
        delta.disk_write,
        loadavg.one,
        loadavg.five,
        loadavg.fifteen,
        inner.gauges.executing(),
        inner.client.in_flight(),
    )
}

async fn open_target(target: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(target).await
}

async fn append_line(target: &Path, line: &str) -> std::io::Result<()> {
    let mut file = open_target(target).await?;
    file.write_all(line.as_bytes()).await
}
