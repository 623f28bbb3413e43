//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了写入后的一致性决策：失效、更新或不动作。

use crate::config::{ConsistencyConfig, PolicyKind};
use crate::error::{CoordinatorError, Result};
use std::fmt;
use tracing::trace;

/// 写权重原始值：依赖缓存层自身过期，不做任何一致性动作
pub const TTL_SENTINEL: f64 = -2.0;
/// 写权重原始值：强制失效
pub const FORCE_INVALIDATE_SENTINEL: f64 = -3.0;
/// 写权重原始值：强制更新
pub const FORCE_UPDATE_SENTINEL: f64 = -4.0;
/// 写权重原始值：建议失效
pub const HINT_INVALIDATE: f64 = -1.0;

/// 写权重
///
/// 非负值是下次写入前预计读取次数的估计，其余是调用方指定动作的哨兵值。
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WriteWeight {
    Ttl,
    ForceInvalidate,
    ForceUpdate,
    HintInvalidate,
    Ratio(f64),
}

impl WriteWeight {
    /// 解析原始写权重
    ///
    /// 非哨兵的负数、NaN 和无穷大都被拒绝，不会被强行归入某个动作。
    pub fn parse(raw: f64) -> Result<Self> {
        if raw == TTL_SENTINEL {
            Ok(WriteWeight::Ttl)
        } else if raw == FORCE_INVALIDATE_SENTINEL {
            Ok(WriteWeight::ForceInvalidate)
        } else if raw == FORCE_UPDATE_SENTINEL {
            Ok(WriteWeight::ForceUpdate)
        } else if raw == HINT_INVALIDATE {
            Ok(WriteWeight::HintInvalidate)
        } else if raw.is_finite() && raw >= 0.0 {
            Ok(WriteWeight::Ratio(raw))
        } else {
            Err(CoordinatorError::InvalidArgument(format!(
                "write weight must be a finite non-negative ratio or a sentinel, got {}",
                raw
            )))
        }
    }

    pub fn raw(&self) -> f64 {
        match self {
            WriteWeight::Ttl => TTL_SENTINEL,
            WriteWeight::ForceInvalidate => FORCE_INVALIDATE_SENTINEL,
            WriteWeight::ForceUpdate => FORCE_UPDATE_SENTINEL,
            WriteWeight::HintInvalidate => HINT_INVALIDATE,
            WriteWeight::Ratio(r) => *r,
        }
    }

    pub fn is_ttl(&self) -> bool {
        matches!(self, WriteWeight::Ttl)
    }
}

impl TryFrom<f64> for WriteWeight {
    type Error = CoordinatorError;

    fn try_from(raw: f64) -> Result<Self> {
        Self::parse(raw)
    }
}

/// 一致性动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Invalidate,
    Update,
    NoAction,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Invalidate => "invalidate",
            Action::Update => "update",
            Action::NoAction => "no_action",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 成本常数
///
/// 负载统计和决策使用同一组常数，不同操作类型的负载因此可以直接比较。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CostModel {
    /// C_I
    pub invalidate_cost: u64,
    /// C_U
    pub update_cost: u64,
    /// C_D
    pub store_read_cost: u64,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            invalidate_cost: 10,
            update_cost: 46,
            store_read_cost: 500,
        }
    }
}

impl CostModel {
    /// 一次未命中的完整代价 C_M = C_I + C_U + C_D
    ///
    /// 常数过大时饱和到 `u64::MAX`，配置校验会先拒绝这种组合。
    pub fn miss_cost(&self) -> u64 {
        self.invalidate_cost
            .saturating_add(self.update_cost)
            .saturating_add(self.store_read_cost)
    }
}

impl From<&ConsistencyConfig> for CostModel {
    fn from(config: &ConsistencyConfig) -> Self {
        Self {
            invalidate_cost: config.invalidate_cost,
            update_cost: config.update_cost,
            store_read_cost: config.store_read_cost,
        }
    }
}

/// 一次决策的成本估计
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostEstimate {
    /// 选择更新的预期成本
    pub update_cost: f64,
    /// 选择失效的预期成本（失效本身加上之后的一次未命中）
    pub alternative_cost: f64,
}

impl CostEstimate {
    /// 只有更新严格更贵时才失效，相等时更新
    pub fn prefers_invalidate(&self) -> bool {
        self.update_cost > self.alternative_cost
    }
}

/// 决策策略
pub trait DecisionPolicy: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn estimate(&self, ratio: f64, key: &[u8], value: &[u8]) -> CostEstimate;
}

/// 固定成本策略
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticCostPolicy {
    costs: CostModel,
}

impl StaticCostPolicy {
    pub fn new(costs: CostModel) -> Self {
        Self { costs }
    }
}

impl DecisionPolicy for StaticCostPolicy {
    fn name(&self) -> &'static str {
        "static_cost"
    }

    fn estimate(&self, ratio: f64, _key: &[u8], _value: &[u8]) -> CostEstimate {
        CostEstimate {
            update_cost: ratio * self.costs.update_cost as f64,
            alternative_cost: self
                .costs
                .invalidate_cost
                .saturating_add(self.costs.miss_cost()) as f64,
        }
    }
}

/// 按大小计算成本的策略
///
/// 更新成本随载荷增长，值越大越倾向于失效。
#[derive(Debug, Clone, Copy, Default)]
pub struct SizeSensitivePolicy;

impl DecisionPolicy for SizeSensitivePolicy {
    fn name(&self) -> &'static str {
        "size_sensitive"
    }

    fn estimate(&self, ratio: f64, key: &[u8], value: &[u8]) -> CostEstimate {
        let key_len = key.len() as f64;
        let value_len = value.len() as f64;
        let invalidate_cost = key_len;
        let miss_cost = value_len + 2.0 * key_len;
        CostEstimate {
            update_cost: ratio * (key_len + value_len),
            alternative_cost: invalidate_cost + miss_cost,
        }
    }
}

/// 决策引擎
///
/// 纯函数，不发起任何调用。哨兵优先于成本模型；过载覆盖只作用于比值权重。
#[derive(Debug)]
pub struct DecisionEngine {
    costs: CostModel,
    policy: Box<dyn DecisionPolicy>,
    overload_threshold: Option<f64>,
}

impl Default for DecisionEngine {
    fn default() -> Self {
        Self::new(CostModel::default(), Box::new(StaticCostPolicy::default()), None)
    }
}

impl DecisionEngine {
    pub fn new(
        costs: CostModel,
        policy: Box<dyn DecisionPolicy>,
        overload_threshold: Option<f64>,
    ) -> Self {
        Self {
            costs,
            policy,
            overload_threshold,
        }
    }

    pub fn from_config(config: &ConsistencyConfig) -> Self {
        let costs = CostModel::from(config);
        let policy: Box<dyn DecisionPolicy> = match config.policy {
            PolicyKind::StaticCost => Box::new(StaticCostPolicy::new(costs)),
            PolicyKind::SizeSensitive => Box::new(SizeSensitivePolicy),
        };
        Self::new(costs, policy, config.overload_threshold)
    }

    pub fn costs(&self) -> &CostModel {
        &self.costs
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    pub fn overload_threshold(&self) -> Option<f64> {
        self.overload_threshold
    }

    /// 固定成本策略翻转为失效时的写权重
    pub fn crossing_point(&self) -> f64 {
        self.costs.invalidate_cost.saturating_add(self.costs.miss_cost()) as f64
            / self.costs.update_cost as f64
    }

    fn overloaded(&self, load_signal: Option<f64>) -> bool {
        match (self.overload_threshold, load_signal) {
            (Some(threshold), Some(load)) => load > threshold,
            _ => false,
        }
    }

    pub fn decide(
        &self,
        key: &[u8],
        value: &[u8],
        weight: WriteWeight,
        load_signal: Option<f64>,
    ) -> Action {
        match weight {
            WriteWeight::Ttl => Action::NoAction,
            WriteWeight::ForceInvalidate => Action::Invalidate,
            WriteWeight::ForceUpdate => Action::Update,
            WriteWeight::HintInvalidate => Action::Invalidate,
            WriteWeight::Ratio(_) if self.overloaded(load_signal) => {
                trace!("overloaded, forcing invalidate");
                Action::Invalidate
            }
            WriteWeight::Ratio(ratio) => {
                let estimate = self.policy.estimate(ratio, key, value);
                let action = if estimate.prefers_invalidate() {
                    Action::Invalidate
                } else {
                    Action::Update
                };
                trace!(
                    policy = self.policy.name(),
                    "ratio={} update_cost={} alternative_cost={} -> {}",
                    ratio,
                    estimate.update_cost,
                    estimate.alternative_cost,
                    action
                );
                action
            }
        }
    }

    /// 从原始写权重决策
    pub fn decide_raw(
        &self,
        key: &[u8],
        value: &[u8],
        ew: f64,
        load_signal: Option<f64>,
    ) -> Result<Action> {
        let weight = WriteWeight::parse(ew)?;
        Ok(self.decide(key, value, weight, load_signal))
    }
}
