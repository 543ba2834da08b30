//! 显式运行时配置。
//!
//! ## 设计背景（Why）
//! - 跳数上限、队列深度与退避参数若固化为进程级常量，核心将无法在测试中
//!   以不同上限复验状态机；因此全部配置以结构体形式随构造显式传入；
//! - 退避与重传的数值策略是运维调优项，这里只固定状态机形状与不变量。

use crate::message::MAX_MAX_TTL;
use std::time::Duration;

/// 无可用管道时发送路径的背压策略。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackpressureMode {
    /// 入队等待管道挂载，队列满后报 [`Backpressure`](crate::error::CoreError::Backpressure)。
    Queue,
    /// 立即以 [`NoPipes`](crate::error::CoreError::NoPipes) 失败。
    Fail,
}

/// 有上限的指数退避策略。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 拨号器重连与 QoS 重传共享同一策略形状：`min(initial * multiplier^n, max)`；
/// - 不引入抖动——这是数值调优项，调用方可通过更小的 `multiplier` 近似。
///
/// ## 契约（What）
/// - `multiplier` 为 1 时退化为固定间隔；
/// - `next_delay` 单调不减，达到 `max` 后饱和。
#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    /// 首次失败后的等待间隔。
    pub initial: Duration,
    /// 间隔上限。
    pub max: Duration,
    /// 每次失败后的增长倍率。
    pub multiplier: u32,
}

impl BackoffPolicy {
    /// 计算第 `attempt` 次（从 0 计）失败后的等待间隔。
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self
            .multiplier
            .max(1)
            .checked_pow(attempt)
            .unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(30),
            multiplier: 2,
        }
    }
}

/// QoS 投递引擎的调优参数。
#[derive(Clone, Copy, Debug)]
pub struct QosConfig {
    /// 首次重传前的等待间隔。
    pub retry_interval: Duration,
    /// 重传间隔的退避策略；`multiplier = 1` 即固定间隔。
    pub retry_backoff: BackoffPolicy,
    /// 含首发在内的最大投递尝试次数，耗尽后记录被放弃并上报终态失败。
    pub max_attempts: u32,
    /// 每会话在途窗口上限：未退役记录达到上限后，新的 QoS 1/2 发布以
    /// [`Backpressure`](crate::error::CoreError::Backpressure) 拒绝。
    pub max_inflight: usize,
    /// 报文标识符退役后的静默窗口，窗口内不复用亦不重复投递。
    pub quiescence: Duration,
}

impl Default for QosConfig {
    fn default() -> Self {
        let retry_interval = Duration::from_secs(5);
        Self {
            retry_interval,
            retry_backoff: BackoffPolicy {
                initial: retry_interval,
                max: Duration::from_secs(60),
                multiplier: 2,
            },
            max_attempts: 5,
            max_inflight: 32,
            quiescence: Duration::from_secs(30),
        }
    }
}

/// 运行时全量配置，构造套接字时显式传入。
#[derive(Clone, Copy, Debug)]
pub struct RuntimeConfig {
    /// 转发跳数上限，取值被钳制到 `1..=MAX_MAX_TTL`。
    pub max_ttl: u8,
    /// 无管道时发送侧可缓冲的消息条数。
    pub send_queue_depth: usize,
    /// 套接字共享接收队列深度，溢出时丢弃最旧消息并记录告警。
    pub recv_queue_depth: usize,
    /// 发送路径背压策略。
    pub backpressure: BackpressureMode,
    /// 拨号器重连退避。
    pub reconnect: BackoffPolicy,
    /// QoS 引擎参数。
    pub qos: QosConfig,
}

impl RuntimeConfig {
    /// 返回钳制后的合法跳数上限。
    pub fn effective_max_ttl(&self) -> u8 {
        self.max_ttl.clamp(1, MAX_MAX_TTL as u8)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_ttl: MAX_MAX_TTL as u8,
            send_queue_depth: 128,
            recv_queue_depth: 128,
            backpressure: BackpressureMode::Queue,
            reconnect: BackoffPolicy::default(),
            qos: QosConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_growth_saturates_at_cap() {
        let policy = BackoffPolicy {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(1),
            multiplier: 2,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        // 封顶后保持上限。
        assert_eq!(policy.delay_for(10), Duration::from_secs(1));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn multiplier_one_means_fixed_interval() {
        let policy = BackoffPolicy {
            initial: Duration::from_millis(50),
            max: Duration::from_secs(1),
            multiplier: 1,
        };
        assert_eq!(policy.delay_for(7), Duration::from_millis(50));
    }

    #[test]
    fn max_ttl_is_clamped_to_hard_bound() {
        let mut cfg = RuntimeConfig::default();
        cfg.max_ttl = 0;
        assert_eq!(cfg.effective_max_ttl(), 1);
        cfg.max_ttl = 200;
        assert_eq!(cfg.effective_max_ttl(), MAX_MAX_TTL as u8);
        cfg.max_ttl = 4;
        assert_eq!(cfg.effective_max_ttl(), 4);
    }
}
