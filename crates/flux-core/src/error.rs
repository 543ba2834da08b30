//! 运行时统一错误域。
//!
//! ## 设计背景（Why）
//! - 管道、拨号器、套接字与 QoS 引擎产生的故障必须合流为一套稳定分类，
//!   否则上层无法据此驱动重试、背压或关闭策略；
//! - 错误始终作为操作完成结果向上传播，仅有配置类错误（非法绑定地址、
//!   未知 scheme）允许在建立阶段同步失败。
//!
//! ## 契约说明（What）
//! - 每个变体对应一类处置策略，[`CoreError::is_retryable`] 给出自动重试
//!   判定，供拨号器重连与 QoS 重传复用；
//! - [`CoreError::is_disconnect`] 标记"连接已不可用"类故障，管道据此进入
//!   `Closing` 而非原地重试。

use std::borrow::Cow;
use thiserror::Error;

/// 核心结果别名，约束错误类型为 [`CoreError`]。
pub type CoreResult<T> = Result<T, CoreError>;

/// 跨层共享的稳定错误分类。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 覆盖运行时全部可观察故障：超时、取消、关闭、能力缺失、API 误用、
///   路由不可达、对端协议违例、资源耗尽、底层 IO 与会话存储不可用；
/// - 变体集合即传播契约：管道与传输实现不得发明本枚举之外的失败形态。
///
/// ## 契约（What）
/// - `Timeout` 与 `Canceled` 对消费者不可区分——两者都要求立即停止触碰
///   操作缓冲区；
/// - `Closed` 表示组件正在关闭，是排空阶段所有未决操作的统一完成结果；
/// - `NoPipes` / `Backpressure` 是整个系统的背压边界，按配置二选一。
///
/// ## 注意事项（Trade-offs）
/// - `Io` 持有 `std::io::Error`，因此本枚举不实现 `Clone`；需要多路分发
///   同一故障时应各自重新构造，而非共享实例。
#[derive(Debug, Error)]
pub enum CoreError {
    /// 截止时间先于自然完成到达。
    #[error("operation timed out")]
    Timeout,
    /// 持有者在完成前显式取消。
    #[error("operation canceled")]
    Canceled,
    /// 目标组件正在关闭或已关闭。
    #[error("component closed")]
    Closed,
    /// 未注册的传输 scheme 或未实现的能力。
    #[error("not supported: {0}")]
    NotSupported(Cow<'static, str>),
    /// API 误用，例如对已关闭上下文重复关闭。
    #[error("bad state: {0}")]
    BadState(&'static str),
    /// 当前没有任何可承载消息的管道。
    #[error("no pipes available")]
    NoPipes,
    /// 发送队列已达配置深度。
    #[error("send queue full (backpressure)")]
    Backpressure,
    /// 对端数据违反帧/包格式约束，或转发跳数越限。
    #[error("protocol error: {0}")]
    ProtocolError(Cow<'static, str>),
    /// 分配或连接数上限类失败。
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),
    /// 底层传输 IO 故障。
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// 会话存储暂不可用；QoS 引擎据此推迟而非丢弃重发。
    #[error("session store unavailable: {0}")]
    Store(Cow<'static, str>),
}

impl CoreError {
    /// 构造协议违例错误。
    pub fn protocol(msg: impl Into<Cow<'static, str>>) -> Self {
        CoreError::ProtocolError(msg.into())
    }

    /// 构造能力缺失错误。
    pub fn not_supported(msg: impl Into<Cow<'static, str>>) -> Self {
        CoreError::NotSupported(msg.into())
    }

    /// 判定该故障是否适合由运行时自动重试。
    ///
    /// ## 契约（What）
    /// - 拨号器对 `true` 的故障执行退避重连；QoS 引擎对 `true` 的故障保留
    ///   在途记录等待下一轮重传；
    /// - 应用层发布在耗尽 QoS 尝试预算后的终态失败不经过本判定——那是
    ///   终点，不是重试入口。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::Timeout
                | CoreError::NoPipes
                | CoreError::Backpressure
                | CoreError::Store(_)
                | CoreError::Io(_)
        )
    }

    /// 判定该故障是否意味着所在连接已不可继续使用。
    pub fn is_disconnect(&self) -> bool {
        matches!(self, CoreError::Closed | CoreError::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 验证重试判定与断连判定覆盖既定分类。
    ///
    /// - **意图 (Why)**：拨号器与 QoS 引擎共享 `is_retryable`，若分类漂移
    ///   将导致重连风暴或静默放弃；
    /// - **契约 (What)**：取消/关闭/误用类错误不得被自动重试。
    #[test]
    fn retryable_classification_is_stable() {
        assert!(CoreError::Timeout.is_retryable());
        assert!(CoreError::NoPipes.is_retryable());
        assert!(CoreError::Store("down".into()).is_retryable());
        assert!(!CoreError::Canceled.is_retryable());
        assert!(!CoreError::Closed.is_retryable());
        assert!(!CoreError::BadState("double close").is_retryable());
        assert!(!CoreError::protocol("bad frame").is_retryable());
    }

    #[test]
    fn disconnect_classification_marks_io_and_closed() {
        assert!(CoreError::Closed.is_disconnect());
        assert!(CoreError::Io(std::io::Error::other("reset")).is_disconnect());
        assert!(!CoreError::Timeout.is_disconnect());
    }
}
