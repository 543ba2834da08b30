//! 转发设备：在两个套接字之间双向中继消息。
//!
//! ## 设计背景（Why）
//! - 中继拓扑（桥接、代理链）由设备拼装：设备从一侧收、向另一侧发，
//!   本身不理解载荷；
//! - 环路防护靠消息头部的跳地址列表：每经过一跳盖一个本地套接字地址
//!   戳，戳数达到上限的消息被丢弃并记日志，错误只上报给发起方一侧。
//!
//! ## 逻辑解析（How）
//! - 中继循环使用套接字内部的取消安全接收（而非一次性操作句柄），
//!   选择分支被放弃时消息仍留在队列里，不存在中继丢帧窗口；
//! - 两个方向在同一任务内经 `select` 交织，任一侧关闭则设备整体退出。

use crate::aio::Deadline;
use crate::config::RuntimeConfig;
use crate::error::{CoreError, CoreResult};
use crate::message::Message;
use crate::socket::Socket;

/// 双套接字转发设备。
///
/// ## 契约（What）
/// - [`forward`](Device::forward) 为消息盖上来源侧的跳戳后向目的侧发送；
///   跳数达到上限时返回协议错误并丢弃消息；
/// - [`run`](Device::run) 持续双向中继，任一侧关闭后以 `Ok(())` 退出。
pub struct Device {
    max_ttl: u8,
}

impl Device {
    /// 按运行时配置构造设备（跳数上限经约束收敛）。
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            max_ttl: config.effective_max_ttl(),
        }
    }

    /// 生效的跳数上限。
    pub fn max_ttl(&self) -> u8 {
        self.max_ttl
    }

    /// 中继单条消息：`from` 侧收到的 `msg` 盖戳后从 `to` 侧发出。
    pub async fn forward(&self, mut msg: Message, from: &Socket, to: &Socket) -> CoreResult<()> {
        if msg.header.hop_count() >= usize::from(self.max_ttl) {
            tracing::warn!(
                hops = msg.header.hop_count(),
                max = self.max_ttl,
                "hop limit exceeded; message dropped"
            );
            return Err(CoreError::protocol("hop limit exceeded"));
        }
        msg.header.push_hop(from.local_id())?;
        to.send(msg, Deadline::none()).wait().await
    }

    /// 在 `a` 与 `b` 之间持续双向中继，直到任一侧关闭。
    ///
    /// 跳数超限的消息被丢弃后中继继续；只有 `Closed` 终止循环。
    pub async fn run(&self, a: &Socket, b: &Socket) -> CoreResult<()> {
        loop {
            let (msg, from, to) = tokio::select! {
                msg = a.recv_shared() => match msg {
                    Ok(msg) => (msg, a, b),
                    Err(CoreError::Closed) => return Ok(()),
                    Err(err) => return Err(err),
                },
                msg = b.recv_shared() => match msg {
                    Ok(msg) => (msg, b, a),
                    Err(CoreError::Closed) => return Ok(()),
                    Err(err) => return Err(err),
                },
            };
            match self.forward(msg, from, to).await {
                Ok(()) => {}
                Err(CoreError::Closed) => return Ok(()),
                Err(err) => {
                    tracing::debug!(error = %err, "relay forward dropped");
                }
            }
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device").field("max_ttl", &self.max_ttl).finish()
    }
}
