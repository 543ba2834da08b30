//! 拨号器：主动端端点，失败退避重试、失联自动重连。
//!
//! ## 设计背景（Why）
//! - 对上层而言"连到那边去"是一次声明而非一次动作：拨号器在后台驱动
//!   建连，失败按指数退避重试，已建立的管道丢失后自动回到拨号状态；
//! - 同一时刻一个拨号器至多维持一条管道，重连不会堆出第二条。
//!
//! ## 逻辑解析（How）
//! - 单任务状态机：`拨号 →（失败退避 | 成功挂载）→ 等待管道移除 → 拨号`；
//! - 管道移除经一次性通道回执感知（套接字事件任务在摘除管道表项时
//!   触发），拨号器自身不持有管道引用；
//! - 关闭令牌在每个等待点参与选择，套接字关闭与拨号器关闭同义。

use crate::aio::Cancellation;
use crate::socket::SocketShared;
use crate::transport::Transport;
use std::sync::Arc;

/// 主动端端点句柄。
///
/// ## 契约（What）
/// - [`close`](Dialer::close) 幂等；关闭停止重试与重连，但不摘除已经
///   挂载到套接字上的管道（管道归套接字所有）；
/// - 句柄丢弃等同关闭。
pub struct Dialer {
    url: String,
    closed: Cancellation,
}

impl Dialer {
    pub(crate) fn start(
        socket: Arc<SocketShared>,
        transport: Arc<dyn Transport>,
        addr: String,
    ) -> Self {
        let closed = Cancellation::new();
        let url = format!("{}://{addr}", transport.scheme());
        let dialer = Self {
            url: url.clone(),
            closed: closed.clone(),
        };
        tokio::spawn(async move {
            let mut attempt: u32 = 0;
            loop {
                if closed.is_cancelled() || socket.is_closed() {
                    break;
                }
                let conn = tokio::select! {
                    _ = closed.cancelled() => break,
                    _ = socket.closed.cancelled() => break,
                    conn = transport.dial(&addr) => conn,
                };
                match conn {
                    Ok(conn) => {
                        attempt = 0;
                        let removed = match socket.attach(conn) {
                            Ok(removed) => removed,
                            Err(_) => break,
                        };
                        tokio::select! {
                            _ = closed.cancelled() => break,
                            _ = socket.closed.cancelled() => break,
                            // 管道移除（对端断开、本地关闭均可）触发重连。
                            _ = removed => {
                                tracing::info!(url = %url, "pipe lost; redialing");
                            }
                        }
                    }
                    Err(err) => {
                        attempt = attempt.saturating_add(1);
                        let delay = socket.config.reconnect.delay_for(attempt - 1);
                        tracing::debug!(
                            url = %url,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "dial failed; backing off"
                        );
                        tokio::select! {
                            _ = closed.cancelled() => break,
                            _ = socket.closed.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        });
        dialer
    }

    /// 目标 URL。
    pub fn url(&self) -> &str {
        &self.url
    }

    /// 停止重试与重连（幂等）。
    pub fn close(&self) {
        self.closed.cancel();
    }
}

impl Drop for Dialer {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

impl std::fmt::Debug for Dialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialer").field("url", &self.url).finish()
    }
}
