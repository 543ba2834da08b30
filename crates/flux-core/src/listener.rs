//! 监听器：被动端端点，长期接受入站连接。
//!
//! ## 契约说明（What）
//! - 绑定/权限类错误在 [`Socket::listen`](crate::Socket::listen) 处同步
//!   返回，调用方能立即发现配置问题；
//! - 接受成功的连接直接挂载为套接字管道；单次接受失败只记日志并继续，
//!   监听端保持存活；
//! - 关闭幂等，已挂载的管道不受监听器关闭影响。

use crate::aio::Cancellation;
use crate::error::{CoreError, CoreResult};
use crate::socket::SocketShared;
use crate::transport::Transport;
use std::sync::Arc;

/// 被动端端点句柄。
pub struct Listener {
    local_addr: String,
    closed: Cancellation,
}

impl Listener {
    pub(crate) async fn start(
        socket: Arc<SocketShared>,
        transport: Arc<dyn Transport>,
        addr: String,
    ) -> CoreResult<Self> {
        let acceptor = transport.listen(&addr).await?;
        let local_addr = format!("{}://{}", transport.scheme(), acceptor.local_addr());
        tracing::info!(addr = %local_addr, "listening");
        let closed = Cancellation::new();
        let listener = Self {
            local_addr,
            closed: closed.clone(),
        };
        tokio::spawn(async move {
            loop {
                let conn = tokio::select! {
                    _ = closed.cancelled() => break,
                    _ = socket.closed.cancelled() => break,
                    conn = acceptor.accept() => conn,
                };
                match conn {
                    Ok(conn) => {
                        if socket.attach(conn).is_err() {
                            break;
                        }
                    }
                    Err(CoreError::Closed) => break,
                    Err(err) => {
                        tracing::warn!(error = %err, "accept failed; continuing");
                    }
                }
            }
            acceptor.close().await;
        });
        Ok(listener)
    }

    /// 实际绑定地址（含 scheme），`:0` 端口绑定后在此回查。
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    /// 停止接受新连接（幂等）。
    pub fn close(&self) {
        self.closed.cancel();
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}
