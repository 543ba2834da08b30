#![deny(unsafe_code)]
#![doc = r#"
# flux-transport-inproc

## 设计动机（Why）
- **定位**：进程内消息帧传输，注册 scheme 为 `inproc`，以命名端点在同
  进程的套接字之间建立成对的无界消息通道；
- **架构角色**：一方面服务同进程组件间通信（桥接、自环拓扑），另一方面
  是运行时全栈测试的承载传输——无需网络栈即可驱动套接字、QoS 与转发层
  的完整行为。

## 核心契约（What）
- 端点名在单个传输实例内唯一，重复监听以 `BadState` 拒绝；
- 拨号命中未注册的端点名以 `Closed` 语义失败（端点不存在视作对端离线，
  拨号器照常退避重试，等端点上线即连通）；
- 帧天然保序且无损，不涉及字节流切分。
"#]

use async_trait::async_trait;
use bytes::Bytes;
use flux_core::{Acceptor, Cancellation, ConnPipe, CoreError, CoreResult, Transport};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::mpsc;

type EndpointMap = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Box<dyn ConnPipe>>>>>;

/// 注册 scheme 为 `inproc` 的进程内传输。
///
/// 端点命名空间随实例隔离：两个 `InprocTransport` 实例互不可见。
#[derive(Default)]
pub struct InprocTransport {
    endpoints: EndpointMap,
}

impl InprocTransport {
    /// 创建空命名空间的传输实例。
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for InprocTransport {
    fn scheme(&self) -> &'static str {
        "inproc"
    }

    async fn dial(&self, addr: &str) -> CoreResult<Box<dyn ConnPipe>> {
        let accept_tx = self
            .endpoints
            .lock()
            .get(addr)
            .cloned()
            // 端点未上线等同对端离线，交给拨号器的退避重试。
            .ok_or_else(|| {
                CoreError::Io(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    format!("inproc endpoint `{addr}` not listening"),
                ))
            })?;
        let (local, remote) = conn_pair(addr);
        accept_tx.send(Box::new(remote)).map_err(|_| {
            CoreError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("inproc endpoint `{addr}` shut down"),
            ))
        })?;
        Ok(Box::new(local))
    }

    async fn listen(&self, addr: &str) -> CoreResult<Box<dyn Acceptor>> {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        {
            let mut endpoints = self.endpoints.lock();
            if endpoints.contains_key(addr) {
                return Err(CoreError::BadState("inproc endpoint already bound"));
            }
            endpoints.insert(addr.to_owned(), accept_tx);
        }
        tracing::debug!(endpoint = %addr, "inproc endpoint bound");
        Ok(Box::new(InprocAcceptor {
            endpoint: addr.to_owned(),
            endpoints: Arc::clone(&self.endpoints),
            accept_rx: AsyncMutex::new(accept_rx),
            closing: Cancellation::new(),
        }))
    }
}

/// 构造一对互联的进程内连接管道。
fn conn_pair(endpoint: &str) -> (InprocConn, InprocConn) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let left = InprocConn {
        tx: Mutex::new(Some(a_tx)),
        rx: AsyncMutex::new(b_rx),
        peer: format!("inproc://{endpoint}"),
        closing: Cancellation::new(),
    };
    let right = InprocConn {
        tx: Mutex::new(Some(b_tx)),
        rx: AsyncMutex::new(a_rx),
        peer: format!("inproc://{endpoint}"),
        closing: Cancellation::new(),
    };
    (left, right)
}

struct InprocConn {
    tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    rx: AsyncMutex<mpsc::UnboundedReceiver<Bytes>>,
    peer: String,
    closing: Cancellation,
}

#[async_trait]
impl ConnPipe for InprocConn {
    async fn send(&self, frame: Bytes) -> CoreResult<()> {
        if self.closing.is_cancelled() {
            return Err(CoreError::Closed);
        }
        let guard = self.tx.lock();
        match &*guard {
            Some(tx) => tx.send(frame).map_err(|_| CoreError::Closed),
            None => Err(CoreError::Closed),
        }
    }

    async fn recv(&self) -> CoreResult<Bytes> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            // 对端丢弃发送端（关闭或销毁）时以 Closed 收尾。
            frame = rx.recv() => frame.ok_or(CoreError::Closed),
            _ = self.closing.cancelled() => Err(CoreError::Closed),
        }
    }

    async fn close(&self) {
        if !self.closing.cancel() {
            return;
        }
        self.tx.lock().take();
        tracing::debug!(peer = %self.peer, "inproc conn closed");
    }

    fn peer_addr(&self) -> String {
        self.peer.clone()
    }
}

struct InprocAcceptor {
    endpoint: String,
    endpoints: EndpointMap,
    accept_rx: AsyncMutex<mpsc::UnboundedReceiver<Box<dyn ConnPipe>>>,
    closing: Cancellation,
}

#[async_trait]
impl Acceptor for InprocAcceptor {
    async fn accept(&self) -> CoreResult<Box<dyn ConnPipe>> {
        let mut rx = self.accept_rx.lock().await;
        tokio::select! {
            conn = rx.recv() => conn.ok_or(CoreError::Closed),
            _ = self.closing.cancelled() => Err(CoreError::Closed),
        }
    }

    fn local_addr(&self) -> String {
        self.endpoint.clone()
    }

    async fn close(&self) {
        if !self.closing.cancel() {
            return;
        }
        self.endpoints.lock().remove(&self.endpoint);
        tracing::debug!(endpoint = %self.endpoint, "inproc endpoint unbound");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 重复绑定同名端点被拒绝，解绑后名字可复用。
    #[tokio::test]
    async fn endpoint_names_are_exclusive_until_unbound() {
        let transport = InprocTransport::new();
        let acceptor = transport.listen("relay-a").await.expect("bind");
        assert!(matches!(
            transport.listen("relay-a").await,
            Err(CoreError::BadState(_))
        ));
        acceptor.close().await;
        let again = transport.listen("relay-a").await;
        assert!(again.is_ok());
    }

    /// 拨号未上线的端点按对端离线报错，端点上线后连通。
    #[tokio::test]
    async fn dialing_absent_endpoint_is_retryable() {
        let transport = InprocTransport::new();
        let err = match transport.dial("ghost").await {
            Ok(_) => panic!("absent endpoint must not connect"),
            Err(err) => err,
        };
        assert!(err.is_retryable());

        let acceptor = transport.listen("ghost").await.expect("bind");
        let conn = transport.dial("ghost").await.expect("dial");
        let peer = acceptor.accept().await.expect("accept");

        conn.send(Bytes::from_static(b"ping")).await.expect("send");
        let got = peer.recv().await.expect("recv");
        assert_eq!(&got[..], b"ping");
    }
}
