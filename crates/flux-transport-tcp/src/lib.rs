#![deny(unsafe_code)]
#![doc = r#"
# flux-transport-tcp

## 设计动机（Why）
- **定位**：Flux 运行时在 Tokio 上的 TCP 传输实现，以 32 位大端长度前缀
  把字节流切成完整帧，向核心暴露"一帧进、一帧出"的有序可靠语义；
- **架构角色**：实现 [`flux_core::Transport`] 能力三元组（拨号、监听、
  连接管道），套接字层对本 crate 的存在完全无感。

## 核心契约（What）
- **帧边界**：每帧以 `u32`（大端）长度前缀开头，随后是核心编码的消息
  字节；超过帧大小上限的入站长度以协议错误拒绝并关闭连接；
- **关闭契约**：`close()` 之后，同一连接上的在途收发在有界时间内以
  [`Closed`](flux_core::CoreError::Closed) 完成——由关闭令牌参与每个
  IO 等待点的选择来兑现；
- **顺序契约**：读写两半各自经异步互斥锁串行化，单连接内发送顺序即
  线上顺序。

## 风险与考量（Trade-offs）
- 关闭令牌抢占在途写会丢弃半写的帧；此时连接已在拆除路径上，对端的
  读侧会以帧截断收尾，不存在"半帧被当整帧"的误读；
- 长度前缀上限是本实现的常量而非协商项，两端须使用一致的构建。
"#]

use async_trait::async_trait;
use bytes::Bytes;
use flux_core::{Acceptor, Cancellation, ConnPipe, CoreError, CoreResult, Transport};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as AsyncMutex;

/// 入站帧长度上限；超限视为协议破坏。
const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// 注册 scheme 为 `tcp` 的传输实现。
#[derive(Debug, Default)]
pub struct TcpTransport;

impl TcpTransport {
    /// 创建传输实例。
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn scheme(&self) -> &'static str {
        "tcp"
    }

    async fn dial(&self, addr: &str) -> CoreResult<Box<dyn ConnPipe>> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Box::new(TcpConn::new(stream)?))
    }

    async fn listen(&self, addr: &str) -> CoreResult<Box<dyn Acceptor>> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?.to_string();
        tracing::debug!(addr = %local_addr, "tcp acceptor bound");
        Ok(Box::new(TcpAcceptor {
            listener,
            local_addr,
            closing: Cancellation::new(),
        }))
    }
}

struct TcpConn {
    reader: AsyncMutex<OwnedReadHalf>,
    writer: AsyncMutex<OwnedWriteHalf>,
    peer: String,
    closing: Cancellation,
}

impl TcpConn {
    fn new(stream: TcpStream) -> CoreResult<Self> {
        // 帧化协议自带边界，禁用 Nagle 降低小帧延迟。
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?.to_string();
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: AsyncMutex::new(reader),
            writer: AsyncMutex::new(writer),
            peer,
            closing: Cancellation::new(),
        })
    }

    async fn write_frame(&self, frame: &Bytes) -> CoreResult<()> {
        let mut writer = self.writer.lock().await;
        if self.closing.is_cancelled() {
            return Err(CoreError::Closed);
        }
        writer.write_u32(frame.len() as u32).await?;
        writer.write_all(frame).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn read_frame(&self) -> CoreResult<Bytes> {
        let mut reader = self.reader.lock().await;
        if self.closing.is_cancelled() {
            return Err(CoreError::Closed);
        }
        let len = reader.read_u32().await? as usize;
        if len > MAX_FRAME_BYTES {
            return Err(CoreError::protocol(format!(
                "inbound frame of {len} bytes exceeds limit"
            )));
        }
        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

#[async_trait]
impl ConnPipe for TcpConn {
    async fn send(&self, frame: Bytes) -> CoreResult<()> {
        tokio::select! {
            result = self.write_frame(&frame) => result,
            _ = self.closing.cancelled() => Err(CoreError::Closed),
        }
    }

    async fn recv(&self) -> CoreResult<Bytes> {
        tokio::select! {
            result = self.read_frame() => result,
            _ = self.closing.cancelled() => Err(CoreError::Closed),
        }
    }

    async fn close(&self) {
        if !self.closing.cancel() {
            return;
        }
        // 唤醒在先，半关闭在后；锁此刻可能被在途写持有。
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        tracing::debug!(peer = %self.peer, "tcp conn closed");
    }

    fn peer_addr(&self) -> String {
        format!("tcp://{}", self.peer)
    }
}

struct TcpAcceptor {
    listener: TcpListener,
    local_addr: String,
    closing: Cancellation,
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&self) -> CoreResult<Box<dyn ConnPipe>> {
        loop {
            if self.closing.is_cancelled() {
                return Err(CoreError::Closed);
            }
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = self.closing.cancelled() => return Err(CoreError::Closed),
            };
            match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(peer = %peer, "tcp conn accepted");
                    return Ok(Box::new(TcpConn::new(stream)?));
                }
                // 瞬时接受错误（对端握手中途放弃等）不终结监听端。
                Err(err) => {
                    tracing::warn!(error = %err, "tcp accept error; retrying");
                }
            }
        }
    }

    fn local_addr(&self) -> String {
        self.local_addr.clone()
    }

    async fn close(&self) {
        self.closing.cancel();
    }
}
