//! 管道：到单一对端的一条有序可靠消息流。
//!
//! ## 设计背景（Why）
//! - 管道承载传输绑定实例并把收发暴露为 [`Aio`] 操作；其生命周期状态机
//!   `Connecting → Open → Closing → Closed` 只进不退，确保连接churn下
//!   不泄漏资源、不竞态回调；
//! - 发送路径与接收路径各由一个专属工作任务串行化（单发送者、单接收者），
//!   保证单管道内发送顺序即线上顺序、接收顺序即到达顺序；不同管道完全
//!   并行。
//!
//! ## 逻辑解析（How）
//! - 发送：调用方把 `(消息, 完成器)` 入队，写任务按队列顺序编码上线；
//!   截止/取消已结算的请求直接跳过，迟到的传输结果被槽位仲裁丢弃；
//! - 接收：读任务持续从传输拉帧解码进内部有界语义的入站通道，派发任务
//!   按请求顺序从通道取帧完成——接收操作超时只丢弃等待，不打断底层
//!   读帧，帧保留给下一个接收请求，管道保持可用；
//! - 关闭：进入 `Closing` 后新操作以 `Closed` 拒绝，传输 `close()` 唤醒
//!   在途 IO，队列排空后进入 `Closed` 并向所属套接字上报移除事件（
//!   非拥有型回引：仅持事件发送端与管道号，不构成所有权环）。

use crate::aio::{Aio, AioCompleter, Cancellation, Deadline};
use crate::error::{CoreError, CoreResult};
use crate::message::Message;
use crate::transport::ConnPipe;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// 管道在所属套接字表中的句柄。
pub type PipeId = u64;

static NEXT_PIPE_ID: AtomicU64 = AtomicU64::new(1);

/// 管道生命周期状态，只进不退。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipeState {
    /// 由拨号器/监听器持有、尚未移交的瞬态。
    Connecting,
    /// 已移交，收发操作被接受并转发给传输绑定。
    Open,
    /// 不再接受新操作，在途操作排空中。
    Closing,
    /// 排空完毕，移除事件已上报。
    Closed,
}

struct SendReq {
    msg: Message,
    completer: AioCompleter<()>,
}

struct PipeInner {
    id: PipeId,
    peer: String,
    conn: Arc<dyn ConnPipe>,
    state: Mutex<PipeState>,
    send_tx: Mutex<Option<mpsc::UnboundedSender<SendReq>>>,
    recv_tx: Mutex<Option<mpsc::UnboundedSender<AioCompleter<Message>>>>,
    removed_tx: Mutex<Option<mpsc::UnboundedSender<PipeId>>>,
    closing: Cancellation,
}

impl PipeInner {
    fn state(&self) -> PipeState {
        *self.state.lock()
    }

    /// 进入 `Closing`：拒绝新操作、唤醒在途 IO、允许队列排空。
    fn begin_close(&self) {
        {
            let mut state = self.state.lock();
            match *state {
                PipeState::Closing | PipeState::Closed => return,
                _ => *state = PipeState::Closing,
            }
        }
        self.closing.cancel();
        // 丢弃入队端，工作任务在排空剩余请求后自然退出。
        *self.send_tx.lock() = None;
        *self.recv_tx.lock() = None;
        let conn = Arc::clone(&self.conn);
        tokio::spawn(async move {
            conn.close().await;
        });
        tracing::debug!(pipe = self.id, "pipe closing");
    }

    /// 排空完成后的终态迁移，移除事件恰好上报一次。
    fn finalize(&self) {
        {
            let mut state = self.state.lock();
            if *state == PipeState::Closed {
                return;
            }
            *state = PipeState::Closed;
        }
        self.closing.cancel();
        if let Some(tx) = self.removed_tx.lock().take() {
            let _ = tx.send(self.id);
        }
        tracing::debug!(pipe = self.id, "pipe closed");
    }
}

/// 一条已建立的连接管道（可克隆句柄，所有权归属所属套接字）。
#[derive(Clone)]
pub struct Pipe {
    inner: Arc<PipeInner>,
}

impl Pipe {
    /// 用传输绑定实例构造处于 `Connecting` 的管道。
    pub fn new(conn: Box<dyn ConnPipe>) -> Self {
        let peer = conn.peer_addr();
        Self {
            inner: Arc::new(PipeInner {
                id: NEXT_PIPE_ID.fetch_add(1, Ordering::Relaxed),
                peer,
                conn: Arc::from(conn),
                state: Mutex::new(PipeState::Connecting),
                send_tx: Mutex::new(None),
                recv_tx: Mutex::new(None),
                removed_tx: Mutex::new(None),
                closing: Cancellation::new(),
            }),
        }
    }

    /// 管道句柄。
    pub fn id(&self) -> PipeId {
        self.inner.id
    }

    /// 对端地址元数据。
    pub fn peer_addr(&self) -> String {
        self.inner.peer.clone()
    }

    /// 当前生命周期状态。
    pub fn state(&self) -> PipeState {
        self.inner.state()
    }

    /// 套接字侧注入移除事件通道（非拥有型回引）。
    pub(crate) fn set_removed_channel(&self, tx: mpsc::UnboundedSender<PipeId>) {
        *self.inner.removed_tx.lock() = Some(tx);
    }

    /// 完成移交：`Connecting → Open`，启动串行化的收发工作任务。
    pub fn open(&self) -> CoreResult<()> {
        {
            let mut state = self.inner.state.lock();
            match *state {
                PipeState::Connecting => *state = PipeState::Open,
                _ => return Err(CoreError::BadState("pipe already handed off")),
            }
        }
        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let (recv_tx, recv_rx) = mpsc::unbounded_channel();
        *self.inner.send_tx.lock() = Some(send_tx);
        *self.inner.recv_tx.lock() = Some(recv_tx);
        tokio::spawn(writer_task(Arc::clone(&self.inner), send_rx));

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(reader_task(Arc::clone(&self.inner), inbound_tx));
        tokio::spawn(dispatch_task(Arc::clone(&self.inner), recv_rx, inbound_rx));
        tracing::debug!(pipe = self.inner.id, peer = %self.inner.peer, "pipe open");
        Ok(())
    }

    /// 发起一次发送操作。
    ///
    /// 同一管道上的发送按调用入队顺序上线；已关闭的管道立即以
    /// [`CoreError::Closed`] 完成。
    pub fn send(&self, msg: Message, deadline: Deadline) -> Aio<()> {
        let (aio, completer) = Aio::pair(deadline);
        match self.inner.state() {
            PipeState::Open => {}
            PipeState::Connecting => {
                completer.complete(Err(CoreError::BadState("pipe not yet handed off")));
                return aio;
            }
            _ => {
                completer.complete(Err(CoreError::Closed));
                return aio;
            }
        }
        let sent = {
            let guard = self.inner.send_tx.lock();
            match &*guard {
                Some(tx) => tx.send(SendReq { msg, completer }).map_err(|err| err.0.completer),
                None => Err(completer),
            }
        };
        if let Err(completer) = sent {
            completer.complete(Err(CoreError::Closed));
        }
        aio
    }

    /// 发起一次接收操作。
    ///
    /// 超时/取消只丢弃本次等待，不破坏底层帧边界；未消费的入站帧保留给
    /// 下一个接收操作。
    pub fn recv(&self, deadline: Deadline) -> Aio<Message> {
        let (aio, completer) = Aio::pair(deadline);
        match self.inner.state() {
            PipeState::Open => {}
            PipeState::Connecting => {
                completer.complete(Err(CoreError::BadState("pipe not yet handed off")));
                return aio;
            }
            _ => {
                completer.complete(Err(CoreError::Closed));
                return aio;
            }
        }
        let queued = {
            let guard = self.inner.recv_tx.lock();
            match &*guard {
                Some(tx) => tx.send(completer).map_err(|err| err.0),
                None => Err(completer),
            }
        };
        if let Err(completer) = queued {
            completer.complete(Err(CoreError::Closed));
        }
        aio
    }

    /// 显式请求关闭（幂等）。终态迁移在排空后由工作任务完成。
    pub fn close(&self) {
        self.inner.begin_close();
    }
}

impl std::fmt::Debug for Pipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("state", &self.inner.state())
            .finish()
    }
}

/// 写任务：唯一发送者，按队列顺序编码上线。
async fn writer_task(inner: Arc<PipeInner>, mut send_rx: mpsc::UnboundedReceiver<SendReq>) {
    while let Some(SendReq { msg, completer }) = send_rx.recv().await {
        if completer.is_settled() {
            // 截止/取消已赢得仲裁，不再触碰其缓冲区。
            continue;
        }
        if inner.closing.is_cancelled() {
            completer.complete(Err(CoreError::Closed));
            continue;
        }
        let result = inner.conn.send(msg.encode()).await;
        if let Err(err) = &result {
            tracing::debug!(pipe = inner.id, error = %err, "pipe send failed");
            if err.is_disconnect() {
                inner.begin_close();
            }
        }
        completer.complete(result);
    }
}

/// 读任务：唯一接收者，持续拉帧解码进入站通道。
async fn reader_task(inner: Arc<PipeInner>, inbound_tx: mpsc::UnboundedSender<Message>) {
    loop {
        match inner.conn.recv().await {
            Ok(frame) => match Message::decode(frame) {
                Ok(msg) => {
                    if inbound_tx.send(msg).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    // 帧边界已不可信，只能整体关闭。
                    tracing::warn!(pipe = inner.id, error = %err, "malformed inbound frame");
                    inner.begin_close();
                    break;
                }
            },
            Err(err) => {
                if !matches!(err, CoreError::Closed) {
                    tracing::debug!(pipe = inner.id, error = %err, "pipe recv failed");
                }
                inner.begin_close();
                break;
            }
        }
    }
    // 丢弃入站发送端，派发任务据此得知流已终结。
}

/// 派发任务：按请求顺序把入站帧交付给接收操作，并负责终态迁移。
async fn dispatch_task(
    inner: Arc<PipeInner>,
    mut recv_rx: mpsc::UnboundedReceiver<AioCompleter<Message>>,
    mut inbound_rx: mpsc::UnboundedReceiver<Message>,
) {
    // 被超时/取消的接收让出的帧暂存于此，交给下一个接收请求。
    let mut stash: Option<Message> = None;
    'serve: while let Some(completer) = recv_rx.recv().await {
        if completer.is_settled() {
            continue 'serve;
        }
        let inbound = match stash.take() {
            Some(msg) => Some(msg),
            None => tokio::select! {
                inbound = inbound_rx.recv() => inbound,
                _ = completer.settled() => continue 'serve,
            },
        };
        match inbound {
            Some(msg) => {
                if let Some(Ok(msg)) = completer.try_complete(Ok(msg)) {
                    // 超时在出队后的一瞬抢先结算：帧放回暂存，不丢失。
                    stash = Some(msg);
                }
            }
            None => {
                completer.complete(Err(CoreError::Closed));
                break 'serve;
            }
        }
    }
    // 排空滞留的接收请求后进入终态。
    while let Ok(completer) = recv_rx.try_recv() {
        completer.complete(Err(CoreError::Closed));
    }
    recv_rx.close();
    inner.finalize();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::QosLevel;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::sync::Mutex as AsyncMutex;

    /// 进程内成对字节管道，用于在不落网络栈的情况下验证状态机。
    struct LoopConn {
        tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
        rx: AsyncMutex<mpsc::UnboundedReceiver<Bytes>>,
        closing: Cancellation,
    }

    fn loop_pair() -> (LoopConn, LoopConn) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let left = LoopConn {
            tx: Mutex::new(Some(a_tx)),
            rx: AsyncMutex::new(b_rx),
            closing: Cancellation::new(),
        };
        let right = LoopConn {
            tx: Mutex::new(Some(b_tx)),
            rx: AsyncMutex::new(a_rx),
            closing: Cancellation::new(),
        };
        (left, right)
    }

    #[async_trait]
    impl ConnPipe for LoopConn {
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
                frame = rx.recv() => frame.ok_or(CoreError::Closed),
                _ = self.closing.cancelled() => Err(CoreError::Closed),
            }
        }

        async fn close(&self) {
            self.closing.cancel();
            self.tx.lock().take();
        }

        fn peer_addr(&self) -> String {
            "loop://peer".into()
        }
    }

    fn open_pipe(conn: LoopConn) -> Pipe {
        let pipe = Pipe::new(Box::new(conn));
        pipe.open().expect("handoff");
        pipe
    }

    /// 单管道内发送顺序即接收顺序，含空载荷与大载荷。
    #[tokio::test]
    async fn pipe_preserves_order_and_bytes() {
        let (left, right) = loop_pair();
        let tx_pipe = open_pipe(left);
        let rx_pipe = open_pipe(right);

        let payloads: Vec<Bytes> = vec![
            Bytes::from(vec![0xAB; 10]),
            Bytes::new(),
            Bytes::from(vec![0x5C; 4096]),
        ];
        for payload in &payloads {
            let msg = Message::publish(payload.clone(), QosLevel::AtMostOnce);
            tx_pipe
                .send(msg, Deadline::none())
                .wait()
                .await
                .expect("send");
        }
        for payload in &payloads {
            let msg = rx_pipe.recv(Deadline::none()).wait().await.expect("recv");
            assert_eq!(&msg.payload, payload);
        }
    }

    /// 无数据时 50ms 截止的接收以 `Timeout` 完成，且管道此后仍可用。
    #[tokio::test(start_paused = true)]
    async fn recv_deadline_leaves_pipe_usable() {
        let (left, right) = loop_pair();
        let tx_pipe = open_pipe(left);
        let rx_pipe = open_pipe(right);

        let aio = rx_pipe.recv(Deadline::after(Duration::from_millis(50)));
        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(matches!(aio.wait().await, Err(CoreError::Timeout)));
        assert_eq!(rx_pipe.state(), PipeState::Open);

        let msg = Message::publish(Bytes::from_static(b"late"), QosLevel::AtMostOnce);
        tx_pipe
            .send(msg, Deadline::none())
            .wait()
            .await
            .expect("send after timeout");
        let got = rx_pipe.recv(Deadline::none()).wait().await.expect("recv");
        assert_eq!(&got.payload[..], b"late");
    }

    /// 关闭后新操作以 `Closed` 拒绝，状态终达 `Closed` 且移除事件上报一次。
    #[tokio::test]
    async fn close_drains_and_reports_removal() {
        let (left, _right) = loop_pair();
        let pipe = open_pipe(left);
        let (removed_tx, mut removed_rx) = mpsc::unbounded_channel();
        pipe.set_removed_channel(removed_tx);

        pipe.close();
        pipe.close(); // 幂等
        let removed = removed_rx.recv().await.expect("removal event");
        assert_eq!(removed, pipe.id());
        assert_eq!(pipe.state(), PipeState::Closed);

        let msg = Message::publish(Bytes::from_static(b"x"), QosLevel::AtMostOnce);
        assert!(matches!(
            pipe.send(msg, Deadline::none()).wait().await,
            Err(CoreError::Closed)
        ));
        assert!(matches!(
            pipe.recv(Deadline::none()).wait().await,
            Err(CoreError::Closed)
        ));
    }

    /// 未移交的管道拒绝收发（`BadState`），移交恰好一次。
    #[tokio::test]
    async fn connecting_pipe_rejects_operations() {
        let (left, _right) = loop_pair();
        let pipe = Pipe::new(Box::new(left));
        assert_eq!(pipe.state(), PipeState::Connecting);
        let msg = Message::publish(Bytes::new(), QosLevel::AtMostOnce);
        assert!(matches!(
            pipe.send(msg, Deadline::none()).wait().await,
            Err(CoreError::BadState(_))
        ));
        pipe.open().expect("first handoff");
        assert!(pipe.open().is_err());
    }
}
