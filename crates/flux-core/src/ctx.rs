//! 上下文：套接字之上的独立逻辑流，承载每会话 QoS 状态。
//!
//! ## 设计背景（Why）
//! - 一个套接字可以同时运转多条互不阻塞的会话（请求/应答并发、多路
//!   发布），每条会话有自己的报文标识符空间、在途窗口与重传定时器；
//! - QoS 引擎是纯状态机，上下文为它补齐运行时三件事：定时驱动重传、
//!   经套接字上线帧、向协作方存储持久化快照。
//!
//! ## 并发模型（Where）
//! - 每上下文一把 `parking_lot::Mutex<QosEngine>`，发送路径、套接字的
//!   确认分发与重传任务都经它串行化；临界区内不做 IO 与存储调用；
//! - 重传任务随上下文创建而生、随关闭令牌而亡；引擎状态变化后以
//!   `Notify` 重新武装其睡眠目标。

use crate::aio::{Aio, Cancellation, Deadline};
use crate::error::{CoreError, CoreResult};
use crate::message::{Message, PacketKind};
use crate::qos::{QosEngine, SessionStore};
use crate::socket::SocketShared;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;

static NEXT_CTX_ID: AtomicU32 = AtomicU32::new(1);

pub(crate) struct CtxShared {
    id: u32,
    socket: Arc<SocketShared>,
    engine: Mutex<QosEngine>,
    /// 引擎状态变化后重新武装重传任务的睡眠目标。
    rearm: Notify,
    store: Mutex<Option<Arc<dyn SessionStore>>>,
    recv_q: Mutex<VecDeque<Message>>,
    recv_notify: Notify,
    /// 本上下文认领的关联标识；置位后匹配的入站载荷直达本队列。
    correlation: Mutex<Option<u32>>,
    failed_tx: mpsc::UnboundedSender<(u16, CoreError)>,
    closed: Cancellation,
}

impl CtxShared {
    fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.socket.is_closed()
    }

    /// 套接字确认分发的回调：标识符归本会话则处理并返回应答帧。
    ///
    /// 外层 `None` 表示不归本会话所有（杂散确认由套接字统一抑制）。
    pub(crate) fn handle_ack(
        self: &Arc<Self>,
        kind: PacketKind,
        packet_id: u16,
        now: Instant,
    ) -> Option<Option<Message>> {
        let outcome = {
            let mut engine = self.engine.lock();
            if !engine.owns(packet_id) {
                return None;
            }
            engine.handle_outbound_ack(kind, packet_id, now)?
        };
        self.rearm.notify_waiters();
        if outcome.retired {
            let shared = Arc::clone(self);
            tokio::spawn(async move { shared.persist().await });
        }
        Some(outcome.reply)
    }

    pub(crate) fn wants_correlation(&self, correlation: u32) -> bool {
        *self.correlation.lock() == Some(correlation)
    }

    pub(crate) fn push_inbound(&self, msg: Message) {
        {
            let mut queue = self.recv_q.lock();
            if queue.len() >= self.socket.config.recv_queue_depth {
                queue.pop_front();
                tracing::warn!(
                    ctx = self.id,
                    "context recv queue overflow; oldest message dropped"
                );
            }
            queue.push_back(msg);
        }
        self.recv_notify.notify_waiters();
    }

    /// 重连恢复：合并存储遗留的记录，产出需先于新发布上线的帧。
    ///
    /// 存储瞬时不可用时只记日志并跳过载入；在途的内存态记录仍会照常
    /// 重发，绝不因存储故障丢弃。
    pub(crate) async fn resume(self: &Arc<Self>) -> Vec<Message> {
        let store = self.store.lock().clone();
        let now = Instant::now();
        if let Some(store) = store {
            let session_id = self.engine.lock().session_id();
            match store.load(session_id).await {
                Ok(snapshot) => self.engine.lock().restore(snapshot, now),
                Err(err) => {
                    tracing::warn!(ctx = self.id, error = %err, "session load deferred");
                }
            }
        }
        let frames = self.engine.lock().resume_frames(now);
        if !frames.is_empty() {
            tracing::info!(ctx = self.id, count = frames.len(), "resuming inflight session");
            self.rearm.notify_waiters();
        }
        frames
    }

    /// 把当前在途快照写入协作方存储；失败降级为日志。
    async fn persist(self: &Arc<Self>) {
        let store = self.store.lock().clone();
        let Some(store) = store else { return };
        let (session_id, snapshot) = {
            let engine = self.engine.lock();
            (engine.session_id(), engine.snapshot())
        };
        if let Err(err) = store.save(session_id, &snapshot).await {
            tracing::warn!(ctx = self.id, error = %err, "session save deferred");
        }
    }

    /// 重传任务主体：睡到最近截止，产出到期帧与终态失败。
    async fn retransmit_loop(self: Arc<Self>) {
        loop {
            if self.is_closed() {
                break;
            }
            let deadline = self.engine.lock().next_deadline();
            let rearm = self.rearm.notified();
            tokio::pin!(rearm);
            rearm.as_mut().enable();
            // 武装后重读截止：注册与读取之间的状态变化由唤醒兜底。
            tokio::select! {
                _ = &mut rearm => continue,
                _ = self.closed.cancelled() => break,
                _ = self.socket.closed.cancelled() => break,
                _ = async {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {}
            }
            let round = self.engine.lock().due_retransmits(Instant::now());
            for packet_id in &round.failed {
                let _ = self.failed_tx.send((*packet_id, CoreError::Timeout));
            }
            let resent = !round.frames.is_empty();
            for frame in round.frames {
                self.socket.send_control(frame);
            }
            if resent || !round.failed.is_empty() {
                self.persist().await;
            }
        }
    }

    /// 取消安全的接收等待：先查本上下文队列，再退到套接字共享队列。
    async fn pop_inbound(&self) -> CoreResult<Message> {
        loop {
            let own = self.recv_notify.notified();
            tokio::pin!(own);
            own.as_mut().enable();
            let shared = self.socket.recv_notify.notified();
            tokio::pin!(shared);
            shared.as_mut().enable();
            if let Some(msg) = self.recv_q.lock().pop_front() {
                return Ok(msg);
            }
            if let Some(msg) = self.socket.try_pop_shared() {
                return Ok(msg);
            }
            if self.is_closed() {
                return Err(CoreError::Closed);
            }
            tokio::select! {
                _ = &mut own => {}
                _ = &mut shared => {}
                _ = self.closed.cancelled() => {}
                _ = self.socket.closed.cancelled() => {}
            }
        }
    }

    fn requeue_front(&self, msg: Message) {
        self.recv_q.lock().push_front(msg);
        self.recv_notify.notify_waiters();
    }

    pub(crate) fn close_internal(&self) {
        if !self.closed.cancel() {
            return;
        }
        self.recv_notify.notify_waiters();
        self.rearm.notify_waiters();
        tracing::debug!(ctx = self.id, "context closed");
    }
}

/// 套接字之上的独立逻辑流句柄。
///
/// # 教案式注释
///
/// ## 契约（What）
/// - [`send`](Context::send) 按消息的 QoS 等级登记会话状态并分配报文
///   标识符；QoS 0 直通，QoS 1/2 建立在途记录并由重传任务驱动；
/// - [`recv`](Context::recv) 优先取回关联标识命中的入站载荷，其次消费
///   套接字共享队列；
/// - 关闭（显式或句柄丢弃）是幂等的：在途记录留给存储快照，挂起操作
///   以 [`CoreError::Closed`] 完成。
pub struct Context {
    shared: Arc<CtxShared>,
    failed_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(u16, CoreError)>>,
}

impl Context {
    pub(crate) fn open(socket: Arc<SocketShared>) -> CoreResult<Self> {
        if socket.is_closed() {
            return Err(CoreError::Closed);
        }
        let id = NEXT_CTX_ID.fetch_add(1, Ordering::Relaxed);
        let session_id = (u64::from(socket.local_id()) << 32) | u64::from(id);
        let (failed_tx, failed_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(CtxShared {
            id,
            // 标识符取自套接字共享空间：同一对端眼中全部会话互不冲突。
            engine: Mutex::new(QosEngine::new(
                session_id,
                socket.config.qos,
                Arc::clone(&socket.packet_ids),
            )),
            socket,
            rearm: Notify::new(),
            store: Mutex::new(None),
            recv_q: Mutex::new(VecDeque::new()),
            recv_notify: Notify::new(),
            correlation: Mutex::new(None),
            failed_tx,
            closed: Cancellation::new(),
        });
        shared.socket.register_context(id, &shared);
        tokio::spawn(Arc::clone(&shared).retransmit_loop());
        Ok(Self {
            shared,
            failed_rx: tokio::sync::Mutex::new(failed_rx),
        })
    }

    /// 上下文标识（套接字内唯一）。
    pub fn id(&self) -> u32 {
        self.shared.id
    }

    /// 会话标识（进程内唯一，存储键）。
    pub fn session_id(&self) -> u64 {
        self.shared.engine.lock().session_id()
    }

    /// 挂接协作方会话存储；此后退役与重传都会触发快照保存。
    pub fn set_store(&self, store: Arc<dyn SessionStore>) {
        *self.shared.store.lock() = Some(store);
    }

    /// 认领一个关联标识：匹配的入站载荷绕过共享队列直达本上下文。
    pub fn set_correlation(&self, correlation: Option<u32>) {
        *self.shared.correlation.lock() = correlation;
    }

    /// 当前在途记录数（观测用）。
    pub fn inflight_len(&self) -> usize {
        self.shared.engine.lock().inflight_len()
    }

    /// 发起一次会话级发送。
    ///
    /// QoS 1/2 在这里登记在途记录并盖上报文标识符；操作的完成只表示
    /// 帧已上线，端到端确认由重传机制兜底直至退役或耗尽预算。
    pub fn send(&self, mut msg: Message, deadline: Deadline) -> Aio<()> {
        if let Some(correlation) = *self.shared.correlation.lock() {
            msg.header.correlation = correlation;
        }
        let registered = {
            let mut engine = self.shared.engine.lock();
            engine.register_publish(&mut msg, Instant::now())
        };
        match registered {
            Ok(true) => {
                self.shared.rearm.notify_waiters();
                let shared = Arc::clone(&self.shared);
                tokio::spawn(async move { shared.persist().await });
            }
            Ok(false) => {}
            Err(err) => {
                let (aio, completer) = Aio::pair(deadline);
                completer.complete(Err(err));
                return aio;
            }
        }
        self.shared.socket.send_message(msg, deadline)
    }

    /// 发起一次会话级接收。
    pub fn recv(&self, deadline: Deadline) -> Aio<Message> {
        let (aio, completer) = Aio::pair(deadline);
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            tokio::select! {
                _ = completer.settled() => {}
                result = shared.pop_inbound() => {
                    match result {
                        Ok(msg) => {
                            // 输掉仲裁的帧放回队首，下一个接收请求取走。
                            if let Some(Ok(msg)) = completer.try_complete(Ok(msg)) {
                                shared.requeue_front(msg);
                            }
                        }
                        Err(err) => {
                            completer.complete(Err(err));
                        }
                    }
                }
            }
        });
        aio
    }

    /// 取出下一条终态投递失败（耗尽重试预算的报文标识符）。
    ///
    /// 队列为空时挂起；上下文关闭后返回 `None`。
    pub async fn next_delivery_failure(&self) -> Option<(u16, CoreError)> {
        let mut rx = self.failed_rx.lock().await;
        tokio::select! {
            item = rx.recv() => item,
            _ = self.shared.closed.cancelled() => None,
        }
    }

    /// 显式关闭（幂等）。
    pub fn close(&self) {
        self.shared.socket.deregister_context(self.shared.id);
        self.shared.close_internal();
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.shared.id)
            .field("inflight", &self.inflight_len())
            .finish()
    }
}
