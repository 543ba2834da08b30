//! 套接字：面向协议的端点，持有管道与上下文并施加路由策略。
//!
//! ## 设计背景（Why）
//! - 套接字是传输无关的策略层：广播扇出、配对钉选或轮转分摊由
//!   [`Policy`] 决定，传输细节全部隐藏在管道之后；
//! - 无可用管道时的行为是整个系统的背压边界：按配置要么把消息排入有界
//!   积压队列等待管道挂载，要么立即以 `NoPipes` 失败。
//!
//! ## 并发模型（Where）
//! - 套接字级共享状态（管道表、上下文表、积压队列）由一把
//!   `parking_lot::Mutex` 保护，临界区内不做 IO、不投递完成；
//! - 管道移除事件经无界通道送入事件任务处理，拨号器借每管道的一次性
//!   通道感知其管道丢失并重连；
//! - 关闭级联：套接字关闭使所有拨号器/监听器停机、所有管道关闭、所有
//!   上下文关闭，每个未决操作都以 `Closed` 完成。

use crate::aio::{Aio, AioCompleter, Cancellation, Deadline};
use crate::config::{BackpressureMode, RuntimeConfig};
use crate::ctx::{Context, CtxShared};
use crate::dialer::Dialer;
use crate::error::{CoreError, CoreResult};
use crate::listener::Listener;
use crate::message::{Message, PacketKind, QosLevel};
use crate::pipe::{Pipe, PipeId, PipeState};
use crate::qos::{PacketIdAllocator, QosEngine, SharedPacketIds};
use crate::transport::{TransportRegistry, parse_url};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::time::Instant;

static NEXT_SOCKET_ID: AtomicU32 = AtomicU32::new(1);

/// 协议路由策略（带标签变体的显式状态，而非临时标志位）。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Policy {
    /// 发布/订阅式：广播到全部管道。
    Fanout,
    /// 请求/应答式：择一钉选，失联后换下一条。
    Pair,
    /// 推/拉式：按管道轮转分摊。
    RoundRobin,
}

struct PipeEntry {
    pipe: Pipe,
    /// 拨号器侧的移除回执，触发重连。
    removed: Option<oneshot::Sender<()>>,
    /// 会话恢复帧全部上线前不参与路由选择，保证旧帧先于新发布。
    ready: bool,
}

#[derive(Default)]
struct SocketState {
    pipes: BTreeMap<PipeId, PipeEntry>,
    backlog: VecDeque<(Message, AioCompleter<()>)>,
    pinned: Option<PipeId>,
    rr_cursor: Option<PipeId>,
    contexts: HashMap<u32, Weak<CtxShared>>,
}

pub(crate) struct SocketShared {
    local_id: u32,
    policy: Policy,
    pub(crate) config: RuntimeConfig,
    registry: Arc<TransportRegistry>,
    state: Mutex<SocketState>,
    /// 接收侧 QoS 会话：入站发布的重复抑制、扣留与确认回发。
    recv_engine: Mutex<QosEngine>,
    /// 全部上下文共享的报文标识符空间。
    pub(crate) packet_ids: SharedPacketIds,
    recv_q: Mutex<VecDeque<Message>>,
    pub(crate) recv_notify: Notify,
    removed_tx: mpsc::UnboundedSender<PipeId>,
    pub(crate) closed: Cancellation,
}

impl SocketShared {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub(crate) fn local_id(&self) -> u32 {
        self.local_id
    }

    /// 移交一条新建连接：包装为管道、挂载、恢复会话、排空积压。
    pub(crate) fn attach(self: &Arc<Self>, conn: Box<dyn crate::transport::ConnPipe>) -> CoreResult<oneshot::Receiver<()>> {
        if self.is_closed() {
            return Err(CoreError::Closed);
        }
        let pipe = Pipe::new(conn);
        pipe.set_removed_channel(self.removed_tx.clone());
        pipe.open()?;
        let (removed_tx, removed_rx) = oneshot::channel();
        {
            let mut state = self.state.lock();
            state.pipes.insert(
                pipe.id(),
                PipeEntry {
                    pipe: pipe.clone(),
                    removed: Some(removed_tx),
                    ready: false,
                },
            );
        }
        tracing::info!(
            socket = self.local_id,
            pipe = pipe.id(),
            peer = %pipe.peer_addr(),
            "pipe attached"
        );
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            // 会话恢复帧必须先于任何新发布上线：恢复期间管道对路由不可
            // 见（路由照常走积压/其余管道），恢复完成后才放行并排积压。
            shared.resume_sessions(&pipe).await;
            shared.mark_pipe_ready(pipe.id());
            shared.drain_backlog();
            shared.run_pipe_recv(pipe).await;
        });
        Ok(removed_rx)
    }

    fn mark_pipe_ready(&self, pipe_id: PipeId) {
        if let Some(entry) = self.state.lock().pipes.get_mut(&pipe_id) {
            entry.ready = true;
        }
    }

    async fn resume_sessions(self: &Arc<Self>, pipe: &Pipe) {
        let contexts: Vec<Arc<CtxShared>> = {
            self.state
                .lock()
                .contexts
                .values()
                .filter_map(Weak::upgrade)
                .collect()
        };
        for ctx in contexts {
            let frames = ctx.resume().await;
            for frame in frames {
                if let Err(err) = pipe.send(frame, Deadline::none()).wait().await {
                    tracing::debug!(error = %err, "session resume send deferred");
                    return;
                }
            }
        }
    }

    fn drain_backlog(self: &Arc<Self>) {
        loop {
            let entry = self.state.lock().backlog.pop_front();
            match entry {
                Some((msg, completer)) => self.route(msg, completer),
                None => break,
            }
        }
    }

    /// 套接字驱动的每管道接收循环：拉帧、过 QoS、再路由。
    async fn run_pipe_recv(self: &Arc<Self>, pipe: Pipe) {
        loop {
            match pipe.recv(Deadline::none()).wait().await {
                Ok(msg) => self.dispatch_inbound(&pipe, msg),
                Err(_) => break,
            }
        }
    }

    /// 入站消息总入口：确认握手走 QoS 引擎，载荷按关联标识路由。
    fn dispatch_inbound(self: &Arc<Self>, pipe: &Pipe, msg: Message) {
        let now = Instant::now();
        match msg.header.kind {
            PacketKind::Publish => {
                let (deliver, reply) = if msg.header.qos == QosLevel::AtMostOnce {
                    (Some(msg), None)
                } else {
                    self.recv_engine.lock().on_inbound_publish(msg, now)
                };
                if let Some(reply) = reply {
                    pipe.send(reply, Deadline::none()).detach();
                }
                if let Some(msg) = deliver {
                    self.deliver(msg);
                }
            }
            PacketKind::PubRel => {
                let (deliver, comp) = self
                    .recv_engine
                    .lock()
                    .on_inbound_pubrel(msg.header.packet_id, now);
                pipe.send(comp, Deadline::none()).detach();
                if let Some(msg) = deliver {
                    self.deliver(msg);
                }
            }
            kind @ (PacketKind::PubAck | PacketKind::PubRec | PacketKind::PubComp) => {
                let packet_id = msg.header.packet_id;
                let contexts: Vec<Arc<CtxShared>> = {
                    self.state
                        .lock()
                        .contexts
                        .values()
                        .filter_map(Weak::upgrade)
                        .collect()
                };
                let mut handled = false;
                for ctx in contexts {
                    if let Some(reply) = ctx.handle_ack(kind, packet_id, now) {
                        if let Some(reply) = reply {
                            pipe.send(reply, Deadline::none()).detach();
                        }
                        handled = true;
                        break;
                    }
                }
                if !handled {
                    tracing::debug!(packet_id, ?kind, "stray ack suppressed");
                }
            }
        }
    }

    /// 把一条应用可见消息交付给等待方：关联标识命中的上下文优先，
    /// 其余进入套接字共享接收队列（有界，溢出丢最旧）。
    fn deliver(&self, msg: Message) {
        let correlation = msg.header.correlation;
        if correlation != 0 {
            let target = self
                .state
                .lock()
                .contexts
                .values()
                .filter_map(Weak::upgrade)
                .find(|ctx| ctx.wants_correlation(correlation));
            if let Some(ctx) = target {
                ctx.push_inbound(msg);
                return;
            }
        }
        {
            let mut queue = self.recv_q.lock();
            if queue.len() >= self.config.recv_queue_depth {
                queue.pop_front();
                tracing::warn!(
                    socket = self.local_id,
                    depth = self.config.recv_queue_depth,
                    "recv queue overflow; oldest message dropped"
                );
            }
            queue.push_back(msg);
        }
        self.recv_notify.notify_waiters();
    }

    /// 无阻塞地尝试从共享接收队列取一条消息。
    pub(crate) fn try_pop_shared(&self) -> Option<Message> {
        self.recv_q.lock().pop_front()
    }

    /// 把输掉完成仲裁的消息放回队首，避免超时竞态丢消息。
    pub(crate) fn requeue_front(&self, msg: Message) {
        self.recv_q.lock().push_front(msg);
        self.recv_notify.notify_waiters();
    }

    /// 取消安全的共享队列等待取出：唤醒后才在锁内出队。
    pub(crate) async fn pop_shared(&self) -> CoreResult<Message> {
        loop {
            let notified = self.recv_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(msg) = self.try_pop_shared() {
                return Ok(msg);
            }
            if self.is_closed() {
                return Err(CoreError::Closed);
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = self.closed.cancelled() => {}
            }
        }
    }

    /// 按策略选出本次发送的目标管道集合。
    fn select_targets(&self) -> Vec<Pipe> {
        let mut state = self.state.lock();
        let open_ids: Vec<PipeId> = state
            .pipes
            .iter()
            .filter(|(_, entry)| entry.ready && entry.pipe.state() == PipeState::Open)
            .map(|(id, _)| *id)
            .collect();
        if open_ids.is_empty() {
            return Vec::new();
        }
        match self.policy {
            Policy::Fanout => open_ids
                .iter()
                .map(|id| state.pipes[id].pipe.clone())
                .collect(),
            Policy::Pair => {
                let id = match state.pinned.filter(|id| open_ids.contains(id)) {
                    Some(id) => id,
                    None => {
                        let id = open_ids[0];
                        state.pinned = Some(id);
                        id
                    }
                };
                vec![state.pipes[&id].pipe.clone()]
            }
            Policy::RoundRobin => {
                let id = match state.rr_cursor {
                    Some(cursor) => *open_ids
                        .iter()
                        .find(|id| **id > cursor)
                        .unwrap_or(&open_ids[0]),
                    None => open_ids[0],
                };
                state.rr_cursor = Some(id);
                vec![state.pipes[&id].pipe.clone()]
            }
        }
    }

    /// 路由一次发送：有目标即转发，无目标按背压配置排队或失败。
    pub(crate) fn route(self: &Arc<Self>, msg: Message, completer: AioCompleter<()>) {
        if self.is_closed() {
            completer.complete(Err(CoreError::Closed));
            return;
        }
        let targets = self.select_targets();
        if targets.is_empty() {
            match self.config.backpressure {
                BackpressureMode::Queue => {
                    let mut state = self.state.lock();
                    if state.backlog.len() >= self.config.send_queue_depth {
                        drop(state);
                        completer.complete(Err(CoreError::Backpressure));
                    } else {
                        state.backlog.push_back((msg, completer));
                    }
                }
                BackpressureMode::Fail => {
                    completer.complete(Err(CoreError::NoPipes));
                }
            }
            return;
        }
        tokio::spawn(async move {
            let mut targets = targets;
            if targets.len() == 1 {
                if let Some(pipe) = targets.pop() {
                    let result = pipe.send(msg, Deadline::none()).wait().await;
                    completer.complete(result);
                }
            } else {
                // 扇出：任一管道成功即算成功，全部失败取第一个错误。
                let sends = targets
                    .into_iter()
                    .map(|pipe| pipe.send(msg.clone(), Deadline::none()).wait());
                let results = join_all(sends).await;
                if results.iter().any(Result::is_ok) {
                    completer.complete(Ok(()));
                } else {
                    let first_err = results
                        .into_iter()
                        .find(Result::is_err)
                        .unwrap_or(Err(CoreError::NoPipes));
                    completer.complete(first_err);
                }
            }
        });
    }

    /// 发起一次发送操作（QoS 登记由上下文层负责）。
    pub(crate) fn send_message(self: &Arc<Self>, msg: Message, deadline: Deadline) -> Aio<()> {
        let (aio, completer) = Aio::pair(deadline);
        self.route(msg, completer);
        aio
    }

    /// QoS 重传/恢复路径：无管道时推迟（记录仍在途，下轮再试）。
    pub(crate) fn send_control(self: &Arc<Self>, msg: Message) {
        if self.is_closed() {
            return;
        }
        let targets = self.select_targets();
        if targets.is_empty() {
            tracing::debug!(socket = self.local_id, "retransmission deferred: no pipes");
            return;
        }
        tokio::spawn(async move {
            for pipe in targets {
                if let Err(err) = pipe.send(msg.clone(), Deadline::none()).wait().await {
                    tracing::debug!(error = %err, "retransmission send failed");
                }
            }
        });
    }

    pub(crate) fn register_context(&self, id: u32, ctx: &Arc<CtxShared>) {
        self.state.lock().contexts.insert(id, Arc::downgrade(ctx));
    }

    pub(crate) fn deregister_context(&self, id: u32) {
        self.state.lock().contexts.remove(&id);
    }

    fn on_pipe_removed(&self, pipe_id: PipeId) {
        let mut state = self.state.lock();
        if let Some(mut entry) = state.pipes.remove(&pipe_id) {
            if let Some(tx) = entry.removed.take() {
                let _ = tx.send(());
            }
        }
        if state.pinned == Some(pipe_id) {
            state.pinned = None;
        }
        let remaining = state.pipes.len();
        drop(state);
        tracing::info!(socket = self.local_id, pipe = pipe_id, remaining, "pipe removed");
    }

    /// 关闭级联：幂等；所有未决操作最终以 `Closed` 完成。
    pub(crate) fn close(&self) {
        if !self.closed.cancel() {
            return;
        }
        let (pipes, backlog, contexts) = {
            let mut state = self.state.lock();
            let pipes: Vec<Pipe> = state.pipes.values().map(|e| e.pipe.clone()).collect();
            let backlog = std::mem::take(&mut state.backlog);
            let contexts: Vec<Arc<CtxShared>> = state
                .contexts
                .drain()
                .filter_map(|(_, weak)| weak.upgrade())
                .collect();
            (pipes, backlog, contexts)
        };
        for (_msg, completer) in backlog {
            completer.complete(Err(CoreError::Closed));
        }
        for pipe in pipes {
            pipe.close();
        }
        for ctx in contexts {
            ctx.close_internal();
        }
        self.recv_notify.notify_waiters();
        tracing::info!(socket = self.local_id, "socket closed");
    }
}

/// 协议端点的公共句柄。
///
/// # 教案式注释
///
/// ## 契约（What）
/// - `dial`/`listen` 按 URL 的 scheme 在注册表中选择传输，未知 scheme
///   同步失败（`NotSupported`）；非法绑定地址在 `listen` 处同步失败；
/// - `send`/`recv` 是协议面原语，返回 [`Aio`] 操作；上下文
///   （[`open_context`](Socket::open_context)）在其上叠加 QoS 会话；
/// - 句柄被丢弃时触发与 [`close`](Socket::close) 相同的级联。
pub struct Socket {
    shared: Arc<SocketShared>,
}

impl Socket {
    /// 构造套接字并启动其事件任务。
    pub fn new(policy: Policy, config: RuntimeConfig, registry: Arc<TransportRegistry>) -> Self {
        let local_id = NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed);
        let (removed_tx, mut removed_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SocketShared {
            local_id,
            policy,
            // 接收侧引擎不分配标识符，给它独立的空间即可。
            recv_engine: Mutex::new(QosEngine::new(
                u64::from(local_id),
                config.qos,
                PacketIdAllocator::shared(),
            )),
            packet_ids: PacketIdAllocator::shared(),
            config,
            registry,
            state: Mutex::new(SocketState::default()),
            recv_q: Mutex::new(VecDeque::new()),
            recv_notify: Notify::new(),
            removed_tx,
            closed: Cancellation::new(),
        });
        // 事件任务持弱引用，套接字句柄释放后任务随之退出。
        let weak = Arc::downgrade(&shared);
        tokio::spawn(async move {
            while let Some(pipe_id) = removed_rx.recv().await {
                match weak.upgrade() {
                    Some(shared) => shared.on_pipe_removed(pipe_id),
                    None => break,
                }
            }
        });
        Self { shared }
    }

    /// 套接字的本地跳地址（转发层的跳戳）。
    pub fn local_id(&self) -> u32 {
        self.shared.local_id()
    }

    /// 当前挂载的管道数。
    pub fn pipe_count(&self) -> usize {
        self.shared.state.lock().pipes.len()
    }

    /// 主动向 `scheme://addr` 建立连接；失败按配置退避重试。
    pub fn dial(&self, url: &str) -> CoreResult<Dialer> {
        let (scheme, addr) = parse_url(url)?;
        let transport = self.shared.registry.lookup(scheme)?;
        if self.shared.is_closed() {
            return Err(CoreError::Closed);
        }
        Ok(Dialer::start(
            Arc::clone(&self.shared),
            transport,
            addr.to_owned(),
        ))
    }

    /// 在 `scheme://addr` 上开始监听；绑定类错误同步返回。
    pub async fn listen(&self, url: &str) -> CoreResult<Listener> {
        let (scheme, addr) = parse_url(url)?;
        let transport = self.shared.registry.lookup(scheme)?;
        if self.shared.is_closed() {
            return Err(CoreError::Closed);
        }
        Listener::start(Arc::clone(&self.shared), transport, addr.to_owned()).await
    }

    /// 发起一次套接字级发送（无 QoS 登记，等级按消息头部原样上线）。
    pub fn send(&self, msg: Message, deadline: Deadline) -> Aio<()> {
        self.shared.send_message(msg, deadline)
    }

    /// 发起一次套接字级接收。
    pub fn recv(&self, deadline: Deadline) -> Aio<Message> {
        let (aio, completer) = Aio::pair(deadline);
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            tokio::select! {
                _ = completer.settled() => {}
                result = shared.pop_shared() => {
                    match result {
                        Ok(msg) => {
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

    /// 取消安全的接收等待（转发层等内部循环使用）。
    pub(crate) async fn recv_shared(&self) -> CoreResult<Message> {
        self.shared.pop_shared().await
    }

    /// 打开一条独立逻辑流。
    pub fn open_context(&self) -> CoreResult<Context> {
        Context::open(Arc::clone(&self.shared))
    }

    /// 显式关闭（幂等）；句柄丢弃时亦自动触发。
    pub fn close(&self) {
        self.shared.close();
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.shared.local_id)
            .field("policy", &self.shared.policy)
            .field("pipes", &self.pipe_count())
            .finish()
    }
}
