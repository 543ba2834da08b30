//! QoS 投递引擎：按消息的确认跟踪、在途窗口与重传状态机。
//!
//! ## 设计背景（Why）
//! - 至少一次/恰好一次语义必须在重传、重复抑制与对端重启之间保持正确：
//!   每条 QoS 1/2 发布对应一条在途记录，状态机为
//!   `Sent → WaitingAck → [Acknowledged | Retrying → WaitingAck]* → Retired`；
//! - 恰好一次需要第二轮握手（收到→释放），两半程分别跟踪，任一半程
//!   未决时记录都停留在等待确认态，崩溃夹在两步之间既不重复也不丢失。
//!
//! ## 并发模型（Where）
//! - 引擎本体是纯状态机，不含定时器与 IO；持有方（上下文）以同一把
//!   每会话锁串行化发送路径、接收路径与重传定时回调对它的全部访问；
//! - 标识符退役后进入静默窗口，窗口内既不复用也不把迟到的重传确认
//!   误认成新记录。

use crate::config::QosConfig;
use crate::error::{CoreError, CoreResult};
use crate::message::{Message, PacketKind, QosLevel};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::time::Instant;

pub mod store;

pub use store::{MemorySessionStore, SessionSnapshot, SessionStore, StoredRecord};

/// 在途记录当前等待的握手半程。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckPhase {
    /// QoS 1：等待 `PubAck`。
    AwaitingAck,
    /// QoS 2 第一轮：等待 `PubRec`。
    AwaitingRec,
    /// QoS 2 第二轮：`PubRel` 已发出，等待 `PubComp`。
    AwaitingComp,
}

/// 一条未退役的在途发布记录。
#[derive(Clone, Debug)]
pub struct InflightRecord {
    /// 会话内报文标识符，存活期内唯一。
    pub packet_id: u16,
    /// QoS 等级（1 或 2；QoS 0 不建记录）。
    pub qos: QosLevel,
    /// 未决半程。
    pub phase: AckPhase,
    /// 含首发的投递尝试次数。
    pub attempt: u32,
    /// 下一次重传的截止时间点。
    pub next_retry: Instant,
    /// 原始消息；载荷以 `Bytes` 共享，退役即释放引用。
    pub message: Message,
}

/// 处理一条出站确认的结果。
#[derive(Debug, Default)]
pub struct AckOutcome {
    /// 需要回给对端的控制包（如 `PubRel`）。
    pub reply: Option<Message>,
    /// 本次确认是否使记录退役。
    pub retired: bool,
}

/// 一轮到期重传的产出。
#[derive(Debug, Default)]
pub struct Retransmit {
    /// 应重新上线的帧（发布带重复标志，或第二轮的 `PubRel`）。
    pub frames: Vec<Message>,
    /// 耗尽尝试预算被放弃的标识符，上报给发起上下文作终态失败。
    pub failed: Vec<u16>,
}

/// 套接字级报文标识符分配器，同一套接字的全部会话共享一个空间。
///
/// ## 意图（Why）
/// - 标识符唯一性是确认路由与接收侧重复抑制的根基：两条会话若各自从 1
///   起分配，对端只凭 `packet_id` 便无从区分归属，第二条会话的发布会被
///   误判为重复而丢弃；
/// - 分配、退役与静默窗口集中于此，引擎只保留自己会话的视图。
pub struct PacketIdAllocator {
    next_id: u16,
    /// 标识符 → 释放时刻；`None` 表示仍在途。
    reserved: HashMap<u16, Option<Instant>>,
}

/// 跨会话共享的分配器句柄。
pub type SharedPacketIds = Arc<Mutex<PacketIdAllocator>>;

impl PacketIdAllocator {
    fn new() -> Self {
        Self {
            next_id: 1,
            reserved: HashMap::new(),
        }
    }

    /// 创建可在会话间共享的分配器。
    pub fn shared() -> SharedPacketIds {
        Arc::new(Mutex::new(Self::new()))
    }

    /// 分配下一个空闲标识符，跳过在途与静默窗口内的取值。
    fn allocate(&mut self, now: Instant) -> CoreResult<u16> {
        self.reserved
            .retain(|_, release| release.is_none_or(|at| at > now));
        for _ in 0..u16::MAX {
            let candidate = self.next_id;
            self.next_id = self.next_id.checked_add(1).filter(|v| *v != 0).unwrap_or(1);
            if !self.reserved.contains_key(&candidate) {
                self.reserved.insert(candidate, None);
                return Ok(candidate);
            }
        }
        Err(CoreError::ResourceExhausted("packet id space"))
    }

    /// 恢复路径：把存储遗留的在途标识符重新占住。
    fn reserve(&mut self, packet_id: u16) {
        self.reserved.entry(packet_id).or_insert(None);
    }

    /// 退役：标识符在释放时刻之前既不复用也不重新分配。
    fn retire(&mut self, packet_id: u16, release_at: Instant) {
        self.reserved.insert(packet_id, Some(release_at));
    }
}

/// 每会话 QoS 引擎。
pub struct QosEngine {
    session_id: u64,
    pub(crate) cfg: QosConfig,
    ids: SharedPacketIds,
    pub(crate) inflight: BTreeMap<u16, InflightRecord>,
    /// 本会话已退役的标识符 → 静默期满时刻（快照携带）。
    quiescent: HashMap<u16, Instant>,
    /// 接收侧已交付的标识符 → 遗忘时刻（QoS 1 重复抑制）。
    recv_seen: HashMap<u16, Instant>,
    /// 接收侧按 `PubRec` 扣留、等待 `PubRel` 的消息（QoS 2）。
    recv_held: HashMap<u16, Message>,
}

impl QosEngine {
    /// 创建会话引擎；`ids` 必须是所属套接字的共享分配器。
    pub fn new(session_id: u64, cfg: QosConfig, ids: SharedPacketIds) -> Self {
        Self {
            session_id,
            cfg,
            ids,
            inflight: BTreeMap::new(),
            quiescent: HashMap::new(),
            recv_seen: HashMap::new(),
            recv_held: HashMap::new(),
        }
    }

    /// 会话标识。
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// 当前在途记录数。
    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    /// 查询某标识符是否归本会话的在途记录所有。
    pub fn owns(&self, packet_id: u16) -> bool {
        self.inflight.contains_key(&packet_id)
    }

    /// 为一条出站发布登记在途记录并分配报文标识符。
    ///
    /// ## 契约（What）
    /// - QoS 0 不登记，返回 `Ok(false)`；
    /// - 在途窗口满时报 [`CoreError::Backpressure`]（可重试，确认回流
    ///   即腾出名额）；
    /// - 标识符取自套接字共享空间，跳过在途与静默窗口内的取值，全空间
    ///   耗尽时报 [`CoreError::ResourceExhausted`]；
    /// - 登记后消息头部的 `packet_id` 已就位，记录处于首发等待确认态。
    pub fn register_publish(&mut self, msg: &mut Message, now: Instant) -> CoreResult<bool> {
        self.purge(now);
        if msg.header.qos == QosLevel::AtMostOnce {
            return Ok(false);
        }
        if self.inflight.len() >= self.cfg.max_inflight {
            return Err(CoreError::Backpressure);
        }
        let packet_id = self.ids.lock().allocate(now)?;
        msg.header.packet_id = packet_id;
        msg.header.dup = false;
        let phase = match msg.header.qos {
            QosLevel::AtLeastOnce => AckPhase::AwaitingAck,
            QosLevel::ExactlyOnce => AckPhase::AwaitingRec,
            QosLevel::AtMostOnce => unreachable!("qos0 filtered above"),
        };
        self.inflight.insert(
            packet_id,
            InflightRecord {
                packet_id,
                qos: msg.header.qos,
                phase,
                attempt: 1,
                next_retry: now + self.cfg.retry_interval,
                message: msg.clone(),
            },
        );
        Ok(true)
    }

    /// 处理对端对出站记录的确认。
    ///
    /// 返回 `None` 表示标识符不属于本会话的在途记录（迟到/杂散确认），
    /// 调用方应抑制而非报错。
    pub fn handle_outbound_ack(
        &mut self,
        kind: PacketKind,
        packet_id: u16,
        now: Instant,
    ) -> Option<AckOutcome> {
        let record = self.inflight.get_mut(&packet_id)?;
        match (kind, record.phase) {
            (PacketKind::PubAck, AckPhase::AwaitingAck) => {
                self.retire(packet_id, now);
                Some(AckOutcome {
                    reply: None,
                    retired: true,
                })
            }
            (PacketKind::PubRec, AckPhase::AwaitingRec) => {
                record.phase = AckPhase::AwaitingComp;
                record.attempt = 1;
                record.next_retry = now + self.cfg.retry_interval;
                Some(AckOutcome {
                    reply: Some(Message::control(PacketKind::PubRel, packet_id)),
                    retired: false,
                })
            }
            // 对端没收到我们的 PubRel 而重发 PubRec：重发释放即可。
            (PacketKind::PubRec, AckPhase::AwaitingComp) => Some(AckOutcome {
                reply: Some(Message::control(PacketKind::PubRel, packet_id)),
                retired: false,
            }),
            (PacketKind::PubComp, AckPhase::AwaitingComp) => {
                self.retire(packet_id, now);
                Some(AckOutcome {
                    reply: None,
                    retired: true,
                })
            }
            _ => None,
        }
    }

    fn retire(&mut self, packet_id: u16, now: Instant) {
        if self.inflight.remove(&packet_id).is_some() {
            let release_at = now + self.cfg.quiescence;
            self.quiescent.insert(packet_id, release_at);
            self.ids.lock().retire(packet_id, release_at);
        }
    }

    /// 接收侧处理一条入站发布。
    ///
    /// 返回 `(应用可见交付, 回给对端的确认)`；重复抑制后同一标识符至多
    /// 交付一次，确认照常回发（对端可能只是没收到上一次确认）。
    pub fn on_inbound_publish(
        &mut self,
        msg: Message,
        now: Instant,
    ) -> (Option<Message>, Option<Message>) {
        self.purge(now);
        match msg.header.qos {
            QosLevel::AtMostOnce => (Some(msg), None),
            QosLevel::AtLeastOnce => {
                let packet_id = msg.header.packet_id;
                let reply = Some(Message::control(PacketKind::PubAck, packet_id));
                if self.recv_seen.contains_key(&packet_id) {
                    tracing::debug!(packet_id, "duplicate qos1 publish suppressed");
                    (None, reply)
                } else {
                    self.recv_seen
                        .insert(packet_id, now + self.cfg.quiescence);
                    (Some(msg), reply)
                }
            }
            QosLevel::ExactlyOnce => {
                let packet_id = msg.header.packet_id;
                let reply = Some(Message::control(PacketKind::PubRec, packet_id));
                if !self.recv_seen.contains_key(&packet_id) {
                    // 交付推迟到 PubRel；重复的 Publish 不覆盖已扣留副本。
                    self.recv_held.entry(packet_id).or_insert(msg);
                }
                (None, reply)
            }
        }
    }

    /// 接收侧处理 `PubRel`：交付扣留的消息并回 `PubComp`。
    pub fn on_inbound_pubrel(
        &mut self,
        packet_id: u16,
        now: Instant,
    ) -> (Option<Message>, Message) {
        let delivered = self.recv_held.remove(&packet_id);
        if delivered.is_some() {
            self.recv_seen
                .insert(packet_id, now + self.cfg.quiescence);
        }
        (delivered, Message::control(PacketKind::PubComp, packet_id))
    }

    /// 收集到期重传，推进尝试计数并淘汰耗尽预算的记录。
    pub fn due_retransmits(&mut self, now: Instant) -> Retransmit {
        self.purge(now);
        let mut outcome = Retransmit::default();
        let due: Vec<u16> = self
            .inflight
            .values()
            .filter(|record| record.next_retry <= now)
            .map(|record| record.packet_id)
            .collect();
        for packet_id in due {
            let record = self
                .inflight
                .get_mut(&packet_id)
                .expect("due id collected under the same lock");
            if record.attempt >= self.cfg.max_attempts {
                tracing::warn!(
                    session = self.session_id,
                    packet_id,
                    attempts = record.attempt,
                    "delivery abandoned after exhausting retry budget"
                );
                self.retire(packet_id, now);
                outcome.failed.push(packet_id);
                continue;
            }
            record.attempt += 1;
            record.message.header.dup = true;
            record.next_retry = now + self.cfg.retry_backoff.delay_for(record.attempt - 1);
            outcome.frames.push(Self::resend_frame(record));
        }
        outcome
    }

    /// 下一次重传截止，驱动定时任务的睡眠目标。
    pub fn next_deadline(&self) -> Option<Instant> {
        self.inflight
            .values()
            .map(|record| record.next_retry)
            .min()
    }

    /// 会话恢复：按标识符顺序产出需要先于新发布重发的帧。
    ///
    /// 所有仍在等待确认的记录都带重复标志重发；第二轮握手未决的记录
    /// 重发 `PubRel` 而非载荷本身。
    pub fn resume_frames(&mut self, now: Instant) -> Vec<Message> {
        let mut frames = Vec::with_capacity(self.inflight.len());
        for record in self.inflight.values_mut() {
            record.message.header.dup = true;
            record.next_retry = now + self.cfg.retry_interval;
            frames.push(Self::resend_frame(record));
        }
        frames
    }

    fn resend_frame(record: &InflightRecord) -> Message {
        match record.phase {
            AckPhase::AwaitingComp => Message::control(PacketKind::PubRel, record.packet_id),
            _ => record.message.clone(),
        }
    }

    fn purge(&mut self, now: Instant) {
        self.quiescent.retain(|_, release_at| *release_at > now);
        self.recv_seen.retain(|_, forget_at| *forget_at > now);
    }
}
