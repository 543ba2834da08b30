//! 会话存储契约与进程内实现。
//!
//! ## 契约说明（What）
//! - 存储是协作方提供的可持久组件：重连恢复时 `load`，记录退役时 `save`；
//! - 引擎把存储视为可靠但允许瞬时不可用：存储报错时重发被推迟（在途
//!   记录原样保留在内存并继续由重传定时器驱动），绝不因此丢弃。

use super::{AckPhase, QosEngine};
use crate::error::{CoreError, CoreResult};
use crate::message::{Message, QosLevel};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

/// 可持久化的在途发布记录快照。
///
/// 截止时间点不入存储：恢复侧以自身时钟重新武装重传定时器。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredRecord {
    /// 会话内报文标识符。
    pub packet_id: u16,
    /// QoS 等级。
    pub qos: QosLevel,
    /// 未决的握手阶段。
    pub phase: AckPhase,
    /// 已执行的投递尝试次数。
    pub attempt: u32,
    /// 原始消息（载荷经 `Bytes` 共享）。
    pub message: Message,
}

/// 一个会话的完整持久化快照。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// 仍在途的发布记录。
    pub records: Vec<StoredRecord>,
    /// 静默窗口内的已退役标识符。崩溃后立即复用这些标识符会把迟到的
    /// 确认误配到新记录上，恢复侧以完整静默窗口重新预留。
    pub retired: Vec<u16>,
}

/// 协作方存储接口。
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// 载入某会话遗留的快照。
    async fn load(&self, session_id: u64) -> CoreResult<SessionSnapshot>;
    /// 保存某会话当前的快照全量。
    async fn save(&self, session_id: u64, snapshot: &SessionSnapshot) -> CoreResult<()>;
}

/// 进程内存储实现，测试与默认装配使用。
#[derive(Default)]
pub struct MemorySessionStore {
    inner: Mutex<HashMap<u64, SessionSnapshot>>,
    /// 测试注入：置位时所有调用返回 `Store` 错误，模拟存储瞬时不可用。
    unavailable: Mutex<bool>,
}

impl MemorySessionStore {
    /// 创建空存储。
    pub fn new() -> Self {
        Self::default()
    }

    /// 切换可用性（测试注入点）。
    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock() = unavailable;
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, session_id: u64) -> CoreResult<SessionSnapshot> {
        if *self.unavailable.lock() {
            return Err(CoreError::Store("memory store offline".into()));
        }
        Ok(self
            .inner
            .lock()
            .get(&session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save(&self, session_id: u64, snapshot: &SessionSnapshot) -> CoreResult<()> {
        if *self.unavailable.lock() {
            return Err(CoreError::Store("memory store offline".into()));
        }
        self.inner.lock().insert(session_id, snapshot.clone());
        Ok(())
    }
}

impl QosEngine {
    /// 导出当前会话的持久化快照（在途记录加静默窗口内的退役标识符）。
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            records: self
                .inflight
                .values()
                .map(|record| StoredRecord {
                    packet_id: record.packet_id,
                    qos: record.qos,
                    phase: record.phase,
                    attempt: record.attempt,
                    message: record.message.clone(),
                })
                .collect(),
            retired: self.quiescent.keys().copied().collect(),
        }
    }

    /// 合并存储载入的快照；已存在的标识符以内存态优先。
    ///
    /// 快照中的退役标识符以完整静默窗口重新预留：宁可晚复用，也不在
    /// 应有的窗口内撞上迟到的确认。
    pub fn restore(&mut self, snapshot: SessionSnapshot, now: tokio::time::Instant) {
        for stored in snapshot.records {
            self.ids.lock().reserve(stored.packet_id);
            self.inflight
                .entry(stored.packet_id)
                .or_insert_with(|| super::InflightRecord {
                    packet_id: stored.packet_id,
                    qos: stored.qos,
                    phase: stored.phase,
                    attempt: stored.attempt,
                    next_retry: now + self.cfg.retry_interval,
                    message: stored.message,
                });
        }
        let release_at = now + self.cfg.quiescence;
        for packet_id in snapshot.retired {
            if self.inflight.contains_key(&packet_id) {
                continue;
            }
            self.quiescent.entry(packet_id).or_insert(release_at);
            self.ids.lock().retire(packet_id, release_at);
        }
    }
}
