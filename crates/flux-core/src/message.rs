//! 消息模型与二进制编解码。
//!
//! ## 设计背景（Why）
//! - 转发层需要在消息头部预留固定容量的跳数区，用于环路防护：最多
//!   [`MAX_MAX_TTL`] 个 32 位跳地址加一个 32 位关联标识，即
//!   `(MAX_MAX_TTL + 1) * 4` 字节的线上预留区；
//! - QoS 引擎需要包级字段（包类型、QoS 等级、重复标志、报文标识符）随
//!   消息一起过线，因此它们是头部的一等公民而非外挂元数据。
//!
//! ## 契约说明（What）
//! - 跳数等于已记录的跳地址个数，只增不减；
//! - 编解码建立在 `bytes` 之上，载荷以 [`Bytes`] 共享，克隆零拷贝；
//! - 任何畸形输入都以 [`CoreError::ProtocolError`] 拒绝，解码永不 panic。

use crate::error::{CoreError, CoreResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// 跳数上限的硬界：跳数区按此容量预留线上空间。
pub const MAX_MAX_TTL: usize = 15;

/// 线上头部为跳转发预留的固定区域大小（跳地址 + 关联标识）。
pub const HOP_HEADER_BYTES: usize = (MAX_MAX_TTL + 1) * 4;

/// 包类型，覆盖发布与两级确认握手。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PacketKind {
    /// 应用载荷发布。
    Publish,
    /// QoS 1 确认。
    PubAck,
    /// QoS 2 第一轮：收到。
    PubRec,
    /// QoS 2 第二轮：释放。
    PubRel,
    /// QoS 2 完成。
    PubComp,
}

impl PacketKind {
    fn to_wire(self) -> u8 {
        match self {
            PacketKind::Publish => 0,
            PacketKind::PubAck => 1,
            PacketKind::PubRec => 2,
            PacketKind::PubRel => 3,
            PacketKind::PubComp => 4,
        }
    }

    fn from_wire(value: u8) -> CoreResult<Self> {
        Ok(match value {
            0 => PacketKind::Publish,
            1 => PacketKind::PubAck,
            2 => PacketKind::PubRec,
            3 => PacketKind::PubRel,
            4 => PacketKind::PubComp,
            other => {
                return Err(CoreError::protocol(format!("unknown packet kind {other}")));
            }
        })
    }
}

/// 投递保证等级。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QosLevel {
    /// 至多一次：发完即忘。
    AtMostOnce,
    /// 至少一次：确认 + 重传。
    AtLeastOnce,
    /// 恰好一次：两轮握手。
    ExactlyOnce,
}

impl QosLevel {
    /// 线上表示（0/1/2）。
    pub fn as_u8(self) -> u8 {
        match self {
            QosLevel::AtMostOnce => 0,
            QosLevel::AtLeastOnce => 1,
            QosLevel::ExactlyOnce => 2,
        }
    }

    fn from_wire(value: u8) -> CoreResult<Self> {
        Ok(match value {
            0 => QosLevel::AtMostOnce,
            1 => QosLevel::AtLeastOnce,
            2 => QosLevel::ExactlyOnce,
            other => return Err(CoreError::protocol(format!("invalid qos level {other}"))),
        })
    }
}

/// 消息头部：包级字段 + 跳数区。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    /// 包类型。
    pub kind: PacketKind,
    /// QoS 等级。
    pub qos: QosLevel,
    /// 重复投递标志，重传时置位。
    pub dup: bool,
    /// 报文标识符，QoS 0 消息固定为 0。
    pub packet_id: u16,
    /// 请求/应答关联标识。
    pub correlation: u32,
    hops: Vec<u32>,
}

impl Header {
    fn control(kind: PacketKind, packet_id: u16) -> Self {
        Self {
            kind,
            qos: QosLevel::AtMostOnce,
            dup: false,
            packet_id,
            correlation: 0,
            hops: Vec::new(),
        }
    }

    /// 当前跳数。
    pub fn hop_count(&self) -> usize {
        self.hops.len()
    }

    /// 已记录的跳地址（最早的在前）。
    pub fn hops(&self) -> &[u32] {
        &self.hops
    }

    /// 记录一跳；超出硬界 [`MAX_MAX_TTL`] 时拒绝。
    ///
    /// 转发层应先按配置上限判定再调用本方法；硬界校验只是容量保护。
    pub fn push_hop(&mut self, addr: u32) -> CoreResult<()> {
        if self.hops.len() >= MAX_MAX_TTL {
            return Err(CoreError::protocol("hop region full"));
        }
        self.hops.push(addr);
        Ok(())
    }
}

/// 一条可过线的消息：头部 + 载荷。
///
/// # 教案式注释
///
/// ## 契约（What）
/// - 载荷为 [`Bytes`]，扇出发送时克隆仅增加引用计数；
/// - 线上布局（定长字段网络序）：
///   `kind(1) | flags(1: qos 低两位, dup 第 2 位) | hop_count(1) | packet_id(2) | correlation(4) | hops(4 * hop_count) | payload`；
/// - 帧边界由传输层负责（长度前缀或消息通道），本编码不含长度字段。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// 头部。
    pub header: Header,
    /// 应用载荷。
    pub payload: Bytes,
}

const FLAG_DUP: u8 = 0b0000_0100;
const FLAG_QOS_MASK: u8 = 0b0000_0011;
const FIXED_PREFIX: usize = 1 + 1 + 1 + 2 + 4;

impl Message {
    /// 构造一条发布消息。
    pub fn publish(payload: impl Into<Bytes>, qos: QosLevel) -> Self {
        Self {
            header: Header {
                kind: PacketKind::Publish,
                qos,
                dup: false,
                packet_id: 0,
                correlation: 0,
                hops: Vec::new(),
            },
            payload: payload.into(),
        }
    }

    /// 构造一条无载荷的控制消息（确认握手用）。
    pub fn control(kind: PacketKind, packet_id: u16) -> Self {
        Self {
            header: Header::control(kind, packet_id),
            payload: Bytes::new(),
        }
    }

    /// 编码后的总字节数。
    pub fn encoded_len(&self) -> usize {
        FIXED_PREFIX + self.header.hop_count() * 4 + self.payload.len()
    }

    /// 编码为独立的帧字节串。
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// 追加编码到给定缓冲区。
    pub fn encode_into(&self, buf: &mut BytesMut) {
        let h = &self.header;
        buf.put_u8(h.kind.to_wire());
        let mut flags = h.qos.as_u8() & FLAG_QOS_MASK;
        if h.dup {
            flags |= FLAG_DUP;
        }
        buf.put_u8(flags);
        buf.put_u8(h.hop_count() as u8);
        buf.put_u16(h.packet_id);
        buf.put_u32(h.correlation);
        for hop in &h.hops {
            buf.put_u32(*hop);
        }
        buf.extend_from_slice(&self.payload);
    }

    /// 从帧字节串解码；畸形输入返回 [`CoreError::ProtocolError`]。
    pub fn decode(mut frame: Bytes) -> CoreResult<Self> {
        if frame.len() < FIXED_PREFIX {
            return Err(CoreError::protocol("frame shorter than fixed prefix"));
        }
        let kind = PacketKind::from_wire(frame.get_u8())?;
        let flags = frame.get_u8();
        let qos = QosLevel::from_wire(flags & FLAG_QOS_MASK)?;
        let dup = flags & FLAG_DUP != 0;
        let hop_count = frame.get_u8() as usize;
        if hop_count > MAX_MAX_TTL {
            return Err(CoreError::protocol(format!(
                "hop count {hop_count} exceeds reserved region"
            )));
        }
        let packet_id = frame.get_u16();
        let correlation = frame.get_u32();
        if frame.len() < hop_count * 4 {
            return Err(CoreError::protocol("truncated hop region"));
        }
        let mut hops = Vec::with_capacity(hop_count);
        for _ in 0..hop_count {
            hops.push(frame.get_u32());
        }
        Ok(Self {
            header: Header {
                kind,
                qos,
                dup,
                packet_id,
                correlation,
                hops,
            },
            payload: frame,
        })
    }
}
