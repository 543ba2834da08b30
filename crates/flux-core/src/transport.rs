//! 传输契约与 scheme 注册表。
//!
//! ## 设计背景（Why）
//! - 套接字/管道/拨号器/监听器层必须对具体网络技术保持无感：新增一种
//!   传输只需实现本模块的能力三元组（拨号、监听、连接管道），不触碰任何
//!   套接字逻辑；
//! - scheme 字符串在拨号/监听时选择实现，未注册的 scheme 以
//!   [`CoreError::NotSupported`] 同步拒绝。
//!
//! ## 契约说明（What）
//! - **关闭契约**：任一绑定实例 `close()` 之后，其上所有在途操作必须在
//!   有界时间内以 `Closed` 类错误完成——不允许静默泄漏操作；
//! - 连接管道内部可自由选择帧化方式（长度前缀、消息通道等），对上层只
//!   暴露"一帧进、一帧出"的有序可靠语义。

use crate::error::{CoreError, CoreResult};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// 一条已建立连接的传输侧管道操作表。
///
/// ## 契约（What）
/// - `send`/`recv` 各自可被并发调用，但实现内部须分别串行化，保证发送
///   顺序即线上顺序、接收顺序即到达顺序；
/// - `close` 幂等；关闭后 `send`/`recv` 在有界时间内返回
///   [`CoreError::Closed`]。
#[async_trait]
pub trait ConnPipe: Send + Sync {
    /// 发送一帧完整字节串。
    async fn send(&self, frame: Bytes) -> CoreResult<()>;
    /// 接收下一帧完整字节串。
    async fn recv(&self) -> CoreResult<Bytes>;
    /// 关闭连接并唤醒所有在途操作。
    async fn close(&self);
    /// 对端地址的结构化文本表示。
    fn peer_addr(&self) -> String;
}

/// 被动端操作表：长期存活的接受循环。
#[async_trait]
pub trait Acceptor: Send + Sync {
    /// 接受下一条入站连接。
    async fn accept(&self) -> CoreResult<Box<dyn ConnPipe>>;
    /// 实际绑定地址（`tcp://127.0.0.1:0` 场景用于回查端口）。
    fn local_addr(&self) -> String;
    /// 关闭监听端并唤醒在途 `accept`。
    async fn close(&self);
}

/// 每种传输 scheme 的能力入口。
#[async_trait]
pub trait Transport: Send + Sync {
    /// 该传输注册使用的 scheme 字符串。
    fn scheme(&self) -> &'static str;
    /// 主动建立一条到 `addr` 的连接。
    async fn dial(&self, addr: &str) -> CoreResult<Box<dyn ConnPipe>>;
    /// 在 `addr` 上开始监听；绑定/权限类错误在此同步失败。
    async fn listen(&self, addr: &str) -> CoreResult<Box<dyn Acceptor>>;
}

/// scheme → 传输实现的注册表。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 配置期组装：进程在启动时注册其需要的传输集合，套接字按 URL 的
///   scheme 查表路由，互不了解彼此；
/// - 读多写少，使用 `parking_lot::RwLock` 保护。
#[derive(Default)]
pub struct TransportRegistry {
    inner: RwLock<HashMap<&'static str, Arc<dyn Transport>>>,
}

impl TransportRegistry {
    /// 创建空注册表。
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册一种传输；同 scheme 重复注册以后者覆盖前者。
    pub fn register(&self, transport: Arc<dyn Transport>) {
        self.inner.write().insert(transport.scheme(), transport);
    }

    /// 按 scheme 查找传输实现。
    pub fn lookup(&self, scheme: &str) -> CoreResult<Arc<dyn Transport>> {
        self.inner
            .read()
            .get(scheme)
            .cloned()
            .ok_or_else(|| CoreError::not_supported(format!("transport scheme `{scheme}`")))
    }
}

impl std::fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let schemes: Vec<&str> = self.inner.read().keys().copied().collect();
        f.debug_struct("TransportRegistry")
            .field("schemes", &schemes)
            .finish()
    }
}

/// 将 `scheme://rest` 形式的 URL 拆分为 `(scheme, rest)`。
pub fn parse_url(url: &str) -> CoreResult<(&str, &str)> {
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| CoreError::not_supported(format!("malformed url `{url}`")))?;
    if scheme.is_empty() || rest.is_empty() {
        return Err(CoreError::not_supported(format!("malformed url `{url}`")));
    }
    Ok((scheme, rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullTransport;

    #[async_trait]
    impl Transport for NullTransport {
        fn scheme(&self) -> &'static str {
            "null"
        }

        async fn dial(&self, _addr: &str) -> CoreResult<Box<dyn ConnPipe>> {
            Err(CoreError::not_supported("null transport cannot dial"))
        }

        async fn listen(&self, _addr: &str) -> CoreResult<Box<dyn Acceptor>> {
            Err(CoreError::not_supported("null transport cannot listen"))
        }
    }

    #[test]
    fn unknown_scheme_is_rejected_with_not_supported() {
        let registry = TransportRegistry::new();
        registry.register(Arc::new(NullTransport));
        assert!(registry.lookup("null").is_ok());
        assert!(matches!(
            registry.lookup("quantum"),
            Err(CoreError::NotSupported(_))
        ));
    }

    #[test]
    fn url_splitting_contract() {
        assert_eq!(parse_url("tcp://127.0.0.1:7447").unwrap(), ("tcp", "127.0.0.1:7447"));
        assert_eq!(parse_url("inproc://relay-a").unwrap(), ("inproc", "relay-a"));
        assert!(parse_url("no-scheme-here").is_err());
        assert!(parse_url("://empty").is_err());
        assert!(parse_url("tcp://").is_err());
    }
}
