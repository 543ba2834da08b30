#![deny(unsafe_code)]
#![doc = r#"
# flux-core

## 设计动机（Why）
- **定位**：本 crate 是 Flux 消息栈的运行时核心，将众多并发网络连接上的帧化
  协议消息，统一收敛到同一个可取消的异步完成原语（[`Aio`](crate::aio::Aio)）之上；
- **架构角色**：TCP/进程内等具体传输以 [`Transport`](crate::transport::Transport)
  契约接入，套接字、管道、拨号器与监听器对传输实现保持完全无感；
- **设计理念**：强调"所有权移交即契约"——操作被移交给唯一消费者，由其恰好
  完成一次；取消与超时通过同一条先完成者获胜的原子路径收敛。

## 核心契约（What）
- **输入条件**：调用方须在 Tokio 运行时内使用本 crate 的异步入口；
- **输出保障**：任何被发起的操作最终都会以成功、取消、超时或错误之一完成，
  不存在被静默遗弃的操作（运行时的活性契约）；
- **错误语义**：所有故障以 [`CoreError`](crate::error::CoreError) 的稳定分类
  上抛，传输层错误永不导致进程级终止。

## 模块导览（Where）
- [`aio`]：单次可取消异步操作原语与截止时间；
- [`transport`]：传输能力三元组契约与 scheme 注册表；
- [`message`]：跳数头部与包级字段的消息模型及二进制编解码；
- [`pipe`] / [`dialer`] / [`listener`]：连接生命周期状态机；
- [`socket`] / [`ctx`]：协议策略端点与独立逻辑流；
- [`device`]：带跳数上限的转发层；
- [`qos`]：至少一次/恰好一次投递引擎与会话存储契约；
- [`config`]：显式运行时配置，测试可注入任意上限。
"#]

pub mod aio;
pub mod config;
pub mod ctx;
pub mod device;
pub mod dialer;
pub mod error;
pub mod listener;
pub mod message;
pub mod pipe;
pub mod qos;
pub mod socket;
pub mod transport;

pub use aio::{Aio, AioCompleter, Cancellation, Deadline};
pub use config::{BackoffPolicy, BackpressureMode, QosConfig, RuntimeConfig};
pub use ctx::Context;
pub use device::Device;
pub use dialer::Dialer;
pub use error::{CoreError, CoreResult};
pub use listener::Listener;
pub use message::{Header, Message, PacketKind, QosLevel, MAX_MAX_TTL};
pub use pipe::{Pipe, PipeId, PipeState};
pub use qos::{
    AckPhase, MemorySessionStore, PacketIdAllocator, QosEngine, SessionSnapshot, SessionStore,
    SharedPacketIds, StoredRecord,
};
pub use socket::{Policy, Socket};
pub use transport::{parse_url, Acceptor, ConnPipe, Transport, TransportRegistry};
