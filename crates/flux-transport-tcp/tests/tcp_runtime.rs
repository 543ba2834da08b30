//! TCP 传输上的运行时端到端场景。
//!
//! 这里验证的是核心与真实网络栈的组合行为：帧边界、顺序、截止时间与
//! 连接丢失后的自动重拨，全部走 `127.0.0.1:0` 动态端口。

use bytes::Bytes;
use flux_core::{
    CoreError, Deadline, Message, Policy, QosLevel, RuntimeConfig, Socket, TransportRegistry,
};
use flux_transport_tcp::TcpTransport;
use std::sync::Arc;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

fn registry() -> Arc<TransportRegistry> {
    init_tracing();
    let registry = TransportRegistry::new();
    registry.register(Arc::new(TcpTransport::new()));
    Arc::new(registry)
}

fn socket(registry: &Arc<TransportRegistry>) -> Socket {
    Socket::new(Policy::Pair, RuntimeConfig::default(), Arc::clone(registry))
}

async fn recv_within(socket: &Socket, timeout: Duration) -> Message {
    socket
        .recv(Deadline::after(timeout))
        .wait()
        .await
        .expect("recv within deadline")
}

/// 同一连接上发送顺序即接收顺序，空载荷与大载荷同样成立。
#[tokio::test(flavor = "multi_thread")]
async fn ordered_delivery_over_tcp() {
    let registry = registry();
    let server = socket(&registry);
    let client = socket(&registry);

    let listener = server.listen("tcp://127.0.0.1:0").await.expect("bind");
    let _dialer = client.dial(listener.local_addr()).expect("dial");

    let payloads: Vec<Bytes> = vec![
        Bytes::from(vec![0x11; 10]),
        Bytes::new(),
        Bytes::from(vec![0x7E; 4096]),
    ];
    for payload in &payloads {
        client
            .send(
                Message::publish(payload.clone(), QosLevel::AtMostOnce),
                Deadline::after(Duration::from_secs(2)),
            )
            .wait()
            .await
            .expect("send");
    }
    for payload in &payloads {
        let got = recv_within(&server, Duration::from_secs(2)).await;
        assert_eq!(&got.payload, payload);
    }
}

/// 50ms 截止的接收以 `Timeout` 完成，随后到达的消息仍可被下一次接收取走。
#[tokio::test(flavor = "multi_thread")]
async fn recv_deadline_does_not_poison_the_socket() {
    let registry = registry();
    let server = socket(&registry);
    let client = socket(&registry);

    let listener = server.listen("tcp://127.0.0.1:0").await.expect("bind");
    let _dialer = client.dial(listener.local_addr()).expect("dial");

    let result = server
        .recv(Deadline::after(Duration::from_millis(50)))
        .wait()
        .await;
    assert!(matches!(result, Err(CoreError::Timeout)));

    client
        .send(
            Message::publish(Bytes::from_static(b"late"), QosLevel::AtMostOnce),
            Deadline::after(Duration::from_secs(2)),
        )
        .wait()
        .await
        .expect("send after timeout");
    let got = recv_within(&server, Duration::from_secs(2)).await;
    assert_eq!(&got.payload[..], b"late");
}

/// 非法 scheme 与非法绑定地址都在调用处同步失败。
#[tokio::test(flavor = "multi_thread")]
async fn bad_urls_fail_synchronously() {
    let registry = registry();
    let sock = socket(&registry);

    assert!(matches!(
        sock.dial("quantum://nowhere"),
        Err(CoreError::NotSupported(_))
    ));
    assert!(matches!(
        sock.dial("no-scheme"),
        Err(CoreError::NotSupported(_))
    ));
    // 不可绑定的地址在 listen 处报 IO 错误。
    assert!(matches!(
        sock.listen("tcp://256.256.256.256:1").await,
        Err(CoreError::Io(_))
    ));
}

/// 套接字关闭后，挂起的接收操作在有界时间内以 `Closed` 完成。
#[tokio::test(flavor = "multi_thread")]
async fn close_completes_pending_recv() {
    let registry = registry();
    let server = socket(&registry);
    let pending = server.recv(Deadline::none());
    server.close();
    let result = tokio::time::timeout(Duration::from_secs(2), pending.wait())
        .await
        .expect("completes in bounded time");
    assert!(matches!(result, Err(CoreError::Closed)));
}

/// 对端整体下线后拨号器退避重拨，新监听端上线即恢复投递。
#[tokio::test(flavor = "multi_thread")]
async fn dialer_reconnects_after_peer_restart() {
    let registry = registry();
    let client = socket(&registry);

    let first = socket(&registry);
    let listener = first.listen("tcp://127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().to_owned();
    let _dialer = client.dial(&addr).expect("dial");

    client
        .send(
            Message::publish(Bytes::from_static(b"one"), QosLevel::AtMostOnce),
            Deadline::after(Duration::from_secs(2)),
        )
        .wait()
        .await
        .expect("first send");
    let got = recv_within(&first, Duration::from_secs(2)).await;
    assert_eq!(&got.payload[..], b"one");

    // 第一个对端整体关闭；拨号器观察到管道移除并进入重拨。
    first.close();

    // 在同一地址重建监听端，重拨最终会命中它。旧监听任务的拆除是
    // 异步的，地址占用期间有界重试。
    let second = socket(&registry);
    let mut listener = None;
    for _ in 0..250 {
        match second.listen(&addr).await {
            Ok(bound) => {
                listener = Some(bound);
                break;
            }
            Err(CoreError::Io(err)) if err.kind() == std::io::ErrorKind::AddrInUse => {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(err) => panic!("rebind failed: {err}"),
        }
    }
    let _listener = listener.expect("rebind within bounded retries");

    // 发送侧默认排队模式：重连完成前消息滞留积压，连上即上线。
    client
        .send(
            Message::publish(Bytes::from_static(b"two"), QosLevel::AtMostOnce),
            Deadline::after(Duration::from_secs(10)),
        )
        .wait()
        .await
        .expect("second send");
    let got = recv_within(&second, Duration::from_secs(10)).await;
    assert_eq!(&got.payload[..], b"two");
}
