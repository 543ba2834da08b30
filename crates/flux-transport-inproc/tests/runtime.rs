//! 进程内传输上的运行时全栈场景。
//!
//! 无需网络栈即可驱动套接字、上下文、QoS 引擎与转发层的组合行为；
//! 需要"不守规矩的对端"（不回确认、中途掐线）的场景直接持有传输层
//! 连接手工解码帧。

use bytes::Bytes;
use flux_core::{
    Acceptor as _, BackoffPolicy, BackpressureMode, ConnPipe as _, CoreError, Deadline,
    MemorySessionStore, Message, Policy, QosConfig, QosLevel, RuntimeConfig, SessionStore, Socket,
    Transport, TransportRegistry,
};
use flux_transport_inproc::InprocTransport;
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

fn fast_qos() -> QosConfig {
    QosConfig {
        retry_interval: Duration::from_millis(50),
        retry_backoff: BackoffPolicy {
            initial: Duration::from_millis(50),
            max: Duration::from_millis(200),
            multiplier: 1,
        },
        max_attempts: 2,
        max_inflight: 32,
        quiescence: Duration::from_secs(1),
    }
}

fn fast_config() -> RuntimeConfig {
    RuntimeConfig {
        reconnect: BackoffPolicy {
            initial: Duration::from_millis(20),
            max: Duration::from_millis(100),
            multiplier: 2,
        },
        qos: fast_qos(),
        ..RuntimeConfig::default()
    }
}

struct Harness {
    transport: Arc<InprocTransport>,
    registry: Arc<TransportRegistry>,
}

impl Harness {
    fn new() -> Self {
        init_tracing();
        let transport = Arc::new(InprocTransport::new());
        let registry = Arc::new(TransportRegistry::new());
        registry.register(Arc::clone(&transport) as Arc<dyn Transport>);
        Self {
            transport,
            registry,
        }
    }

    fn socket(&self, policy: Policy) -> Socket {
        Socket::new(policy, fast_config(), Arc::clone(&self.registry))
    }

    fn socket_with(&self, policy: Policy, config: RuntimeConfig) -> Socket {
        Socket::new(policy, config, Arc::clone(&self.registry))
    }
}

fn registry() -> Arc<TransportRegistry> {
    init_tracing();
    let registry = TransportRegistry::new();
    registry.register(Arc::new(InprocTransport::new()));
    Arc::new(registry)
}

async fn recv_within(socket: &Socket, timeout: Duration) -> Message {
    socket
        .recv(Deadline::after(timeout))
        .wait()
        .await
        .expect("recv within deadline")
}

async fn wait_for_pipes(socket: &Socket, count: usize) {
    for _ in 0..200 {
        if socket.pipe_count() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {count} pipes, saw {}", socket.pipe_count());
}

/// 扇出策略：一次发送抵达全部已挂载的管道。
#[tokio::test(flavor = "multi_thread")]
async fn fanout_reaches_every_pipe() {
    let h = Harness::new();
    let publisher = h.socket(Policy::Fanout);
    let sub_a = h.socket(Policy::Pair);
    let sub_b = h.socket(Policy::Pair);

    let _la = sub_a.listen("inproc://fanout-a").await.expect("bind a");
    let _lb = sub_b.listen("inproc://fanout-b").await.expect("bind b");
    let _da = publisher.dial("inproc://fanout-a").expect("dial a");
    let _db = publisher.dial("inproc://fanout-b").expect("dial b");
    wait_for_pipes(&publisher, 2).await;

    publisher
        .send(
            Message::publish(Bytes::from_static(b"broadcast"), QosLevel::AtMostOnce),
            Deadline::after(Duration::from_secs(2)),
        )
        .wait()
        .await
        .expect("fanout send");

    for sub in [&sub_a, &sub_b] {
        let got = recv_within(sub, Duration::from_secs(2)).await;
        assert_eq!(&got.payload[..], b"broadcast");
    }
}

/// 轮转策略：连续发送在管道间交替分摊。
#[tokio::test(flavor = "multi_thread")]
async fn round_robin_alternates_between_pipes() {
    let h = Harness::new();
    let publisher = h.socket(Policy::RoundRobin);
    let sub_a = h.socket(Policy::Pair);
    let sub_b = h.socket(Policy::Pair);

    let _la = sub_a.listen("inproc://rr-a").await.expect("bind a");
    let _lb = sub_b.listen("inproc://rr-b").await.expect("bind b");
    let _da = publisher.dial("inproc://rr-a").expect("dial a");
    let _db = publisher.dial("inproc://rr-b").expect("dial b");
    wait_for_pipes(&publisher, 2).await;

    for i in 0..4u8 {
        publisher
            .send(
                Message::publish(Bytes::from(vec![i]), QosLevel::AtMostOnce),
                Deadline::after(Duration::from_secs(2)),
            )
            .wait()
            .await
            .expect("rr send");
    }

    // 每个订阅端各得两条；与订阅端的绑定顺序无关，只看分摊均衡。
    let mut a_count = 0;
    let mut b_count = 0;
    for _ in 0..2 {
        recv_within(&sub_a, Duration::from_secs(2)).await;
        a_count += 1;
        recv_within(&sub_b, Duration::from_secs(2)).await;
        b_count += 1;
    }
    assert_eq!(a_count, 2);
    assert_eq!(b_count, 2);
    for sub in [&sub_a, &sub_b] {
        let extra = sub
            .recv(Deadline::after(Duration::from_millis(200)))
            .wait()
            .await;
        assert!(matches!(extra, Err(CoreError::Timeout)), "多余消息意味着分摊失衡");
    }
}

/// QoS 1 端到端：接收方自动确认，发送方在途记录退役。
#[tokio::test(flavor = "multi_thread")]
async fn qos1_publish_retires_after_ack() {
    let h = Harness::new();
    let server = h.socket(Policy::Pair);
    let client = h.socket(Policy::Pair);
    let _listener = server.listen("inproc://qos1").await.expect("bind");
    let _dialer = client.dial("inproc://qos1").expect("dial");
    wait_for_pipes(&client, 1).await;

    let ctx = client.open_context().expect("ctx");
    ctx.send(
        Message::publish(Bytes::from_static(b"durable"), QosLevel::AtLeastOnce),
        Deadline::after(Duration::from_secs(2)),
    )
    .wait()
    .await
    .expect("qos1 send");

    let got = recv_within(&server, Duration::from_secs(2)).await;
    assert_eq!(&got.payload[..], b"durable");
    assert_eq!(got.header.qos, QosLevel::AtLeastOnce);

    // 确认回流后在途窗口归零。
    for _ in 0..200 {
        if ctx.inflight_len() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("inflight record never retired");
}

/// QoS 2 端到端：交付推迟到释放且恰好一次，两轮握手后退役。
#[tokio::test(flavor = "multi_thread")]
async fn qos2_delivers_exactly_once() {
    let h = Harness::new();
    let server = h.socket(Policy::Pair);
    let client = h.socket(Policy::Pair);
    let _listener = server.listen("inproc://qos2").await.expect("bind");
    let _dialer = client.dial("inproc://qos2").expect("dial");
    wait_for_pipes(&client, 1).await;

    let ctx = client.open_context().expect("ctx");
    ctx.send(
        Message::publish(Bytes::from_static(b"once"), QosLevel::ExactlyOnce),
        Deadline::after(Duration::from_secs(2)),
    )
    .wait()
    .await
    .expect("qos2 send");

    let got = recv_within(&server, Duration::from_secs(2)).await;
    assert_eq!(&got.payload[..], b"once");

    // 第二条不应出现（恰好一次）。
    let extra = server
        .recv(Deadline::after(Duration::from_millis(200)))
        .wait()
        .await;
    assert!(matches!(extra, Err(CoreError::Timeout)));

    for _ in 0..200 {
        if ctx.inflight_len() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("qos2 handshake never completed");
}

/// 同一套接字的姊妹上下文各发一条 QoS 1 发布，两条都必须抵达：
/// 共享标识符空间杜绝了第二条被当作重复抑制的可能。
#[tokio::test(flavor = "multi_thread")]
async fn sibling_contexts_deliver_distinct_qos1_publishes() {
    let h = Harness::new();
    let server = h.socket(Policy::Pair);
    let client = h.socket(Policy::Pair);
    let _listener = server.listen("inproc://siblings").await.expect("bind");
    let _dialer = client.dial("inproc://siblings").expect("dial");
    wait_for_pipes(&client, 1).await;

    let ctx_a = client.open_context().expect("ctx a");
    let ctx_b = client.open_context().expect("ctx b");
    for (ctx, payload) in [(&ctx_a, &b"from-a"[..]), (&ctx_b, &b"from-b"[..])] {
        ctx.send(
            Message::publish(Bytes::copy_from_slice(payload), QosLevel::AtLeastOnce),
            Deadline::after(Duration::from_secs(2)),
        )
        .wait()
        .await
        .expect("sibling send");
    }

    let mut payloads = vec![
        recv_within(&server, Duration::from_secs(2)).await.payload,
        recv_within(&server, Duration::from_secs(2)).await.payload,
    ];
    payloads.sort();
    assert_eq!(
        payloads,
        vec![Bytes::from_static(b"from-a"), Bytes::from_static(b"from-b")]
    );

    // 两条在途记录都各自退役。
    for _ in 0..200 {
        if ctx_a.inflight_len() == 0 && ctx_b.inflight_len() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("sibling inflight records never retired");
}

/// 丢弃未决的接收操作不吞消息：帧留在队列里交给下一次接收。
#[tokio::test(flavor = "multi_thread")]
async fn dropped_recv_operation_does_not_lose_messages() {
    let h = Harness::new();
    let server = h.socket(Policy::Pair);
    let client = h.socket(Policy::Pair);
    let _listener = server.listen("inproc://drop-recv").await.expect("bind");
    let _dialer = client.dial("inproc://drop-recv").expect("dial");
    wait_for_pipes(&client, 1).await;

    let pending = server.recv(Deadline::none());
    drop(pending);

    client
        .send(
            Message::publish(Bytes::from_static(b"kept"), QosLevel::AtMostOnce),
            Deadline::after(Duration::from_secs(2)),
        )
        .wait()
        .await
        .expect("send after dropped recv");

    let got = recv_within(&server, Duration::from_secs(2)).await;
    assert_eq!(&got.payload[..], b"kept");
}

/// 确认不回流时按退避重传（带重复标志），预算耗尽后上报终态失败。
#[tokio::test(flavor = "multi_thread")]
async fn silent_peer_triggers_retransmit_then_failure() {
    let h = Harness::new();
    // 不守规矩的对端：收下发布但从不回确认。
    let acceptor = h.transport.listen("silent").await.expect("bind");
    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        let conn = match acceptor.accept().await {
            Ok(conn) => conn,
            Err(_) => return,
        };
        while let Ok(frame) = conn.recv().await {
            let msg = Message::decode(frame).expect("well-formed frame");
            let _ = seen_tx.send(msg);
        }
    });

    let client = h.socket(Policy::Pair);
    let _dialer = client.dial("inproc://silent").expect("dial");
    wait_for_pipes(&client, 1).await;
    let ctx = client.open_context().expect("ctx");
    ctx.send(
        Message::publish(Bytes::from_static(b"doomed"), QosLevel::AtLeastOnce),
        Deadline::after(Duration::from_secs(2)),
    )
    .wait()
    .await
    .expect("initial send");

    let first = seen_rx.recv().await.expect("first attempt");
    assert!(!first.header.dup);
    let second = tokio::time::timeout(Duration::from_secs(2), seen_rx.recv())
        .await
        .expect("retransmit arrives")
        .expect("retransmit");
    assert!(second.header.dup, "重传必须置重复标志");
    assert_eq!(second.header.packet_id, first.header.packet_id);

    let failure = tokio::time::timeout(Duration::from_secs(2), ctx.next_delivery_failure())
        .await
        .expect("failure reported")
        .expect("failure entry");
    assert_eq!(failure.0, first.header.packet_id);
    assert!(matches!(failure.1, CoreError::Timeout));
    assert_eq!(ctx.inflight_len(), 0);
}

/// 管道丢失后重连，在途发布带重复标志先于新消息重新上线。
#[tokio::test(flavor = "multi_thread")]
async fn session_resumes_on_reconnect() {
    let h = Harness::new();
    // 第一个对端收下发布后直接掐线。
    let acceptor = h.transport.listen("flaky").await.expect("bind");
    let (first_tx, first_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let conn = match acceptor.accept().await {
            Ok(conn) => conn,
            Err(_) => return,
        };
        let frame = conn.recv().await.expect("first publish");
        let msg = Message::decode(frame).expect("well-formed frame");
        let _ = first_tx.send(msg);
        conn.close().await;
        acceptor.close().await;
    });

    // 重传间隔放大，确保恢复帧来自重连路径而非定时器。
    let mut config = fast_config();
    config.qos.retry_interval = Duration::from_secs(30);
    config.qos.retry_backoff.initial = Duration::from_secs(30);
    let client = h.socket_with(Policy::Pair, config);
    let _dialer = client.dial("inproc://flaky").expect("dial");
    wait_for_pipes(&client, 1).await;
    let ctx = client.open_context().expect("ctx");
    let store = Arc::new(MemorySessionStore::new());
    ctx.set_store(Arc::clone(&store) as Arc<dyn SessionStore>);

    ctx.send(
        Message::publish(Bytes::from_static(b"survivor"), QosLevel::AtLeastOnce),
        Deadline::after(Duration::from_secs(2)),
    )
    .wait()
    .await
    .expect("send before drop");
    let first = first_rx.await.expect("first delivery observed");
    assert!(!first.header.dup);

    // 同名端点换成守规矩的服务端，重拨后恢复帧上线。
    tokio::time::sleep(Duration::from_millis(50)).await;
    let server = h.socket(Policy::Pair);
    let _listener = server.listen("inproc://flaky").await.expect("rebind");

    let resumed = recv_within(&server, Duration::from_secs(5)).await;
    assert_eq!(&resumed.payload[..], b"survivor");
    assert!(resumed.header.dup, "恢复帧必须置重复标志");
    assert_eq!(resumed.header.packet_id, first.header.packet_id);

    // 服务端确认后在途窗口归零，存储中的快照随退役清空。
    for _ in 0..200 {
        if ctx.inflight_len() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(ctx.inflight_len(), 0);
    for _ in 0..200 {
        let snapshot = store.load(ctx.session_id()).await.expect("store load");
        if snapshot.records.is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("store snapshot never cleared after retirement");
}

/// 关联标识把应答定向到发起上下文，互不串线。
#[tokio::test(flavor = "multi_thread")]
async fn correlation_routes_replies_to_their_context() {
    let h = Harness::new();
    let server = h.socket(Policy::Pair);
    let client = h.socket(Policy::Pair);
    let _listener = server.listen("inproc://reqrep").await.expect("bind");
    let _dialer = client.dial("inproc://reqrep").expect("dial");
    wait_for_pipes(&client, 1).await;

    // 应答端：原样回显载荷，保留关联标识。
    let responder = async {
        for _ in 0..2 {
            let req = recv_within(&server, Duration::from_secs(2)).await;
            let mut reply = Message::publish(req.payload.clone(), QosLevel::AtMostOnce);
            reply.header.correlation = req.header.correlation;
            server
                .send(reply, Deadline::after(Duration::from_secs(2)))
                .wait()
                .await
                .expect("reply send");
        }
    };

    let ctx_a = client.open_context().expect("ctx a");
    let ctx_b = client.open_context().expect("ctx b");
    ctx_a.set_correlation(Some(101));
    ctx_b.set_correlation(Some(202));

    let requester = async {
        ctx_a
            .send(
                Message::publish(Bytes::from_static(b"alpha"), QosLevel::AtMostOnce),
                Deadline::after(Duration::from_secs(2)),
            )
            .wait()
            .await
            .expect("req a");
        ctx_b
            .send(
                Message::publish(Bytes::from_static(b"beta"), QosLevel::AtMostOnce),
                Deadline::after(Duration::from_secs(2)),
            )
            .wait()
            .await
            .expect("req b");

        let reply_b = ctx_b
            .recv(Deadline::after(Duration::from_secs(2)))
            .wait()
            .await
            .expect("reply b");
        let reply_a = ctx_a
            .recv(Deadline::after(Duration::from_secs(2)))
            .wait()
            .await
            .expect("reply a");
        assert_eq!(&reply_a.payload[..], b"alpha");
        assert_eq!(reply_a.header.correlation, 101);
        assert_eq!(&reply_b.payload[..], b"beta");
        assert_eq!(reply_b.header.correlation, 202);
    };

    tokio::join!(responder, requester);
}

/// 无管道时：排队模式缓冲到上限后报背压，失败模式立即报无管道。
#[tokio::test(flavor = "multi_thread")]
async fn backpressure_modes_govern_pipeless_sends() {
    let reg = registry();
    let mut queue_cfg = fast_config();
    queue_cfg.send_queue_depth = 1;
    let queued = Socket::new(Policy::Pair, queue_cfg, Arc::clone(&reg));

    let first = queued.send(
        Message::publish(Bytes::from_static(b"buffered"), QosLevel::AtMostOnce),
        Deadline::none(),
    );
    assert!(!first.is_settled(), "队列未满不应立即完成");
    let second = queued
        .send(
            Message::publish(Bytes::from_static(b"overflow"), QosLevel::AtMostOnce),
            Deadline::none(),
        )
        .wait()
        .await;
    assert!(matches!(second, Err(CoreError::Backpressure)));
    queued.close();
    assert!(matches!(first.wait().await, Err(CoreError::Closed)));

    let mut fail_cfg = fast_config();
    fail_cfg.backpressure = BackpressureMode::Fail;
    let failing = Socket::new(Policy::Pair, fail_cfg, reg);
    let result = failing
        .send(
            Message::publish(Bytes::from_static(b"nope"), QosLevel::AtMostOnce),
            Deadline::none(),
        )
        .wait()
        .await;
    assert!(matches!(result, Err(CoreError::NoPipes)));
}

/// 转发设备盖跳戳中继消息；跳数达到上限的消息被丢弃，中继继续存活。
#[tokio::test(flavor = "multi_thread")]
async fn device_relays_and_enforces_hop_limit() {
    let h = Harness::new();
    let left = h.socket(Policy::Pair);
    let right = h.socket(Policy::Pair);
    let relay_left = h.socket(Policy::Pair);
    let relay_right = h.socket(Policy::Pair);

    let _ll = relay_left.listen("inproc://relay-l").await.expect("bind l");
    let _lr = relay_right.listen("inproc://relay-r").await.expect("bind r");
    let _dl = left.dial("inproc://relay-l").expect("dial l");
    let _dr = right.dial("inproc://relay-r").expect("dial r");
    wait_for_pipes(&relay_left, 1).await;
    wait_for_pipes(&relay_right, 1).await;

    let mut config = fast_config();
    config.max_ttl = 1;
    let device = flux_core::Device::new(&config);
    let relay_id = relay_left.local_id();
    tokio::spawn(async move {
        let _ = device.run(&relay_left, &relay_right).await;
    });

    // 已经带满跳戳的消息在设备处被丢弃。
    let mut poisoned = Message::publish(Bytes::from_static(b"loop"), QosLevel::AtMostOnce);
    poisoned.header.push_hop(9999).expect("pre-stamp");
    left.send(poisoned, Deadline::after(Duration::from_secs(2)))
        .wait()
        .await
        .expect("send poisoned");

    // 干净消息照常过中继并带上中继的跳戳。
    left.send(
        Message::publish(Bytes::from_static(b"through"), QosLevel::AtMostOnce),
        Deadline::after(Duration::from_secs(2)),
    )
    .wait()
    .await
    .expect("send clean");

    let got = recv_within(&right, Duration::from_secs(2)).await;
    assert_eq!(&got.payload[..], b"through", "超限消息不得越过中继");
    assert_eq!(got.header.hop_count(), 1);
    assert_eq!(got.header.hops(), &[relay_id]);

    let extra = right
        .recv(Deadline::after(Duration::from_millis(200)))
        .wait()
        .await;
    assert!(matches!(extra, Err(CoreError::Timeout)));
}

/// 套接字关闭级联：上下文与挂起操作全部以 `Closed` 收尾。
#[tokio::test(flavor = "multi_thread")]
async fn socket_close_cascades_to_contexts() {
    let h = Harness::new();
    let server = h.socket(Policy::Pair);
    let client = h.socket(Policy::Pair);
    let _listener = server.listen("inproc://cascade").await.expect("bind");
    let _dialer = client.dial("inproc://cascade").expect("dial");
    wait_for_pipes(&client, 1).await;

    let ctx = client.open_context().expect("ctx");
    let pending = ctx.recv(Deadline::none());
    client.close();

    let result = tokio::time::timeout(Duration::from_secs(2), pending.wait())
        .await
        .expect("bounded completion");
    assert!(matches!(result, Err(CoreError::Closed)));
    assert!(matches!(
        ctx.send(
            Message::publish(Bytes::new(), QosLevel::AtMostOnce),
            Deadline::none()
        )
        .wait()
        .await,
        Err(CoreError::Closed)
    ));
}
