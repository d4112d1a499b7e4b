//! 安全通道的回环集成测试：真实 TCP + 真实握手。
//!
//! 证书由 rcgen 即席签发，客户端把它注入为信任锚。

use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use keel_core::prelude::*;
use keel_transport_tcp::{TcpChannel, TcpListener};
use keel_transport_tls::{TlsChannel, TlsClientConfig, TlsListener, TlsServerConfig, codes};

fn certified() -> (TlsServerConfig, TlsClientConfig) {
    let issued = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_pem = issued.cert.pem();
    let key_pem = issued.key_pair.serialize_pem();
    let server = TlsServerConfig::from_pem(cert_pem.as_bytes(), key_pem.as_bytes()).unwrap();
    let client = TlsClientConfig::from_root_pem(cert_pem.as_bytes()).unwrap();
    (server, client)
}

/// 完整的安全回环对：客户端安全通道、服务端安全通道、客户端明文把手。
///
/// 明文把手留给需要在 TLS 之下制造链路断裂的测试。
fn secure_pair() -> (Arc<TlsChannel>, Arc<dyn ByteChannel>, Arc<TcpChannel>) {
    let (server_cfg, client_cfg) = certified();
    let tcp_listener = Arc::new(TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap());
    let addr = tcp_listener.local_addr();
    let tls_listener = TlsListener::new(tcp_listener, server_cfg);

    let accept_controller = Arc::new(Controller::new());
    let accept_op = AcceptOperation::new();
    accept_op.base().bind(&accept_controller);
    tls_listener.accept_async(&accept_op).unwrap();

    let plain = Arc::new(TcpChannel::connect(addr).unwrap());
    let client = TlsChannel::client(
        Arc::clone(&plain) as Arc<dyn ByteChannel>,
        &client_cfg,
        "localhost",
    )
    .unwrap();
    let controller = Arc::new(Controller::new());
    client.connect(&controller).unwrap();

    assert!(
        accept_controller.wait_for(accept_op.base(), Some(Duration::from_secs(5))),
        "服务端握手应在客户端握手完成后很快了结"
    );
    assert!(accept_op.base().take_failure().is_none());
    let server = accept_op.take_accepted().expect("接受应交付可用通道");
    (client, server, plain)
}

fn receive_exact(
    channel: &Arc<dyn ByteChannel>,
    controller: &Arc<Controller>,
    total: usize,
) -> Vec<u8> {
    let mut collected = Vec::new();
    while collected.len() < total {
        let chunk = channel.receive(controller, 4096).unwrap();
        assert!(!chunk.is_empty(), "对端不应提前关闭");
        collected.extend_from_slice(&chunk);
    }
    collected
}

/// 握手后双向收发：密文在线缆上、明文在两端。
#[test]
fn handshake_then_ping_pong() {
    let (client, server, _plain) = secure_pair();
    let controller = Arc::new(Controller::new());

    let sent = client.send(&controller, b"ping").unwrap();
    assert_eq!(sent, 4, "发送成功应报告全部明文字节");
    assert_eq!(receive_exact(&server, &controller, 4), b"ping");

    server.send(&controller, b"pong").unwrap();
    let client_dyn: Arc<dyn ByteChannel> = client;
    assert_eq!(receive_exact(&client_dyn, &controller, 4), b"pong");
}

/// 同方向多个异步发送按提交顺序完成，明文保序到达对端。
#[test]
fn pipelined_sends_complete_in_order() {
    let (client, server, _plain) = secure_pair();
    let controller = Arc::new(Controller::new());

    let ops: Vec<_> = [&b"one"[..], &b"two"[..], &b"three"[..]]
        .iter()
        .map(|chunk| {
            let op = TransferOperation::for_send(Bytes::copy_from_slice(chunk));
            op.base().bind(&controller);
            client.send_async(&op).unwrap();
            op
        })
        .collect();

    for op in &ops {
        let id = controller.wait_next(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(id, op.base().id(), "完成必须按提交顺序到达");
        assert!(op.base().take_failure().is_none());
        assert_eq!(op.transferred(), op.capacity());
    }

    assert_eq!(receive_exact(&server, &controller, 11), b"onetwothree");
}

/// 排队中（非队首）动作的取消不伤害会话：队首接收照常完成。
#[test]
fn cancelling_queued_send_keeps_session_usable() {
    let (client, server, _plain) = secure_pair();
    let controller = Arc::new(Controller::new());

    // 队首：一个暂时无法满足的接收。
    let receive_op = TransferOperation::for_receive(64);
    receive_op.base().bind(&controller);
    let client_dyn: Arc<dyn ByteChannel> = Arc::clone(&client) as Arc<dyn ByteChannel>;
    client_dyn.receive_async(&receive_op).unwrap();

    // 排队一个发送，然后在它启动前取消。
    let send_op = TransferOperation::for_send(Bytes::from_static(b"never"));
    send_op.base().bind(&controller);
    client_dyn.send_async(&send_op).unwrap();
    client_dyn.cancel(&send_op);

    // 对端来料后，队首接收正常完成；被取消的发送绝不出现。
    server.send(&controller, b"pong").unwrap();
    assert!(
        controller.wait_for(receive_op.base(), Some(Duration::from_secs(5))),
        "队首接收应不受排队取消影响"
    );
    assert!(receive_op.base().take_failure().is_none());
    assert_eq!(&receive_op.payload()[..], b"pong");
    assert!(
        controller.wait_next(Some(Duration::from_millis(100))).is_none(),
        "被取消的发送不应留下完成记录"
    );
}

/// TLS 之下的链路断裂：在途接收以会话关闭错误了结，后续动作速断。
#[test]
fn transport_close_fails_pending_and_subsequent_actions() {
    let (_client, server, plain) = secure_pair();
    let controller = Arc::new(Controller::new());

    // 客户端明文把手直接断开：没有 close_notify，不算优雅关闭。
    plain.close();

    let err = server.receive(&controller, 64).unwrap_err();
    assert_eq!(err.code(), codes::TLS_CLOSED);

    // 终态速断：后续动作立即以同样的错误失败。
    let err = server.send(&controller, b"late").unwrap_err();
    assert_eq!(err.code(), codes::TLS_CLOSED);
}

/// 安全通道可以层叠：外层会话跑在另一条安全通道之上。
///
/// 层叠时内层的完成通知会同步驱动外层状态机、外层又立刻向内层
/// 提交新的子操作；两层各持自己的实例锁，任何一层在持锁区间里
/// 回调另一层都会互锁。限时等待兜底：互锁表现为测试超时失败，
/// 而不是无限挂起。
#[test]
fn nested_tls_over_tls_round_trips() {
    let (inner_client, inner_server, _plain) = secure_pair();
    let (server_cfg, client_cfg) = certified();

    let (done_tx, done_rx) = mpsc::channel();
    let server_thread = thread::spawn({
        let done_tx = done_tx.clone();
        move || {
            let controller = Arc::new(Controller::new());
            let outer = TlsChannel::server(inner_server, &server_cfg).unwrap();
            outer.accept(&controller).unwrap();
            let outer: Arc<dyn ByteChannel> = outer;
            assert_eq!(receive_exact(&outer, &controller, 4), b"ping");
            outer.send(&controller, b"pong").unwrap();
            done_tx.send(()).unwrap();
        }
    });
    let client_thread = thread::spawn(move || {
        let controller = Arc::new(Controller::new());
        let outer = TlsChannel::client(
            Arc::clone(&inner_client) as Arc<dyn ByteChannel>,
            &client_cfg,
            "localhost",
        )
        .unwrap();
        outer.connect(&controller).unwrap();
        let outer: Arc<dyn ByteChannel> = outer;
        outer.send(&controller, b"ping").unwrap();
        assert_eq!(receive_exact(&outer, &controller, 4), b"pong");
        done_tx.send(()).unwrap();
    });

    for _ in 0..2 {
        assert!(
            done_rx.recv_timeout(Duration::from_secs(10)).is_ok(),
            "层叠会话的握手或收发不应互锁"
        );
    }
    server_thread.join().unwrap();
    client_thread.join().unwrap();
}

/// 单个连接握手失败不打扰等待方：监听器透明重试，下一个连接照常交付。
#[test]
fn failed_handshake_is_retried_transparently() {
    let (server_cfg, client_cfg) = certified();
    // 另一套自签证书：客户端信任锚对不上，握手注定失败。
    let (_, stranger_cfg) = certified();

    let tcp_listener = Arc::new(TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap());
    let addr = tcp_listener.local_addr();
    let tls_listener = TlsListener::new(tcp_listener, server_cfg);

    let accept_controller = Arc::new(Controller::new());
    let accept_op = AcceptOperation::new();
    accept_op.base().bind(&accept_controller);
    tls_listener.accept_async(&accept_op).unwrap();

    // 坏客户端：证书校验失败，自己拿到握手错误。
    let bad_plain = Arc::new(TcpChannel::connect(addr).unwrap());
    let bad_client = TlsChannel::client(
        Arc::clone(&bad_plain) as Arc<dyn ByteChannel>,
        &stranger_cfg,
        "localhost",
    )
    .unwrap();
    let controller = Arc::new(Controller::new());
    let err = bad_client.connect(&controller).unwrap_err();
    assert_eq!(err.code(), codes::TLS_HANDSHAKE);
    // 断开坏连接，让服务端的半截握手尽快出错并重新武装。
    drop(bad_client);
    bad_plain.close();

    // 好客户端随后到达，原始接受操作交付的是它。
    let good_plain = Arc::new(TcpChannel::connect(addr).unwrap());
    let good_client = TlsChannel::client(
        Arc::clone(&good_plain) as Arc<dyn ByteChannel>,
        &client_cfg,
        "localhost",
    )
    .unwrap();
    good_client.connect(&controller).unwrap();

    assert!(
        accept_controller.wait_for(accept_op.base(), Some(Duration::from_secs(5))),
        "重试后的接受应随好客户端完成"
    );
    assert!(accept_op.base().take_failure().is_none());
    let server = accept_op.take_accepted().unwrap();

    good_client.send(&controller, b"hello").unwrap();
    assert_eq!(receive_exact(&server, &controller, 5), b"hello");
}
