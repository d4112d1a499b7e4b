use std::net::SocketAddr;
use std::sync::{Arc, mpsc};
use std::thread;

use parking_lot::Mutex;
use socket2::{Domain, Socket, Type};

use keel_core::{
    error::CoreError,
    transport::{AcceptOperation, ByteChannel, ByteListener},
};

use crate::{
    TcpChannel,
    error::{OperationKind, map_io_error, worker_gone},
    util::CANCELLATION_POLL_INTERVAL,
};

/// 完成式 TCP 监听器。
///
/// # 契约说明（What）
/// - `bind`：开启地址重用后绑定并进入监听；
/// - `accept_async`：把接受请求排入监听工作线程，连接到达后以
///   [`TcpChannel`] 形式存入操作并直达通知；
/// - 取消遵循与通道相同的轮询策略与静默丢弃语义。
pub struct TcpListener {
    inner: Arc<ListenerInner>,
}

struct ListenerInner {
    listener: std::net::TcpListener,
    local_addr: SocketAddr,
    queue: Mutex<Option<mpsc::Sender<Arc<AcceptOperation>>>>,
}

impl TcpListener {
    /// 绑定到指定地址；`port = 0` 时由 OS 分配端口，可经 `local_addr` 读回。
    pub fn bind(addr: SocketAddr) -> Result<Self, CoreError> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)
            .map_err(|err| map_io_error(OperationKind::Bind, err))?;
        socket
            .set_reuse_address(true)
            .and_then(|()| socket.bind(&addr.into()))
            .and_then(|()| socket.listen(128))
            .map_err(|err| map_io_error(OperationKind::Bind, err))?;
        let listener: std::net::TcpListener = socket.into();
        listener
            .set_nonblocking(true)
            .map_err(|err| map_io_error(OperationKind::Bind, err))?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| map_io_error(OperationKind::Bind, err))?;
        Ok(Self {
            inner: Arc::new(ListenerInner {
                listener,
                local_addr,
                queue: Mutex::new(None),
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    fn queue(&self) -> Result<mpsc::Sender<Arc<AcceptOperation>>, CoreError> {
        let mut guard = self.inner.queue.lock();
        if guard.is_none() {
            let (tx, rx) = mpsc::channel::<Arc<AcceptOperation>>();
            let listener = self
                .inner
                .listener
                .try_clone()
                .map_err(|err| map_io_error(OperationKind::Accept, err))?;
            thread::Builder::new()
                .name("keel-tcp-accept".to_string())
                .spawn(move || run_accept_worker(rx, listener))
                .map_err(|err| map_io_error(OperationKind::Accept, err))?;
            *guard = Some(tx);
        }
        Ok(guard.as_ref().expect("queue just installed").clone())
    }
}

impl ByteListener for TcpListener {
    fn accept_async(&self, op: &Arc<AcceptOperation>) -> Result<(), CoreError> {
        let queue = self.queue()?;
        op.base().submit()?;
        queue
            .send(Arc::clone(op))
            .map_err(|_| worker_gone(OperationKind::Accept))
    }

    fn cancel(&self, op: &Arc<AcceptOperation>) {
        if op.base().mark_cancelled() {
            if let Some(controller) = op.base().dispatcher() {
                controller.revert_post(op.base().id());
            }
        }
    }
}

/// 接受工作线程：非阻塞 accept + 轮询间隔休眠，间隙检查取消。
fn run_accept_worker(queue: mpsc::Receiver<Arc<AcceptOperation>>, listener: std::net::TcpListener) {
    while let Ok(op) = queue.recv() {
        if op.base().is_cancelled() {
            continue;
        }
        loop {
            if op.base().is_cancelled() {
                break;
            }
            match listener.accept() {
                Ok((stream, peer)) => {
                    tracing::debug!(peer = %peer, "tcp connection accepted");
                    match TcpChannel::from_stream(stream) {
                        Ok(channel) => {
                            op.store_accepted(Arc::new(channel) as Arc<dyn ByteChannel>);
                            op.base().complete_direct();
                        }
                        Err(error) => op.base().fail_direct(error),
                    }
                    break;
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(CANCELLATION_POLL_INTERVAL);
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    tracing::debug!(error = %err, "tcp accept failed");
                    op.base().fail_direct(map_io_error(OperationKind::Accept, err));
                    break;
                }
            }
        }
    }
}
