use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::{Arc, mpsc};
use std::thread;

use bytes::Bytes;
use parking_lot::Mutex;

use keel_core::{
    error::CoreError,
    transport::{ByteChannel, TransferDirection, TransferOperation, ensure_direction},
};

use crate::{
    error::{OperationKind, map_io_error, worker_gone},
    util::{CANCELLATION_POLL_INTERVAL, is_poll_timeout},
};

/// 阻塞 `std::net::TcpStream` 之上的完成式字节流通道。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 为调度核心提供 [`ByteChannel`] 的最小真实现：异步提交由方向专属的
///   工作线程消化，完成经由 Operation 的通知路径交付；
/// - 发送与接收各一条惰性工作线程：两个方向互不阻塞，同一方向上的操作
///   天然按提交顺序串行完成（FIFO）。
///
/// ## 逻辑（How）
/// - 套接字设置了读/写超时 = 轮询间隔，工作线程在每次系统调用间隙检查
///   操作的取消标志——这是本仓库统一的轮询式取消策略；
/// - 单趟语义：每个操作执行一次 `read`/`write`，部分传输如实上报；
/// - 完成在工作线程上以直达模式触发，让安全传输适配层得以同步接管。
///
/// ## 契约（What）
/// - `send_async`/`receive_async` 非阻塞；方向不符立即报错；
/// - 写出 `Ok(0)`（缓冲非空）与读到 `Ok(0)` 分别表示链路断裂与对端关闭，
///   由上层按语义映射，本层只如实记录字节数；
/// - 取消后的操作被工作线程静默丢弃，绝不通知。
pub struct TcpChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    stream: TcpStream,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    send_queue: Mutex<Option<mpsc::Sender<Arc<TransferOperation>>>>,
    receive_queue: Mutex<Option<mpsc::Sender<Arc<TransferOperation>>>>,
}

impl TcpChannel {
    /// 建立到 `addr` 的连接。
    pub fn connect(addr: SocketAddr) -> Result<Self, CoreError> {
        let stream =
            TcpStream::connect(addr).map_err(|err| map_io_error(OperationKind::Send, err))?;
        Self::from_stream(stream)
    }

    /// 把已建立的流包装为通道；监听器的接受路径也走这里。
    pub(crate) fn from_stream(stream: TcpStream) -> Result<Self, CoreError> {
        stream
            .set_read_timeout(Some(CANCELLATION_POLL_INTERVAL))
            .and_then(|()| stream.set_write_timeout(Some(CANCELLATION_POLL_INTERVAL)))
            .and_then(|()| stream.set_nodelay(true))
            .map_err(|err| map_io_error(OperationKind::Send, err))?;
        let local_addr = stream
            .local_addr()
            .map_err(|err| map_io_error(OperationKind::Send, err))?;
        let peer_addr = stream
            .peer_addr()
            .map_err(|err| map_io_error(OperationKind::Send, err))?;
        Ok(Self {
            inner: Arc::new(ChannelInner {
                stream,
                local_addr,
                peer_addr,
                send_queue: Mutex::new(None),
                receive_queue: Mutex::new(None),
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    /// 双向关闭底层连接；在途操作将以链路断裂完成。
    pub fn close(&self) {
        let _ = self.inner.stream.shutdown(Shutdown::Both);
    }

    fn queue_for(&self, direction: TransferDirection) -> Result<mpsc::Sender<Arc<TransferOperation>>, CoreError> {
        let slot = match direction {
            TransferDirection::Send => &self.inner.send_queue,
            TransferDirection::Receive => &self.inner.receive_queue,
        };
        let mut guard = slot.lock();
        if guard.is_none() {
            let (tx, rx) = mpsc::channel::<Arc<TransferOperation>>();
            let stream = self
                .inner
                .stream
                .try_clone()
                .map_err(|err| map_io_error(kind_of(direction), err))?;
            let name = match direction {
                TransferDirection::Send => "keel-tcp-send",
                TransferDirection::Receive => "keel-tcp-recv",
            };
            thread::Builder::new()
                .name(name.to_string())
                .spawn(move || match direction {
                    TransferDirection::Send => run_send_worker(rx, stream),
                    TransferDirection::Receive => run_receive_worker(rx, stream),
                })
                .map_err(|err| map_io_error(kind_of(direction), err))?;
            *guard = Some(tx);
        }
        Ok(guard.as_ref().expect("queue just installed").clone())
    }
}

fn kind_of(direction: TransferDirection) -> OperationKind {
    match direction {
        TransferDirection::Send => OperationKind::Send,
        TransferDirection::Receive => OperationKind::Receive,
    }
}

impl ByteChannel for TcpChannel {
    fn send_async(&self, op: &Arc<TransferOperation>) -> Result<(), CoreError> {
        ensure_direction(op, TransferDirection::Send)?;
        let queue = self.queue_for(TransferDirection::Send)?;
        op.base().submit()?;
        queue
            .send(Arc::clone(op))
            .map_err(|_| worker_gone(OperationKind::Send))
    }

    fn receive_async(&self, op: &Arc<TransferOperation>) -> Result<(), CoreError> {
        ensure_direction(op, TransferDirection::Receive)?;
        let queue = self.queue_for(TransferDirection::Receive)?;
        op.base().submit()?;
        queue
            .send(Arc::clone(op))
            .map_err(|_| worker_gone(OperationKind::Receive))
    }

    fn cancel(&self, op: &Arc<TransferOperation>) {
        if op.base().mark_cancelled() {
            if let Some(controller) = op.base().dispatcher() {
                controller.revert_post(op.base().id());
            }
        }
    }
}

/// 发送工作线程：单趟写出，轮询间隙响应取消。
fn run_send_worker(queue: mpsc::Receiver<Arc<TransferOperation>>, mut stream: TcpStream) {
    while let Ok(op) = queue.recv() {
        if op.base().is_cancelled() {
            continue;
        }
        let data = op.payload();
        loop {
            if op.base().is_cancelled() {
                break;
            }
            match stream.write(&data) {
                Ok(written) => {
                    op.record_transferred(written);
                    op.base().complete_direct();
                    break;
                }
                Err(err) if is_poll_timeout(&err) => continue,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    tracing::debug!(error = %err, "tcp send failed");
                    op.base().fail_direct(map_io_error(OperationKind::Send, err));
                    break;
                }
            }
        }
    }
}

/// 接收工作线程：单趟读入，0 字节如实上报（对端关闭）。
fn run_receive_worker(queue: mpsc::Receiver<Arc<TransferOperation>>, mut stream: TcpStream) {
    while let Ok(op) = queue.recv() {
        if op.base().is_cancelled() {
            continue;
        }
        let mut buf = vec![0u8; op.capacity().max(1)];
        loop {
            if op.base().is_cancelled() {
                break;
            }
            match stream.read(&mut buf) {
                Ok(read) => {
                    op.store_received(Bytes::copy_from_slice(&buf[..read]));
                    op.base().complete_direct();
                    break;
                }
                Err(err) if is_poll_timeout(&err) => continue,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    tracing::debug!(error = %err, "tcp receive failed");
                    op.base().fail_direct(map_io_error(OperationKind::Receive, err));
                    break;
                }
            }
        }
    }
}
