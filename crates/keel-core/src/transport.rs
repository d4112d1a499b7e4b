//! 字节流传输的协作方契约：本 crate 不实现任何网络 I/O，只定义
//! 调度核心消费的接口形状与配套的操作类型。

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::{
    controller::Controller,
    error::{CoreError, ErrorCategory, codes},
    operation::Operation,
};

/// 传输操作的方向。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransferDirection {
    Send,
    Receive,
}

/// 一次单趟字节传输的操作：发送或接收各自携带负载槽与进度计数。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 负载放在操作内部而不是借用调用方切片：完成工作发生在传输实现的
///   工作线程上，所有权必须跨线程清晰；`Bytes` 的廉价克隆恰好胜任；
/// - 明文/密文两层共用同一操作类型，安全适配层内部的对端子操作与
///   用户可见操作因此是同一种“完成货币”。
///
/// ## 契约（What）
/// - **单趟语义**：一次操作对应一次系统调用级别的进展，部分传输如实上报
///   （`transferred < 请求量`），不在下层隐藏重试；
/// - 发送完成后 `transferred` 为写出字节数；接收完成后 `payload` 为收到的
///   字节（0 字节 = 对端关闭），`transferred` 与其长度一致。
pub struct TransferOperation {
    base: Operation,
    direction: TransferDirection,
    payload: Mutex<Bytes>,
    capacity: usize,
    transferred: AtomicUsize,
}

impl TransferOperation {
    /// 发送操作；`data` 为要写出的字节。
    pub fn for_send(data: impl Into<Bytes>) -> Arc<Self> {
        let data = data.into();
        let capacity = data.len();
        Arc::new(Self {
            base: Operation::new(),
            direction: TransferDirection::Send,
            payload: Mutex::new(data),
            capacity,
            transferred: AtomicUsize::new(0),
        })
    }

    /// 接收操作；最多读入 `capacity` 字节。
    pub fn for_receive(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            base: Operation::new(),
            direction: TransferDirection::Receive,
            payload: Mutex::new(Bytes::new()),
            capacity,
            transferred: AtomicUsize::new(0),
        })
    }

    pub fn base(&self) -> &Operation {
        &self.base
    }

    pub fn direction(&self) -> TransferDirection {
        self.direction
    }

    /// 发送负载 / 接收结果；`Bytes` 克隆为零拷贝。
    pub fn payload(&self) -> Bytes {
        self.payload.lock().clone()
    }

    /// 接收请求量（发送操作即负载长度）。
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn transferred(&self) -> usize {
        self.transferred.load(Ordering::Acquire)
    }

    /// 传输实现记录进度；随后仍需走 `Operation` 的完成路径。
    pub fn record_transferred(&self, bytes: usize) {
        self.transferred.store(bytes, Ordering::Release);
    }

    /// 传输实现存入接收结果并记录进度。
    pub fn store_received(&self, data: Bytes) {
        self.transferred.store(data.len(), Ordering::Release);
        *self.payload.lock() = data;
    }
}

/// 一次接受入站连接的操作；完成后携带新通道。
pub struct AcceptOperation {
    base: Operation,
    accepted: Mutex<Option<Arc<dyn ByteChannel>>>,
}

impl AcceptOperation {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            base: Operation::new(),
            accepted: Mutex::new(None),
        })
    }

    pub fn base(&self) -> &Operation {
        &self.base
    }

    /// 监听实现存入接受到的通道。
    pub fn store_accepted(&self, channel: Arc<dyn ByteChannel>) {
        *self.accepted.lock() = Some(channel);
    }

    /// 取走接受到的通道。
    pub fn take_accepted(&self) -> Option<Arc<dyn ByteChannel>> {
        self.accepted.lock().take()
    }
}

/// 双向字节流通道的能力集；明文 TCP 与加密 TLS 通道都实现它。
///
/// # 契约说明（What）
/// - `*_async` 非阻塞：校验方向、提交操作、登记工作后立即返回；
/// - `cancel` 幂等，绝不通知被取消的操作，并由实现回滚 Controller 账目；
/// - 阻塞便捷方法 = 异步提交 + Controller 无界等待 + 失败槽检查，
///   超时控制交由调用方在更高层组合。
pub trait ByteChannel: Send + Sync {
    fn send_async(&self, op: &Arc<TransferOperation>) -> Result<(), CoreError>;

    fn receive_async(&self, op: &Arc<TransferOperation>) -> Result<(), CoreError>;

    fn cancel(&self, op: &Arc<TransferOperation>);

    /// 阻塞发送一趟；返回实际写出的字节数。
    fn send(&self, controller: &Arc<Controller>, data: &[u8]) -> Result<usize, CoreError> {
        let op = TransferOperation::for_send(Bytes::copy_from_slice(data));
        op.base().bind(controller);
        self.send_async(&op)?;
        controller.wait_for(op.base(), None);
        match op.base().take_failure() {
            Some(error) => Err(error),
            None => Ok(op.transferred()),
        }
    }

    /// 阻塞接收一趟；返回收到的字节（空 = 对端关闭）。
    fn receive(&self, controller: &Arc<Controller>, capacity: usize) -> Result<Bytes, CoreError> {
        let op = TransferOperation::for_receive(capacity);
        op.base().bind(controller);
        self.receive_async(&op)?;
        controller.wait_for(op.base(), None);
        match op.base().take_failure() {
            Some(error) => Err(error),
            None => Ok(op.payload()),
        }
    }
}

/// 入站连接监听器的能力集。
pub trait ByteListener: Send + Sync {
    fn accept_async(&self, op: &Arc<AcceptOperation>) -> Result<(), CoreError>;

    fn cancel(&self, op: &Arc<AcceptOperation>);

    /// 阻塞接受一个连接。
    fn accept(&self, controller: &Arc<Controller>) -> Result<Arc<dyn ByteChannel>, CoreError> {
        let op = AcceptOperation::new();
        op.base().bind(controller);
        self.accept_async(&op)?;
        controller.wait_for(op.base(), None);
        if let Some(error) = op.base().take_failure() {
            return Err(error);
        }
        op.take_accepted().ok_or_else(|| {
            CoreError::new(
                codes::DISPATCH_UNBOUND,
                ErrorCategory::Internal,
                "accept completed without a channel",
            )
        })
    }
}

/// 校验操作方向的公共检查，供传输实现复用。
pub fn ensure_direction(
    op: &TransferOperation,
    expected: TransferDirection,
) -> Result<(), CoreError> {
    if op.direction() == expected {
        Ok(())
    } else {
        Err(CoreError::new(
            codes::TRANSFER_DIRECTION,
            ErrorCategory::Internal,
            "transfer operation direction mismatch",
        ))
    }
}

/// 被上层取消牵连的下层操作所携带的错误负载。
pub fn cancelled_error() -> CoreError {
    CoreError::new(
        codes::TRANSFER_CANCELLED,
        ErrorCategory::Cancelled,
        "operation cancelled by caller",
    )
}
