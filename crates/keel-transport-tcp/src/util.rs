use std::io;
use std::time::Duration;

/// 阻塞系统调用的轮询间隔：工作线程以该粒度检查取消标志。
///
/// 取消响应因此存在毫秒级延迟，换取无需向信号或事件对象求助的
/// 简单实现；需要更快响应的调用方可直接关闭通道。
pub(crate) const CANCELLATION_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// 判定一次 I/O 错误是否只是轮询超时（应继续重试而非上报）。
pub(crate) fn is_poll_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}
