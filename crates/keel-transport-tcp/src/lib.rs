#![doc = r#"
# keel-transport-tcp

## 设计动机（Why）
- **定位**：keel 调度契约的明文传输实现，封装监听、建连与单趟读写；
  既直接服务调用方，也是 `keel-transport-tls` 适配层脚下的对端通道。
- **执行框架**：阻塞 `std::net` 套接字 + 方向专属的工作线程，没有任何
  协作式运行时；完成沿 Operation 的通知路径交回派发器或适配层。

## 核心契约（What）
- 单趟语义：一个操作对应一次系统调用级别的进展，部分传输如实上报；
- 同方向 FIFO：同一通道同一方向上的操作按提交顺序完成；
- 取消：轮询式，毫秒级延迟；被取消的操作被静默丢弃、账目被回滚。

## 风险与考量（Trade-offs）
- 读/写超时即轮询间隔，空闲连接上的阻塞操作会以该频率空转一次系统调用；
- 工作线程随首次异步操作惰性启动，随通道销毁（发送端关闭）退出。
"#]

mod channel;
mod error;
mod listener;
mod util;

pub use channel::TcpChannel;
pub use listener::TcpListener;
