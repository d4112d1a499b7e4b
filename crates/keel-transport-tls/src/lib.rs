#![doc = r#"
# keel-transport-tls

## 设计动机（Why）
- **定位**：把同步加密引擎（rustls）架在任意完成式字节流通道之上的
  安全传输适配层；对调用方呈现的仍是 [`keel_core::transport::ByteChannel`]，
  加密对上层完全透明。
- **内存桥**：引擎自带的入站/出站密文缓冲即桥的两端——状态机决定何时
  排空出站缓冲（对端发送子操作）、何时补充入站缓冲（对端接收子操作）。

## 分层（How）
- [`machine`]（私有）：纯状态机，动作 FIFO + 引擎对话，可脱离 I/O 单测；
- [`channel`]：把状态机副作用落到真实对端通道与用户操作上；
- [`listener`]：明文接受 + 服务端握手折叠为一次安全接受，握手失败透明重试。

## 核心契约（What）
- 发送成功返回意味着对应密文已写向对端通道；
- 同一时刻至多一个对端子操作在途，密文在线缆上严格保序；
- 取消在途动作令会话进入失败终态——在途密文无法收回，半截会话不可续用。
"#]

mod channel;
mod config;
mod engine;
mod error;
mod listener;
mod machine;

pub use channel::TlsChannel;
pub use config::{TlsClientConfig, TlsServerConfig};
pub use error::codes;
pub use listener::TlsListener;
