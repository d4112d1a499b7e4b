#![cfg_attr(not(windows), deny(unsafe_code))]
#![doc = r#"
# keel-core

## 设计动机（Why）
- **定位**：keel 是一个完成式（completion-based）异步 I/O 核心：调用方提交
  [`operation::Operation`]，在 [`controller::Controller`] 上阻塞等待完成，
  适配层通过 [`notifier::Notifier`] 在完成点串联自己的逻辑。
- **调度模型**：并行 OS 线程，没有协作式调度器；同步入口阻塞在派发器的
  条件变量上，异步入口在锁内改完共享状态立即返回。
- **架构角色**：本 crate 只承载三件有真实并发复杂度的东西——调度契约、
  跨平台外部中断源、传输协作方接口；网络字节流与 TLS 适配分别由
  `keel-transport-tcp` 与 `keel-transport-tls` 实现。

## 核心契约（What）
- **恰好一次**：完成通知恰好一次；取消幂等且绝不通知被取消者；
- **不可重入**：Operation 在 pending 期间不得重复提交；
- **账目可回滚**：`revert_post` 对已消费记录是空操作，取消与在途完成的
  竞争因此总是安全；
- **所有权纪律**：注册表与队列只按 [`operation::OperationId`] 与 `Weak`
  引用调用方拥有的操作，绝不保存生命周期不受控的裸指针。

## 锁序约定（How）
- 每个适配器实例一把互斥锁，协议逻辑没有全局锁；
- 允许“实例锁 → Controller 锁”的顺序，禁止反向持有；可能回调用户代码的
  副作用先在实例锁内收集，释放后再执行。

## 风险与考量（Trade-offs）
- 中断交付是“无人等待即丢弃”的弱保证模型（详见 [`interrupt`] 模块文档），
  刻意不升级为排队交付；
- Windows 控制台后端需要少量 unsafe FFI，故 unsafe 禁令仅覆盖非 Windows 目标。
"#]

pub mod controller;
pub mod error;
pub mod interrupt;
pub mod notifier;
pub mod operation;
pub mod prelude;
pub mod transport;
