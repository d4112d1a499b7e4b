//! 外部中断子系统：把进程终止类事件（Break/Hangup/Terminate）翻译成
//! [`InterruptOperation`] 的完成。
//!
//! # 教案级导览
//!
//! ## 意图（Why）
//! - 三种后端（进程内、POSIX 信号、Win32 控制台事件）是同一能力集的不同实现，
//!   以 `cfg` 选择的具体类型 + 共享的 [`InterruptSource`] 契约建模，而不是
//!   深继承层次；
//! - 信号处理遵循两段式设计：异步信号安全的生产者（写一字节 / 置原子标志）
//!   与普通上下文的消费者线程，处理函数内部绝不分配、绝不加锁。
//!
//! ## 契约（What）
//! - 交付语义是“无人等待即丢弃”：事件不排队，稍后注册的等待者看不到历史事件；
//! - 广播：同一事件满足所有请求集相交的等待者，各通知恰好一次；
//! - 弱保证：等待者在重新武装前，密集连发的多次中断可能合并为一次交付，
//!   这是文档化行为而非缺陷，调用方不得依赖逐次计数。
//!
//! ## 注意事项（Trade-offs）
//! - 首次等待某一 Kind 才安装对应 OS 钩子（并接管该 Kind 的默认处理）；
//!   安装失败是 `Resource` 类致命错误，不重试。

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;

use crate::{
    controller::Controller,
    error::{CoreError, ErrorCategory, codes},
    operation::Operation,
};

mod internal;
mod registry;

#[cfg(unix)]
mod posix;
#[cfg(windows)]
mod win32;

pub use internal::InternalInterrupt;
#[cfg(unix)]
pub use posix::PosixInterrupt;
#[cfg(windows)]
pub use win32::ConsoleInterrupt;

pub(crate) use registry::WaiterRegistry;

/// 外部中断的枚举类别。
///
/// OS 映射：`Break` = SIGINT / CTRL_C+CTRL_BREAK；`Hangup` = SIGHUP /
/// CTRL_LOGOFF+CTRL_SHUTDOWN；`Terminate` = SIGTERM / CTRL_CLOSE。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum InterruptKind {
    Break,
    Hangup,
    Terminate,
}

impl InterruptKind {
    pub const ALL: [InterruptKind; 3] = [
        InterruptKind::Break,
        InterruptKind::Hangup,
        InterruptKind::Terminate,
    ];

    fn bit(self) -> u8 {
        match self {
            InterruptKind::Break => 0b001,
            InterruptKind::Hangup => 0b010,
            InterruptKind::Terminate => 0b100,
        }
    }
}

/// 中断类别的小位集；`requested ∩ received` 运算的载体。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct InterruptKindSet(u8);

impl InterruptKindSet {
    pub const EMPTY: InterruptKindSet = InterruptKindSet(0);

    pub fn all() -> Self {
        InterruptKind::ALL.iter().copied().collect()
    }

    pub fn insert(&mut self, kind: InterruptKind) {
        self.0 |= kind.bit();
    }

    pub fn contains(self, kind: InterruptKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn intersection(self, other: InterruptKindSet) -> InterruptKindSet {
        InterruptKindSet(self.0 & other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn kinds(self) -> impl Iterator<Item = InterruptKind> {
        InterruptKind::ALL
            .into_iter()
            .filter(move |kind| self.contains(*kind))
    }
}

impl From<InterruptKind> for InterruptKindSet {
    fn from(kind: InterruptKind) -> Self {
        InterruptKindSet(kind.bit())
    }
}

impl FromIterator<InterruptKind> for InterruptKindSet {
    fn from_iter<I: IntoIterator<Item = InterruptKind>>(iter: I) -> Self {
        let mut set = InterruptKindSet::EMPTY;
        for kind in iter {
            set.insert(kind);
        }
        set
    }
}

/// 等待外部中断的操作：在 [`Operation`] 之上携带请求集与接收集。
///
/// # 契约说明（What）
/// - `requested` 在构造时固定且非空；
/// - `received` 每次交付被**覆盖**而非合并，恒满足 `received ⊆ requested`；
/// - 超时路径下接收集为空。
pub struct InterruptOperation {
    base: Operation,
    requested: InterruptKindSet,
    received: Mutex<InterruptKindSet>,
}

impl InterruptOperation {
    /// 默认构造：请求全部三种类别。
    pub fn new() -> Arc<Self> {
        Self::with_kinds(InterruptKindSet::all()).expect("full kind set is never empty")
    }

    /// 单类别构造。
    pub fn single(kind: InterruptKind) -> Arc<Self> {
        Self::with_kinds(kind.into()).expect("single kind set is never empty")
    }

    /// 类别集构造；空集返回 `interrupt.empty_request`。
    pub fn with_kinds(kinds: InterruptKindSet) -> Result<Arc<Self>, CoreError> {
        if kinds.is_empty() {
            return Err(CoreError::new(
                codes::INTERRUPT_EMPTY_REQUEST,
                ErrorCategory::Internal,
                "interrupt operation requires a non-empty kind set",
            ));
        }
        Ok(Arc::new(Self {
            base: Operation::new(),
            requested: kinds,
            received: Mutex::new(InterruptKindSet::EMPTY),
        }))
    }

    pub fn base(&self) -> &Operation {
        &self.base
    }

    pub fn requested(&self) -> InterruptKindSet {
        self.requested
    }

    pub fn received(&self) -> InterruptKindSet {
        *self.received.lock()
    }

    /// 覆盖接收集；仅供后端交付路径使用。
    pub(crate) fn store_received(&self, kinds: InterruptKindSet) {
        *self.received.lock() = kinds;
    }
}

impl std::fmt::Debug for InterruptOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptOperation")
            .field("id", &self.base.id().raw())
            .field("requested", &self.requested)
            .field("received", &self.received())
            .finish()
    }
}

/// 中断后端的能力集。
///
/// # 契约说明（What）
/// - `wait_async`：登记等待者并（若需要）安装 OS 钩子，立即返回；
/// - `cancel`：幂等；移除等待者、回滚 Controller 账目，绝不通知被取消者；
/// - `wait`：同步便捷入口 = `wait_async` + Controller 限时等待 + 超时取消，
///   超时返回空集而非错误。
pub trait InterruptSource: Send + Sync {
    fn wait_async(&self, op: &Arc<InterruptOperation>) -> Result<(), CoreError>;

    fn cancel(&self, op: &Arc<InterruptOperation>);

    fn wait(
        &self,
        controller: &Arc<Controller>,
        kinds: InterruptKindSet,
        timeout: Option<Duration>,
    ) -> Result<InterruptKindSet, CoreError> {
        let op = InterruptOperation::with_kinds(kinds)?;
        op.base().bind(controller);
        self.wait_async(&op)?;
        if controller.wait_for(op.base(), timeout) {
            Ok(op.received())
        } else {
            self.cancel(&op);
            Ok(InterruptKindSet::EMPTY)
        }
    }
}

/// 当前平台的原生中断后端。
#[cfg(unix)]
pub type NativeInterrupt = PosixInterrupt;
/// 当前平台的原生中断后端。
#[cfg(windows)]
pub type NativeInterrupt = ConsoleInterrupt;

/// 进程级默认后端：首次访问时创建，无拆卸顺序要求。
///
/// 需要显式生命周期管理的组件应改为依赖注入自己的实例。
#[cfg(any(unix, windows))]
pub fn native() -> &'static NativeInterrupt {
    static NATIVE: OnceLock<NativeInterrupt> = OnceLock::new();
    NATIVE.get_or_init(NativeInterrupt::new)
}
