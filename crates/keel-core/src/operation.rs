use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use parking_lot::Mutex;

use crate::{
    controller::Controller,
    error::{CoreError, ErrorCategory, codes},
    notifier::{Notifier, queued_notify},
};

/// 进程内唯一的操作标识。
///
/// # 意图（Why）
/// - 完成队列与各类等待者注册表都以该标识作为键，从不持有指向调用方内存的裸指针；
///   调用方销毁 Operation 后，注册表里残留的标识最多指向一条失效的 `Weak`，
///   清理退化为安全的空操作。
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct OperationId(u64);

impl OperationId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// 原始数值，仅用于日志。
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// 一次待决异步动作的身份令牌，由发起方持有所有权（通常包在 `Arc` 中）。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - Operation 是调度核心的“完成货币”：中断后端与安全传输适配层都只通过它
///   与 [`Controller`] 交换完成事件，彼此之间没有其他耦合；
/// - 派发器与通知器在提交前都是可选的，允许适配层先构造再装配。
///
/// ## 契约（What）
/// - **提交约束**：同一 Operation 在未完成（pending）期间不得再次提交，
///   无论目标是同一个还是另一个 Controller，违反返回 `dispatch.resubmitted`；
/// - **完成约束**：完成通知恰好一次；取消是幂等的，且被取消的操作绝不会被通知；
/// - **失败槽**：适配层把同步故障记录在这里，由同步入口在等待返回后取走。
///
/// ## 逻辑（How）
/// - `pending`/`notified`/`cancelled` 三个原子标志实现上述约束；
/// - `submit` 会重置完成与取消状态，使操作可以在一次交付后重新武装；
/// - 完成路径优先走定制 [`Notifier`]，否则默认把标识投递到派发器的完成队列。
pub struct Operation {
    id: OperationId,
    dispatcher: Mutex<Option<Arc<Controller>>>,
    notifier: Mutex<Option<Arc<dyn Notifier>>>,
    pending: AtomicBool,
    cancelled: AtomicBool,
    notified: AtomicBool,
    failure: Mutex<Option<CoreError>>,
}

impl Operation {
    pub fn new() -> Self {
        Self {
            id: OperationId::next(),
            dispatcher: Mutex::new(None),
            notifier: Mutex::new(None),
            pending: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            notified: AtomicBool::new(false),
            failure: Mutex::new(None),
        }
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    /// 绑定负责完成本操作的派发器。后绑定覆盖先绑定，但不得在 pending 期间更换。
    pub fn bind(&self, controller: &Arc<Controller>) {
        *self.dispatcher.lock() = Some(Arc::clone(controller));
    }

    pub fn dispatcher(&self) -> Option<Arc<Controller>> {
        self.dispatcher.lock().clone()
    }

    /// 安装定制通知器；适配层用它把内部子操作的完成串回自己的状态机。
    pub fn set_notifier(&self, notifier: Arc<dyn Notifier>) {
        *self.notifier.lock() = Some(notifier);
    }

    /// 把操作标记为已提交（武装）。
    ///
    /// # 契约说明
    /// - **前置条件**：操作当前不处于 pending 状态；
    /// - **后置条件**：完成/取消/失败状态全部复位，操作可等待新一轮交付；
    /// - **错误**：重复提交返回 `dispatch.resubmitted`（`Internal` 类）。
    pub fn submit(&self) -> Result<(), CoreError> {
        if self.pending.swap(true, Ordering::AcqRel) {
            return Err(CoreError::new(
                codes::DISPATCH_RESUBMITTED,
                ErrorCategory::Internal,
                "operation is already pending",
            ));
        }
        self.cancelled.store(false, Ordering::Release);
        self.notified.store(false, Ordering::Release);
        self.failure.lock().take();
        Ok(())
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// 幂等地标记取消；返回是否由本次调用完成了状态翻转。
    pub fn mark_cancelled(&self) -> bool {
        let first = !self.cancelled.swap(true, Ordering::AcqRel);
        if first {
            self.pending.store(false, Ordering::Release);
        }
        first
    }

    /// 记录失败负载；随后仍需通过 `complete`/`complete_direct` 触发通知。
    pub fn record_failure(&self, error: CoreError) {
        *self.failure.lock() = Some(error);
    }

    /// 取走失败负载；同步入口在等待返回后调用。
    pub fn take_failure(&self) -> Option<CoreError> {
        self.failure.lock().take()
    }

    /// 以“排队”模式完成：可从任意线程调用，默认经由派发器的等待循环交付。
    pub fn complete(&self) {
        if let Some(notifier) = self.finish() {
            match notifier {
                Some(custom) => custom.notify(self),
                None => queued_notify(self),
            }
        }
    }

    /// 以“直达”模式完成：仅允许由驱动本操作完成的线程调用，
    /// 用于适配层在返回前同步串联内部子操作。
    pub fn complete_direct(&self) {
        if let Some(notifier) = self.finish() {
            match notifier {
                Some(custom) => custom.notify_direct(self),
                None => queued_notify(self),
            }
        }
    }

    /// 记录失败并以排队模式完成。
    pub fn fail(&self, error: CoreError) {
        self.record_failure(error);
        self.complete();
    }

    /// 记录失败并以直达模式完成。
    pub fn fail_direct(&self, error: CoreError) {
        self.record_failure(error);
        self.complete_direct();
    }

    /// 收尾公共段：清除 pending，筛除取消与重复通知，返回要使用的通知器。
    fn finish(&self) -> Option<Option<Arc<dyn Notifier>>> {
        self.pending.store(false, Ordering::Release);
        if self.cancelled.load(Ordering::Acquire) {
            return None;
        }
        if self.notified.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(self.notifier.lock().clone())
    }
}

impl Default for Operation {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id.raw())
            .field("pending", &self.is_pending())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
