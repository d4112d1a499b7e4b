use crate::operation::Operation;

/// 操作完成时被调用的能力接口。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把“完成了什么”与“完成后怎么办”解耦：默认路径把完成事件投递到
///   派发器的等待循环，适配层则注入定制实现，在内部子操作完成时同步
///   驱动自己的状态机。
///
/// ## 契约（What）
/// - `notify`：必须可从任意线程安全调用（排队模式）；
/// - `notify_direct`：只允许由正在驱动该操作完成的线程调用（直达模式），
///   不做跨线程搬运，默认退化为 `notify`；
/// - 实现不得假设操作仍处于 pending：调用点已经完成了恰好一次的筛选。
///
/// ## 注意事项（Trade-offs）
/// - 直达模式在完成线程上执行任意适配层逻辑，实现方需自行遵守锁序约定：
///   先取实例锁再取 Controller 锁，反向持锁会与排队路径形成环等待。
pub trait Notifier: Send + Sync {
    /// 排队通知；跨线程安全。
    fn notify(&self, op: &Operation);

    /// 直达通知；仅限完成驱动线程调用。
    fn notify_direct(&self, op: &Operation) {
        self.notify(op);
    }
}

/// 默认排队路径：把完成记录投递到操作绑定的派发器。
///
/// 未绑定派发器且未安装通知器的操作完成时无处可去，静默丢弃并留下日志，
/// 这通常意味着调用方忘记 `bind`。
pub(crate) fn queued_notify(op: &Operation) {
    match op.dispatcher() {
        Some(controller) => controller.post(op.id()),
        None => {
            tracing::debug!(
                operation = op.id().raw(),
                "completion dropped: operation has no dispatcher and no notifier"
            );
        }
    }
}
