use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::operation::OperationId;

use super::{InterruptKindSet, InterruptOperation};

/// 三种后端共用的等待者注册表与交付算法。
///
/// # 意图（Why）
/// - 注册表只保存 `(标识, Weak)` 二元组，从不拥有调用方的操作：调用方先行
///   销毁操作后，交付与取消都退化为安全的空操作；
/// - 交付算法集中在一处，后端只负责把各自的 OS 事件翻译成 `deliver` 调用。
///
/// # 契约（What）
/// - `deliver(kinds)` 单趟扫描：请求集与 `kinds` 相交的等待者被移除、
///   接收集被覆盖为交集、恰好通知一次（排队模式）；不相交者原地保留；
/// - 无人命中时事件被丢弃，不产生任何滞留状态。
pub(crate) struct WaiterRegistry {
    waiters: Mutex<Vec<Waiter>>,
}

struct Waiter {
    id: OperationId,
    op: Weak<InterruptOperation>,
}

impl WaiterRegistry {
    pub(crate) fn new() -> Self {
        Self {
            waiters: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn register(&self, op: &Arc<InterruptOperation>) {
        self.waiters.lock().push(Waiter {
            id: op.base().id(),
            op: Arc::downgrade(op),
        });
    }

    /// 移除指定等待者；不存在时为空操作。
    pub(crate) fn remove(&self, id: OperationId) {
        self.waiters.lock().retain(|waiter| waiter.id != id);
    }

    /// 把一次已翻译到普通上下文的事件广播给所有命中的等待者。
    ///
    /// 返回实际通知的数量（测试用）。
    pub(crate) fn deliver(&self, kinds: InterruptKindSet) -> usize {
        let mut matched = Vec::new();
        {
            let mut waiters = self.waiters.lock();
            waiters.retain(|waiter| {
                let Some(op) = waiter.op.upgrade() else {
                    // 调用方已销毁操作，顺手清理失效条目。
                    return false;
                };
                let hit = op.requested().intersection(kinds);
                if hit.is_empty() {
                    return true;
                }
                op.store_received(hit);
                matched.push(op);
                false
            });
        }
        // 通知在锁外进行：排队路径会去拿各操作派发器的锁。
        for op in &matched {
            op.base().complete();
        }
        matched.len()
    }
}
