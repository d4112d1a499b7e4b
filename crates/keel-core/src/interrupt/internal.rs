use std::sync::Arc;

use crate::error::CoreError;

use super::{InterruptOperation, InterruptKindSet, InterruptSource, WaiterRegistry};

/// 进程内中断源：没有 OS 钩子，事件由 [`post`](InternalInterrupt::post) 注入。
///
/// # 意图（Why）
/// - 为上层提供一个纯确定性的后端，既服务于进程内的软中断（自定义
///   关停流程），也作为交付算法的试验台；
/// - 与平台后端共享同一注册表逻辑，行为差异只剩事件来源。
pub struct InternalInterrupt {
    registry: WaiterRegistry,
}

impl InternalInterrupt {
    pub fn new() -> Self {
        Self {
            registry: WaiterRegistry::new(),
        }
    }

    /// 注入一次中断事件；无人等待即丢弃，不排队。
    ///
    /// 返回被通知的等待者数量。
    pub fn post(&self, kinds: InterruptKindSet) -> usize {
        self.registry.deliver(kinds)
    }
}

impl Default for InternalInterrupt {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptSource for InternalInterrupt {
    fn wait_async(&self, op: &Arc<InterruptOperation>) -> Result<(), CoreError> {
        op.base().submit()?;
        self.registry.register(op);
        Ok(())
    }

    fn cancel(&self, op: &Arc<InterruptOperation>) {
        if op.base().mark_cancelled() {
            self.registry.remove(op.base().id());
            if let Some(controller) = op.base().dispatcher() {
                controller.revert_post(op.base().id());
            }
        }
    }
}
