use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::operation::{Operation, OperationId};

/// 中央完成派发器：线程在它上面等待，得知哪些 Operation 已经完成。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 调度模型是并行 OS 线程而非协作式调度器：同步入口直接阻塞在这里的
///   条件变量上，异步入口只负责把完成记录投递进来；
/// - 同一组操作同一时刻只由一个 Controller 服务，操作必须引用将要完成
///   它的那个 Controller（通过 [`Operation::bind`]）。
///
/// ## 逻辑（How）
/// - 完成队列是 `VecDeque<OperationId>`，由 `parking_lot` 互斥锁保护，
///   `post` 之后广播条件变量；
/// - `wait_for` 按标识消费指定操作的完成记录；`wait_next` 消费任意一条；
/// - `revert_post` 撤销一条尚未被消费的完成记录，供取消路径回滚账目。
///
/// ## 契约（What）
/// - 超时不是错误：`wait_for` 返回 `false`、`wait_next` 返回 `None`；
/// - `revert_post` 幂等：记录已被消费时是空操作而非错误，
///   这使取消与在途完成的竞争总是安全的。
pub struct Controller {
    queue: Mutex<VecDeque<OperationId>>,
    ready: Condvar,
}

impl Controller {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
        }
    }

    /// 投递一条完成记录并唤醒所有等待线程。
    pub fn post(&self, id: OperationId) {
        self.queue.lock().push_back(id);
        self.ready.notify_all();
    }

    /// 撤销 `id` 的一条待消费完成记录；返回是否真的撤掉了。
    pub fn revert_post(&self, id: OperationId) -> bool {
        let mut queue = self.queue.lock();
        match queue.iter().position(|&queued| queued == id) {
            Some(index) => {
                queue.remove(index);
                true
            }
            None => false,
        }
    }

    /// 阻塞等待指定操作完成。
    ///
    /// # 契约说明
    /// - `timeout` 为 `None` 时无界等待；
    /// - 返回 `true` 当且仅当在超时前消费到了 `op` 的完成记录。
    pub fn wait_for(&self, op: &Operation, timeout: Option<Duration>) -> bool {
        let id = op.id();
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut queue = self.queue.lock();
        loop {
            if let Some(index) = queue.iter().position(|&queued| queued == id) {
                queue.remove(index);
                return true;
            }
            match deadline {
                Some(deadline) => {
                    if self.ready.wait_until(&mut queue, deadline).timed_out() {
                        // 醒来与超时之间可能插入了完成记录，最后再查一次。
                        if let Some(index) = queue.iter().position(|&queued| queued == id) {
                            queue.remove(index);
                            return true;
                        }
                        return false;
                    }
                }
                None => self.ready.wait(&mut queue),
            }
        }
    }

    /// 阻塞等待任意一条完成记录。
    pub fn wait_next(&self, timeout: Option<Duration>) -> Option<OperationId> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut queue = self.queue.lock();
        loop {
            if let Some(id) = queue.pop_front() {
                return Some(id);
            }
            match deadline {
                Some(deadline) => {
                    if self.ready.wait_until(&mut queue, deadline).timed_out() {
                        return queue.pop_front();
                    }
                }
                None => self.ready.wait(&mut queue),
            }
        }
    }
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("queued", &self.queue.lock().len())
            .finish()
    }
}
