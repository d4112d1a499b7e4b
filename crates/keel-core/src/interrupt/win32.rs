#![allow(unsafe_code)]

use std::sync::{Arc, OnceLock};
use std::sync::atomic::{AtomicIsize, AtomicU8, Ordering};
use std::thread;

use parking_lot::Mutex;

use windows_sys::Win32::Foundation::HANDLE;
use windows_sys::Win32::System::Console::{
    CTRL_BREAK_EVENT, CTRL_C_EVENT, CTRL_CLOSE_EVENT, CTRL_LOGOFF_EVENT, CTRL_SHUTDOWN_EVENT,
    SetConsoleCtrlHandler,
};
use windows_sys::Win32::System::Threading::{CreateEventW, INFINITE, SetEvent, WaitForSingleObject};

use crate::error::{CoreError, ErrorCategory, codes};

use super::{InterruptKind, InterruptKindSet, InterruptOperation, InterruptSource, WaiterRegistry};

// 控制台处理函数与消费者线程之间的两段式桥：处理函数只置位掩码并激发
// 事件对象，不触碰任何锁或堆。
//
// 控制台钩子是进程级资源，这些状态也只能是进程级的；等待者注册表
// 随之全局共享（见 `shared_registry`），多个后端实例交付同一批等待者。
static FIRED_MASK: AtomicU8 = AtomicU8::new(0);
static ARMED_MASK: AtomicU8 = AtomicU8::new(0);
static WAKE_EVENT: AtomicIsize = AtomicIsize::new(0);
static HOOK_INSTALLED: Mutex<bool> = Mutex::new(false);

fn shared_registry() -> Arc<WaiterRegistry> {
    static REGISTRY: OnceLock<Arc<WaiterRegistry>> = OnceLock::new();
    Arc::clone(REGISTRY.get_or_init(|| Arc::new(WaiterRegistry::new())))
}

fn kind_bit(kind: InterruptKind) -> u8 {
    match kind {
        InterruptKind::Break => 0b001,
        InterruptKind::Hangup => 0b010,
        InterruptKind::Terminate => 0b100,
    }
}

fn mask_to_set(mask: u8) -> InterruptKindSet {
    InterruptKind::ALL
        .into_iter()
        .filter(|kind| mask & kind_bit(*kind) != 0)
        .collect()
}

unsafe extern "system" fn console_handler(ctrl_type: u32) -> i32 {
    let kind = match ctrl_type {
        CTRL_C_EVENT | CTRL_BREAK_EVENT => InterruptKind::Break,
        CTRL_LOGOFF_EVENT | CTRL_SHUTDOWN_EVENT => InterruptKind::Hangup,
        CTRL_CLOSE_EVENT => InterruptKind::Terminate,
        _ => return 0,
    };
    // 未被请求过的类别保持 OS 默认处理。
    if ARMED_MASK.load(Ordering::Acquire) & kind_bit(kind) == 0 {
        return 0;
    }
    FIRED_MASK.fetch_or(kind_bit(kind), Ordering::AcqRel);
    let event = WAKE_EVENT.load(Ordering::Acquire);
    if event != 0 {
        unsafe {
            SetEvent(event as HANDLE);
        }
    }
    1
}

/// Win32 控制台事件后端：CTRL_C/CTRL_BREAK → Break，LOGOFF/SHUTDOWN → Hangup，
/// CLOSE → Terminate。
///
/// # 逻辑（How）
/// - 首次使用任一 Kind 时注册一次 `SetConsoleCtrlHandler` 并创建事件对象与
///   消费者线程；此后按 Kind 惰性武装 `ARMED_MASK`，未武装的类别继续走
///   OS 默认处理；
/// - 处理函数（Windows 在独立线程上调用它）置位 `FIRED_MASK` 并 `SetEvent`；
///   消费者线程 `WaitForSingleObject` 醒来后取走掩码，在普通上下文里交付。
///
/// # 契约（What）
/// - 注册失败返回 `interrupt.hook_failed`（资源类，首次使用即致命）；
/// - 事件对象为自动复位：连发事件可能合并，与子系统的弱交付保证一致；
/// - 所有实例共享同一进程级注册表与钩子：控制台事件本就是进程级的，
///   后建实例不会顶掉先建实例的等待者。
pub struct ConsoleInterrupt {
    registry: Arc<WaiterRegistry>,
}

impl ConsoleInterrupt {
    pub fn new() -> Self {
        Self {
            registry: shared_registry(),
        }
    }

    fn ensure_hook(&self, kinds: InterruptKindSet) -> Result<(), CoreError> {
        let mut installed = HOOK_INSTALLED.lock();
        if !*installed {
            let event = unsafe { CreateEventW(std::ptr::null(), 0, 0, std::ptr::null()) };
            if event.is_null() {
                return Err(CoreError::new(
                    codes::INTERRUPT_HOOK_FAILED,
                    ErrorCategory::Resource,
                    "console wake event creation failed",
                ));
            }
            let event_addr = event as isize;
            WAKE_EVENT.store(event_addr, Ordering::Release);

            if unsafe { SetConsoleCtrlHandler(Some(console_handler), 1) } == 0 {
                return Err(CoreError::new(
                    codes::INTERRUPT_HOOK_FAILED,
                    ErrorCategory::Resource,
                    "SetConsoleCtrlHandler registration failed",
                ));
            }

            let registry = Arc::clone(&self.registry);
            thread::Builder::new()
                .name("keel-int-console".to_string())
                .spawn(move || {
                    loop {
                        unsafe {
                            WaitForSingleObject(event_addr as HANDLE, INFINITE);
                        }
                        let mask = FIRED_MASK.swap(0, Ordering::AcqRel);
                        if mask != 0 {
                            registry.deliver(mask_to_set(mask));
                        }
                    }
                })
                .map_err(|err| {
                    CoreError::new(
                        codes::INTERRUPT_HOOK_FAILED,
                        ErrorCategory::Resource,
                        "interrupt consumer thread spawn failed",
                    )
                    .with_cause(err)
                })?;
            *installed = true;
        }

        for kind in kinds.kinds() {
            ARMED_MASK.fetch_or(kind_bit(kind), Ordering::AcqRel);
        }
        Ok(())
    }
}

impl Default for ConsoleInterrupt {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptSource for ConsoleInterrupt {
    fn wait_async(&self, op: &Arc<InterruptOperation>) -> Result<(), CoreError> {
        self.ensure_hook(op.requested())?;
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
