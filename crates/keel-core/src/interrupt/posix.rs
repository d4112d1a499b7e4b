use std::io::Read;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use crate::error::{CoreError, ErrorCategory, codes};

use super::{InterruptKind, InterruptKindSet, InterruptOperation, InterruptSource, WaiterRegistry};

/// POSIX 信号后端：SIGINT/SIGHUP/SIGTERM → Break/Hangup/Terminate。
///
/// # 教案级注释
///
/// ## 逻辑（How）
/// - 两段式桥接：信号处理函数（由 `signal-hook` 安装）向自管道的写端写一个
///   字节——这是唯一发生在信号上下文里的动作；每个 Kind 的读端由一条专属
///   消费者线程阻塞读取，在普通上下文里调用共享注册表的交付算法；
/// - 每个 Kind 的钩子在首次被请求时惰性安装（接管该信号的默认处理），
///   其余 Kind 不受影响。
///
/// ## 契约（What）
/// - 管道写端为非阻塞：管道写满时信号丢失一字节，但前一字节尚未被消费
///   意味着交付即将发生，合并语义与“弱保证”一致；
/// - 钩子安装失败（管道创建 / 信号注册）返回 `interrupt.hook_failed`，
///   属首次使用即致命的资源错误，不重试。
///
/// ## 注意事项（Trade-offs）
/// - 钩子与消费者线程一经安装即伴随进程存活；该后端面向进程级事件，
///   不提供拆卸，符合“无拆卸顺序要求”的初始化约定。
pub struct PosixInterrupt {
    registry: Arc<WaiterRegistry>,
    installed: Mutex<InterruptKindSet>,
}

impl PosixInterrupt {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(WaiterRegistry::new()),
            installed: Mutex::new(InterruptKindSet::EMPTY),
        }
    }

    fn signal_number(kind: InterruptKind) -> i32 {
        use signal_hook::consts::signal;
        match kind {
            InterruptKind::Break => signal::SIGINT,
            InterruptKind::Hangup => signal::SIGHUP,
            InterruptKind::Terminate => signal::SIGTERM,
        }
    }

    fn thread_name(kind: InterruptKind) -> &'static str {
        match kind {
            InterruptKind::Break => "keel-int-break",
            InterruptKind::Hangup => "keel-int-hangup",
            InterruptKind::Terminate => "keel-int-term",
        }
    }

    /// 确保 `kinds` 中每个类别的钩子已安装。
    fn ensure_hooks(&self, kinds: InterruptKindSet) -> Result<(), CoreError> {
        let mut installed = self.installed.lock();
        for kind in kinds.kinds() {
            if installed.contains(kind) {
                continue;
            }
            self.install(kind)?;
            installed.insert(kind);
        }
        Ok(())
    }

    fn install(&self, kind: InterruptKind) -> Result<(), CoreError> {
        let (mut reader, writer) = UnixStream::pair().map_err(|err| {
            CoreError::new(
                codes::INTERRUPT_HOOK_FAILED,
                ErrorCategory::Resource,
                "self-pipe creation failed",
            )
            .with_cause(err)
        })?;
        writer.set_nonblocking(true).map_err(|err| {
            CoreError::new(
                codes::INTERRUPT_HOOK_FAILED,
                ErrorCategory::Resource,
                "self-pipe configuration failed",
            )
            .with_cause(err)
        })?;

        let signal = Self::signal_number(kind);
        signal_hook::low_level::pipe::register(signal, writer).map_err(|err| {
            CoreError::new(
                codes::INTERRUPT_HOOK_FAILED,
                ErrorCategory::Resource,
                "signal hook registration failed",
            )
            .with_cause(err)
        })?;

        let registry = Arc::clone(&self.registry);
        thread::Builder::new()
            .name(Self::thread_name(kind).to_string())
            .spawn(move || {
                let mut scratch = [0u8; 16];
                loop {
                    match reader.read(&mut scratch) {
                        Ok(0) => break,
                        Ok(_) => {
                            tracing::debug!(kind = ?kind, "interrupt signal observed");
                            registry.deliver(kind.into());
                        }
                        Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(err) => {
                            tracing::warn!(kind = ?kind, error = %err, "interrupt pipe reader stopped");
                            break;
                        }
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

        tracing::debug!(kind = ?kind, signal, "interrupt hook installed");
        Ok(())
    }
}

impl Default for PosixInterrupt {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptSource for PosixInterrupt {
    fn wait_async(&self, op: &Arc<InterruptOperation>) -> Result<(), CoreError> {
        self.ensure_hooks(op.requested())?;
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
