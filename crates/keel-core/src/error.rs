use std::borrow::Cow;
use std::error::Error as StdError;
use std::fmt;

/// `CoreError` 是 keel 各层共享的稳定错误域，所有可观察故障最终都折叠为该形态。
///
/// # 设计背景（Why）
/// - 调度核心、中断后端与传输适配层在不同线程产生的故障需要跨越异步边界传递：
///   适配层把同步引擎/传输故障记录到活跃 Operation 的失败槽里，而不是在回调栈上抛出；
///   只有同步入口（`connect`/`accept`/阻塞 `wait`）在等待返回后检查失败槽并向调用方上抛。
/// - 错误码必须稳定、机读，方便日志与自动化治理按 `<域>.<语义>` 精确分类。
///
/// # 契约说明（What）
/// - `code`：`'static` 稳定错误码，见 [`codes`] 模块；
/// - `message`：面向排障人员的描述，不包含敏感信息；
/// - `category`：结构化分类，驱动调用方的自动化处置（重试、放弃、上报）；
/// - `cause`：可选的底层原因链。
///
/// # 注意事项（Trade-offs）
/// - 超时不是错误：同步等待超时以 `false`/空集合表达，从不构造 `CoreError`；
/// - 取消同理：取消发起方看到的是干净返回，只有被牵连的下层操作携带
///   [`ErrorCategory::Cancelled`] 记录。
#[derive(Debug)]
pub struct CoreError {
    code: &'static str,
    message: Cow<'static, str>,
    category: ErrorCategory,
    cause: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

/// 错误的结构化分类，对应故障处置策略。
///
/// # 契约说明（What）
/// - `Cancelled`：调用方主动取消牵连到的下层操作；
/// - `Protocol`：加密引擎报告的不可重试协议故障（握手失败、解密失败）；
/// - `Transport`：底层字节流传输失败或对端关闭；
/// - `Resource`：OS 钩子注册等资源类故障，首次使用即致命、不重试；
/// - `Internal`：契约被违反（如重复提交同一 Operation）。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorCategory {
    Cancelled,
    Protocol,
    Transport,
    Resource,
    Internal,
}

impl CoreError {
    /// 构造核心错误；`code` 必须取自 [`codes`] 或遵循 `<域>.<语义>` 约定。
    pub fn new(
        code: &'static str,
        category: ErrorCategory,
        message: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            category,
            cause: None,
        }
    }

    /// 附带底层原因并返回新的错误。
    pub fn with_cause(mut self, cause: impl StdError + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// 人类可读描述。
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 结构化分类。
    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    /// 底层原因（若有）。
    pub fn cause(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.cause.as_deref()
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

impl StdError for CoreError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn StdError + 'static))
    }
}

/// 稳定错误码清单。
///
/// 命名遵循 `<域>.<语义>`；新增码值需同步更新各传输实现的映射表。
pub mod codes {
    /// 同一 Operation 在未完成时被再次提交。
    pub const DISPATCH_RESUBMITTED: &str = "dispatch.resubmitted";
    /// Operation 尚未绑定 Controller 就发起了需要派发的调用。
    pub const DISPATCH_UNBOUND: &str = "dispatch.unbound";
    /// 中断请求集为空。
    pub const INTERRUPT_EMPTY_REQUEST: &str = "interrupt.empty_request";
    /// OS 中断钩子安装失败（资源类，首次使用即致命）。
    pub const INTERRUPT_HOOK_FAILED: &str = "interrupt.hook_failed";
    /// 下层操作因上层取消被牵连取消。
    pub const TRANSFER_CANCELLED: &str = "transfer.cancelled";
    /// 传输方向与操作构造方向不符。
    pub const TRANSFER_DIRECTION: &str = "transfer.direction";
}
