use std::io;

use keel_core::error::{CoreError, ErrorCategory};
use thiserror::Error;

/// 正在执行的传输操作种类，用于错误码与日志标注。
#[derive(Clone, Copy, Debug)]
pub(crate) enum OperationKind {
    Bind,
    Accept,
    Send,
    Receive,
}

impl OperationKind {
    pub(crate) fn code(self) -> &'static str {
        match self {
            OperationKind::Bind => "tcp.bind",
            OperationKind::Accept => "tcp.accept",
            OperationKind::Send => "tcp.send",
            OperationKind::Receive => "tcp.receive",
        }
    }
}

/// 底层套接字故障的结构化包装；最终都折叠进 [`CoreError`] 的原因链。
#[derive(Debug, Error)]
#[error("tcp {operation} failed")]
pub(crate) struct TcpFailure {
    operation: &'static str,
    #[source]
    source: io::Error,
}

/// 把一次 I/O 错误映射为带稳定错误码的 [`CoreError`]。
pub(crate) fn map_io_error(kind: OperationKind, source: io::Error) -> CoreError {
    let category = match kind {
        OperationKind::Bind => ErrorCategory::Resource,
        _ => ErrorCategory::Transport,
    };
    CoreError::new(kind.code(), category, "socket operation failed").with_cause(TcpFailure {
        operation: kind.code(),
        source,
    })
}

/// 工作线程已退出而仍有操作被投递时的错误。
pub(crate) fn worker_gone(kind: OperationKind) -> CoreError {
    CoreError::new(
        kind.code(),
        ErrorCategory::Transport,
        "transport worker is no longer running",
    )
}
