//! 常用类型一站式导入。

pub use crate::controller::Controller;
pub use crate::error::{CoreError, ErrorCategory, codes};
pub use crate::interrupt::{
    InternalInterrupt, InterruptKind, InterruptKindSet, InterruptOperation, InterruptSource,
};
pub use crate::notifier::Notifier;
pub use crate::operation::{Operation, OperationId};
pub use crate::transport::{
    AcceptOperation, ByteChannel, ByteListener, TransferDirection, TransferOperation,
};

#[cfg(any(unix, windows))]
pub use crate::interrupt::{NativeInterrupt, native};
