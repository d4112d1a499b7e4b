use keel_core::error::{CoreError, ErrorCategory};
use thiserror::Error;

/// 本 crate 的稳定错误码，遵循 `<域>.<语义>` 约定。
pub mod codes {
    /// 证书或私钥解析 / 配置装配失败。
    pub const TLS_CONFIG: &str = "tls.config";
    /// 握手阶段引擎报错。
    pub const TLS_HANDSHAKE: &str = "tls.handshake";
    /// 握手完成后的记录层协议故障（解密失败、对端告警等）。
    pub const TLS_PROTOCOL: &str = "tls.protocol";
    /// 安全通道因底层传输故障或取消进入不可用状态。
    pub const TLS_FAILED: &str = "tls.failed";
    /// 对端已关闭安全通道，后续动作拒绝执行。
    pub const TLS_CLOSED: &str = "tls.closed";
    /// 安全监听器的接受流程自身出错（非握手失败，握手失败会透明重试）。
    pub const TLS_ACCEPT: &str = "tls.accept";
}

/// 加密引擎报出的结构化故障：数值码 + 可读原因。
///
/// 数值码是本层自定的稳定分类（见 [`EngineError::classify`]），
/// 不随底层库的错误枚举漂移，方便日志按数值聚合。
#[derive(Debug, Error)]
#[error("engine error {code}: {reason}")]
pub(crate) struct EngineError {
    pub(crate) code: u32,
    pub(crate) reason: String,
}

impl EngineError {
    pub(crate) fn classify(source: &rustls::Error) -> Self {
        let code = match source {
            rustls::Error::AlertReceived(_) => 1,
            rustls::Error::InvalidMessage(_) => 2,
            rustls::Error::PeerIncompatible(_) => 3,
            rustls::Error::PeerMisbehaved(_) => 4,
            rustls::Error::InvalidCertificate(_) => 5,
            rustls::Error::DecryptError => 6,
            rustls::Error::NoApplicationProtocol => 7,
            _ => 0,
        };
        Self {
            code,
            reason: source.to_string(),
        }
    }
}

/// 握手期间的引擎故障。
pub(crate) fn handshake_error(source: EngineError) -> CoreError {
    CoreError::new(
        codes::TLS_HANDSHAKE,
        ErrorCategory::Protocol,
        "tls handshake failed",
    )
    .with_cause(source)
}

/// 握手之后的记录层故障。
pub(crate) fn protocol_error(source: EngineError) -> CoreError {
    CoreError::new(
        codes::TLS_PROTOCOL,
        ErrorCategory::Protocol,
        "tls record processing failed",
    )
    .with_cause(source)
}

/// 配置装配故障；`detail` 说明失败的环节。
pub(crate) fn config_error(detail: &'static str) -> CoreError {
    CoreError::new(codes::TLS_CONFIG, ErrorCategory::Protocol, detail)
}

/// 接受流程的资源类故障（如握手线程创建失败）。
pub(crate) fn accept_failed(source: std::io::Error) -> CoreError {
    CoreError::new(
        codes::TLS_ACCEPT,
        ErrorCategory::Resource,
        "secure accept could not be serviced",
    )
    .with_cause(source)
}

/// 会话进入 `Failed` 终态后，排队动作的统一失败负载。
pub(crate) fn session_failed() -> CoreError {
    CoreError::new(
        codes::TLS_FAILED,
        ErrorCategory::Transport,
        "secure channel is in failed state",
    )
}

/// 会话进入 `Closed` 终态后，排队动作的统一失败负载。
pub(crate) fn session_closed() -> CoreError {
    CoreError::new(
        codes::TLS_CLOSED,
        ErrorCategory::Transport,
        "secure channel was closed by peer",
    )
}
