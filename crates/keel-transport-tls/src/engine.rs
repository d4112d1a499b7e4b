use std::io::{Read, Write};

use bytes::Bytes;

use crate::error::EngineError;

/// 一次明文读取的结果。
pub(crate) enum PlainRead {
    /// 读到了明文。
    Data(Bytes),
    /// 引擎暂无明文可交付，需要先喂入更多线缆字节。
    WouldBlock,
    /// 对端已关闭会话（close_notify 或链路断裂后的等价表现）。
    Closed,
}

/// 同步加密引擎在状态机眼中的形状。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 状态机只关心“引擎要什么、给了什么”，不关心具体密码学库；
///   这条接缝让 [`crate::machine`] 可以用脚本化的假引擎做纯逻辑测试；
/// - 引擎的出站/入站密文缓冲即内存桥的本侧：`drain_outgoing` 取走待发
///   线缆字节，`feed_incoming` 喂入对端到达的线缆字节。
///
/// ## 契约（What）
/// - 所有方法都在会话实例锁内被调用，实现无需自带同步；
/// - `drive_handshake` 返回 `Ok(true)` 表示握手完成，`Ok(false)` 表示
///   仍需与对端交换字节（此时由状态机决定先排空还是先接收）；
/// - `write_plaintext` 返回本次吞下的字节数，`0` 表示内部缓冲已满，
///   需要先把出站密文排空再续写。
pub(crate) trait SessionEngine: Send {
    fn drive_handshake(&mut self) -> Result<bool, EngineError>;

    fn write_plaintext(&mut self, data: &[u8]) -> Result<usize, EngineError>;

    fn read_plaintext(&mut self, max: usize) -> Result<PlainRead, EngineError>;

    /// 取走引擎积压的全部出站密文；空返回表示无事可做。
    fn drain_outgoing(&mut self) -> Bytes;

    /// 喂入来自对端的线缆字节并推进记录层处理。
    fn feed_incoming(&mut self, data: &[u8]) -> Result<(), EngineError>;
}

/// rustls 之上的 [`SessionEngine`] 实现。
///
/// rustls 的 `Connection` 自带入站/出站密文缓冲，天然就是一对内存桥端点：
/// `write_tls` 排出出站缓冲，`read_tls` + `process_new_packets` 消化入站字节。
pub(crate) struct RustlsEngine {
    conn: rustls::Connection,
}

impl RustlsEngine {
    pub(crate) fn new(conn: rustls::Connection) -> Self {
        Self { conn }
    }
}

impl SessionEngine for RustlsEngine {
    fn drive_handshake(&mut self) -> Result<bool, EngineError> {
        // 握手进展发生在 feed_incoming 的记录处理中，这里只读结论。
        Ok(!self.conn.is_handshaking())
    }

    fn write_plaintext(&mut self, data: &[u8]) -> Result<usize, EngineError> {
        self.conn.writer().write(data).map_err(|err| EngineError {
            code: 0,
            reason: err.to_string(),
        })
    }

    fn read_plaintext(&mut self, max: usize) -> Result<PlainRead, EngineError> {
        let mut buf = vec![0u8; max.max(1)];
        match self.conn.reader().read(&mut buf) {
            Ok(0) => Ok(PlainRead::Closed),
            Ok(read) => Ok(PlainRead::Data(Bytes::copy_from_slice(&buf[..read]))),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(PlainRead::WouldBlock),
            // close_notify 缺席的脏关闭：对上层同样表现为会话结束。
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => Ok(PlainRead::Closed),
            Err(err) => Err(EngineError {
                code: 0,
                reason: err.to_string(),
            }),
        }
    }

    fn drain_outgoing(&mut self) -> Bytes {
        let mut out = Vec::new();
        while self.conn.wants_write() {
            // Vec<u8> 作为写出端不会失败。
            if self.conn.write_tls(&mut out).is_err() {
                break;
            }
        }
        Bytes::from(out)
    }

    fn feed_incoming(&mut self, data: &[u8]) -> Result<(), EngineError> {
        let mut cursor = data;
        while !cursor.is_empty() {
            match self.conn.read_tls(&mut cursor) {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) => {
                    return Err(EngineError {
                        code: 0,
                        reason: err.to_string(),
                    });
                }
            }
        }
        self.conn
            .process_new_packets()
            .map(|_| ())
            .map_err(|err| EngineError::classify(&err))
    }
}
