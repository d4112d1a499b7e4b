use std::sync::{Arc, Weak};
use std::thread;

use parking_lot::Mutex;

use keel_core::{
    controller::Controller,
    error::CoreError,
    notifier::Notifier,
    operation::{Operation, OperationId},
    transport::{AcceptOperation, ByteChannel, ByteListener},
};

use crate::{TlsChannel, config::TlsServerConfig, error::accept_failed};

/// 任意 [`ByteListener`] 之上的安全监听器。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 对调用方而言，"接受"的含义是拿到一条握手完毕、立即可用的安全通道；
///   明文接受与服务端握手因此都折叠进一次 `accept_async` 里；
/// - **握手失败透明重试**：某个入站连接握手失败（端口扫描、协议不符）
///   不应打扰等待中的调用方——丢弃该连接、重新武装明文接受，原始
///   操作继续等下一个连接。
///
/// ## 逻辑（How）
/// - 每个用户接受操作对应一个带定制通知器的内部明文接受操作；
/// - 明文连接到位后握手转交专用线程（握手要多轮往返，不能占住
///   明文监听器的接受工作线程）；
/// - 取消把登记项摘除并联动取消内部明文操作；已进入握手的连接
///   无法中途叫停，其结果在完成时发现登记项缺失后被静默丢弃。
pub struct TlsListener {
    shared: Arc<ListenerShared>,
}

struct ListenerShared {
    plain: Arc<dyn ByteListener>,
    config: TlsServerConfig,
    pending: Mutex<Vec<PendingAccept>>,
}

struct PendingAccept {
    user: Arc<AcceptOperation>,
    /// 当前在途的内部明文接受操作；透明重试时被替换。
    local: Arc<AcceptOperation>,
}

impl TlsListener {
    pub fn new(plain: Arc<dyn ByteListener>, config: TlsServerConfig) -> Self {
        Self {
            shared: Arc::new(ListenerShared {
                plain,
                config,
                pending: Mutex::new(Vec::new()),
            }),
        }
    }
}

impl ByteListener for TlsListener {
    fn accept_async(&self, op: &Arc<AcceptOperation>) -> Result<(), CoreError> {
        op.base().submit()?;
        let local = self.shared.new_local(op.base().id());
        self.shared.pending.lock().push(PendingAccept {
            user: Arc::clone(op),
            local: Arc::clone(&local),
        });
        if let Err(error) = self.shared.plain.accept_async(&local) {
            self.shared.take_entry(op.base().id());
            return Err(error);
        }
        Ok(())
    }

    fn cancel(&self, op: &Arc<AcceptOperation>) {
        if let Some(entry) = self.shared.take_entry(op.base().id()) {
            self.shared.plain.cancel(&entry.local);
        }
        if op.base().mark_cancelled() {
            if let Some(controller) = op.base().dispatcher() {
                controller.revert_post(op.base().id());
            }
        }
    }
}

impl ListenerShared {
    fn new_local(self: &Arc<Self>, user_id: OperationId) -> Arc<AcceptOperation> {
        let local = AcceptOperation::new();
        local.base().set_notifier(Arc::new(PlainAcceptNotifier {
            shared: Arc::downgrade(self),
            user_id,
        }));
        local
    }

    fn take_entry(&self, user_id: OperationId) -> Option<PendingAccept> {
        let mut pending = self.pending.lock();
        let pos = pending
            .iter()
            .position(|entry| entry.user.base().id() == user_id)?;
        Some(pending.remove(pos))
    }

    /// 内部明文接受完成；在明文监听器的接受工作线程上执行。
    fn on_plain_done(self: &Arc<Self>, user_id: OperationId) {
        // 不摘除登记项：握手期间取消仍需能找到它。
        let entry = {
            let pending = self.pending.lock();
            pending
                .iter()
                .find(|entry| entry.user.base().id() == user_id)
                .map(|entry| (Arc::clone(&entry.user), Arc::clone(&entry.local)))
        };
        let Some((user, local)) = entry else {
            // 已取消；接受到的连接（若有）随内部操作一起丢弃。
            return;
        };
        if let Some(error) = local.base().take_failure() {
            // 明文接受本身失败不重试，原样上抛。
            self.take_entry(user_id);
            user.base().fail(error);
            return;
        }
        let Some(channel) = local.take_accepted() else {
            return;
        };
        let shared = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("keel-tls-accept".to_string())
            .spawn(move || shared.run_handshake(user_id, channel));
        if let Err(err) = spawned {
            self.take_entry(user_id);
            user.base().fail(accept_failed(err));
        }
    }

    /// 服务端握手专线程：成功则交付，失败则透明重试。
    fn run_handshake(self: Arc<Self>, user_id: OperationId, channel: Arc<dyn ByteChannel>) {
        let controller = Arc::new(Controller::new());
        let outcome = TlsChannel::server(channel, &self.config)
            .and_then(|tls| tls.accept(&controller).map(|()| tls));
        match outcome {
            Ok(tls) => {
                if let Some(entry) = self.take_entry(user_id) {
                    entry.user.store_accepted(tls as Arc<dyn ByteChannel>);
                    entry.user.base().complete();
                }
                // 登记项缺失 = 等待方已取消，握手好的通道就地丢弃。
            }
            Err(error) => {
                tracing::warn!(error = %error, "tls handshake failed, re-arming accept");
                self.rearm(user_id);
            }
        }
    }

    /// 为同一个用户操作重新武装一次明文接受。
    fn rearm(self: &Arc<Self>, user_id: OperationId) {
        let local = self.new_local(user_id);
        let user = {
            let mut pending = self.pending.lock();
            let Some(entry) = pending
                .iter_mut()
                .find(|entry| entry.user.base().id() == user_id)
            else {
                return;
            };
            entry.local = Arc::clone(&local);
            Arc::clone(&entry.user)
        };
        if let Err(error) = self.plain.accept_async(&local) {
            self.take_entry(user_id);
            user.base().fail(error);
        }
    }
}

/// 内部明文接受操作的通知器：把完成转交安全监听器的状态推进。
struct PlainAcceptNotifier {
    shared: Weak<ListenerShared>,
    user_id: OperationId,
}

impl Notifier for PlainAcceptNotifier {
    fn notify(&self, op: &Operation) {
        self.notify_direct(op);
    }

    fn notify_direct(&self, _op: &Operation) {
        match self.shared.upgrade() {
            Some(shared) => shared.on_plain_done(self.user_id),
            None => {
                tracing::debug!("plain accept completion dropped: secure listener is gone");
            }
        }
    }
}
