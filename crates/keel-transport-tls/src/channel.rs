use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use keel_core::{
    controller::Controller,
    error::CoreError,
    notifier::Notifier,
    operation::{Operation, OperationId},
    transport::{ByteChannel, TransferDirection, TransferOperation, ensure_direction},
};

use crate::{
    config::{TlsClientConfig, TlsServerConfig},
    engine::{RustlsEngine, SessionEngine},
    error::{EngineError, config_error},
    machine::{Action, ActionKind, Effect, Machine, Outcome},
};

/// 单次对端接收子操作的线缆读取量：覆盖一整条带头部与认证标签的
/// TLS 记录（16 KiB 明文 + 记录开销）；不足一条记录的到货由引擎的
/// 入站缓冲跨次拼接。
const WIRE_READ_CAPACITY: usize = 16 * 1024 + 512;

/// 任意 [`ByteChannel`] 之上的安全字节流通道。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 同步加密引擎（rustls）与完成式对端通道之间用引擎自带的密文缓冲
///   做内存桥：状态机决定何时排空、何时收料，本层只负责把状态机指派的
///   副作用落到真实的对端通道与用户操作上；
/// - 对端子操作安装 [`PeerNotifier`]（直达通知 + `Weak` 回引），
///   在传输工作线程上同步驱动状态机，完成链路零额外线程。
///
/// ## 逻辑（How）
/// - 用户动作入队后推进一轮状态机；副作用在实例锁内**收集**（用户动作
///   从登记表摘除、在途子操作登记到 `outstanding`），释放锁后**执行**
///   （通知用户操作、向对端通道提交子操作）——对端同样可以是一条安全
///   通道，回调绝不能落在持锁区间里；
/// - 同一时刻至多一个对端子操作在途，密文因此严格保序。
///
/// ## 契约（What）
/// - 角色（客户端/服务端）在构造时固定，`connect`/`accept` 同形；
/// - `send` 成功返回意味着对应密文已写向对端通道，而不只是进了引擎；
/// - 取消在途动作令会话进入失败终态，后续动作速断（见 [`crate::machine`]）。
///
/// ## 锁序（不可违反）
/// - 实例状态锁 → 对端通道内部锁 → Controller 队列锁，任何路径不得反向；
/// - 可能回调用户代码或层叠通道的副作用一律出锁执行，持锁区间内只做
///   状态机推进与登记表增删。
pub struct TlsChannel {
    shared: Arc<Shared>,
}

struct Shared {
    peer: Arc<dyn ByteChannel>,
    state: Mutex<State>,
}

struct State {
    engine: Box<dyn SessionEngine>,
    machine: Machine,
    /// 在途对端子操作；与 `Sending`/`Receiving` 状态一一对应。
    outstanding: Option<PeerOp>,
    /// 尚未了结的用户动作，按标识索引。
    users: HashMap<OperationId, UserOp>,
}

struct PeerOp {
    direction: TransferDirection,
    op: Arc<TransferOperation>,
}

enum UserOp {
    /// 握手这类只关心成败的动作。
    Session(Arc<Operation>),
    /// 用户的发送/接收。
    Transfer(Arc<TransferOperation>),
}

/// 一轮状态机推进在锁内收集下来、待出锁执行的工作。
struct Staged {
    finishes: Vec<(UserOp, Result<Outcome, CoreError>)>,
    /// 状态机一轮至多指派一个对端子操作。
    submission: Option<PeerOp>,
}

impl TlsChannel {
    /// 以客户端角色包装 `peer`；`server_name` 用于证书校验与 SNI。
    pub fn client(
        peer: Arc<dyn ByteChannel>,
        config: &TlsClientConfig,
        server_name: &str,
    ) -> Result<Arc<Self>, CoreError> {
        let name = rustls_pki_types::ServerName::try_from(server_name.to_string())
            .map_err(|err| config_error("server name is not valid").with_cause(err))?;
        let conn = rustls::ClientConnection::new(Arc::clone(&config.inner), name).map_err(|err| {
            config_error("client session setup failed").with_cause(EngineError::classify(&err))
        })?;
        Ok(Self::with_connection(peer, rustls::Connection::Client(conn)))
    }

    /// 以服务端角色包装 `peer`。
    pub fn server(
        peer: Arc<dyn ByteChannel>,
        config: &TlsServerConfig,
    ) -> Result<Arc<Self>, CoreError> {
        let conn = rustls::ServerConnection::new(Arc::clone(&config.inner)).map_err(|err| {
            config_error("server session setup failed").with_cause(EngineError::classify(&err))
        })?;
        Ok(Self::with_connection(peer, rustls::Connection::Server(conn)))
    }

    fn with_connection(peer: Arc<dyn ByteChannel>, conn: rustls::Connection) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(Shared {
                peer,
                state: Mutex::new(State {
                    engine: Box::new(RustlsEngine::new(conn)),
                    machine: Machine::new(),
                    outstanding: None,
                    users: HashMap::new(),
                }),
            }),
        })
    }

    /// 客户端侧阻塞握手：推进到握手完成或失败。
    pub fn connect(&self, controller: &Arc<Controller>) -> Result<(), CoreError> {
        self.run_handshake(controller)
    }

    /// 服务端侧阻塞握手。与 `connect` 同形：角色已在构造时固定，
    /// 两个入口只是让调用点读起来与各自的意图一致。
    pub fn accept(&self, controller: &Arc<Controller>) -> Result<(), CoreError> {
        self.run_handshake(controller)
    }

    fn run_handshake(&self, controller: &Arc<Controller>) -> Result<(), CoreError> {
        let op = Arc::new(Operation::new());
        op.bind(controller);
        op.submit()?;
        self.shared
            .enqueue(op.id(), ActionKind::Handshake, UserOp::Session(Arc::clone(&op)));
        controller.wait_for(&op, None);
        match op.take_failure() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl ByteChannel for TlsChannel {
    fn send_async(&self, op: &Arc<TransferOperation>) -> Result<(), CoreError> {
        ensure_direction(op, TransferDirection::Send)?;
        op.base().submit()?;
        self.shared.enqueue(
            op.base().id(),
            ActionKind::Send {
                data: op.payload(),
                written: 0,
            },
            UserOp::Transfer(Arc::clone(op)),
        );
        Ok(())
    }

    fn receive_async(&self, op: &Arc<TransferOperation>) -> Result<(), CoreError> {
        ensure_direction(op, TransferDirection::Receive)?;
        op.base().submit()?;
        self.shared.enqueue(
            op.base().id(),
            ActionKind::Receive {
                max: op.capacity().max(1),
            },
            UserOp::Transfer(Arc::clone(op)),
        );
        Ok(())
    }

    fn cancel(&self, op: &Arc<TransferOperation>) {
        let token = op.base().id();
        let staged = {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            if state.users.remove(&token).is_none() {
                None
            } else {
                let head_in_flight = state.machine.cancel(token);
                if head_in_flight {
                    // 在途密文无法收回，会话密码学状态已不可信；
                    // 联动取消对端子操作并让余下动作速断。
                    if let Some(peer_op) = state.outstanding.take() {
                        self.shared.peer.cancel(&peer_op.op);
                    }
                }
                let effects = state.machine.cycle(&mut *state.engine);
                Some(self.shared.stage(state, effects))
            }
        };
        if let Some(staged) = staged {
            self.shared.run(staged);
        }
        if op.base().mark_cancelled() {
            if let Some(controller) = op.base().dispatcher() {
                controller.revert_post(token);
            }
        }
    }
}

impl Shared {
    /// 动作入队 + 推进一轮状态机。调用方已完成操作的 submit。
    fn enqueue(self: &Arc<Self>, token: OperationId, kind: ActionKind, user: UserOp) {
        let staged = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.users.insert(token, user);
            state.machine.push(Action { token, kind });
            let effects = state.machine.cycle(&mut *state.engine);
            self.stage(state, effects)
        };
        self.run(staged);
    }

    /// 对端子操作完成回调；在对端通道的完成线程上执行。
    fn on_peer_done(self: &Arc<Self>, id: OperationId) {
        let staged = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(peer_op) = state.outstanding.take() else {
                return;
            };
            if peer_op.op.base().id() != id {
                state.outstanding = Some(peer_op);
                return;
            }
            let effects = match peer_op.op.base().take_failure() {
                Some(error) => state.machine.peer_failed(error, &mut *state.engine),
                None => match peer_op.direction {
                    TransferDirection::Send => state
                        .machine
                        .peer_send_done(peer_op.op.transferred(), &mut *state.engine),
                    TransferDirection::Receive => state
                        .machine
                        .peer_receive_done(&peer_op.op.payload(), &mut *state.engine),
                },
            };
            self.stage(state, effects)
        };
        self.run(staged);
    }

    /// 持锁收集：摘除被了结的用户动作、登记新的在途子操作。
    ///
    /// 通知与对端提交都可能回调任意用户代码或层叠的安全通道，
    /// 一律推迟到 [`Shared::run`] 在锁外执行。
    fn stage(self: &Arc<Self>, state: &mut State, effects: Vec<Effect>) -> Staged {
        let mut staged = Staged {
            finishes: Vec::new(),
            submission: None,
        };
        for effect in effects {
            match effect {
                Effect::Finish(token, result) => match state.users.remove(&token) {
                    Some(user) => staged.finishes.push((user, result)),
                    None => {
                        // 找不到登记项说明动作已被取消。
                        tracing::debug!(
                            operation = token.raw(),
                            "finish dropped: action was cancelled"
                        );
                    }
                },
                Effect::PeerSend(data) => {
                    staged.submission = Some(PeerOp {
                        direction: TransferDirection::Send,
                        op: TransferOperation::for_send(data),
                    });
                }
                Effect::PeerReceive => {
                    staged.submission = Some(PeerOp {
                        direction: TransferDirection::Receive,
                        op: TransferOperation::for_receive(WIRE_READ_CAPACITY),
                    });
                }
            }
        }
        if let Some(peer_op) = &staged.submission {
            peer_op.op.base().set_notifier(Arc::new(PeerNotifier {
                shared: Arc::downgrade(self),
            }));
            // 先登记再（出锁后）提交：完成回调按标识匹配，提交前不可能触发。
            state.outstanding = Some(PeerOp {
                direction: peer_op.direction,
                op: Arc::clone(&peer_op.op),
            });
        }
        staged
    }

    /// 出锁执行：先通知被了结的用户动作，再提交新的对端子操作。
    /// 对端的同步拒绝回灌状态机（此后会话已是终态，不再产生新提交）。
    fn run(self: &Arc<Self>, staged: Staged) {
        for (user, result) in staged.finishes {
            notify_user(user, result);
        }
        let Some(peer_op) = staged.submission else {
            return;
        };
        let submitted = match peer_op.direction {
            TransferDirection::Send => self.peer.send_async(&peer_op.op),
            TransferDirection::Receive => self.peer.receive_async(&peer_op.op),
        };
        if let Err(error) = submitted {
            let staged = {
                let mut guard = self.state.lock();
                let state = &mut *guard;
                let ours = state
                    .outstanding
                    .as_ref()
                    .is_some_and(|cur| cur.op.base().id() == peer_op.op.base().id());
                if ours {
                    state.outstanding = None;
                }
                let effects = state.machine.peer_failed(error, &mut *state.engine);
                self.stage(state, effects)
            };
            self.run(staged);
        }
    }
}

/// 了结一个用户动作；只在持锁区间之外调用。
fn notify_user(user: UserOp, result: Result<Outcome, CoreError>) {
    match (user, result) {
        (UserOp::Session(op), Ok(_)) => op.complete(),
        (UserOp::Session(op), Err(error)) => op.fail(error),
        (UserOp::Transfer(op), Ok(Outcome::Sent(total))) => {
            op.record_transferred(total);
            op.base().complete();
        }
        (UserOp::Transfer(op), Ok(Outcome::Received(data))) => {
            op.store_received(data);
            op.base().complete();
        }
        (UserOp::Transfer(op), Ok(Outcome::Handshake)) => op.base().complete(),
        (UserOp::Transfer(op), Err(error)) => op.base().fail(error),
    }
}

/// 对端子操作的完成通知器：经 `Weak` 回到会话并驱动状态机。
///
/// 通道已销毁时升级失败，完成被静默丢弃——这正是内部子操作
/// 生命周期与会话解耦的意义。
struct PeerNotifier {
    shared: Weak<Shared>,
}

impl Notifier for PeerNotifier {
    fn notify(&self, op: &Operation) {
        self.notify_direct(op);
    }

    fn notify_direct(&self, op: &Operation) {
        match self.shared.upgrade() {
            Some(shared) => shared.on_peer_done(op.id()),
            None => {
                tracing::debug!(
                    operation = op.id().raw(),
                    "peer completion dropped: secure channel is gone"
                );
            }
        }
    }
}
