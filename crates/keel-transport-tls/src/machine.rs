use std::collections::VecDeque;

use bytes::Bytes;

use keel_core::{error::CoreError, operation::OperationId};

use crate::{
    engine::{PlainRead, SessionEngine},
    error::{handshake_error, protocol_error, session_closed, session_failed},
};

/// 会话状态。`Failed` 与 `Closed` 是终态，此后所有动作不再接触引擎。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Status {
    /// 空闲：可以推进队首动作。
    Idle,
    /// 有一个对端发送子操作在途。
    Sending,
    /// 有一个对端接收子操作在途。
    Receiving,
    /// 底层传输断裂或动作在途时被取消。
    Failed,
    /// 对端关闭了会话。
    Closed,
}

/// 排队中的用户动作。
pub(crate) struct Action {
    pub(crate) token: OperationId,
    pub(crate) kind: ActionKind,
}

pub(crate) enum ActionKind {
    /// 推进握手直至完成；完成前经由 Flush 确保末段密文出门。
    Handshake,
    /// 写出明文；`written` 是已被引擎吞下的字节数。
    Send { data: Bytes, written: usize },
    /// 读入至多 `max` 字节明文。
    Receive { max: usize },
    /// 排空出站密文后以 `after` 收尾；Handshake/Send 的共同尾声。
    Flush { after: FlushOutcome },
}

#[derive(Clone, Copy)]
pub(crate) enum FlushOutcome {
    Handshake,
    Sent(usize),
}

/// 动作的最终结果，由通道层翻译回各自的操作类型。
pub(crate) enum Outcome {
    Handshake,
    Sent(usize),
    Received(Bytes),
}

/// 状态机指派给通道层的副作用。
///
/// 副作用在实例锁内收集、由通道层决定执行时机；状态机本身从不直接
/// 触碰对端通道或任何 Operation。
pub(crate) enum Effect {
    /// 向对端通道发起一次发送子操作，负载为给定密文。
    PeerSend(Bytes),
    /// 向对端通道发起一次接收子操作。
    PeerReceive,
    /// 以给定结果了结一个用户动作。
    Finish(OperationId, Result<Outcome, CoreError>),
}

/// 安全会话的纯状态机：动作 FIFO + 引擎对话，零 I/O、零锁。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把“何时该和引擎说什么、何时该劳驾对端通道”收拢为一个可单测的纯
///   函数族：输入是动作与对端完成事件，输出是 [`Effect`] 列表；
/// - 同一时刻至多一个对端子操作在途（`Sending`/`Receiving` 互斥），
///   这保证了密文在线缆上的顺序与动作顺序一致。
///
/// ## 逻辑（How）
/// - `cycle` 反复推进队首动作，直到动作队列耗尽或必须等待对端；
/// - 引擎表示“还要交换字节”时：出站缓冲非空则转 `Sending` 排空，
///   否则转 `Receiving` 等待对端来料；
/// - `Send` 动作在明文全部被引擎吞下后降级为 `Flush`，确保对应密文
///   真正写向对端之后才通知调用方。
///
/// ## 契约（What）
/// - **FIFO**：动作严格按入队顺序了结；
/// - **终态速断**：`Failed`/`Closed` 下的动作直接以终态错误了结，
///   不再接触引擎；
/// - **取消**：取消队首在途动作把状态机推入 `Failed`（在途密文无法
///   收回，会话密码学状态已不可信），其余排队动作随之速断。
pub(crate) struct Machine {
    status: Status,
    actions: VecDeque<Action>,
    /// 在途出站密文；对端部分写出时据此续传余量。
    wire_out: Bytes,
}

impl Machine {
    pub(crate) fn new() -> Self {
        Self {
            status: Status::Idle,
            actions: VecDeque::new(),
            wire_out: Bytes::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn status(&self) -> Status {
        self.status
    }

    /// 动作入队。调用方随后必须调用 [`Machine::cycle`]。
    pub(crate) fn push(&mut self, action: Action) {
        self.actions.push_back(action);
    }

    /// 推进循环：消化队首动作直到需要等待对端或队列耗尽。
    pub(crate) fn cycle(&mut self, engine: &mut dyn SessionEngine) -> Vec<Effect> {
        let mut effects = Vec::new();
        loop {
            match self.status {
                Status::Failed | Status::Closed => {
                    self.drain_terminal(&mut effects);
                    return effects;
                }
                Status::Sending | Status::Receiving => return effects,
                Status::Idle => {}
            }
            let Some(action) = self.actions.front_mut() else {
                return effects;
            };
            let token = action.token;
            match &mut action.kind {
                ActionKind::Handshake => match engine.drive_handshake() {
                    Ok(true) => {
                        action.kind = ActionKind::Flush {
                            after: FlushOutcome::Handshake,
                        };
                    }
                    Ok(false) => self.exchange(engine, &mut effects),
                    Err(err) => {
                        self.actions.pop_front();
                        effects.push(Effect::Finish(token, Err(handshake_error(err))));
                    }
                },
                ActionKind::Send { data, written } => {
                    if *written < data.len() {
                        match engine.write_plaintext(&data[*written..]) {
                            Ok(0) => self.exchange(engine, &mut effects),
                            Ok(accepted) => *written += accepted,
                            Err(err) => {
                                self.actions.pop_front();
                                effects.push(Effect::Finish(token, Err(protocol_error(err))));
                            }
                        }
                    } else {
                        let total = *written;
                        action.kind = ActionKind::Flush {
                            after: FlushOutcome::Sent(total),
                        };
                    }
                }
                ActionKind::Receive { max } => match engine.read_plaintext(*max) {
                    Ok(PlainRead::Data(data)) => {
                        self.actions.pop_front();
                        effects.push(Effect::Finish(token, Ok(Outcome::Received(data))));
                    }
                    Ok(PlainRead::Closed) => {
                        // 优雅关闭：本动作以 0 字节成功了结，之后进入终态。
                        self.actions.pop_front();
                        effects.push(Effect::Finish(token, Ok(Outcome::Received(Bytes::new()))));
                        self.status = Status::Closed;
                    }
                    Ok(PlainRead::WouldBlock) => self.exchange(engine, &mut effects),
                    Err(err) => {
                        self.actions.pop_front();
                        effects.push(Effect::Finish(token, Err(protocol_error(err))));
                    }
                },
                ActionKind::Flush { after } => {
                    let after = *after;
                    let out = engine.drain_outgoing();
                    if out.is_empty() {
                        self.actions.pop_front();
                        let outcome = match after {
                            FlushOutcome::Handshake => Outcome::Handshake,
                            FlushOutcome::Sent(total) => Outcome::Sent(total),
                        };
                        effects.push(Effect::Finish(token, Ok(outcome)));
                    } else {
                        self.start_send(out, &mut effects);
                    }
                }
            }
        }
    }

    /// 对端发送子操作完成。`sent` 为实际写出的字节数。
    pub(crate) fn peer_send_done(
        &mut self,
        sent: usize,
        engine: &mut dyn SessionEngine,
    ) -> Vec<Effect> {
        debug_assert_eq!(self.status, Status::Sending);
        let mut effects = Vec::new();
        if sent == 0 {
            // 缓冲非空却写出 0 字节：链路断裂。
            self.status = Status::Failed;
        } else if sent < self.wire_out.len() {
            // 部分写出：续传余量，保持 Sending。
            let rest = self.wire_out.slice(sent..);
            self.wire_out = rest.clone();
            effects.push(Effect::PeerSend(rest));
            return effects;
        } else {
            let more = engine.drain_outgoing();
            if more.is_empty() {
                self.status = Status::Idle;
            } else {
                self.wire_out = more.clone();
                effects.push(Effect::PeerSend(more));
                return effects;
            }
        }
        effects.extend(self.cycle(engine));
        effects
    }

    /// 对端接收子操作完成。空切片表示对端关闭。
    pub(crate) fn peer_receive_done(
        &mut self,
        data: &[u8],
        engine: &mut dyn SessionEngine,
    ) -> Vec<Effect> {
        debug_assert_eq!(self.status, Status::Receiving);
        let mut effects = Vec::new();
        if data.is_empty() {
            self.status = Status::Closed;
        } else {
            match engine.feed_incoming(data) {
                Ok(()) => self.status = Status::Idle,
                Err(err) => {
                    // 记录层故障对 rustls 是粘性的：定罪队首并整体进入 Failed。
                    self.status = Status::Failed;
                    if let Some(action) = self.actions.pop_front() {
                        let error = match action.kind {
                            ActionKind::Handshake => handshake_error(err),
                            _ => protocol_error(err),
                        };
                        effects.push(Effect::Finish(action.token, Err(error)));
                    }
                }
            }
        }
        effects.extend(self.cycle(engine));
        effects
    }

    /// 对端子操作失败；`error` 成为队首动作的失败负载。
    pub(crate) fn peer_failed(
        &mut self,
        error: CoreError,
        engine: &mut dyn SessionEngine,
    ) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.status = Status::Failed;
        if let Some(action) = self.actions.pop_front() {
            effects.push(Effect::Finish(action.token, Err(error)));
        }
        effects.extend(self.cycle(engine));
        effects
    }

    /// 取消指定动作。返回 `true` 表示被取消的是在途队首，
    /// 调用方应同时取消 outstanding 的对端子操作并再次 `cycle`。
    pub(crate) fn cancel(&mut self, token: OperationId) -> bool {
        let Some(pos) = self.actions.iter().position(|a| a.token == token) else {
            return false;
        };
        self.actions.remove(pos);
        if pos == 0 && matches!(self.status, Status::Sending | Status::Receiving) {
            self.status = Status::Failed;
            return true;
        }
        false
    }

    fn drain_terminal(&mut self, effects: &mut Vec<Effect>) {
        while let Some(action) = self.actions.pop_front() {
            let error = match self.status {
                Status::Closed => session_closed(),
                _ => session_failed(),
            };
            effects.push(Effect::Finish(action.token, Err(error)));
        }
    }

    /// 引擎要求交换字节：出站缓冲非空则排空，否则等待对端来料。
    fn exchange(&mut self, engine: &mut dyn SessionEngine, effects: &mut Vec<Effect>) {
        let out = engine.drain_outgoing();
        if out.is_empty() {
            self.status = Status::Receiving;
            effects.push(Effect::PeerReceive);
        } else {
            self.start_send(out, effects);
        }
    }

    fn start_send(&mut self, data: Bytes, effects: &mut Vec<Effect>) {
        self.status = Status::Sending;
        self.wire_out = data.clone();
        effects.push(Effect::PeerSend(data));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use keel_core::operation::Operation;

    /// 脚本化假引擎：按预设应答驱动状态机，并记录被调用的次数。
    struct FakeEngine {
        handshaking: bool,
        /// 每次 drain_outgoing 依次弹出的密文；耗尽后返回空。
        outgoing: VecDeque<Bytes>,
        /// 每次 read_plaintext 依次弹出的结果；耗尽后 WouldBlock。
        reads: VecDeque<PlainRead>,
        /// 每次 write_plaintext 至多吞下的字节数。
        write_quota: usize,
        fed: Vec<Bytes>,
        calls: usize,
    }

    impl FakeEngine {
        fn idle() -> Self {
            Self {
                handshaking: false,
                outgoing: VecDeque::new(),
                reads: VecDeque::new(),
                write_quota: usize::MAX,
                fed: Vec::new(),
                calls: 0,
            }
        }
    }

    impl SessionEngine for FakeEngine {
        fn drive_handshake(&mut self) -> Result<bool, EngineError> {
            self.calls += 1;
            Ok(!self.handshaking)
        }

        fn write_plaintext(&mut self, data: &[u8]) -> Result<usize, EngineError> {
            self.calls += 1;
            let accepted = data.len().min(self.write_quota);
            if accepted > 0 {
                self.outgoing.push_back(Bytes::copy_from_slice(&data[..accepted]));
            }
            Ok(accepted)
        }

        fn read_plaintext(&mut self, _max: usize) -> Result<PlainRead, EngineError> {
            self.calls += 1;
            Ok(self.reads.pop_front().unwrap_or(PlainRead::WouldBlock))
        }

        fn drain_outgoing(&mut self) -> Bytes {
            self.calls += 1;
            self.outgoing.pop_front().unwrap_or_default()
        }

        fn feed_incoming(&mut self, data: &[u8]) -> Result<(), EngineError> {
            self.calls += 1;
            self.fed.push(Bytes::copy_from_slice(data));
            self.handshaking = false;
            Ok(())
        }
    }

    fn token() -> OperationId {
        Operation::new().id()
    }

    fn finishes(effects: &[Effect]) -> Vec<OperationId> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Finish(id, _) => Some(*id),
                _ => None,
            })
            .collect()
    }

    /// 握手：先送出 ClientHello 类密文，收到应答后完成并经 Flush 收尾。
    #[test]
    fn handshake_exchanges_bytes_then_finishes() {
        let mut engine = FakeEngine::idle();
        engine.handshaking = true;
        engine.outgoing.push_back(Bytes::from_static(b"hello-flight"));
        let mut machine = Machine::new();
        let t = token();
        machine.push(Action {
            token: t,
            kind: ActionKind::Handshake,
        });

        let effects = machine.cycle(&mut engine);
        assert!(matches!(effects[..], [Effect::PeerSend(ref b)] if &b[..] == b"hello-flight"));
        assert_eq!(machine.status(), Status::Sending);

        // 整段写出后缓冲已空，转入接收等待对端应答。
        let effects = machine.peer_send_done(12, &mut engine);
        assert!(matches!(effects[..], [Effect::PeerReceive]));
        assert_eq!(machine.status(), Status::Receiving);

        // 应答到达，假引擎据此判定握手完成；Flush 无余量，动作成功了结。
        let effects = machine.peer_receive_done(b"server-flight", &mut engine);
        assert!(
            matches!(effects[..], [Effect::Finish(id, Ok(Outcome::Handshake))] if id == t),
            "握手动作应以成功了结"
        );
        assert_eq!(machine.status(), Status::Idle);
    }

    /// 同方向动作严格按入队顺序了结。
    #[test]
    fn actions_finish_in_queue_order() {
        let mut engine = FakeEngine::idle();
        let mut machine = Machine::new();
        let (t1, t2) = (token(), token());
        machine.push(Action {
            token: t1,
            kind: ActionKind::Send {
                data: Bytes::from_static(b"first"),
                written: 0,
            },
        });
        machine.push(Action {
            token: t2,
            kind: ActionKind::Send {
                data: Bytes::from_static(b"second"),
                written: 0,
            },
        });

        // 第一个动作写入引擎后转为 Flush 并送出密文。
        let effects = machine.cycle(&mut engine);
        assert!(matches!(effects[..], [Effect::PeerSend(_)]));

        // 第一段密文落地后第一个动作了结，第二个随即启动。
        let effects = machine.peer_send_done(5, &mut engine);
        assert_eq!(finishes(&effects), vec![t1]);
        assert!(
            effects.iter().any(|e| matches!(e, Effect::PeerSend(_))),
            "第二个动作应立即开始排空"
        );

        let effects = machine.peer_send_done(6, &mut engine);
        assert_eq!(finishes(&effects), vec![t2]);
        assert_eq!(machine.status(), Status::Idle);
    }

    /// 引擎分多次吞下明文时，Send 动作逐段推进直至全部写入。
    #[test]
    fn send_loops_until_engine_accepts_all() {
        let mut engine = FakeEngine::idle();
        engine.write_quota = 2;
        let mut machine = Machine::new();
        let t = token();
        machine.push(Action {
            token: t,
            kind: ActionKind::Send {
                data: Bytes::from_static(b"abcdef"),
                written: 0,
            },
        });

        // 每次吞 2 字节并立即产出对应密文；首段排空先行。
        let effects = machine.cycle(&mut engine);
        assert!(matches!(effects[..], [Effect::PeerSend(_)]));

        // 依次确认每段密文，直到 6 字节全部写入、动作以 Sent(6) 了结。
        let mut finished = None;
        for _ in 0..8 {
            let effects = machine.peer_send_done(2, &mut engine);
            if let Some(Effect::Finish(id, Ok(Outcome::Sent(n)))) = effects
                .iter()
                .find(|e| matches!(e, Effect::Finish(..)))
            {
                finished = Some((*id, *n));
                break;
            }
        }
        assert_eq!(finished, Some((t, 6)), "全部明文写入后应以总字节数了结");
    }

    /// 取消在途队首把会话推入 Failed，其余排队动作速断且不再接触引擎。
    #[test]
    fn cancelling_active_head_fails_the_rest_fast() {
        let mut engine = FakeEngine::idle();
        let mut machine = Machine::new();
        let (t1, t2, t3) = (token(), token(), token());
        machine.push(Action {
            token: t1,
            kind: ActionKind::Receive { max: 16 },
        });
        machine.push(Action {
            token: t2,
            kind: ActionKind::Receive { max: 16 },
        });
        machine.push(Action {
            token: t3,
            kind: ActionKind::Receive { max: 16 },
        });

        let effects = machine.cycle(&mut engine);
        assert!(matches!(effects[..], [Effect::PeerReceive]));
        let calls_before = engine.calls;

        assert!(machine.cancel(t1), "在途队首的取消应要求联动取消对端子操作");
        let effects = machine.cycle(&mut engine);
        assert_eq!(finishes(&effects), vec![t2, t3]);
        for effect in &effects {
            if let Effect::Finish(_, result) = effect {
                let err = result.as_ref().err().unwrap();
                assert_eq!(err.code(), crate::error::codes::TLS_FAILED);
            }
        }
        assert_eq!(engine.calls, calls_before, "终态速断不得接触引擎");
    }

    /// 排队中（非队首）动作的取消只出队，不影响会话状态。
    #[test]
    fn cancelling_queued_action_keeps_session_alive() {
        let mut engine = FakeEngine::idle();
        let mut machine = Machine::new();
        let (t1, t2) = (token(), token());
        machine.push(Action {
            token: t1,
            kind: ActionKind::Receive { max: 16 },
        });
        machine.push(Action {
            token: t2,
            kind: ActionKind::Receive { max: 16 },
        });
        machine.cycle(&mut engine);

        assert!(!machine.cancel(t2));
        assert_eq!(machine.status(), Status::Receiving);

        // 队首照常完成。
        engine.reads.push_back(PlainRead::Data(Bytes::from_static(b"pong")));
        let effects = machine.peer_receive_done(b"wire", &mut engine);
        assert_eq!(finishes(&effects), vec![t1]);
    }

    /// 对端关闭：在途接收以 0 字节成功了结，后续动作以 Closed 错误速断。
    #[test]
    fn peer_close_finishes_pending_receive_then_rejects_rest() {
        let mut engine = FakeEngine::idle();
        let mut machine = Machine::new();
        let (t1, t2) = (token(), token());
        machine.push(Action {
            token: t1,
            kind: ActionKind::Receive { max: 16 },
        });
        machine.cycle(&mut engine);

        let effects = machine.peer_receive_done(&[], &mut engine);
        assert!(
            matches!(effects[..], [Effect::Finish(id, Err(ref e))] if id == t1
                && e.code() == crate::error::codes::TLS_CLOSED),
            "对端在接收在途时关闭：动作以 Closed 终态错误了结"
        );

        machine.push(Action {
            token: t2,
            kind: ActionKind::Receive { max: 16 },
        });
        let effects = machine.cycle(&mut engine);
        assert!(
            matches!(effects[..], [Effect::Finish(id, Err(ref e))] if id == t2
                && e.code() == crate::error::codes::TLS_CLOSED)
        );
    }

    /// 引擎读出 Closed（close_notify 已消化）：当次接收以 0 字节成功。
    #[test]
    fn engine_close_notify_yields_empty_receive() {
        let mut engine = FakeEngine::idle();
        engine.reads.push_back(PlainRead::Closed);
        let mut machine = Machine::new();
        let t = token();
        machine.push(Action {
            token: t,
            kind: ActionKind::Receive { max: 16 },
        });

        let effects = machine.cycle(&mut engine);
        assert!(
            matches!(effects[..], [Effect::Finish(id, Ok(Outcome::Received(ref b)))] if id == t && b.is_empty())
        );
        assert_eq!(machine.status(), Status::Closed);
    }

    /// 对端发送部分写出：续传余量而不是重发全部。
    #[test]
    fn partial_peer_write_resends_remainder_only() {
        let mut engine = FakeEngine::idle();
        engine.outgoing.push_back(Bytes::from_static(b"0123456789"));
        let mut machine = Machine::new();
        let t = token();
        machine.push(Action {
            token: t,
            kind: ActionKind::Send {
                data: Bytes::from_static(b"x"),
                written: 1,
            },
        });

        let effects = machine.cycle(&mut engine);
        assert!(matches!(effects[..], [Effect::PeerSend(ref b)] if b.len() == 10));

        let effects = machine.peer_send_done(4, &mut engine);
        assert!(
            matches!(effects[..], [Effect::PeerSend(ref b)] if &b[..] == b"456789"),
            "部分写出后应仅续传余量"
        );
    }
}
