//! 中断交付算法的性质验证。
//!
//! # 教案级导览
//!
//! - **核心目标（Why）**：以进程内后端 [`InternalInterrupt`] 为试验台，验证
//!   交付算法对任意类别集组合都满足：命中者恰好通知一次、接收集恒等于
//!   `requested ∩ fired`、不相交者原地保留、无人等待时事件彻底丢弃；
//! - **设计手法（How）**：proptest 枚举请求集与触发集的组合，逐一与一个
//!   朴素的集合模型对照；确定性场景（广播、超时、重新武装覆盖）用普通
//!   `#[test]` 固定下来。

use std::sync::Arc;
use std::time::{Duration, Instant};

use proptest::prelude::*;

use keel_core::prelude::*;

fn set_of(kinds: &[InterruptKind]) -> InterruptKindSet {
    kinds.iter().copied().collect()
}

fn arb_kind_set() -> impl Strategy<Value = InterruptKindSet> {
    (0u8..8).prop_map(|bits| {
        let mut set = InterruptKindSet::EMPTY;
        if bits & 1 != 0 {
            set.insert(InterruptKind::Break);
        }
        if bits & 2 != 0 {
            set.insert(InterruptKind::Hangup);
        }
        if bits & 4 != 0 {
            set.insert(InterruptKind::Terminate);
        }
        set
    })
}

fn arb_nonempty_kind_set() -> impl Strategy<Value = InterruptKindSet> {
    arb_kind_set().prop_filter("请求集必须非空", |set| !set.is_empty())
}

proptest! {
    /// 对任意等待者请求集与触发集：命中者得到 `requested ∩ fired` 且被移除，
    /// 不相交者保持 pending 且接收集为空。
    #[test]
    fn delivery_matches_set_intersection(
        requests in proptest::collection::vec(arb_nonempty_kind_set(), 1..6),
        fired in arb_nonempty_kind_set(),
    ) {
        let source = InternalInterrupt::new();
        let controller = Arc::new(Controller::new());

        let waiters: Vec<_> = requests
            .iter()
            .map(|&kinds| {
                let op = InterruptOperation::with_kinds(kinds).unwrap();
                op.base().bind(&controller);
                source.wait_async(&op).unwrap();
                op
            })
            .collect();

        let expected_hits = requests
            .iter()
            .filter(|kinds| !kinds.intersection(fired).is_empty())
            .count();
        let notified = source.post(fired);
        prop_assert_eq!(notified, expected_hits, "命中数量应与集合模型一致");

        for op in &waiters {
            let hit = op.requested().intersection(fired);
            if hit.is_empty() {
                prop_assert!(op.base().is_pending(), "不相交的等待者应原地保留");
                prop_assert!(op.received().is_empty());
            } else {
                prop_assert_eq!(op.received(), hit, "接收集必须是请求与触发的交集");
                prop_assert!(
                    op.received().intersection(op.requested()) == op.received(),
                    "received ⊆ requested 不变量被破坏"
                );
                prop_assert!(
                    controller.wait_for(op.base(), Some(Duration::from_millis(100))),
                    "命中者应收到恰好一次完成"
                );
                prop_assert!(
                    !controller.revert_post(op.base().id()),
                    "不应存在第二条完成记录"
                );
            }
        }
    }
}

/// 无人等待时投递是彻底的空操作：既不滞留状态，也不影响之后的等待者。
#[test]
fn post_without_waiters_is_dropped() {
    let source = InternalInterrupt::new();
    let controller = Arc::new(Controller::new());

    assert_eq!(source.post(InterruptKindSet::all()), 0, "无人等待应零通知");

    let op = InterruptOperation::single(InterruptKind::Break);
    op.base().bind(&controller);
    source.wait_async(&op).unwrap();
    assert!(
        controller.wait_next(Some(Duration::from_millis(50))).is_none(),
        "历史事件不得补发给后到的等待者"
    );
}

/// 广播语义：同一事件满足所有请求集相交的等待者，各通知一次。
#[test]
fn single_event_satisfies_all_matching_waiters() {
    let source = InternalInterrupt::new();
    let controller = Arc::new(Controller::new());

    let first = InterruptOperation::single(InterruptKind::Terminate);
    let second = InterruptOperation::new(); // 默认构造请求全集
    let bystander = InterruptOperation::single(InterruptKind::Hangup);
    for op in [&first, &second, &bystander] {
        op.base().bind(&controller);
        source.wait_async(op).unwrap();
    }

    assert_eq!(source.post(InterruptKind::Terminate.into()), 2);
    assert_eq!(first.received(), set_of(&[InterruptKind::Terminate]));
    assert_eq!(second.received(), set_of(&[InterruptKind::Terminate]));
    assert!(bystander.received().is_empty());
    assert!(bystander.base().is_pending(), "旁观者应继续等待");
}

/// 接收集按次覆盖而非合并：重新武装后的交付不得携带历史类别。
#[test]
fn received_set_is_overwritten_per_delivery() {
    let source = InternalInterrupt::new();
    let controller = Arc::new(Controller::new());

    let op = InterruptOperation::with_kinds(set_of(&[
        InterruptKind::Break,
        InterruptKind::Terminate,
    ]))
    .unwrap();
    op.base().bind(&controller);

    source.wait_async(&op).unwrap();
    source.post(InterruptKind::Break.into());
    assert!(controller.wait_for(op.base(), Some(Duration::from_millis(100))));
    assert_eq!(op.received(), set_of(&[InterruptKind::Break]));

    // 重新武装后交付另一类别，接收集必须被整体覆盖。
    source.wait_async(&op).unwrap();
    source.post(InterruptKind::Terminate.into());
    assert!(controller.wait_for(op.base(), Some(Duration::from_millis(100))));
    assert_eq!(op.received(), set_of(&[InterruptKind::Terminate]));
}

/// 同步等待的超时路径：≈100ms 后返回空集，并通过取消清理等待者。
#[test]
fn synchronous_wait_times_out_with_empty_set() {
    let source = InternalInterrupt::new();
    let controller = Arc::new(Controller::new());

    let start = Instant::now();
    let received = source
        .wait(
            &controller,
            InterruptKind::Hangup.into(),
            Some(Duration::from_millis(100)),
        )
        .unwrap();
    let elapsed = start.elapsed();

    assert!(received.is_empty(), "超时应返回空集而非错误");
    assert!(elapsed >= Duration::from_millis(90), "不应提前返回: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(1), "不应无限阻塞: {elapsed:?}");

    // 超时取消后，事件不应再找到这个等待者。
    assert_eq!(source.post(InterruptKind::Hangup.into()), 0);
}

/// 被取消的等待者绝不会被后续事件通知。
#[test]
fn cancelled_waiter_is_never_notified() {
    let source = InternalInterrupt::new();
    let controller = Arc::new(Controller::new());

    let op = InterruptOperation::single(InterruptKind::Break);
    op.base().bind(&controller);
    source.wait_async(&op).unwrap();

    source.cancel(&op);
    source.cancel(&op); // 幂等

    assert_eq!(source.post(InterruptKind::Break.into()), 0);
    assert!(
        controller.wait_next(Some(Duration::from_millis(50))).is_none(),
        "被取消的等待者不得出现在完成队列"
    );
}

/// 等待者先于交付被调用方销毁时，清理退化为安全的空操作。
#[test]
fn dropped_waiter_is_cleaned_up_silently() {
    let source = InternalInterrupt::new();
    let controller = Arc::new(Controller::new());

    {
        let op = InterruptOperation::single(InterruptKind::Break);
        op.base().bind(&controller);
        source.wait_async(&op).unwrap();
    } // Arc 在此销毁，注册表里只剩失效的 Weak

    assert_eq!(source.post(InterruptKind::Break.into()), 0, "失效条目不应计入通知");
}
