//! 等待者状态机：带类型标签的原子状态与显式 CAS 原语。
//!
//! # 设计综述（Why）
//! - 每个等待者同时与完成、取消、超时、关闭四个竞争者赛跑，唯一的裁决点是
//!   对状态字段的比较交换：谁的 CAS 胜出，谁拥有结果，失败方必须回滚；
//! - 以显式枚举替代裸整数常量，转换合法性集中在一处校验，非法跃迁在
//!   编译期即不可表达（无法凭空构造未登记的状态值）。
//!
//! # 状态图（What）
//! ```text
//! Idle → Pending → Granted ──(结果被消费)──→ Idle
//!               → Closed  ──(结果被消费)──→ Idle
//!               → Aborted → AbortedDequeued → AbortedObserved → Idle
//! ```
//! - `Aborted`：取消/超时胜出，节点可能仍链接在等待队列中；
//! - `AbortedDequeued`：节点已脱离队列，但错误尚未被调用方观测；
//! - `AbortedObserved`：错误已被观测，节点可安全回收。
//!   三段拆分确保池化回收永远不会复用仍在队列中、或结果未被消费的节点。

#[cfg(not(any(loom, lockstep_loom)))]
use core::sync::atomic::{AtomicU8, Ordering};
#[cfg(any(loom, lockstep_loom))]
use loom::sync::atomic::{AtomicU8, Ordering};

/// 等待者生命周期的全部状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum WaitState {
    /// 处于池中或尚未武装，不参与任何竞争。
    Idle = 0,
    /// 已入队挂起，等待完成、取消、超时或关闭之一裁决。
    Pending = 1,
    /// 完成方胜出，结果已写入插槽等待消费。
    Granted = 2,
    /// 所属原语关闭，等待以关闭错误终结。
    Closed = 3,
    /// 取消/超时胜出，节点可能仍在队列中。
    Aborted = 4,
    /// 已确认脱离队列。
    AbortedDequeued = 5,
    /// 错误已被调用方观测，节点可回收。
    AbortedObserved = 6,
}

impl WaitState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => WaitState::Idle,
            1 => WaitState::Pending,
            2 => WaitState::Granted,
            3 => WaitState::Closed,
            4 => WaitState::Aborted,
            5 => WaitState::AbortedDequeued,
            _ => WaitState::AbortedObserved,
        }
    }
}

/// 对 [`WaitState`] 的原子封装，只暴露受控的转换原语。
///
/// # 契约说明（What）
/// - `transition(from, to)`：以 `AcqRel` 成功序执行比较交换，返回是否由本次调用
///   完成跃迁；失败不产生副作用，失败方据此执行各自的回滚协议；
/// - `force(to)`：无条件写入，仅限池化回收路径在独占节点时使用；
/// - 读取使用 `Acquire`，保证观测到终态时，结果插槽的写入也同时可见。
#[derive(Debug)]
pub(crate) struct AtomicWaitState(AtomicU8);

impl AtomicWaitState {
    pub(crate) fn new(state: WaitState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn load(&self) -> WaitState {
        WaitState::from_raw(self.0.load(Ordering::Acquire))
    }

    /// 尝试 `from → to` 的唯一性跃迁；返回 `true` 表示本次调用胜出。
    pub(crate) fn transition(&self, from: WaitState, to: WaitState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// 无条件写入目标状态，仅限独占节点（池化回收、重新武装）时使用。
    pub(crate) fn force(&self, to: WaitState) {
        self.0.store(to as u8, Ordering::Release);
    }
}

#[cfg(all(test, not(any(loom, lockstep_loom))))]
mod tests {
    use super::*;

    #[test]
    fn transition_is_exclusive() {
        let state = AtomicWaitState::new(WaitState::Pending);
        assert!(state.transition(WaitState::Pending, WaitState::Granted));
        // 第二个竞争者必须失败，且状态保持胜出者写入的值。
        assert!(!state.transition(WaitState::Pending, WaitState::Aborted));
        assert_eq!(state.load(), WaitState::Granted);
    }

    #[test]
    fn abort_chain_progresses_in_order() {
        let state = AtomicWaitState::new(WaitState::Pending);
        assert!(state.transition(WaitState::Pending, WaitState::Aborted));
        assert!(state.transition(WaitState::Aborted, WaitState::AbortedDequeued));
        assert!(state.transition(WaitState::AbortedDequeued, WaitState::AbortedObserved));
        // 链条不可跳跃回退。
        assert!(!state.transition(WaitState::Aborted, WaitState::AbortedDequeued));
    }
}
