//! 等待节点：单次等待的完成源、版本计数与唤醒载体。

#[cfg(not(any(loom, lockstep_loom)))]
use core::sync::atomic::{AtomicU64, Ordering};
#[cfg(any(loom, lockstep_loom))]
use loom::sync::atomic::{AtomicU64, Ordering};

use futures_util::task::AtomicWaker;
use parking_lot::Mutex;

use super::state::{AtomicWaitState, WaitState};

/// 批量需求的“取走全部”标记，仅在节点内部编码使用，公共 API 以方法名区分语义。
pub(crate) const DEMAND_ALL: u64 = u64::MAX;

/// 单个挂起等待的节点。
///
/// # 设计背景（Why）
/// - 节点是完成方与中断方之间唯一的交接面：结果写入、状态裁决、唤醒三步
///   都发生在节点上，队列只负责排序与定位；
/// - 节点可被池化复用，版本号单调递增，任何持有旧版本的句柄都能在操作时
///   被识别为复用违规。
///
/// # 交付协议（How）
/// 1. 授予方先把值写入插槽，再尝试 `Pending → Granted` 的跃迁；
/// 2. 跃迁成功则唤醒等待者；失败说明中断方已胜出，授予方把值取回并自行回滚；
/// 3. 等待者观测到 `Granted` 后从插槽消费值——`Acquire` 读序保证插槽内容可见。
///
/// # 契约说明（What）
/// - 插槽互斥锁只覆盖内存操作，永不跨越 `await`；
/// - 同一时刻最多只有一个授予方操作插槽（授予方必须先从队列弹出节点）；
/// - `demand` 为原语自定义的需求提示（计数器用它承载批量上限），对节点本身透明。
#[derive(Debug)]
pub(crate) struct WaitNode<T> {
    state: AtomicWaitState,
    version: AtomicU64,
    demand: AtomicU64,
    waker: AtomicWaker,
    slot: Mutex<Option<T>>,
}

impl<T> WaitNode<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicWaitState::new(WaitState::Idle),
            version: AtomicU64::new(0),
            demand: AtomicU64::new(0),
            waker: AtomicWaker::new(),
            slot: Mutex::new(None),
        }
    }

    pub(crate) fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub(crate) fn demand(&self) -> u64 {
        self.demand.load(Ordering::Acquire)
    }

    pub(crate) fn state(&self) -> WaitState {
        self.state.load()
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.state.load() == WaitState::Pending
    }

    /// 为一次新的等待武装节点：递增版本、清空插槽、进入 `Pending`。
    ///
    /// 仅允许在独占节点（新建或池中复用）时调用。
    pub(crate) fn arm(&self, demand: u64) {
        self.version.fetch_add(1, Ordering::AcqRel);
        self.demand.store(demand, Ordering::Release);
        *self.slot.lock() = None;
        self.state.force(WaitState::Pending);
    }

    /// 登记等待者的唤醒器；可在每次轮询时重复调用。
    pub(crate) fn register_waker(&self, waker: &core::task::Waker) {
        self.waker.register(waker);
    }

    /// 授予路径：写值、跃迁、唤醒。失败时返还值，由调用方回滚。
    pub(crate) fn grant(&self, value: T) -> Result<(), T> {
        *self.slot.lock() = Some(value);
        if self.state.transition(WaitState::Pending, WaitState::Granted) {
            self.waker.wake();
            Ok(())
        } else {
            // 中断方已胜出；取回已写入的值交还授予方。
            match self.slot.lock().take() {
                Some(value) => Err(value),
                // 不可达：插槽由唯一授予方独占写入。
                None => Ok(()),
            }
        }
    }

    /// 关闭路径：以关闭事实终结等待者。返回是否由本次调用终结。
    pub(crate) fn close(&self) -> bool {
        if self.state.transition(WaitState::Pending, WaitState::Closed) {
            self.waker.wake();
            true
        } else {
            false
        }
    }

    /// 中断路径第一步：尝试夺取裁决权。
    pub(crate) fn abort(&self) -> bool {
        self.state.transition(WaitState::Pending, WaitState::Aborted)
    }

    /// 中断路径第二步：确认节点已脱离队列（无论由谁摘除）。
    pub(crate) fn mark_dequeued(&self) {
        let _ = self
            .state
            .transition(WaitState::Aborted, WaitState::AbortedDequeued);
    }

    /// 中断路径第三步：错误已被调用方观测，节点可回收。
    pub(crate) fn mark_observed(&self) {
        let _ = self
            .state
            .transition(WaitState::AbortedDequeued, WaitState::AbortedObserved);
    }

    /// 消费已授予的值。
    pub(crate) fn take_granted(&self) -> Option<T> {
        self.slot.lock().take()
    }

    /// 池化回收：清空痕迹并回到 `Idle`。仅限独占节点时调用。
    pub(crate) fn recycle(&self) {
        *self.slot.lock() = None;
        self.state.force(WaitState::Idle);
    }
}

impl<T> Drop for WaitNode<T> {
    fn drop(&mut self) {
        // 挂起状态下被析构意味着等待句柄被泄漏：对应的等待者再也不会被唤醒。
        if self.state.load() == WaitState::Pending {
            tracing::warn!(
                target: "lockstep::waiter",
                version = self.version.load(Ordering::Relaxed),
                "wait node dropped while still pending; a waiter handle was leaked"
            );
        }
    }
}

#[cfg(all(test, not(any(loom, lockstep_loom))))]
mod tests {
    use super::*;

    #[test]
    fn grant_loses_to_abort_and_returns_value() {
        let node = WaitNode::<u64>::new();
        node.arm(1);
        assert!(node.abort(), "中断方先行，必须夺取裁决权");
        match node.grant(7) {
            Err(value) => assert_eq!(value, 7, "授予失败必须原样返还值"),
            Ok(()) => panic!("授予不应在中断后成功"),
        }
        assert_eq!(node.state(), WaitState::Aborted);
    }

    #[test]
    fn abort_loses_to_grant() {
        let node = WaitNode::<u64>::new();
        node.arm(1);
        assert!(node.grant(3).is_ok());
        assert!(!node.abort(), "完成优先：随后的中断必须被丢弃");
        assert_eq!(node.take_granted(), Some(3));
    }

    #[test]
    fn arm_bumps_version() {
        let node = WaitNode::<()>::new();
        let before = node.version();
        node.arm(DEMAND_ALL);
        assert_eq!(node.version(), before + 1);
        assert_eq!(node.demand(), DEMAND_ALL);
        assert!(node.is_pending());
    }
}
