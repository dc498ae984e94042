//! 等待上下文：取消令牌与截止时间的统一载体。
//!
//! # 设计综述（Why）
//! - 每一个可挂起的操作都同时面对“外部取消”与“到点放弃”两类中断来源，
//!   将二者收敛为一个 [`WaitContext`]，任何公共等待方法都以同一签名接收；
//! - 取消令牌除了原子位之外还维护唤醒注册表，挂起中的等待者无需轮询即可
//!   在 `cancel()` 发生时被立即唤醒。
//!
//! # 模块结构（How）
//! - [`Cancellation`]：`Arc` 共享的取消原语，首次 `cancel()` 返回 `true`；
//! - [`WaitContext`]：Builder 风格组合取消令牌与可选超时；
//! - 内部 `WakerRegistry` 以递增键管理等待者的 `Waker`，支持精确注销。

#[cfg(not(any(loom, lockstep_loom)))]
use core::sync::atomic::{AtomicBool, Ordering};
#[cfg(any(loom, lockstep_loom))]
use loom::sync::atomic::{AtomicBool, Ordering};

use core::task::Waker;
use std::sync::Arc;

use parking_lot::Mutex;

#[cfg(feature = "runtime-tokio")]
use core::time::Duration;

/// 取消原语，统一表达跨原语的可中断性契约。
///
/// # 设计背景（Why）
/// - 所有长时间挂起的等待都必须能被外部主动打断，避免资源被无意义地占用；
/// - 单纯的原子位需要等待方轮询，无法驱动基于 `Waker` 的协作式调度，
///   因此在原子位之外附加唤醒注册表，`cancel()` 会唤醒全部已登记的等待者。
///
/// # 逻辑解析（How）
/// - 内部使用 [`AtomicBool`] 表达取消状态，并通过 [`Arc`] 支持多方共享；
/// - `cancel` 在首次成功设置取消位时返回 `true`，随后立即清空并唤醒注册表；
///   重复调用返回 `false`，提示调用方避免重复执行兜底逻辑；
/// - `child` 生成共享同一原子位的派生实例，便于在不同子系统传播取消信号。
///
/// # 契约说明（What）
/// - **前置条件**：构造时无需额外参数，默认处于“未取消”状态；
/// - **后置条件**：一旦 `cancel` 成功，`is_cancelled` 全局可见，且所有在此之前
///   注册的等待者都会收到一次唤醒；在此之后的注册会立即触发唤醒。
///
/// # 设计取舍与风险（Trade-offs）
/// - 注册表由互斥锁保护，锁仅覆盖内存操作，不跨越任何 `await` 点；
/// - 未提供任意回调注册接口，唤醒语义仅限 `Waker`，避免在取消路径执行用户代码。
#[derive(Clone, Debug)]
pub struct Cancellation {
    inner: Arc<CancellationState>,
}

#[derive(Debug)]
struct CancellationState {
    flag: AtomicBool,
    wakers: Mutex<WakerRegistry>,
}

impl Cancellation {
    /// 创建处于“未取消”状态的取消令牌。
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancellationState {
                flag: AtomicBool::new(false),
                wakers: Mutex::new(WakerRegistry::default()),
            }),
        }
    }

    /// 查询当前是否已被标记取消。
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    /// 将当前令牌标记为取消，并唤醒所有已登记的等待者。
    ///
    /// 返回 `true` 表示本次调用首次触发取消；`false` 表示之前已被取消。
    pub fn cancel(&self) -> bool {
        let first = self
            .inner
            .flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            let drained = {
                let mut registry = self.inner.wakers.lock();
                registry.drain()
            };
            for waker in drained {
                waker.wake();
            }
        }
        first
    }

    /// 派生共享同一原子位的子令牌，用于跨模块传播取消语义。
    pub fn child(&self) -> Self {
        self.clone()
    }

    /// 登记或刷新等待者的 `Waker`。
    ///
    /// - **契约 (What)**：`slot` 为 `None` 时分配新注册键并写回；已持键则原地替换；
    ///   若令牌已处于取消态，立即唤醒传入的 `Waker` 而不登记。
    /// - **前置条件**：调用方必须在终态路径上调用 [`Cancellation::unregister`]，
    ///   否则注册表会累积陈旧条目。
    pub(crate) fn register(&self, slot: &mut Option<u64>, waker: &Waker) {
        if self.is_cancelled() {
            waker.wake_by_ref();
            return;
        }
        let mut registry = self.inner.wakers.lock();
        match slot {
            Some(key) => registry.replace(*key, waker),
            None => *slot = Some(registry.insert(waker.clone())),
        }
    }

    /// 注销等待者的 `Waker`，终态路径上恰好调用一次即可，多次调用安全。
    pub(crate) fn unregister(&self, slot: &mut Option<u64>) {
        if let Some(key) = slot.take() {
            self.inner.wakers.lock().remove(key);
        }
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

/// 以递增键索引的 `Waker` 注册表。
///
/// 条目数量与挂起等待者同阶，线性查找在该量级下优于引入额外索引结构。
#[derive(Debug, Default)]
struct WakerRegistry {
    next_key: u64,
    entries: Vec<(u64, Waker)>,
}

impl WakerRegistry {
    fn insert(&mut self, waker: Waker) -> u64 {
        let key = self.next_key;
        self.next_key = self.next_key.wrapping_add(1);
        self.entries.push((key, waker));
        key
    }

    fn replace(&mut self, key: u64, waker: &Waker) {
        if let Some((_, slot)) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            if !slot.will_wake(waker) {
                *slot = waker.clone();
            }
        }
    }

    fn remove(&mut self, key: u64) {
        self.entries.retain(|(k, _)| *k != key);
    }

    fn drain(&mut self) -> Vec<Waker> {
        self.entries.drain(..).map(|(_, waker)| waker).collect()
    }
}

/// 等待上下文，组合取消令牌与可选超时。
///
/// # 设计背景（Why）
/// - 统一承载“取消 + 截止”二元组，任何挂起操作以 `op_with(&ctx)` 形式接收，
///   避免每个方法重复展开两个可选参数；
/// - 上下文自身不驱动任何行为：取消由令牌推进，超时由等待期内部的计时器
///   （`runtime-tokio` 特性）落地。
///
/// # 契约说明（What）
/// - 已取消的令牌会使操作在入队前同步失败，报 [`WaitError::Cancelled`]；
/// - 零超时的语义是“仅尝试快路径”：快路径失败即报 [`WaitError::TimedOut`]；
/// - 上下文可被多个操作复用，克隆成本为一次 `Arc` 计数与一次 `Option` 复制。
///
/// [`WaitError::Cancelled`]: crate::error::WaitError::Cancelled
/// [`WaitError::TimedOut`]: crate::error::WaitError::TimedOut
#[derive(Clone, Debug, Default)]
pub struct WaitContext {
    cancellation: Option<Cancellation>,
    #[cfg(feature = "runtime-tokio")]
    timeout: Option<Duration>,
}

impl WaitContext {
    /// 创建不带取消与超时约束的上下文。
    pub fn new() -> Self {
        Self::default()
    }

    /// 附加取消令牌。
    pub fn with_cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = Some(cancellation);
        self
    }

    /// 附加超时约束；到期的等待以 [`WaitError::TimedOut`] 失败。
    ///
    /// [`WaitError::TimedOut`]: crate::error::WaitError::TimedOut
    #[cfg(feature = "runtime-tokio")]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// 获取取消令牌。
    pub fn cancellation(&self) -> Option<&Cancellation> {
        self.cancellation.as_ref()
    }

    /// 获取超时约束。
    #[cfg(feature = "runtime-tokio")]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// 上下文是否已处于取消态（无令牌视为未取消）。
    pub fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(Cancellation::is_cancelled)
    }

    /// 便捷构造：仅携带超时。
    #[cfg(feature = "runtime-tokio")]
    pub fn timeout_only(timeout: Duration) -> Self {
        Self::new().with_timeout(timeout)
    }
}

#[cfg(all(test, not(any(loom, lockstep_loom))))]
mod tests {
    use super::*;

    #[test]
    fn cancel_is_idempotent() {
        let token = Cancellation::new();
        assert!(!token.is_cancelled());
        assert!(token.cancel(), "首次取消应返回 true");
        assert!(!token.cancel(), "重复取消应返回 false");
        assert!(token.child().is_cancelled(), "子令牌共享同一取消位");
    }

    #[test]
    fn register_after_cancel_wakes_immediately() {
        let token = Cancellation::new();
        token.cancel();
        let mut slot = None;
        token.register(&mut slot, Waker::noop());
        assert!(slot.is_none(), "已取消的令牌不应保留注册项");
    }

    #[test]
    fn unregister_removes_entry() {
        let token = Cancellation::new();
        let mut slot = None;
        token.register(&mut slot, Waker::noop());
        assert!(slot.is_some());
        token.unregister(&mut slot);
        assert!(slot.is_none());
        // 再次注销必须安全。
        token.unregister(&mut slot);
    }
}
