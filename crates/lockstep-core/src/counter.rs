//! 异步计数器：可挂起递减的非负整数，及其“任取其一”聚合等待。
//!
//! # 设计综述（Why）
//! - 计数器是本库的资源分配内核：信号量、有界队列等原语都把“可用额度”
//!   建模为一个计数器，因此递减路径的公平性、关闭排空与回滚协议在此集中实现；
//! - 增量优先直达交接：新到的值先按 FIFO 顺序交付挂起的递减者，剩余部分
//!   才落入计数，从而避免“值已到账但等待者未被唤醒”的空转窗口。
//!
//! # 生命周期（What）
//! - `Active → Draining → Drained` 三相推进（显式标签而非哨兵值）：
//!   关闭发起后不再受理增量，剩余值仍可被取走；值降为零的瞬间进入
//!   `Drained` 并触发关闭信号；
//! - 挂起中的递减者与窥视者在关闭发起时立即以关闭错误终结。

#[cfg(not(any(loom, lockstep_loom)))]
use core::sync::atomic::{AtomicU8, AtomicU64, Ordering};
#[cfg(any(loom, lockstep_loom))]
use loom::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use core::cell::Cell;

use crate::closing::CloseSignal;
use crate::context::WaitContext;
use crate::error::{Result, WaitError};
use crate::waiter::{DEMAND_ALL, WaitQueue, WaitSite, Waiting};

#[cfg(feature = "runtime-tokio")]
use core::time::Duration;

/// 计数器生命周期的三个阶段。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum Phase {
    /// 正常受理增量与递减。
    Active = 0,
    /// 关闭已发起：拒绝增量，剩余值继续排空。
    Draining = 1,
    /// 关闭且已排空，终态。
    Drained = 2,
}

impl Phase {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Phase::Active,
            1 => Phase::Draining,
            _ => Phase::Drained,
        }
    }
}

/// 支持挂起递减的非负计数器。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 在协作式调度下表达“额度”：生产方以 [`Counter::add`] 注入，消费方以
///   [`Counter::decrement`] 族方法取走，额度不足时消费方挂起而非阻塞线程；
/// - 所有竞争（完成、取消、超时、关闭）统一在等待节点的状态比较交换上裁决，
///   计数器本体只需维护值与阶段两个原子。
///
/// ## 逻辑（How）
/// - **增量交接**：`add` 先按 FIFO 把值交给挂起的递减者（每人至多拿走其
///   声明的批量上限），剩余落入计数；随后释放全部窥视者；若窥视者消费后
///   计数仍为正且又有新的递减者排队，则回绕再分发一轮；
/// - **公平快路径**：`try_decrement*` 仅在没有排队递减者时直接走 CAS，
///   防止插队饿死先到的等待者；
/// - **关闭排空**：`close` 将阶段推进到 `Draining` 并终结全部挂起等待者；
///   剩余值仍可被同步递减取走，值归零的瞬间进入 `Drained` 并触发
///   [`Counter::closed`] 信号。
///
/// ## 契约（What）
/// - 值恒为非负；会导致溢出的增量以入参错误拒绝；
/// - 每个异步递减恰好经历一次终态转换：成功（返回取走的数量）、取消、
///   超时或关闭；
/// - 被授予但在消费前被放弃的数量会自动回流计数器，并可能唤醒下一位
///   等待者——调用方不会观测到丢失的额度。
///
/// ## 注意事项（Trade-offs）
/// - `count()` 为瞬时快照，分发回绕期间可能短暂观测到偏低的值；
/// - 公平性是尽力而为的近似：判定“是否有排队者”读取的是近似计数，
///   极端竞争下允许出现一次让位或一次插队，但不会丢失唤醒。
#[derive(Debug)]
pub struct Counter {
    value: AtomicU64,
    phase: AtomicU8,
    takers: WaitQueue<u64>,
    peekers: WaitQueue<()>,
    done: CloseSignal,
}

impl Counter {
    /// 以给定初值创建计数器。
    pub fn new(initial: u64) -> Self {
        Self {
            value: AtomicU64::new(initial),
            phase: AtomicU8::new(Phase::Active as u8),
            takers: WaitQueue::new(),
            peekers: WaitQueue::new(),
            done: CloseSignal::new(),
        }
    }

    fn phase(&self) -> Phase {
        Phase::from_raw(self.phase.load(Ordering::Acquire))
    }

    /// 当前计数快照；关闭且排空后返回 `None`。
    pub fn count(&self) -> Option<u64> {
        match self.phase() {
            Phase::Drained => None,
            _ => Some(self.value.load(Ordering::Acquire)),
        }
    }

    /// 是否已发起关闭（含已排空）。
    pub fn is_closed(&self) -> bool {
        self.phase() != Phase::Active
    }

    /// 挂起递减者数量的近似快照。
    pub fn waiting_decrements(&self) -> usize {
        self.takers.len()
    }

    /// 挂起窥视者数量的近似快照。
    pub fn waiting_peeks(&self) -> usize {
        self.peekers.len()
    }

    /// 计数加一；关闭后返回 `false`。
    pub fn try_increment(&self) -> bool {
        self.add(1).is_ok()
    }

    /// 计数加一，等价于 `add(1)`。
    pub fn increment(&self) -> Result<()> {
        self.add(1)
    }

    /// 注入 `amount` 个额度。
    ///
    /// ## 契约（What）
    /// - 关闭发起后拒绝，报 [`WaitError::Closed`]；
    /// - 会使计数溢出的增量报 [`WaitError::InvalidArgument`]；
    /// - 交付顺序：先按 FIFO 交给挂起递减者，剩余入账，再释放窥视者。
    pub fn add(&self, amount: u64) -> Result<()> {
        if amount == 0 {
            return Ok(());
        }
        if self.phase() != Phase::Active {
            return Err(WaitError::Closed);
        }
        if self.value.load(Ordering::Acquire).checked_add(amount).is_none() {
            return Err(WaitError::invalid_argument(
                "increment would overflow the counter",
            ));
        }
        self.distribute(amount);
        Ok(())
    }

    /// 增量分发回路：交接 → 入账 → 释放窥视者 → 必要时回绕。
    fn distribute(&self, amount: u64) {
        let mut amount = amount;
        loop {
            amount = self.feed_takers(amount);
            if amount > 0 {
                self.deposit(amount);
                amount = 0;
            }
            if self.value.load(Ordering::Acquire) > 0 {
                self.peekers.grant_all(|| ());
                // 窥视者释放期间可能有新的递减者排队；把余值抽回重新交接。
                if !self.takers.is_empty() {
                    let withdrawn = self.value.swap(0, Ordering::AcqRel);
                    if withdrawn > 0 {
                        amount = withdrawn;
                        continue;
                    }
                }
            }
            break;
        }
        self.settle_drain();
    }

    /// 按 FIFO 交接给挂起递减者；返回未能交付的余量。
    fn feed_takers(&self, amount: u64) -> u64 {
        if amount == 0 {
            return 0;
        }
        let remaining = Cell::new(amount);
        self.takers.grant_while(
            |node| {
                let available = remaining.get();
                if available == 0 {
                    return None;
                }
                let demand = node.demand();
                let grant = if demand == DEMAND_ALL {
                    available
                } else {
                    demand.min(available)
                };
                remaining.set(available - grant);
                Some(grant)
            },
            |returned| remaining.set(remaining.get() + returned),
        );
        remaining.get()
    }

    fn deposit(&self, amount: u64) {
        let mut current = self.value.load(Ordering::Acquire);
        loop {
            let next = current.saturating_add(amount);
            match self
                .value
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// 以 CAS 取走至多 `max` 个额度；返回实际取走数量。
    fn try_withdraw(&self, max: u64) -> u64 {
        let mut current = self.value.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return 0;
            }
            let take = if max == DEMAND_ALL { current } else { max.min(current) };
            match self.value.compare_exchange(
                current,
                current - take,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.settle_drain();
                    return take;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// 排空判定：关闭中且值归零时推进到终态并触发关闭信号。
    fn settle_drain(&self) {
        if self.phase() == Phase::Draining
            && self.value.load(Ordering::Acquire) == 0
            && self
                .phase
                .compare_exchange(
                    Phase::Draining as u8,
                    Phase::Drained as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
        {
            self.done.complete();
        }
    }

    /// 同步递减一个额度；计数为零或有排队者时返回 `false`。
    pub fn try_decrement(&self) -> bool {
        self.try_decrement_up_to(1) == 1
    }

    /// 同步批量递减，至多 `max` 个；无法取得任何额度时返回 0。
    ///
    /// 为保持 FIFO 公平，存在排队递减者时快路径直接让位。
    pub fn try_decrement_up_to(&self, max: u64) -> u64 {
        if max == 0 || !self.takers.is_empty() {
            return 0;
        }
        self.try_withdraw(max)
    }

    /// 同步取走全部可用额度。
    pub fn try_decrement_all(&self) -> u64 {
        if !self.takers.is_empty() {
            return 0;
        }
        self.try_withdraw(DEMAND_ALL)
    }

    /// 异步递减一个额度。
    pub async fn decrement(&self) -> Result<u64> {
        self.acquire(1, &WaitContext::new()).await
    }

    /// 携带上下文的异步递减。
    pub async fn decrement_with(&self, ctx: &WaitContext) -> Result<u64> {
        self.acquire(1, ctx).await
    }

    /// 异步批量递减，不带上下文约束。
    pub async fn decrement_up_to(&self, max: u64) -> Result<u64> {
        self.decrement_up_to_with(max, &WaitContext::new()).await
    }

    /// 异步取走全部可用额度，不带上下文约束。
    pub async fn decrement_all(&self) -> Result<u64> {
        self.decrement_all_with(&WaitContext::new()).await
    }

    /// 异步批量递减：一次取走 1 到 `max` 个额度。
    ///
    /// `max` 为零属入参错误；有值可取时至少取得 1。
    pub async fn decrement_up_to_with(&self, max: u64, ctx: &WaitContext) -> Result<u64> {
        if max == 0 {
            return Err(WaitError::invalid_argument(
                "batch decrement requires max >= 1",
            ));
        }
        self.acquire(max, ctx).await
    }

    /// 异步取走全部可用额度；无值时挂起，到值后至少取得 1。
    pub async fn decrement_all_with(&self, ctx: &WaitContext) -> Result<u64> {
        self.acquire(DEMAND_ALL, ctx).await
    }

    /// 定时便捷递减：超时翻译为 `Ok(None)`，真实取消与关闭原样上抛。
    #[cfg(feature = "runtime-tokio")]
    pub async fn decrement_for(&self, timeout: Duration) -> Result<Option<u64>> {
        match self.acquire(1, &WaitContext::timeout_only(timeout)).await {
            Ok(taken) => Ok(Some(taken)),
            Err(WaitError::TimedOut) => Ok(None),
            Err(other) => Err(other),
        }
    }

    async fn acquire(&self, demand: u64, ctx: &WaitContext) -> Result<u64> {
        // 快路径：无排队者时直接 CAS 取值。
        if self.takers.is_empty() {
            let taken = self.try_withdraw(demand);
            if taken > 0 {
                return Ok(taken);
            }
        }
        if self.phase() != Phase::Active {
            // 关闭中：剩余值只从快路径排空，不再受理新的挂起。
            let taken = self.try_withdraw(demand);
            return if taken > 0 { Ok(taken) } else { Err(WaitError::Closed) };
        }
        if ctx.is_cancelled() {
            return Err(WaitError::Cancelled);
        }
        let node = self.takers.acquire_node(demand);
        self.takers.push(node.clone());
        // 入队后复查：值可能在快路径与入队之间到达，关闭也可能已发生。
        self.replenish();
        if self.phase() != Phase::Active {
            self.takers.close_all();
        }
        Waiting::new(TakeSite(self), node, ctx).await
    }

    /// 把账上余值抽回并重新交接给排队者，堵住入队前后的丢失唤醒窗口。
    fn replenish(&self) {
        if self.takers.is_empty() {
            return;
        }
        let withdrawn = self.value.swap(0, Ordering::AcqRel);
        if withdrawn > 0 {
            self.distribute(withdrawn);
        }
    }

    /// 同步窥视：当前是否有额度可取。
    pub fn try_peek(&self) -> bool {
        self.value.load(Ordering::Acquire) > 0
    }

    /// 异步窥视：在“递减此刻会成功”时解析，不消费额度。
    pub async fn peek(&self) -> Result<()> {
        self.peek_with(&WaitContext::new()).await
    }

    /// 携带上下文的异步窥视。
    ///
    /// 每次增量都会释放全部窥视者；抢额度失败的窥视方应重新附加。
    pub async fn peek_with(&self, ctx: &WaitContext) -> Result<()> {
        if self.try_peek() {
            return Ok(());
        }
        if self.phase() != Phase::Active {
            return Err(WaitError::Closed);
        }
        if ctx.is_cancelled() {
            return Err(WaitError::Cancelled);
        }
        let node = self.peekers.acquire_node(0);
        self.peekers.push(node.clone());
        if self.try_peek() {
            self.peekers.grant_all(|| ());
        }
        if self.phase() != Phase::Active {
            self.peekers.close_all();
        }
        Waiting::new(PeekSite(self), node, ctx).await
    }

    /// 发起关闭：拒绝新增量，终结挂起等待者，剩余值继续排空。
    ///
    /// 返回 `true` 表示本次调用发起了关闭；幂等。
    pub fn close(&self) -> bool {
        if self
            .phase
            .compare_exchange(
                Phase::Active as u8,
                Phase::Draining as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }
        tracing::debug!(target: "lockstep::counter", "counter close initiated");
        self.takers.close_all();
        self.peekers.close_all();
        self.settle_drain();
        true
    }

    /// 等待关闭完成：关闭已发起且值降为零后解析。
    pub async fn closed(&self) {
        self.done.wait().await
    }

    /// 聚合递减：在第一个可递减成功的计数器上恰好消费一个额度。
    ///
    /// # 教案式注释
    ///
    /// ## 意图（Why）
    /// - 调用方需要同时守望多个计数器，任意一个出值即取——例如从多条队列
    ///   中取走最先就绪的元素；
    /// - 通过“窥视-抢占-重试”协议保证至多消费一个额度：窥视不消费，
    ///   真正的消费仍走带公平让位的同步快路径，抢占失败则重新附加。
    ///
    /// ## 契约（What）
    /// - 成功返回胜出计数器的下标，且恰好从该计数器取走 1 个额度；
    /// - 全部候选都已关闭时报 [`WaitError::AllClosed`]；
    /// - 取消与超时原样上抛；超时覆盖整个聚合等待而非单次附加。
    pub async fn decrement_any(counters: &[&Counter], ctx: &WaitContext) -> Result<usize> {
        if counters.is_empty() {
            return Err(WaitError::invalid_argument(
                "decrement_any requires at least one counter",
            ));
        }
        #[cfg(feature = "runtime-tokio")]
        if let Some(timeout) = ctx.timeout() {
            let inner = match ctx.cancellation() {
                Some(token) => WaitContext::new().with_cancellation(token.clone()),
                None => WaitContext::new(),
            };
            return match tokio::time::timeout(timeout, Self::decrement_any_inner(counters, &inner))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(WaitError::TimedOut),
            };
        }
        Self::decrement_any_inner(counters, ctx).await
    }

    async fn decrement_any_inner(counters: &[&Counter], ctx: &WaitContext) -> Result<usize> {
        let mut open = vec![true; counters.len()];
        loop {
            for (index, counter) in counters.iter().enumerate() {
                if open[index] && counter.try_decrement() {
                    return Ok(index);
                }
            }
            let mut peeks = Vec::new();
            for (index, counter) in counters.iter().enumerate() {
                if open[index] {
                    peeks.push(Box::pin(async move { (index, counter.peek_with(ctx).await) }));
                }
            }
            if peeks.is_empty() {
                return Err(WaitError::AllClosed);
            }
            let ((index, outcome), _, rest) = futures_util::future::select_all(peeks).await;
            // 落选的窥视立即析构并注销各自的登记。
            drop(rest);
            match outcome {
                Ok(()) => {
                    if counters[index].try_decrement() {
                        return Ok(index);
                    }
                    // 额度被他人抢先：让出执行权后重新附加，
                    // 避免在单线程执行器上挤占真正的消费任务。
                    yield_once().await;
                }
                Err(WaitError::Closed) => open[index] = false,
                Err(other) => return Err(other),
            }
        }
    }
}

/// 单次让出执行权；不依赖具体运行时。
fn yield_once() -> impl core::future::Future<Output = ()> {
    let mut yielded = false;
    core::future::poll_fn(move |cx| {
        if yielded {
            core::task::Poll::Ready(())
        } else {
            yielded = true;
            cx.waker().wake_by_ref();
            core::task::Poll::Pending
        }
    })
}

/// 递减等待的落点。
struct TakeSite<'a>(&'a Counter);

impl WaitSite for TakeSite<'_> {
    type Output = u64;

    fn queue(&self) -> &WaitQueue<u64> {
        &self.0.takers
    }

    fn reclaim(&self, value: u64) {
        // 已排空的计数器不再回流：被放弃的额度等价于已消费。
        if self.0.phase() == Phase::Drained {
            return;
        }
        self.0.distribute(value);
    }
}

/// 窥视等待的落点；窥视不持有资源，无需回收。
struct PeekSite<'a>(&'a Counter);

impl WaitSite for PeekSite<'_> {
    type Output = ();

    fn queue(&self) -> &WaitQueue<()> {
        &self.0.peekers
    }

    fn reclaim(&self, _: ()) {}
}

#[cfg(all(test, not(any(loom, lockstep_loom))))]
mod tests {
    use super::*;
    use futures::executor::block_on;

    #[test]
    fn balance_holds_for_mixed_operations() {
        let counter = Counter::new(2);
        assert!(counter.add(3).is_ok());
        assert!(counter.try_decrement());
        assert_eq!(counter.try_decrement_up_to(10), 4);
        assert_eq!(counter.count(), Some(0));
        assert!(!counter.try_decrement());
    }

    #[test]
    fn batch_decrement_takes_at_least_one() {
        let counter = Counter::new(3);
        let taken = block_on(counter.decrement_up_to_with(10, &WaitContext::new()))
            .expect("有值可取时批量递减必须成功");
        assert_eq!(taken, 3);
    }

    #[test]
    fn zero_batch_is_rejected() {
        let counter = Counter::new(1);
        let result = block_on(counter.decrement_up_to_with(0, &WaitContext::new()));
        assert!(matches!(result, Err(WaitError::InvalidArgument { .. })));
    }

    #[test]
    fn add_hands_value_to_queued_taker_first() {
        let counter = Counter::new(0);
        let ctx = WaitContext::new();
        let mut wait = Box::pin(counter.decrement_with(&ctx));
        // 先驱动一次使其入队。
        assert!(
            futures::FutureExt::now_or_never(wait.as_mut()).is_none(),
            "零值计数器上的递减必须先挂起"
        );
        assert!(counter.add(1).is_ok());
        assert_eq!(block_on(wait), Ok(1));
        assert_eq!(counter.count(), Some(0), "交接不应经过计数入账");
    }

    #[test]
    fn close_rejects_add_and_drains_value() {
        let counter = Counter::new(2);
        assert!(counter.close());
        assert!(!counter.close(), "关闭幂等");
        assert_eq!(counter.add(1), Err(WaitError::Closed));
        assert!(counter.try_decrement());
        assert!(counter.try_decrement());
        assert_eq!(counter.count(), None, "排空后计数进入终态");
        block_on(counter.closed());
    }

    #[test]
    fn pending_waiters_fail_on_close() {
        let counter = Counter::new(0);
        let ctx = WaitContext::new();
        let mut wait = Box::pin(counter.decrement_with(&ctx));
        assert!(futures::FutureExt::now_or_never(wait.as_mut()).is_none());
        counter.close();
        assert_eq!(block_on(wait), Err(WaitError::Closed));
    }

    #[test]
    fn peek_does_not_consume() {
        let counter = Counter::new(1);
        assert!(counter.try_peek());
        assert!(block_on(counter.peek()).is_ok());
        assert_eq!(counter.count(), Some(1));
    }
}
