//! 有界生产者/消费者队列：两个计数器加一个受保护容器的组合。
//!
//! # 设计综述（Why）
//! - 队列把“有元素可取”与“有空位可写”分别建模为 `used` 与 `free` 两个
//!   [`Counter`]：挂起、公平性、关闭排空与取消回滚全部复用计数器的协议，
//!   容器本身只承担元素存放；
//! - 发布（push + `used.add`）在容器锁内完成，与完成添加的封口操作互斥，
//!   由此保证“成功取得一个额度必然兑换到一个元素”，消费侧无需真正自旋。
//!
//! # 不变量（What）
//! - 任何时刻 `used.count ≤ 容器长度 ≤ 容量`；静止时 `free + used = 容量`；
//! - 成功入队的元素恰好被一次成功出队返回（多重集相等），不丢失、不重复；
//! - 计数器与容器出现不可恢复偏差时置 `faulted`，此后所有操作以
//!   [`WaitError::Faulted`] 失败。

#[cfg(not(any(loom, lockstep_loom)))]
use core::sync::atomic::{AtomicBool, Ordering};
#[cfg(any(loom, lockstep_loom))]
use loom::sync::atomic::{AtomicBool, Ordering};

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::context::WaitContext;
use crate::counter::Counter;
use crate::error::{AddRejected, BulkAddRejected, Result, WaitError};

#[cfg(feature = "runtime-tokio")]
use core::time::Duration;

/// 兑换元素时的防御性重试上限；正常协议下首次尝试即命中。
const REDEEM_ATTEMPTS: usize = 64;

/// 有界（或无界）异步生产者/消费者队列。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 为生产者与消费者提供可挂起的 `add`/`take` 通道：容量耗尽时生产者挂起，
///   队列为空时消费者挂起，均可取消、可超时；
/// - “完成添加”语义允许生产侧宣告不再有新元素：消费者排空剩余元素后
///   以关闭错误终止，适合批处理收尾。
///
/// ## 逻辑（How）
/// - `add`：先向 `free` 申请一个空位（有界时），随后在容器锁内发布
///   （push + `used.add`）；完成添加与发布互斥，竞争失败的发布会在锁内
///   撤回自己的元素并把它交还调用方；
/// - `take`：先从 `used` 取得一个额度，再从容器兑换元素并归还空位；
///   发布协议保证兑换必然命中，剩余的重试仅作防御，持续落空即判定损坏；
/// - `take_from_any`：复用计数器的聚合递减，额度到手即元素到手，
///   不存在“赢了额度输了元素”的二次竞争。
///
/// ## 契约（What）
/// - 容量至少为 1；容量为 1 时即为一次一件的交接通道；
/// - 单生产者/单消费者对之间保持 FIFO；并发生产者之间只承诺
///   逐对最终有序；
/// - 被取消的挂起 `add` 不留痕迹；已发布的元素永不撤销。
#[derive(Debug)]
pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    used: Counter,
    free: Option<Counter>,
    capacity: Option<u64>,
    completing: AtomicBool,
    faulted: AtomicBool,
}

impl<T> BoundedQueue<T> {
    /// 创建容量受限的队列；容量为零属入参错误。
    pub fn bounded(capacity: u64) -> Result<Self> {
        if capacity == 0 {
            return Err(WaitError::invalid_argument("capacity must be at least 1"));
        }
        Ok(Self {
            items: Mutex::new(VecDeque::new()),
            used: Counter::new(0),
            free: Some(Counter::new(capacity)),
            capacity: Some(capacity),
            completing: AtomicBool::new(false),
            faulted: AtomicBool::new(false),
        })
    }

    /// 创建无容量上限的队列。
    pub fn unbounded() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            used: Counter::new(0),
            free: None,
            capacity: None,
            completing: AtomicBool::new(false),
            faulted: AtomicBool::new(false),
        }
    }

    /// 配置的容量；无界队列返回 `None`。
    pub fn capacity(&self) -> Option<u64> {
        self.capacity
    }

    /// 剩余空位数的瞬时快照；无界队列或空位计数已排空时返回 `None`。
    pub fn available_capacity(&self) -> Option<u64> {
        self.free.as_ref().and_then(Counter::count)
    }

    /// 可取元素额度的瞬时快照；完成且排空后返回 `None`。
    pub fn available_items(&self) -> Option<u64> {
        self.used.count()
    }

    /// 容器内元素数量的瞬时快照。
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// 容器当前是否为空（瞬时快照）。
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// 是否已宣告完成添加。
    pub fn is_completed(&self) -> bool {
        self.completing.load(Ordering::Acquire)
    }

    /// 是否已判定损坏。
    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::Acquire)
    }

    fn fault(&self) {
        if self
            .faulted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::error!(
                target: "lockstep::queue",
                "queue accounting diverged from its container; marking faulted"
            );
        }
    }

    fn guard_fault(&self) -> Result<()> {
        if self.is_faulted() {
            Err(WaitError::Faulted)
        } else {
            Ok(())
        }
    }

    /// 发布一个元素：push 与 `used.add` 在容器锁内原子完成。
    ///
    /// 完成添加与发布互斥；竞争失败时元素原样返还。
    fn publish(&self, item: T) -> core::result::Result<(), (T, WaitError)> {
        let mut items = self.items.lock();
        match self.used.add(1) {
            Ok(()) => {
                items.push_back(item);
                Ok(())
            }
            Err(error) => Err((item, error)),
        }
    }

    /// 同步入队：无空位时立即返还元素。
    pub fn try_add(&self, item: T) -> core::result::Result<(), AddRejected<T>> {
        if self.is_faulted() {
            return Err(AddRejected::because(item, WaitError::Faulted));
        }
        if let Some(free) = &self.free {
            if !free.try_decrement() {
                return Err(if free.is_closed() {
                    AddRejected::because(item, WaitError::Closed)
                } else {
                    AddRejected::full(item)
                });
            }
        } else if self.is_completed() {
            return Err(AddRejected::because(item, WaitError::Closed));
        }
        self.publish(item)
            .map_err(|(item, error)| AddRejected::because(item, error))
    }

    /// 异步入队。
    pub async fn add(&self, item: T) -> core::result::Result<(), AddRejected<T>> {
        self.add_with(item, &WaitContext::new()).await
    }

    /// 携带上下文的异步入队；拒绝时元素原样返还。
    pub async fn add_with(
        &self,
        item: T,
        ctx: &WaitContext,
    ) -> core::result::Result<(), AddRejected<T>> {
        if self.is_faulted() {
            return Err(AddRejected::because(item, WaitError::Faulted));
        }
        if let Some(free) = &self.free {
            if let Err(error) = free.decrement_with(ctx).await {
                return Err(AddRejected::because(item, error));
            }
        } else if self.is_completed() {
            return Err(AddRejected::because(item, WaitError::Closed));
        }
        self.publish(item)
            .map_err(|(item, error)| AddRejected::because(item, error))
    }

    /// 批量入队：先整批预约空位，再逐个发布。
    ///
    /// ## 契约（What）
    /// - 预约阶段可被取消/超时，未消费的预约会如数归还；
    /// - 预约完成后的发布不含挂起点，要么全部入队，要么在完成添加竞争下
    ///   返还未发布的尾部（已发布元素保留）。
    pub async fn add_many_with(
        &self,
        items: Vec<T>,
        ctx: &WaitContext,
    ) -> core::result::Result<(), BulkAddRejected<T>> {
        if items.is_empty() {
            return Ok(());
        }
        if self.is_faulted() {
            return Err(BulkAddRejected {
                remaining: items,
                reason: WaitError::Faulted,
            });
        }
        let total = items.len() as u64;
        if let Some(free) = &self.free {
            let mut reserved = 0u64;
            while reserved < total {
                match free.decrement_up_to_with(total - reserved, ctx).await {
                    Ok(taken) => reserved += taken,
                    Err(error) => {
                        // 归还已持有的预约；关闭竞态下的归还失败是无害的。
                        let _ = free.add(reserved);
                        return Err(BulkAddRejected {
                            remaining: items,
                            reason: error,
                        });
                    }
                }
            }
        } else if self.is_completed() {
            return Err(BulkAddRejected {
                remaining: items,
                reason: WaitError::Closed,
            });
        }
        let mut pending = items.into_iter();
        while let Some(item) = pending.next() {
            if let Err((item, error)) = self.publish(item) {
                let mut remaining = vec![item];
                remaining.extend(pending);
                return Err(BulkAddRejected {
                    remaining,
                    reason: error,
                });
            }
        }
        Ok(())
    }

    /// 批量入队，不带上下文约束。
    pub async fn add_many(&self, items: Vec<T>) -> core::result::Result<(), BulkAddRejected<T>> {
        self.add_many_with(items, &WaitContext::new()).await
    }

    /// 同步入队收尾元素并宣告完成添加；无空位时立即返还。
    pub fn try_add_complete(&self, item: T) -> core::result::Result<(), AddRejected<T>> {
        if self.is_faulted() {
            return Err(AddRejected::because(item, WaitError::Faulted));
        }
        if let Some(free) = &self.free {
            if !free.try_decrement() {
                return Err(if free.is_closed() {
                    AddRejected::because(item, WaitError::Closed)
                } else {
                    AddRejected::full(item)
                });
            }
        }
        if self
            .completing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(AddRejected::because(item, WaitError::Closed));
        }
        let outcome = self.publish(item);
        self.seal();
        outcome.map_err(|(item, error)| AddRejected::because(item, error))
    }

    /// 入队最后一个元素并宣告完成添加。
    ///
    /// 恰好一个调用方能够成为完成者；竞争失败的调用以关闭原因返还元素。
    pub async fn add_complete_with(
        &self,
        item: T,
        ctx: &WaitContext,
    ) -> core::result::Result<(), AddRejected<T>> {
        if self.is_faulted() {
            return Err(AddRejected::because(item, WaitError::Faulted));
        }
        if let Some(free) = &self.free {
            if let Err(error) = free.decrement_with(ctx).await {
                return Err(AddRejected::because(item, error));
            }
        }
        if self
            .completing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // 另一个完成者已胜出；持有的空位随 free 的关闭一并作废。
            return Err(AddRejected::because(item, WaitError::Closed));
        }
        // 封口职责归属本调用方：发布发生在 used 关闭之前。
        let outcome = self.publish(item);
        self.seal();
        outcome.map_err(|(item, error)| AddRejected::because(item, error))
    }

    /// 宣告完成添加：挂起的生产者失败，消费者排空剩余元素后终止。
    ///
    /// 返回 `true` 表示本次调用完成了宣告；幂等。
    pub fn complete_adding(&self) -> bool {
        if self
            .completing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.seal();
        true
    }

    /// 封口：关闭 `free` 拒绝新生产者，再与在途发布互斥地关闭 `used`。
    fn seal(&self) {
        if let Some(free) = &self.free {
            free.close();
        }
        let guard = self.items.lock();
        self.used.close();
        drop(guard);
    }

    /// 等待“完成添加且已排空”。
    pub async fn closed(&self) {
        self.used.closed().await
    }

    /// 用一个已取得的 `used` 额度兑换元素，并归还空位。
    fn redeem(&self) -> Result<T> {
        for _ in 0..REDEEM_ATTEMPTS {
            let popped = self.items.lock().pop_front();
            if let Some(item) = popped {
                if let Some(free) = &self.free {
                    // 完成添加后空位计数已关闭，归还失败无害。
                    let _ = free.add(1);
                }
                return Ok(item);
            }
            if self.is_faulted() {
                return Err(WaitError::Faulted);
            }
            std::thread::yield_now();
        }
        self.fault();
        Err(WaitError::Faulted)
    }

    /// 同步出队：`Ok(None)` 表示当前无元素。
    pub fn try_take(&self) -> Result<Option<T>> {
        self.guard_fault()?;
        if !self.used.try_decrement() {
            return if self.used.count().is_none() {
                Err(WaitError::Closed)
            } else {
                Ok(None)
            };
        }
        self.redeem().map(Some)
    }

    /// 异步出队。
    pub async fn take(&self) -> Result<T> {
        self.take_with(&WaitContext::new()).await
    }

    /// 携带上下文的异步出队。
    pub async fn take_with(&self, ctx: &WaitContext) -> Result<T> {
        self.guard_fault()?;
        self.used.decrement_with(ctx).await?;
        self.redeem()
    }

    /// 定时便捷出队：超时翻译为 `Ok(None)`。
    #[cfg(feature = "runtime-tokio")]
    pub async fn take_for(&self, timeout: Duration) -> Result<Option<T>> {
        match self.take_with(&WaitContext::timeout_only(timeout)).await {
            Ok(item) => Ok(Some(item)),
            Err(WaitError::TimedOut) => Ok(None),
            Err(other) => Err(other),
        }
    }

    /// 同步窥视：当前是否有元素可取。
    pub fn try_peek(&self) -> bool {
        self.used.try_peek()
    }

    /// 异步窥视，不带上下文约束。
    pub async fn peek(&self) -> Result<()> {
        self.peek_with(&WaitContext::new()).await
    }

    /// 异步窥视：在“出队此刻会成功”时解析，不消费元素。
    pub async fn peek_with(&self, ctx: &WaitContext) -> Result<()> {
        self.guard_fault()?;
        self.used.peek_with(ctx).await
    }

    /// 消费流：持续出队直到排空终止或上下文中断。
    pub fn consume(&self) -> impl futures_util::Stream<Item = T> + '_ {
        self.consume_with(WaitContext::new())
    }

    /// 携带上下文的消费流。
    ///
    /// 流在队列“完成添加且排空”或上下文取消/超时后结束；错误不向流内
    /// 透出，需要区分终止原因的调用方应直接使用 [`BoundedQueue::take_with`]。
    pub fn consume_with(&self, ctx: WaitContext) -> impl futures_util::Stream<Item = T> + '_ {
        futures_util::stream::unfold((self, ctx), |(queue, ctx)| async move {
            match queue.take_with(&ctx).await {
                Ok(item) => Some((item, (queue, ctx))),
                Err(_) => None,
            }
        })
    }

    /// 聚合出队：从第一个有元素可取的队列中取走一个元素。
    ///
    /// ## 契约（What）
    /// - 成功返回 `(胜出队列下标, 元素)`；额度与元素一一绑定，
    ///   不存在赢得额度后再输掉元素的竞争；
    /// - 全部候选都已完成并排空时报 [`WaitError::AllClosed`]。
    pub async fn take_from_any(
        queues: &[&BoundedQueue<T>],
        ctx: &WaitContext,
    ) -> Result<(usize, T)> {
        if queues.is_empty() {
            return Err(WaitError::invalid_argument(
                "take_from_any requires at least one queue",
            ));
        }
        for queue in queues {
            queue.guard_fault()?;
        }
        let counters: Vec<&Counter> = queues.iter().map(|queue| &queue.used).collect();
        let index = Counter::decrement_any(&counters, ctx).await?;
        queues[index].redeem().map(|item| (index, item))
    }
}
