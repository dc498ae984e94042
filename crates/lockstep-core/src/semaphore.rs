//! 计数信号量：带一次性释放句柄的计数锁，附脉冲/候听能力。
//!
//! # 设计综述（Why）
//! - 可用槽位复用 [`Counter`] 的全部协议（挂起、公平、取消回滚）；
//!   信号量只在其上叠加“句柄恰好释放一次”“在途句柄全部归还后才算关闭”
//!   两条额外契约；
//! - 脉冲/候听沿用条件变量语义：候听方让出槽位挂起，被脉冲后先收回槽位
//!   再返回，保证返回时刻仍然持有许可。

#[cfg(not(any(loom, lockstep_loom)))]
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
#[cfg(any(loom, lockstep_loom))]
use loom::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::closing::CloseSignal;
use crate::context::WaitContext;
use crate::counter::Counter;
use crate::error::{Result, WaitError};
use crate::waiter::{WaitQueue, WaitSite, Waiting};

#[cfg(feature = "runtime-tokio")]
use core::time::Duration;

/// 异步计数信号量。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 限制同时持有资源的并发度：`acquire` 取得一个许可（槽位），许可以
///   [`SemaphorePermit`] 句柄承载，释放恰好一次；
/// - 关闭是排空式的：新的获取立即失败，关闭信号在全部在途许可归还后完成。
///
/// ## 契约（What）
/// - `max` 至少为 1；`with_count` 允许初始可用数低于上限（预占模式）；
/// - 句柄重复释放报 [`WaitError::Misuse`]；句柄析构时自动释放未释放的许可
///   并留下诊断日志——显式释放仍是推荐用法；
/// - 取得后释放使 [`Semaphore::available`] 回到先前值（往返恒等）。
#[derive(Debug)]
pub struct Semaphore {
    slots: Counter,
    max: u64,
    outstanding: AtomicU64,
    closing: AtomicBool,
    signals: WaitQueue<()>,
    done: CloseSignal,
}

impl Semaphore {
    /// 创建全部许可可用的信号量。
    pub fn new(max: u64) -> Result<Self> {
        Self::with_count(max, max)
    }

    /// 创建初始可用数为 `initial`、上限为 `max` 的信号量。
    ///
    /// `initial < max` 表示部分许可从未投放（仅影响可用数与上限的报告），
    /// 在途登记只统计真正外发的句柄。
    pub fn with_count(initial: u64, max: u64) -> Result<Self> {
        if max == 0 {
            return Err(WaitError::invalid_argument("max count must be at least 1"));
        }
        if initial > max {
            return Err(WaitError::invalid_argument(
                "initial count must not exceed max count",
            ));
        }
        Ok(Self {
            slots: Counter::new(initial),
            max,
            outstanding: AtomicU64::new(0),
            closing: AtomicBool::new(false),
            signals: WaitQueue::new(),
            done: CloseSignal::new(),
        })
    }

    /// 许可上限。
    pub fn max_count(&self) -> u64 {
        self.max
    }

    /// 当前可用许可数的瞬时快照；关闭且排空后返回 `None`。
    pub fn available(&self) -> Option<u64> {
        self.slots.count()
    }

    /// 是否已发起关闭。
    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// 同步获取许可；无可用槽位或已关闭时返回 `None`。
    pub fn try_acquire(&self) -> Option<SemaphorePermit<'_>> {
        if self.is_closed() || !self.slots.try_decrement() {
            return None;
        }
        self.admit().ok()
    }

    /// 异步获取许可。
    pub async fn acquire(&self) -> Result<SemaphorePermit<'_>> {
        self.acquire_with(&WaitContext::new()).await
    }

    /// 携带上下文的异步获取。
    pub async fn acquire_with(&self, ctx: &WaitContext) -> Result<SemaphorePermit<'_>> {
        if self.is_closed() {
            return Err(WaitError::Closed);
        }
        self.slots.decrement_with(ctx).await?;
        self.admit()
    }

    /// 定时便捷获取：超时翻译为 `Ok(None)`。
    #[cfg(feature = "runtime-tokio")]
    pub async fn acquire_for(&self, timeout: Duration) -> Result<Option<SemaphorePermit<'_>>> {
        match self.acquire_with(&WaitContext::timeout_only(timeout)).await {
            Ok(permit) => Ok(Some(permit)),
            Err(WaitError::TimedOut) => Ok(None),
            Err(other) => Err(other),
        }
    }

    /// 槽位到手后的入账：登记在途许可并复查关闭竞态。
    fn admit(&self) -> Result<SemaphorePermit<'_>> {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        if self.is_closed() {
            // 关闭与获取竞态：撤销登记，许可不外发。
            self.retire();
            return Err(WaitError::Closed);
        }
        Ok(SemaphorePermit {
            semaphore: self,
            released: AtomicBool::new(false),
        })
    }

    /// 归还槽位并撤销在途登记。
    fn give_back(&self) {
        if !self.is_closed() {
            // 关闭后槽位计数不再有意义，归还失败同样无害。
            let _ = self.slots.add(1);
        }
        self.retire();
    }

    fn retire(&self) {
        let before = self.outstanding.fetch_sub(1, Ordering::AcqRel);
        if before == 1 && self.is_closed() {
            self.done.complete();
        }
    }

    /// 脉冲一个候听者；无人候听时返回 `false`。
    pub fn pulse_one(&self) -> bool {
        self.signals.grant_one(()).is_ok()
    }

    /// 脉冲全部候听者；返回被放行的数量。
    pub fn pulse_all(&self) -> usize {
        self.signals.grant_all(|| ())
    }

    /// 候听脉冲：让出名下槽位挂起，被脉冲后收回槽位再返回。
    ///
    /// ## 契约（What）
    /// - `permit` 必须来自本信号量且尚未释放，否则报 [`WaitError::Misuse`]；
    /// - 返回 `Ok(())` 时许可仍然有效（槽位已收回）；
    /// - 取消/超时同样会先收回槽位再上抛，许可保持有效；
    /// - 仅当关闭导致槽位无法收回时，许可被就地作废并报 [`WaitError::Closed`]。
    pub async fn wait_signal(
        &self,
        permit: &SemaphorePermit<'_>,
        ctx: &WaitContext,
    ) -> Result<()> {
        if !core::ptr::eq(permit.semaphore, self) {
            return Err(WaitError::misuse("permit belongs to another semaphore"));
        }
        if permit.released.load(Ordering::Acquire) {
            return Err(WaitError::misuse("permit already released"));
        }
        if self.is_closed() {
            return Err(WaitError::Closed);
        }
        if ctx.is_cancelled() {
            return Err(WaitError::Cancelled);
        }
        let node = self.signals.acquire_node(0);
        self.signals.push(node.clone());
        // 让出名下槽位，供其他获取方使用。
        let _ = self.slots.add(1);
        if self.is_closed() {
            self.signals.close_all();
        }
        let outcome = Waiting::new(SignalSite(self), node, ctx).await;
        // 返回前必须收回槽位；此处的等待不受候听上下文的取消影响。
        match self.slots.decrement_with(&WaitContext::new()).await {
            Ok(_) => outcome,
            Err(_) => {
                // 槽位无法收回（关闭排空）：许可就地作废，防止二次归还。
                if permit
                    .released
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.retire();
                }
                Err(WaitError::Closed)
            }
        }
    }

    /// 发起关闭：新的获取失败，候听者终止，在途许可归还完毕后关闭完成。
    pub fn close(&self) -> bool {
        if self
            .closing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        tracing::debug!(target: "lockstep::semaphore", "semaphore close initiated");
        self.slots.close();
        self.signals.close_all();
        if self.outstanding.load(Ordering::Acquire) == 0 {
            self.done.complete();
        }
        true
    }

    /// 等待关闭完成。
    pub async fn closed(&self) {
        self.done.wait().await
    }
}

struct SignalSite<'a>(&'a Semaphore);

impl WaitSite for SignalSite<'_> {
    type Output = ();

    fn queue(&self) -> &WaitQueue<()> {
        &self.0.signals
    }

    fn reclaim(&self, _: ()) {
        // 被放弃的脉冲转发给下一位候听者。
        let _ = self.0.signals.grant_one(());
    }
}

/// 信号量许可：恰好释放一次的资源句柄。
///
/// ## 契约（What）
/// - [`SemaphorePermit::release`] 第二次调用报 [`WaitError::Misuse`]，
///   且不会重复归还槽位；
/// - 析构时自动释放未释放的许可，并以 `tracing` 留下一条提示——
///   依赖析构释放是合法的，但显式释放能让错误就地暴露。
#[derive(Debug)]
pub struct SemaphorePermit<'a> {
    semaphore: &'a Semaphore,
    released: AtomicBool,
}

impl SemaphorePermit<'_> {
    /// 释放许可；恰好成功一次。
    pub fn release(&self) -> Result<()> {
        if self
            .released
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(WaitError::misuse("permit released twice"));
        }
        self.semaphore.give_back();
        Ok(())
    }
}

impl Drop for SemaphorePermit<'_> {
    fn drop(&mut self) {
        if self
            .released
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::trace!(
                target: "lockstep::semaphore",
                "permit auto-released on drop; prefer explicit release"
            );
            self.semaphore.give_back();
        }
    }
}

#[cfg(all(test, not(any(loom, lockstep_loom))))]
mod tests {
    use super::*;
    use futures::FutureExt;
    use futures::executor::block_on;

    #[test]
    fn acquire_release_roundtrip_restores_count() {
        let semaphore = Semaphore::new(2).expect("上限合法");
        let permit = semaphore.try_acquire().expect("有可用许可");
        assert_eq!(semaphore.available(), Some(1));
        permit.release().expect("首次释放成功");
        assert_eq!(semaphore.available(), Some(2), "往返后计数复原");
    }

    #[test]
    fn double_release_is_rejected() {
        let semaphore = Semaphore::new(1).expect("上限合法");
        let permit = semaphore.try_acquire().expect("有可用许可");
        permit.release().expect("首次释放成功");
        assert!(
            matches!(permit.release(), Err(WaitError::Misuse { .. })),
            "二次释放必须报复用违规"
        );
        assert_eq!(semaphore.available(), Some(1), "计数不受二次释放影响");
    }

    #[test]
    fn drop_auto_releases() {
        let semaphore = Semaphore::new(1).expect("上限合法");
        {
            let _permit = semaphore.try_acquire().expect("有可用许可");
            assert_eq!(semaphore.available(), Some(0));
        }
        assert_eq!(semaphore.available(), Some(1));
    }

    #[test]
    fn exhausted_semaphore_suspends_acquirer() {
        let semaphore = Semaphore::new(1).expect("上限合法");
        let ctx = WaitContext::new();
        let permit = semaphore.try_acquire().expect("有可用许可");
        let mut second = Box::pin(semaphore.acquire_with(&ctx));
        assert!(second.as_mut().now_or_never().is_none(), "满载必须挂起");
        permit.release().expect("释放成功");
        let second = block_on(second).expect("释放后接力成功");
        second.release().expect("释放成功");
    }

    #[test]
    fn close_completes_after_all_permits_return() {
        let semaphore = Semaphore::new(2).expect("上限合法");
        let permit = semaphore.try_acquire().expect("有可用许可");
        assert!(semaphore.close());
        assert!(semaphore.try_acquire().is_none(), "关闭后拒绝新的获取");
        assert!(!semaphore.done.is_complete(), "在途许可未归还前不得完成");
        permit.release().expect("归还成功");
        block_on(semaphore.closed());
    }
}
