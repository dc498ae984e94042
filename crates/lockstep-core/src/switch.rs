//! 双边切换锁：左右两侧互斥、同侧共享的二态锁。
//!
//! # 设计综述（Why）
//! - 以单个带符号计数承载全部持有状态：负数为左侧持有（幅度即人数），
//!   正数为右侧持有，零为空闲；互斥性由同一原子上的 CAS 保证；
//! - 公平与非公平只差一条让位规则：公平模式下，对侧有排队者时本侧
//!   不得继续抢入，防止单侧长期饥饿。
//!
//! # 移交协议（How）
//! - 最后一名持有者离场使计数归零后，优先向对侧整队宣灌：逐个“先占位、
//!   后交付”，交付失败（等待者恰被中断）则退还占位；
//! - 宣灌期间由移交互斥锁串行化，快路径抢入仍由 CAS 决断，不被阻塞。

#[cfg(not(any(loom, lockstep_loom)))]
use core::sync::atomic::{AtomicBool, AtomicI64, Ordering};
#[cfg(any(loom, lockstep_loom))]
use loom::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use parking_lot::Mutex;

use crate::closing::CloseSignal;
use crate::context::WaitContext;
use crate::error::{Result, WaitError};
use crate::waiter::{WaitQueue, WaitSite, Waiting};

/// 切换锁的两侧。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    /// 左侧；持有时状态为负。
    Left,
    /// 右侧；持有时状态为正。
    Right,
}

impl Side {
    fn direction(self) -> i64 {
        match self {
            Side::Left => -1,
            Side::Right => 1,
        }
    }

    /// 对侧。
    pub fn opposite(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }
}

/// 公平策略。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fairness {
    /// 对侧有排队者时，本侧（含已持有侧）不得继续抢入。
    Fair,
    /// 同侧可无条件重入，吞吐优先。
    Unfair,
}

/// 双边切换锁。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 表达“两类互斥、同类共享”的访问模式：例如批量写与在线读两类任务
///   互斥，同类任务之间并行；
/// - 相比读写锁，两侧地位对称，任一侧都可多人共享。
///
/// ## 契约（What）
/// - 同一时刻至多一侧被持有；守卫恰好释放一次，重复释放报
///   [`WaitError::Misuse`]；
/// - 最后一名持有者离场时，若对侧有排队者，锁切换到对侧并放行其全部
///   排队者；
/// - 关闭后新的获取失败，关闭信号在全部守卫释放后完成。
#[derive(Debug)]
pub struct SwitchLock {
    state: AtomicI64,
    fairness: Fairness,
    left: WaitQueue<()>,
    right: WaitQueue<()>,
    closing: AtomicBool,
    handover: Mutex<()>,
    done: CloseSignal,
}

impl SwitchLock {
    /// 以给定公平策略创建切换锁。
    pub fn new(fairness: Fairness) -> Self {
        Self {
            state: AtomicI64::new(0),
            fairness,
            left: WaitQueue::new(),
            right: WaitQueue::new(),
            closing: AtomicBool::new(false),
            handover: Mutex::new(()),
            done: CloseSignal::new(),
        }
    }

    /// 配置的公平策略。
    pub fn fairness(&self) -> Fairness {
        self.fairness
    }

    /// 是否已发起关闭。
    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// 当前持有侧；空闲时返回 `None`。
    pub fn held_side(&self) -> Option<Side> {
        match self.state.load(Ordering::Acquire) {
            0 => None,
            s if s < 0 => Some(Side::Left),
            _ => Some(Side::Right),
        }
    }

    fn queue(&self, side: Side) -> &WaitQueue<()> {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }

    /// 同步抢入：成功返回守卫。
    pub fn try_acquire(&self, side: Side) -> Option<SwitchGuard<'_>> {
        if self.try_enter(side) {
            Some(SwitchGuard {
                lock: self,
                side,
                released: AtomicBool::new(false),
            })
        } else {
            None
        }
    }

    fn try_enter(&self, side: Side) -> bool {
        if self.is_closed() {
            return false;
        }
        let dir = side.direction();
        let own = self.queue(side);
        let other = self.queue(side.opposite());
        loop {
            let state = self.state.load(Ordering::Acquire);
            let held_by_own = (dir < 0 && state < 0) || (dir > 0 && state > 0);
            if state == 0 {
                // 空闲：公平模式让位给对侧排队者；本侧排队者按 FIFO 优先。
                if self.fairness == Fairness::Fair && !other.is_empty() {
                    return false;
                }
                if !own.is_empty() {
                    return false;
                }
                if self
                    .state
                    .compare_exchange(0, dir, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return true;
                }
            } else if held_by_own {
                if self.fairness == Fairness::Fair && !other.is_empty() {
                    return false;
                }
                if self
                    .state
                    .compare_exchange(state, state + dir, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return true;
                }
            } else {
                return false;
            }
        }
    }

    /// 异步获取给定一侧。
    pub async fn acquire(&self, side: Side) -> Result<SwitchGuard<'_>> {
        self.acquire_with(side, &WaitContext::new()).await
    }

    /// 携带上下文的异步获取。
    pub async fn acquire_with(&self, side: Side, ctx: &WaitContext) -> Result<SwitchGuard<'_>> {
        if let Some(guard) = self.try_acquire(side) {
            return Ok(guard);
        }
        if self.is_closed() {
            return Err(WaitError::Closed);
        }
        if ctx.is_cancelled() {
            return Err(WaitError::Cancelled);
        }
        let own = self.queue(side);
        let node = own.acquire_node(0);
        own.push(node.clone());
        // 入队后复查：锁可能恰在入队前归零。
        self.hand_over(side);
        if self.is_closed() {
            own.close_all();
        }
        Waiting::new(SwitchSite { lock: self, side }, node, ctx)
            .await
            .map(|()| SwitchGuard {
                lock: self,
                side,
                released: AtomicBool::new(false),
            })
    }

    /// 定时便捷获取：超时翻译为 `Ok(None)`。
    #[cfg(feature = "runtime-tokio")]
    pub async fn acquire_for(
        &self,
        side: Side,
        timeout: core::time::Duration,
    ) -> Result<Option<SwitchGuard<'_>>> {
        match self
            .acquire_with(side, &WaitContext::timeout_only(timeout))
            .await
        {
            Ok(guard) => Ok(Some(guard)),
            Err(WaitError::TimedOut) => Ok(None),
            Err(other) => Err(other),
        }
    }

    fn release(&self, side: Side) {
        let dir = side.direction();
        let previous = self.state.fetch_sub(dir, Ordering::AcqRel);
        if previous - dir == 0 {
            // 最后一名持有者离场：优先向对侧移交。
            self.hand_over(side.opposite());
            if self.is_closed() && self.state.load(Ordering::Acquire) == 0 {
                self.done.complete();
            }
        }
    }

    /// 空闲态移交：从 `prefer` 开始，向有排队者的一侧整队宣灌。
    fn hand_over(&self, prefer: Side) {
        let _serial = self.handover.lock();
        for side in [prefer, prefer.opposite()] {
            if self.state.load(Ordering::Acquire) != 0 {
                return;
            }
            let queue = self.queue(side);
            let dir = side.direction();
            loop {
                if queue.is_empty() {
                    break;
                }
                let state = self.state.load(Ordering::Acquire);
                // 对侧经快路径抢得则停止宣灌。
                if state != 0 && (state < 0) != (dir < 0) {
                    return;
                }
                if self
                    .state
                    .compare_exchange(state, state + dir, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    continue;
                }
                if queue.grant_one(()).is_err() {
                    // 占位无人认领（等待者恰被中断）：退还。
                    self.state.fetch_sub(dir, Ordering::AcqRel);
                    break;
                }
            }
        }
    }

    /// 发起关闭：排队者失败，守卫全部释放后关闭完成。
    pub fn close(&self) -> bool {
        if self
            .closing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        tracing::debug!(target: "lockstep::switch", "switch lock close initiated");
        self.left.close_all();
        self.right.close_all();
        if self.state.load(Ordering::Acquire) == 0 {
            self.done.complete();
        }
        true
    }

    /// 等待关闭完成。
    pub async fn closed(&self) {
        self.done.wait().await
    }
}

struct SwitchSite<'a> {
    lock: &'a SwitchLock,
    side: Side,
}

impl WaitSite for SwitchSite<'_> {
    type Output = ();

    fn queue(&self) -> &WaitQueue<()> {
        self.lock.queue(self.side)
    }

    fn reclaim(&self, _: ()) {
        // 已授予但被放弃的持有等价于立即释放。
        self.lock.release(self.side);
    }
}

/// 切换锁守卫：恰好释放一次。
#[derive(Debug)]
pub struct SwitchGuard<'a> {
    lock: &'a SwitchLock,
    side: Side,
    released: AtomicBool,
}

impl SwitchGuard<'_> {
    /// 守卫对应的一侧。
    pub fn side(&self) -> Side {
        self.side
    }

    /// 释放持有；恰好成功一次。
    pub fn release(&self) -> Result<()> {
        if self
            .released
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(WaitError::misuse("switch guard released twice"));
        }
        self.lock.release(self.side);
        Ok(())
    }
}

impl Drop for SwitchGuard<'_> {
    fn drop(&mut self) {
        if self
            .released
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.lock.release(self.side);
        }
    }
}
