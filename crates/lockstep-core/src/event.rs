//! 事件原语：自动复位与手动复位两种形态。
//!
//! # 设计综述（Why）
//! - 事件是等待队列之上最薄的原语：状态只有“未触发/已触发/已关闭”三相；
//! - 自动复位事件把触发精确交付给一个等待者（交付后回到未触发），
//!   手动复位事件广播给全部等待者并保持触发态直至显式复位。

#[cfg(not(any(loom, lockstep_loom)))]
use core::sync::atomic::{AtomicU8, Ordering};
#[cfg(any(loom, lockstep_loom))]
use loom::sync::atomic::{AtomicU8, Ordering};

use crate::closing::CloseSignal;
use crate::context::WaitContext;
use crate::error::{Result, WaitError};
use crate::waiter::{WaitQueue, WaitSite, Waiting};

#[cfg(feature = "runtime-tokio")]
use core::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum Signal {
    Unset = 0,
    Set = 1,
    Closed = 2,
}

impl Signal {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Signal::Unset,
            1 => Signal::Set,
            _ => Signal::Closed,
        }
    }
}

/// 原子信号位的公共骨架，两种事件共享。
#[derive(Debug)]
struct SignalCell(AtomicU8);

impl SignalCell {
    fn new(initially_set: bool) -> Self {
        let initial = if initially_set { Signal::Set } else { Signal::Unset };
        Self(AtomicU8::new(initial as u8))
    }

    fn load(&self) -> Signal {
        Signal::from_raw(self.0.load(Ordering::Acquire))
    }

    fn transition(&self, from: Signal, to: Signal) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// 推进到关闭态；返回是否由本次调用完成。
    fn close(&self) -> bool {
        loop {
            let current = self.load();
            if current == Signal::Closed {
                return false;
            }
            if self.transition(current, Signal::Closed) {
                return true;
            }
        }
    }
}

/// 自动复位事件：每次触发恰好放行一个等待者。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 表达“一次触发、一人通过”的脉冲语义：有等待者时触发直接交付，
///   事件保持未触发；无等待者时触发驻留，供下一个到达者消费。
///
/// ## 契约（What）
/// - [`AutoResetEvent::set`] 要么唤醒恰好一个等待者，要么把状态翻为触发；
///   重复触发是幂等的（驻留的触发不累积）；
/// - [`AutoResetEvent::try_wait`] 以 CAS 消费驻留的触发；
/// - 已交付但被等待方放弃（提前析构）的触发会自动重新注入，不会凭空消失。
#[derive(Debug)]
pub struct AutoResetEvent {
    signal: SignalCell,
    waiters: WaitQueue<()>,
    done: CloseSignal,
}

impl AutoResetEvent {
    /// 创建事件；`initially_set` 决定初始是否处于触发态。
    pub fn new(initially_set: bool) -> Self {
        Self {
            signal: SignalCell::new(initially_set),
            waiters: WaitQueue::new(),
            done: CloseSignal::new(),
        }
    }

    /// 当前是否处于触发态。
    pub fn is_set(&self) -> bool {
        self.signal.load() == Signal::Set
    }

    /// 是否已关闭。
    pub fn is_closed(&self) -> bool {
        self.signal.load() == Signal::Closed
    }

    /// 触发事件：交付一个等待者，或驻留触发态。
    pub fn set(&self) -> Result<()> {
        loop {
            if self.signal.load() == Signal::Closed {
                return Err(WaitError::Closed);
            }
            if self.waiters.grant_one(()).is_ok() {
                return Ok(());
            }
            if self.signal.transition(Signal::Unset, Signal::Set) {
                // 翻转与入队之间的竞态：若此刻出现了等待者，把驻留触发收回交接。
                if !self.waiters.is_empty() && self.signal.transition(Signal::Set, Signal::Unset) {
                    continue;
                }
                return Ok(());
            }
            if self.signal.load() == Signal::Set {
                // 已处于触发态：幂等。
                return Ok(());
            }
        }
    }

    /// 同步消费驻留的触发。
    pub fn try_wait(&self) -> bool {
        self.signal.transition(Signal::Set, Signal::Unset)
    }

    /// 异步等待触发。
    pub async fn wait(&self) -> Result<()> {
        self.wait_with(&WaitContext::new()).await
    }

    /// 携带上下文的异步等待。
    pub async fn wait_with(&self, ctx: &WaitContext) -> Result<()> {
        if self.try_wait() {
            return Ok(());
        }
        if self.signal.load() == Signal::Closed {
            return Err(WaitError::Closed);
        }
        if ctx.is_cancelled() {
            return Err(WaitError::Cancelled);
        }
        let node = self.waiters.acquire_node(0);
        self.waiters.push(node.clone());
        // 入队后复查：驻留触发若已出现，抢下并交付给队首（可能正是自己）。
        if self.try_wait() && self.waiters.grant_one(()).is_err() {
            let _ = self.set();
        }
        if self.signal.load() == Signal::Closed {
            self.waiters.close_all();
        }
        Waiting::new(AutoSite(self), node, ctx).await
    }

    /// 定时便捷等待：超时翻译为 `Ok(false)`。
    #[cfg(feature = "runtime-tokio")]
    pub async fn wait_for(&self, timeout: Duration) -> Result<bool> {
        match self.wait_with(&WaitContext::timeout_only(timeout)).await {
            Ok(()) => Ok(true),
            Err(WaitError::TimedOut) => Ok(false),
            Err(other) => Err(other),
        }
    }

    /// 关闭事件：挂起等待者立即失败，关闭信号随即完成。
    pub fn close(&self) -> bool {
        let first = self.signal.close();
        if first {
            self.waiters.close_all();
            self.done.complete();
        }
        first
    }

    /// 等待关闭完成。
    pub async fn closed(&self) {
        self.done.wait().await
    }
}

struct AutoSite<'a>(&'a AutoResetEvent);

impl WaitSite for AutoSite<'_> {
    type Output = ();

    fn queue(&self) -> &WaitQueue<()> {
        &self.0.waiters
    }

    fn reclaim(&self, _: ()) {
        // 已交付但被放弃的触发重新注入，交给下一位等待者或驻留。
        let _ = self.0.set();
    }
}

/// 手动复位事件：触发后广播放行，保持触发态直到显式复位。
#[derive(Debug)]
pub struct ManualResetEvent {
    signal: SignalCell,
    waiters: WaitQueue<()>,
    done: CloseSignal,
}

impl ManualResetEvent {
    /// 创建事件；`initially_set` 决定初始是否处于触发态。
    pub fn new(initially_set: bool) -> Self {
        Self {
            signal: SignalCell::new(initially_set),
            waiters: WaitQueue::new(),
            done: CloseSignal::new(),
        }
    }

    /// 当前是否处于触发态。
    pub fn is_set(&self) -> bool {
        self.signal.load() == Signal::Set
    }

    /// 触发事件并放行全部等待者；保持触发态。
    pub fn set(&self) -> Result<()> {
        loop {
            match self.signal.load() {
                Signal::Closed => return Err(WaitError::Closed),
                Signal::Set => break,
                Signal::Unset => {
                    if self.signal.transition(Signal::Unset, Signal::Set) {
                        break;
                    }
                }
            }
        }
        self.waiters.grant_all(|| ());
        Ok(())
    }

    /// 复位到未触发态；触发-复位往返后与初始未触发态不可区分。
    pub fn reset(&self) -> Result<()> {
        if self.signal.load() == Signal::Closed {
            return Err(WaitError::Closed);
        }
        let _ = self.signal.transition(Signal::Set, Signal::Unset);
        Ok(())
    }

    /// 同步探测：处于触发态时返回 `true`，不改变状态。
    pub fn try_wait(&self) -> bool {
        self.is_set()
    }

    /// 异步等待触发。
    pub async fn wait(&self) -> Result<()> {
        self.wait_with(&WaitContext::new()).await
    }

    /// 携带上下文的异步等待。
    pub async fn wait_with(&self, ctx: &WaitContext) -> Result<()> {
        if self.is_set() {
            return Ok(());
        }
        if self.signal.load() == Signal::Closed {
            return Err(WaitError::Closed);
        }
        if ctx.is_cancelled() {
            return Err(WaitError::Cancelled);
        }
        let node = self.waiters.acquire_node(0);
        self.waiters.push(node.clone());
        if self.is_set() {
            self.waiters.grant_all(|| ());
        }
        if self.signal.load() == Signal::Closed {
            self.waiters.close_all();
        }
        Waiting::new(ManualSite(self), node, ctx).await
    }

    /// 定时便捷等待：超时翻译为 `Ok(false)`。
    #[cfg(feature = "runtime-tokio")]
    pub async fn wait_for(&self, timeout: Duration) -> Result<bool> {
        match self.wait_with(&WaitContext::timeout_only(timeout)).await {
            Ok(()) => Ok(true),
            Err(WaitError::TimedOut) => Ok(false),
            Err(other) => Err(other),
        }
    }

    /// 关闭事件。
    pub fn close(&self) -> bool {
        let first = self.signal.close();
        if first {
            self.waiters.close_all();
            self.done.complete();
        }
        first
    }

    /// 等待关闭完成。
    pub async fn closed(&self) {
        self.done.wait().await
    }
}

struct ManualSite<'a>(&'a ManualResetEvent);

impl WaitSite for ManualSite<'_> {
    type Output = ();

    fn queue(&self) -> &WaitQueue<()> {
        &self.0.waiters
    }

    // 手动复位事件的放行不消费状态，无需回收。
    fn reclaim(&self, _: ()) {}
}
