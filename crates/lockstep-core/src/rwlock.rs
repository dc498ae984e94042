//! 读写锁：多读者/单写者，支持读到写升级与写到读降级。
//!
//! # 设计综述（Why）
//! - 带符号计数承载全部持有状态：`-1` 为写者独占，`0` 空闲，正数为读者
//!   人数；“写者异或读者”的核心不变量由同一原子上的 CAS 保证；
//! - 升级者在等待期间保留自己的读者名额：升级的完成条件是“成为唯一
//!   读者”，`1 → -1` 的一步 CAS 同时吸收读者身份并夺取写权。取消升级
//!   因此天然安全——读者从未被让出，无需任何重取逻辑。
//!
//! # 调度策略（What）
//! - 读持有期间（计数 ≥ 1）新读者可直接共享进入，即便有写者排队；
//! - 空闲移交优先写者，其次整队放行读者；
//! - 升级优先于排队写者：计数降至 1 的瞬间即完成升级。

#[cfg(not(any(loom, lockstep_loom)))]
use core::sync::atomic::{AtomicBool, AtomicI64, Ordering};
#[cfg(any(loom, lockstep_loom))]
use loom::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use core::fmt;

use parking_lot::Mutex;

use crate::closing::CloseSignal;
use crate::context::WaitContext;
use crate::error::{Result, WaitError};
use crate::waiter::{WaitQueue, WaitSite, Waiting};

/// 异步读写锁。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 读多写少的共享状态保护：读者共享、写者独占，均可挂起等待；
/// - 升级让“先验证后修改”的调用方无需经历释放-重取窗口，期间状态
///   不会被其他写者插入修改。
///
/// ## 契约（What）
/// - 任意时刻要么恰有一个写者且无读者，要么无写者且读者数非负；
/// - 同一时刻至多一个升级等待者，第二个并发升级报 [`WaitError::Misuse`]；
/// - 升级失败（取消/超时）时原读者守卫原样返还，读者身份从未间断。
#[derive(Debug)]
pub struct ReadWriteLock {
    state: AtomicI64,
    closing: AtomicBool,
    readers: WaitQueue<()>,
    writers: WaitQueue<()>,
    upgrades: WaitQueue<()>,
    handover: Mutex<()>,
    done: CloseSignal,
}

impl ReadWriteLock {
    /// 创建空闲的读写锁。
    pub fn new() -> Self {
        Self {
            state: AtomicI64::new(0),
            closing: AtomicBool::new(false),
            readers: WaitQueue::new(),
            writers: WaitQueue::new(),
            upgrades: WaitQueue::new(),
            handover: Mutex::new(()),
            done: CloseSignal::new(),
        }
    }

    /// 是否已发起关闭。
    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// 当前读者数；写者持有或空闲时为 0。
    pub fn reader_count(&self) -> u64 {
        let state = self.state.load(Ordering::Acquire);
        if state > 0 { state as u64 } else { 0 }
    }

    /// 写者是否持有。
    pub fn writer_held(&self) -> bool {
        self.state.load(Ordering::Acquire) == -1
    }

    /// 同步获取读者名额。
    pub fn try_read(&self) -> Option<ReadGuard<'_>> {
        if self.is_closed() {
            return None;
        }
        loop {
            let state = self.state.load(Ordering::Acquire);
            if state >= 1 {
                // 读持有期间直接共享进入。
                if self
                    .state
                    .compare_exchange(state, state + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Some(ReadGuard::arm(self));
                }
            } else if state == 0 {
                // 空闲时尊重排队的写者与升级者。
                if !self.writers.is_empty() || !self.upgrades.is_empty() {
                    return None;
                }
                if self
                    .state
                    .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Some(ReadGuard::arm(self));
                }
            } else {
                return None;
            }
        }
    }

    /// 异步获取读者名额。
    pub async fn read(&self) -> Result<ReadGuard<'_>> {
        self.read_with(&WaitContext::new()).await
    }

    /// 携带上下文的异步读者获取。
    pub async fn read_with(&self, ctx: &WaitContext) -> Result<ReadGuard<'_>> {
        if let Some(guard) = self.try_read() {
            return Ok(guard);
        }
        if self.is_closed() {
            return Err(WaitError::Closed);
        }
        if ctx.is_cancelled() {
            return Err(WaitError::Cancelled);
        }
        let node = self.readers.acquire_node(0);
        self.readers.push(node.clone());
        self.hand_over();
        if self.is_closed() {
            self.readers.close_all();
        }
        Waiting::new(ReadSite(self), node, ctx)
            .await
            .map(|()| ReadGuard::arm(self))
    }

    /// 同步获取写者独占。
    pub fn try_write(&self) -> Option<WriteGuard<'_>> {
        if self.is_closed() {
            return None;
        }
        if self
            .state
            .compare_exchange(0, -1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Some(WriteGuard::arm(self))
        } else {
            None
        }
    }

    /// 异步获取写者独占。
    pub async fn write(&self) -> Result<WriteGuard<'_>> {
        self.write_with(&WaitContext::new()).await
    }

    /// 携带上下文的异步写者获取。
    pub async fn write_with(&self, ctx: &WaitContext) -> Result<WriteGuard<'_>> {
        if let Some(guard) = self.try_write() {
            return Ok(guard);
        }
        if self.is_closed() {
            return Err(WaitError::Closed);
        }
        if ctx.is_cancelled() {
            return Err(WaitError::Cancelled);
        }
        let node = self.writers.acquire_node(0);
        self.writers.push(node.clone());
        self.hand_over();
        if self.is_closed() {
            self.writers.close_all();
        }
        Waiting::new(WriteSite(self), node, ctx)
            .await
            .map(|()| WriteGuard::arm(self))
    }

    /// 定时便捷读者获取：超时翻译为 `Ok(None)`。
    #[cfg(feature = "runtime-tokio")]
    pub async fn read_for(&self, timeout: core::time::Duration) -> Result<Option<ReadGuard<'_>>> {
        match self.read_with(&WaitContext::timeout_only(timeout)).await {
            Ok(guard) => Ok(Some(guard)),
            Err(WaitError::TimedOut) => Ok(None),
            Err(other) => Err(other),
        }
    }

    /// 定时便捷写者获取：超时翻译为 `Ok(None)`。
    #[cfg(feature = "runtime-tokio")]
    pub async fn write_for(&self, timeout: core::time::Duration) -> Result<Option<WriteGuard<'_>>> {
        match self.write_with(&WaitContext::timeout_only(timeout)).await {
            Ok(guard) => Ok(Some(guard)),
            Err(WaitError::TimedOut) => Ok(None),
            Err(other) => Err(other),
        }
    }

    /// 读到写升级，不带上下文约束。
    pub async fn upgrade<'a>(
        &'a self,
        guard: ReadGuard<'a>,
    ) -> core::result::Result<WriteGuard<'a>, UpgradeFailed<'a>> {
        self.upgrade_with(guard, &WaitContext::new()).await
    }

    /// 读到写升级：消耗读者守卫，成为唯一读者的瞬间完成。
    ///
    /// ## 契约（What）
    /// - 升级期间读者身份保持有效，其他读者可照常进入与退出；
    /// - 失败（取消/超时/关闭/并发升级冲突）时返还原读者守卫；
    /// - 升级完成优先于排队写者。
    pub async fn upgrade_with<'a>(
        &'a self,
        guard: ReadGuard<'a>,
        ctx: &WaitContext,
    ) -> core::result::Result<WriteGuard<'a>, UpgradeFailed<'a>> {
        if !core::ptr::eq(guard.lock, self) {
            return Err(UpgradeFailed {
                guard,
                error: WaitError::misuse("read guard belongs to another lock"),
            });
        }
        if guard.released.load(Ordering::Acquire) {
            return Err(UpgradeFailed {
                guard,
                error: WaitError::misuse("read guard already released"),
            });
        }
        if !self.upgrades.is_empty() {
            return Err(UpgradeFailed {
                guard,
                error: WaitError::misuse("another upgrade is already pending"),
            });
        }
        // 快路径：自己已是唯一读者。
        if self
            .state
            .compare_exchange(1, -1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            guard.disarm();
            return Ok(WriteGuard::arm(self));
        }
        if ctx.is_cancelled() {
            return Err(UpgradeFailed {
                guard,
                error: WaitError::Cancelled,
            });
        }
        let node = self.upgrades.acquire_node(0);
        self.upgrades.push(node.clone());
        if self.upgrades.len() > 1 {
            // 并发升级冲突：双方各持读者互相等待必然僵死，主动撤回自己。
            if node.abort() {
                let _ = self.upgrades.erase(&node);
                node.mark_dequeued();
                node.mark_observed();
            }
            return Err(UpgradeFailed {
                guard,
                error: WaitError::misuse("another upgrade is already pending"),
            });
        }
        // 入队后复查：读者数可能恰好降到 1。
        self.try_complete_upgrade();
        if self.is_closed() {
            self.upgrades.close_all();
        }
        match Waiting::new(UpgradeSite(self), node, ctx).await {
            Ok(()) => {
                // 升级授予时 `1 → -1` 已吸收读者身份，守卫只需解除武装。
                guard.disarm();
                Ok(WriteGuard::arm(self))
            }
            Err(error) => Err(UpgradeFailed { guard, error }),
        }
    }

    /// 写到读降级：释放写权并原地换取一个读者名额，不经过排队。
    pub fn downgrade<'a>(&'a self, guard: WriteGuard<'a>) -> ReadGuard<'a> {
        guard.disarm();
        // 写者独占期间状态恒为 -1，一步换为单读者。
        let _ = self
            .state
            .compare_exchange(-1, 1, Ordering::AcqRel, Ordering::Acquire);
        ReadGuard::arm(self)
    }

    fn release_read(&self) {
        let previous = self.state.fetch_sub(1, Ordering::AcqRel);
        match previous - 1 {
            1 => self.try_complete_upgrade(),
            0 => {
                self.hand_over();
                self.settle_close();
            }
            _ => {}
        }
    }

    fn release_write(&self) {
        let _ = self
            .state
            .compare_exchange(-1, 0, Ordering::AcqRel, Ordering::Acquire);
        self.hand_over();
        self.settle_close();
    }

    /// 升级完成判定：唯一读者即升级者本人时，一步夺取写权。
    fn try_complete_upgrade(&self) {
        let _serial = self.handover.lock();
        if self.upgrades.is_empty() {
            return;
        }
        if self
            .state
            .compare_exchange(1, -1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
            && self.upgrades.grant_one(()).is_err()
        {
            // 升级者恰被中断：还原读者计数。
            let _ = self
                .state
                .compare_exchange(-1, 1, Ordering::AcqRel, Ordering::Acquire);
        }
    }

    /// 空闲移交：优先写者，其次整队放行读者。
    fn hand_over(&self) {
        let _serial = self.handover.lock();
        if self.state.load(Ordering::Acquire) != 0 {
            return;
        }
        if !self.writers.is_empty()
            && self
                .state
                .compare_exchange(0, -1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            if self.writers.grant_one(()).is_ok() {
                return;
            }
            // 占位无人认领：退还并落入读者放行。
            let _ = self
                .state
                .compare_exchange(-1, 0, Ordering::AcqRel, Ordering::Acquire);
        }
        loop {
            if self.readers.is_empty() {
                return;
            }
            let state = self.state.load(Ordering::Acquire);
            if state < 0 {
                return;
            }
            if self
                .state
                .compare_exchange(state, state + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            if self.readers.grant_one(()).is_err() {
                self.state.fetch_sub(1, Ordering::AcqRel);
                return;
            }
        }
    }

    fn settle_close(&self) {
        if self.is_closed() && self.state.load(Ordering::Acquire) == 0 {
            self.done.complete();
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
        tracing::debug!(target: "lockstep::rwlock", "read-write lock close initiated");
        self.readers.close_all();
        self.writers.close_all();
        self.upgrades.close_all();
        self.settle_close();
        true
    }

    /// 等待关闭完成。
    pub async fn closed(&self) {
        self.done.wait().await
    }
}

impl Default for ReadWriteLock {
    fn default() -> Self {
        Self::new()
    }
}

struct ReadSite<'a>(&'a ReadWriteLock);

impl WaitSite for ReadSite<'_> {
    type Output = ();

    fn queue(&self) -> &WaitQueue<()> {
        &self.0.readers
    }

    fn reclaim(&self, _: ()) {
        self.0.release_read();
    }
}

struct WriteSite<'a>(&'a ReadWriteLock);

impl WaitSite for WriteSite<'_> {
    type Output = ();

    fn queue(&self) -> &WaitQueue<()> {
        &self.0.writers
    }

    fn reclaim(&self, _: ()) {
        self.0.release_write();
    }
}

struct UpgradeSite<'a>(&'a ReadWriteLock);

impl WaitSite for UpgradeSite<'_> {
    type Output = ();

    fn queue(&self) -> &WaitQueue<()> {
        &self.0.upgrades
    }

    fn reclaim(&self, _: ()) {
        // 已授予却被放弃的升级回落为读者；原守卫的释放路径随后照常生效。
        let _ = self
            .0
            .state
            .compare_exchange(-1, 1, Ordering::AcqRel, Ordering::Acquire);
    }
}

/// 读者守卫。
#[derive(Debug)]
pub struct ReadGuard<'a> {
    lock: &'a ReadWriteLock,
    released: AtomicBool,
}

impl<'a> ReadGuard<'a> {
    fn arm(lock: &'a ReadWriteLock) -> Self {
        Self {
            lock,
            released: AtomicBool::new(false),
        }
    }

    fn disarm(&self) {
        self.released.store(true, Ordering::Release);
    }

    /// 释放读者名额；恰好成功一次。
    pub fn release(&self) -> Result<()> {
        if self
            .released
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(WaitError::misuse("read guard released twice"));
        }
        self.lock.release_read();
        Ok(())
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        if self
            .released
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.lock.release_read();
        }
    }
}

/// 写者守卫。
#[derive(Debug)]
pub struct WriteGuard<'a> {
    lock: &'a ReadWriteLock,
    released: AtomicBool,
}

impl<'a> WriteGuard<'a> {
    fn arm(lock: &'a ReadWriteLock) -> Self {
        Self {
            lock,
            released: AtomicBool::new(false),
        }
    }

    fn disarm(&self) {
        self.released.store(true, Ordering::Release);
    }

    /// 释放写者独占；恰好成功一次。
    pub fn release(&self) -> Result<()> {
        if self
            .released
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(WaitError::misuse("write guard released twice"));
        }
        self.lock.release_write();
        Ok(())
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if self
            .released
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.lock.release_write();
        }
    }
}

/// 升级失败的返回载体：原读者守卫物归原主。
pub struct UpgradeFailed<'a> {
    /// 原样返还的读者守卫，读者身份从未间断。
    pub guard: ReadGuard<'a>,
    /// 失败原因。
    pub error: WaitError,
}

impl fmt::Debug for UpgradeFailed<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpgradeFailed")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}
