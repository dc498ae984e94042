//! 键控锁：以并发映射为骨架的按键互斥。
//!
//! # 设计综述（Why）
//! - 以 `DashMap` 的分片锁承担“键是否被持有”的原子判定：条目存在即持有，
//!   条目内保存该键的 FIFO 等待队列；入队与释放路径的弹出/移除在同一
//!   分片锁内互斥，不需要额外的全局协调；
//! - 释放即移交：弹出下一位存活等待者直接转移持有权；无人等待时原子地
//!   校验队列为空并移除条目，保证映射不积累空壳。
//!
//! # 风险提示（Trade-offs）
//! - 分片 guard 在持有期间会阻塞同分片写操作，所有临界区只做指针级工作；
//! - 关闭完成的判定读取 `DashMap::is_empty`，该计数为最终一致：关闭信号
//!   可能晚于最后一次释放极短的窗口，但不会提前。

#[cfg(not(any(loom, lockstep_loom)))]
use core::sync::atomic::{AtomicBool, Ordering};
#[cfg(any(loom, lockstep_loom))]
use loom::sync::atomic::{AtomicBool, Ordering};

use core::hash::Hash;
use std::sync::Arc;

use dashmap::{DashMap, mapref::entry::Entry};

use crate::closing::CloseSignal;
use crate::context::WaitContext;
use crate::error::{Result, WaitError};
use crate::waiter::{WaitQueue, WaitSite, Waiting};

#[derive(Debug)]
struct KeyGate {
    waiters: Arc<WaitQueue<()>>,
}

impl KeyGate {
    fn new() -> Self {
        Self {
            waiters: Arc::new(WaitQueue::new()),
        }
    }
}

/// 按键互斥锁：不同键并行，同键串行。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 以业务键（订单号、会话标识）为粒度串行化操作，避免一把全局锁
///   吞掉所有并行度；
/// - 键空间动态伸缩：首个获取者建立条目，最后一次释放移除条目。
///
/// ## 契约（What)
/// - 空键位的首个获取者立即持有；后续获取者按 FIFO 排队；
/// - 释放把持有权移交给下一位等待者；无人等待时键位回收；
/// - 取消把等待者从该键的队列中摘除；关闭终结全部键位的等待者，
///   并在所有持有者释放后完成。
#[derive(Debug)]
pub struct KeyedLock<K>
where
    K: Eq + Hash + Clone + Unpin,
{
    gates: DashMap<K, KeyGate>,
    closing: AtomicBool,
    done: CloseSignal,
}

impl<K> KeyedLock<K>
where
    K: Eq + Hash + Clone + Unpin,
{
    /// 创建空的键控锁。
    pub fn new() -> Self {
        Self {
            gates: DashMap::new(),
            closing: AtomicBool::new(false),
            done: CloseSignal::new(),
        }
    }

    /// 是否已发起关闭。
    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// 当前被持有的键数量（瞬时快照）。
    pub fn held_keys(&self) -> usize {
        self.gates.len()
    }

    /// 同步获取：键位空闲时立即持有。
    pub fn try_acquire(&self, key: K) -> Option<KeyedGuard<'_, K>> {
        if self.is_closed() {
            return None;
        }
        match self.gates.entry(key.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(KeyGate::new());
                Some(KeyedGuard::arm(self, key))
            }
        }
    }

    /// 异步获取给定键。
    pub async fn acquire(&self, key: K) -> Result<KeyedGuard<'_, K>> {
        self.acquire_with(key, &WaitContext::new()).await
    }

    /// 携带上下文的异步获取。
    pub async fn acquire_with(&self, key: K, ctx: &WaitContext) -> Result<KeyedGuard<'_, K>> {
        if self.is_closed() {
            return Err(WaitError::Closed);
        }
        if ctx.is_cancelled() {
            return Err(WaitError::Cancelled);
        }
        let (queue, node) = match self.gates.entry(key.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(KeyGate::new());
                return Ok(KeyedGuard::arm(self, key));
            }
            Entry::Occupied(occupied) => {
                // 在分片锁内入队，与释放路径的弹出/移除互斥。
                let gate = occupied.get();
                let node = gate.waiters.acquire_node(0);
                gate.waiters.push(node.clone());
                (Arc::clone(&gate.waiters), node)
            }
        };
        if self.is_closed() {
            queue.close_all();
        }
        let site = KeyedSite {
            lock: self,
            key: key.clone(),
            queue,
        };
        Waiting::new(site, node, ctx)
            .await
            .map(|()| KeyedGuard::arm(self, key))
    }

    /// 定时便捷获取：超时翻译为 `Ok(None)`。
    #[cfg(feature = "runtime-tokio")]
    pub async fn acquire_for(
        &self,
        key: K,
        timeout: core::time::Duration,
    ) -> Result<Option<KeyedGuard<'_, K>>> {
        match self
            .acquire_with(key, &WaitContext::timeout_only(timeout))
            .await
        {
            Ok(guard) => Ok(Some(guard)),
            Err(WaitError::TimedOut) => Ok(None),
            Err(other) => Err(other),
        }
    }

    /// 释放键位：移交给下一位等待者，或回收条目。
    fn release_key(&self, key: &K) {
        loop {
            let granted = match self.gates.get(key) {
                // 防御：键位已不存在（理论上只会因句柄误用出现）。
                None => return,
                Some(gate) => gate.waiters.grant_one(()).is_ok(),
            };
            if granted {
                // 持有权已转移，条目保留。
                return;
            }
            // 无存活等待者：原子校验空队列并移除键位。
            if self
                .gates
                .remove_if(key, |_, gate| gate.waiters.is_empty())
                .is_some()
            {
                self.settle_close();
                return;
            }
            // 移除落空说明新的等待者赶到，回到移交分支。
        }
    }

    fn settle_close(&self) {
        if self.is_closed() && self.gates.is_empty() {
            self.done.complete();
        }
    }

    /// 发起关闭：全部键位的等待者失败，持有者释放完毕后关闭完成。
    pub fn close(&self) -> bool {
        if self
            .closing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        tracing::debug!(target: "lockstep::keyed", "keyed lock close initiated");
        for entry in self.gates.iter() {
            entry.value().waiters.close_all();
        }
        self.settle_close();
        true
    }

    /// 等待关闭完成。
    pub async fn closed(&self) {
        self.done.wait().await
    }
}

impl<K> Default for KeyedLock<K>
where
    K: Eq + Hash + Clone + Unpin,
{
    fn default() -> Self {
        Self::new()
    }
}

struct KeyedSite<'a, K>
where
    K: Eq + Hash + Clone + Unpin,
{
    lock: &'a KeyedLock<K>,
    key: K,
    queue: Arc<WaitQueue<()>>,
}

impl<K> WaitSite for KeyedSite<'_, K>
where
    K: Eq + Hash + Clone + Unpin,
{
    type Output = ();

    fn queue(&self) -> &WaitQueue<()> {
        &self.queue
    }

    fn reclaim(&self, _: ()) {
        // 已授予却被放弃的持有立即走释放路径，移交或回收键位。
        self.lock.release_key(&self.key);
    }
}

/// 键控锁守卫：恰好释放一次。
#[derive(Debug)]
pub struct KeyedGuard<'a, K>
where
    K: Eq + Hash + Clone + Unpin,
{
    lock: &'a KeyedLock<K>,
    key: K,
    released: AtomicBool,
}

impl<'a, K> KeyedGuard<'a, K>
where
    K: Eq + Hash + Clone + Unpin,
{
    fn arm(lock: &'a KeyedLock<K>, key: K) -> Self {
        Self {
            lock,
            key,
            released: AtomicBool::new(false),
        }
    }

    /// 守卫对应的键。
    pub fn key(&self) -> &K {
        &self.key
    }

    /// 释放键位；恰好成功一次。
    pub fn release(&self) -> Result<()> {
        if self
            .released
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(WaitError::misuse("keyed guard released twice"));
        }
        self.lock.release_key(&self.key);
        Ok(())
    }
}

impl<K> Drop for KeyedGuard<'_, K>
where
    K: Eq + Hash + Clone + Unpin,
{
    fn drop(&mut self) {
        if self
            .released
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.lock.release_key(&self.key);
        }
    }
}
