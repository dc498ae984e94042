//! 等待队列：支持任意位置摘除的多生产者/多消费者 FIFO。
//!
//! # 设计综述（Why）
//! - 队列只负责排序与定位，真正的裁决点在节点状态的比较交换上：
//!   授予方与中断方各自尝试跃迁，恰好一方观测到节点“存活”；
//! - 互斥区仅覆盖双端队列的指针操作，以纳秒级临界区换取免 `unsafe` 的
//!   侵入式链表等价能力；被中断的节点留在原位成为逻辑墓碑，由后续遍历跳过。
//!
//! # 契约说明（What）
//! - `push` 的线性化点是互斥区内的尾部追加，出队顺序相对入队完成顺序 FIFO；
//! - `erase` 按指针身份摘除指定节点，返回本次调用是否完成摘除；
//!   与并发的授予遍历之间，恰好一方观测到节点存活（由节点 CAS 裁决）；
//! - `len` 为近似存活计数，不做同步承诺；
//! - 节点以 `Arc` 持有，任何并发操作仍可触达的节点都不会被释放。

#[cfg(not(any(loom, lockstep_loom)))]
use core::sync::atomic::{AtomicUsize, Ordering};
#[cfg(any(loom, lockstep_loom))]
use loom::sync::atomic::{AtomicUsize, Ordering};

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use super::node::WaitNode;

/// 池中保留的空闲节点上限，超出的节点交由 `Arc` 正常释放。
const POOL_LIMIT: usize = 64;

#[derive(Debug)]
pub(crate) struct WaitQueue<T> {
    entries: Mutex<VecDeque<Arc<WaitNode<T>>>>,
    live: AtomicUsize,
    pool: Mutex<Vec<Arc<WaitNode<T>>>>,
}

impl<T> WaitQueue<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            live: AtomicUsize::new(0),
            pool: Mutex::new(Vec::new()),
        }
    }

    /// 从池中取出（或新建）一个已武装为 `Pending` 的节点。
    ///
    /// 只有池为唯一持有者的节点才会被复用，杜绝与仍在途的旧句柄共享存储；
    /// 复用路径会递增版本号，使旧句柄的版本校验失败。
    pub(crate) fn acquire_node(&self, demand: u64) -> Arc<WaitNode<T>> {
        let recycled = {
            let mut pool = self.pool.lock();
            let mut found = None;
            while let Some(node) = pool.pop() {
                if Arc::strong_count(&node) == 1 {
                    found = Some(node);
                    break;
                }
                // 仍有在途引用的节点直接丢弃，由 Arc 善后。
            }
            found
        };
        match recycled {
            Some(node) => {
                node.recycle();
                node.arm(demand);
                node
            }
            None => {
                let node = Arc::new(WaitNode::new());
                node.arm(demand);
                node
            }
        }
    }

    /// 归还节点。仅应在节点已脱离队列且结果已被消费后调用。
    pub(crate) fn release_node(&self, node: Arc<WaitNode<T>>) {
        let mut pool = self.pool.lock();
        if pool.len() < POOL_LIMIT {
            pool.push(node);
        }
    }

    /// 追加到队尾。
    pub(crate) fn push(&self, node: Arc<WaitNode<T>>) {
        let mut entries = self.entries.lock();
        entries.push_back(node);
        self.live.fetch_add(1, Ordering::AcqRel);
    }

    /// 摘除指定节点；返回 `true` 表示本次调用将其移出队列。
    pub(crate) fn erase(&self, node: &Arc<WaitNode<T>>) -> bool {
        let mut entries = self.entries.lock();
        if let Some(index) = entries.iter().position(|entry| Arc::ptr_eq(entry, node)) {
            entries.remove(index);
            self.live.fetch_sub(1, Ordering::AcqRel);
            true
        } else {
            false
        }
    }

    /// 是否（近似地）没有存活等待者。
    pub(crate) fn is_empty(&self) -> bool {
        self.live.load(Ordering::Acquire) == 0
    }

    /// 近似存活计数，无同步承诺。
    pub(crate) fn len(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// 按 FIFO 顺序向存活等待者交付由 `supply` 计算的值。
    ///
    /// # 契约说明（What）
    /// - `supply` 读取队首节点（含 `demand` 提示）并决定交付值；返回 `None` 停止遍历；
    /// - 授予在弹出之后执行：若节点恰在此刻被中断，值通过 `undo` 归还调用方，
    ///   遍历继续；墓碑节点被直接弹出跳过；
    /// - 返回成功交付的数量。
    pub(crate) fn grant_while(
        &self,
        mut supply: impl FnMut(&WaitNode<T>) -> Option<T>,
        mut undo: impl FnMut(T),
    ) -> usize {
        let mut granted = 0;
        loop {
            let mut entries = self.entries.lock();
            let Some(front) = entries.front() else { break };
            if !front.is_pending() {
                // 逻辑墓碑：中断方已胜出，弹出跳过。
                let stale = entries.pop_front();
                self.live.fetch_sub(1, Ordering::AcqRel);
                drop(entries);
                if let Some(stale) = stale {
                    stale.mark_dequeued();
                }
                continue;
            }
            let Some(value) = supply(front.as_ref()) else { break };
            let node = entries.pop_front();
            self.live.fetch_sub(1, Ordering::AcqRel);
            drop(entries);
            let Some(node) = node else { break };
            match node.grant(value) {
                Ok(()) => granted += 1,
                Err(value) => {
                    // 弹出与授予之间被中断：值归还调用方，继续服务后续节点。
                    node.mark_dequeued();
                    undo(value);
                }
            }
        }
        granted
    }

    /// 向一个存活等待者交付值；无人等待时返还。
    pub(crate) fn grant_one(&self, value: T) -> Result<(), T> {
        let pending = core::cell::Cell::new(Some(value));
        self.grant_while(
            |_| pending.take(),
            |returned| pending.set(Some(returned)),
        );
        match pending.into_inner() {
            None => Ok(()),
            Some(value) => Err(value),
        }
    }

    /// 以 `supply` 生成的值交付全部存活等待者（窥视释放、事件广播）。
    pub(crate) fn grant_all(&self, mut supply: impl FnMut() -> T) -> usize {
        self.grant_while(|_| Some(supply()), |_| {})
    }

    /// 以关闭事实终结全部存活等待者。
    pub(crate) fn close_all(&self) -> usize {
        let drained: Vec<_> = {
            let mut entries = self.entries.lock();
            let drained: Vec<_> = entries.drain(..).collect();
            self.live.store(0, Ordering::Release);
            drained
        };
        let mut closed = 0;
        for node in drained {
            if node.close() {
                closed += 1;
            } else {
                node.mark_dequeued();
            }
        }
        closed
    }
}
