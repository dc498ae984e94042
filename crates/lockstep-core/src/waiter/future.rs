//! 等待期 Future：每个挂起操作唯一的悬停点。
//!
//! # 设计综述（Why）
//! - 所有原语的异步操作共享同一套“入队 → 挂起 → 裁决 → 消费”的生命周期，
//!   把该生命周期收敛为一个泛型 Future，原语只需以 [`WaitSite`] 描述
//!   自己的队列与回收语义；
//! - 取消、超时、提前析构都由 Future 自身发起中断协议，保证与授予方的
//!   竞争只在节点状态的比较交换上裁决。
//!
//! # 裁决协议（How）
//! - 轮询顺序固定为：消费终态 → 登记唤醒器 → 复查终态 → 轮询取消令牌 →
//!   轮询截止计时器；复查一步堵住“授予发生在登记之前”的丢失唤醒窗口；
//! - 中断路径：`Pending → Aborted` 胜出后从队列摘除自身；若摘除落空，
//!   说明授予方已把节点弹出但尚未（也不再可能）完成授予，无需额外回滚；
//! - 已授予但未消费即析构的等待，把值经 [`WaitSite::reclaim`] 交还原语，
//!   原语可借此唤醒下一位等待者。

use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};
use std::sync::Arc;

use crate::context::{Cancellation, WaitContext};
use crate::error::{Result, WaitError};

use super::node::WaitNode;
use super::queue::WaitQueue;
use super::state::WaitState;

/// 等待落点：原语向等待期 Future 暴露的最小接口。
///
/// # 契约说明（What）
/// - `queue`：返回节点所属的等待队列，中断协议经由它摘除节点；
/// - `reclaim`：接收“已授予但被放弃”的值；实现方通常将其重新投入分配，
///   从而唤醒下一位等待者；实现不得在其中执行用户回调或跨越 `await`。
pub(crate) trait WaitSite {
    type Output;

    fn queue(&self) -> &WaitQueue<Self::Output>;

    fn reclaim(&self, value: Self::Output);
}

/// 挂起等待的 Future 本体。
///
/// # 契约说明（What）
/// - **前置条件**：节点已武装为 `Pending` 并入队；版本号在构造时捕获；
/// - **后置条件**：完成（`Ok`/`Err`）后节点被归还节点池；重复轮询返回
///   复用违规错误而非 panic；
/// - **版本校验**：每次轮询比对节点版本，池化复用导致的陈旧句柄会被
///   识别为 [`WaitError::Misuse`]。
pub(crate) struct Waiting<'ctx, S: WaitSite> {
    site: S,
    node: Option<Arc<WaitNode<S::Output>>>,
    version: u64,
    cancellation: Option<&'ctx Cancellation>,
    cancel_key: Option<u64>,
    #[cfg(feature = "runtime-tokio")]
    sleep: Option<Pin<Box<tokio::time::Sleep>>>,
}

impl<'ctx, S: WaitSite> Waiting<'ctx, S> {
    pub(crate) fn new(site: S, node: Arc<WaitNode<S::Output>>, ctx: &'ctx WaitContext) -> Self {
        let version = node.version();
        Self {
            site,
            node: Some(node),
            version,
            cancellation: ctx.cancellation(),
            cancel_key: None,
            #[cfg(feature = "runtime-tokio")]
            sleep: ctx.timeout().map(|timeout| Box::pin(tokio::time::sleep(timeout))),
        }
    }

    /// 终态收尾：注销取消登记、卸下计时器、移交节点所有权。
    fn finish(&mut self) -> Option<Arc<WaitNode<S::Output>>> {
        if let Some(cancellation) = self.cancellation {
            cancellation.unregister(&mut self.cancel_key);
        }
        #[cfg(feature = "runtime-tokio")]
        {
            self.sleep = None;
        }
        self.node.take()
    }

    /// 若节点处于可消费的终态，则消费并返回结果。
    fn try_consume_terminal(&mut self) -> Option<Result<S::Output>> {
        let node = Arc::clone(self.node.as_ref()?);
        match node.state() {
            WaitState::Granted => {
                let value = node.take_granted();
                if let Some(node) = self.finish() {
                    self.site.queue().release_node(node);
                }
                Some(match value {
                    Some(value) => Ok(value),
                    None => Err(WaitError::misuse("granted wait carried no value")),
                })
            }
            WaitState::Closed => {
                if let Some(node) = self.finish() {
                    self.site.queue().release_node(node);
                }
                Some(Err(WaitError::Closed))
            }
            _ => None,
        }
    }

    /// 中断协议：夺取裁决权并脱离队列；竞争失败则转入终态消费。
    fn abort_with(&mut self, error: WaitError) -> Result<S::Output> {
        let Some(node) = self.node.as_ref().cloned() else {
            return Err(WaitError::misuse("wait future polled after completion"));
        };
        if node.abort() {
            // 摘除落空意味着授予方短暂持有节点；其授予 CAS 必然失败并自行回滚。
            let _ = self.site.queue().erase(&node);
            node.mark_dequeued();
            node.mark_observed();
            if let Some(node) = self.finish() {
                self.site.queue().release_node(node);
            }
            Err(error)
        } else {
            // 完成优先：授予或关闭已在竞态中胜出。
            self.try_consume_terminal()
                .unwrap_or_else(|| Err(WaitError::misuse("wait reached an unexpected state")))
        }
    }
}

impl<'ctx, S> Future for Waiting<'ctx, S>
where
    S: WaitSite + Unpin,
{
    type Output = Result<S::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(node) = this.node.as_ref() else {
            return Poll::Ready(Err(WaitError::misuse("wait future polled after completion")));
        };
        if node.version() != this.version {
            return Poll::Ready(Err(WaitError::misuse("wait handle version mismatch")));
        }
        let node = Arc::clone(node);

        if let Some(result) = this.try_consume_terminal() {
            return Poll::Ready(result);
        }
        node.register_waker(cx.waker());
        // 登记后复查，堵住“授予先于登记”的丢失唤醒窗口。
        if let Some(result) = this.try_consume_terminal() {
            return Poll::Ready(result);
        }

        if let Some(cancellation) = this.cancellation {
            cancellation.register(&mut this.cancel_key, cx.waker());
            if cancellation.is_cancelled() {
                return Poll::Ready(this.abort_with(WaitError::Cancelled));
            }
        }

        #[cfg(feature = "runtime-tokio")]
        if let Some(sleep) = this.sleep.as_mut() {
            if sleep.as_mut().poll(cx).is_ready() {
                return Poll::Ready(this.abort_with(WaitError::TimedOut));
            }
        }

        Poll::Pending
    }
}

impl<'ctx, S: WaitSite> Drop for Waiting<'ctx, S> {
    fn drop(&mut self) {
        if let Some(cancellation) = self.cancellation {
            cancellation.unregister(&mut self.cancel_key);
        }
        let Some(node) = self.node.take() else {
            return;
        };
        if node.state() == WaitState::Pending && node.abort() {
            let _ = self.site.queue().erase(&node);
            node.mark_dequeued();
            node.mark_observed();
            self.site.queue().release_node(node);
            return;
        }
        match node.state() {
            WaitState::Granted => {
                // 已授予但调用方放弃消费：把资源交还原语，可能唤醒下一位等待者。
                if let Some(value) = node.take_granted() {
                    self.site.reclaim(value);
                }
                self.site.queue().release_node(node);
            }
            WaitState::Closed => {
                self.site.queue().release_node(node);
            }
            // 中断链路或防御路径：交由 Arc 正常释放，不回收进池。
            _ => {}
        }
    }
}
