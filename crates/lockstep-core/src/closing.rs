//! 关闭信号：每个原语异步关闭路径共用的一次性完成源。

#[cfg(not(any(loom, lockstep_loom)))]
use core::sync::atomic::{AtomicBool, Ordering};
#[cfg(any(loom, lockstep_loom))]
use loom::sync::atomic::{AtomicBool, Ordering};

use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};

use parking_lot::Mutex;

/// 一次性完成信号。
///
/// # 设计背景（Why）
/// - 每个原语的关闭流程都归结为同一个问题：“所有已持有的资源何时全部归还”；
///   以一个独立的一次性信号承载该事实，原语只需在最后一份资源归还时触发；
/// - 触发幂等：关闭可能由释放路径与关闭入口并发竞争触发，重复触发必须无害。
///
/// # 契约说明（What）
/// - `complete()`：首次调用使信号进入完成态并唤醒全部等待者，后续调用为空操作；
/// - `wait()`：返回在完成态解析的 Future；完成后再等待立即就绪；
/// - `is_complete()`：无副作用查询。
#[derive(Debug)]
pub(crate) struct CloseSignal {
    done: AtomicBool,
    wakers: Mutex<Vec<Waker>>,
}

impl CloseSignal {
    pub(crate) fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
            wakers: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// 使信号进入完成态；仅首次调用执行唤醒。
    pub(crate) fn complete(&self) {
        if self
            .done
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let drained: Vec<Waker> = core::mem::take(&mut *self.wakers.lock());
            for waker in drained {
                waker.wake();
            }
        }
    }

    pub(crate) fn wait(&self) -> CloseWait<'_> {
        CloseWait { signal: self }
    }
}

/// 等待关闭信号的 Future。
///
/// 等待者在每次轮询时登记唤醒器并复查完成位，避免与 `complete()` 之间的
/// 丢失唤醒；登记表允许同一等待者留下重复条目，多余唤醒是无害的。
#[derive(Debug)]
pub(crate) struct CloseWait<'a> {
    signal: &'a CloseSignal,
}

impl Future for CloseWait<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.signal.is_complete() {
            return Poll::Ready(());
        }
        {
            let mut wakers = self.signal.wakers.lock();
            if !wakers.iter().any(|existing| existing.will_wake(cx.waker())) {
                wakers.push(cx.waker().clone());
            }
        }
        if self.signal.is_complete() {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

#[cfg(all(test, not(any(loom, lockstep_loom))))]
mod tests {
    use super::*;

    #[test]
    fn complete_is_idempotent() {
        let signal = CloseSignal::new();
        assert!(!signal.is_complete());
        signal.complete();
        signal.complete();
        assert!(signal.is_complete());
    }

    #[test]
    fn wait_after_complete_is_immediate() {
        let signal = CloseSignal::new();
        signal.complete();
        futures::executor::block_on(signal.wait());
    }

    #[test]
    fn wait_resolves_on_complete() {
        let signal = std::sync::Arc::new(CloseSignal::new());
        let other = std::sync::Arc::clone(&signal);
        let handle = std::thread::spawn(move || {
            futures::executor::block_on(other.wait());
        });
        // 让等待线程有机会先行登记，再触发完成。
        std::thread::yield_now();
        signal.complete();
        handle.join().expect("等待线程必须随信号完成而退出");
    }
}
