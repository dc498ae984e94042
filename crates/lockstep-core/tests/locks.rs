//! 锁族端到端场景：信号量句柄、事件、切换锁移交与读写锁升级。

use std::sync::Arc;
use std::time::Duration;

use lockstep_core::prelude::*;

/// 信号量句柄的二次释放报复用违规，计数不受影响。
#[tokio::test]
async fn semaphore_double_release_is_rejected() {
    let semaphore = Semaphore::new(3).expect("上限合法");
    let permit = semaphore.acquire().await.expect("获取成功");
    assert_eq!(semaphore.available(), Some(2));

    permit.release().expect("首次释放成功");
    assert!(matches!(permit.release(), Err(WaitError::Misuse { .. })));
    assert_eq!(semaphore.available(), Some(3), "计数回到初值且不被二次释放推高");
}

/// 信号量满载时获取方挂起，释放后按序接力。
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn semaphore_suspends_when_exhausted() {
    let semaphore = Arc::new(Semaphore::new(1).expect("上限合法"));
    let permit = semaphore.acquire().await.expect("获取成功");

    let contender = {
        let semaphore = Arc::clone(&semaphore);
        tokio::spawn(async move {
            let permit = semaphore.acquire().await.expect("释放后必须放行");
            permit.release().expect("释放成功");
        })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    permit.release().expect("释放成功");
    contender.await.expect("竞争任务不应 panic");
    assert_eq!(semaphore.available(), Some(1));
}

/// 脉冲候听：让出槽位、被脉冲、收回槽位。
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn semaphore_pulse_wait_reacquires() {
    let semaphore = Arc::new(Semaphore::new(1).expect("上限合法"));
    let listener = {
        let semaphore = Arc::clone(&semaphore);
        tokio::spawn(async move {
            let permit = semaphore.acquire().await.expect("获取成功");
            semaphore
                .wait_signal(&permit, &WaitContext::new())
                .await
                .expect("脉冲后候听返回");
            // 返回时许可仍有效。
            permit.release().expect("释放成功");
        })
    };

    // 候听让出的槽位可被旁路获取；归还后脉冲放行候听者。
    loop {
        if let Some(permit) = semaphore.try_acquire() {
            permit.release().expect("释放成功");
            if semaphore.pulse_one() {
                break;
            }
        }
        tokio::task::yield_now().await;
    }
    listener.await.expect("候听任务不应 panic");
    assert_eq!(semaphore.available(), Some(1));
}

/// 自动复位事件的触发恰好放行一个等待者。
#[tokio::test]
async fn auto_reset_event_releases_one() {
    let event = AutoResetEvent::new(false);
    let ctx = WaitContext::new();

    let mut first = Box::pin(event.wait_with(&ctx));
    let mut second = Box::pin(event.wait_with(&ctx));
    assert!(futures::poll!(first.as_mut()).is_pending());
    assert!(futures::poll!(second.as_mut()).is_pending());

    event.set().expect("触发成功");
    assert_eq!(first.await, Ok(()));
    assert!(futures::poll!(second.as_mut()).is_pending(), "第二位继续等待");
    drop(second);
}

/// 手动复位事件广播放行，触发-复位往返回到初始态。
#[tokio::test]
async fn manual_reset_event_broadcasts() {
    let event = ManualResetEvent::new(false);
    let ctx = WaitContext::new();
    let mut first = Box::pin(event.wait_with(&ctx));
    let mut second = Box::pin(event.wait_with(&ctx));
    assert!(futures::poll!(first.as_mut()).is_pending());
    assert!(futures::poll!(second.as_mut()).is_pending());

    event.set().expect("触发成功");
    assert_eq!(first.await, Ok(()));
    assert_eq!(second.await, Ok(()));

    event.reset().expect("复位成功");
    assert!(!event.is_set());
    assert_eq!(event.wait_for(Duration::from_millis(5)).await, Ok(false));
}

/// 切换锁：最后一名持有者离场时向对侧整队移交。
#[tokio::test]
async fn switch_lock_hands_over_to_other_side() {
    let lock = SwitchLock::new(Fairness::Unfair);
    let ctx = WaitContext::new();
    let left_a = lock.try_acquire(Side::Left).expect("空闲可得");
    let left_b = lock.try_acquire(Side::Left).expect("同侧共享");

    let mut right_a = Box::pin(lock.acquire_with(Side::Right, &ctx));
    let mut right_b = Box::pin(lock.acquire_with(Side::Right, &ctx));
    assert!(futures::poll!(right_a.as_mut()).is_pending());
    assert!(futures::poll!(right_b.as_mut()).is_pending());

    left_a.release().expect("释放成功");
    assert!(
        futures::poll!(right_a.as_mut()).is_pending(),
        "仍有左侧持有者时不得移交"
    );
    left_b.release().expect("释放成功");

    let right_a = right_a.await.expect("移交后放行");
    let right_b = right_b.await.expect("整队放行");
    assert_eq!(lock.held_side(), Some(Side::Right));
    drop(right_a);
    drop(right_b);
}

/// 读写锁升级在竞争下的完成顺序：升级先于排队写者。
///
/// - **契约 (What)**：R1 升级挂起期间 R2 可共享进入；R2 释放后升级完成；
///   排队写者要等升级者释放写权后才放行。
#[tokio::test]
async fn rwlock_upgrade_beats_queued_writer() {
    let lock = ReadWriteLock::new();
    let ctx = WaitContext::new();

    let upgrading = lock.try_read().expect("空闲可读");
    // R2 在读持有期间直接共享进入（即便稍后有写者排队）。
    let sharing = lock.try_read().expect("读共享进入");

    let mut upgrade = Box::pin(lock.upgrade_with(upgrading, &ctx));
    assert!(
        futures::poll!(upgrade.as_mut()).is_pending(),
        "存在其他读者时升级必须等待"
    );
    let mut writer = Box::pin(lock.write_with(&ctx));
    assert!(futures::poll!(writer.as_mut()).is_pending(), "写者必须排队");

    sharing.release().expect("释放成功");
    let write_guard = upgrade.await.expect("唯一读者时升级完成");
    assert!(lock.writer_held());
    assert!(
        futures::poll!(writer.as_mut()).is_pending(),
        "升级者持写期间排队写者继续等待"
    );

    write_guard.release().expect("释放成功");
    let writer = writer.await.expect("升级者离场后写者放行");
    writer.release().expect("释放成功");
}

/// 键控锁按键互斥、跨键并行、关闭排空。
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn keyed_lock_serializes_per_key() {
    let lock = Arc::new(KeyedLock::new());
    let holder = lock.try_acquire("order-1").expect("空键位立即持有");
    let _other = lock.try_acquire("order-2").expect("不同键并行");

    let successor = {
        let lock = Arc::clone(&lock);
        tokio::spawn(async move {
            let guard = lock
                .acquire("order-1")
                .await
                .expect("释放后持有权移交");
            guard.release().expect("释放成功");
        })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    holder.release().expect("释放成功");
    successor.await.expect("后继任务不应 panic");
}

/// 关闭语义的共性：新操作失败，信号在资源归还后完成。
#[tokio::test]
async fn close_waits_for_outstanding_guards() {
    let lock = ReadWriteLock::new();
    let reader = lock.try_read().expect("空闲可读");
    assert!(lock.close());
    assert!(lock.try_read().is_none(), "关闭后拒绝新读者");

    let mut closed = Box::pin(lock.closed());
    assert!(
        futures::poll!(closed.as_mut()).is_pending(),
        "守卫未释放前关闭不得完成"
    );
    reader.release().expect("释放成功");
    closed.await;
}
