//! 计数器端到端场景：取消竞态、交接顺序与聚合递减。

use std::sync::Arc;
use std::time::Duration;

use lockstep_core::prelude::*;

/// 共享令牌取消三个挂起递减者，随后的注入全部落账。
///
/// - **意图 (Why)**：取消与注入的先后顺序必须可观测：取消尘埃落定后，
///   后续注入不得被已取消的等待者吞掉。
/// - **契约 (What)**：三个等待者均以取消失败收场；计数器终值为 3。
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelled_waiters_do_not_consume_later_increments() {
    let counter = Arc::new(Counter::new(0));
    let token = Cancellation::new();
    let ctx = WaitContext::new().with_cancellation(token.clone());

    let mut waiters = Vec::new();
    for _ in 0..3 {
        let counter = Arc::clone(&counter);
        let ctx = ctx.clone();
        waiters.push(tokio::spawn(
            async move { counter.decrement_with(&ctx).await },
        ));
    }
    while counter.waiting_decrements() < 3 {
        tokio::task::yield_now().await;
    }

    token.cancel();
    for waiter in waiters {
        let outcome = waiter.await.expect("等待任务不应 panic");
        assert_eq!(outcome, Err(WaitError::Cancelled));
    }

    for _ in 0..3 {
        counter.add(1).expect("取消后的注入必须成功");
    }
    assert_eq!(counter.count(), Some(3), "注入不得被已取消的等待者吞掉");
}

/// 注入优先交接给最早的等待者，且每人至多拿到其声明的批量上限。
#[tokio::test]
async fn handoff_respects_fifo_and_demand() {
    let counter = Counter::new(0);
    let ctx = WaitContext::new();

    let mut first = Box::pin(counter.decrement_up_to_with(2, &ctx));
    let mut second = Box::pin(counter.decrement_with(&ctx));
    assert!(futures::poll!(first.as_mut()).is_pending());
    assert!(futures::poll!(second.as_mut()).is_pending());

    counter.add(5).expect("注入成功");
    assert_eq!(first.await, Ok(2), "队首按声明上限拿走 2");
    assert_eq!(second.await, Ok(1), "第二位拿走 1");
    assert_eq!(counter.count(), Some(2), "剩余入账");
}

/// 聚合递减恰好命中一个计数器并消费一个额度。
///
/// - **契约 (What)**：三个零值计数器上的聚合等待在 C2 获得注入后完成，
///   返回其下标；完成后三个计数器的额度总和为 0。
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn decrement_any_wins_exactly_once() {
    let counters: Vec<Arc<Counter>> = (0..3).map(|_| Arc::new(Counter::new(0))).collect();
    let ctx = WaitContext::new();

    let task = {
        let counters = counters.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let borrowed: Vec<&Counter> = counters.iter().map(Arc::as_ref).collect();
            Counter::decrement_any(&borrowed, &ctx).await
        })
    };
    while counters[1].waiting_peeks() == 0 {
        tokio::task::yield_now().await;
    }

    counters[1].add(1).expect("注入成功");
    let winner = task.await.expect("聚合任务不应 panic").expect("聚合等待成功");
    assert_eq!(winner, 1, "胜出者应是获得注入的计数器");

    let total: u64 = counters
        .iter()
        .map(|counter| counter.count().unwrap_or(0))
        .sum();
    assert_eq!(total, 0, "恰好消费一个额度");
}

/// 全部候选关闭后，聚合递减以 `AllClosed` 失败。
#[tokio::test]
async fn decrement_any_reports_all_closed() {
    let first = Counter::new(0);
    let second = Counter::new(0);
    first.close();
    second.close();
    let outcome = Counter::decrement_any(&[&first, &second], &WaitContext::new()).await;
    assert_eq!(outcome, Err(WaitError::AllClosed));
}

/// 零超时等价于“只试快路径”。
#[tokio::test]
async fn zero_timeout_only_tries_fast_path() {
    let counter = Counter::new(1);
    assert_eq!(
        counter.decrement_for(Duration::ZERO).await,
        Ok(Some(1)),
        "快路径命中时零超时照常成功"
    );
    assert_eq!(
        counter.decrement_for(Duration::ZERO).await,
        Ok(None),
        "快路径落空时零超时立即放弃"
    );
}

/// 已取消的令牌使等待同步失败，不会入队。
#[tokio::test]
async fn pre_cancelled_token_fails_synchronously() {
    let counter = Counter::new(0);
    let token = Cancellation::new();
    token.cancel();
    let ctx = WaitContext::new().with_cancellation(token);

    let outcome = counter.decrement_with(&ctx).await;
    assert_eq!(outcome, Err(WaitError::Cancelled));
    assert_eq!(counter.waiting_decrements(), 0, "失败路径不得留下等待者");
}

/// 超时与取消严格区分：定时便捷方法返回 `Ok(None)` 而非错误。
#[tokio::test]
async fn timeout_translates_to_none() {
    let counter = Counter::new(0);
    let outcome = counter.decrement_for(Duration::from_millis(5)).await;
    assert_eq!(outcome, Ok(None));
    assert_eq!(counter.waiting_decrements(), 0, "超时的等待者必须被摘除");
}

/// 取走全部：空计数器上挂起，注入后至少取得 1。
#[tokio::test]
async fn drain_all_takes_everything_available() {
    let counter = Counter::new(0);
    let ctx = WaitContext::new();
    let mut wait = Box::pin(counter.decrement_all_with(&ctx));
    assert!(futures::poll!(wait.as_mut()).is_pending());

    counter.add(4).expect("注入成功");
    assert_eq!(wait.await, Ok(4), "取走全部应拿到当时的全部额度");
    assert_eq!(counter.count(), Some(0));
}

/// 被放弃的授予额度回流计数器，唤醒后续等待者。
#[tokio::test]
async fn abandoned_grant_flows_to_next_waiter() {
    let counter = Counter::new(0);
    let ctx = WaitContext::new();

    let mut first = Box::pin(counter.decrement_with(&ctx));
    let mut second = Box::pin(counter.decrement_with(&ctx));
    assert!(futures::poll!(first.as_mut()).is_pending());
    assert!(futures::poll!(second.as_mut()).is_pending());

    counter.add(1).expect("注入成功");
    // 队首已被授予但从未消费结果：放弃等待。
    drop(first);
    assert_eq!(second.await, Ok(1), "被放弃的额度必须接力给下一位");
}
