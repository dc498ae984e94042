//! 有界队列端到端场景：容量交接、完成排空与聚合出队。

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use lockstep_core::prelude::*;

/// 容量为 2 的队列在快产慢消下保持顺序，收支回到稳态。
///
/// - **契约 (What)**：消费者按序收到 `[a, b, c, d]`；结束后空位回到 2、
///   可取额度回到 0。
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn capacity_handoff_preserves_order() {
    let queue = Arc::new(BoundedQueue::bounded(2).expect("容量合法"));

    let producer = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            for item in ["a", "b", "c", "d"] {
                queue.add(item).await.expect("生产必须成功");
            }
        })
    };

    let mut received = Vec::new();
    for _ in 0..4 {
        received.push(queue.take().await.expect("消费必须成功"));
    }
    producer.await.expect("生产任务不应 panic");

    assert_eq!(received, ["a", "b", "c", "d"], "单生产单消费保持 FIFO");
    assert_eq!(queue.available_capacity(), Some(2), "空位回到稳态");
    assert_eq!(queue.available_items(), Some(0), "可取额度回到稳态");
}

/// 完成添加后消费者排空残余，再以关闭错误终止。
#[tokio::test]
async fn complete_adding_drains_then_fails() {
    let queue = BoundedQueue::bounded(3).expect("容量合法");
    queue.try_add("x").expect("入队成功");
    queue.try_add("y").expect("入队成功");
    assert!(queue.complete_adding());

    assert_eq!(queue.take().await, Ok("x"));
    assert_eq!(queue.take().await, Ok("y"));
    assert_eq!(queue.take().await, Err(WaitError::Closed));
    queue.closed().await;
}

/// 完成添加使挂起的生产者立即失败，元素物归原主。
#[tokio::test]
async fn complete_adding_fails_pending_producers() {
    let queue = BoundedQueue::bounded(1).expect("容量合法");
    queue.try_add(1).expect("入队成功");
    let ctx = WaitContext::new();

    let mut pending = Box::pin(queue.add_with(2, &ctx));
    assert!(futures::poll!(pending.as_mut()).is_pending(), "满载生产者挂起");

    queue.complete_adding();
    let rejected = pending.await.expect_err("完成添加后生产必须失败");
    assert_eq!(rejected.item, 2, "元素原样返还");
    assert_eq!(rejected.reason, Some(WaitError::Closed));
}

/// `add_complete` 恰好产生一个完成者。
#[tokio::test]
async fn add_complete_publishes_final_item() {
    let queue = BoundedQueue::bounded(4).expect("容量合法");
    let ctx = WaitContext::new();
    queue.try_add(1).expect("入队成功");
    queue
        .add_complete_with(2, &ctx)
        .await
        .expect("首个完成者成功");

    let rejected = queue
        .add_complete_with(3, &ctx)
        .await
        .expect_err("第二个完成者必须失败");
    assert_eq!(rejected.reason, Some(WaitError::Closed));

    assert_eq!(queue.take().await, Ok(1));
    assert_eq!(queue.take().await, Ok(2), "收尾元素最后可取");
    assert_eq!(queue.take().await, Err(WaitError::Closed));
}

/// 聚合出队绑定额度与元素，恰好从胜出队列取走一个。
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn take_from_any_wins_exactly_once() {
    let queues: Vec<Arc<BoundedQueue<u32>>> = (0..3)
        .map(|_| Arc::new(BoundedQueue::bounded(4).expect("容量合法")))
        .collect();
    let ctx = WaitContext::new();

    let task = {
        let queues = queues.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let borrowed: Vec<&BoundedQueue<u32>> = queues.iter().map(Arc::as_ref).collect();
            BoundedQueue::take_from_any(&borrowed, &ctx).await
        })
    };
    // 等待聚合窥视就位后，向第三条队列投放元素。
    tokio::time::sleep(Duration::from_millis(10)).await;
    queues[2].try_add(42).expect("入队成功");

    let (index, item) = task.await.expect("聚合任务不应 panic").expect("聚合出队成功");
    assert_eq!((index, item), (2, 42));
    let residual: usize = queues.iter().map(|queue| queue.len()).sum();
    assert_eq!(residual, 0, "恰好取走一个元素");
}

/// 消费流持续产出元素，直到完成且排空。
#[tokio::test]
async fn consuming_stream_ends_at_drain() {
    let queue = BoundedQueue::bounded(8).expect("容量合法");
    queue
        .add_many_with(vec![1, 2, 3], &WaitContext::new())
        .await
        .expect("整批入队成功");
    queue.complete_adding();

    let collected: Vec<u32> = queue.consume().collect().await;
    assert_eq!(collected, vec![1, 2, 3]);
}

/// 消费流被取消令牌终止。
#[tokio::test]
async fn consuming_stream_stops_on_cancel() {
    let queue = BoundedQueue::bounded(8).expect("容量合法");
    queue.try_add(7).expect("入队成功");
    let token = Cancellation::new();
    let ctx = WaitContext::new().with_cancellation(token.clone());

    let mut stream = Box::pin(queue.consume_with(ctx));
    assert_eq!(stream.next().await, Some(7));
    token.cancel();
    assert_eq!(stream.next().await, None, "取消后流终止");
}

/// 批量入队的预约可被取消，且不留下部分预约。
#[tokio::test]
async fn bulk_add_cancellation_returns_reservation() {
    let queue = BoundedQueue::bounded(2).expect("容量合法");
    queue.try_add(0).expect("入队成功");
    queue.try_add(1).expect("入队成功");

    let token = Cancellation::new();
    let ctx = WaitContext::new().with_cancellation(token.clone());
    let mut bulk = Box::pin(queue.add_many_with(vec![2, 3, 4], &ctx));
    assert!(futures::poll!(bulk.as_mut()).is_pending(), "容量不足时预约挂起");

    token.cancel();
    let rejected = bulk.await.expect_err("取消必须使批量入队失败");
    assert_eq!(rejected.reason, WaitError::Cancelled);
    assert_eq!(rejected.remaining, vec![2, 3, 4], "未入队元素全部返还");

    // 预约已如数归还：腾出空间后新的入队立即成功。
    assert_eq!(queue.take().await, Ok(0));
    queue.try_add(9).expect("归还预约后空位可用");
}
