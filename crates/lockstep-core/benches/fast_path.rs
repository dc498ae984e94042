//! 无竞争快路径微基准：计数器收支与信号量取还。

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use lockstep_core::prelude::*;

fn counter_fast_path(c: &mut Criterion) {
    let counter = Counter::new(1);
    c.bench_function("counter_try_decrement_add", |b| {
        b.iter(|| {
            assert!(black_box(&counter).try_decrement());
            counter.add(1).expect("活跃计数器的注入不应失败");
        });
    });
}

fn semaphore_fast_path(c: &mut Criterion) {
    let semaphore = Semaphore::new(4).expect("上限合法");
    c.bench_function("semaphore_try_acquire_release", |b| {
        b.iter(|| {
            let permit = black_box(&semaphore)
                .try_acquire()
                .expect("无竞争下必有许可");
            permit.release().expect("释放成功");
        });
    });
}

criterion_group!(fast_path, counter_fast_path, semaphore_fast_path);
criterion_main!(fast_path);
