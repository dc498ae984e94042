#![deny(unsafe_code)]
#![doc = "lockstep-core: 面向协作式调度的异步同步原语库。"]
#![doc = ""]
#![doc = "== 定位与边界 =="]
#![doc = "本 Crate 提供一组在可挂起任务之间协调的同步对象：计数器、有界队列、自动/手动复位事件、信号量、双边切换锁、读写锁（含升级）与键控锁。所有原语不阻塞底层执行线程，不派生任务，也不绑定具体调度器；未携带超时的等待可运行在任意执行器上，超时能力由 `runtime-tokio` 特性引入 Tokio 计时器提供。"]
#![doc = ""]
#![doc = "== 共享协议 =="]
#![doc = "每个挂起操作由一个等待节点承载，同时与完成、取消、超时、关闭四类事实赛跑；唯一的裁决点是节点状态的比较交换，胜出方拥有结果，失败方按各自协议回滚。被授予却被放弃的资源自动回流原语，调用方不会观测到丢失的额度。"]
#![doc = ""]
#![doc = "== 错误域 =="]
#![doc = "全部原语共享 [`WaitError`] 错误域与 `lockstep.<语义>` 稳定错误码；超时与取消严格区分，`*_for` 定时便捷方法把超时翻译为 `Ok(None)`/`Ok(false)` 而不吞掉真实取消。"]

mod closing;
pub mod context;
pub mod counter;
pub mod error;
pub mod event;
pub mod keyed;
pub mod prelude;
pub mod queue;
pub mod rwlock;
pub mod semaphore;
pub mod switch;
mod waiter;

pub use context::{Cancellation, WaitContext};
pub use counter::Counter;
pub use error::{AddRejected, BulkAddRejected, Result, WaitError, codes};
pub use event::{AutoResetEvent, ManualResetEvent};
pub use keyed::{KeyedGuard, KeyedLock};
pub use queue::BoundedQueue;
pub use rwlock::{ReadGuard, ReadWriteLock, UpgradeFailed, WriteGuard};
pub use semaphore::{Semaphore, SemaphorePermit};
pub use switch::{Fairness, Side, SwitchGuard, SwitchLock};
