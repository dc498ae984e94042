//! 常用类型一揽子导入。
//!
//! # 使用方式（How）
//! - `use lockstep_core::prelude::*;` 后即可直接使用全部原语、守卫与
//!   错误类型；库内部不依赖本模块，仅作为调用方的便利入口。

pub use crate::context::{Cancellation, WaitContext};
pub use crate::counter::Counter;
pub use crate::error::{AddRejected, BulkAddRejected, Result, WaitError};
pub use crate::event::{AutoResetEvent, ManualResetEvent};
pub use crate::keyed::{KeyedGuard, KeyedLock};
pub use crate::queue::BoundedQueue;
pub use crate::rwlock::{ReadGuard, ReadWriteLock, UpgradeFailed, WriteGuard};
pub use crate::semaphore::{Semaphore, SemaphorePermit};
pub use crate::switch::{Fairness, Side, SwitchGuard, SwitchLock};
