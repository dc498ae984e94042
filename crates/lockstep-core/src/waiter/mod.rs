//! 等待者协议栈：状态机、节点、队列与等待期 Future。
//!
//! # 模块结构（How）
//! - [`state`]：带类型标签的原子状态与 CAS 跃迁原语；
//! - [`node`]：单次等待的完成源、版本计数与唤醒载体；
//! - [`queue`]：支持任意位置摘除的 MPMC FIFO，内嵌节点池；
//! - [`future`]：所有原语共享的挂起 Future 与 [`future::WaitSite`] 落点契约。
//!
//! 该协议栈对外不可见：原语在各自模块内组合这些构件，公共 API 只暴露
//! 操作与错误语义。

pub(crate) mod future;
pub(crate) mod node;
pub(crate) mod queue;
pub(crate) mod state;

pub(crate) use future::{WaitSite, Waiting};
pub(crate) use node::DEMAND_ALL;
pub(crate) use queue::WaitQueue;
