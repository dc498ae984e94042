//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为全部同步原语提供统一的错误域：取消、超时、关闭、复用协议违规等待路径
//!   上可能出现的失败在此收敛，避免各原语自行约定导致语义漂移；
//! - 搭配 [`codes`] 模块提供稳定错误码，供日志与告警系统做机读分类。
//!
//! ## 设计要求（What）
//! - 错误类型实现 `thiserror::Error`，兼容 `std::error::Error` 生态；
//! - 变体携带的上下文一律面向排障人员，不包含敏感信息；
//! - `Result` 别名默认以 [`WaitError`] 作为错误类型，减少样板代码。
//!
//! ## 扩展建议（How）
//! - 新增变体时必须同步登记 [`codes`] 中的稳定码值，并遵循 `lockstep.<语义>` 命名；
//! - 若上层需要重试决策，应依据 [`WaitError::code`] 查表，而非解析 Display 文本。

use core::fmt;

use thiserror::Error;

/// 稳定错误码集中定义，命名遵循 `lockstep.<语义>` 约定。
///
/// # 教案式说明
/// - **意图 (Why)**：日志、指标与告警需要与版本无关的稳定标识；Display 文本可能随排障
///   体验优化而调整，错误码则承诺不变。
/// - **契约 (What)**：每个常量与 [`WaitError`] 的一个变体一一对应，新增变体时必须同步扩充。
pub mod codes {
    /// 外部取消令牌在操作完成前被触发。
    pub const CANCELLED: &str = "lockstep.cancelled";
    /// 等待超过了调用方设定的截止时间。
    pub const TIMED_OUT: &str = "lockstep.timeout";
    /// 原语已关闭且资源耗尽，无法再受理新的操作。
    pub const CLOSED: &str = "lockstep.closed";
    /// 聚合等待的全部候选原语均已关闭。
    pub const ALL_CLOSED: &str = "lockstep.all_closed";
    /// 有界队列的计数器与底层容器出现不可恢复的偏差。
    pub const FAULTED: &str = "lockstep.faulted";
    /// 句柄被重复释放、版本不匹配等复用协议违规。
    pub const MISUSE: &str = "lockstep.misuse";
    /// 入参越界：零容量、零批量、会导致计数溢出的增量等。
    pub const INVALID_ARGUMENT: &str = "lockstep.invalid_argument";
}

/// 等待路径的统一错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：每个挂起的等待者同时面对完成、取消、超时、关闭四类竞争事实，
///   调用方必须能以单一类型精确区分最终胜出的事实；
/// - **契约 (What)**：
///   - 所有变体均为 `Send + Sync + 'static`，可安全跨线程传播；
///   - 对任一等待者，四类终态中至多有一个会以该错误（或成功值）的形式被观测到；
///   - `TimedOut` 与 `Cancelled` 严格区分，便于定时便捷方法把超时翻译为
///     `Ok(None)` 而不吞掉真实取消；
/// - **设计权衡 (Trade-offs)**：`Misuse`/`InvalidArgument` 携带 `String` 细节，
///   牺牲少量堆分配换取排障可读性；热路径错误（取消/超时/关闭）均为零负载变体。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[non_exhaustive]
pub enum WaitError {
    /// 外部取消令牌先于操作完成被触发。
    #[error("wait was cancelled by an external token")]
    Cancelled,

    /// 截止时间先于操作完成到期。
    ///
    /// - **契约 (What)**：`*_for` 便捷方法会把该错误翻译为 `Ok(None)`，
    ///   其余路径原样上抛，调用方可据此区分“到点放弃”与“主动取消”。
    #[error("wait exceeded its deadline")]
    TimedOut,

    /// 原语已关闭且无剩余资源可供消费。
    ///
    /// - **意图 (Why)**：关闭是排空式的——关闭发起后剩余资源仍可被取走，
    ///   只有“关闭且已排空”才会以该错误拒绝操作。
    #[error("primitive is closed and drained")]
    Closed,

    /// 聚合等待（decrement-any / take-from-any）的全部候选均已关闭。
    #[error("every candidate primitive is closed")]
    AllClosed,

    /// 有界队列检测到计数器与底层容器的承诺不再一致。
    ///
    /// - **风险 (Trade-offs)**：该状态不可恢复，后续所有操作都会以同样的错误失败；
    ///   出现时应视为实现或内存安全层面的缺陷并立即上报。
    #[error("queue accounting diverged from its container; all operations fail")]
    Faulted,

    /// 句柄复用协议违规：重复释放、版本不匹配、并发升级冲突等。
    #[error("handle protocol violated: {detail}")]
    Misuse {
        /// 违规的具体说明，例如 `"permit released twice"`。
        detail: String,
    },

    /// 调用入参越界。
    #[error("invalid argument: {detail}")]
    InvalidArgument {
        /// 越界的具体说明，例如 `"capacity must be at least 1"`。
        detail: String,
    },
}

impl WaitError {
    /// 构造复用协议违规错误。
    pub fn misuse(detail: impl Into<String>) -> Self {
        WaitError::Misuse {
            detail: detail.into(),
        }
    }

    /// 构造入参越界错误。
    pub fn invalid_argument(detail: impl Into<String>) -> Self {
        WaitError::InvalidArgument {
            detail: detail.into(),
        }
    }

    /// 返回与变体一一对应的稳定错误码。
    ///
    /// # 教案式说明
    /// - **意图 (Why)**：日志聚合与自动化治理依赖与版本无关的标识；
    /// - **契约 (What)**：返回值恒为 [`codes`] 中登记的 `'static` 字符串，查询无副作用。
    pub fn code(&self) -> &'static str {
        match self {
            WaitError::Cancelled => codes::CANCELLED,
            WaitError::TimedOut => codes::TIMED_OUT,
            WaitError::Closed => codes::CLOSED,
            WaitError::AllClosed => codes::ALL_CLOSED,
            WaitError::Faulted => codes::FAULTED,
            WaitError::Misuse { .. } => codes::MISUSE,
            WaitError::InvalidArgument { .. } => codes::INVALID_ARGUMENT,
        }
    }

    /// 当前错误是否由关闭（而非取消/超时）导致。
    pub fn is_closed(&self) -> bool {
        matches!(self, WaitError::Closed | WaitError::AllClosed)
    }
}

/// 入队被拒绝时的返回载体，物归原主。
///
/// # 教案式说明
/// - **意图 (Why)**：入队路径拒绝元素时不得吞掉调用方的所有权，
///   因此以结构体形式同时返还元素与拒绝原因；
/// - **契约 (What)**：`item` 为原样返还的元素；`reason` 为 `None` 仅出现在
///   同步快路径，表示单纯没有空位可稍后重试；异步路径恒为 `Some`
///   （取消、超时、完成添加或已损坏）。
pub struct AddRejected<T> {
    /// 原样返还的元素。
    pub item: T,
    /// 拒绝原因；`None` 代表容量不足，可稍后重试。
    pub reason: Option<WaitError>,
}

impl<T> AddRejected<T> {
    pub(crate) fn full(item: T) -> Self {
        Self { item, reason: None }
    }

    pub(crate) fn because(item: T, reason: WaitError) -> Self {
        Self {
            item,
            reason: Some(reason),
        }
    }
}

impl<T> fmt::Debug for AddRejected<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddRejected")
            .field("reason", &self.reason)
            .finish_non_exhaustive()
    }
}

/// 批量入队中途被拒绝时的返回载体。
///
/// - **契约 (What)**：`remaining` 为尚未入队的元素（保持原有顺序）；
///   已入队的元素保留在队列中，不做撤销。
pub struct BulkAddRejected<T> {
    /// 尚未入队的元素，保持原有顺序。
    pub remaining: Vec<T>,
    /// 拒绝原因。
    pub reason: WaitError,
}

impl<T> fmt::Debug for BulkAddRejected<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkAddRejected")
            .field("remaining_len", &self.remaining.len())
            .field("reason", &self.reason)
            .finish()
    }
}

/// 框架统一的返回值别名，默认错误类型为 [`WaitError`]。
pub type Result<T, E = WaitError> = core::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_and_unique() {
        let all = [
            WaitError::Cancelled.code(),
            WaitError::TimedOut.code(),
            WaitError::Closed.code(),
            WaitError::AllClosed.code(),
            WaitError::Faulted.code(),
            WaitError::misuse("x").code(),
            WaitError::invalid_argument("y").code(),
        ];
        for (i, code) in all.iter().enumerate() {
            assert!(code.starts_with("lockstep."), "错误码必须带 lockstep 前缀");
            assert!(
                !all[i + 1..].contains(code),
                "错误码 {code} 出现重复，机读分类将失效"
            );
        }
    }

    #[test]
    fn timeout_is_distinguishable_from_cancellation() {
        assert_ne!(WaitError::TimedOut, WaitError::Cancelled);
        assert!(!WaitError::TimedOut.is_closed());
        assert!(WaitError::AllClosed.is_closed());
    }
}
