//! 轮次错误类型
//!
//! 只有致命错误会以 RoundError 形式传出 run；解释器运行错误 / 超时、审批拒绝都不是错误，
//! 它们作为普通账本内容或 RoundOutcome 返回。

use thiserror::Error;

use crate::approval::GateError;
use crate::llm::LlmError;

/// 一次对话轮次的致命失败；出现后 UI 应禁止继续交互直到会话重置
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoundError {
    /// 缺少或无效的凭证，轮次未开始
    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Model service error: {0}")]
    ModelService(#[from] LlmError),

    /// 解释器通道本身不可用
    #[error("Interpreter connection failure: {0}")]
    InterpreterConnection(String),

    /// 单轮模型调用次数达到上限（防止模型不停提议代码）
    #[error("Round stopped after {0} model calls")]
    IterationLimit(usize),

    /// 同一会话已有活跃轮次
    #[error("A round is already in progress for this session")]
    RoundInProgress,

    #[error("Approval gate error: {0}")]
    Gate(#[from] GateError),

    /// 会话被重置，进行中的轮次被放弃
    #[error("Session was reset")]
    SessionReset,
}

impl RoundError {
    /// 是否需要 UI 强制重置会话。
    /// 认证失败时轮次尚未开始、账本不变，换会话也换不来凭证，因此不强制重置
    pub fn requires_reset(&self) -> bool {
        !matches!(
            self,
            RoundError::RoundInProgress | RoundError::Authentication(_)
        )
    }
}
