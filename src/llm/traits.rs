//! 模型服务抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 LlmClient：输入完整对话账本，输出一个模型回合（文本 + 可选代码）。

use async_trait::async_trait;
use thiserror::Error;

use crate::memory::Message;

/// 模型单次回复
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelTurn {
    pub text: Option<String>,
    pub code: Option<String>,
}

impl ModelTurn {
    /// 只有文本（轮次终止信号）
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            code: None,
        }
    }

    /// 文本 + 提议执行的代码
    pub fn with_code(text: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            code: Some(code.into()),
        }
    }
}

/// 模型调用失败（网络、非 2xx、响应格式不对）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("Request failed: {0}")]
    Request(String),

    #[error("Malformed response: {0}")]
    Malformed(String),
}

/// 模型服务客户端
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, history: &[Message]) -> Result<ModelTurn, LlmError>;
}
