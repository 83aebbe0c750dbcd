//! Mock 模型客户端（用于测试与离线运行，无需 API）
//!
//! 按脚本依次返回预设回合；脚本耗尽后回显最后一条用户消息（不含代码，轮次随即结束）。
//! 记录调用次数与每次收到的账本，便于断言调用顺序。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError, ModelTurn};
use crate::memory::{Message, Role};

#[derive(Debug, Default)]
pub struct MockLlmClient {
    script: Mutex<VecDeque<Result<ModelTurn, LlmError>>>,
    calls: AtomicUsize,
    histories: Mutex<Vec<Vec<Message>>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scripted(replies: impl IntoIterator<Item = Result<ModelTurn, LlmError>>) -> Self {
        Self {
            script: Mutex::new(replies.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn push(&self, reply: Result<ModelTurn, LlmError>) {
        self.script
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(reply);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// 每次调用时收到的账本快照
    pub fn histories(&self) -> Vec<Vec<Message>> {
        self.histories
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, history: &[Message]) -> Result<ModelTurn, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.histories
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(history.to_vec());

        let scripted = self
            .script
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front();
        if let Some(reply) = scripted {
            return reply;
        }

        let last_user = history
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .and_then(|m| m.text.as_deref())
            .unwrap_or("(no input)");
        Ok(ModelTurn::text(format!("Echo from Mock: {}", last_user)))
    }
}
