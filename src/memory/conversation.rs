//! 消息账本：单个会话的对话历史
//!
//! 按插入顺序保存 user / model 两类消息，作为模型上下文整体发送；只追加、不删除、不重排。
//! 会话重置时整体替换为空账本。

use serde::{Deserialize, Serialize};

/// 消息角色
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

/// 单条消息：code 与 code_result 属于同一轮；code_result 只在代码经审批并执行后写入
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    /// 模型回合尚未返回时为空
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_result: Option<String>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: Some(text.into()),
            code: None,
            code_result: None,
        }
    }

    pub fn model(text: Option<String>, code: Option<String>) -> Self {
        Self {
            role: Role::Model,
            text,
            code,
            code_result: None,
        }
    }

    pub fn has_code(&self) -> bool {
        self.code.is_some()
    }
}

/// 只追加的对话账本
#[derive(Clone, Debug, Default)]
pub struct MessageLedger {
    messages: Vec<Message>,
}

impl MessageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, msg: Message) {
        self.messages.push(msg);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// 最近一条带 code 的消息
    pub fn last_with_code(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.has_code())
    }

    /// 为最近一条带 code 的消息写入执行结果；不存在或已写入时返回 false
    pub fn record_code_result(&mut self, result: impl Into<String>) -> bool {
        match self.messages.iter_mut().rev().find(|m| m.has_code()) {
            Some(msg) if msg.code_result.is_none() => {
                msg.code_result = Some(result.into());
                true
            }
            _ => false,
        }
    }

    pub fn reset(&mut self) {
        self.messages.clear();
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
