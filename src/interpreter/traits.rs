//! 解释器会话抽象
//!
//! execute 不做内部重试；RuntimeError / Timeout 对轮次非致命，ConnectionFailure 致命。

use async_trait::async_trait;
use serde::Serialize;

use crate::core::Credential;

/// 单次执行结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// 捕获的输出（stdout + stderr）
    Success(String),
    /// 沙箱内代码报错
    RuntimeError(String),
    /// 执行超过时限
    Timeout,
    /// 通道本身失败
    ConnectionFailure(String),
}

/// 会话生命周期
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// 尚未连接（首次 execute 时惰性建立）或连接已丢弃待重连
    Idle,
    Connected,
    /// 已关闭，不再接受执行
    Closed,
}

/// 解释器会话客户端：由会话持有，跨轮次顺序复用
#[async_trait]
pub trait Interpreter: Send + Sync {
    async fn execute(&self, code: &str, credential: &Credential) -> ExecutionOutcome;

    /// 关闭会话；不保证中止服务端正在运行的代码
    async fn close(&self);

    fn state(&self) -> SessionState;
}
