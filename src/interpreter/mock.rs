//! Mock 解释器（用于测试与离线运行）
//!
//! 按脚本依次返回预设结果；脚本耗尽后返回空输出的 Success。记录每次收到的代码。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::core::Credential;
use crate::interpreter::{ExecutionOutcome, Interpreter, SessionState};

#[derive(Debug)]
pub struct MockInterpreter {
    script: Mutex<VecDeque<ExecutionOutcome>>,
    calls: AtomicUsize,
    codes: Mutex<Vec<String>>,
    state: Mutex<SessionState>,
}

impl Default for MockInterpreter {
    fn default() -> Self {
        Self::scripted(Vec::new())
    }
}

impl MockInterpreter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scripted(outcomes: impl IntoIterator<Item = ExecutionOutcome>) -> Self {
        Self {
            script: Mutex::new(outcomes.into_iter().collect()),
            calls: AtomicUsize::new(0),
            codes: Mutex::new(Vec::new()),
            state: Mutex::new(SessionState::Idle),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// 按调用顺序收到的代码
    pub fn codes(&self) -> Vec<String> {
        self.codes.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl Interpreter for MockInterpreter {
    async fn execute(&self, code: &str, _credential: &Credential) -> ExecutionOutcome {
        if self.state() == SessionState::Closed {
            return ExecutionOutcome::ConnectionFailure("interpreter session is closed".to_string());
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.codes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(code.to_string());
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = SessionState::Connected;

        self.script
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front()
            .unwrap_or_else(|| ExecutionOutcome::Success(String::new()))
    }

    async fn close(&self) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = SessionState::Closed;
    }

    fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}
