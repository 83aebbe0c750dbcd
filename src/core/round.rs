//! 对话轮次编排器
//!
//! 一条用户消息对应一个 ChatRound：
//! 追加用户消息 -> 调模型 -> 若有代码则经代码闸门审批 -> 解释器执行 -> 结果经结果闸门审批
//! -> 写入 code_result 并带着更新后的账本再次调模型，直到模型回复不含代码。
//! 所有挂起点（模型、解释器、闸门）顺序等待，轮次内不并发；任何退出路径都会把状态复位为 not_active，
//! 挂起中的闸门请求随 future 一起释放。

use serde::Deserialize;
use tokio::sync::{mpsc, watch};

use crate::approval::{ApprovalGate, Decision};
use crate::core::{
    Credential, GateKind, RoundError, RoundEvent, RoundOutcome, RoundState, AUTH_ERROR_MSG,
};
use crate::interpreter::{ExecutionOutcome, Interpreter, TIMEOUT_MESSAGE};
use crate::llm::LlmClient;
use crate::memory::{Message, MessageLedger};

/// 审批被拒绝后的处理方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionPolicy {
    /// 直接结束轮次，账本不追加任何内容
    #[default]
    Silent,
    /// 结束前追加一条用户消息告知模型被拒绝（下一轮可见）
    NotifyModel,
}

/// 解释器失败写入 code_result 的文本形式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureText {
    /// 运行错误与超时分别表述
    #[default]
    Distinct,
    /// 统一为一种失败文本
    Merged,
}

impl FailureText {
    pub fn runtime_error(self, message: &str) -> String {
        match self {
            FailureText::Distinct => format!("Error: {}", message),
            FailureText::Merged => format!("ERROR: EXECUTION FAILED\n{}", message),
        }
    }

    pub fn timeout(self) -> String {
        match self {
            FailureText::Distinct => TIMEOUT_MESSAGE.to_string(),
            FailureText::Merged => "ERROR: EXECUTION FAILED\ntimeout reached".to_string(),
        }
    }
}

pub const CODE_REJECTED_NOTICE: &str = "The user declined to run the proposed code.";
pub const RESULT_REJECTED_NOTICE: &str = "The user declined to share the code result.";

/// 轮次策略
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundOptions {
    /// 单轮最多调用模型的次数
    pub max_iterations: usize,
    pub on_reject: RejectionPolicy,
    pub failure_text: FailureText,
    /// 新会话两处闸门的初始 auto_approve
    pub auto_approve_code: bool,
    pub auto_approve_result: bool,
}

impl Default for RoundOptions {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            on_reject: RejectionPolicy::default(),
            failure_text: FailureText::default(),
            auto_approve_code: false,
            auto_approve_result: false,
        }
    }
}

/// 单个轮次：持有账本、两处闸门、解释器、模型与凭证的引用；run 消费自身，不跨轮复用
pub struct ChatRound<'a> {
    ledger: &'a mut MessageLedger,
    code_gate: &'a ApprovalGate,
    result_gate: &'a ApprovalGate,
    interpreter: &'a dyn Interpreter,
    llm: &'a dyn LlmClient,
    credential: Option<&'a Credential>,
    options: RoundOptions,
    state_tx: Option<&'a watch::Sender<RoundState>>,
    history_tx: Option<&'a watch::Sender<Vec<Message>>>,
    event_tx: Option<&'a mpsc::UnboundedSender<RoundEvent>>,
}

impl<'a> ChatRound<'a> {
    pub fn new(
        ledger: &'a mut MessageLedger,
        code_gate: &'a ApprovalGate,
        result_gate: &'a ApprovalGate,
        interpreter: &'a dyn Interpreter,
        llm: &'a dyn LlmClient,
        credential: Option<&'a Credential>,
    ) -> Self {
        Self {
            ledger,
            code_gate,
            result_gate,
            interpreter,
            llm,
            credential,
            options: RoundOptions::default(),
            state_tx: None,
            history_tx: None,
            event_tx: None,
        }
    }

    pub fn with_options(mut self, options: RoundOptions) -> Self {
        self.options = options;
        self
    }

    /// 状态订阅通道
    pub fn with_state_tx(mut self, tx: &'a watch::Sender<RoundState>) -> Self {
        self.state_tx = Some(tx);
        self
    }

    /// 账本快照通道（每次追加或写入结果后发布）
    pub fn with_history_tx(mut self, tx: &'a watch::Sender<Vec<Message>>) -> Self {
        self.history_tx = Some(tx);
        self
    }

    /// 过程事件通道
    pub fn with_event_tx(mut self, tx: &'a mpsc::UnboundedSender<RoundEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// 驱动整轮交互。致命失败返回 RoundError；拒绝审批返回 Ok(Rejected)
    pub async fn run(mut self, user_text: &str) -> Result<RoundOutcome, RoundError> {
        let Some(credential) = self.credential else {
            tracing::warn!("round refused: no credential");
            self.emit(RoundEvent::Error {
                text: AUTH_ERROR_MSG.to_string(),
            });
            return Err(RoundError::Authentication(AUTH_ERROR_MSG.to_string()));
        };

        let _reset = StateReset {
            state_tx: self.state_tx,
            event_tx: self.event_tx,
        };
        self.ledger.append(Message::user(user_text));
        self.publish_history();

        let result = self.drive(credential).await;
        match &result {
            Ok(RoundOutcome::Completed) => {
                tracing::info!(messages = self.ledger.len(), "round completed");
                self.emit(RoundEvent::Finished);
            }
            Ok(RoundOutcome::Rejected(gate)) => {
                tracing::info!(gate = %gate, "round ended by rejection");
                self.emit(RoundEvent::Rejected { gate: *gate });
            }
            Err(e) => {
                tracing::warn!(error = %e, "round failed");
                self.emit(RoundEvent::Error { text: e.to_string() });
            }
        }
        result
    }

    async fn drive(&mut self, credential: &Credential) -> Result<RoundOutcome, RoundError> {
        let mut model_calls = 0;
        loop {
            if model_calls >= self.options.max_iterations {
                return Err(RoundError::IterationLimit(self.options.max_iterations));
            }
            model_calls += 1;

            self.set_state(RoundState::WaitingForModel);
            tracing::debug!(call = model_calls, history = self.ledger.len(), "calling model");
            let turn = self.llm.complete(self.ledger.messages()).await?;

            let code = turn.code.filter(|c| !c.trim().is_empty());
            if let Some(text) = turn.text.as_deref().filter(|t| !t.is_empty()) {
                self.emit(RoundEvent::ModelText {
                    text: text.to_string(),
                });
            }

            let Some(code) = code else {
                self.ledger.append(Message::model(turn.text, None));
                self.publish_history();
                return Ok(RoundOutcome::Completed);
            };

            self.ledger
                .append(Message::model(turn.text, Some(code.clone())));
            self.publish_history();
            self.emit(RoundEvent::CodeProposed { code: code.clone() });

            if self.ask(GateKind::Code, &code).await? == Decision::Rejected {
                return Ok(self.rejected(GateKind::Code));
            }

            self.set_state(RoundState::WaitingForInterpreter);
            let result_text = match self.interpreter.execute(&code, credential).await {
                ExecutionOutcome::Success(output) => output,
                ExecutionOutcome::RuntimeError(message) => {
                    self.options.failure_text.runtime_error(&message)
                }
                ExecutionOutcome::Timeout => self.options.failure_text.timeout(),
                ExecutionOutcome::ConnectionFailure(reason) => {
                    return Err(RoundError::InterpreterConnection(reason));
                }
            };
            self.emit(RoundEvent::CodeResult {
                text: result_text.clone(),
            });

            self.set_state(RoundState::WaitingForModel);
            if self.ask(GateKind::Result, &result_text).await? == Decision::Rejected {
                return Ok(self.rejected(GateKind::Result));
            }

            self.ledger.record_code_result(result_text);
            self.publish_history();
        }
    }

    async fn ask(&self, gate: GateKind, content: &str) -> Result<Decision, RoundError> {
        let target = match gate {
            GateKind::Code => self.code_gate,
            GateKind::Result => self.result_gate,
        };
        if !target.auto_approve() {
            self.emit(RoundEvent::AwaitingApproval {
                gate,
                content: content.to_string(),
            });
        }
        Ok(target.request(content).await?)
    }

    fn rejected(&mut self, gate: GateKind) -> RoundOutcome {
        if self.options.on_reject == RejectionPolicy::NotifyModel {
            let notice = match gate {
                GateKind::Code => CODE_REJECTED_NOTICE,
                GateKind::Result => RESULT_REJECTED_NOTICE,
            };
            self.ledger.append(Message::user(notice));
            self.publish_history();
        }
        RoundOutcome::Rejected(gate)
    }

    fn set_state(&self, state: RoundState) {
        if let Some(tx) = self.state_tx {
            if *tx.borrow() != state {
                tx.send_replace(state);
                self.emit(RoundEvent::StateChanged { state });
            }
        }
    }

    fn publish_history(&self) {
        if let Some(tx) = self.history_tx {
            tx.send_replace(self.ledger.messages().to_vec());
        }
    }

    fn emit(&self, event: RoundEvent) {
        if let Some(tx) = self.event_tx {
            let _ = tx.send(event);
        }
    }
}

/// 轮次结束（包括 future 被丢弃）时把状态复位为 not_active
struct StateReset<'a> {
    state_tx: Option<&'a watch::Sender<RoundState>>,
    event_tx: Option<&'a mpsc::UnboundedSender<RoundEvent>>,
}

impl Drop for StateReset<'_> {
    fn drop(&mut self) {
        if let Some(tx) = self.state_tx {
            if *tx.borrow() != RoundState::NotActive {
                tx.send_replace(RoundState::NotActive);
                if let Some(events) = self.event_tx {
                    let _ = events.send(RoundEvent::StateChanged {
                        state: RoundState::NotActive,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_text_distinct() {
        let ft = FailureText::Distinct;
        assert_eq!(ft.runtime_error("object 'x' not found"), "Error: object 'x' not found");
        assert_eq!(ft.timeout(), TIMEOUT_MESSAGE);
    }

    #[test]
    fn test_failure_text_merged_shares_prefix() {
        let ft = FailureText::Merged;
        let a = ft.runtime_error("boom");
        let b = ft.timeout();
        assert!(a.starts_with("ERROR: EXECUTION FAILED"));
        assert!(b.starts_with("ERROR: EXECUTION FAILED"));
    }
}
