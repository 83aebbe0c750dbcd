//! 轮次状态与过程事件
//!
//! RoundState 对外只有三个值；等待审批是 waiting_for_model 与 waiting_for_interpreter 之间的同步子阶段，
//! 通过 RoundEvent::AwaitingApproval 告知 UI，而不是单独的状态值。

use serde::Serialize;

/// 轮次状态（UI 据此锁定输入、显示 thinking / running）
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundState {
    #[default]
    NotActive,
    WaitingForModel,
    WaitingForInterpreter,
}

impl std::fmt::Display for RoundState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoundState::NotActive => write!(f, "not active"),
            RoundState::WaitingForModel => write!(f, "waiting for model"),
            RoundState::WaitingForInterpreter => write!(f, "waiting for interpreter"),
        }
    }
}

/// 两处审批闸门
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    /// 出站：模型提议的代码
    Code,
    /// 回流：执行结果
    Result,
}

impl std::fmt::Display for GateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateKind::Code => write!(f, "code"),
            GateKind::Result => write!(f, "result"),
        }
    }
}

/// 非致命的轮次结局
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "gate", rename_all = "snake_case")]
pub enum RoundOutcome {
    /// 模型给出不含代码的最终回复
    Completed,
    /// 人工在某处闸门拒绝
    Rejected(GateKind),
}

/// 轮次过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoundEvent {
    StateChanged { state: RoundState },
    /// 模型的文字回复
    ModelText { text: String },
    CodeProposed { code: String },
    AwaitingApproval { gate: GateKind, content: String },
    /// 解释器返回（成功输出或失败文本）
    CodeResult { text: String },
    Rejected { gate: GateKind },
    Finished,
    Error { text: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display_matches_ui_labels() {
        assert_eq!(RoundState::NotActive.to_string(), "not active");
        assert_eq!(RoundState::WaitingForModel.to_string(), "waiting for model");
        assert_eq!(
            RoundState::WaitingForInterpreter.to_string(),
            "waiting for interpreter"
        );
    }

    #[test]
    fn test_event_json_shape() {
        let ev = RoundEvent::AwaitingApproval {
            gate: GateKind::Code,
            content: "1 + 1".into(),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "awaiting_approval");
        assert_eq!(json["gate"], "code");
    }
}
