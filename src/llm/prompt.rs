//! Prompt 组装与模型输出解析
//!
//! 模型通过 `run_r_code` 函数调用提议代码（arguments 为 `{"code": "..."}`），执行结果以 tool 消息回流。
//! 不支持函数调用的端点可改用 fenced 模式：代码写在 ```r 代码块里，结果作为下一条 user 消息回流，
//! parse_model_output 反向从模型文本中取出第一个 R 代码块。

use serde::Deserialize;

use crate::llm::ModelTurn;
use crate::memory::{Message, Role};

/// 模型提议代码的函数名
pub const RUN_R_CODE: &str = "run_r_code";

pub const RUN_R_CODE_DESCRIPTION: &str = "Runs arbitrary R code and returns stdout and stderr. \
The code is executed in an interactive R shell, variables and loaded packages are preserved between calls. \
The environment has internet and file system access. \
The current working directory is shared with the user, so files can be exchanged. \
Base R is available, and you can install commonly used packages like dplyr, ggplot2, tidyr, and readr. \
You cannot show rich outputs like plots directly, but you can save them in the working directory and point the user to them. \
If the code runs too long, there will be a timeout. \
Use R's native pipe operator |> for data manipulation chains. \
You have a limited number of characters per response. Do NOT repeat the code outputs, as the user can already see them.";

/// run_r_code 的 JSON Schema 参数
pub fn run_r_code_parameters() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "code": {
                "type": "string",
                "description": "The R code to run"
            }
        },
        "required": ["code"]
    })
}

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are R-Pilot, a data analysis assistant. \
Use the run_r_code function whenever R code has to run; its stdout and stderr come back to you \
as the function result. Explain what you do briefly and answer in plain text once no more code \
needs to run.";

pub const FENCED_SYSTEM_PROMPT: &str = "You are R-Pilot, a data analysis assistant. \
To run R code, reply with exactly one fenced ```r code block; it is executed in an interactive R \
session and its stdout and stderr come back to you in the next message. Variables and loaded \
packages are preserved between calls. The session has internet and file system access, and its \
working directory is shared with the user, so files can be exchanged. Base R is available and you \
may install common packages such as dplyr, ggplot2, tidyr and readr. You cannot show plots \
directly: save them to the working directory and point the user to the file. Long-running code \
hits a timeout. Prefer R's native pipe |> for data manipulation chains. Do not repeat code \
outputs, the user can already see them. When no code needs to run, answer in plain text without \
a code block.";

/// fenced 模式下执行结果回流给模型时的前缀
pub const CODE_RESULT_PREFIX: &str = "Code result:";

/// 模型提议代码的方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeFormat {
    /// run_r_code 函数调用
    #[default]
    ToolCall,
    /// 回复文本中的 ```r 代码块（端点不支持函数调用时使用）
    Fenced,
}

impl CodeFormat {
    pub fn system_prompt(self) -> &'static str {
        match self {
            CodeFormat::ToolCall => DEFAULT_SYSTEM_PROMPT,
            CodeFormat::Fenced => FENCED_SYSTEM_PROMPT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptMessage {
    pub role: PromptRole,
    pub content: String,
    /// Assistant：发起的 run_r_code 调用 id；Tool：所回应的调用 id
    pub tool_call_id: Option<String>,
    /// Assistant 发起调用时的代码
    pub code: Option<String>,
}

impl PromptMessage {
    fn new(role: PromptRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
            code: None,
        }
    }

    fn tool_call(text: String, id: String, code: String) -> Self {
        Self {
            role: PromptRole::Assistant,
            content: text,
            tool_call_id: Some(id),
            code: Some(code),
        }
    }

    fn tool_result(id: String, result: &str) -> Self {
        Self {
            role: PromptRole::Tool,
            content: result.to_string(),
            tool_call_id: Some(id),
            code: None,
        }
    }
}

fn fenced(text: Option<&str>, code: &str) -> String {
    let mut content = text.unwrap_or_default().to_string();
    if !content.is_empty() {
        content.push_str("\n\n");
    }
    content.push_str(&format!("```r\n{}\n```", code.trim_end()));
    content
}

/// system prompt + 账本展开
///
/// ToolCall 模式下，有结果的代码消息展开为 assistant 函数调用 + tool 结果；
/// 没有结果的提议（被拒绝）只以代码块文本出现，不留下未回应的调用。
pub fn to_prompt_messages(
    system_prompt: &str,
    history: &[Message],
    format: CodeFormat,
) -> Vec<PromptMessage> {
    let mut out = vec![PromptMessage::new(PromptRole::System, system_prompt)];
    for (index, msg) in history.iter().enumerate() {
        match msg.role {
            Role::User => {
                if let Some(text) = msg.text.as_deref() {
                    out.push(PromptMessage::new(PromptRole::User, text));
                }
            }
            Role::Model => {
                let text = msg.text.as_deref().filter(|t| !t.is_empty());
                match (msg.code.as_deref(), msg.code_result.as_deref(), format) {
                    (Some(code), Some(result), CodeFormat::ToolCall) => {
                        let id = format!("call_{}", index);
                        out.push(PromptMessage::tool_call(
                            text.unwrap_or_default().to_string(),
                            id.clone(),
                            code.to_string(),
                        ));
                        out.push(PromptMessage::tool_result(id, result));
                    }
                    (Some(code), result, _) => {
                        out.push(PromptMessage::new(PromptRole::Assistant, fenced(text, code)));
                        if let Some(result) = result {
                            out.push(PromptMessage::new(
                                PromptRole::User,
                                format!("{}\n{}", CODE_RESULT_PREFIX, result),
                            ));
                        }
                    }
                    (None, _, _) => {
                        if let Some(text) = text {
                            out.push(PromptMessage::new(PromptRole::Assistant, text));
                        }
                    }
                }
            }
        }
    }
    out
}

/// run_r_code 的 arguments 取 code 字段；不是 JSON 时整段当作代码，空代码视为无代码
pub fn parse_tool_arguments(arguments: &str) -> Option<String> {
    let code = match serde_json::from_str::<serde_json::Value>(arguments) {
        Ok(value) => value.get("code")?.as_str()?.to_string(),
        Err(_) => arguments.to_string(),
    };
    let code = code.trim();
    (!code.is_empty()).then(|| code.to_string())
}

/// 取第一个 ```r / ```R / 无语言标记的代码块为 code，其余文字为 text；空代码块视为无代码
pub fn parse_model_output(raw: &str) -> ModelTurn {
    let mut search_from = 0;
    while let Some(rel) = raw[search_from..].find("```") {
        let fence = search_from + rel;
        let after_fence = fence + 3;
        let Some(nl) = raw[after_fence..].find('\n') else {
            break;
        };
        let label = raw[after_fence..after_fence + nl].trim();
        let body_start = after_fence + nl + 1;
        let Some(close_rel) = raw[body_start..].find("```") else {
            break;
        };
        let body_end = body_start + close_rel;
        let block_end = body_end + 3;

        if label.is_empty() || label.eq_ignore_ascii_case("r") {
            let code = raw[body_start..body_end].trim();
            let text = format!("{}\n\n{}", raw[..fence].trim(), raw[block_end..].trim());
            return ModelTurn {
                text: Some(text.trim().to_string()),
                code: (!code.is_empty()).then(|| code.to_string()),
            };
        }
        search_from = block_end;
    }
    ModelTurn::text(raw.trim())
}
