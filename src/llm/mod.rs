//! 模型层：客户端抽象与实现（OpenAI 兼容 / Azure / Mock）、prompt 组装与输出解析

pub mod mock;
pub mod openai;
pub mod prompt;
pub mod traits;

pub use mock::MockLlmClient;
pub use openai::{turn_from_response, OpenAiClient};
pub use prompt::{
    parse_model_output, parse_tool_arguments, to_prompt_messages, CodeFormat, DEFAULT_SYSTEM_PROMPT,
    FENCED_SYSTEM_PROMPT, RUN_R_CODE,
};
pub use traits::{LlmClient, LlmError, ModelTurn};
