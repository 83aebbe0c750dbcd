//! OpenAI 兼容模型客户端（含 Azure OpenAI）
//!
//! 通过 async_openai 调用 OpenAI 兼容端点（可配置 base_url）或 Azure 部署；账本经 prompt::to_prompt_messages 展开。
//! 默认随请求声明 run_r_code 函数，模型的函数调用参数即提议的代码；fenced 模式下改为从回复文本里解析 ```r 代码块。

use std::time::Duration;

use async_openai::config::{AzureConfig, Config, OpenAIConfig};
use async_openai::types::chat::{
    ChatCompletionMessageToolCall, ChatCompletionMessageToolCalls,
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestToolMessageArgs,
    ChatCompletionRequestUserMessageArgs, ChatCompletionTool, ChatCompletionToolChoiceOption,
    ChatCompletionTools, CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
    FunctionCall, FunctionObjectArgs, ToolChoiceOptions,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::llm::prompt::{
    parse_model_output, parse_tool_arguments, run_r_code_parameters, to_prompt_messages, CodeFormat,
    PromptMessage, PromptRole, RUN_R_CODE, RUN_R_CODE_DESCRIPTION,
};
use crate::llm::{LlmClient, LlmError, ModelTurn};
use crate::memory::Message;

fn malformed(e: async_openai::error::OpenAIError) -> LlmError {
    LlmError::Malformed(e.to_string())
}

/// OpenAI 兼容客户端：持有 Client、model（Azure 下为部署名）、system prompt、代码格式与单次请求超时
pub struct OpenAiClient {
    client: Client<Box<dyn Config>>,
    model: String,
    system_prompt: String,
    code_format: CodeFormat,
    request_timeout: Duration,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_default();

        let mut config = OpenAIConfig::new().with_api_key(api_key);
        if let Some(url) = base_url {
            config = config.with_api_base(url);
        }
        Self::with_backend(Box::new(config), model)
    }

    /// Azure OpenAI：endpoint 形如 https://<resource>.openai.azure.com，请求发往该部署
    pub fn azure(endpoint: &str, deployment: &str, api_version: &str, api_key: &str) -> Self {
        let config = AzureConfig::new()
            .with_api_base(endpoint.trim_end_matches('/'))
            .with_deployment_id(deployment)
            .with_api_version(api_version)
            .with_api_key(api_key);
        Self::with_backend(Box::new(config), deployment)
    }

    fn with_backend(config: Box<dyn Config>, model: &str) -> Self {
        let code_format = CodeFormat::default();
        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            system_prompt: code_format.system_prompt().to_string(),
            code_format,
            request_timeout: Duration::from_secs(60),
        }
    }

    /// 切换代码格式；system prompt 同时换成该格式的内置版本（之后仍可用 with_system_prompt 覆盖）
    pub fn with_code_format(mut self, format: CodeFormat) -> Self {
        self.code_format = format;
        self.system_prompt = format.system_prompt().to_string();
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn to_openai_messages(
        &self,
        messages: &[PromptMessage],
    ) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
        messages
            .iter()
            .map(|m| {
                Ok(match m.role {
                    PromptRole::System => ChatCompletionRequestMessage::System(
                        ChatCompletionRequestSystemMessageArgs::default()
                            .content(m.content.clone())
                            .build()
                            .map_err(malformed)?,
                    ),
                    PromptRole::User => ChatCompletionRequestMessage::User(
                        ChatCompletionRequestUserMessageArgs::default()
                            .content(m.content.clone())
                            .build()
                            .map_err(malformed)?,
                    ),
                    PromptRole::Assistant => {
                        let mut args = ChatCompletionRequestAssistantMessageArgs::default();
                        if !m.content.is_empty() {
                            args.content(m.content.clone());
                        }
                        if let (Some(id), Some(code)) = (&m.tool_call_id, &m.code) {
                            args.tool_calls(vec![run_r_code_call(id, code)]);
                        }
                        ChatCompletionRequestMessage::Assistant(args.build().map_err(malformed)?)
                    }
                    PromptRole::Tool => ChatCompletionRequestMessage::Tool(
                        ChatCompletionRequestToolMessageArgs::default()
                            .content(m.content.clone())
                            .tool_call_id(m.tool_call_id.clone().unwrap_or_default())
                            .build()
                            .map_err(malformed)?,
                    ),
                })
            })
            .collect()
    }

    fn build_request(&self, history: &[Message]) -> Result<CreateChatCompletionRequest, LlmError> {
        let prompt = to_prompt_messages(&self.system_prompt, history, self.code_format);
        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&self.model)
            .temperature(0.0)
            .messages(self.to_openai_messages(&prompt)?);
        if self.code_format == CodeFormat::ToolCall {
            args.tools(vec![run_r_code_tool()?])
                .tool_choice(ChatCompletionToolChoiceOption::Mode(ToolChoiceOptions::Auto));
        }
        args.build().map_err(malformed)
    }
}

fn run_r_code_tool() -> Result<ChatCompletionTools, LlmError> {
    let function = FunctionObjectArgs::default()
        .name(RUN_R_CODE)
        .description(RUN_R_CODE_DESCRIPTION)
        .parameters(run_r_code_parameters())
        .build()
        .map_err(malformed)?;
    Ok(ChatCompletionTools::Function(ChatCompletionTool { function }))
}

fn run_r_code_call(id: &str, code: &str) -> ChatCompletionMessageToolCalls {
    ChatCompletionMessageToolCalls::Function(ChatCompletionMessageToolCall {
        id: id.to_string(),
        function: FunctionCall {
            name: RUN_R_CODE.to_string(),
            arguments: serde_json::json!({ "code": code }).to_string(),
        },
    })
}

/// 模型回复 -> ModelTurn
///
/// ToolCall：code 取第一个 run_r_code 调用的参数，文本原样作为 text（不解析代码块）；
/// Fenced：从文本中解析第一个 R 代码块。
pub fn turn_from_response(
    content: Option<&str>,
    tool_calls: &[ChatCompletionMessageToolCalls],
    format: CodeFormat,
) -> ModelTurn {
    match format {
        CodeFormat::Fenced => parse_model_output(content.unwrap_or_default()),
        CodeFormat::ToolCall => {
            let mut calls = tool_calls.iter().filter_map(|call| match call {
                ChatCompletionMessageToolCalls::Function(call) if call.function.name == RUN_R_CODE => {
                    Some(&call.function.arguments)
                }
                _ => None,
            });
            let code = calls.next().and_then(|args| parse_tool_arguments(args));
            if calls.next().is_some() {
                tracing::debug!("model issued several run_r_code calls, only the first is used");
            }
            ModelTurn {
                text: content
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(String::from),
                code,
            }
        }
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, history: &[Message]) -> Result<ModelTurn, LlmError> {
        let request = self.build_request(history)?;

        let response = tokio::time::timeout(self.request_timeout, self.client.chat().create(request))
            .await
            .map_err(|_| {
                LlmError::Request(format!(
                    "model request timed out after {}s",
                    self.request_timeout.as_secs()
                ))
            })?
            .map_err(|e| LlmError::Request(e.to_string()))?;

        if let Some(usage) = &response.usage {
            tracing::debug!(
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "model usage"
            );
        }

        let message = &response
            .choices
            .first()
            .ok_or_else(|| LlmError::Malformed("response contained no choices".to_string()))?
            .message;

        Ok(turn_from_response(
            message.content.as_deref(),
            message.tool_calls.as_deref().unwrap_or_default(),
            self.code_format,
        ))
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    fn call(name: &str, arguments: &str) -> ChatCompletionMessageToolCalls {
        ChatCompletionMessageToolCalls::Function(ChatCompletionMessageToolCall {
            id: "call_abc".to_string(),
            function: FunctionCall {
                name: name.to_string(),
                arguments: arguments.to_string(),
            },
        })
    }

    /// 单次应答的 HTTP 桩：读完整个请求后返回 200 + 给定 JSON，并把请求原文交回
    async fn one_shot_server(body: String) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = sock.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf).to_string();
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let length = text[..head_end]
                        .lines()
                        .find_map(|l| {
                            let (name, value) = l.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())?
                        })
                        .unwrap_or(0);
                    if buf.len() >= head_end + 4 + length {
                        break;
                    }
                }
            }
            let resp = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            sock.write_all(resp.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&buf).to_string()
        });
        (format!("http://{}", addr), handle)
    }

    fn completion(message: serde_json::Value) -> String {
        serde_json::json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "created": 1,
            "model": "gpt-4o-mini",
            "choices": [{ "index": 0, "message": message, "finish_reason": "stop" }]
        })
        .to_string()
    }

    fn request_body(request: &str) -> serde_json::Value {
        let body = &request[request.find("\r\n\r\n").unwrap() + 4..];
        serde_json::from_str(body).unwrap()
    }

    #[test]
    fn test_tool_call_arguments_become_code() {
        let turn = turn_from_response(
            Some("Let me compute it."),
            &[call(RUN_R_CODE, r#"{"code":"mean(c(1,2,3))"}"#)],
            CodeFormat::ToolCall,
        );
        assert_eq!(turn.code.as_deref(), Some("mean(c(1,2,3))"));
        assert_eq!(turn.text.as_deref(), Some("Let me compute it."));
    }

    #[test]
    fn test_tool_call_mode_ignores_fenced_text() {
        let turn = turn_from_response(
            Some("Example:\n```r\nunlink('data.csv')\n```"),
            &[],
            CodeFormat::ToolCall,
        );
        assert!(turn.code.is_none());
        assert!(turn.text.unwrap().contains("unlink"));
    }

    #[test]
    fn test_tool_call_mode_skips_other_functions() {
        let turn = turn_from_response(
            None,
            &[call("get_weather", r#"{"city":"Paris"}"#), call(RUN_R_CODE, r#"{"code":"1 + 1"}"#)],
            CodeFormat::ToolCall,
        );
        assert_eq!(turn.code.as_deref(), Some("1 + 1"));
        assert!(turn.text.is_none());
    }

    #[test]
    fn test_fenced_mode_parses_code_block() {
        let turn = turn_from_response(
            Some("Running:\n```r\nsummary(cars)\n```"),
            &[call(RUN_R_CODE, r#"{"code":"ignored"}"#)],
            CodeFormat::Fenced,
        );
        assert_eq!(turn.code.as_deref(), Some("summary(cars)"));
    }

    #[test]
    fn test_request_declares_run_r_code_only_in_tool_mode() {
        let mut answered = Message::model(None, Some("mean(c(1,2,3))".into()));
        answered.code_result = Some("[1] 2".into());
        let history = vec![Message::user("compute mean of 1,2,3"), answered];

        let client = OpenAiClient::new(Some("http://127.0.0.1:1/v1"), "gpt-4o-mini", Some("k"));
        let request = serde_json::to_value(client.build_request(&history).unwrap()).unwrap();
        assert_eq!(request["temperature"], 0.0);
        assert_eq!(request["tools"][0]["type"], "function");
        assert_eq!(request["tools"][0]["function"]["name"], RUN_R_CODE);
        assert_eq!(request["tool_choice"], "auto");
        let messages = request["messages"].as_array().unwrap();
        assert_eq!(messages[2]["role"], "assistant");
        assert_eq!(messages[2]["tool_calls"][0]["function"]["name"], RUN_R_CODE);
        assert_eq!(messages[3]["role"], "tool");
        assert_eq!(messages[3]["tool_call_id"], messages[2]["tool_calls"][0]["id"]);

        let fenced = client.with_code_format(CodeFormat::Fenced);
        let request = serde_json::to_value(fenced.build_request(&history).unwrap()).unwrap();
        assert!(request.get("tools").is_none());
        assert!(request["messages"][2]["content"]
            .as_str()
            .unwrap()
            .contains("```r"));
    }

    #[tokio::test]
    async fn test_complete_maps_tool_call_to_code() {
        let (base, server) = one_shot_server(completion(serde_json::json!({
            "role": "assistant",
            "content": null,
            "tool_calls": [{
                "id": "call_1",
                "type": "function",
                "function": { "name": "run_r_code", "arguments": "{\"code\":\"mean(c(1,2,3))\"}" }
            }]
        })))
        .await;

        let client = OpenAiClient::new(Some(&format!("{}/v1", base)), "gpt-4o-mini", Some("k"));
        let turn = client
            .complete(&[Message::user("compute mean of 1,2,3")])
            .await
            .unwrap();
        assert_eq!(turn.code.as_deref(), Some("mean(c(1,2,3))"));

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /v1/chat/completions"));
        assert_eq!(request_body(&request)["tools"][0]["function"]["name"], RUN_R_CODE);
    }

    #[tokio::test]
    async fn test_complete_fenced_fallback() {
        let (base, server) = one_shot_server(completion(serde_json::json!({
            "role": "assistant",
            "content": "Running:\n```r\nsummary(cars)\n```"
        })))
        .await;

        let client = OpenAiClient::new(Some(&format!("{}/v1", base)), "local-model", Some("k"))
            .with_code_format(CodeFormat::Fenced);
        let turn = client.complete(&[Message::user("summarize cars")]).await.unwrap();
        assert_eq!(turn.code.as_deref(), Some("summary(cars)"));
        assert_eq!(turn.text.as_deref(), Some("Running:"));

        let request = server.await.unwrap();
        assert!(request_body(&request).get("tools").is_none());
    }

    #[tokio::test]
    async fn test_azure_routes_to_deployment() {
        let (base, server) = one_shot_server(completion(serde_json::json!({
            "role": "assistant",
            "content": "Hello."
        })))
        .await;

        let client = OpenAiClient::azure(&base, "r-pilot", "2023-07-01-preview", "azure-key");
        let turn = client.complete(&[Message::user("hi")]).await.unwrap();
        assert_eq!(turn, ModelTurn::text("Hello."));

        let request = server.await.unwrap();
        assert!(request.starts_with(
            "POST /openai/deployments/r-pilot/chat/completions?api-version=2023-07-01-preview"
        ));
        assert!(request.to_lowercase().contains("api-key: azure-key"));
    }
}
