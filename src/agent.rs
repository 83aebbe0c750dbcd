//! 运行时装配
//!
//! 从 AppConfig 构建模型客户端、解释器工厂、凭证与会话管理器，供 rpilot 控制台（或其它前端）使用。
//! 核心轮次逻辑不读配置，所有依赖都在这里显式注入。

use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::core::{AuthClient, Credential, InterpreterFactory, RoundOptions, SessionManager};
use crate::interpreter::{interpreter_url, Interpreter, MockInterpreter, WsInterpreter};
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient};

/// Azure 未配置 api-version 时的默认值
pub const DEFAULT_AZURE_API_VERSION: &str = "2023-07-01-preview";

/// 按配置选择模型后端：provider = "mock"，或缺少对应的 API key / Azure 端点时退回 Mock
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();

    let client = match provider.as_str() {
        "mock" => {
            tracing::info!("Using Mock LLM");
            return Arc::new(MockLlmClient::new());
        }
        "azure" => {
            let key = std::env::var("AZURE_OPENAI_API_KEY").ok();
            let endpoint = cfg
                .llm
                .base_url
                .clone()
                .or_else(|| std::env::var("AZURE_OPENAI_ENDPOINT").ok());
            let (Some(key), Some(endpoint)) = (key, endpoint) else {
                tracing::warn!("AZURE_OPENAI_API_KEY or endpoint missing, using Mock LLM");
                return Arc::new(MockLlmClient::new());
            };
            let api_version = cfg
                .llm
                .api_version
                .clone()
                .or_else(|| std::env::var("AZURE_OPENAI_API_VERSION").ok())
                .unwrap_or_else(|| DEFAULT_AZURE_API_VERSION.to_string());
            tracing::info!("Using Azure OpenAI deployment {} ({})", cfg.llm.model, api_version);
            OpenAiClient::azure(&endpoint, &cfg.llm.model, &api_version, &key)
        }
        _ => {
            let Ok(key) = std::env::var("OPENAI_API_KEY") else {
                tracing::warn!("No API key set or provider unknown, using Mock LLM");
                return Arc::new(MockLlmClient::new());
            };
            tracing::info!("Using OpenAI-compatible LLM ({})", cfg.llm.model);
            OpenAiClient::new(cfg.llm.base_url.as_deref(), &cfg.llm.model, Some(&key))
        }
    };

    let mut client = client
        .with_code_format(cfg.llm.code_format)
        .with_request_timeout(Duration::from_secs(cfg.llm.timeouts.request));
    if let Some(prompt) = load_system_prompt(cfg) {
        client = client.with_system_prompt(prompt);
    }
    Arc::new(client)
}

fn load_system_prompt(cfg: &AppConfig) -> Option<String> {
    let path = cfg.llm.system_prompt_path.as_ref()?;
    match std::fs::read_to_string(path) {
        Ok(prompt) if !prompt.trim().is_empty() => Some(prompt),
        Ok(_) => None,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "system prompt not readable, using built-in");
            None
        }
    }
}

/// 解释器工厂：每个新会话一个 WebSocket 会话；provider = "mock" 时用 MockInterpreter 离线运行
pub fn create_interpreter_factory(cfg: &AppConfig) -> InterpreterFactory {
    if cfg.llm.provider.eq_ignore_ascii_case("mock") {
        return Arc::new(|| Arc::new(MockInterpreter::new()) as Arc<dyn Interpreter>);
    }
    let url = interpreter_url(cfg.services.base_url(), &cfg.interpreter.path);
    let exec_timeout = Duration::from_secs(cfg.interpreter.timeout_secs);
    let connect_timeout = Duration::from_secs(cfg.interpreter.connect_timeout_secs);
    Arc::new(move || {
        Arc::new(WsInterpreter::new(url.clone(), exec_timeout, connect_timeout)) as Arc<dyn Interpreter>
    })
}

/// 校验配置（或 RPILOT__SERVICES__AUTH_TOKEN）中的 token；缺失或被拒绝时返回 None，轮次会以认证错误结束
pub async fn resolve_credential(cfg: &AppConfig) -> Option<Credential> {
    let token = cfg.services.auth_token.as_deref()?;
    let client = AuthClient::new(
        cfg.services.base_url(),
        Duration::from_secs(cfg.services.auth_timeout_secs),
    );
    match client.verify(token).await {
        Ok(credential) => {
            tracing::info!("Authenticated against {}", cfg.services.base_url());
            Some(credential)
        }
        Err(e) => {
            tracing::warn!(error = %e, "authentication failed");
            None
        }
    }
}

pub fn create_session_manager(cfg: &AppConfig) -> SessionManager {
    SessionManager::new(
        create_llm_from_config(cfg),
        create_interpreter_factory(cfg),
        RoundOptions::from(&cfg.round),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_token_yields_no_credential() {
        let cfg = AppConfig::default();
        assert!(resolve_credential(&cfg).await.is_none());
    }

    #[tokio::test]
    async fn test_mock_provider_builds_offline_session() {
        let mut cfg = AppConfig::default();
        cfg.llm.provider = "mock".to_string();
        let manager = create_session_manager(&cfg);
        let session = manager.current();
        let outcome = session
            .run_round("hello", Some(&Credential::new("t")), None)
            .await
            .unwrap();
        assert_eq!(outcome, crate::core::RoundOutcome::Completed);
        assert_eq!(session.history().len(), 2);
    }
}
