//! 认证：凭证值与后端校验
//!
//! 凭证以显式值传入每个开启轮次的调用，核心代码不读取任何全局状态。
//! AuthClient::verify 调用 `POST {base}/api/auth/verify {token}`，成功才产出 Credential。

use std::time::Duration;

use thiserror::Error;

pub const AUTH_ERROR_MSG: &str = "Could not authenticate to backend. This probably means there is no \
or an invalid authentication token configured. Please check the startup console output of the \
backend and set a valid token (services.auth_token or RPILOT__SERVICES__AUTH_TOKEN).";

const VERIFY_PATH: &str = "/api/auth/verify";

/// 已校验的后端凭证
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    token: String,
}

impl Credential {
    /// 直接包装 token；调用方负责确保它已通过校验
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(***)")
    }
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("No authentication token provided")]
    MissingToken,

    #[error("Token rejected by backend (HTTP {0})")]
    Rejected(u16),

    #[error("Auth request failed: {0}")]
    Request(String),
}

/// 认证客户端
#[derive(Debug, Clone)]
pub struct AuthClient {
    http: reqwest::Client,
    base_url: String,
}

impl AuthClient {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub async fn verify(&self, token: &str) -> Result<Credential, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        let url = format!("{}{}", self.base_url, VERIFY_PATH);
        let resp = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "token": token }))
            .send()
            .await
            .map_err(|e| AuthError::Request(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            tracing::warn!(status = status.as_u16(), "token verification rejected");
            return Err(AuthError::Rejected(status.as_u16()));
        }
        tracing::info!("token verified");
        Ok(Credential::new(token))
    }
}
