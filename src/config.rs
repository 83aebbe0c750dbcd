//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `RPILOT__*` 覆盖（双下划线表示嵌套，如 `RPILOT__ROUND__MAX_ITERATIONS=5`）。
//! 配置只在启动时读取，核心轮次逻辑拿到的是显式参数，不读取全局配置。

use std::path::PathBuf;

use serde::Deserialize;

use crate::core::{FailureText, RejectionPolicy, RoundOptions};
use crate::llm::CodeFormat;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub services: ServicesSection,
    pub llm: LlmSection,
    pub interpreter: InterpreterSection,
    pub round: RoundSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    /// 与解释器共享的工作目录，未设置时用 ./workspace
    pub workspace_root: Option<PathBuf>,
}

/// [services] 段：后端地址与认证 token
#[derive(Debug, Clone, Deserialize)]
pub struct ServicesSection {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    pub auth_token: Option<String>,
    /// 认证请求超时（秒）
    #[serde(default = "default_auth_timeout")]
    pub auth_timeout_secs: u64,
}

impl Default for ServicesSection {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            auth_token: None,
            auth_timeout_secs: default_auth_timeout(),
        }
    }
}

impl ServicesSection {
    /// 去掉末尾斜杠的服务地址
    pub fn base_url(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }
}

fn default_base_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_auth_timeout() -> u64 {
    10
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：openai / azure / mock
    #[serde(default = "default_provider")]
    pub provider: String,
    /// 模型名；azure 下为部署名
    #[serde(default = "default_model")]
    pub model: String,
    /// openai：兼容端点地址；azure：资源端点（未设置时读 AZURE_OPENAI_ENDPOINT）
    pub base_url: Option<String>,
    /// azure 的 api-version（未设置时读 AZURE_OPENAI_API_VERSION）
    pub api_version: Option<String>,
    /// 模型提议代码的方式：tool_call（run_r_code 函数调用）/ fenced（```r 代码块）
    #[serde(default)]
    pub code_format: CodeFormat,
    /// 覆盖内置 system prompt 的文件
    pub system_prompt_path: Option<PathBuf>,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            api_version: None,
            code_format: CodeFormat::default(),
            system_prompt_path: None,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    #[serde(default = "default_request_timeout")]
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    60
}

/// [interpreter] 段：解释器通道路径与时限
#[derive(Debug, Clone, Deserialize)]
pub struct InterpreterSection {
    #[serde(default = "default_interpreter_path")]
    pub path: String,
    /// 服务端执行时限（秒），客户端在此基础上加宽限
    #[serde(default = "default_interpreter_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for InterpreterSection {
    fn default() -> Self {
        Self {
            path: default_interpreter_path(),
            timeout_secs: default_interpreter_timeout(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

fn default_interpreter_path() -> String {
    "/api/interpreter/run".to_string()
}

fn default_interpreter_timeout() -> u64 {
    120
}

fn default_connect_timeout() -> u64 {
    10
}

/// [round] 段：轮次策略
#[derive(Debug, Clone, Deserialize)]
pub struct RoundSection {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default)]
    pub on_reject: RejectionPolicy,
    #[serde(default)]
    pub failure_text: FailureText,
    #[serde(default)]
    pub auto_approve_code: bool,
    #[serde(default)]
    pub auto_approve_result: bool,
}

impl Default for RoundSection {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            on_reject: RejectionPolicy::default(),
            failure_text: FailureText::default(),
            auto_approve_code: false,
            auto_approve_result: false,
        }
    }
}

fn default_max_iterations() -> usize {
    20
}

impl From<&RoundSection> for RoundOptions {
    fn from(section: &RoundSection) -> Self {
        RoundOptions {
            max_iterations: section.max_iterations.max(1),
            on_reject: section.on_reject,
            failure_text: section.failure_text,
            auto_approve_code: section.auto_approve_code,
            auto_approve_result: section.auto_approve_result,
        }
    }
}

/// 从 config 目录加载配置，环境变量 RPILOT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 RPILOT__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default", "default"] {
        if std::path::Path::new(&format!("{}.toml", name)).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(path) = config_path.filter(|p| p.exists()) {
        builder = builder.add_source(config::File::from(path).required(false));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("RPILOT")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
