//! R-Pilot - 大模型 + 沙箱 R 解释器的对话编排，带人工审批闸门
//!
//! 模块划分：
//! - **agent**: 运行时装配（模型、解释器工厂、凭证、会话管理器）
//! - **approval**: 代码出站 / 结果回流审批闸门
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 认证、轮次状态机、会话生命周期
//! - **interpreter**: 解释器会话客户端（WebSocket / Mock）
//! - **llm**: 模型客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **memory**: 对话账本
//! - **workspace**: 与解释器共享的工作目录

pub mod agent;
pub mod approval;
pub mod config;
pub mod core;
pub mod interpreter;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod workspace;
