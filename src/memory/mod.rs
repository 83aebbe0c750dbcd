//! 记忆层：会话内的对话账本

pub mod conversation;

pub use conversation::{Message, MessageLedger, Role};
