//! 审批层：代码出站 / 结果回流两处人工审批闸门

pub mod gate;

pub use gate::{ApprovalGate, Decision, GateError};
