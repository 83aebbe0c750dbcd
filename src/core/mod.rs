//! 核心编排层：认证、错误、轮次状态机、会话生命周期

pub mod auth;
pub mod error;
pub mod round;
pub mod session;
pub mod state;

pub use auth::{AuthClient, AuthError, Credential, AUTH_ERROR_MSG};
pub use error::RoundError;
pub use round::{
    ChatRound, FailureText, RejectionPolicy, RoundOptions, CODE_REJECTED_NOTICE, RESULT_REJECTED_NOTICE,
};
pub use session::{InterpreterFactory, Session, SessionManager};
pub use state::{GateKind, RoundEvent, RoundOutcome, RoundState};
