//! 解释器层：沙箱 R 解释器会话客户端（WebSocket / Mock）

pub mod mock;
pub mod traits;
pub mod websocket;

pub use mock::MockInterpreter;
pub use traits::{ExecutionOutcome, Interpreter, SessionState};
pub use websocket::{interpreter_url, parse_reply, WsInterpreter, TIMEOUT_MESSAGE};
