//! WebSocket 解释器会话
//!
//! 协议（文本帧）：
//! 1. 连接 `{ws_base}{path}`，首帧发送 token；服务端回 `_ready_`，其它文本即初始化失败原因。
//! 2. 每次执行发送一帧代码，收到一帧回复：`_success_ <output>` 或 `_error_ <message>`；
//!    服务端超时以 `_success_ ERROR: TIMEOUT REACHED` 表示。
//!
//! 首次 execute 时才建立连接，之后跨轮次复用；连接失败或客户端等待超时后丢弃连接，下次重连。
//! 客户端放弃等待不会中止服务端正在执行的代码。

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::core::Credential;
use crate::interpreter::{ExecutionOutcome, Interpreter, SessionState};

pub const READY_REPLY: &str = "_ready_";
pub const SUCCESS_PREFIX: &str = "_success_";
pub const ERROR_PREFIX: &str = "_error_";
pub const TIMEOUT_MESSAGE: &str = "ERROR: TIMEOUT REACHED";

/// 服务端自身超时之外，客户端额外等待的宽限时间
const CLIENT_GRACE: Duration = Duration::from_secs(5);
/// 未知回复写入错误信息时的最大字符数
const REPLY_PREVIEW_CHARS: usize = 200;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// http(s) 服务地址转换为 ws(s) 地址并拼接路径
pub fn interpreter_url(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base.to_string()
    };
    if path.starts_with('/') {
        format!("{}{}", base, path)
    } else {
        format!("{}/{}", base, path)
    }
}

/// 解析一帧执行回复
pub fn parse_reply(reply: &str) -> ExecutionOutcome {
    if let Some(rest) = reply.strip_prefix(SUCCESS_PREFIX) {
        let output = rest.strip_prefix(' ').unwrap_or(rest);
        if output.trim() == TIMEOUT_MESSAGE {
            ExecutionOutcome::Timeout
        } else {
            ExecutionOutcome::Success(output.to_string())
        }
    } else if let Some(rest) = reply.strip_prefix(ERROR_PREFIX) {
        ExecutionOutcome::RuntimeError(rest.strip_prefix(' ').unwrap_or(rest).to_string())
    } else {
        let preview: String = reply.chars().take(REPLY_PREVIEW_CHARS).collect();
        ExecutionOutcome::ConnectionFailure(format!("unexpected interpreter reply: {}", preview))
    }
}

/// 读取下一帧文本，跳过 ping/pong/binary
async fn next_text(ws: &mut WsStream) -> Result<String, String> {
    while let Some(frame) = ws.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => return Ok(text),
            Ok(WsMessage::Close(_)) => return Err("interpreter closed the connection".to_string()),
            Ok(_) => continue,
            Err(e) => return Err(format!("interpreter connection error: {}", e)),
        }
    }
    Err("interpreter connection ended".to_string())
}

/// 基于 WebSocket 的解释器会话
pub struct WsInterpreter {
    url: String,
    exec_timeout: Duration,
    connect_timeout: Duration,
    socket: tokio::sync::Mutex<Option<WsStream>>,
    state: Mutex<SessionState>,
}

impl WsInterpreter {
    /// exec_timeout 为服务端执行时限；客户端等待上限为其加上宽限时间
    pub fn new(url: impl Into<String>, exec_timeout: Duration, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            exec_timeout: exec_timeout + CLIENT_GRACE,
            connect_timeout,
            socket: tokio::sync::Mutex::new(None),
            state: Mutex::new(SessionState::Idle),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
    }

    /// 已关闭时不再回到 Idle / Connected
    fn transition(&self, state: SessionState) {
        let mut current = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if *current != SessionState::Closed {
            *current = state;
        }
    }

    async fn connect(&self, credential: &Credential) -> Result<WsStream, String> {
        let (mut ws, _) = tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| format!("connecting to {} timed out", self.url))?
            .map_err(|e| format!("connecting to {} failed: {}", self.url, e))?;

        ws.send(WsMessage::Text(credential.token().to_string()))
            .await
            .map_err(|e| format!("sending credential failed: {}", e))?;

        let greeting = tokio::time::timeout(self.connect_timeout, next_text(&mut ws))
            .await
            .map_err(|_| "interpreter did not become ready in time".to_string())??;
        if greeting != READY_REPLY {
            return Err(greeting);
        }
        Ok(ws)
    }
}

/// 一次执行的收尾：未正常放回连接时（出错或 future 被丢弃）回到 Idle，下次执行重连
struct Exchange<'a> {
    interpreter: &'a WsInterpreter,
    finished: bool,
}

impl Drop for Exchange<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.interpreter.transition(SessionState::Idle);
        }
    }
}

#[async_trait]
impl Interpreter for WsInterpreter {
    async fn execute(&self, code: &str, credential: &Credential) -> ExecutionOutcome {
        if code.trim().is_empty() {
            return ExecutionOutcome::RuntimeError("no code to execute".to_string());
        }

        let mut socket = self.socket.lock().await;
        if self.state() == SessionState::Closed {
            return ExecutionOutcome::ConnectionFailure("interpreter session is closed".to_string());
        }

        // 交互期间连接移出槽位：只有收到本次回复后才放回，
        // 中途被丢弃（调用方超时、轮次取消）时连接随之关闭，迟到的回复不会被下一次执行读到
        let mut ws = match socket.take() {
            Some(ws) => ws,
            None => match self.connect(credential).await {
                Ok(ws) => {
                    tracing::info!(url = %self.url, "interpreter session connected");
                    self.transition(SessionState::Connected);
                    ws
                }
                Err(reason) => {
                    tracing::warn!(url = %self.url, reason = %reason, "interpreter connect failed");
                    return ExecutionOutcome::ConnectionFailure(reason);
                }
            },
        };
        let mut exchange = Exchange {
            interpreter: self,
            finished: false,
        };

        let start = Instant::now();
        // 连接失败后不可再用；客户端等待超时后回复可能迟到，同样丢弃以免错位
        let (outcome, drop_socket) = match ws.send(WsMessage::Text(code.to_string())).await {
            Err(e) => (
                ExecutionOutcome::ConnectionFailure(format!("sending code failed: {}", e)),
                true,
            ),
            Ok(()) => match tokio::time::timeout(self.exec_timeout, next_text(&mut ws)).await {
                Err(_) => (ExecutionOutcome::Timeout, true),
                Ok(Err(reason)) => (ExecutionOutcome::ConnectionFailure(reason), true),
                Ok(Ok(reply)) => {
                    let outcome = parse_reply(&reply);
                    let broken = matches!(outcome, ExecutionOutcome::ConnectionFailure(_));
                    (outcome, broken)
                }
            },
        };

        let kind = match &outcome {
            ExecutionOutcome::Success(_) => "success",
            ExecutionOutcome::RuntimeError(_) => "runtime_error",
            ExecutionOutcome::Timeout => "timeout",
            ExecutionOutcome::ConnectionFailure(_) => "connection_failure",
        };
        tracing::info!(
            outcome = kind,
            duration_ms = start.elapsed().as_millis() as u64,
            "interpreter execute"
        );

        if !drop_socket {
            *socket = Some(ws);
            exchange.finished = true;
        }
        outcome
    }

    async fn close(&self) {
        self.set_state(SessionState::Closed);
        let mut socket = self.socket.lock().await;
        if let Some(mut ws) = socket.take() {
            let _ = ws.close(None).await;
            tracing::info!(url = %self.url, "interpreter session closed");
        }
    }

    fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}
