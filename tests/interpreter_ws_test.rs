//! WebSocket 解释器会话集成测试：本地 tokio-tungstenite 服务端模拟解释器协议

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use futures_util::{SinkExt, StreamExt};
    use rpilot::core::Credential;
    use rpilot::interpreter::{ExecutionOutcome, Interpreter, SessionState, WsInterpreter};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::Message;

    const GOOD_TOKEN: &str = "secret";

    /// 启动模拟解释器，返回 ws 地址与已接受的连接数
    async fn spawn_server() -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let counter = connections.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(handle(stream));
            }
        });
        (format!("ws://{}/api/interpreter/run", addr), connections)
    }

    async fn handle(stream: TcpStream) {
        let Ok(mut ws) = accept_async(stream).await else {
            return;
        };
        let token = match ws.next().await {
            Some(Ok(Message::Text(t))) => t,
            _ => return,
        };
        if token != GOOD_TOKEN {
            let _ = ws.send(Message::Text("Invalid token".to_string())).await;
            let _ = ws.close(None).await;
            return;
        }
        let _ = ws.send(Message::Text("_ready_".to_string())).await;

        while let Some(Ok(frame)) = ws.next().await {
            let Message::Text(code) = frame else {
                continue;
            };
            let reply = match code.as_str() {
                "drop" => return,
                "stop()" => "_error_ Error: stopped".to_string(),
                "Sys.sleep(1000)" => "_success_ ERROR: TIMEOUT REACHED".to_string(),
                "Sys.sleep(0.3)" => {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    "_success_ [1] slept".to_string()
                }
                other => format!("_success_ [1] {}", other),
            };
            if ws.send(Message::Text(reply)).await.is_err() {
                return;
            }
        }
    }

    fn client(url: &str) -> WsInterpreter {
        WsInterpreter::new(url, Duration::from_secs(2), Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_lazy_connect_and_reuse() {
        let (url, connections) = spawn_server().await;
        let interp = client(&url);
        assert_eq!(interp.state(), SessionState::Idle);
        assert_eq!(connections.load(Ordering::SeqCst), 0);

        let cred = Credential::new(GOOD_TOKEN);
        assert_eq!(
            interp.execute("1 + 1", &cred).await,
            ExecutionOutcome::Success("[1] 1 + 1".to_string())
        );
        assert_eq!(interp.state(), SessionState::Connected);
        assert_eq!(
            interp.execute("x <- 3", &cred).await,
            ExecutionOutcome::Success("[1] x <- 3".to_string())
        );
        assert_eq!(connections.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_runtime_error_and_timeout_replies() {
        let (url, _) = spawn_server().await;
        let interp = client(&url);
        let cred = Credential::new(GOOD_TOKEN);

        assert_eq!(
            interp.execute("stop()", &cred).await,
            ExecutionOutcome::RuntimeError("Error: stopped".to_string())
        );
        assert_eq!(
            interp.execute("Sys.sleep(1000)", &cred).await,
            ExecutionOutcome::Timeout
        );
        // 两者都不致命，连接保持
        assert_eq!(interp.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_rejected_token_is_connection_failure() {
        let (url, _) = spawn_server().await;
        let interp = client(&url);

        let outcome = interp.execute("1", &Credential::new("wrong")).await;
        assert_eq!(
            outcome,
            ExecutionOutcome::ConnectionFailure("Invalid token".to_string())
        );
        assert_eq!(interp.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_reconnects_after_dropped_connection() {
        let (url, connections) = spawn_server().await;
        let interp = client(&url);
        let cred = Credential::new(GOOD_TOKEN);

        let outcome = interp.execute("drop", &cred).await;
        assert!(matches!(outcome, ExecutionOutcome::ConnectionFailure(_)));
        assert_eq!(interp.state(), SessionState::Idle);

        assert_eq!(
            interp.execute("2", &cred).await,
            ExecutionOutcome::Success("[1] 2".to_string())
        );
        assert_eq!(connections.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_closed_session_refuses_execution() {
        let (url, _) = spawn_server().await;
        let interp = client(&url);
        let cred = Credential::new(GOOD_TOKEN);

        interp.execute("1", &cred).await;
        interp.close().await;
        assert_eq!(interp.state(), SessionState::Closed);
        assert!(matches!(
            interp.execute("1", &cred).await,
            ExecutionOutcome::ConnectionFailure(_)
        ));
        assert_eq!(interp.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_abandoned_execution_reply_is_not_reused() {
        let (url, connections) = spawn_server().await;
        let interp = client(&url);
        let cred = Credential::new(GOOD_TOKEN);

        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            interp.execute("Sys.sleep(0.3)", &cred),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(interp.state(), SessionState::Idle);

        // 迟到的 "slept" 回复不能被当作下一段代码的结果
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(
            interp.execute("3", &cred).await,
            ExecutionOutcome::Success("[1] 3".to_string())
        );
        assert_eq!(interp.state(), SessionState::Connected);
        assert_eq!(connections.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unreachable_backend() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let interp = client(&format!("ws://{}/api/interpreter/run", addr));
        let outcome = interp.execute("1", &Credential::new(GOOD_TOKEN)).await;
        assert!(matches!(outcome, ExecutionOutcome::ConnectionFailure(_)));
        assert_eq!(interp.state(), SessionState::Idle);
    }
}
