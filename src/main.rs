//! R-Pilot 控制台
//!
//! 入口：初始化日志、加载配置、校验 token、创建会话管理器，然后逐行读取 stdin。
//! 普通输入在后台任务里跑一轮；以 `:` 开头的是控制命令（审批、自动审批、重置、上传、历史）。

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use rpilot::agent::{create_session_manager, resolve_credential};
use rpilot::config::{load_config, AppConfig};
use rpilot::core::{
    Credential, GateKind, RoundError, RoundEvent, RoundState, SessionManager, AUTH_ERROR_MSG,
};
use rpilot::memory::Role;
use rpilot::observability;
use rpilot::workspace::Workspace;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, RwLock};

const HELP: &str = "\
commands:
  :y / :n                     approve or reject the pending request
  :auto code|result on|off    toggle auto-approve
  :new                        start a new session (re-checks the token if it was rejected)
  :upload <file>              copy a file into the workspace
  :history                    print the conversation
  :quit                       exit";

struct Console {
    cfg: AppConfig,
    manager: SessionManager,
    /// 启动时校验失败则为 None，:new 时重新校验
    credential: RwLock<Option<Credential>>,
    workspace: Workspace,
    events_tx: mpsc::UnboundedSender<RoundEvent>,
    /// 致命错误后置位，直到 :new
    needs_reset: Arc<AtomicBool>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let cfg = load_config(None).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });

    let root = cfg
        .app
        .workspace_root
        .clone()
        .unwrap_or_else(|| PathBuf::from("workspace"));
    let workspace = Workspace::open(&root)
        .with_context(|| format!("Failed to open workspace {}", root.display()))?;

    let credential = resolve_credential(&cfg).await;
    if credential.is_none() {
        println!("{}", AUTH_ERROR_MSG);
    }

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    tokio::spawn(print_events(events_rx));

    let console = Arc::new(Console {
        manager: create_session_manager(&cfg),
        cfg,
        credential: RwLock::new(credential),
        workspace,
        events_tx,
        needs_reset: Arc::new(AtomicBool::new(false)),
    });

    println!("R-Pilot ready. Type a message, or :help");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == ":quit" {
            break;
        }
        if let Some(command) = line.strip_prefix(':') {
            console.command(command).await;
        } else {
            console.start_round(line.to_string());
        }
    }

    console.manager.current().shutdown();
    Ok(())
}

impl Console {
    fn start_round(self: &Arc<Self>, text: String) {
        if self.needs_reset.load(Ordering::SeqCst) {
            println!("session needs a reset after the last error, use :new");
            return;
        }
        let session = self.manager.current();
        if session.state() != RoundState::NotActive {
            println!("a round is already running ({})", session.state());
            return;
        }

        let console = Arc::clone(self);
        tokio::spawn(async move {
            let credential = console.credential.read().await.clone();
            let result = session
                .run_round(&text, credential.as_ref(), Some(&console.events_tx))
                .await;
            match result {
                // 轮次未开始，事件通道上没有对应的错误
                Err(e @ RoundError::RoundInProgress) => println!("{}", e),
                Err(e) if e.requires_reset() && !session.is_reset() => {
                    console.needs_reset.store(true, Ordering::SeqCst);
                    println!("use :new to start a new session");
                }
                _ => {}
            }
        });
    }

    async fn command(&self, command: &str) {
        let parts: Vec<&str> = command.split_whitespace().collect();
        match parts.as_slice() {
            ["y"] | ["n"] => {
                let session = self.manager.current();
                let Some(kind) = session.pending_gate() else {
                    println!("nothing to approve");
                    return;
                };
                if let Err(e) = session.gate(kind).approve(parts[0] == "y") {
                    println!("{}", e);
                }
            }
            ["auto", gate, switch] => {
                let kind = match *gate {
                    "code" => GateKind::Code,
                    "result" => GateKind::Result,
                    _ => {
                        println!("usage: :auto code|result on|off");
                        return;
                    }
                };
                let enabled = match *switch {
                    "on" => true,
                    "off" => false,
                    _ => {
                        println!("usage: :auto code|result on|off");
                        return;
                    }
                };
                self.manager.current().gate(kind).set_auto_approve(enabled);
                println!("auto-approve {}: {}", kind, switch);
            }
            ["new"] => {
                let session = self.manager.reset();
                self.needs_reset.store(false, Ordering::SeqCst);
                println!("new session {}", session.id());
                self.refresh_credential().await;
            }
            ["upload", path] => self.upload(Path::new(path)).await,
            ["history"] => {
                for msg in self.manager.current().history() {
                    let who = match msg.role {
                        Role::User => "you",
                        Role::Model => "pilot",
                    };
                    if let Some(text) = &msg.text {
                        println!("[{}] {}", who, text);
                    }
                    if let Some(code) = &msg.code {
                        println!("[{}] ```r\n{}\n```", who, code);
                    }
                    if let Some(result) = &msg.code_result {
                        println!("[result] {}", result);
                    }
                }
            }
            _ => println!("{}", HELP),
        }
    }

    /// 没有有效凭证时重新校验 token
    async fn refresh_credential(&self) {
        let mut credential = self.credential.write().await;
        if credential.is_some() {
            return;
        }
        *credential = resolve_credential(&self.cfg).await;
        if credential.is_none() {
            println!("{}", AUTH_ERROR_MSG);
        }
    }

    async fn upload(&self, path: &Path) {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            println!("not a file: {}", path.display());
            return;
        };
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                println!("cannot read {}: {}", path.display(), e);
                return;
            }
        };
        match self.workspace.store_upload(name, &bytes) {
            Ok(stored) => println!("uploaded as {}", stored),
            Err(e) => println!("{}", e),
        }
    }
}

async fn print_events(mut rx: mpsc::UnboundedReceiver<RoundEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            RoundEvent::StateChanged { state } => match state {
                RoundState::WaitingForModel => println!("... thinking"),
                RoundState::WaitingForInterpreter => println!("... running code"),
                RoundState::NotActive => {}
            },
            RoundEvent::ModelText { text } => println!("{}", text),
            RoundEvent::CodeProposed { code } => println!("```r\n{}\n```", code),
            RoundEvent::AwaitingApproval { gate, .. } => match gate {
                GateKind::Code => println!("run this code? (:y / :n)"),
                GateKind::Result => println!("send this result to the model? (:y / :n)"),
            },
            RoundEvent::CodeResult { text } => println!("result:\n{}", text),
            RoundEvent::Rejected { gate } => println!("({} rejected, round ended)", gate),
            RoundEvent::Finished => {}
            RoundEvent::Error { text } => println!("error: {}", text),
        }
    }
}
