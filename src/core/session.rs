//! 会话：账本、两处闸门、解释器会话与取消令牌的归属者
//!
//! 同一会话同一时刻最多一个活跃轮次（账本锁 try_lock 失败即 RoundInProgress）。
//! 重置会话 = 取消旧会话（进行中的轮次以 SessionReset 结束、挂起的审批被唤醒）并换上全新的会话。

use std::sync::{Arc, RwLock};

use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::approval::ApprovalGate;
use crate::core::{
    ChatRound, Credential, GateKind, RoundError, RoundEvent, RoundOptions, RoundOutcome, RoundState,
};
use crate::interpreter::Interpreter;
use crate::llm::LlmClient;
use crate::memory::{Message, MessageLedger};

/// 每次重置时调用，为新会话创建解释器会话
pub type InterpreterFactory = Arc<dyn Fn() -> Arc<dyn Interpreter> + Send + Sync>;

pub struct Session {
    id: String,
    ledger: Mutex<MessageLedger>,
    code_gate: ApprovalGate,
    result_gate: ApprovalGate,
    interpreter: Arc<dyn Interpreter>,
    llm: Arc<dyn LlmClient>,
    options: RoundOptions,
    cancel_token: CancellationToken,
    state_tx: watch::Sender<RoundState>,
    history_tx: watch::Sender<Vec<Message>>,
}

impl Session {
    pub fn new(llm: Arc<dyn LlmClient>, interpreter: Arc<dyn Interpreter>, options: RoundOptions) -> Self {
        let (state_tx, _) = watch::channel(RoundState::NotActive);
        let (history_tx, _) = watch::channel(Vec::new());
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            ledger: Mutex::new(MessageLedger::new()),
            code_gate: ApprovalGate::new(options.auto_approve_code),
            result_gate: ApprovalGate::new(options.auto_approve_result),
            interpreter,
            llm,
            options,
            cancel_token: CancellationToken::new(),
            state_tx,
            history_tx,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn code_gate(&self) -> &ApprovalGate {
        &self.code_gate
    }

    pub fn result_gate(&self) -> &ApprovalGate {
        &self.result_gate
    }

    pub fn gate(&self, kind: GateKind) -> &ApprovalGate {
        match kind {
            GateKind::Code => &self.code_gate,
            GateKind::Result => &self.result_gate,
        }
    }

    /// 当前挂起审批的闸门（轮次内顺序执行，至多一个）
    pub fn pending_gate(&self) -> Option<GateKind> {
        if self.code_gate.is_pending() {
            Some(GateKind::Code)
        } else if self.result_gate.is_pending() {
            Some(GateKind::Result)
        } else {
            None
        }
    }

    pub fn interpreter(&self) -> &Arc<dyn Interpreter> {
        &self.interpreter
    }

    pub fn state(&self) -> RoundState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<RoundState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_history(&self) -> watch::Receiver<Vec<Message>> {
        self.history_tx.subscribe()
    }

    /// 账本快照
    pub fn history(&self) -> Vec<Message> {
        self.history_tx.borrow().clone()
    }

    pub fn is_reset(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// 运行一轮。同一会话已有活跃轮次时立即返回 RoundInProgress，账本不变
    pub async fn run_round(
        &self,
        user_text: &str,
        credential: Option<&Credential>,
        events: Option<&mpsc::UnboundedSender<RoundEvent>>,
    ) -> Result<RoundOutcome, RoundError> {
        let mut ledger = self
            .ledger
            .try_lock()
            .map_err(|_| RoundError::RoundInProgress)?;
        if self.cancel_token.is_cancelled() {
            return Err(RoundError::SessionReset);
        }

        let mut round = ChatRound::new(
            &mut ledger,
            &self.code_gate,
            &self.result_gate,
            self.interpreter.as_ref(),
            self.llm.as_ref(),
            credential,
        )
        .with_options(self.options.clone())
        .with_state_tx(&self.state_tx)
        .with_history_tx(&self.history_tx);
        if let Some(tx) = events {
            round = round.with_event_tx(tx);
        }

        tokio::select! {
            biased;
            _ = self.cancel_token.cancelled() => {
                tracing::info!(session = %self.id, "round abandoned by session reset");
                Err(RoundError::SessionReset)
            }
            result = round.run(user_text) => result,
        }
    }

    /// 结束会话：放弃进行中的轮次、唤醒挂起的审批、后台关闭解释器会话
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
        self.code_gate.cancel_pending();
        self.result_gate.cancel_pending();

        let interpreter = Arc::clone(&self.interpreter);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { interpreter.close().await });
            }
            Err(_) => tracing::warn!(session = %self.id, "no runtime, interpreter session left open"),
        }
    }
}

/// 持有当前会话，负责重置
pub struct SessionManager {
    current: RwLock<Arc<Session>>,
    llm: Arc<dyn LlmClient>,
    interpreter_factory: InterpreterFactory,
    options: RoundOptions,
}

impl SessionManager {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        interpreter_factory: InterpreterFactory,
        options: RoundOptions,
    ) -> Self {
        let first = Session::new(Arc::clone(&llm), interpreter_factory(), options.clone());
        tracing::info!(session = %first.id(), "session started");
        Self {
            current: RwLock::new(Arc::new(first)),
            llm,
            interpreter_factory,
            options,
        }
    }

    pub fn current(&self) -> Arc<Session> {
        Arc::clone(&self.current.read().unwrap_or_else(|p| p.into_inner()))
    }

    /// 换上全新会话（空账本、新闸门、新解释器会话），旧会话被 shutdown
    pub fn reset(&self) -> Arc<Session> {
        let fresh = Arc::new(Session::new(
            Arc::clone(&self.llm),
            (self.interpreter_factory)(),
            self.options.clone(),
        ));
        let old = {
            let mut current = self.current.write().unwrap_or_else(|p| p.into_inner());
            std::mem::replace(&mut *current, Arc::clone(&fresh))
        };
        old.shutdown();
        tracing::info!(old = %old.id(), new = %fresh.id(), "session reset");
        fresh
    }
}
