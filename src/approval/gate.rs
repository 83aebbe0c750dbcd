//! 审批闸门：单槽位的人工决策点
//!
//! request(payload) 在 auto_approve 打开时立即放行；否则挂起调用方，直到另一执行上下文调用 approve(bool)。
//! 同一时刻最多一个待决请求，第二个 request 直接返回 AlreadyPending 而不排队。
//! 等待中的 request future 被丢弃时（会话重置、轮次中止），守卫会清空槽位，不留悬挂请求。
//! 闸门除唤醒调用方与更新 pending 订阅外没有其它副作用（不记日志、不持久化）。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{oneshot, watch};

/// 人工决策结果
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Rejected,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GateError {
    /// 已有待决请求时再次 request，属于调用方编程错误
    #[error("An approval request is already pending")]
    AlreadyPending,

    /// approve 时没有待决请求
    #[error("No approval request is pending")]
    NoPendingRequest,

    /// 待决请求被 cancel_pending 撤销
    #[error("Approval request was cancelled")]
    Cancelled,
}

struct Pending {
    id: u64,
    reply: oneshot::Sender<bool>,
}

/// 审批闸门；通常以 Arc 共享给编排器与 UI
#[derive(Debug)]
pub struct ApprovalGate {
    auto_approve: AtomicBool,
    slot: Mutex<Option<Pending>>,
    next_id: AtomicU64,
    /// 当前待审内容，供 UI 订阅（None 表示空闲）
    pending_tx: watch::Sender<Option<String>>,
}

impl std::fmt::Debug for Pending {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pending").field("id", &self.id).finish()
    }
}

impl ApprovalGate {
    pub fn new(auto_approve: bool) -> Self {
        let (pending_tx, _) = watch::channel(None);
        Self {
            auto_approve: AtomicBool::new(auto_approve),
            slot: Mutex::new(None),
            next_id: AtomicU64::new(0),
            pending_tx,
        }
    }

    pub fn auto_approve(&self) -> bool {
        self.auto_approve.load(Ordering::SeqCst)
    }

    /// 随时可改；不会追溯放行已挂起的请求
    pub fn set_auto_approve(&self, enabled: bool) {
        self.auto_approve.store(enabled, Ordering::SeqCst);
    }

    pub fn is_pending(&self) -> bool {
        self.lock_slot().is_some()
    }

    /// 订阅待审内容
    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.pending_tx.subscribe()
    }

    /// 请求审批：auto_approve 时不挂起直接返回 Approved
    pub async fn request(&self, payload: impl Into<String>) -> Result<Decision, GateError> {
        let (id, rx) = {
            let mut slot = self.lock_slot();
            if slot.is_some() {
                return Err(GateError::AlreadyPending);
            }
            if self.auto_approve() {
                return Ok(Decision::Approved);
            }
            let (tx, rx) = oneshot::channel();
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            *slot = Some(Pending { id, reply: tx });
            self.pending_tx.send_replace(Some(payload.into()));
            (id, rx)
        };

        let _guard = SlotGuard { gate: self, id };
        match rx.await {
            Ok(true) => Ok(Decision::Approved),
            Ok(false) => Ok(Decision::Rejected),
            Err(_) => Err(GateError::Cancelled),
        }
    }

    /// 交付人工决策；没有待决请求时返回 NoPendingRequest（不做任何事）
    pub fn approve(&self, accepted: bool) -> Result<(), GateError> {
        let pending = {
            let mut slot = self.lock_slot();
            let pending = slot.take().ok_or(GateError::NoPendingRequest)?;
            self.pending_tx.send_replace(None);
            pending
        };
        // 接收端已丢弃说明请求方已放弃，等同于没有待决请求
        pending
            .reply
            .send(accepted)
            .map_err(|_| GateError::NoPendingRequest)
    }

    /// 撤销待决请求，请求方收到 Cancelled；返回是否确有请求被撤销
    pub fn cancel_pending(&self) -> bool {
        let mut slot = self.lock_slot();
        let cancelled = slot.take().is_some();
        if cancelled {
            self.pending_tx.send_replace(None);
        }
        cancelled
    }

    fn lock_slot(&self) -> MutexGuard<'_, Option<Pending>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for ApprovalGate {
    fn default() -> Self {
        Self::new(false)
    }
}

/// request 返回或被丢弃时清理自己的槽位（只清理同一 id，避免误删后续请求）
struct SlotGuard<'a> {
    gate: &'a ApprovalGate,
    id: u64,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let mut slot = self.gate.lock_slot();
        if slot.as_ref().map(|p| p.id) == Some(self.id) {
            *slot = None;
            self.gate.pending_tx.send_replace(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    async fn wait_pending(gate: &ApprovalGate) {
        let mut rx = gate.subscribe();
        tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|p| p.is_some()))
            .await
            .expect("request never became pending")
            .unwrap();
    }

    #[tokio::test]
    async fn test_auto_approve_resolves_immediately() {
        let gate = ApprovalGate::new(true);
        let decision = gate.request("print(1)").await.unwrap();
        assert_eq!(decision, Decision::Approved);
        assert!(!gate.is_pending());
    }

    #[tokio::test]
    async fn test_request_waits_for_approve() {
        let gate = Arc::new(ApprovalGate::new(false));
        let g = gate.clone();
        let handle = tokio::spawn(async move { g.request("x <- 1").await });

        wait_pending(&gate).await;
        assert_eq!(*gate.subscribe().borrow(), Some("x <- 1".to_string()));
        gate.approve(true).unwrap();

        let decision = handle.await.unwrap().unwrap();
        assert_eq!(decision, Decision::Approved);
        assert!(!gate.is_pending());
        assert_eq!(*gate.subscribe().borrow(), None);
    }

    #[tokio::test]
    async fn test_reject_delivers_rejected() {
        let gate = Arc::new(ApprovalGate::new(false));
        let g = gate.clone();
        let handle = tokio::spawn(async move { g.request("unlink('x')").await });
        wait_pending(&gate).await;
        gate.approve(false).unwrap();
        assert_eq!(handle.await.unwrap().unwrap(), Decision::Rejected);
    }

    #[tokio::test]
    async fn test_second_request_fails_fast() {
        let gate = Arc::new(ApprovalGate::new(false));
        let g = gate.clone();
        let first = tokio::spawn(async move { g.request("first").await });
        wait_pending(&gate).await;

        let second = tokio::time::timeout(Duration::from_millis(200), gate.request("second"))
            .await
            .expect("second request must not suspend");
        assert_eq!(second, Err(GateError::AlreadyPending));

        gate.approve(true).unwrap();
        assert_eq!(first.await.unwrap().unwrap(), Decision::Approved);
    }

    #[test]
    fn test_approve_without_pending_is_error() {
        let gate = ApprovalGate::new(false);
        assert_eq!(gate.approve(true), Err(GateError::NoPendingRequest));
    }

    #[tokio::test]
    async fn test_decision_delivered_once() {
        let gate = Arc::new(ApprovalGate::new(false));
        let g = gate.clone();
        let handle = tokio::spawn(async move { g.request("1 + 1").await });
        wait_pending(&gate).await;
        gate.approve(true).unwrap();
        assert_eq!(gate.approve(false), Err(GateError::NoPendingRequest));
        assert_eq!(handle.await.unwrap().unwrap(), Decision::Approved);
    }

    #[tokio::test]
    async fn test_enabling_auto_approve_does_not_release_pending() {
        let gate = Arc::new(ApprovalGate::new(false));
        let g = gate.clone();
        let handle = tokio::spawn(async move { g.request("Sys.sleep(1)").await });
        wait_pending(&gate).await;

        gate.set_auto_approve(true);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());
        assert!(gate.is_pending());

        gate.approve(false).unwrap();
        assert_eq!(handle.await.unwrap().unwrap(), Decision::Rejected);
    }

    #[tokio::test]
    async fn test_cancel_pending_wakes_requester() {
        let gate = Arc::new(ApprovalGate::new(false));
        let g = gate.clone();
        let handle = tokio::spawn(async move { g.request("q()").await });
        wait_pending(&gate).await;

        assert!(gate.cancel_pending());
        assert_eq!(handle.await.unwrap(), Err(GateError::Cancelled));
        assert!(!gate.cancel_pending());
    }

    #[tokio::test]
    async fn test_dropped_request_frees_slot() {
        let gate = ApprovalGate::new(false);
        let res = tokio::time::timeout(Duration::from_millis(50), gate.request("never")).await;
        assert!(res.is_err());
        assert!(!gate.is_pending());
        assert_eq!(gate.approve(true), Err(GateError::NoPendingRequest));

        gate.set_auto_approve(true);
        assert_eq!(gate.request("next").await, Ok(Decision::Approved));
    }
}
