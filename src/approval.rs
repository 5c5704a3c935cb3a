//! Human-in-the-loop approval coordinator for tool calls.
//!
//! The task loop enqueues a request before every tool invocation and
//! blocks its cycle on the decision. A resolver outside the core drains
//! the request queue and delivers decisions. Every enqueued approval
//! receives exactly one resolution; an interrupt denies everything still
//! outstanding, and resolutions arriving after shutdown are ignored.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::error::Result;

/// Default bound of the request queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

/// A pending approval surfaced to the resolver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub approval_id: String,
    pub tool: String,
    pub args: Value,
}

/// The human's decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    Deny,
}

impl ApprovalDecision {
    pub fn approved(&self) -> bool {
        matches!(self, Self::Approve)
    }
}

struct Inner {
    pending: Mutex<HashMap<String, oneshot::Sender<ApprovalDecision>>>,
    requests: mpsc::Sender<ApprovalRequest>,
    closed: AtomicBool,
    /// Serializes resolution delivery: at most one resolves at a time.
    resolve_lock: tokio::sync::Mutex<()>,
}

/// Session-scoped coordinator shared between the task loop and the
/// external resolver surface.
#[derive(Clone)]
pub struct ApprovalCoordinator {
    inner: Arc<Inner>,
}

impl ApprovalCoordinator {
    /// Create a coordinator and the request stream for the resolver.
    pub fn new() -> (Self, mpsc::Receiver<ApprovalRequest>) {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> (Self, mpsc::Receiver<ApprovalRequest>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                inner: Arc::new(Inner {
                    pending: Mutex::new(HashMap::new()),
                    requests: tx,
                    closed: AtomicBool::new(false),
                    resolve_lock: tokio::sync::Mutex::new(()),
                }),
            },
            rx,
        )
    }

    /// Enqueue an approval and wait for its decision.
    ///
    /// Cancellation denies the request immediately; a dropped resolver
    /// also resolves as denied.
    pub async fn request_approval(
        &self,
        tool: impl Into<String>,
        args: Value,
        cancel: &CancelToken,
    ) -> Result<(ApprovalRequest, ApprovalDecision)> {
        self.request_approval_with_id(Uuid::new_v4().to_string(), tool, args, cancel)
            .await
    }

    /// Like [`request_approval`](Self::request_approval) with a caller
    /// supplied id, so the id can be announced before the wait begins.
    pub async fn request_approval_with_id(
        &self,
        approval_id: String,
        tool: impl Into<String>,
        args: Value,
        cancel: &CancelToken,
    ) -> Result<(ApprovalRequest, ApprovalDecision)> {
        let request = ApprovalRequest {
            approval_id,
            tool: tool.into(),
            args,
        };

        if self.inner.closed.load(Ordering::SeqCst) || cancel.is_cancelled() {
            return Ok((request, ApprovalDecision::Deny));
        }

        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .expect("approval map poisoned")
            .insert(request.approval_id.clone(), tx);

        if self.inner.requests.send(request.clone()).await.is_err() {
            // Resolver side is gone; withdraw and deny.
            self.take_pending(&request.approval_id);
            return Ok((request, ApprovalDecision::Deny));
        }

        let decision = tokio::select! {
            decision = rx => decision.unwrap_or(ApprovalDecision::Deny),
            _ = cancel.cancelled() => {
                self.take_pending(&request.approval_id);
                ApprovalDecision::Deny
            }
        };
        Ok((request, decision))
    }

    /// Deliver a decision for a pending approval.
    ///
    /// Returns false when the id is unknown, already resolved, or arrived
    /// after the coordinator shut down.
    pub async fn resolve(&self, approval_id: &str, decision: ApprovalDecision) -> Result<bool> {
        let _guard = self.inner.resolve_lock.lock().await;
        if self.inner.closed.load(Ordering::SeqCst) {
            return Ok(false);
        }
        match self.take_pending(approval_id) {
            Some(tx) => {
                // A receiver dropped mid-flight already denied itself.
                let _ = tx.send(decision);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Number of approvals awaiting resolution.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().expect("approval map poisoned").len()
    }

    /// End the session: outstanding approvals resolve as denied and later
    /// resolutions are ignored.
    pub fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let drained: Vec<oneshot::Sender<ApprovalDecision>> = {
            let mut pending = self.inner.pending.lock().expect("approval map poisoned");
            pending.drain().map(|(_, tx)| tx).collect()
        };
        for tx in drained {
            let _ = tx.send(ApprovalDecision::Deny);
        }
    }

    fn take_pending(&self, approval_id: &str) -> Option<oneshot::Sender<ApprovalDecision>> {
        self.inner
            .pending
            .lock()
            .expect("approval map poisoned")
            .remove(approval_id)
    }
}

/// Spawn a resolver that approves or denies everything with a fixed
/// decision. Useful for unattended runs and tests.
pub fn auto_resolver(
    coordinator: ApprovalCoordinator,
    mut requests: mpsc::Receiver<ApprovalRequest>,
    decision: ApprovalDecision,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(request) = requests.recv().await {
            let _ = coordinator.resolve(&request.approval_id, decision).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_approve_roundtrip() {
        let (coordinator, mut requests) = ApprovalCoordinator::new();
        let cancel = CancelToken::new();

        let requester = coordinator.clone();
        let task = tokio::spawn(async move {
            requester
                .request_approval("write_file", json!({"path": "x"}), &cancel)
                .await
                .unwrap()
        });

        let request = requests.recv().await.unwrap();
        assert_eq!(request.tool, "write_file");
        assert!(coordinator
            .resolve(&request.approval_id, ApprovalDecision::Approve)
            .await
            .unwrap());

        let (_, decision) = task.await.unwrap();
        assert_eq!(decision, ApprovalDecision::Approve);
        assert_eq!(coordinator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_deny_roundtrip() {
        let (coordinator, mut requests) = ApprovalCoordinator::new();
        let cancel = CancelToken::new();

        let requester = coordinator.clone();
        let task = tokio::spawn(async move {
            requester
                .request_approval("delete_file", json!({}), &cancel)
                .await
                .unwrap()
        });

        let request = requests.recv().await.unwrap();
        coordinator
            .resolve(&request.approval_id, ApprovalDecision::Deny)
            .await
            .unwrap();

        let (_, decision) = task.await.unwrap();
        assert_eq!(decision, ApprovalDecision::Deny);
    }

    #[tokio::test]
    async fn test_exactly_one_resolution() {
        let (coordinator, mut requests) = ApprovalCoordinator::new();
        let cancel = CancelToken::new();

        let requester = coordinator.clone();
        let task = tokio::spawn(async move {
            requester
                .request_approval("search", json!({}), &cancel)
                .await
                .unwrap()
        });

        let request = requests.recv().await.unwrap();
        assert!(coordinator
            .resolve(&request.approval_id, ApprovalDecision::Approve)
            .await
            .unwrap());
        // The second resolution of the same id is ignored.
        assert!(!coordinator
            .resolve(&request.approval_id, ApprovalDecision::Deny)
            .await
            .unwrap());

        let (_, decision) = task.await.unwrap();
        assert_eq!(decision, ApprovalDecision::Approve);
    }

    #[tokio::test]
    async fn test_cancel_denies_outstanding() {
        let (coordinator, _requests) = ApprovalCoordinator::new();
        let cancel = CancelToken::new();

        let requester = coordinator.clone();
        let cancel_clone = cancel.clone();
        let task = tokio::spawn(async move {
            requester
                .request_approval("run", json!({}), &cancel_clone)
                .await
                .unwrap()
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let (_, decision) = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(decision, ApprovalDecision::Deny);
    }

    #[tokio::test]
    async fn test_shutdown_denies_and_ignores_late_resolutions() {
        let (coordinator, mut requests) = ApprovalCoordinator::new();
        let cancel = CancelToken::new();

        let requester = coordinator.clone();
        let task = tokio::spawn(async move {
            requester
                .request_approval("run", json!({}), &cancel)
                .await
                .unwrap()
        });

        let request = requests.recv().await.unwrap();
        coordinator.shutdown();

        let (_, decision) = task.await.unwrap();
        assert_eq!(decision, ApprovalDecision::Deny);

        // Resolution after the task ended is ignored.
        assert!(!coordinator
            .resolve(&request.approval_id, ApprovalDecision::Approve)
            .await
            .unwrap());

        // New requests after shutdown deny immediately.
        let (_, late) = coordinator
            .request_approval("run", json!({}), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(late, ApprovalDecision::Deny);
    }

    #[tokio::test]
    async fn test_auto_resolver() {
        let (coordinator, requests) = ApprovalCoordinator::new();
        let handle = auto_resolver(coordinator.clone(), requests, ApprovalDecision::Approve);

        let (_, decision) = coordinator
            .request_approval("search", json!({}), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(decision, ApprovalDecision::Approve);

        coordinator.shutdown();
        drop(coordinator);
        handle.abort();
    }
}
