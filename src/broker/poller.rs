//! Background wait for a slow-path request.
//!
//! The poller holds no reference to the approval surface. It re-reads the
//! slot on a fixed interval until an outcome appears or the deadline
//! passes, so a fresh poll loop after a restart observes exactly the same
//! state as the one it replaces.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::broker::{
    ApprovalResult, ApprovalWindowOrchestrator, PendingRequestStore, RejectionCause, RequestKind,
    RequestOutcome,
};
use crate::db::ResolveStatus;
use crate::error::BrokerError;

/// Waits for the outcome of one pending request.
pub struct ResolutionPoller {
    pending: Arc<PendingRequestStore>,
    windows: Arc<ApprovalWindowOrchestrator>,
    poll_interval: Duration,
    timeout: Duration,
}

impl ResolutionPoller {
    pub fn new(
        pending: Arc<PendingRequestStore>,
        windows: Arc<ApprovalWindowOrchestrator>,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            pending,
            windows,
            poll_interval,
            timeout,
        }
    }

    /// Block (cooperatively) until `request_id` in the `kind` slot reaches a
    /// terminal state, consume it, and convert it into the caller's result.
    pub async fn wait(&self, kind: RequestKind, request_id: Uuid) -> Result<ApprovalResult, BrokerError> {
        let deadline = Instant::now() + self.timeout;
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return self.expire(kind, request_id).await;
                }
            }

            match self.pending.peek(kind).await? {
                Some(current) if current.request_id == request_id => {
                    if current.outcome.is_none() {
                        continue;
                    }
                    return match self.consume(kind, request_id).await? {
                        Some(outcome) => self.deliver(kind, outcome),
                        // Someone else consumed it between peek and take.
                        None => self.lost(kind, request_id),
                    };
                }
                _ => return self.lost(kind, request_id),
            }
        }
    }

    /// Deadline reached: write `Expired` unless an outcome beat us to it,
    /// then consume whatever is in the slot.
    async fn expire(&self, kind: RequestKind, request_id: Uuid) -> Result<ApprovalResult, BrokerError> {
        match self
            .pending
            .resolve_request(kind, request_id, RequestOutcome::Expired)
            .await?
        {
            ResolveStatus::Written | ResolveStatus::AlreadyResolved(_) => {}
            ResolveStatus::NoPendingRequest => return self.lost(kind, request_id),
        }
        match self.consume(kind, request_id).await? {
            Some(outcome) => self.deliver(kind, outcome),
            None => self.lost(kind, request_id),
        }
    }

    /// Take the outcome together with the slot, and take down any surface
    /// still showing the request.
    async fn consume(
        &self,
        kind: RequestKind,
        request_id: Uuid,
    ) -> Result<Option<RequestOutcome>, BrokerError> {
        let handle = self
            .windows
            .handle_for(kind)
            .await?
            .filter(|h| h.request_id == request_id);
        let outcome = self.pending.take_outcome(kind, request_id).await?;
        if outcome.is_some()
            && let Some(handle) = handle
        {
            self.windows.dismiss(&handle).await;
        }
        Ok(outcome)
    }

    fn deliver(&self, kind: RequestKind, outcome: RequestOutcome) -> Result<ApprovalResult, BrokerError> {
        match outcome {
            RequestOutcome::Approved { result } => {
                tracing::info!(%kind, "Request approved");
                Ok(result)
            }
            RequestOutcome::Rejected {
                reason,
                cause: RejectionCause::User,
            } => {
                tracing::info!(%kind, %reason, "Request rejected by user");
                Err(BrokerError::UserRejected { reason })
            }
            RequestOutcome::Rejected {
                reason,
                cause: RejectionCause::ActionFailed,
            } => {
                tracing::warn!(%kind, %reason, "Approved action failed");
                Err(BrokerError::PrivilegedActionFailed { reason })
            }
            RequestOutcome::Abandoned => {
                tracing::warn!(%kind, "Request abandoned: approval window closed");
                Err(BrokerError::Abandoned { kind })
            }
            RequestOutcome::Expired => {
                tracing::warn!(%kind, timeout = ?self.timeout, "Request timed out");
                Err(BrokerError::Timeout {
                    kind,
                    after: self.timeout,
                })
            }
        }
    }

    /// The slot was cleared or replaced before we saw an outcome.
    fn lost(&self, kind: RequestKind, request_id: Uuid) -> Result<ApprovalResult, BrokerError> {
        tracing::warn!(%kind, %request_id, "Pending request vanished before an outcome was observed");
        Err(BrokerError::Abandoned { kind })
    }
}

#[cfg(test)]
mod tests {
    use crate::broker::{HeadlessWindowHost, Origin, PendingRequest, RequestPayload};
    use crate::db::Database;
    use crate::db::libsql::test_support::temp_backend;

    use super::*;

    struct Harness {
        _dir: tempfile::TempDir,
        pending: Arc<PendingRequestStore>,
        windows: Arc<ApprovalWindowOrchestrator>,
        host: Arc<HeadlessWindowHost>,
    }

    async fn harness() -> Harness {
        let (dir, backend) = temp_backend().await;
        let store: Arc<dyn Database> = Arc::new(backend);
        let host = Arc::new(HeadlessWindowHost::new());
        Harness {
            _dir: dir,
            pending: Arc::new(PendingRequestStore::new(
                store.clone(),
                Duration::from_secs(60),
                Duration::from_secs(5),
            )),
            windows: Arc::new(ApprovalWindowOrchestrator::new(
                store,
                host.clone(),
                "http://localhost:7420",
                400,
                600,
            )),
            host,
        }
    }

    impl Harness {
        fn poller(&self, timeout: Duration) -> ResolutionPoller {
            ResolutionPoller::new(
                self.pending.clone(),
                self.windows.clone(),
                Duration::from_millis(20),
                timeout,
            )
        }

        async fn open_signature(&self) -> PendingRequest {
            let request = PendingRequest::new(
                Origin::parse("https://a.example").unwrap(),
                1,
                RequestPayload::Signature {
                    message: "gm".to_string(),
                },
            );
            self.pending.open(&request).await.unwrap();
            self.windows
                .open(RequestKind::Signature, &request)
                .await
                .unwrap();
            request
        }
    }

    #[tokio::test]
    async fn approval_is_delivered_and_slot_consumed() {
        let h = harness().await;
        let request = h.open_signature().await;
        let poller = h.poller(Duration::from_secs(5));

        let pending = h.pending.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            pending
                .resolve(
                    RequestKind::Signature,
                    RequestOutcome::approved(ApprovalResult::Signature {
                        signature: "0xsig".to_string(),
                    }),
                )
                .await
                .unwrap();
        });

        let result = poller.wait(RequestKind::Signature, request.request_id).await.unwrap();
        assert_eq!(
            result,
            ApprovalResult::Signature {
                signature: "0xsig".to_string()
            }
        );
        assert!(h.pending.peek(RequestKind::Signature).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn user_rejection_and_action_failure_are_distinct() {
        let h = harness().await;
        let request = h.open_signature().await;
        h.pending
            .resolve(RequestKind::Signature, RequestOutcome::rejected_by_user("not now"))
            .await
            .unwrap();
        let err = h
            .poller(Duration::from_secs(5))
            .wait(RequestKind::Signature, request.request_id)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::UserRejected { ref reason } if reason == "not now"));

        let request = h.open_signature().await;
        h.pending
            .resolve(RequestKind::Signature, RequestOutcome::action_failed("device unplugged"))
            .await
            .unwrap();
        let err = h
            .poller(Duration::from_secs(5))
            .wait(RequestKind::Signature, request.request_id)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::PrivilegedActionFailed { .. }));
    }

    #[tokio::test]
    async fn timeout_expires_slot_and_closes_window() {
        let h = harness().await;
        let request = h.open_signature().await;
        let window_id = h.host.opened()[0].window_id;

        let err = h
            .poller(Duration::from_millis(150))
            .wait(RequestKind::Signature, request.request_id)
            .await
            .unwrap_err();

        assert!(matches!(err, BrokerError::Timeout { kind: RequestKind::Signature, .. }));
        assert!(h.pending.peek(RequestKind::Signature).await.unwrap().is_none());
        assert!(!h.host.is_live(window_id));
        // A fresh request can take the slot right away.
        h.open_signature().await;
    }

    #[tokio::test]
    async fn window_close_fails_the_call() {
        let h = harness().await;
        let request = h.open_signature().await;
        let window_id = h.host.opened()[0].window_id;

        let windows = h.windows.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            windows.on_closed(window_id).await.unwrap();
        });

        let err = h
            .poller(Duration::from_secs(5))
            .wait(RequestKind::Signature, request.request_id)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Abandoned { kind: RequestKind::Signature }));
    }

    #[tokio::test]
    async fn cleared_slot_fails_as_abandoned() {
        let h = harness().await;
        let request = h.open_signature().await;
        h.pending.clear(RequestKind::Signature).await.unwrap();

        let err = h
            .poller(Duration::from_secs(5))
            .wait(RequestKind::Signature, request.request_id)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Abandoned { .. }));
    }

    #[tokio::test]
    async fn restarted_poller_sees_the_same_outcome() {
        let h = harness().await;
        let request = h.open_signature().await;

        // First loop gives up (its caller went away) before any decision.
        let first = h.poller(Duration::from_secs(5));
        let abandoned_wait = tokio::time::timeout(
            Duration::from_millis(50),
            first.wait(RequestKind::Signature, request.request_id),
        )
        .await;
        assert!(abandoned_wait.is_err());

        h.pending
            .resolve(
                RequestKind::Signature,
                RequestOutcome::approved(ApprovalResult::Signature {
                    signature: "0xabc".to_string(),
                }),
            )
            .await
            .unwrap();

        let second = h.poller(Duration::from_secs(5));
        let result = second.wait(RequestKind::Signature, request.request_id).await.unwrap();
        assert_eq!(
            result,
            ApprovalResult::Signature {
                signature: "0xabc".to_string()
            }
        );
    }
}
