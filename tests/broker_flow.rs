//! End-to-end broker flows over a real libSQL file.
//!
//! Each test wires the full broker against a temp database and a headless
//! window host, then plays the three contexts: the website (ingress
//! dispatch), the approval surface (controller and window-closed
//! notifications) and the background poller.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use rust_decimal::Decimal;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use walletgate::broker::{
    AccountError, AccountManager, ApprovalScreen, BalanceSource, BridgeEvent, BroadcastNotifier,
    Broker, BrokerDeps, Decision, DecisionOutcome, DevAccountManager, HeadlessWindowHost, Origin,
    RequestKind, RequestOutcome, TabEvent, TransactionPayload,
};
use walletgate::config::{BrokerConfig, DatabaseConfig, WindowHostKind};
use walletgate::db::ResolveStatus;
use walletgate::error::BrokerError;

const TAB: i64 = 7;
const WAIT: Duration = Duration::from_secs(5);

/// Dev account manager that counts privileged calls.
struct CountingAccounts {
    inner: DevAccountManager,
    submitted: AtomicUsize,
}

#[async_trait]
impl AccountManager for CountingAccounts {
    async fn active_address(&self) -> Result<String, AccountError> {
        self.inner.active_address().await
    }

    async fn submit_transaction(&self, payload: &TransactionPayload) -> Result<String, AccountError> {
        self.submitted.fetch_add(1, Ordering::SeqCst);
        self.inner.submit_transaction(payload).await
    }

    async fn sign_message(&self, message: &str) -> Result<String, AccountError> {
        self.inner.sign_message(message).await
    }
}

#[async_trait]
impl BalanceSource for CountingAccounts {
    async fn cached_balance(&self, address: &str) -> Result<Option<Decimal>, AccountError> {
        self.inner.cached_balance(address).await
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    broker: Broker,
    host: Arc<HeadlessWindowHost>,
    accounts: Arc<CountingAccounts>,
    events: broadcast::Receiver<BridgeEvent>,
}

async fn harness(request_timeout: Duration) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = walletgate::db::connect_from_config(&DatabaseConfig {
        libsql_path: dir.path().join("walletgate.db"),
        libsql_url: None,
        libsql_auth_token: None,
    })
    .await
    .unwrap();

    let config = BrokerConfig {
        poll_interval: Duration::from_millis(20),
        request_timeout,
        orphan_grace: Duration::from_secs(1),
        window_width: 400,
        window_height: 600,
        approval_base_url: None,
        window_host: WindowHostKind::Headless,
    };
    let host = Arc::new(HeadlessWindowHost::new());
    let accounts = Arc::new(CountingAccounts {
        inner: DevAccountManager::new("addr1", Decimal::new(100, 0)),
        submitted: AtomicUsize::new(0),
    });
    let notifier = Arc::new(BroadcastNotifier::default());
    let events = notifier.subscribe();

    let broker = Broker::new(
        &config,
        "http://127.0.0.1:7420",
        None,
        BrokerDeps {
            store,
            window_host: host.clone(),
            accounts: accounts.clone(),
            balances: accounts.clone(),
            notifier,
        },
    );

    Harness {
        _dir: dir,
        broker,
        host,
        accounts,
        events,
    }
}

fn site() -> Origin {
    Origin::parse("https://a.example").unwrap()
}

impl Harness {
    /// Start a bridge call the way the gateway does, without waiting for it.
    fn call(&self, method: &str, params: Value) -> JoinHandle<Result<Value, BrokerError>> {
        let broker = self.broker.clone();
        let method = method.to_string();
        tokio::spawn(async move {
            broker
                .ingress
                .dispatch(&method, &params, &site(), TAB)
                .await
        })
    }

    /// Wait until `count` approval windows have been opened in total.
    async fn wait_for_windows(&self, count: usize) {
        tokio::time::timeout(WAIT, async {
            while self.host.opened().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("approval window never opened");
    }

    /// What the approval surface would show for `kind`, expecting a request.
    async fn pending_request_id(&self, kind: RequestKind) -> uuid::Uuid {
        match self.broker.controller.load(kind).await.unwrap() {
            ApprovalScreen::Pending(view) => view.request_id,
            ApprovalScreen::NoPendingRequest => panic!("no pending {kind} request"),
        }
    }

    async fn decide(&self, kind: RequestKind, decision: Decision) -> DecisionOutcome {
        let request_id = self.pending_request_id(kind).await;
        self.broker
            .controller
            .decide(kind, request_id, decision)
            .await
            .unwrap()
    }

    async fn approve_connection(&self) -> Value {
        let opened = self.host.opened().len();
        let call = self.call("requestAccounts", json!([]));
        self.wait_for_windows(opened + 1).await;
        self.decide(RequestKind::Connection, Decision::Approve).await;
        finish(call).await.unwrap()
    }
}

async fn finish(call: JoinHandle<Result<Value, BrokerError>>) -> Result<Value, BrokerError> {
    tokio::time::timeout(WAIT, call)
        .await
        .expect("bridge call never completed")
        .expect("bridge task panicked")
}

#[tokio::test]
async fn connection_approval_persists_trust_and_enables_fast_path() {
    let mut h = harness(Duration::from_secs(30)).await;

    let accounts = h.approve_connection().await;
    assert_eq!(accounts, json!(["addr1"]));

    let entry = h.broker.registry.lookup(&site()).await.unwrap().unwrap();
    assert_eq!(entry.account_address, "addr1");
    assert_eq!(entry.origin, site());

    let event = h.events.try_recv().unwrap();
    assert_eq!(event.tab_id, Some(TAB));
    assert_eq!(
        event.event,
        TabEvent::AccountsChanged {
            accounts: vec!["addr1".to_string()]
        }
    );

    // The surface that showed the request is gone.
    let window_id = h.host.opened()[0].window_id;
    assert!(!h.host.is_live(window_id));

    tokio::time::sleep(Duration::from_millis(5)).await;
    let again = finish(h.call("requestAccounts", json!([]))).await.unwrap();
    assert_eq!(again, json!(["addr1"]));
    assert_eq!(h.host.opened().len(), 1, "fast path must not open a window");

    let touched = h.broker.registry.lookup(&site()).await.unwrap().unwrap();
    assert_eq!(touched.connected_at, entry.connected_at);
    assert!(touched.last_used_at > entry.last_used_at);
}

#[tokio::test]
async fn second_request_of_a_kind_is_rejected_until_the_slot_clears() {
    let h = harness(Duration::from_secs(30)).await;

    let first = h.call("sendTransaction", json!([{"to": "addr2", "amount": "5"}]));
    h.wait_for_windows(1).await;

    let second = finish(h.call("sendTransaction", json!([{"to": "addr3", "amount": "1"}]))).await;
    let err = second.unwrap_err();
    assert!(matches!(err, BrokerError::RequestAlreadyPending { kind: RequestKind::Transaction }));
    assert!(err.to_rejection().retryable);

    // Other kinds have their own slot.
    let signature = h.call("signMessage", json!(["hello"]));
    h.wait_for_windows(2).await;

    h.decide(
        RequestKind::Transaction,
        Decision::Reject {
            reason: Some("not now".to_string()),
        },
    )
    .await;
    let err = finish(first).await.unwrap_err();
    assert!(matches!(err, BrokerError::UserRejected { ref reason } if reason == "not now"));

    h.decide(RequestKind::Signature, Decision::Approve).await;
    let signed = finish(signature).await.unwrap();
    assert!(signed.as_str().unwrap().starts_with("0x"));

    // The cleared slot accepts a fresh request.
    let retry = h.call("sendTransaction", json!([{"to": "addr3", "amount": "1"}]));
    h.wait_for_windows(3).await;
    h.decide(RequestKind::Transaction, Decision::Approve).await;
    let hash = finish(retry).await.unwrap();
    assert!(hash.as_str().unwrap().starts_with("0x"));
    assert_eq!(h.accounts.submitted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn closing_the_window_abandons_without_submitting() {
    let h = harness(Duration::from_secs(30)).await;

    let call = h.call("sendTransaction", json!([{"to": "addr2", "amount": "5"}]));
    h.wait_for_windows(1).await;

    let window_id = h.host.opened()[0].window_id;
    h.broker.windows.on_closed(window_id).await.unwrap();

    let err = finish(call).await.unwrap_err();
    assert!(matches!(err, BrokerError::Abandoned { kind: RequestKind::Transaction }));
    assert_eq!(err.to_rejection().code, "user_rejected");
    assert_eq!(h.accounts.submitted.load(Ordering::SeqCst), 0);

    // A late click on the closed surface finds nothing to decide.
    assert_eq!(
        h.broker.controller.load(RequestKind::Transaction).await.unwrap(),
        ApprovalScreen::NoPendingRequest
    );
}

#[tokio::test]
async fn undecided_request_times_out_and_frees_the_slot() {
    let h = harness(Duration::from_millis(300)).await;

    let started = tokio::time::Instant::now();
    let call = h.call("sendTransaction", json!([{"to": "addr2", "amount": "5"}]));
    h.wait_for_windows(1).await;

    let err = finish(call).await.unwrap_err();
    assert!(matches!(err, BrokerError::Timeout { kind: RequestKind::Transaction, .. }));
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(
        err.to_rejection(),
        BrokerError::Abandoned {
            kind: RequestKind::Transaction
        }
        .to_rejection()
    );

    assert!(h.broker.pending.peek(RequestKind::Transaction).await.unwrap().is_none());
    assert!(!h.host.is_live(h.host.opened()[0].window_id));
    assert_eq!(h.accounts.submitted.load(Ordering::SeqCst), 0);

    let fresh = h.call("sendTransaction", json!([{"to": "addr2", "amount": "5"}]));
    h.wait_for_windows(2).await;
    h.decide(RequestKind::Transaction, Decision::Approve).await;
    assert!(finish(fresh).await.is_ok());
}

#[tokio::test]
async fn disconnect_clears_trust_and_notifies_the_tab() {
    let mut h = harness(Duration::from_secs(30)).await;
    h.approve_connection().await;
    let _accounts_changed = h.events.try_recv().unwrap();

    let disconnected = finish(h.call("disconnect", json!([]))).await.unwrap();
    assert_eq!(disconnected, json!(true));
    assert!(h.broker.registry.lookup(&site()).await.unwrap().is_none());

    let event = h.events.try_recv().unwrap();
    assert_eq!(event.event, TabEvent::Disconnected);
    assert_eq!(event.tab_id, Some(TAB));

    // Back on the slow path.
    let call = h.call("requestAccounts", json!([]));
    h.wait_for_windows(2).await;
    h.decide(RequestKind::Connection, Decision::Reject { reason: None }).await;
    let err = finish(call).await.unwrap_err();
    assert!(matches!(err, BrokerError::UserRejected { .. }));
}

#[tokio::test]
async fn operator_revoke_notifies_every_tab_of_the_site() {
    let mut h = harness(Duration::from_secs(30)).await;
    h.approve_connection().await;
    let _accounts_changed = h.events.try_recv().unwrap();

    assert!(h.broker.revoke_site(&site()).await.unwrap());
    assert!(!h.broker.revoke_site(&site()).await.unwrap());

    let event = h.events.try_recv().unwrap();
    assert_eq!(event.event, TabEvent::Disconnected);
    assert_eq!(event.tab_id, None);
    assert!(event.is_for(&site(), 99));
    assert!(h.events.try_recv().is_err(), "second revoke must not notify");
}

#[tokio::test]
async fn resolving_twice_delivers_once() {
    let h = harness(Duration::from_secs(30)).await;

    let call = h.call("signMessage", json!({"message": "hello"}));
    h.wait_for_windows(1).await;

    let first = h
        .broker
        .pending
        .resolve(RequestKind::Signature, RequestOutcome::rejected_by_user("first"))
        .await
        .unwrap();
    let second = h
        .broker
        .pending
        .resolve(RequestKind::Signature, RequestOutcome::rejected_by_user("second"))
        .await
        .unwrap();
    assert_eq!(first, ResolveStatus::Written);
    assert!(matches!(second, ResolveStatus::AlreadyResolved(_)));

    let err = finish(call).await.unwrap_err();
    assert!(matches!(err, BrokerError::UserRejected { ref reason } if reason == "first"));

    // Consumed: nothing left to resolve or decide.
    let after = h
        .broker
        .pending
        .resolve(RequestKind::Signature, RequestOutcome::Expired)
        .await
        .unwrap();
    assert_eq!(after, ResolveStatus::NoPendingRequest);
}

#[tokio::test]
async fn approval_that_fails_in_the_account_layer_is_a_rejection() {
    let h = harness(Duration::from_secs(30)).await;

    let call = h.call("sendTransaction", json!([{"to": "addr2", "amount": "500"}]));
    h.wait_for_windows(1).await;

    let decided = h.decide(RequestKind::Transaction, Decision::Approve).await;
    assert!(matches!(
        decided,
        DecisionOutcome::Recorded {
            outcome: RequestOutcome::Rejected { .. }
        }
    ));

    let err = finish(call).await.unwrap_err();
    assert!(matches!(err, BrokerError::PrivilegedActionFailed { .. }));
    assert_eq!(err.to_rejection().code, "action_failed");
}

#[tokio::test]
async fn non_approval_methods_never_open_windows() {
    let h = harness(Duration::from_secs(30)).await;

    let balance = finish(h.call("getBalance", json!(["addr1"]))).await.unwrap();
    assert_eq!(balance, json!("100"));
    let unknown = finish(h.call("getBalance", json!(["addr9"]))).await.unwrap();
    assert_eq!(unknown, json!("0"));

    let err = finish(h.call("eth_sign", json!([]))).await.unwrap_err();
    assert!(matches!(err, BrokerError::UnsupportedMethod(ref m) if m == "eth_sign"));

    let err = finish(h.call("sendTransaction", json!([{"to": "addr2"}]))).await.unwrap_err();
    assert!(matches!(err, BrokerError::InvalidParams { .. }));

    assert!(h.host.opened().is_empty());
    assert!(h.broker.pending.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn startup_sweep_releases_slots_left_by_a_previous_run() {
    let h = harness(Duration::from_millis(200)).await;

    // A request whose poller died: resolved, never consumed.
    let request = walletgate::broker::PendingRequest::new(
        site(),
        TAB,
        walletgate::broker::RequestPayload::Signature {
            message: "orphan".to_string(),
        },
    );
    h.broker.pending.open(&request).await.unwrap();
    h.broker
        .pending
        .resolve(RequestKind::Signature, RequestOutcome::rejected_by_user("gone"))
        .await
        .unwrap();

    assert!(h.broker.pending.sweep_stale().await.unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let swept = h.broker.pending.sweep_stale().await.unwrap();
    assert_eq!(swept.len(), 1);
    assert_eq!(swept[0].request_id, request.request_id);
    assert!(h.broker.pending.peek(RequestKind::Signature).await.unwrap().is_none());
}
