use anyhow::{Result, anyhow};
use async_trait::async_trait;
use pc_api_types::{ChainInfo, ContractRef, GenesisHash, InjectedAccount, SignPurpose};
use pc_crypto::{Ed25519Signer, ExternalSigner, Signer};
use pc_extension::InjectedExtension;
use pc_node_client::{
    ConnectionHandle, ContractCall, DryRunOutcome, DryRunResult, EventRecord, NodeClient,
    NodeConnector, NodeError, NodeNotification, SigningCapability, TxProgress, TxStatus,
};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::mpsc;
use uuid::Uuid;

pub const POINTS_ADDRESS: &str = "5FyEUCbeE69z97PUxWGQWJSo4F2p64Fpev2vBWYvPpM8r8Q9";
pub const GENESIS: &str = "0x91b171bb158e2d3848fa23a9f1c25182fb8e20313b2c1eb49219da7a70ce90c3";
pub const EXTENSION_SOURCE: &str = "polkadot-js";

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scriptable node. Counts every transport call it receives.
pub struct MockNode {
    id: Uuid,
    chain: ChainInfo,
    genesis: GenesisHash,
    dry_run: Mutex<Result<DryRunOutcome, NodeError>>,
    tx_script: Mutex<Vec<TxProgress>>,
    submit_error: Mutex<Option<NodeError>>,
    metadata_fails: AtomicBool,
    events: Mutex<Option<mpsc::Sender<Vec<EventRecord>>>>,
    event_failures: Mutex<(usize, Option<NodeError>)>,
    signer: RwLock<Option<Arc<dyn ExternalSigner>>>,
    dry_runs: AtomicUsize,
    submissions: AtomicUsize,
    event_subscriptions: AtomicUsize,
    last_call: Mutex<Option<ContractCall>>,
    last_signer: Mutex<Option<String>>,
}

impl MockNode {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            chain: ChainInfo {
                chain_name: "Development".to_owned(),
                node_name: "Canvas Node".to_owned(),
                node_version: "0.1.0".to_owned(),
            },
            genesis: GenesisHash(GENESIS.to_owned()),
            dry_run: Mutex::new(Ok(DryRunOutcome {
                gas_consumed: 1_250_000_000,
                result: DryRunResult::Success {
                    output: Some(json!({ "Ok": null })),
                },
            })),
            tx_script: Mutex::new(finalized_ok()),
            submit_error: Mutex::new(None),
            metadata_fails: AtomicBool::new(false),
            events: Mutex::new(None),
            event_failures: Mutex::new((0, None)),
            signer: RwLock::new(None),
            dry_runs: AtomicUsize::new(0),
            submissions: AtomicUsize::new(0),
            event_subscriptions: AtomicUsize::new(0),
            last_call: Mutex::new(None),
            last_signer: Mutex::new(None),
        })
    }

    pub fn handle(self: &Arc<Self>) -> ConnectionHandle {
        ConnectionHandle::new(self.clone())
    }

    pub fn set_dry_run(&self, outcome: Result<DryRunOutcome, NodeError>) {
        *lock(&self.dry_run) = outcome;
    }

    pub fn set_output(&self, output: Value) {
        self.set_dry_run(Ok(DryRunOutcome {
            gas_consumed: 1_250_000_000,
            result: DryRunResult::Success { output: Some(output) },
        }));
    }

    pub fn script_transaction(&self, statuses: Vec<TxProgress>) {
        *lock(&self.tx_script) = statuses;
    }

    pub fn fail_submission(&self, err: NodeError) {
        *lock(&self.submit_error) = Some(err);
    }

    pub fn fail_metadata(&self, fail: bool) {
        self.metadata_fails.store(fail, Ordering::SeqCst);
    }

    pub fn dry_run_count(&self) -> usize {
        self.dry_runs.load(Ordering::SeqCst)
    }

    pub fn submission_count(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }

    pub fn event_subscription_count(&self) -> usize {
        self.event_subscriptions.load(Ordering::SeqCst)
    }

    pub fn last_call(&self) -> Option<ContractCall> {
        lock(&self.last_call).clone()
    }

    pub fn last_signer(&self) -> Option<String> {
        lock(&self.last_signer).clone()
    }

    /// The next `count` event subscriptions fail with `err`.
    pub fn fail_event_subscriptions(&self, count: usize, err: NodeError) {
        *lock(&self.event_failures) = (count, Some(err));
    }

    /// Closes the current event stream, as a node dropping the subscription would.
    pub fn end_event_stream(&self) {
        lock(&self.events).take();
    }

    /// Delivers one block's events to the current subscriber, if any.
    pub async fn emit_events(&self, batch: Vec<EventRecord>) -> bool {
        let sender = lock(&self.events).clone();
        match sender {
            Some(sender) => sender.send(batch).await.is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl NodeClient for MockNode {
    fn connection_id(&self) -> Uuid {
        self.id
    }

    fn endpoint(&self) -> &str {
        "mock://node"
    }

    async fn chain_info(&self) -> Result<ChainInfo, NodeError> {
        if self.metadata_fails.load(Ordering::SeqCst) {
            return Err(NodeError::Transport("metadata unavailable".to_owned()));
        }
        Ok(self.chain.clone())
    }

    async fn genesis_hash(&self) -> Result<GenesisHash, NodeError> {
        Ok(self.genesis.clone())
    }

    async fn dry_run(&self, call: &ContractCall) -> Result<DryRunOutcome, NodeError> {
        self.dry_runs.fetch_add(1, Ordering::SeqCst);
        *lock(&self.last_call) = Some(call.clone());
        lock(&self.dry_run).clone()
    }

    async fn submit_and_watch(
        &self,
        call: &ContractCall,
        signing: &SigningCapability,
    ) -> Result<mpsc::Receiver<TxProgress>, NodeError> {
        self.submissions.fetch_add(1, Ordering::SeqCst);
        *lock(&self.last_call) = Some(call.clone());

        let submit_error = lock(&self.submit_error).clone();
        if let Some(err) = submit_error {
            return Err(err);
        }

        signing.sign(self.signer(), &call.signing_payload()).await?;
        *lock(&self.last_signer) = Some(signing.address());

        let script = lock(&self.tx_script).clone();
        let (tx, rx) = mpsc::channel(script.len().max(1));
        for progress in script {
            let _ = tx.try_send(progress);
        }
        Ok(rx)
    }

    async fn subscribe_events(&self) -> Result<mpsc::Receiver<Vec<EventRecord>>, NodeError> {
        self.event_subscriptions.fetch_add(1, Ordering::SeqCst);
        let failure = {
            let mut failures = lock(&self.event_failures);
            match failures.0 {
                0 => None,
                _ => {
                    failures.0 -= 1;
                    failures.1.clone()
                }
            }
        };
        if let Some(err) = failure {
            return Err(err);
        }

        let (tx, rx) = mpsc::channel(16);
        *lock(&self.events) = Some(tx);
        Ok(rx)
    }

    fn set_signer(&self, signer: Arc<dyn ExternalSigner>) {
        *self.signer.write().unwrap_or_else(PoisonError::into_inner) = Some(signer);
    }

    fn signer(&self) -> Option<Arc<dyn ExternalSigner>> {
        self.signer.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

pub fn progress(status: TxStatus) -> TxProgress {
    TxProgress {
        status,
        dispatch_error: None,
    }
}

pub fn finalized_ok() -> Vec<TxProgress> {
    vec![
        progress(TxStatus::Ready),
        progress(TxStatus::InBlock("0x01".to_owned())),
        progress(TxStatus::Finalized("0x01".to_owned())),
    ]
}

/// Hands out one [`MockNode`] connection; the test drives its notifications.
pub struct MockConnector {
    node: Arc<MockNode>,
    control: Mutex<Option<mpsc::Sender<NodeNotification>>>,
    opens: AtomicUsize,
    refuse: AtomicBool,
}

impl MockConnector {
    pub fn new(node: Arc<MockNode>) -> Arc<Self> {
        Arc::new(Self {
            node,
            control: Mutex::new(None),
            opens: AtomicUsize::new(0),
            refuse: AtomicBool::new(false),
        })
    }

    pub fn refuse(&self) {
        self.refuse.store(true, Ordering::SeqCst);
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub async fn notify(&self, notification: NodeNotification) -> bool {
        let sender = lock(&self.control).clone();
        match sender {
            Some(sender) => sender.send(notification).await.is_ok(),
            None => false,
        }
    }

    /// Ends the notification stream.
    pub fn close(&self) {
        lock(&self.control).take();
    }
}

#[async_trait]
impl NodeConnector for MockConnector {
    async fn open(&self) -> Result<(ConnectionHandle, mpsc::Receiver<NodeNotification>), NodeError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(NodeError::Transport("connection refused".to_owned()));
        }
        let (tx, rx) = mpsc::channel(16);
        *lock(&self.control) = Some(tx);
        Ok((self.node.handle(), rx))
    }
}

/// Signs with a local key but presents itself as an extension.
pub struct MockSigner {
    key: Ed25519Signer,
    calls: AtomicUsize,
}

impl MockSigner {
    pub fn address(&self) -> String {
        self.key.address()
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExternalSigner for MockSigner {
    fn source(&self) -> &str {
        EXTENSION_SOURCE
    }

    async fn sign(&self, _address: &str, payload: &[u8], purpose: SignPurpose) -> Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.key.sign(payload, purpose)
    }
}

pub struct MockExtension {
    accounts: Vec<InjectedAccount>,
    signer: Arc<MockSigner>,
    failures_left: AtomicUsize,
    enables: AtomicUsize,
}

impl MockExtension {
    pub fn with_account(name: &str) -> Arc<Self> {
        let signer = Arc::new(MockSigner {
            key: Ed25519Signer::new_random(),
            calls: AtomicUsize::new(0),
        });
        Arc::new(Self {
            accounts: vec![InjectedAccount {
                address: signer.address(),
                name: name.to_owned(),
                source: EXTENSION_SOURCE.to_owned(),
            }],
            signer,
            failures_left: AtomicUsize::new(0),
            enables: AtomicUsize::new(0),
        })
    }

    /// The next `count` calls to `enable` fail.
    pub fn fail_enable(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub fn enable_count(&self) -> usize {
        self.enables.load(Ordering::SeqCst)
    }

    pub fn account_address(&self) -> String {
        self.signer.address()
    }

    pub fn mock_signer(&self) -> Arc<MockSigner> {
        self.signer.clone()
    }
}

#[async_trait]
impl InjectedExtension for MockExtension {
    async fn enable(&self, _app_name: &str) -> Result<Vec<String>> {
        self.enables.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures_left.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_left.store(remaining - 1, Ordering::SeqCst);
            return Err(anyhow!("extension refused authorization"));
        }
        Ok(vec![EXTENSION_SOURCE.to_owned()])
    }

    async fn accounts(&self) -> Result<Vec<InjectedAccount>> {
        Ok(self.accounts.clone())
    }

    fn signer(&self, source: &str) -> Option<Arc<dyn ExternalSigner>> {
        (source == EXTENSION_SOURCE).then(|| self.signer.clone() as Arc<dyn ExternalSigner>)
    }
}

/// Metadata for the points contract in the versioned ink! layout.
pub fn points_abi() -> Value {
    fn arg(label: &str, type_name: &str) -> Value {
        json!({ "label": label, "type": { "displayName": [type_name], "type": 0 } })
    }

    fn message(label: &str, args: Vec<Value>, mutates: bool, returns: &str, docs: &[&str]) -> Value {
        json!({
            "label": label,
            "selector": format!("0x{:08x}", label.len()),
            "args": args,
            "mutates": mutates,
            "payable": false,
            "returnType": { "displayName": [returns], "type": 1 },
            "docs": docs,
        })
    }

    json!({
        "source": { "hash": "0x00", "language": "ink! 3.0.0" },
        "contract": { "name": "point", "version": "0.1.0" },
        "V3": {
            "spec": {
                "constructors": [{ "label": "new", "args": [arg("init_value", "Balance")] }],
                "messages": [
                    message("issuance_points", vec![arg("value", "Balance")], true, "Result", &["Issue points."]),
                    message("give_authority", vec![arg("store", "AccountId")], true, "Result", &["Allow a store to grant points."]),
                    message(
                        "give_user_points",
                        vec![arg("store", "AccountId"), arg("user", "AccountId"), arg("value", "Balance")],
                        true,
                        "Result",
                        &["Grant points to a user."],
                    ),
                    message("get_owner_points", vec![], false, "Balance", &[]),
                    message("get_store_points", vec![arg("store", "AccountId")], false, "Balance", &[]),
                    message(
                        "get_store_user_points",
                        vec![arg("store", "AccountId"), arg("user", "AccountId")],
                        false,
                        "Balance",
                        &[],
                    ),
                    message("get_user_points", vec![arg("user", "AccountId")], false, "Balance", &[]),
                    message(
                        "use_user_points",
                        vec![arg("store", "AccountId"), arg("user", "AccountId"), arg("value", "Balance")],
                        true,
                        "Result",
                        &["Use points granted by a store."],
                    ),
                    message("is_authority", vec![arg("store", "AccountId")], false, "bool", &[]),
                ]
            }
        }
    })
}

pub fn points_contract() -> ContractRef {
    ContractRef {
        address: POINTS_ADDRESS.to_owned(),
        name: "points".to_owned(),
        abi: Some(points_abi()),
        genesis_hash: Some(GENESIS.to_owned()),
    }
}
