use async_trait::async_trait;
use async_tungstenite::tokio::connect_async;
use async_tungstenite::tungstenite::Message;
use futures::{SinkExt, StreamExt};
use pc_api_types::{ChainInfo, GenesisHash};
use pc_crypto::{ExternalSigner, to_hex};
use pc_node_client::{
    ConnectionHandle, ContractCall, DryRunOutcome, DryRunResult, EventField, EventRecord,
    NodeClient, NodeConnector, NodeError, NodeNotification, SigningCapability, TxProgress,
    TxStatus, render_value,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const DEFAULT_WS_URL: &str = "ws://127.0.0.1:9944";

const METHOD_SYSTEM_CHAIN: &str = "system_chain";
const METHOD_SYSTEM_NAME: &str = "system_name";
const METHOD_SYSTEM_VERSION: &str = "system_version";
const METHOD_BLOCK_HASH: &str = "chain_getBlockHash";
const METHOD_CONTRACT_CALL: &str = "contracts_call";
const METHOD_SUBMIT_AND_WATCH: &str = "contracts_submitAndWatch";
const METHOD_SUBSCRIBE_EVENTS: &str = "chain_subscribeEvents";

const TX_STATUS_BUFFER: usize = 16;
const EVENT_BUFFER: usize = 64;

/// Reconnect behaviour after the socket drops or fails to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Consecutive attempts before giving up. Zero disables reconnecting.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }

    pub fn bounded(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::disabled()
        }
    }

    /// Exponential backoff: `base * 2^(attempt - 1)`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1_u32 << exponent)
            .min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Opens JSON-RPC connections over WebSocket.
///
/// Reads `POINTS_WS_URL` from environment when no endpoint is given
/// (default: `ws://127.0.0.1:9944`).
pub struct WsConnector {
    endpoint: String,
    type_aliases: BTreeMap<String, String>,
    reconnect: ReconnectPolicy,
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(None)
    }
}

impl WsConnector {
    pub fn new(endpoint: Option<String>) -> Self {
        let endpoint = endpoint
            .or_else(|| std::env::var("POINTS_WS_URL").ok())
            .unwrap_or_else(|| DEFAULT_WS_URL.to_string());
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            type_aliases: BTreeMap::new(),
            reconnect: ReconnectPolicy::disabled(),
        }
    }

    pub fn with_type_aliases(mut self, aliases: BTreeMap<String, String>) -> Self {
        self.type_aliases = aliases;
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }
}

#[async_trait]
impl NodeConnector for WsConnector {
    async fn open(&self) -> Result<(ConnectionHandle, mpsc::Receiver<NodeNotification>), NodeError> {
        let (notify_tx, notify_rx) = mpsc::channel(32);
        let client = Arc::new(WsNodeClient::new(&self.endpoint, self.type_aliases.clone()));
        info!(endpoint = %self.endpoint, "opening node socket");

        tokio::spawn(run_connection(client.clone(), notify_tx, self.reconnect.clone()));

        Ok((ConnectionHandle::new(client), notify_rx))
    }
}

// ── JSON-RPC frames ──────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcFrame {
    id: Option<u64>,
    result: Option<Value>,
    error: Option<RpcErrorBody>,
    params: Option<SubscriptionParams>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct SubscriptionParams {
    subscription: Value,
    result: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DryRunWire {
    #[serde(default)]
    gas_consumed: u64,
    result: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TxProgressWire {
    status: Value,
    #[serde(default)]
    dispatch_error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct EventRecordWire {
    phase: Value,
    event: EventWire,
}

#[derive(Debug, Deserialize)]
struct EventWire {
    section: String,
    method: String,
    #[serde(default)]
    data: Vec<EventDataWire>,
    #[serde(default)]
    docs: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EventDataWire {
    #[serde(rename = "type")]
    type_name: String,
    value: Value,
}

enum PendingRequest {
    Call(oneshot::Sender<Result<Value, NodeError>>),
    Subscribe(oneshot::Sender<Result<mpsc::UnboundedReceiver<Value>, NodeError>>),
}

/// One node connection. Survives socket reconnects; in-flight requests and
/// subscriptions fail when the socket they were sent on drops.
pub struct WsNodeClient {
    id: Uuid,
    endpoint: String,
    type_aliases: BTreeMap<String, String>,
    next_request_id: AtomicU64,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    subscriptions: Mutex<HashMap<String, mpsc::UnboundedSender<Value>>>,
    genesis: Mutex<Option<GenesisHash>>,
    signer: RwLock<Option<Arc<dyn ExternalSigner>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl WsNodeClient {
    fn new(endpoint: &str, type_aliases: BTreeMap<String, String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            endpoint: endpoint.to_owned(),
            type_aliases,
            next_request_id: AtomicU64::new(1),
            outbound: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            genesis: Mutex::new(None),
            signer: RwLock::new(None),
        }
    }

    fn send_frame(&self, id: u64, method: &str, params: Value) -> Result<(), NodeError> {
        let frame = serde_json::to_string(&RpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        })
        .map_err(|err| NodeError::Decode(err.to_string()))?;

        let outbound = lock(&self.outbound);
        let sender = outbound.as_ref().ok_or(NodeError::Closed)?;
        sender.send(frame).map_err(|_| NodeError::Closed)
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, NodeError> {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, PendingRequest::Call(tx));

        if let Err(err) = self.send_frame(id, method, params) {
            lock(&self.pending).remove(&id);
            return Err(err);
        }

        rx.await.map_err(|_| NodeError::Closed)?
    }

    async fn subscribe(&self, method: &str, params: Value) -> Result<mpsc::UnboundedReceiver<Value>, NodeError> {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, PendingRequest::Subscribe(tx));

        if let Err(err) = self.send_frame(id, method, params) {
            lock(&self.pending).remove(&id);
            return Err(err);
        }

        rx.await.map_err(|_| NodeError::Closed)?
    }

    fn handle_frame(&self, text: &str) {
        let frame = match serde_json::from_str::<RpcFrame>(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("ignoring malformed frame from {}: {}", self.endpoint, err);
                return;
            }
        };

        if let Some(id) = frame.id {
            let Some(pending) = lock(&self.pending).remove(&id) else {
                debug!(id, "response for unknown request");
                return;
            };

            let outcome = match frame.error {
                Some(body) => Err(NodeError::Rpc {
                    code: body.code,
                    message: body.message,
                }),
                None => Ok(frame.result.unwrap_or(Value::Null)),
            };

            match pending {
                PendingRequest::Call(reply) => {
                    let _ = reply.send(outcome);
                }
                PendingRequest::Subscribe(reply) => {
                    let outcome = outcome.map(|subscription| {
                        let (tx, rx) = mpsc::unbounded_channel();
                        lock(&self.subscriptions).insert(render_value(&subscription), tx);
                        rx
                    });
                    let _ = reply.send(outcome);
                }
            }
            return;
        }

        if let Some(params) = frame.params {
            let key = render_value(&params.subscription);
            let mut subscriptions = lock(&self.subscriptions);
            let delivered = subscriptions
                .get(&key)
                .map(|tx| tx.send(params.result).is_ok())
                .unwrap_or(false);
            if !delivered {
                debug!(subscription = %key, "dropping notification for closed subscription");
                subscriptions.remove(&key);
            }
        }
    }

    fn attach_outbound(&self, sender: mpsc::UnboundedSender<String>) {
        *lock(&self.outbound) = Some(sender);
    }

    /// Fails everything that was waiting on the socket that just closed.
    fn detach(&self) {
        lock(&self.outbound).take();
        for (_, pending) in lock(&self.pending).drain() {
            match pending {
                PendingRequest::Call(reply) => {
                    let _ = reply.send(Err(NodeError::Closed));
                }
                PendingRequest::Subscribe(reply) => {
                    let _ = reply.send(Err(NodeError::Closed));
                }
            }
        }
        lock(&self.subscriptions).clear();
    }

    /// Runs after every (re)connect; the connection is ready once the
    /// genesis identity is known.
    async fn handshake(&self) -> Result<(), NodeError> {
        let genesis = self.request(METHOD_BLOCK_HASH, json!([0])).await?;
        let genesis = genesis
            .as_str()
            .ok_or_else(|| NodeError::Decode("genesis hash is not a string".to_owned()))?;
        *lock(&self.genesis) = Some(GenesisHash(genesis.to_owned()));
        Ok(())
    }
}

#[async_trait]
impl NodeClient for WsNodeClient {
    fn connection_id(&self) -> Uuid {
        self.id
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn chain_info(&self) -> Result<ChainInfo, NodeError> {
        let (chain, name, version) = tokio::try_join!(
            self.request(METHOD_SYSTEM_CHAIN, json!([])),
            self.request(METHOD_SYSTEM_NAME, json!([])),
            self.request(METHOD_SYSTEM_VERSION, json!([])),
        )?;

        Ok(ChainInfo {
            chain_name: render_value(&chain),
            node_name: render_value(&name),
            node_version: render_value(&version),
        })
    }

    async fn genesis_hash(&self) -> Result<GenesisHash, NodeError> {
        let cached = lock(&self.genesis).clone();
        if let Some(genesis) = cached {
            return Ok(genesis);
        }
        self.handshake().await?;
        lock(&self.genesis).clone().ok_or(NodeError::Closed)
    }

    async fn dry_run(&self, call: &ContractCall) -> Result<DryRunOutcome, NodeError> {
        let response = self
            .request(METHOD_CONTRACT_CALL, json!([call_params(call)]))
            .await?;
        parse_dry_run(response)
    }

    async fn submit_and_watch(
        &self,
        call: &ContractCall,
        signing: &SigningCapability,
    ) -> Result<mpsc::Receiver<TxProgress>, NodeError> {
        let signature = signing.sign(self.signer(), &call.signing_payload()).await?;

        let mut params = call_params(call);
        params["signer"] = Value::String(signing.address());
        params["signature"] = Value::String(format!("0x{}", to_hex(&signature)));

        let mut raw = self.subscribe(METHOD_SUBMIT_AND_WATCH, json!([params])).await?;
        let (tx, rx) = mpsc::channel(TX_STATUS_BUFFER);

        tokio::spawn(async move {
            while let Some(value) = raw.recv().await {
                let progress = match parse_tx_progress(value) {
                    Ok(progress) => progress,
                    Err(err) => {
                        warn!("skipping undecodable transaction status: {}", err);
                        continue;
                    }
                };
                let done = progress.status.is_finalized() || progress.status.is_abandoned();
                if tx.send(progress).await.is_err() || done {
                    break;
                }
            }
        });

        Ok(rx)
    }

    async fn subscribe_events(&self) -> Result<mpsc::Receiver<Vec<EventRecord>>, NodeError> {
        let mut raw = self.subscribe(METHOD_SUBSCRIBE_EVENTS, json!([])).await?;
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let aliases = self.type_aliases.clone();

        tokio::spawn(async move {
            while let Some(value) = raw.recv().await {
                let batch = match parse_event_batch(value, &aliases) {
                    Ok(batch) => batch,
                    Err(err) => {
                        warn!("skipping undecodable event batch: {}", err);
                        continue;
                    }
                };
                if tx.send(batch).await.is_err() {
                    break;
                }
            }
        });

        Ok(rx)
    }

    fn set_signer(&self, signer: Arc<dyn ExternalSigner>) {
        debug!(source = signer.source(), "attaching external signer");
        *self.signer.write().unwrap_or_else(PoisonError::into_inner) = Some(signer);
    }

    fn signer(&self) -> Option<Arc<dyn ExternalSigner>> {
        self.signer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

async fn run_connection(
    client: Arc<WsNodeClient>,
    notify: mpsc::Sender<NodeNotification>,
    policy: ReconnectPolicy,
) {
    let mut attempt: u32 = 0;

    loop {
        match connect_async(client.endpoint.as_str()).await {
            Ok((stream, _response)) => {
                attempt = 0;
                info!(endpoint = %client.endpoint, "node socket connected");

                let (mut sink, mut source) = stream.split();
                let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
                client.attach_outbound(out_tx);
                let _ = notify.send(NodeNotification::Connected).await;

                let writer = tokio::spawn(async move {
                    while let Some(frame) = out_rx.recv().await {
                        if let Err(err) = sink.send(Message::text(frame)).await {
                            warn!("node socket write failed: {}", err);
                            break;
                        }
                    }
                });

                let handshake = {
                    let client = client.clone();
                    let notify = notify.clone();
                    tokio::spawn(async move {
                        let notification = match client.handshake().await {
                            Ok(()) => NodeNotification::Ready,
                            Err(err) => NodeNotification::Error(format!("handshake failed: {err}")),
                        };
                        let _ = notify.send(notification).await;
                    })
                };

                let mut failure = None;
                while let Some(message) = source.next().await {
                    match message {
                        Ok(Message::Text(text)) => client.handle_frame(&text),
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(err) => {
                            failure = Some(err.to_string());
                            break;
                        }
                    }
                }

                handshake.abort();
                writer.abort();
                client.detach();

                let notification = match failure {
                    Some(err) => {
                        error!(endpoint = %client.endpoint, "node socket failed: {}", err);
                        NodeNotification::Error(err)
                    }
                    None => {
                        warn!(endpoint = %client.endpoint, "node socket disconnected");
                        NodeNotification::Disconnected
                    }
                };
                let _ = notify.send(notification).await;
            }
            Err(err) => {
                error!(endpoint = %client.endpoint, "node socket connect failed: {}", err);
                let _ = notify.send(NodeNotification::Error(err.to_string())).await;
            }
        }

        attempt += 1;
        if attempt > policy.max_attempts {
            info!(endpoint = %client.endpoint, "giving up on node socket");
            break;
        }

        let delay = policy.delay_for(attempt);
        info!(attempt, ?delay, "reconnecting to node");
        tokio::time::sleep(delay).await;
    }
}

fn call_params(call: &ContractCall) -> Value {
    json!({
        "origin": call.origin,
        "dest": call.dest,
        "value": call.value.to_string(),
        "gasLimit": call.gas_limit,
        "message": call.message,
        "args": call.args,
    })
}

fn parse_dry_run(response: Value) -> Result<DryRunOutcome, NodeError> {
    let wire: DryRunWire =
        serde_json::from_value(response).map_err(|err| NodeError::Decode(err.to_string()))?;

    let map = wire
        .result
        .as_object()
        .ok_or_else(|| NodeError::Decode("dry run result is not an object".to_owned()))?;

    let result = if let Some(ok) = field_ci(map, "ok") {
        let output = ok
            .as_object()
            .and_then(|body| field_ci(body, "data"))
            .cloned()
            .unwrap_or_else(|| ok.clone());
        DryRunResult::Success {
            output: (!output.is_null()).then_some(output),
        }
    } else if let Some(err) = field_ci(map, "err") {
        DryRunResult::Failure {
            reason: render_value(err),
        }
    } else {
        return Err(NodeError::Decode("dry run result has neither Ok nor Err".to_owned()));
    };

    Ok(DryRunOutcome {
        gas_consumed: wire.gas_consumed,
        result,
    })
}

fn parse_tx_progress(value: Value) -> Result<TxProgress, NodeError> {
    let wire: TxProgressWire =
        serde_json::from_value(value).map_err(|err| NodeError::Decode(err.to_string()))?;

    let (kind, detail) = match &wire.status {
        Value::String(kind) => (kind.clone(), String::new()),
        Value::Object(map) if map.len() == 1 => match map.iter().next() {
            Some((kind, detail)) => (kind.clone(), render_value(detail)),
            None => (String::new(), String::new()),
        },
        other => return Err(NodeError::Decode(format!("unexpected status {other}"))),
    };

    let status = match kind.to_ascii_lowercase().as_str() {
        "future" => TxStatus::Future,
        "ready" => TxStatus::Ready,
        "broadcast" => TxStatus::Broadcast,
        "inblock" => TxStatus::InBlock(detail),
        "retracted" => TxStatus::Retracted(detail),
        "finalitytimeout" => TxStatus::FinalityTimeout(detail),
        "finalized" => TxStatus::Finalized(detail),
        "usurped" => TxStatus::Usurped(detail),
        "dropped" => TxStatus::Dropped,
        "invalid" => TxStatus::Invalid,
        other => return Err(NodeError::Decode(format!("unknown status {other}"))),
    };

    Ok(TxProgress {
        status,
        dispatch_error: wire
            .dispatch_error
            .filter(|err| !err.is_null())
            .map(|err| render_value(&err)),
    })
}

fn parse_event_batch(
    value: Value,
    aliases: &BTreeMap<String, String>,
) -> Result<Vec<EventRecord>, NodeError> {
    let records: Vec<EventRecordWire> =
        serde_json::from_value(value).map_err(|err| NodeError::Decode(err.to_string()))?;

    Ok(records
        .into_iter()
        .map(|record| EventRecord {
            section: record.event.section,
            method: record.event.method,
            phase: render_value(&record.phase),
            fields: record
                .event
                .data
                .into_iter()
                .map(|field| EventField {
                    type_name: aliases
                        .get(&field.type_name)
                        .cloned()
                        .unwrap_or(field.type_name),
                    value: render_value(&field.value),
                })
                .collect(),
            docs: record.event.docs,
        })
        .collect())
}

fn field_ci<'a>(map: &'a serde_json::Map<String, Value>, key: &str) -> Option<&'a Value> {
    map.iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(key))
        .map(|(_, value)| value)
}
