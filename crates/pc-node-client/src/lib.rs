use async_trait::async_trait;
use pc_api_types::{ChainInfo, GenesisHash, SignPurpose};
use pc_crypto::{Ed25519Signer, ExternalSigner, Signer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Lifecycle notifications emitted by a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeNotification {
    Connected,
    Ready,
    Disconnected,
    Error(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NodeError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("{message} (code {code})")]
    Rpc { code: i64, message: String },
    #[error("connection closed")]
    Closed,
    #[error("decode error: {0}")]
    Decode(String),
    #[error("signing failed: {0}")]
    Signing(String),
}

/// A contract message invocation, shared by dry runs and submissions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractCall {
    pub origin: String,
    pub dest: String,
    pub value: u128,
    /// `None` asks the node for its maximum allowance.
    pub gas_limit: Option<u64>,
    pub message: String,
    pub args: Vec<Value>,
}

impl ContractCall {
    /// Canonical bytes covered by the submission signature.
    pub fn signing_payload(&self) -> Vec<u8> {
        let args = Value::Array(self.args.clone()).to_string();
        format!(
            "origin={};dest={};value={};gas_limit={};message={};args={}",
            self.origin,
            self.dest,
            self.value,
            self.gas_limit.map(|gas| gas.to_string()).unwrap_or_default(),
            self.message,
            args
        )
        .into_bytes()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DryRunResult {
    /// The call executed; `output` is the decoded return value.
    Success { output: Option<Value> },
    /// The runtime rejected the call (trap, revert, dispatch error).
    Failure { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct DryRunOutcome {
    pub gas_consumed: u64,
    pub result: DryRunResult,
}

impl DryRunOutcome {
    /// Error carried inside a successful execution's return value, i.e. the
    /// contract returned `Err(..)`. A `{"Ok": ..}` wrapper around the message
    /// result is looked through.
    pub fn application_error(&self) -> Option<String> {
        let DryRunResult::Success { output: Some(output) } = &self.result else {
            return None;
        };

        let inner = match output.as_object().and_then(|map| single_entry(map, "ok")) {
            Some(inner) => inner,
            None => output,
        };

        let map = inner.as_object()?;
        single_entry(map, "err").map(render_error_value)
    }
}

fn single_entry<'a>(map: &'a serde_json::Map<String, Value>, key: &str) -> Option<&'a Value> {
    if map.len() != 1 {
        return None;
    }
    map.iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(key))
        .map(|(_, value)| value)
}

fn render_error_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Object(map) if map.len() == 1 => match map.iter().next() {
            Some((variant, payload)) if payload.is_null() => variant.clone(),
            Some((variant, payload)) => format!("{variant}: {}", render_value(payload)),
            None => String::new(),
        },
        other => other.to_string(),
    }
}

/// Text form of a decoded value: strings without quotes, everything else as JSON.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxStatus {
    Future,
    Ready,
    Broadcast,
    InBlock(String),
    Retracted(String),
    FinalityTimeout(String),
    Finalized(String),
    Usurped(String),
    Dropped,
    Invalid,
}

impl TxStatus {
    pub fn phase(&self) -> &'static str {
        match self {
            TxStatus::Future => "Future",
            TxStatus::Ready => "Ready",
            TxStatus::Broadcast => "Broadcast",
            TxStatus::InBlock(_) => "InBlock",
            TxStatus::Retracted(_) => "Retracted",
            TxStatus::FinalityTimeout(_) => "FinalityTimeout",
            TxStatus::Finalized(_) => "Finalized",
            TxStatus::Usurped(_) => "Usurped",
            TxStatus::Dropped => "Dropped",
            TxStatus::Invalid => "Invalid",
        }
    }

    pub fn is_finalized(&self) -> bool {
        matches!(self, TxStatus::Finalized(_))
    }

    /// The transaction will never be finalized.
    pub fn is_abandoned(&self) -> bool {
        matches!(self, TxStatus::Usurped(_) | TxStatus::Dropped | TxStatus::Invalid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxProgress {
    pub status: TxStatus,
    /// Set when the included extrinsic failed to dispatch.
    pub dispatch_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventField {
    pub type_name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub section: String,
    pub method: String,
    pub phase: String,
    #[serde(default)]
    pub fields: Vec<EventField>,
    #[serde(default)]
    pub docs: Vec<String>,
}

/// What a transaction gets signed with.
#[derive(Clone)]
pub enum SigningCapability {
    /// Key material held in this process.
    Local(Arc<Ed25519Signer>),
    /// Signing is delegated to the external signer attached to the connection.
    Delegated { address: String },
}

impl SigningCapability {
    pub fn address(&self) -> String {
        match self {
            SigningCapability::Local(signer) => signer.address(),
            SigningCapability::Delegated { address } => address.clone(),
        }
    }

    pub async fn sign(
        &self,
        attached: Option<Arc<dyn ExternalSigner>>,
        payload: &[u8],
    ) -> Result<Vec<u8>, NodeError> {
        match self {
            SigningCapability::Local(signer) => signer
                .sign(payload, SignPurpose::Transaction)
                .map_err(|err| NodeError::Signing(err.to_string())),
            SigningCapability::Delegated { address } => {
                let signer = attached.ok_or_else(|| {
                    NodeError::Signing(format!("no external signer attached for {address}"))
                })?;
                signer
                    .sign(address, payload, SignPurpose::Transaction)
                    .await
                    .map_err(|err| NodeError::Signing(err.to_string()))
            }
        }
    }
}

impl fmt::Debug for SigningCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SigningCapability::Local(signer) => {
                f.debug_tuple("Local").field(&signer.address()).finish()
            }
            SigningCapability::Delegated { address } => {
                f.debug_struct("Delegated").field("address", address).finish()
            }
        }
    }
}

#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Stable identity of this connection, used to key derived caches.
    fn connection_id(&self) -> Uuid;
    fn endpoint(&self) -> &str;
    async fn chain_info(&self) -> Result<ChainInfo, NodeError>;
    async fn genesis_hash(&self) -> Result<GenesisHash, NodeError>;
    async fn dry_run(&self, call: &ContractCall) -> Result<DryRunOutcome, NodeError>;
    async fn submit_and_watch(
        &self,
        call: &ContractCall,
        signing: &SigningCapability,
    ) -> Result<mpsc::Receiver<TxProgress>, NodeError>;
    /// One message per block, records in block order.
    async fn subscribe_events(&self) -> Result<mpsc::Receiver<Vec<EventRecord>>, NodeError>;
    fn set_signer(&self, signer: Arc<dyn ExternalSigner>);
    fn signer(&self) -> Option<Arc<dyn ExternalSigner>>;
}

/// Shared handle to a live connection.
#[derive(Clone)]
pub struct ConnectionHandle(Arc<dyn NodeClient>);

impl ConnectionHandle {
    pub fn new(client: Arc<dyn NodeClient>) -> Self {
        Self(client)
    }

    pub fn id(&self) -> Uuid {
        self.0.connection_id()
    }
}

impl Deref for ConnectionHandle {
    type Target = dyn NodeClient;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id())
            .field("endpoint", &self.endpoint())
            .finish()
    }
}

#[async_trait]
pub trait NodeConnector: Send + Sync {
    /// Starts connecting in the background. The handle is usable for requests
    /// once `Connected` has been observed on the notification channel.
    async fn open(&self) -> Result<(ConnectionHandle, mpsc::Receiver<NodeNotification>), NodeError>;
}
