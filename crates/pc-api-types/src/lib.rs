use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SignPurpose {
    Transaction,
    Message,
}

/// Identifies the chain a keystore entry belongs to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct GenesisHash(pub String);

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainInfo {
    pub chain_name: String,
    pub node_name: String,
    pub node_version: String,
}

/// A saved contract entry: address, display name and the cached ABI document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContractRef {
    pub address: String,
    pub name: String,
    #[serde(default)]
    pub abi: Option<serde_json::Value>,
    #[serde(default)]
    pub genesis_hash: Option<String>,
}

/// An account exposed by a wallet extension; its key never enters this process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InjectedAccount {
    pub address: String,
    #[serde(default)]
    pub name: String,
    pub source: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Ready,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KeystoreStatus {
    NotLoaded,
    Loaded,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    Ok,
    Err,
    Pending,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallResult {
    pub outcome: CallOutcome,
    pub payload: String,
}

impl CallResult {
    pub fn ok(payload: impl Into<String>) -> Self {
        Self {
            outcome: CallOutcome::Ok,
            payload: payload.into(),
        }
    }

    pub fn err(payload: impl Into<String>) -> Self {
        Self {
            outcome: CallOutcome::Err,
            payload: payload.into(),
        }
    }

    pub fn pending(payload: impl Into<String>) -> Self {
        Self {
            outcome: CallOutcome::Pending,
            payload: payload.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome != CallOutcome::Pending
    }
}

// ── HTTP surface ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResponse {
    pub version: u64,
    pub connection_status: ConnectionStatus,
    pub keystore_status: KeystoreStatus,
    pub chain_info: Option<ChainInfo>,
    pub selected_contract: Option<ContractSummary>,
    pub has_contract: bool,
    pub caller: String,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractSummary {
    pub address: String,
    pub name: String,
    pub has_abi: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectCallerRequest {
    pub caller: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractSaveRequest {
    pub address: String,
    #[serde(default)]
    pub name: String,
    pub abi: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractForgetRequest {
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractStatusResponse {
    pub status: String,
    pub contract: Option<ContractSummary>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AbiParamResponse {
    pub name: String,
    pub type_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AbiMessageResponse {
    pub identifier: String,
    pub method: String,
    pub params: Vec<AbiParamResponse>,
    pub is_mutating: bool,
    pub is_payable: bool,
    pub docs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractCallRequest {
    pub method: String,
    #[serde(default)]
    pub is_transaction: bool,
    #[serde(default)]
    pub params: Vec<serde_json::Value>,
    /// Overrides the session caller when present.
    #[serde(default)]
    pub caller: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractCallResponse {
    pub result: CallResult,
    pub history: Vec<CallResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedCallResponse {
    pub call_id: Uuid,
    pub method: String,
    pub latest: CallResult,
    pub history: Vec<CallResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountCreateRequest {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountResponse {
    pub address: String,
    pub name: String,
    pub source: Option<String>,
    pub is_injected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEntryResponse {
    pub icon: String,
    pub summary: String,
    pub extra_text: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFeedResponse {
    pub events: Vec<EventEntryResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfigResponse {
    pub app_name: String,
    pub ws_url: String,
    pub default_contract_address: String,
    pub custom_types: std::collections::BTreeMap<String, String>,
    pub extension_enabled: bool,
    pub persistent_keystore: bool,
}
