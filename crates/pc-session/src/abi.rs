use pc_api_types::ContractRef;
use pc_crypto::to_hex;
use pc_node_client::ConnectionHandle;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

const VERSION_KEYS: [&str; 5] = ["V5", "V4", "V3", "V2", "V1"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AbiError {
    #[error("ABI document has no contract spec")]
    MissingSpec,
    #[error("ABI spec has no message list")]
    MissingMessages,
    #[error("ABI message #{0} has no name")]
    UnnamedMessage(usize),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AbiParam {
    pub name: String,
    pub type_name: String,
}

/// Metadata for one contract message. The default value is the "not found"
/// result of [`lookup_message`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AbiMessage {
    /// Name as declared in the contract, e.g. `use_user_points`.
    pub identifier: String,
    /// camelCase form, e.g. `useUserPoints`.
    pub method: String,
    pub params: Vec<AbiParam>,
    pub is_mutating: bool,
    pub is_payable: bool,
    pub docs: Vec<String>,
    pub selector: Option<String>,
    pub return_type: Option<String>,
}

impl AbiMessage {
    pub fn is_empty(&self) -> bool {
        self.identifier.is_empty()
    }

    fn answers_to(&self, name: &str) -> bool {
        self.identifier == name || self.method == name
    }
}

/// A parsed ink! metadata document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbiDocument {
    identity: String,
    messages: Vec<AbiMessage>,
}

impl AbiDocument {
    pub fn parse(document: &Value) -> Result<Self, AbiError> {
        let spec = find_spec(document).ok_or(AbiError::MissingSpec)?;
        let messages = spec
            .get("messages")
            .and_then(Value::as_array)
            .ok_or(AbiError::MissingMessages)?
            .iter()
            .enumerate()
            .map(|(index, message)| parse_message(index, message))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            identity: abi_identity(document),
            messages,
        })
    }

    /// Hex SHA-256 of the document's canonical JSON.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn messages(&self) -> &[AbiMessage] {
        &self.messages
    }

    pub fn find_message(&self, name: &str) -> Option<&AbiMessage> {
        self.messages.iter().find(|message| message.answers_to(name))
    }
}

pub fn abi_identity(document: &Value) -> String {
    to_hex(&Sha256::digest(document.to_string().as_bytes()))
}

fn find_spec(document: &Value) -> Option<&Value> {
    if let Some(spec) = document.get("spec") {
        return Some(spec);
    }
    VERSION_KEYS
        .iter()
        .find_map(|key| document.get(*key).and_then(|inner| inner.get("spec")))
}

fn parse_message(index: usize, message: &Value) -> Result<AbiMessage, AbiError> {
    let identifier = message
        .get("label")
        .or_else(|| message.get("name"))
        .and_then(label_text)
        .filter(|label| !label.is_empty())
        .ok_or(AbiError::UnnamedMessage(index))?;

    let params = message
        .get("args")
        .and_then(Value::as_array)
        .map(|args| {
            args.iter()
                .map(|arg| AbiParam {
                    name: arg
                        .get("label")
                        .or_else(|| arg.get("name"))
                        .and_then(label_text)
                        .unwrap_or_default(),
                    type_name: arg.get("type").map(type_text).unwrap_or_default(),
                })
                .collect()
        })
        .unwrap_or_default();

    let docs = message
        .get("docs")
        .and_then(Value::as_array)
        .map(|lines| {
            lines
                .iter()
                .filter_map(Value::as_str)
                .map(|line| line.trim().to_owned())
                .filter(|line| !line.is_empty())
                .collect()
        })
        .unwrap_or_default();

    Ok(AbiMessage {
        method: camel_case(&identifier),
        identifier,
        params,
        is_mutating: message.get("mutates").and_then(Value::as_bool).unwrap_or(false),
        is_payable: message.get("payable").and_then(Value::as_bool).unwrap_or(false),
        docs,
        selector: message.get("selector").and_then(Value::as_str).map(str::to_owned),
        return_type: message
            .get("returnType")
            .filter(|value| !value.is_null())
            .map(type_text),
    })
}

/// Labels are a string in newer metadata and a path array in older ones.
fn label_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Array(parts) => Some(
            parts
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join("::"),
        ),
        _ => None,
    }
}

fn type_text(value: &Value) -> String {
    if let Some(display) = value.get("displayName").and_then(label_text) {
        if !display.is_empty() {
            return display;
        }
    }
    match value.get("type") {
        Some(Value::Number(id)) => format!("#{id}"),
        Some(other) => other.to_string(),
        None => value.to_string(),
    }
}

fn camel_case(identifier: &str) -> String {
    let mut output = String::with_capacity(identifier.len());
    let mut upper_next = false;
    for ch in identifier.chars() {
        if ch == '_' {
            upper_next = !output.is_empty();
        } else if upper_next {
            output.extend(ch.to_uppercase());
            upper_next = false;
        } else {
            output.push(ch);
        }
    }
    output
}

/// A contract address bound to its ABI and a live connection.
#[derive(Debug, Clone)]
pub struct ContractHandle {
    connection: ConnectionHandle,
    address: String,
    name: String,
    abi: Arc<AbiDocument>,
}

impl ContractHandle {
    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn abi(&self) -> &AbiDocument {
        &self.abi
    }
}

/// `None` when there is no contract, no cached ABI, or the ABI does not parse.
pub fn resolve_contract(
    connection: &ConnectionHandle,
    contract: Option<&ContractRef>,
) -> Option<ContractHandle> {
    let contract = contract?;
    let document = contract.abi.as_ref()?;

    match AbiDocument::parse(document) {
        Ok(abi) => Some(ContractHandle {
            connection: connection.clone(),
            address: contract.address.clone(),
            name: contract.name.clone(),
            abi: Arc::new(abi),
        }),
        Err(err) => {
            warn!(address = %contract.address, "ignoring malformed contract ABI: {}", err);
            None
        }
    }
}

/// Never fails; unknown contracts and methods yield empty metadata.
pub fn lookup_message(contract: Option<&ContractHandle>, name: &str) -> AbiMessage {
    let Some(contract) = contract else {
        return AbiMessage::default();
    };

    match contract.abi.find_message(name) {
        Some(message) => message.clone(),
        None => {
            debug!(address = %contract.address, method = name, "message not in contract ABI");
            AbiMessage::default()
        }
    }
}

type HandleKey = (Uuid, String, String);

/// Memoizes [`resolve_contract`] by connection, address and ABI identity.
/// Entries for other connections are evicted when a new one shows up.
#[derive(Default)]
pub struct ContractHandleCache {
    entries: Mutex<HashMap<HandleKey, ContractHandle>>,
}

impl ContractHandleCache {
    pub fn resolve(
        &self,
        connection: &ConnectionHandle,
        contract: Option<&ContractRef>,
    ) -> Option<ContractHandle> {
        let contract = contract?;
        let document = contract.abi.as_ref()?;
        let key = (connection.id(), contract.address.clone(), abi_identity(document));

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = entries.get(&key) {
            return Some(handle.clone());
        }

        let handle = resolve_contract(connection, Some(contract))?;
        entries.retain(|(connection_id, _, _), _| *connection_id == key.0);
        entries.insert(key, handle.clone());
        Some(handle)
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockNode, points_abi, points_contract};
    use serde_json::json;

    #[test]
    fn parses_versioned_metadata() -> Result<(), AbiError> {
        let abi = AbiDocument::parse(&points_abi())?;
        let message = abi.find_message("use_user_points").cloned().unwrap_or_default();

        assert_eq!(message.method, "useUserPoints");
        assert!(message.is_mutating);
        assert_eq!(
            message.params,
            vec![
                AbiParam { name: "store".to_owned(), type_name: "AccountId".to_owned() },
                AbiParam { name: "user".to_owned(), type_name: "AccountId".to_owned() },
                AbiParam { name: "value".to_owned(), type_name: "Balance".to_owned() },
            ]
        );
        assert_eq!(message.docs, vec!["Use points granted by a store.".to_owned()]);
        Ok(())
    }

    #[test]
    fn accepts_legacy_name_arrays() -> Result<(), AbiError> {
        let abi = AbiDocument::parse(&json!({
            "spec": {
                "messages": [{
                    "name": ["get_owner_points"],
                    "args": [],
                    "mutates": false,
                    "returnType": { "displayName": ["Balance"], "type": 1 },
                    "docs": []
                }]
            }
        }))?;

        let message = abi.find_message("getOwnerPoints").cloned().unwrap_or_default();
        assert_eq!(message.identifier, "get_owner_points");
        assert_eq!(message.return_type.as_deref(), Some("Balance"));
        Ok(())
    }

    #[test]
    fn rejects_documents_without_spec() {
        assert_eq!(AbiDocument::parse(&json!({ "source": {} })), Err(AbiError::MissingSpec));
        assert_eq!(
            AbiDocument::parse(&json!({ "spec": { "messages": [{ "args": [] }] } })),
            Err(AbiError::UnnamedMessage(0))
        );
    }

    #[test]
    fn camel_case_conversion() {
        assert_eq!(camel_case("give_user_points"), "giveUserPoints");
        assert_eq!(camel_case("is_authority"), "isAuthority");
        assert_eq!(camel_case("flip"), "flip");
        assert_eq!(camel_case("_private_call"), "privateCall");
    }

    #[test]
    fn missing_contract_resolves_to_none() {
        let node = MockNode::shared();
        let connection = node.handle();

        assert!(resolve_contract(&connection, None).is_none());

        let mut without_abi = points_contract();
        without_abi.abi = None;
        assert!(resolve_contract(&connection, Some(&without_abi)).is_none());

        let mut malformed = points_contract();
        malformed.abi = Some(json!({ "not": "an abi" }));
        assert!(resolve_contract(&connection, Some(&malformed)).is_none());
    }

    #[test]
    fn lookup_fails_soft() {
        let node = MockNode::shared();
        let handle = resolve_contract(&node.handle(), Some(&points_contract()));

        assert!(lookup_message(handle.as_ref(), "does_not_exist").is_empty());
        assert!(lookup_message(None, "use_user_points").is_empty());
        assert_eq!(
            lookup_message(handle.as_ref(), "isAuthority").identifier,
            "is_authority"
        );
    }

    #[tokio::test]
    async fn saved_contract_resolves_until_forgotten() -> anyhow::Result<()> {
        use crate::testing::{GENESIS, POINTS_ADDRESS};
        use pc_api_types::GenesisHash;
        use pc_storage::{InMemoryKeystore, Keyring};

        let keyring = Keyring::new(Arc::new(InMemoryKeystore::default()));
        keyring.load_all(&GenesisHash(GENESIS.to_owned()), Vec::new()).await?;
        let connection = MockNode::shared().handle();

        keyring.save_contract(POINTS_ADDRESS, Some(points_abi()), "points").await?;
        let saved = keyring.get_contract(POINTS_ADDRESS).await;
        let handle = resolve_contract(&connection, saved.as_ref());
        assert_eq!(handle.as_ref().map(ContractHandle::address), Some(POINTS_ADDRESS));
        assert_eq!(
            handle.as_ref().map(|handle| handle.abi().identity().to_owned()),
            Some(abi_identity(&points_abi()))
        );

        keyring.forget_contract(POINTS_ADDRESS).await?;
        let forgotten = keyring.get_contract(POINTS_ADDRESS).await;
        assert!(resolve_contract(&connection, forgotten.as_ref()).is_none());
        Ok(())
    }

    #[test]
    fn cache_keys_on_abi_identity() {
        let node = MockNode::shared();
        let connection = node.handle();
        let cache = ContractHandleCache::default();
        let contract = points_contract();

        let first = cache.resolve(&connection, Some(&contract));
        let second = cache.resolve(&connection, Some(&contract));
        assert!(first.is_some() && second.is_some());
        assert_eq!(cache.len(), 1);

        let mut changed = contract.clone();
        if let Some(Value::Object(map)) = changed.abi.as_mut() {
            map.insert("revision".to_owned(), json!(2));
        }
        assert!(cache.resolve(&connection, Some(&changed)).is_some());
        assert_eq!(cache.len(), 2);

        let other = MockNode::shared();
        assert!(cache.resolve(&other.handle(), Some(&contract)).is_some());
        assert_eq!(cache.len(), 1);
    }
}
