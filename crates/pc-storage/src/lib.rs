use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use pc_api_types::{ContractRef, GenesisHash, InjectedAccount};
use rocksdb::{DB, Direction, IteratorMode, Options};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// A locally held account. The secret key is stored encrypted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccountRecord {
    pub address: String,
    pub name: String,
    pub encrypted_key: Vec<u8>,
    pub created_at_epoch_ms: u128,
}

/// Persistence for accounts and saved contracts, partitioned by genesis hash.
#[async_trait]
pub trait Keystore: Send + Sync {
    async fn save_account(&self, genesis: &GenesisHash, record: &AccountRecord) -> Result<()>;
    async fn load_accounts(&self, genesis: &GenesisHash) -> Result<Vec<AccountRecord>>;
    async fn save_contract(&self, genesis: &GenesisHash, record: &ContractRef) -> Result<()>;
    async fn remove_contract(&self, genesis: &GenesisHash, address: &str) -> Result<()>;
    async fn load_contracts(&self, genesis: &GenesisHash) -> Result<Vec<ContractRef>>;
}

#[derive(Default)]
pub struct InMemoryKeystore {
    accounts: RwLock<HashMap<(GenesisHash, String), AccountRecord>>,
    contracts: RwLock<HashMap<(GenesisHash, String), ContractRef>>,
}

#[async_trait]
impl Keystore for InMemoryKeystore {
    async fn save_account(&self, genesis: &GenesisHash, record: &AccountRecord) -> Result<()> {
        let mut guard = self.accounts.write().await;
        guard.insert((genesis.clone(), record.address.clone()), record.clone());
        Ok(())
    }

    async fn load_accounts(&self, genesis: &GenesisHash) -> Result<Vec<AccountRecord>> {
        let guard = self.accounts.read().await;
        Ok(guard
            .iter()
            .filter(|((owner, _), _)| owner == genesis)
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn save_contract(&self, genesis: &GenesisHash, record: &ContractRef) -> Result<()> {
        let mut guard = self.contracts.write().await;
        guard.insert((genesis.clone(), record.address.clone()), record.clone());
        Ok(())
    }

    async fn remove_contract(&self, genesis: &GenesisHash, address: &str) -> Result<()> {
        let mut guard = self.contracts.write().await;
        guard.remove(&(genesis.clone(), address.to_owned()));
        Ok(())
    }

    async fn load_contracts(&self, genesis: &GenesisHash) -> Result<Vec<ContractRef>> {
        let guard = self.contracts.read().await;
        Ok(guard
            .iter()
            .filter(|((owner, _), _)| owner == genesis)
            .map(|(_, record)| record.clone())
            .collect())
    }
}

pub struct RocksDbKeystore {
    db: Arc<DB>,
}

impl RocksDbKeystore {
    pub fn open_default(path: &str) -> Result<Self> {
        let mut options = Options::default();
        options.create_if_missing(true);
        let db = DB::open(&options, path).with_context(|| format!("failed to open keystore at {path}"))?;
        Ok(Self { db: Arc::new(db) })
    }

    fn account_prefix(genesis: &GenesisHash) -> String {
        format!("account:{}:", genesis.0)
    }

    fn contract_prefix(genesis: &GenesisHash) -> String {
        format!("contract:{}:", genesis.0)
    }

    fn scan<T: for<'de> Deserialize<'de>>(&self, prefix: &str) -> Result<Vec<T>> {
        let mut records = Vec::new();
        let mode = IteratorMode::From(prefix.as_bytes(), Direction::Forward);

        for item in self.db.iterator(mode) {
            let (key, value) = item?;
            if !key.as_ref().starts_with(prefix.as_bytes()) {
                break;
            }
            records.push(serde_json::from_slice::<T>(&value)?);
        }

        Ok(records)
    }
}

#[async_trait]
impl Keystore for RocksDbKeystore {
    async fn save_account(&self, genesis: &GenesisHash, record: &AccountRecord) -> Result<()> {
        let key = format!("{}{}", Self::account_prefix(genesis), record.address);
        self.db.put(key.as_bytes(), serde_json::to_vec(record)?)?;
        Ok(())
    }

    async fn load_accounts(&self, genesis: &GenesisHash) -> Result<Vec<AccountRecord>> {
        self.scan(&Self::account_prefix(genesis))
    }

    async fn save_contract(&self, genesis: &GenesisHash, record: &ContractRef) -> Result<()> {
        let key = format!("{}{}", Self::contract_prefix(genesis), record.address);
        self.db.put(key.as_bytes(), serde_json::to_vec(record)?)?;
        Ok(())
    }

    async fn remove_contract(&self, genesis: &GenesisHash, address: &str) -> Result<()> {
        let key = format!("{}{}", Self::contract_prefix(genesis), address);
        self.db.delete(key.as_bytes())?;
        Ok(())
    }

    async fn load_contracts(&self, genesis: &GenesisHash) -> Result<Vec<ContractRef>> {
        self.scan(&Self::contract_prefix(genesis))
    }
}

/// An account as seen by the rest of the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyringAccount {
    pub address: String,
    pub name: String,
    pub source: Option<String>,
    pub is_injected: bool,
    pub encrypted_key: Option<Vec<u8>>,
}

#[derive(Default)]
struct KeyringState {
    genesis: Option<GenesisHash>,
    accounts: BTreeMap<String, KeyringAccount>,
    contracts: BTreeMap<String, ContractRef>,
}

/// In-memory account and contract registry for the chain the node reports,
/// backed by a [`Keystore`]. Empty until [`Keyring::load_all`] runs.
pub struct Keyring {
    store: Arc<dyn Keystore>,
    state: RwLock<KeyringState>,
}

impl Keyring {
    pub fn new(store: Arc<dyn Keystore>) -> Self {
        Self {
            store,
            state: RwLock::new(KeyringState::default()),
        }
    }

    /// Replaces the in-memory view with the persisted entries for `genesis`
    /// plus the extension's accounts.
    pub async fn load_all(&self, genesis: &GenesisHash, injected: Vec<InjectedAccount>) -> Result<()> {
        let local = self
            .store
            .load_accounts(genesis)
            .await
            .context("failed to load local accounts")?;
        let contracts = self
            .store
            .load_contracts(genesis)
            .await
            .context("failed to load saved contracts")?;

        let mut next = KeyringState {
            genesis: Some(genesis.clone()),
            ..KeyringState::default()
        };

        for record in local {
            next.accounts.insert(
                record.address.clone(),
                KeyringAccount {
                    address: record.address,
                    name: record.name,
                    source: None,
                    is_injected: false,
                    encrypted_key: Some(record.encrypted_key),
                },
            );
        }

        for account in injected {
            let name = format!("{} ({})", account.name, account.source);
            next.accounts.insert(
                account.address.clone(),
                KeyringAccount {
                    address: account.address,
                    name,
                    source: Some(account.source),
                    is_injected: true,
                    encrypted_key: None,
                },
            );
        }

        for contract in contracts {
            next.contracts.insert(contract.address.clone(), contract);
        }

        info!(
            genesis = %genesis.0,
            accounts = next.accounts.len(),
            contracts = next.contracts.len(),
            "keyring loaded"
        );

        *self.state.write().await = next;
        Ok(())
    }

    pub async fn genesis(&self) -> Option<GenesisHash> {
        self.state.read().await.genesis.clone()
    }

    pub async fn accounts(&self) -> Vec<KeyringAccount> {
        self.state.read().await.accounts.values().cloned().collect()
    }

    pub async fn get_pair(&self, address: &str) -> Option<KeyringAccount> {
        self.state.read().await.accounts.get(address).cloned()
    }

    pub async fn get_contract(&self, address: &str) -> Option<ContractRef> {
        self.state.read().await.contracts.get(address).cloned()
    }

    pub async fn add_local_account(&self, record: AccountRecord) -> Result<KeyringAccount> {
        let genesis = self.require_genesis().await?;
        self.store.save_account(&genesis, &record).await?;

        let account = KeyringAccount {
            address: record.address.clone(),
            name: record.name,
            source: None,
            is_injected: false,
            encrypted_key: Some(record.encrypted_key),
        };
        self.state
            .write()
            .await
            .accounts
            .insert(record.address, account.clone());
        Ok(account)
    }

    pub async fn save_contract(
        &self,
        address: &str,
        abi: Option<serde_json::Value>,
        name: &str,
    ) -> Result<ContractRef> {
        if address.trim().is_empty() {
            return Err(anyhow!("contract address is required"));
        }

        let genesis = self.require_genesis().await?;
        let record = ContractRef {
            address: address.to_owned(),
            name: name.to_owned(),
            abi,
            genesis_hash: Some(genesis.0.clone()),
        };

        self.store.save_contract(&genesis, &record).await?;
        self.state
            .write()
            .await
            .contracts
            .insert(record.address.clone(), record.clone());
        debug!(address, "contract saved to keyring");
        Ok(record)
    }

    pub async fn forget_contract(&self, address: &str) -> Result<()> {
        let genesis = self.require_genesis().await?;
        self.store.remove_contract(&genesis, address).await?;
        self.state.write().await.contracts.remove(address);
        debug!(address, "contract removed from keyring");
        Ok(())
    }

    async fn require_genesis(&self) -> Result<GenesisHash> {
        self.genesis()
            .await
            .ok_or_else(|| anyhow!("keyring is not loaded for any chain yet"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn genesis(tag: &str) -> GenesisHash {
        GenesisHash(format!("0x{tag}"))
    }

    fn points_abi() -> serde_json::Value {
        serde_json::json!({ "spec": { "messages": [] } })
    }

    #[tokio::test]
    async fn injected_accounts_are_labelled_with_source() -> Result<()> {
        let keyring = Keyring::new(Arc::new(InMemoryKeystore::default()));
        keyring
            .load_all(
                &genesis("aa"),
                vec![InjectedAccount {
                    address: "5GrwvaEF".to_owned(),
                    name: "alice".to_owned(),
                    source: "polkadot-js".to_owned(),
                }],
            )
            .await?;

        let account = keyring.get_pair("5GrwvaEF").await.expect("account loaded");
        assert_eq!(account.name, "alice (polkadot-js)");
        assert!(account.is_injected);
        assert_eq!(account.source.as_deref(), Some("polkadot-js"));
        Ok(())
    }

    #[tokio::test]
    async fn contracts_are_scoped_to_genesis() -> Result<()> {
        let store: Arc<dyn Keystore> = Arc::new(InMemoryKeystore::default());
        let keyring = Keyring::new(store.clone());

        keyring.load_all(&genesis("aa"), Vec::new()).await?;
        keyring.save_contract("5FyEUC", Some(points_abi()), "points").await?;
        assert!(keyring.get_contract("5FyEUC").await.is_some());

        keyring.load_all(&genesis("bb"), Vec::new()).await?;
        assert!(keyring.get_contract("5FyEUC").await.is_none());

        keyring.load_all(&genesis("aa"), Vec::new()).await?;
        let contract = keyring.get_contract("5FyEUC").await.expect("contract persisted");
        assert_eq!(contract.name, "points");
        assert_eq!(contract.genesis_hash.as_deref(), Some("0xaa"));
        Ok(())
    }

    #[tokio::test]
    async fn save_requires_loaded_keyring() {
        let keyring = Keyring::new(Arc::new(InMemoryKeystore::default()));
        assert!(keyring.save_contract("5FyEUC", None, "points").await.is_err());
    }

    #[tokio::test]
    async fn forget_removes_contract() -> Result<()> {
        let keyring = Keyring::new(Arc::new(InMemoryKeystore::default()));
        keyring.load_all(&genesis("aa"), Vec::new()).await?;
        keyring.save_contract("5FyEUC", Some(points_abi()), "points").await?;
        keyring.forget_contract("5FyEUC").await?;

        assert!(keyring.get_contract("5FyEUC").await.is_none());
        keyring.load_all(&genesis("aa"), Vec::new()).await?;
        assert!(keyring.get_contract("5FyEUC").await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn rocksdb_keystore_survives_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("keystore");
        let path = path.to_str().expect("utf-8 temp path");

        {
            let store = RocksDbKeystore::open_default(path)?;
            store
                .save_account(
                    &genesis("aa"),
                    &AccountRecord {
                        address: "0x01".to_owned(),
                        name: "store".to_owned(),
                        encrypted_key: vec![7; 32],
                        created_at_epoch_ms: 1_700_000_000_000,
                    },
                )
                .await?;
            store
                .save_contract(
                    &genesis("aa"),
                    &ContractRef {
                        address: "5FyEUC".to_owned(),
                        name: "points".to_owned(),
                        abi: Some(points_abi()),
                        genesis_hash: Some("0xaa".to_owned()),
                    },
                )
                .await?;
            store
                .save_contract(
                    &genesis("bb"),
                    &ContractRef {
                        address: "5Other".to_owned(),
                        name: "other".to_owned(),
                        abi: None,
                        genesis_hash: Some("0xbb".to_owned()),
                    },
                )
                .await?;
        }

        let store = RocksDbKeystore::open_default(path)?;
        let accounts = store.load_accounts(&genesis("aa")).await?;
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].name, "store");

        let contracts = store.load_contracts(&genesis("aa")).await?;
        assert_eq!(contracts.len(), 1);
        assert_eq!(contracts[0].address, "5FyEUC");

        store.remove_contract(&genesis("aa"), "5FyEUC").await?;
        assert!(store.load_contracts(&genesis("aa")).await?.is_empty());
        assert_eq!(store.load_contracts(&genesis("bb")).await?.len(), 1);
        Ok(())
    }
}
