use crate::session::{Action, SessionStore};
use anyhow::{Context, Result};
use pc_extension::InjectedExtension;
use pc_node_client::{ConnectionHandle, NodeConnector, NodeNotification};
use pc_storage::Keyring;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// How often account loading is attempted per `Ready` period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// One attempt; a failure leaves the keystore unloaded without reporting it.
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }

    pub fn bounded(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::single_attempt()
        }
    }

    pub fn retries_enabled(&self) -> bool {
        self.max_attempts > 1
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1_u32 << exponent)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::single_attempt()
    }
}

#[derive(Debug, Clone)]
pub struct BringUpConfig {
    /// Name the extension is asked to authorize.
    pub app_name: String,
    pub default_contract_address: String,
    pub retry: RetryPolicy,
}

#[derive(Clone)]
pub struct BringUp {
    store: Arc<SessionStore>,
    keyring: Arc<Keyring>,
    extension: Arc<dyn InjectedExtension>,
    config: BringUpConfig,
}

impl BringUp {
    pub fn new(
        store: Arc<SessionStore>,
        keyring: Arc<Keyring>,
        extension: Arc<dyn InjectedExtension>,
        config: BringUpConfig,
    ) -> Self {
        Self {
            store,
            keyring,
            extension,
            config,
        }
    }

    /// Opens the connection and follows it until its notification stream ends.
    pub async fn run(self, connector: Arc<dyn NodeConnector>) -> Result<()> {
        self.store.dispatch(Action::ConnectRequested);

        let (connection, mut notifications) = match connector.open().await {
            Ok(opened) => opened,
            Err(err) => {
                error!("failed to open node connection: {}", err);
                self.store.dispatch(Action::ConnectionFailed(err.to_string()));
                return Err(err).context("failed to open node connection");
            }
        };

        let mut loading: Option<JoinHandle<()>> = None;

        while let Some(notification) = notifications.recv().await {
            match notification {
                NodeNotification::Connected => {
                    self.store.dispatch(Action::ConnectionOpened(connection.clone()));
                }
                NodeNotification::Ready => {
                    self.store.dispatch(Action::ConnectionEstablished);
                    if let Some(previous) = loading.take() {
                        previous.abort();
                    }
                    loading = Some(tokio::spawn(self.clone().load_with_retry(connection.clone())));
                }
                NodeNotification::Disconnected => {
                    if let Some(previous) = loading.take() {
                        previous.abort();
                    }
                    self.store.dispatch(Action::ConnectionClosed);
                }
                NodeNotification::Error(message) => {
                    if let Some(previous) = loading.take() {
                        previous.abort();
                    }
                    error!("node connection error: {}", message);
                    self.store.dispatch(Action::ConnectionFailed(message));
                }
            }
        }

        info!("node notification stream closed");
        Ok(())
    }

    async fn load_with_retry(self, connection: ConnectionHandle) {
        let policy = self.config.retry.clone();
        let mut attempt = 1;

        loop {
            let err = match self.load_accounts(&connection).await {
                Ok(()) => return,
                Err(err) => err,
            };
            error!(attempt, "loading accounts failed: {:#}", err);

            if attempt >= policy.max_attempts {
                if policy.retries_enabled() {
                    self.store.dispatch(Action::KeystoreFailed(format!("{err:#}")));
                }
                return;
            }

            let delay = policy.delay_for(attempt);
            warn!(attempt, ?delay, "retrying account load");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Chain metadata, extension accounts, keyring and default contract.
    /// Session actions are only dispatched after every step succeeded.
    pub async fn load_accounts(&self, connection: &ConnectionHandle) -> Result<()> {
        let chain_info = connection
            .chain_info()
            .await
            .context("failed to fetch chain metadata")?;
        info!(
            chain = %chain_info.chain_name,
            node = %chain_info.node_name,
            version = %chain_info.node_version,
            "connected to chain"
        );

        let genesis = connection
            .genesis_hash()
            .await
            .context("failed to fetch genesis hash")?;

        let authorized = self
            .extension
            .enable(&self.config.app_name)
            .await
            .context("failed to enable wallet extension")?;
        let injected = if authorized.is_empty() {
            warn!("no wallet extension authorized {}", self.config.app_name);
            Vec::new()
        } else {
            self.extension
                .accounts()
                .await
                .context("failed to enumerate extension accounts")?
        };

        self.keyring.load_all(&genesis, injected).await?;

        let contract = self
            .keyring
            .get_contract(&self.config.default_contract_address)
            .await;
        if contract.is_none() {
            warn!(
                address = %self.config.default_contract_address,
                "default contract is not saved for this chain"
            );
        }

        self.store.dispatch(Action::ChainInfoFetched(chain_info));
        self.store.dispatch(Action::ContractResolved(contract));
        self.store.dispatch(Action::KeystoreReady);
        Ok(())
    }
}
