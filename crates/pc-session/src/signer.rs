use anyhow::{Context, Result, anyhow, bail};
use pc_crypto::{Ed25519Signer, decrypt_key_material, encrypt_key_material};
use pc_extension::InjectedExtension;
use pc_node_client::{ConnectionHandle, SigningCapability};
use pc_storage::{AccountRecord, Keyring, KeyringAccount};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// Turns a caller address into something that can sign for it.
pub struct SignerResolver {
    keyring: Arc<Keyring>,
    extension: Arc<dyn InjectedExtension>,
    encryption_key: String,
}

impl SignerResolver {
    pub fn new(
        keyring: Arc<Keyring>,
        extension: Arc<dyn InjectedExtension>,
        encryption_key: impl Into<String>,
    ) -> Self {
        Self {
            keyring,
            extension,
            encryption_key: encryption_key.into(),
        }
    }

    /// Injected accounts attach the extension's signer to `connection` and
    /// sign by address; local accounts decrypt their stored key.
    pub async fn resolve(&self, connection: &ConnectionHandle, address: &str) -> Result<SigningCapability> {
        let account = self
            .keyring
            .get_pair(address)
            .await
            .ok_or_else(|| anyhow!("unknown account {address}"))?;

        if account.is_injected {
            let source = account
                .source
                .as_deref()
                .ok_or_else(|| anyhow!("injected account {address} has no source"))?;
            let signer = self
                .extension
                .signer(source)
                .ok_or_else(|| anyhow!("extension {source} provides no signer"))?;

            debug!(address, source, "delegating signature to extension");
            connection.set_signer(signer);
            return Ok(SigningCapability::Delegated {
                address: account.address,
            });
        }

        let encrypted = account
            .encrypted_key
            .as_deref()
            .ok_or_else(|| anyhow!("account {address} has no key material"))?;
        let secret = decrypt_key_material(encrypted, &self.encryption_key)
            .context("failed to decrypt account key")?;
        let signer = Ed25519Signer::from_secret_key_bytes(&secret);

        if signer.address() != account.address {
            bail!("stored key does not match account {address}");
        }

        Ok(SigningCapability::Local(Arc::new(signer)))
    }

    /// Generates a fresh key and persists it, encrypted, under the keyring's chain.
    pub async fn create_local_account(&self, name: &str) -> Result<KeyringAccount> {
        let signer = Ed25519Signer::new_random();
        let encrypted_key = encrypt_key_material(&signer.secret_key_bytes(), &self.encryption_key)?;
        let created_at_epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("system clock is before unix epoch")?
            .as_millis();

        let account = self
            .keyring
            .add_local_account(AccountRecord {
                address: signer.address(),
                name: name.to_owned(),
                encrypted_key,
                created_at_epoch_ms,
            })
            .await?;

        info!(address = %account.address, "local account created");
        Ok(account)
    }
}
