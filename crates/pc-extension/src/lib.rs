use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use pc_api_types::{InjectedAccount, SignPurpose};
use pc_crypto::{ExternalSigner, from_hex};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// A wallet extension holding accounts whose keys never enter this process.
#[async_trait]
pub trait InjectedExtension: Send + Sync {
    /// Asks the extension to authorize `app_name`. Returns the names of the
    /// extensions that granted access; empty means nothing was authorized.
    async fn enable(&self, app_name: &str) -> Result<Vec<String>>;
    async fn accounts(&self) -> Result<Vec<InjectedAccount>>;
    /// Signer for accounts injected by `source`.
    fn signer(&self, source: &str) -> Option<Arc<dyn ExternalSigner>>;
}

/// Used when no extension bridge is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoExtension;

#[async_trait]
impl InjectedExtension for NoExtension {
    async fn enable(&self, _app_name: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn accounts(&self) -> Result<Vec<InjectedAccount>> {
        Ok(Vec::new())
    }

    fn signer(&self, _source: &str) -> Option<Arc<dyn ExternalSigner>> {
        None
    }
}

/// HTTP bridge to a signing extension.
///
/// Reads `POINTS_EXTENSION_URL` from environment when no endpoint is given.
pub struct RemoteSignerExtension {
    endpoint: String,
    http: reqwest::Client,
}

impl RemoteSignerExtension {
    pub fn new(endpoint: Option<String>) -> Option<Self> {
        let endpoint = endpoint
            .or_else(|| std::env::var("POINTS_EXTENSION_URL").ok())
            .filter(|value| !value.trim().is_empty())?;
        Some(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

// ── extension bridge API types ───────────────────────────────────────

#[derive(Debug, Serialize)]
struct EnableRequest<'a> {
    origin: &'a str,
}

#[derive(Debug, Deserialize)]
struct EnableResponse {
    #[serde(default)]
    extensions: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct AccountsResponse {
    #[serde(default)]
    accounts: Vec<InjectedAccount>,
}

#[derive(Debug, Serialize)]
struct SignRequest<'a> {
    address: &'a str,
    source: &'a str,
    payload: String,
    purpose: SignPurpose,
}

#[derive(Debug, Deserialize)]
struct SignResponse {
    signature: String,
}

#[async_trait]
impl InjectedExtension for RemoteSignerExtension {
    async fn enable(&self, app_name: &str) -> Result<Vec<String>> {
        let url = format!("{}/enable", self.endpoint);
        let response = self
            .http
            .post(&url)
            .json(&EnableRequest { origin: app_name })
            .send()
            .await
            .context("extension enable transport")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("extension enable HTTP {status}: {text}");
        }

        let body: EnableResponse = response.json().await.context("extension enable parse")?;
        info!(extensions = body.extensions.len(), "extension authorized {}", app_name);
        Ok(body.extensions)
    }

    async fn accounts(&self) -> Result<Vec<InjectedAccount>> {
        let url = format!("{}/accounts", self.endpoint);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .context("extension accounts transport")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("extension accounts HTTP {status}: {text}");
        }

        let body: AccountsResponse = response.json().await.context("extension accounts parse")?;
        debug!(count = body.accounts.len(), "extension accounts");
        Ok(body.accounts)
    }

    fn signer(&self, source: &str) -> Option<Arc<dyn ExternalSigner>> {
        Some(Arc::new(RemoteSigner {
            endpoint: self.endpoint.clone(),
            source: source.to_owned(),
            http: self.http.clone(),
        }))
    }
}

/// Delegates signatures to the extension bridge.
pub struct RemoteSigner {
    endpoint: String,
    source: String,
    http: reqwest::Client,
}

#[async_trait]
impl ExternalSigner for RemoteSigner {
    fn source(&self) -> &str {
        &self.source
    }

    async fn sign(&self, address: &str, payload: &[u8], purpose: SignPurpose) -> Result<Vec<u8>> {
        let url = format!("{}/sign", self.endpoint);
        let response = self
            .http
            .post(&url)
            .json(&SignRequest {
                address,
                source: &self.source,
                payload: BASE64.encode(payload),
                purpose,
            })
            .send()
            .await
            .context("extension sign transport")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("extension sign HTTP {status}: {text}");
        }

        let body: SignResponse = response.json().await.context("extension sign parse")?;
        from_hex(&body.signature).context("extension returned malformed signature")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn no_extension_authorizes_nothing() -> Result<()> {
        let extension = NoExtension;
        assert!(extension.enable("points-console").await?.is_empty());
        assert!(extension.accounts().await?.is_empty());
        assert!(extension.signer("polkadot-js").is_none());
        Ok(())
    }

    #[test]
    fn blank_endpoint_means_no_bridge() {
        assert!(RemoteSignerExtension::new(Some("  ".to_owned())).is_none());
        let bridge = RemoteSignerExtension::new(Some("http://127.0.0.1:9000/".to_owned()));
        assert_eq!(bridge.map(|b| b.endpoint().to_owned()), Some("http://127.0.0.1:9000".to_owned()));
    }

    #[test]
    fn sign_request_encodes_payload() -> Result<()> {
        let request = SignRequest {
            address: "5Grw",
            source: "polkadot-js",
            payload: BASE64.encode(b"payload"),
            purpose: SignPurpose::Transaction,
        };
        assert_eq!(
            serde_json::to_value(&request)?,
            json!({
                "address": "5Grw",
                "source": "polkadot-js",
                "payload": "cGF5bG9hZA==",
                "purpose": "transaction"
            })
        );
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_bridge_surfaces_transport_error() {
        let Some(bridge) = RemoteSignerExtension::new(Some("http://127.0.0.1:9".to_owned())) else {
            panic!("bridge should be configured");
        };
        let err = bridge.enable("points-console").await.err();
        assert!(err.is_some_and(|err| err.to_string().contains("transport")));
    }

    #[tokio::test]
    async fn malformed_bridge_signature_is_an_error() -> Result<()> {
        let app = axum::Router::new().route(
            "/sign",
            axum::routing::post(|| async { axum::Json(json!({ "signature": "aé0" })) }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let endpoint = format!("http://{}", listener.local_addr()?);
        let server = tokio::spawn(async move { axum::serve(listener, app).await });

        let Some(bridge) = RemoteSignerExtension::new(Some(endpoint)) else {
            panic!("bridge should be configured");
        };
        let Some(signer) = bridge.signer("polkadot-js") else {
            panic!("bridge should hand out a signer");
        };
        let err = signer
            .sign("5Grw", b"payload", SignPurpose::Transaction)
            .await
            .err();
        assert!(err.is_some_and(|err| err.to_string().contains("malformed signature")));

        server.abort();
        Ok(())
    }
}
