mod accounts;
mod calls;
mod config;
mod contract;
mod events;
mod session;

use axum::{
    Json, Router,
    http::StatusCode,
    routing::{get, post},
};
use pc_extension::{InjectedExtension, NoExtension, RemoteSignerExtension};
use pc_node_client::NodeConnector;
use pc_node_ws::{ReconnectPolicy, WsConnector};
use pc_session::{
    BringUp, BringUpConfig, CallOrchestrator, CallStatusCell, ContractHandle, ContractHandleCache,
    EventFeed, RetryPolicy, SessionStore, SignerResolver, spawn_follower,
};
use pc_storage::{InMemoryKeystore, Keyring, Keystore, RocksDbKeystore};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use crate::calls::CallRegistry;
use crate::config::ServiceConfig;

#[derive(Debug, Serialize)]
struct HealthResponse {
    service: &'static str,
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct VersionResponse {
    service: &'static str,
    version: &'static str,
}

#[derive(Debug, Serialize)]
pub(crate) struct ErrorResponse {
    error: String,
}

pub(crate) type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

/// A call started through `POST /calls`, polled by id.
pub(crate) struct TrackedCall {
    pub(crate) method: String,
    pub(crate) status: Arc<CallStatusCell>,
}

impl TrackedCall {
    pub(crate) fn is_settled(&self) -> bool {
        self.status.latest().is_some_and(|result| result.is_terminal())
    }
}

pub(crate) struct AppState {
    pub(crate) config: ServiceConfig,
    pub(crate) store: Arc<SessionStore>,
    pub(crate) keyring: Arc<Keyring>,
    pub(crate) signers: Arc<SignerResolver>,
    pub(crate) orchestrator: Arc<CallOrchestrator>,
    pub(crate) handles: ContractHandleCache,
    pub(crate) events: Arc<EventFeed>,
    pub(crate) calls: RwLock<CallRegistry>,
    pub(crate) extension_enabled: bool,
}

impl AppState {
    pub(crate) fn new(
        config: ServiceConfig,
        keystore: Arc<dyn Keystore>,
        extension: Arc<dyn InjectedExtension>,
        extension_enabled: bool,
    ) -> Self {
        let keyring = Arc::new(Keyring::new(keystore));
        let signers = Arc::new(SignerResolver::new(
            keyring.clone(),
            extension,
            config.key_encryption_key.clone(),
        ));

        Self {
            store: Arc::new(SessionStore::new()),
            orchestrator: Arc::new(CallOrchestrator::new(signers.clone())),
            events: Arc::new(EventFeed::new(config.event_feed_capacity)),
            handles: ContractHandleCache::default(),
            calls: RwLock::new(CallRegistry::new(config.tracked_call_capacity)),
            keyring,
            signers,
            config,
            extension_enabled,
        }
    }

    /// Handle for the session's current connection and selected contract.
    pub(crate) fn contract_handle(&self) -> Option<ContractHandle> {
        let session = self.store.state();
        let connection = session.connection.as_ref()?;
        self.handles.resolve(connection, session.selected_contract.as_ref())
    }
}

pub(crate) fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/version", get(version))
        .route("/chain/config", get(session::chain_config))
        .route("/session", get(session::get_session))
        .route("/session/caller", post(session::select_caller))
        .route("/accounts", get(accounts::list_accounts))
        .route("/accounts/create", post(accounts::create_account))
        .route("/contract/save", post(contract::save_contract))
        .route("/contract/forget", post(contract::forget_contract))
        .route("/contract/messages", get(contract::list_messages))
        .route("/contract/messages/{name}", get(contract::get_message))
        .route("/contract/call", post(contract::call_contract))
        .route("/calls", post(calls::start_call))
        .route("/calls/{id}", get(calls::get_call).delete(calls::drop_call))
        .route("/events", get(events::list_events))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = ServiceConfig::from_env()?;

    let keystore: Arc<dyn Keystore> = match config.keystore_path.as_deref() {
        Some(path) => {
            info!("opening keystore at {}", path);
            Arc::new(RocksDbKeystore::open_default(path)?)
        }
        None => {
            warn!("POINTS_KEYSTORE_PATH not set; accounts and contracts are kept in memory");
            Arc::new(InMemoryKeystore::default())
        }
    };

    let (extension, extension_enabled): (Arc<dyn InjectedExtension>, bool) =
        match RemoteSignerExtension::new(config.extension_url.clone()) {
            Some(bridge) => {
                info!("using extension bridge at {}", bridge.endpoint());
                (Arc::new(bridge) as Arc<dyn InjectedExtension>, true)
            }
            None => (Arc::new(NoExtension) as Arc<dyn InjectedExtension>, false),
        };

    let state = Arc::new(AppState::new(
        config.clone(),
        keystore,
        extension.clone(),
        extension_enabled,
    ));

    let connector: Arc<dyn NodeConnector> = Arc::new(
        WsConnector::new(Some(config.ws_url.clone()))
            .with_type_aliases(config.custom_types.clone())
            .with_reconnect(ReconnectPolicy::bounded(config.reconnect_attempts)),
    );
    let bring_up = BringUp::new(
        state.store.clone(),
        state.keyring.clone(),
        extension,
        BringUpConfig {
            app_name: config.app_name.clone(),
            default_contract_address: config.contract_address.clone(),
            retry: RetryPolicy::bounded(config.bringup_attempts),
        },
    );
    tokio::spawn(async move {
        if let Err(err) = bring_up.run(connector).await {
            error!("node bring-up failed: {:#}", err);
        }
    });
    let follower = spawn_follower(state.events.clone(), &state.store);

    let app = build_router(state);
    info!("points-service listening on {}", config.listen_addr);

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    follower.abort();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        service: "points-service",
        status: "ok",
    })
}

async fn version() -> Json<VersionResponse> {
    Json(VersionResponse {
        service: "points-service",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub(crate) fn bad_request(message: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message.to_owned(),
        }),
    )
}

pub(crate) fn not_found(message: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: message.to_owned(),
        }),
    )
}

pub(crate) fn service_unavailable(message: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ErrorResponse {
            error: message.to_owned(),
        }),
    )
}

pub(crate) fn internal_error(err: impl std::fmt::Display) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::{Method, Request};
    use pc_api_types::GenesisHash;
    use pc_session::Action;
    use pc_session::testing::{GENESIS, MockExtension, MockNode, points_contract};
    use serde::de::DeserializeOwned;
    use serde_json::Value;
    use tower::ServiceExt;

    pub(crate) struct TestApp {
        pub(crate) state: Arc<AppState>,
        pub(crate) node: Arc<MockNode>,
        pub(crate) extension: Arc<MockExtension>,
    }

    impl TestApp {
        /// Session brought to `Ready`/`Loaded` against a mock node, with the
        /// points contract saved and selected.
        pub(crate) async fn ready() -> anyhow::Result<Self> {
            Self::ready_with(&[]).await
        }

        /// Like `ready`, with the given environment overrides.
        pub(crate) async fn ready_with(overrides: &[(&str, &str)]) -> anyhow::Result<Self> {
            let config = ServiceConfig::from_lookup(|key| {
                overrides
                    .iter()
                    .find(|(name, _)| *name == key)
                    .map(|(_, value)| (*value).to_owned())
            })?;
            let extension = MockExtension::with_account("alice");
            let state = Arc::new(AppState::new(
                config,
                Arc::new(InMemoryKeystore::default()),
                extension.clone(),
                true,
            ));
            let node = MockNode::shared();

            state
                .keyring
                .load_all(&GenesisHash(GENESIS.to_owned()), extension.accounts().await?)
                .await?;
            let contract = points_contract();
            state
                .keyring
                .save_contract(&contract.address, contract.abi.clone(), &contract.name)
                .await?;

            state.store.dispatch(Action::ConnectRequested);
            state.store.dispatch(Action::ConnectionOpened(node.handle()));
            state.store.dispatch(Action::ConnectionEstablished);
            state
                .store
                .dispatch(Action::ContractResolved(state.keyring.get_contract(&contract.address).await));
            state.store.dispatch(Action::KeystoreReady);

            Ok(Self {
                state,
                node,
                extension,
            })
        }

        pub(crate) fn idle() -> anyhow::Result<Self> {
            let config = ServiceConfig::from_lookup(|_| None)?;
            let extension = MockExtension::with_account("alice");
            Ok(Self {
                state: Arc::new(AppState::new(
                    config,
                    Arc::new(InMemoryKeystore::default()),
                    Arc::new(NoExtension),
                    false,
                )),
                node: MockNode::shared(),
                extension,
            })
        }

        pub(crate) async fn send(
            &self,
            method: Method,
            uri: &str,
            body: Option<Value>,
        ) -> anyhow::Result<(StatusCode, Value)> {
            let request = Request::builder().method(method).uri(uri);
            let request = match body {
                Some(body) => request
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))?,
                None => request.body(Body::empty())?,
            };

            let response = build_router(self.state.clone()).oneshot(request).await?;
            let status = response.status();
            let bytes = to_bytes(response.into_body(), usize::MAX).await?;
            let value = if bytes.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(&bytes)?
            };
            Ok((status, value))
        }

        pub(crate) async fn get<T: DeserializeOwned>(&self, uri: &str) -> anyhow::Result<T> {
            let (status, value) = self.send(Method::GET, uri, None).await?;
            anyhow::ensure!(status == StatusCode::OK, "GET {uri} returned {status}: {value}");
            Ok(serde_json::from_value(value)?)
        }

        pub(crate) async fn post<T: DeserializeOwned>(&self, uri: &str, body: Value) -> anyhow::Result<T> {
            let (status, value) = self.send(Method::POST, uri, Some(body)).await?;
            anyhow::ensure!(status == StatusCode::OK, "POST {uri} returned {status}: {value}");
            Ok(serde_json::from_value(value)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::TestApp;
    use serde_json::Value;

    #[tokio::test]
    async fn health_and_version_respond() -> anyhow::Result<()> {
        let app = TestApp::idle()?;

        let health: Value = app.get("/health").await?;
        assert_eq!(health["service"], "points-service");
        assert_eq!(health["status"], "ok");

        let version: Value = app.get("/version").await?;
        assert_eq!(version["version"], env!("CARGO_PKG_VERSION"));
        Ok(())
    }
}
