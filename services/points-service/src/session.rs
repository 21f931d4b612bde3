use axum::{Json, extract::State};
use pc_api_types::{ChainConfigResponse, ContractSummary, SelectCallerRequest, SessionResponse};
use pc_session::{Action, Session};
use std::sync::Arc;

use crate::{ApiResult, AppState, bad_request};

pub(crate) fn session_response(session: &Session) -> SessionResponse {
    SessionResponse {
        version: session.version,
        connection_status: session.connection_status,
        keystore_status: session.keystore_status,
        chain_info: session.chain_info.clone(),
        selected_contract: session.selected_contract.as_ref().map(|contract| ContractSummary {
            address: contract.address.clone(),
            name: contract.name.clone(),
            has_abi: contract.abi.is_some(),
        }),
        has_contract: session.selected_contract.is_some(),
        caller: session.caller.clone(),
        last_error: session.last_error.clone(),
    }
}

pub(crate) async fn get_session(State(state): State<Arc<AppState>>) -> Json<SessionResponse> {
    Json(session_response(&state.store.state()))
}

pub(crate) async fn select_caller(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SelectCallerRequest>,
) -> ApiResult<SessionResponse> {
    let caller = request.caller.trim().to_owned();
    if !caller.is_empty() && state.keyring.get_pair(&caller).await.is_none() {
        return Err(bad_request("caller is not a known account"));
    }

    let session = state.store.dispatch(Action::CallerSelected(caller));
    Ok(Json(session_response(&session)))
}

/// Effective non-secret configuration.
pub(crate) async fn chain_config(State(state): State<Arc<AppState>>) -> Json<ChainConfigResponse> {
    let config = &state.config;
    Json(ChainConfigResponse {
        app_name: config.app_name.clone(),
        ws_url: config.ws_url.clone(),
        default_contract_address: config.contract_address.clone(),
        custom_types: config.custom_types.clone(),
        extension_enabled: state.extension_enabled,
        persistent_keystore: config.keystore_path.is_some(),
    })
}
