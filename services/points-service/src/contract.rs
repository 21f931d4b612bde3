use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use pc_api_types::{
    AbiMessageResponse, AbiParamResponse, ContractCallRequest, ContractCallResponse,
    ContractForgetRequest, ContractRef, ContractSaveRequest, ContractStatusResponse, ContractSummary,
    KeystoreStatus,
};
use pc_session::{
    AbiDocument, AbiMessage, Action, CallStatusCell, ContractHandle, Invocation, lookup_message,
};
use std::sync::Arc;
use tracing::info;

use crate::{ApiResult, AppState, ErrorResponse, bad_request, internal_error, not_found, service_unavailable};

fn summary(contract: &ContractRef) -> ContractSummary {
    ContractSummary {
        address: contract.address.clone(),
        name: contract.name.clone(),
        has_abi: contract.abi.is_some(),
    }
}

fn message_response(message: AbiMessage) -> AbiMessageResponse {
    AbiMessageResponse {
        identifier: message.identifier,
        method: message.method,
        params: message
            .params
            .into_iter()
            .map(|param| AbiParamResponse {
                name: param.name,
                type_name: param.type_name,
            })
            .collect(),
        is_mutating: message.is_mutating,
        is_payable: message.is_payable,
        docs: message.docs,
    }
}

pub(crate) fn require_keystore(state: &AppState) -> Result<(), (StatusCode, Json<ErrorResponse>)> {
    if state.store.state().keystore_status != KeystoreStatus::Loaded {
        return Err(service_unavailable("keystore is not loaded yet"));
    }
    Ok(())
}

pub(crate) async fn save_contract(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ContractSaveRequest>,
) -> ApiResult<ContractStatusResponse> {
    let address = request.address.trim().to_owned();
    if address.is_empty() {
        return Err(bad_request("address is required"));
    }
    require_keystore(&state)?;

    // Without an uploaded ABI the one already cached for this address is kept.
    let abi = match request.abi {
        Some(abi) => {
            AbiDocument::parse(&abi).map_err(|err| bad_request(&format!("invalid ABI: {err}")))?;
            Some(abi)
        }
        None => state
            .keyring
            .get_contract(&address)
            .await
            .and_then(|existing| existing.abi),
    };

    state
        .keyring
        .save_contract(&address, abi, request.name.trim())
        .await
        .map_err(internal_error)?;

    let contract = state.keyring.get_contract(&address).await;
    state.store.dispatch(Action::ContractResolved(contract.clone()));
    info!(address = %address, "contract saved");

    Ok(Json(ContractStatusResponse {
        status: "contract saved to keyring".to_owned(),
        contract: contract.as_ref().map(summary),
    }))
}

pub(crate) async fn forget_contract(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ContractForgetRequest>,
) -> ApiResult<ContractStatusResponse> {
    let address = request.address.trim().to_owned();
    if address.is_empty() {
        return Err(bad_request("address is required"));
    }
    require_keystore(&state)?;

    state
        .keyring
        .forget_contract(&address)
        .await
        .map_err(internal_error)?;

    let contract = state.keyring.get_contract(&address).await;
    state.store.dispatch(Action::ContractResolved(contract.clone()));
    info!(address = %address, "contract forgotten");

    Ok(Json(ContractStatusResponse {
        status: "contract removed from keyring".to_owned(),
        contract: contract.as_ref().map(summary),
    }))
}

pub(crate) async fn list_messages(State(state): State<Arc<AppState>>) -> ApiResult<Vec<AbiMessageResponse>> {
    let handle = state
        .contract_handle()
        .ok_or_else(|| not_found("no contract with an ABI is selected"))?;

    Ok(Json(
        handle
            .abi()
            .messages()
            .iter()
            .cloned()
            .map(message_response)
            .collect(),
    ))
}

/// Unknown methods yield empty metadata rather than an error.
pub(crate) async fn get_message(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Json<AbiMessageResponse> {
    let handle = state.contract_handle();
    Json(message_response(lookup_message(handle.as_ref(), &name)))
}

/// Validates the request against the session and the ABI and builds the invocation.
pub(crate) fn prepare_invocation(
    state: &AppState,
    request: ContractCallRequest,
) -> Result<(Option<ContractHandle>, Invocation), (StatusCode, Json<ErrorResponse>)> {
    if request.method.trim().is_empty() {
        return Err(bad_request("method is required"));
    }

    let handle = state.contract_handle();
    let message = lookup_message(handle.as_ref(), &request.method);
    if let Some(param) = message
        .params
        .iter()
        .enumerate()
        .find(|(index, _)| request.params.get(*index).is_none_or(|value| value.is_null()))
        .map(|(_, param)| param)
    {
        return Err(bad_request(&format!("parameter {} is required", param.name)));
    }

    let caller = request
        .caller
        .filter(|caller| !caller.trim().is_empty())
        .unwrap_or_else(|| state.store.state().caller.clone());

    Ok((
        handle,
        Invocation {
            method: request.method,
            caller,
            is_transaction: request.is_transaction,
            params: request.params,
        },
    ))
}

/// Runs the call to its terminal result.
pub(crate) async fn call_contract(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ContractCallRequest>,
) -> ApiResult<ContractCallResponse> {
    let (handle, invocation) = prepare_invocation(&state, request)?;

    let status = CallStatusCell::default();
    let result = state
        .orchestrator
        .invoke(handle.as_ref(), &invocation, &status)
        .await;

    Ok(Json(ContractCallResponse {
        result,
        history: status.history(),
    }))
}

#[cfg(test)]
mod tests {
    use crate::test_support::TestApp;
    use axum::http::{Method, StatusCode};
    use pc_api_types::{
        AbiMessageResponse, CallOutcome, CallResult, ContractCallResponse, ContractStatusResponse,
        SessionResponse,
    };
    use pc_session::testing::{POINTS_ADDRESS, points_abi};
    use serde_json::{Value, json};

    #[tokio::test]
    async fn messages_come_from_selected_abi() -> anyhow::Result<()> {
        let app = TestApp::ready().await?;

        let messages: Vec<AbiMessageResponse> = app.get("/contract/messages").await?;
        assert_eq!(messages.len(), 9);

        let message: AbiMessageResponse = app.get("/contract/messages/giveUserPoints").await?;
        assert_eq!(message.identifier, "give_user_points");
        assert_eq!(message.params.len(), 3);
        assert!(message.is_mutating);

        let missing: AbiMessageResponse = app.get("/contract/messages/does_not_exist").await?;
        assert!(missing.identifier.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn forget_then_save_rederives_handle() -> anyhow::Result<()> {
        let app = TestApp::ready().await?;

        let forgotten: ContractStatusResponse = app
            .post("/contract/forget", json!({ "address": POINTS_ADDRESS }))
            .await?;
        assert!(forgotten.contract.is_none());
        let (status, _) = app.send(Method::GET, "/contract/messages", None).await?;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let saved: ContractStatusResponse = app
            .post(
                "/contract/save",
                json!({ "address": POINTS_ADDRESS, "name": "points", "abi": points_abi() }),
            )
            .await?;
        assert_eq!(saved.contract.map(|contract| contract.has_abi), Some(true));

        let session: SessionResponse = app.get("/session").await?;
        assert!(session.has_contract);
        let messages: Vec<AbiMessageResponse> = app.get("/contract/messages").await?;
        assert_eq!(messages.len(), 9);
        Ok(())
    }

    #[tokio::test]
    async fn save_rejects_malformed_abi() -> anyhow::Result<()> {
        let app = TestApp::ready().await?;
        let (status, body) = app
            .send(
                Method::POST,
                "/contract/save",
                Some(json!({ "address": POINTS_ADDRESS, "abi": { "hello": "world" } })),
            )
            .await?;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().is_some_and(|error| error.contains("invalid ABI")));
        Ok(())
    }

    #[tokio::test]
    async fn save_requires_loaded_keystore() -> anyhow::Result<()> {
        let app = TestApp::idle()?;
        let (status, _) = app
            .send(Method::POST, "/contract/save", Some(json!({ "address": POINTS_ADDRESS })))
            .await?;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        Ok(())
    }

    #[tokio::test]
    async fn query_call_returns_output() -> anyhow::Result<()> {
        let app = TestApp::ready().await?;
        app.node.set_output(json!(500));

        let response: ContractCallResponse = app
            .post(
                "/contract/call",
                json!({
                    "method": "get_user_points",
                    "params": ["5User"],
                    "caller": app.extension.account_address()
                }),
            )
            .await?;
        assert_eq!(response.result, CallResult::ok("500"));
        Ok(())
    }

    #[tokio::test]
    async fn transaction_rejected_by_dry_run_is_not_submitted() -> anyhow::Result<()> {
        let app = TestApp::ready().await?;
        app.node.set_output(json!({ "Err": "InsufficientPoints" }));
        let caller = app.extension.account_address();
        let _: Value = app.post("/session/caller", json!({ "caller": caller })).await?;

        let response: ContractCallResponse = app
            .post(
                "/contract/call",
                json!({
                    "method": "spendPoints",
                    "is_transaction": true,
                    "params": []
                }),
            )
            .await?;
        assert_eq!(response.result.outcome, CallOutcome::Err);
        assert_eq!(app.node.submission_count(), 0);

        let response: ContractCallResponse = app
            .post(
                "/contract/call",
                json!({
                    "method": "useUserPoints",
                    "is_transaction": true,
                    "params": ["5Store", "5User", 10]
                }),
            )
            .await?;
        assert_eq!(response.result, CallResult::err("InsufficientPoints"));
        assert_eq!(app.node.dry_run_count(), 1);
        assert_eq!(app.node.submission_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn missing_parameters_are_rejected() -> anyhow::Result<()> {
        let app = TestApp::ready().await?;
        let (status, body) = app
            .send(
                Method::POST,
                "/contract/call",
                Some(json!({ "method": "give_user_points", "params": ["5Store", null] })),
            )
            .await?;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "parameter user is required");
        assert_eq!(app.node.dry_run_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn transaction_history_includes_phases() -> anyhow::Result<()> {
        let app = TestApp::ready().await?;

        let response: ContractCallResponse = app
            .post(
                "/contract/call",
                json!({
                    "method": "give_authority",
                    "is_transaction": true,
                    "params": ["5Store"],
                    "caller": app.extension.account_address()
                }),
            )
            .await?;
        assert_eq!(response.result, CallResult::ok("Success"));
        assert_eq!(response.history.len(), 3);
        assert_eq!(response.history[0], CallResult::pending("status: Ready"));
        Ok(())
    }
}
