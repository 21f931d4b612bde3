use axum::{Json, extract::State};
use pc_api_types::{AccountCreateRequest, AccountResponse};
use pc_storage::KeyringAccount;
use std::sync::Arc;

use crate::contract::require_keystore;
use crate::{ApiResult, AppState, bad_request, internal_error};

fn account_response(account: KeyringAccount) -> AccountResponse {
    AccountResponse {
        address: account.address,
        name: account.name,
        source: account.source,
        is_injected: account.is_injected,
    }
}

/// Local and extension accounts for the connected chain.
pub(crate) async fn list_accounts(State(state): State<Arc<AppState>>) -> Json<Vec<AccountResponse>> {
    let accounts = state.keyring.accounts().await;
    Json(accounts.into_iter().map(account_response).collect())
}

pub(crate) async fn create_account(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AccountCreateRequest>,
) -> ApiResult<AccountResponse> {
    let name = request.name.trim();
    if name.is_empty() {
        return Err(bad_request("name is required"));
    }
    require_keystore(&state)?;

    let account = state
        .signers
        .create_local_account(name)
        .await
        .map_err(internal_error)?;
    Ok(Json(account_response(account)))
}
