use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use pc_api_types::{CallResult, ContractCallRequest, TrackedCallResponse};
use pc_session::{CallStatusCell, WeakSink};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::contract::prepare_invocation;
use crate::{ApiResult, AppState, TrackedCall, not_found};

/// Tracked calls in start order, bounded to `capacity` entries.
pub(crate) struct CallRegistry {
    capacity: usize,
    order: VecDeque<Uuid>,
    calls: HashMap<Uuid, TrackedCall>,
}

impl CallRegistry {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            calls: HashMap::new(),
        }
    }

    /// Over capacity, the oldest settled call goes first. A running call is
    /// evicted only when none has settled; its later reports are discarded.
    pub(crate) fn insert(&mut self, call_id: Uuid, call: TrackedCall) {
        self.order.push_back(call_id);
        self.calls.insert(call_id, call);

        while self.calls.len() > self.capacity {
            let victim = self
                .order
                .iter()
                .position(|id| self.calls.get(id).is_some_and(TrackedCall::is_settled))
                .unwrap_or(0);
            let Some(evicted) = self.order.remove(victim) else {
                break;
            };
            self.calls.remove(&evicted);
            debug!(call_id = %evicted, "tracked call evicted");
        }
    }

    pub(crate) fn get(&self, call_id: &Uuid) -> Option<&TrackedCall> {
        self.calls.get(call_id)
    }

    pub(crate) fn remove(&mut self, call_id: &Uuid) -> Option<TrackedCall> {
        let call = self.calls.remove(call_id)?;
        self.order.retain(|id| id != call_id);
        Some(call)
    }

    pub(crate) fn len(&self) -> usize {
        self.calls.len()
    }
}

fn tracked_response(call_id: Uuid, call: &TrackedCall) -> TrackedCallResponse {
    TrackedCallResponse {
        call_id,
        method: call.method.clone(),
        latest: call
            .status
            .latest()
            .unwrap_or_else(|| CallResult::pending("status: Submitting")),
        history: call.status.history(),
    }
}

/// Starts a call in the background; poll `GET /calls/{id}` for its status.
pub(crate) async fn start_call(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ContractCallRequest>,
) -> ApiResult<TrackedCallResponse> {
    let (handle, invocation) = prepare_invocation(&state, request)?;

    let call_id = Uuid::new_v4();
    let call = TrackedCall {
        method: invocation.method.clone(),
        status: Arc::new(CallStatusCell::default()),
    };
    let sink = WeakSink::new(&call.status);
    let response = tracked_response(call_id, &call);

    state.calls.write().await.insert(call_id, call);

    let orchestrator = state.orchestrator.clone();
    tokio::spawn(async move {
        let result = orchestrator.invoke(handle.as_ref(), &invocation, &sink).await;
        debug!(%call_id, outcome = ?result.outcome, "tracked call settled");
    });

    Ok(Json(response))
}

pub(crate) async fn get_call(
    State(state): State<Arc<AppState>>,
    Path(call_id): Path<Uuid>,
) -> ApiResult<TrackedCallResponse> {
    let calls = state.calls.read().await;
    let call = calls.get(&call_id).ok_or_else(|| not_found("call not found"))?;
    Ok(Json(tracked_response(call_id, call)))
}

/// Stops tracking a call. The call itself keeps running; its later reports are discarded.
pub(crate) async fn drop_call(
    State(state): State<Arc<AppState>>,
    Path(call_id): Path<Uuid>,
) -> Result<StatusCode, (StatusCode, Json<crate::ErrorResponse>)> {
    match state.calls.write().await.remove(&call_id) {
        Some(_) => Ok(StatusCode::NO_CONTENT),
        None => Err(not_found("call not found")),
    }
}
