use axum::{
    Json,
    extract::{Query, State},
};
use pc_api_types::{EventEntryResponse, EventFeedResponse};
use serde::Deserialize;
use std::sync::Arc;

use crate::AppState;

#[derive(Debug, Deserialize)]
pub(crate) struct EventsQuery {
    limit: Option<usize>,
}

/// Newest first.
pub(crate) async fn list_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Json<EventFeedResponse> {
    let limit = query.limit.unwrap_or(usize::MAX);
    let events = state
        .events
        .entries()
        .into_iter()
        .take(limit)
        .map(|entry| EventEntryResponse {
            icon: entry.icon,
            summary: entry.summary,
            extra_text: entry.extra_text,
            content: entry.content,
        })
        .collect();

    Json(EventFeedResponse { events })
}
