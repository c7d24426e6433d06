//! The dispatch endpoints. The path segment before the request doubles
//! as a service id (digit strings) or a group name; the dispatcher
//! resolves which. The correlation loop blocks for up to the full
//! service run time, so these always run through spawn_blocking.

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};

use fanout_types::{DispatchResponse, DispatchState, ServerBlock};
use serde_json::json;

use crate::http::{
    state::HttpState,
    token::{caller_token, CallParams},
};

async fn run_blocking<F>(call: F) -> Json<DispatchResponse>
where
    F: FnOnce() -> DispatchResponse + Send + 'static,
{
    match tokio::task::spawn_blocking(call).await {
        Ok(response) => Json(response),
        Err(err) => {
            tracing::error!("Http: dispatch call panicked: {}", err);
            Json(DispatchResponse::new(ServerBlock {
                state: DispatchState::Error,
                message: Some("Internal server error".to_string()),
                ..ServerBlock::ok(json!(null))
            }))
        }
    }
}

/// `GET /{id_or_group}/{request}` where the request may contain slashes.
pub async fn handle_get(
    State(state): State<HttpState>,
    Path((group_service, request)): Path<(String, String)>,
    Query(params): Query<CallParams>,
    headers: HeaderMap,
) -> Json<DispatchResponse> {
    let token = caller_token(&state.config, &headers, &params);
    let caching = params.caching();
    run_blocking(move || {
        state
            .dispatcher
            .get_group(&group_service, &request, &token, caching)
    })
    .await
}

/// `GET /{id_or_group}/` with an empty request string.
pub async fn handle_get_root(
    State(state): State<HttpState>,
    Path(group_service): Path<String>,
    Query(params): Query<CallParams>,
    headers: HeaderMap,
) -> Json<DispatchResponse> {
    let token = caller_token(&state.config, &headers, &params);
    let caching = params.caching();
    run_blocking(move || state.dispatcher.get_group(&group_service, "", &token, caching)).await
}

/// `POST /{id_or_group}/` with a JSON array of request strings.
pub async fn handle_get_list(
    State(state): State<HttpState>,
    Path(group_service): Path<String>,
    Query(params): Query<CallParams>,
    headers: HeaderMap,
    Json(requests): Json<Vec<String>>,
) -> Json<DispatchResponse> {
    let token = caller_token(&state.config, &headers, &params);
    let caching = params.caching();
    run_blocking(move || {
        state
            .dispatcher
            .get_group_list(&group_service, &requests, &token, caching)
    })
    .await
}
