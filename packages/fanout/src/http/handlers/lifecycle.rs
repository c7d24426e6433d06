//! Admin lifecycle commands. These block on worker joins and service
//! hooks, so they run through spawn_blocking like the dispatch calls.

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use serde_json::Value;

use super::run_blocking;
use crate::http::{
    state::HttpState,
    token::{caller_token, CallParams},
};

pub async fn handle_start(
    State(state): State<HttpState>,
    Query(params): Query<CallParams>,
    headers: HeaderMap,
) -> Json<Value> {
    let token = caller_token(&state.config, &headers, &params);
    run_blocking(move || state.dispatcher.get_start(&token)).await
}

pub async fn handle_stop(
    State(state): State<HttpState>,
    Query(params): Query<CallParams>,
    headers: HeaderMap,
) -> Json<Value> {
    let token = caller_token(&state.config, &headers, &params);
    run_blocking(move || state.dispatcher.get_stop(&token)).await
}

pub async fn handle_restart(
    State(state): State<HttpState>,
    Query(params): Query<CallParams>,
    headers: HeaderMap,
) -> Json<Value> {
    let token = caller_token(&state.config, &headers, &params);
    run_blocking(move || state.dispatcher.get_restart(&token)).await
}

pub async fn handle_reload_tokens(
    State(state): State<HttpState>,
    Query(params): Query<CallParams>,
    headers: HeaderMap,
) -> Json<Value> {
    let token = caller_token(&state.config, &headers, &params);
    run_blocking(move || state.dispatcher.get_reload_tokens(&token)).await
}
