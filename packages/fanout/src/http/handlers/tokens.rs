use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use serde_json::Value;

use fanout_types::TokensPatch;

use super::run_blocking;
use crate::http::{
    state::HttpState,
    token::{caller_token, CallParams},
};

pub async fn handle_put_tokens(
    State(state): State<HttpState>,
    Query(params): Query<CallParams>,
    headers: HeaderMap,
    Json(patch): Json<TokensPatch>,
) -> Json<Value> {
    let token = caller_token(&state.config, &headers, &params);
    run_blocking(move || state.dispatcher.put_tokens(&patch, &token)).await
}

pub async fn handle_del_tokens(
    State(state): State<HttpState>,
    Query(params): Query<CallParams>,
    headers: HeaderMap,
    Json(patch): Json<TokensPatch>,
) -> Json<Value> {
    let token = caller_token(&state.config, &headers, &params);
    run_blocking(move || state.dispatcher.del_tokens(&patch, &token)).await
}
