use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use serde_json::Value;

use crate::http::{
    state::HttpState,
    token::{caller_token, CallParams},
};

pub async fn handle_info_services(
    State(state): State<HttpState>,
    Query(params): Query<CallParams>,
    headers: HeaderMap,
) -> Json<Value> {
    let token = caller_token(&state.config, &headers, &params);
    Json(state.dispatcher.get_services_info(&token))
}

pub async fn handle_info_services2(
    State(state): State<HttpState>,
    Query(params): Query<CallParams>,
    headers: HeaderMap,
) -> Json<Value> {
    let token = caller_token(&state.config, &headers, &params);
    Json(state.dispatcher.get_services_info_more(&token))
}

pub async fn handle_info_groups(
    State(state): State<HttpState>,
    Query(params): Query<CallParams>,
    headers: HeaderMap,
) -> Json<Value> {
    let token = caller_token(&state.config, &headers, &params);
    Json(state.dispatcher.get_groups_info(&token))
}

pub async fn handle_info_tokens(
    State(state): State<HttpState>,
    Query(params): Query<CallParams>,
    headers: HeaderMap,
) -> Json<Value> {
    let token = caller_token(&state.config, &headers, &params);
    Json(state.dispatcher.get_tokens_info(&token))
}

pub async fn handle_info_server(
    State(state): State<HttpState>,
    Query(params): Query<CallParams>,
    headers: HeaderMap,
) -> Json<Value> {
    let token = caller_token(&state.config, &headers, &params);
    Json(state.dispatcher.get_server_info(&token))
}

pub async fn handle_info_version(
    State(state): State<HttpState>,
    Query(params): Query<CallParams>,
    headers: HeaderMap,
) -> Json<Value> {
    let token = caller_token(&state.config, &headers, &params);
    Json(state.dispatcher.get_server_version(&token))
}
