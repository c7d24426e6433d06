use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

pub async fn handle_not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(json!({ "server": "Not found" })))
}
