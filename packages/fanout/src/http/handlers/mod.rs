mod dispatch;
mod info;
mod lifecycle;
mod not_found;
mod tokens;

use axum::Json;
use serde_json::{json, Value};

/// The dispatcher blocks (correlation loops, worker joins, file IO), so
/// handlers enter it through spawn_blocking.
pub(crate) async fn run_blocking<F>(call: F) -> Json<Value>
where
    F: FnOnce() -> Value + Send + 'static,
{
    match tokio::task::spawn_blocking(call).await {
        Ok(value) => Json(value),
        Err(err) => {
            tracing::error!("Http: blocking call panicked: {}", err);
            Json(json!({ "server": "ERROR" }))
        }
    }
}

pub use dispatch::{handle_get, handle_get_list, handle_get_root};
pub use info::{
    handle_info_groups, handle_info_server, handle_info_services, handle_info_services2,
    handle_info_tokens, handle_info_version,
};
pub use lifecycle::{handle_reload_tokens, handle_restart, handle_start, handle_stop};
pub use not_found::handle_not_found;
pub use tokens::{handle_del_tokens, handle_put_tokens};
