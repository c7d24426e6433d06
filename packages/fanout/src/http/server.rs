use crate::{config::Config, dispatcher::Dispatcher};
use axum::routing::{delete, get, post, put};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utils::context::AppContext;
use wildmatch::WildMatch;

use super::{
    handlers::{
        handle_del_tokens, handle_get, handle_get_list, handle_get_root, handle_info_groups,
        handle_info_server, handle_info_services, handle_info_services2, handle_info_tokens,
        handle_info_version, handle_not_found, handle_put_tokens, handle_reload_tokens,
        handle_restart, handle_start, handle_stop,
    },
    state::HttpState,
};

// this is called from main, blocks until the kill signal arrives
pub fn start(ctx: AppContext, config: Config, dispatcher: Arc<Dispatcher>) -> anyhow::Result<()> {
    // The server runs within the tokio runtime
    ctx.rt.clone().block_on(async move {
        let (host, port) = (config.host.clone(), config.port);

        let mut shutdown_signal = ctx.kill_receiver();

        let router = make_router(config, dispatcher);

        let listener = tokio::net::TcpListener::bind(&format!("{}:{}", host, port)).await?;

        tracing::info!("Http server starting on: {}", listener.local_addr()?);

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown_signal.wait_for(|killed| *killed).await;

                tracing::debug!("Http server shutting down");
            })
            .await?;

        anyhow::Ok(())
    })?;

    Ok(())
}

// this is called from main and tests
pub fn make_router(config: Config, dispatcher: Arc<Dispatcher>) -> axum::Router {
    let state = HttpState::new(config.clone(), dispatcher);

    let api = axum::Router::new()
        .route("/server/info/services/", get(handle_info_services))
        .route("/server/info/services2/", get(handle_info_services2))
        .route("/server/info/groups/", get(handle_info_groups))
        .route("/server/info/tokens/", get(handle_info_tokens))
        .route("/server/info/server/", get(handle_info_server))
        .route("/server/info/version/", get(handle_info_version))
        .route("/server/start/", get(handle_start))
        .route("/server/stop/", get(handle_stop))
        .route("/server/restart/", get(handle_restart))
        .route("/server/reload_tokens/", get(handle_reload_tokens))
        .route("/server/tokens/", put(handle_put_tokens))
        .route("/server/tokens/", delete(handle_del_tokens))
        // group-or-service dispatch; the request part may contain slashes
        .route("/{group_service}/", get(handle_get_root))
        .route("/{group_service}/", post(handle_get_list))
        .route("/{group_service}/{*request}", get(handle_get));

    let mut router = axum::Router::new()
        .nest("/api/v1", api)
        .fallback(handle_not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    if let Some(cors) = cors_layer(&config) {
        router = router.layer(cors);
    }

    router
}

fn cors_layer(config: &Config) -> Option<CorsLayer> {
    if config.cors_allowed_origins.is_empty() {
        None
    } else {
        let allowed_origins: Vec<WildMatch> = config
            .cors_allowed_origins
            .iter()
            .map(|s| WildMatch::new(s))
            .collect();

        Some(
            CorsLayer::new()
                // using a predicate so we have more flexibility over wildcard patterns
                .allow_origin(tower_http::cors::AllowOrigin::predicate(
                    move |origin, _parts| {
                        origin
                            .to_str()
                            .map(|origin| {
                                allowed_origins
                                    .iter()
                                    .any(|allowed_origin| allowed_origin.matches(origin))
                            })
                            .unwrap_or(false)
                    },
                ))
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
    }
}
