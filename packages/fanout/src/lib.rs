#![allow(clippy::uninlined_format_args)]
#![allow(clippy::type_complexity)]

pub mod args;
pub mod auth;
pub mod config;
pub mod dispatcher; // the front door: validation, caching, correlation
pub mod http;
pub mod registry; // immutable service catalog
pub mod services; // the hosted plugins and their trait
pub mod subsystems; // subsystems: worker pools, supervisor, garbage collector

use std::sync::Arc;

use config::Config;
use dispatcher::Dispatcher;
use utils::context::AppContext;

/// Entry point to start up the whole server
/// Called from main and end-to-end tests
pub fn run_server(ctx: AppContext, config: Config, dispatcher: Arc<Dispatcher>) {
    let _ = ctrlc::set_handler({
        let ctx = ctx.clone();
        move || {
            ctx.kill();
        }
    });

    // start the http server in its own thread
    let server_handle = std::thread::spawn({
        let dispatcher = dispatcher.clone();
        let ctx = ctx.clone();
        move || {
            http::server::start(ctx, config, dispatcher).unwrap();
        }
    });

    server_handle.join().unwrap();

    // the http server returned, tear the engine down with it
    dispatcher.shutdown();
}
