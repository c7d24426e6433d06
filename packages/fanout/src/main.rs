use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utils::context::AppContext;

use fanout::{
    args::CliArgs,
    config::{Config, ConfigBuilder},
    dispatcher::Dispatcher,
    registry::Registry,
    services,
};

fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    let config: Config = ConfigBuilder::new(args).build()?;

    let filters = config.tracing_env_filter()?;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .without_time()
                .with_target(false),
        )
        .with(filters)
        .try_init()?;

    let ctx = AppContext::new();

    let registry = Arc::new(Registry::new(services::default_services(), &config)?);
    let dispatcher = Arc::new(Dispatcher::new(registry, &config)?);

    fanout::run_server(ctx, config, dispatcher);

    Ok(())
}
