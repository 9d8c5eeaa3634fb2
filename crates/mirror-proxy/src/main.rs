//! mirror-proxy: sends every inbound HTTP request to several servers and
//! relays one of their responses.

mod cli;
mod config;
mod error;
mod proxy;
mod server;
#[cfg(test)]
mod testing;

use clap::Parser;

use cli::Cli;
use config::ProxyConfig;
use proxy::duplicate::{build_client, DuplicateStage, Duplicator};
use proxy::relay::RelayStage;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone();

    // Flags take precedence over TOML and env vars
    let config = cli.apply(ProxyConfig::load(&config_path)?);

    // The tonic gRPC exporter needs a reactor, so the runtime comes first
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let tracing_guard = mirror_tracing::init_tracing(&config.tracing);

        tracing::info!(
            config_path = %config_path,
            listen_address = %config.server.listen_address,
            destinations = ?config.upstream.destinations,
            policy = %config.ordering.policy,
            accepted_statuses = %config.ordering.accepted_statuses,
            otlp_export = tracing_guard.is_exporting(),
            "Starting mirror-proxy"
        );

        run(config).await
    })
}

async fn run(config: ProxyConfig) -> anyhow::Result<()> {
    let destinations = config.upstream.parse_destinations()?;
    let client = build_client(config.upstream.timeout())?;

    let duplicator = Duplicator::new(client, destinations)
        .with_body_strategy(config.upstream.body_strategy)
        .with_max_body_bytes(config.upstream.max_body_bytes)
        .with_deadline(config.upstream.deadline());
    let relay = RelayStage::new(config.ordering.policy, config.ordering.accepted_statuses);

    server::run(
        &config.server.listen_address,
        DuplicateStage::new(duplicator, relay),
    )
    .await
}
