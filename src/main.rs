use anyhow::{Context, Result};
use clap::Parser;
use enkrypt_backups_rs::{cli, cluster, config, disposer, metrics, routes, server, sidecar, storage};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();
    if args.print_openapi {
        println!(
            "{}",
            serde_json::to_string_pretty(&routes::schema::openapi_json())?
        );
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut config = config::Config::from_env()?;
    if let Some(host) = args.host {
        config.http_host = host;
    }
    if let Some(port) = args.port {
        config.http_port = port;
    }

    let store = storage::build_store(&config.storage)
        .await
        .context("failed to initialize the blob store")?;
    let metrics = Arc::new(metrics::Metrics::new());

    let mut teardown = disposer::Disposer::new();
    if config.prometheus_enabled {
        let cancel = CancellationToken::new();
        let task = sidecar::start(Arc::new(config.clone()), metrics.clone(), cancel.clone());
        teardown.push("metrics sidecar", async move {
            cancel.cancel();
            task.await.context("metrics sidecar panicked")
        });
    }

    let result = if config.cluster_standalone {
        server::run_standalone(config, store, metrics).await
    } else {
        cluster::run_cluster(config, store, metrics).await
    };

    let teardown_result = teardown.dispose().await;
    result.and(teardown_result)
}
