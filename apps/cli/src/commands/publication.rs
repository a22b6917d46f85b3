//! Publication commands.

use colored::Colorize;
use pxe_core::{PackageEngine, PackageId};

fn parse_id(raw: &str) -> anyhow::Result<PackageId> {
    raw.parse().map_err(|e| anyhow::anyhow!("{} (expected vendor/title)", e))
}

/// Publish an installed package.
pub async fn publish(engine: &PackageEngine, package_id: &str) -> anyhow::Result<()> {
    let id = parse_id(package_id)?;
    engine.publish(&id).await?;
    println!("{}", format!("✓ Published {}", id).green());
    Ok(())
}

/// Withdraw a published package.
pub async fn unpublish(engine: &PackageEngine, package_id: &str) -> anyhow::Result<()> {
    let id = parse_id(package_id)?;
    engine.unpublish(&id).await?;
    println!("{}", format!("✓ Unpublished {}", id).green());
    Ok(())
}

/// Installs the subscriber used by `pxe serve`: `RUST_LOG`, falling back
/// to debug output of the engine.
pub fn init_server_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pxe_core=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;
    Ok(())
}

/// Serve the publication protocol until Ctrl-C, with configured peers linked.
#[cfg(feature = "grpc")]
pub async fn serve(engine: &PackageEngine) -> anyhow::Result<()> {
    use pxe_core::PublicationService;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    let shutdown = CancellationToken::new();
    let on_interrupt = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
            on_interrupt.cancel();
        }
    });

    let service: Arc<dyn PublicationService> = engine.publication().clone();
    let config = engine.config().clone();
    let stop = shutdown.clone();
    let server = tokio::spawn(async move { pxe_core::server::run(&config, service, stop).await });

    engine.link_peers().await?;
    let mut updates = engine.monitor().subscribe();
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            event = updates.recv() => match event {
                Ok(event) => tracing::info!(?event, "Update event"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Update events dropped");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    server.await??;
    Ok(())
}
