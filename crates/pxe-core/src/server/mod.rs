//! gRPC server for the publication protocol.

pub mod logging;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::info;

use crate::config::Config;
use crate::error::Result;
use crate::proto::publication_server::PublicationServer;
use crate::publication::PublicationService;
use crate::publication::grpc::PublicationGrpcServer;
use logging::RequestLoggerLayer;

/// Serves `service` on the configured publication address until `shutdown`
/// is cancelled.
///
/// # Errors
///
/// Returns an error if the server fails to bind or stops abnormally.
pub async fn run(
    config: &Config,
    service: Arc<dyn PublicationService>,
    shutdown: CancellationToken,
) -> Result<()> {
    serve(config.publication.address, service, shutdown).await
}

/// Serves `service` on `addr` until `shutdown` is cancelled.
///
/// # Errors
///
/// Returns an error if the server fails to bind or stops abnormally.
pub async fn serve(
    addr: SocketAddr,
    service: Arc<dyn PublicationService>,
    shutdown: CancellationToken,
) -> Result<()> {
    info!(%addr, "Starting publication server");

    Server::builder()
        .layer(RequestLoggerLayer)
        .add_service(PublicationServer::new(PublicationGrpcServer::new(service)))
        .serve_with_shutdown(addr, async move { shutdown.cancelled().await })
        .await?;

    info!(%addr, "Publication server stopped");
    Ok(())
}
