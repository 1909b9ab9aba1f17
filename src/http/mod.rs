pub mod routes;

use crate::aggregator::Aggregator;
use crate::error::{ConfigError, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The mTLS-terminating listener: the CA-issued server cert, requiring
/// client certs signed by the same CA. The teacher's plain `warp::serve`
/// donates the server-bootstrap shape; the mTLS cert plumbing itself is
/// generalized from `ca::Authority` rather than the teacher's unauthenticated
/// web UI listener.
pub async fn run(
    bind_address: &str,
    bind_port: u16,
    server_cert_chain_pem: &str,
    server_key_pem: &str,
    ca_cert_pem: &str,
    aggregator: Arc<Aggregator>,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr: SocketAddr = format!("{bind_address}:{bind_port}")
        .parse()
        .map_err(|e| ConfigError::Validation(format!("invalid bind address: {e}")))?;

    let routes = routes::routes(aggregator);

    let (_, server) = warp::serve(routes)
        .tls()
        .cert(server_cert_chain_pem.as_bytes())
        .key(server_key_pem.as_bytes())
        .client_auth_required(ca_cert_pem.as_bytes())
        .bind_with_graceful_shutdown(addr, async move {
            shutdown.cancelled().await;
        });

    tracing::info!(%addr, "aggregator listening");
    server.await;
    tracing::info!("aggregator HTTP server stopped");
    Ok(())
}
