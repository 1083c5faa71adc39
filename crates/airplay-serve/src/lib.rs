mod handlers;
pub mod plist;
mod state;
pub mod zeroconf;

use std::net::IpAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use handlers::{CT_BINARY_PLIST, CT_TEXT_PLIST, make_router};
pub use state::{
    AirPlayBackend, AirPlayError, DEFAULT_FEATURES, MODEL_NAME, PROTOCOL_VERSION, ServerInfo,
    SOURCE_VERSION,
};
pub use zeroconf::ZeroconfPublisher;

pub struct AirPlayServiceOptions {
    /// Human-readable instance name, shown in client device pickers.
    pub name: String,
    pub bind_addr: IpAddr,
    pub port: u16,
    pub info: ServerInfo,
    pub shutdown: CancellationToken,
}

/// Serves the AirPlay HTTP surface for one renderer until shut down.
pub async fn run_airplay_service(
    opts: AirPlayServiceOptions,
    backend: Arc<dyn AirPlayBackend>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind((opts.bind_addr, opts.port))
        .await
        .with_context(|| format!("error binding AirPlay listener on port {}", opts.port))?;
    let addr = listener.local_addr()?;
    info!(name = %opts.name, %addr, "AirPlay service running");

    let router = make_router(backend, opts.info);
    axum::serve(listener, router)
        .with_graceful_shutdown(opts.shutdown.cancelled_owned())
        .await
        .context("AirPlay HTTP server failed")?;

    info!(name = %opts.name, "AirPlay service stopped");
    Ok(())
}
