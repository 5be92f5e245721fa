//! calibre-api-web - HTTP surface for calibre-api using Axum
//!
//! Two entry points:
//! - [`register`] attaches the routes to a router owned by a host application
//! - [`run`] serves them standalone until Ctrl-C

pub mod auth;
pub mod response;
pub mod router;

pub use response::ApiError;
pub use router::{create_router, routes};

use anyhow::Result;
use axum::Router;
use calibre_api_core::{Authorizer, LibraryService, ServiceConfig, SourceError, StaticTokenSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Everything a request handler needs
#[derive(Clone)]
pub struct ApiState {
    pub service: Arc<LibraryService>,
    pub authorizer: Arc<dyn Authorizer>,
}

impl ApiState {
    pub fn new(service: Arc<LibraryService>, authorizer: Arc<dyn Authorizer>) -> Self {
        Self {
            service,
            authorizer,
        }
    }

    /// Library service and static token set from configuration
    pub fn from_config(config: &ServiceConfig) -> Result<Self, SourceError> {
        let service = LibraryService::from_config(config)?;
        Ok(Self::new(
            Arc::new(service),
            Arc::new(StaticTokenSet::new(config.tokens.iter().cloned())),
        ))
    }
}

/// Attach the Calibre routes to a host router
///
/// The host keeps ownership of the listener, middleware stack and shutdown;
/// call [`LibraryService::shutdown`] from the host's own shutdown path.
pub fn register<S>(host: Router<S>, state: ApiState) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    host.merge(routes(state))
}

/// Run the standalone web server
pub async fn run(state: ApiState, addr: SocketAddr) -> Result<()> {
    let service = state.service.clone();
    let router = create_router(state);

    let listener = TcpListener::bind(addr).await?;
    info!("Web server listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    service.shutdown().await;
    info!("Web server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
