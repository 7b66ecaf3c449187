//! msgvault archive core: sync scheduler, HTTP API, and store contract.

pub mod config;
pub mod net;
pub mod rate_limit;
pub mod rest;
pub mod scheduler;
pub mod security;
pub mod store;

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{info, warn};

use config::Config;
use rate_limit::RateLimiter;
use rest::AppState;
use scheduler::Scheduler;
use store::MessageStore;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(
        "refusing to bind {0}: no API key configured and the address is not loopback; \
         set an API key or pass an explicit insecure override"
    )]
    InsecureBind(String),
    #[error("failed to bind {0}: {1}")]
    Bind(String, std::io::Error),
    #[error(transparent)]
    Rate(#[from] rate_limit::RateLimiterError),
}

/// Owns the listener, the rate limiter, and the shared [`AppState`]; exposes
/// the single `shutdown` method of spec §4.6.
pub struct Server {
    state: Arc<AppState>,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Validates the startup security gate (spec §4.6), builds the rate
    /// limiter, and binds the listener. Does not start serving yet.
    pub async fn bind(
        config: Config,
        store: Arc<dyn MessageStore>,
        scheduler: Scheduler,
    ) -> Result<Self, ServerError> {
        if !config.startup_security_ok() {
            return Err(ServerError::InsecureBind(format!(
                "{}:{}",
                config.bind_host, config.bind_port
            )));
        }
        if config.api_key.is_empty() {
            warn!(
                bind_host = %config.bind_host,
                bind_port = config.bind_port,
                "starting with no API key configured — all /api/v1 routes are unauthenticated"
            );
        }

        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit_rps, config.rate_limit_burst)?);
        let addr = format!("{}:{}", config.bind_host, config.bind_port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ServerError::Bind(addr.clone(), e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::Bind(addr.clone(), e))?;

        let state = Arc::new(AppState::new(store, scheduler, config, rate_limiter));

        Ok(Self {
            state,
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Serves until `shutdown_signal` resolves, then performs a graceful
    /// shutdown (closes the rate limiter, stops accepting new connections,
    /// waits for in-flight requests — spec §4.6). The scheduler is stopped
    /// independently by the caller.
    pub async fn serve(
        self,
        shutdown_signal: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> std::io::Result<()> {
        info!(addr = %self.local_addr, "listening");
        let router = rest::build_router(Arc::clone(&self.state));
        let make_service = router.into_make_service_with_connect_info::<SocketAddr>();
        let rate_limiter = Arc::clone(&self.state.rate_limiter);
        let listener = net::TimeoutListener::new(self.listener);

        axum::serve(listener, make_service)
            .with_graceful_shutdown(async move {
                shutdown_signal.await;
                rate_limiter.close();
                info!("shutdown signal received, draining in-flight requests");
            })
            .await
    }
}
