//! Router assembly: middleware chain + route table (spec §4.2, §4.5, §4.6).

pub mod dto;
pub mod error;
mod handlers;
mod middleware;

use std::sync::Arc;
use std::time::Duration;

use axum::error_handling::HandleErrorLayer;
use axum::http::{HeaderName, Method, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use tokio::sync::Mutex as AsyncMutex;
use tower::{BoxError, ServiceBuilder};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub use error::ApiError;

use crate::config::{AccountEntry, Config, CorsConfig};
use crate::rate_limit::RateLimiter;
use crate::scheduler::Scheduler;
use crate::store::MessageStore;

/// Shared state reachable from every handler and both middleware layers.
pub struct AppState {
    pub store: Arc<dyn MessageStore>,
    pub scheduler: Scheduler,
    pub config: Config,
    /// The account list's single source of truth in memory; `config.accounts`
    /// is only the snapshot loaded at startup (spec §5: "the configuration
    /// object is treated as immutable after startup except for the account
    /// list, which is guarded by the server's configuration lock").
    pub accounts: AsyncMutex<Vec<AccountEntry>>,
    pub rate_limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn MessageStore>,
        scheduler: Scheduler,
        config: Config,
        rate_limiter: Arc<RateLimiter>,
    ) -> Self {
        let accounts = AsyncMutex::new(config.accounts.clone());
        Self {
            store,
            scheduler,
            config,
            accounts,
            rate_limiter,
        }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/stats", get(handlers::get_stats))
        .route("/messages", get(handlers::list_messages))
        .route("/messages/{id}", get(handlers::get_message))
        .route("/search", get(handlers::search_messages))
        .route(
            "/accounts",
            get(handlers::list_accounts).post(handlers::add_account),
        )
        .route("/sync/{account}", post(handlers::trigger_sync))
        .route("/scheduler/status", get(handlers::scheduler_status))
        .route("/auth/token/{email}", post(handlers::upload_token))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            middleware::auth_middleware,
        ));

    let cors = build_cors_layer(&state.config.cors);

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api/v1", api)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(TraceLayer::new_for_http())
                .layer(CatchPanicLayer::new())
                .layer(HandleErrorLayer::new(handle_timeout_error))
                .layer(TimeoutLayer::new(Duration::from_secs(60)))
                .option_layer(cors)
                .layer(axum::middleware::from_fn_with_state(
                    Arc::clone(&state),
                    middleware::rate_limit_middleware,
                )),
        )
        .with_state(state)
}

async fn handle_timeout_error(err: BoxError) -> (StatusCode, axum::Json<dto::ErrorResponse>) {
    tracing::error!(error = %err, "request exceeded timeout");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        axum::Json(dto::ErrorResponse {
            error: "internal_error".to_string(),
            message: None,
        }),
    )
}

/// `None` (CORS disabled, no headers emitted) when `allowed_origins` is
/// empty. Never reflects a literal `"*"` back to the client (Open Question
/// (b)): a configured wildcard is implemented as an origin predicate that
/// matches anything, so `tower_http` echoes the caller's actual `Origin`.
fn build_cors_layer(cfg: &CorsConfig) -> Option<CorsLayer> {
    if cfg.allowed_origins.is_empty() {
        return None;
    }

    let origins = cfg.allowed_origins.clone();
    let wildcard = origins.iter().any(|o| o == "*");
    let allow_origin = AllowOrigin::predicate(move |origin, _parts| {
        wildcard || origins.iter().any(|o| o.as_bytes() == origin.as_bytes())
    });

    let methods: Vec<Method> = if cfg.allowed_methods.is_empty() {
        vec![Method::GET, Method::POST, Method::OPTIONS]
    } else {
        cfg.allowed_methods
            .iter()
            .filter_map(|m| Method::from_bytes(m.as_bytes()).ok())
            .collect()
    };

    let mut layer = CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(methods)
        .max_age(Duration::from_secs(cfg.max_age_secs));

    layer = if cfg.allowed_headers.is_empty() {
        layer.allow_headers(AllowHeaders::mirror_request())
    } else {
        let headers: Vec<HeaderName> = cfg
            .allowed_headers
            .iter()
            .filter_map(|h| HeaderName::from_bytes(h.as_bytes()).ok())
            .collect();
        layer.allow_headers(headers)
    };

    if cfg.allow_credentials {
        layer = layer.allow_credentials(true);
    }

    Some(layer)
}
