//! PLC Broker API - HTTP interface to the broker
//!
//! Clients read cached tag values and submit writes over HTTP; they never
//! talk to a controller directly.
//!
//! # Endpoints
//!
//! - `GET /tags`: cached values of every enabled device, keyed by id
//! - `GET /tags/{device}`: all cached values of a device (`?tags=a,b` filter)
//! - `GET /tags/{device}/{tag}`: one cached value
//! - `POST /tags/{device}/{tag}`: write a value and wait for the controller
//! - `GET /health`, `GET /health/{device}`: device health
//! - `GET /devices`: configured devices and tags
//! - `GET /metrics`: Prometheus text exposition
//! - `GET /api-docs/openapi.json`: OpenAPI document
//!
//! # Example
//!
//! ```no_run
//! use plcbroker_api::{ApiState, Server, ServerConfig};
//! use plcbroker_core::config::AppConfig;
//! use plcbroker_driver::{simulated::SimulatedFactory, DriverRegistry};
//! use plcbroker_pool::Broker;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::from_file("config/plcbroker.yaml")?;
//!     let mut drivers = DriverRegistry::new();
//!     drivers.register("simulated", Arc::new(SimulatedFactory::new()));
//!
//!     let server_config = ServerConfig::from_api_config(&config.api)?;
//!     let broker = Arc::new(Broker::new(config, &drivers)?);
//!     broker.start();
//!
//!     Server::new(server_config, ApiState::new(broker))
//!         .run(plcbroker_api::shutdown_signal())
//!         .await
//! }
//! ```

pub mod middleware;
pub mod rest;
pub mod types;

pub use rest::{create_rest_router, ApiError, ApiState};

use middleware::{cors_layer, logging_middleware, request_id_middleware, timeout_middleware};
use plcbroker_core::config::ApiConfig;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::OpenApi;

// ============================================================================
// Server Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Server bind address
    pub bind_addr: SocketAddr,

    /// Allow cross-origin requests
    pub enable_cors: bool,

    /// Upper bound on request handling time
    pub request_timeout: Duration,

    /// Serve the OpenAPI document
    pub enable_openapi: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            enable_cors: true,
            request_timeout: Duration::from_secs(30),
            enable_openapi: true,
        }
    }
}

impl ServerConfig {
    pub fn from_api_config(api: &ApiConfig) -> anyhow::Result<Self> {
        let bind_addr = api.bind_address().parse()?;
        Ok(Self {
            bind_addr,
            enable_cors: api.cors,
            request_timeout: Duration::from_secs(api.request_timeout_secs),
            enable_openapi: true,
        })
    }
}

// ============================================================================
// OpenAPI Documentation
// ============================================================================

#[derive(OpenApi)]
#[openapi(
    info(
        title = "PLC Broker API",
        version = "0.1.0",
        description = "Cached tag reads and serialized writes for industrial controllers",
        license(
            name = "MIT OR Apache-2.0"
        )
    ),
    paths(
        rest::get_all_tags,
        rest::get_device_tags,
        rest::get_tag,
        rest::write_tag,
        rest::service_health,
        rest::device_health,
        rest::list_devices,
        rest::get_metrics,
    ),
    components(
        schemas(
            types::TagValueResponse,
            types::AllDeviceTags,
            types::WriteRequestBody,
            types::WriteResponse,
            types::DeviceHealthResponse,
            types::ServiceStatus,
            types::ServiceHealth,
            types::TagInfo,
            types::DeviceInfo,
            types::DeviceList,
            types::ErrorResponse,
        )
    ),
    tags(
        (name = "tags", description = "Tag reads and writes"),
        (name = "health", description = "Device health"),
        (name = "devices", description = "Configured devices"),
        (name = "metrics", description = "Prometheus metrics"),
    )
)]
struct ApiDoc;

/// The OpenAPI document for every route.
pub fn openapi() -> utoipa::openapi::OpenApi {
    ApiDoc::openapi()
}

// ============================================================================
// Router
// ============================================================================

/// Build the complete application router with middleware.
pub fn build_router(state: ApiState, config: &ServerConfig) -> axum::Router {
    let mut app = create_rest_router(state);

    if config.enable_openapi {
        let doc = openapi();
        app = app.route(
            "/api-docs/openapi.json",
            axum::routing::get(|| async move { axum::Json(doc) }),
        );
    }

    app = app.layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(axum::middleware::from_fn(request_id_middleware))
            .layer(axum::middleware::from_fn(logging_middleware))
            .layer(axum::middleware::from_fn_with_state(
                config.request_timeout,
                timeout_middleware,
            )),
    );

    if config.enable_cors {
        app = app.layer(cors_layer());
    }

    app
}

// ============================================================================
// Server
// ============================================================================

pub struct Server {
    config: ServerConfig,
    state: ApiState,
}

impl Server {
    pub fn new(config: ServerConfig, state: ApiState) -> Self {
        Self { config, state }
    }

    /// Serve until `shutdown` resolves, then finish in-flight requests.
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
        let app = build_router(self.state, &self.config);

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "Server listening");

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await?;

        info!("Server shutdown complete");
        Ok(())
    }
}

// ============================================================================
// Graceful Shutdown
// ============================================================================

/// Resolves on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl-C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
