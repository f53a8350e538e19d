//! Server crate provides the HTTP boundary of the order core.
//!
//! Identity comes from the `X-User-Id` header, which the upstream auth proxy
//! sets after authenticating the session; this crate never authenticates.
//!
//! | route | operation |
//! |-------|-----------|
//! | `POST /api/orders` | place an order |
//! | `GET /api/orders` | the caller's orders with their items |
//! | `GET /api/addresses` | the caller's addresses |
//! | `POST /api/addresses` | create an address |
//! | `GET /api/addresses/default` | address checkout preselects |
//! | `PUT /api/addresses/{id}/primary` | make an address primary |
//! | `GET /health`, `GET /metrics` | liveness and Prometheus metrics |

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{
        FromRequestParts, MatchedPath, Path, State,
        rejection::{JsonRejection, PathRejection},
    },
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use model::{AddressId, NewAddress, OrderRequest, PlacedOrder, UserId};
use prometheus::{CounterVec, HistogramOpts, HistogramVec, Opts, Registry};
use serde::Serialize;
use serde_json::json;
use service::{AddressService, OrderService, ServiceError};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

/// Header carrying the authenticated user id.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Server represents the HTTP server for checkout and address management.
pub struct Server {
    port: u16,
    orders: Arc<dyn OrderService>,
    addresses: Arc<dyn AddressService>,
    metrics: Arc<Metrics>,
}

/// Metrics collects and exposes HTTP server metrics.
struct Metrics {
    registry: Registry,
    http_requests_total: CounterVec,
    http_request_duration_seconds: HistogramVec,
    errors_total: CounterVec,
    orders_total: CounterVec,
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();

        let http_requests_total = CounterVec::new(
            Opts::new("http_requests_total", "Total number of HTTP requests"),
            &["method", "endpoint", "status"],
        )
        .expect("Failed to create http_requests_total metric");

        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "HTTP request duration in seconds",
            ),
            &["method", "endpoint"],
        )
        .expect("Failed to create http_request_duration_seconds metric");

        let errors_total = CounterVec::new(
            Opts::new("errors_total", "Total number of errors"),
            &["source", "endpoint"],
        )
        .expect("Failed to create errors_total metric");

        let orders_total = CounterVec::new(
            Opts::new("orders_total", "Order placement attempts by outcome"),
            &["outcome"],
        )
        .expect("Failed to create orders_total metric");

        registry
            .register(Box::new(http_requests_total.clone()))
            .expect("Failed to register http_requests_total metric");
        registry
            .register(Box::new(http_request_duration_seconds.clone()))
            .expect("Failed to register http_request_duration_seconds metric");
        registry
            .register(Box::new(errors_total.clone()))
            .expect("Failed to register errors_total metric");
        registry
            .register(Box::new(orders_total.clone()))
            .expect("Failed to register orders_total metric");

        Self {
            registry,
            http_requests_total,
            http_request_duration_seconds,
            errors_total,
            orders_total,
        }
    }

    fn record_request(&self, method: &str, endpoint: &str, status: u16, duration: Duration) {
        self.http_requests_total
            .with_label_values(&[method, endpoint, &status.to_string()])
            .inc();
        self.http_request_duration_seconds
            .with_label_values(&[method, endpoint])
            .observe(duration.as_secs_f64());
    }

    fn record_error(&self, source: &str, endpoint: &str) {
        self.errors_total
            .with_label_values(&[source, endpoint])
            .inc();
    }

    fn record_order(&self, outcome: &str) {
        self.orders_total.with_label_values(&[outcome]).inc();
    }
}

/// Application state shared between request handlers
#[derive(Clone)]
struct AppState {
    orders: Arc<dyn OrderService>,
    addresses: Arc<dyn AddressService>,
    metrics: Arc<Metrics>,
}

/// A [`ServiceError`] rendered as an HTTP response.
///
/// Internal failures get a generic message; the cause is only logged.
struct ApiError(ServiceError);

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn outcome(&self) -> &'static str {
        match self.0 {
            ServiceError::InvalidRequest(_) => "invalid_request",
            ServiceError::AddressNotFound => "address_not_found",
            ServiceError::Persistence(_) => "persistence_failure",
            ServiceError::PrimaryInvariantViolation { .. } => "integrity_failure",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            ServiceError::InvalidRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ServiceError::AddressNotFound => (StatusCode::NOT_FOUND, self.0.to_string()),
            ServiceError::Persistence(_) | ServiceError::PrimaryInvariantViolation { .. } => {
                error!(error = %self.0, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(json!({ "message": message }))).into_response()
    }
}

/// The caller's identity, taken from [`USER_ID_HEADER`].
struct Identity(UserId);

impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| UserId::new(v.trim()))
            .filter(|user_id| !user_id.is_blank())
            .map(Identity)
            .ok_or_else(|| ApiError(ServiceError::InvalidRequest("Missing userID".into())))
    }
}

/// Unreadable bodies are answered like any other invalid request.
fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| ApiError(ServiceError::InvalidRequest(rejection.body_text())))
}

fn path_param<T>(param: Result<Path<T>, PathRejection>) -> Result<T, ApiError> {
    param
        .map(|Path(value)| value)
        .map_err(|rejection| ApiError(ServiceError::InvalidRequest(rejection.body_text())))
}

#[derive(Serialize)]
struct OrderPlacedResponse {
    message: &'static str,
    #[serde(flatten)]
    placed: PlacedOrder,
}

impl Server {
    /// Creates a new Server instance.
    ///
    /// # Arguments
    ///
    /// * `port` - The port on which the server will listen
    /// * `orders` - Checkout operations
    /// * `addresses` - Address-management operations
    pub fn new(
        port: u16,
        orders: Arc<dyn OrderService>,
        addresses: Arc<dyn AddressService>,
    ) -> Self {
        info!("Initializing HTTP server on port {}", port);

        Self {
            port,
            orders,
            addresses,
            metrics: Arc::new(Metrics::new()),
        }
    }

    /// Serves until Ctrl+C/SIGTERM, then drains in-flight requests for at
    /// most `shutdown_timeout`.
    pub async fn start(&self, shutdown_timeout: Duration) -> Result<()> {
        let app = self.router();

        let listener = TcpListener::bind(("0.0.0.0", self.port))
            .await
            .context("Failed to bind to port")?;

        info!("HTTP server listening on port {}", self.port);

        let (signalled_tx, signalled_rx) = oneshot::channel::<()>();
        let serve = async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown_signal().await;
                    let _ = signalled_tx.send(());
                })
                .await
        };
        let deadline = async move {
            if signalled_rx.await.is_ok() {
                tokio::time::sleep(shutdown_timeout).await;
            } else {
                std::future::pending::<()>().await;
            }
        };

        tokio::select! {
            res = serve => {
                res.context("Server error")?;
                info!("HTTP server shut down gracefully");
            }
            _ = deadline => {
                warn!(?shutdown_timeout, "graceful shutdown timed out, dropping open connections");
            }
        }
        Ok(())
    }

    /// Builds the router with all routes and the metrics middleware.
    pub fn router(&self) -> Router {
        let metrics = self.metrics.clone();

        Router::new()
            .route("/api/orders", post(Self::handle_place_order).get(Self::handle_get_orders))
            .route(
                "/api/addresses",
                get(Self::handle_get_addresses).post(Self::handle_create_address),
            )
            .route("/api/addresses/default", get(Self::handle_default_address))
            .route("/api/addresses/{address_id}/primary", put(Self::handle_set_primary))
            .route("/health", get(Self::handle_health))
            .route("/metrics", get(Self::handle_metrics))
            .layer(axum::middleware::from_fn_with_state(
                metrics.clone(),
                Self::metrics_middleware,
            ))
            .with_state(AppState {
                orders: self.orders.clone(),
                addresses: self.addresses.clone(),
                metrics,
            })
    }

    /// Middleware for collecting metrics on HTTP requests
    async fn metrics_middleware(
        State(metrics): State<Arc<Metrics>>,
        req: axum::extract::Request,
        next: axum::middleware::Next,
    ) -> Response {
        let method = req.method().to_string();
        // Route templates keep label cardinality bounded.
        let endpoint = req
            .extensions()
            .get::<MatchedPath>()
            .map(|path| path.as_str().to_owned())
            .unwrap_or_else(|| req.uri().path().to_owned());

        let start = Instant::now();
        let response = next.run(req).await;
        let status = response.status().as_u16();

        metrics.record_request(&method, &endpoint, status, start.elapsed());
        if status >= 400 {
            metrics.record_error("http", &endpoint);
        }

        response
    }

    async fn handle_place_order(
        State(state): State<AppState>,
        Identity(user_id): Identity,
        payload: Result<Json<OrderRequest>, JsonRejection>,
    ) -> Result<Response, ApiError> {
        info!(%user_id, "Received order placement request");
        let request = json_body(payload)?;

        match state.orders.place_order(&user_id, request).await {
            Ok(placed) => {
                state.metrics.record_order("placed");
                let body = OrderPlacedResponse {
                    message: "Order placed successfully",
                    placed,
                };
                Ok((StatusCode::CREATED, Json(body)).into_response())
            }
            Err(err) => {
                let err = ApiError(err);
                state.metrics.record_order(err.outcome());
                warn!(%user_id, error = %err.0, "Order placement rejected");
                Err(err)
            }
        }
    }

    async fn handle_get_orders(
        State(state): State<AppState>,
        Identity(user_id): Identity,
    ) -> Result<Response, ApiError> {
        let orders = state.orders.orders_for_user(&user_id).await?;
        Ok(Json(orders).into_response())
    }

    async fn handle_get_addresses(
        State(state): State<AppState>,
        Identity(user_id): Identity,
    ) -> Result<Response, ApiError> {
        let addresses = state.addresses.list_addresses(&user_id).await?;
        Ok(Json(addresses).into_response())
    }

    async fn handle_create_address(
        State(state): State<AppState>,
        Identity(user_id): Identity,
        payload: Result<Json<NewAddress>, JsonRejection>,
    ) -> Result<Response, ApiError> {
        let address = json_body(payload)?;
        let created = state.addresses.create_address(&user_id, address).await?;
        Ok((
            StatusCode::CREATED,
            Json(json!({ "addressID": created.address_id })),
        )
            .into_response())
    }

    async fn handle_default_address(
        State(state): State<AppState>,
        Identity(user_id): Identity,
    ) -> Result<Response, ApiError> {
        match state.addresses.default_address(&user_id).await? {
            Some(address) => Ok(Json(address).into_response()),
            None => Ok((
                StatusCode::NOT_FOUND,
                Json(json!({ "message": "No address on file" })),
            )
                .into_response()),
        }
    }

    async fn handle_set_primary(
        State(state): State<AppState>,
        Identity(user_id): Identity,
        address_id: Result<Path<i64>, PathRejection>,
    ) -> Result<StatusCode, ApiError> {
        let address_id = path_param(address_id)?;
        state
            .addresses
            .set_primary(&user_id, AddressId(address_id))
            .await?;
        Ok(StatusCode::NO_CONTENT)
    }

    async fn handle_health() -> &'static str {
        "OK"
    }

    async fn handle_metrics(State(state): State<AppState>) -> Response {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();

        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&state.metrics.registry.gather(), &mut buffer) {
            error!("Failed to encode metrics: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response();
        }

        match String::from_utf8(buffer) {
            Ok(metrics_text) => (StatusCode::OK, metrics_text).into_response(),
            Err(e) => {
                error!("Failed to convert metrics to UTF-8: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Invalid metrics data").into_response()
            }
        }
    }
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!("Failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
