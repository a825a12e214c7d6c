//! Axum HTTP server for the gateway.
//!
//! Handles the bridge, approval and operator routes plus the embedded
//! approval page.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    middleware,
    response::{
        Html, IntoResponse,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{delete, get, post},
};
use tokio::sync::oneshot;
use tokio_stream::StreamExt;
use tower::ServiceBuilder;
use tower_http::cors::{AllowHeaders, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::broker::{ApprovalScreen, Broker, DecisionOutcome, Origin, RequestKind, WindowId};
use crate::db::WindowClosed;
use crate::error::{BridgeRejection, BrokerError, GatewayError};
use crate::gateway::auth::{AuthState, auth_middleware};
use crate::gateway::rate_limit::RateLimiter;
use crate::gateway::types::*;

const APPROVE_PAGE: &str = include_str!("static/approve.html");

/// Shared state for all gateway handlers.
pub struct GatewayState {
    pub broker: Broker,
    /// Bridge calls allowed per origin per minute.
    pub bridge_rate_limiter: RateLimiter,
    /// Shutdown signal sender.
    pub shutdown_tx: tokio::sync::RwLock<Option<oneshot::Sender<()>>>,
}

impl GatewayState {
    pub fn new(broker: Broker, bridge_rate_limit: u64) -> Self {
        Self {
            broker,
            bridge_rate_limiter: RateLimiter::new(bridge_rate_limit, Duration::from_secs(60)),
            shutdown_tx: tokio::sync::RwLock::new(None),
        }
    }

    /// Stop the server started by [`start_server`]. No-op if it never started.
    pub async fn shutdown(&self) {
        if let Some(tx) = self.shutdown_tx.write().await.take() {
            let _ = tx.send(());
        }
    }
}

/// Bind `addr` and serve in the background.
///
/// Returns the bound address, which differs from `addr` when port 0 was
/// requested.
pub async fn start_server(
    addr: SocketAddr,
    state: Arc<GatewayState>,
    auth_token: String,
) -> Result<SocketAddr, GatewayError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| GatewayError::StartupFailed {
            name: "gateway".to_string(),
            reason: format!("Failed to bind {addr}: {e}"),
        })?;
    let bound_addr = listener
        .local_addr()
        .map_err(|e| GatewayError::StartupFailed {
            name: "gateway".to_string(),
            reason: format!("no local address: {e}"),
        })?;

    let auth_state = AuthState { token: auth_token };

    // Bridge routes are called from arbitrary websites. The caller is
    // identified by its Origin header, not by a token.
    let bridge = Router::new()
        .route("/bridge/rpc", post(bridge_rpc_handler))
        .route("/bridge/events", get(bridge_events_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(AllowHeaders::list([header::CONTENT_TYPE])),
        );

    // Public routes (no auth)
    let public = Router::new().route("/api/health", get(health_handler));

    // Approval surface and operator API (always require auth)
    let protected = Router::new()
        .route("/approve", get(approve_page_handler))
        .route("/approval/{kind}", get(approval_load_handler))
        .route("/approval/{kind}/decision", post(approval_decision_handler))
        .route(
            "/approval/windows/{window_id}/closed",
            post(approval_window_closed_handler),
        )
        .route("/api/sites", get(sites_list_handler))
        .route("/api/sites/{origin}", delete(sites_revoke_handler))
        .route("/api/pending", get(pending_list_handler))
        .route_layer(middleware::from_fn_with_state(
            auth_state.clone(),
            auth_middleware,
        ));

    // Everything but the bridge is same-origin only.
    let own_origins: Vec<HeaderValue> = [
        format!("http://{}:{}", bound_addr.ip(), bound_addr.port()),
        format!("http://localhost:{}", bound_addr.port()),
    ]
    .iter()
    .filter_map(|o| HeaderValue::from_str(o).ok())
    .collect();
    let protected = protected.layer(
        CorsLayer::new()
            .allow_origin(own_origins)
            .allow_methods([Method::GET, Method::POST, Method::DELETE])
            .allow_headers(AllowHeaders::list([
                header::CONTENT_TYPE,
                header::AUTHORIZATION,
            ])),
    );

    let app = Router::new()
        .merge(bridge)
        .merge(public)
        .merge(protected)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(DefaultBodyLimit::max(64 * 1024)),
        )
        .with_state(state.clone());

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    *state.shutdown_tx.write().await = Some(shutdown_tx);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                tracing::info!("Gateway shutting down");
            })
            .await
        {
            tracing::error!("Gateway server error: {}", e);
        }
    });

    tracing::info!(addr = %bound_addr, "Gateway listening");
    Ok(bound_addr)
}

// --- Health ---

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// --- Bridge handlers ---

/// Origin of the calling page, taken from the transport only.
fn caller_origin(headers: &HeaderMap) -> Result<Origin, BridgeRejection> {
    let raw = headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| BridgeRejection::new("invalid_origin", false, "Origin header required"))?;
    Origin::parse(raw).map_err(|e| BridgeRejection::new("invalid_origin", false, e.to_string()))
}

async fn bridge_rpc_handler(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Json(call): Json<BridgeCall>,
) -> (StatusCode, Json<BridgeReply>) {
    let origin = match caller_origin(&headers) {
        Ok(origin) => origin,
        Err(rejection) => {
            return (StatusCode::FORBIDDEN, Json(BridgeReply::err(call.id, rejection)));
        }
    };

    if !state.bridge_rate_limiter.check(&origin) {
        tracing::warn!(%origin, method = %call.method, "Bridge call rate limited");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(BridgeReply::err(
                call.id,
                BridgeRejection::new("rate_limited", true, "Too many requests. Try again later."),
            )),
        );
    }

    let reply = match state
        .broker
        .ingress
        .dispatch(&call.method, &call.params, &origin, call.tab_id)
        .await
    {
        Ok(result) => BridgeReply::ok(call.id, result),
        Err(e) => BridgeReply::err(call.id, e.to_rejection()),
    };
    (StatusCode::OK, Json(reply))
}

async fn bridge_events_handler(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Query(query): Query<EventsQuery>,
) -> Result<
    Sse<impl futures::Stream<Item = Result<Event, Infallible>> + Send + 'static>,
    (StatusCode, String),
> {
    let origin =
        caller_origin(&headers).map_err(|rejection| (StatusCode::FORBIDDEN, rejection.message))?;
    let tab_id = query.tab_id;
    tracing::debug!(%origin, tab_id, "Tab subscribed to bridge events");

    let rx = state.broker.notifier.subscribe();
    let stream = tokio_stream::wrappers::BroadcastStream::new(rx)
        .filter_map(move |result| result.ok().filter(|event| event.is_for(&origin, tab_id)))
        .map(|event| {
            let data = serde_json::to_string(&event.event).unwrap_or_default();
            Ok::<_, Infallible>(Event::default().event("tab_event").data(data))
        });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(30))
            .text(""),
    ))
}

// --- Approval surface handlers ---

async fn approve_page_handler() -> impl IntoResponse {
    (
        [(header::CACHE_CONTROL, "no-store, max-age=0")],
        Html(APPROVE_PAGE),
    )
}

fn parse_kind(raw: &str) -> Result<RequestKind, (StatusCode, String)> {
    raw.parse().map_err(|e: String| (StatusCode::BAD_REQUEST, e))
}

fn broker_failure(e: BrokerError) -> (StatusCode, String) {
    tracing::error!(error = e.label(), "Gateway request failed: {}", e);
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

fn parse_window_id(raw: &str) -> Result<WindowId, (StatusCode, String)> {
    raw.parse()
        .map_err(|_| (StatusCode::BAD_REQUEST, format!("invalid window id: {raw}")))
}

async fn approval_load_handler(
    State(state): State<Arc<GatewayState>>,
    Path(kind): Path<String>,
    Query(query): Query<ApprovalLoadQuery>,
) -> Result<Json<ApprovalScreen>, (StatusCode, String)> {
    let kind = parse_kind(&kind)?;
    let controller = &state.broker.controller;
    let screen = match query.window_id.as_deref() {
        Some(raw) => controller.load_for_window(kind, parse_window_id(raw)?).await,
        None => controller.load(kind).await,
    }
    .map_err(broker_failure)?;
    Ok(Json(screen))
}

async fn approval_decision_handler(
    State(state): State<Arc<GatewayState>>,
    Path(kind): Path<String>,
    Json(body): Json<DecisionRequest>,
) -> Result<Json<DecisionOutcome>, (StatusCode, String)> {
    let kind = parse_kind(&kind)?;
    let outcome = state
        .broker
        .controller
        .decide(kind, body.request_id, body.decision)
        .await
        .map_err(broker_failure)?;
    Ok(Json(outcome))
}

async fn approval_window_closed_handler(
    State(state): State<Arc<GatewayState>>,
    Path(window_id): Path<String>,
) -> Result<Json<WindowClosedResponse>, (StatusCode, String)> {
    let window_id = parse_window_id(&window_id)?;
    let status = match state
        .broker
        .windows
        .on_closed(window_id)
        .await
        .map_err(broker_failure)?
    {
        WindowClosed::Abandoned(_) => "abandoned",
        WindowClosed::AlreadySettled(_) => "already_settled",
        WindowClosed::Unknown => "unknown",
    };
    Ok(Json(WindowClosedResponse { status }))
}

// --- Operator handlers ---

async fn sites_list_handler(
    State(state): State<Arc<GatewayState>>,
) -> Result<Json<SitesResponse>, (StatusCode, String)> {
    let sites = state.broker.registry.list().await.map_err(broker_failure)?;
    Ok(Json(SitesResponse { sites }))
}

async fn sites_revoke_handler(
    State(state): State<Arc<GatewayState>>,
    Path(origin): Path<String>,
) -> Result<Json<RevokeResponse>, (StatusCode, String)> {
    let origin = Origin::parse(&origin).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    let removed = state
        .broker
        .revoke_site(&origin)
        .await
        .map_err(broker_failure)?;
    if !removed {
        return Err((StatusCode::NOT_FOUND, format!("{origin} is not connected")));
    }
    tracing::info!(%origin, "Site revoked by operator");
    Ok(Json(RevokeResponse {
        origin: origin.to_string(),
        removed,
    }))
}

async fn pending_list_handler(
    State(state): State<Arc<GatewayState>>,
) -> Result<Json<PendingResponse>, (StatusCode, String)> {
    let pending = state.broker.pending.list().await.map_err(broker_failure)?;
    Ok(Json(PendingResponse { pending }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_origin_requires_a_web_origin() {
        let mut headers = HeaderMap::new();
        assert_eq!(caller_origin(&headers).unwrap_err().code, "invalid_origin");

        headers.insert(header::ORIGIN, HeaderValue::from_static("null"));
        assert!(caller_origin(&headers).is_err());

        headers.insert(header::ORIGIN, HeaderValue::from_static("https://App.Example.com:443"));
        assert_eq!(caller_origin(&headers).unwrap().as_str(), "https://app.example.com");
    }

    #[test]
    fn approve_page_reports_closure() {
        assert!(APPROVE_PAGE.contains("sendBeacon"));
        assert!(APPROVE_PAGE.contains("/closed"));
    }
}
