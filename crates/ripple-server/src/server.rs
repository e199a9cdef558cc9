use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures_util::{Stream, StreamExt};
use ripple_core::{DataStore, GLOBAL_SCOPE, ReactiveError};
use serde::Deserialize;
use serde_json::{Value, json};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::watch;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::{AppConfig, Fallback};
use crate::delivery::{DeliveryError, DeliveryManager, DeliveryMessage, PollResult, ResumeCursor};
use crate::metrics;
use crate::runtime::ReactiveRuntime;

const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);
const LAST_EVENT_ID: &str = "last-event-id";

/// Shared state of the HTTP handlers.
pub struct AppState<S: DataStore> {
    pub runtime: Arc<ReactiveRuntime<S>>,
}

impl<S: DataStore> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            runtime: self.runtime.clone(),
        }
    }
}

#[derive(Debug)]
pub enum ApiError {
    Function(ReactiveError),
    BadRequest(String),
    NotFound(String),
    Unavailable(&'static str),
}

impl From<ReactiveError> for ApiError {
    fn from(e: ReactiveError) -> Self {
        Self::Function(e)
    }
}

impl From<DeliveryError> for ApiError {
    fn from(e: DeliveryError) -> Self {
        Self::NotFound(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, category, message) = match self {
            Self::Function(e) => {
                let status = match &e {
                    ReactiveError::Validation(_) => StatusCode::BAD_REQUEST,
                    ReactiveError::NotFound(_) => StatusCode::NOT_FOUND,
                    ReactiveError::DuplicateName(_) => StatusCode::CONFLICT,
                    ReactiveError::Handler(_)
                    | ReactiveError::Store(_)
                    | ReactiveError::Definition(_)
                    | ReactiveError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                if status.is_server_error() {
                    tracing::error!(error = %e, category = %e.category(), "function call failed");
                }
                (status, e.category().to_string(), e.to_string())
            }
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "validation".to_string(), msg),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found".to_string(), msg),
            Self::Unavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "unavailable".to_string(),
                msg.to_string(),
            ),
        };

        (
            status,
            Json(json!({ "error": { "category": category, "message": message } })),
        )
            .into_response()
    }
}

pub fn build_app<S: DataStore>(runtime: Arc<ReactiveRuntime<S>>) -> Router {
    let body_limit = runtime.config().server.body_limit_bytes;
    let state = AppState { runtime };

    Router::new()
        .route("/health", get(health::<S>))
        .route("/metrics", get(metrics_handler))
        .route("/functions", get(list_functions::<S>))
        .route("/rpc/{name}", post(call_function::<S>))
        .route("/events", get(subscribe_events::<S>))
        .route("/events/ack", post(acknowledge_event::<S>))
        .route("/events/poll", get(poll_events::<S>))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    tracing::info_span!(
                        "http.request",
                        http.method = %req.method(),
                        http.target = %req.uri(),
                        http.status_code = tracing::field::Empty,
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>, latency: Duration, span: &tracing::Span| {
                        span.record(
                            "http.status_code",
                            tracing::field::display(res.status().as_u16()),
                        );
                        tracing::debug!(
                            http.status = %res.status().as_u16(),
                            elapsed_ms = %latency.as_millis(),
                            "request handled"
                        );
                    },
                ),
        )
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
}

async fn health<S: DataStore>(State(state): State<AppState<S>>) -> Json<Value> {
    let rt = &state.runtime;
    let realtime = &rt.config().realtime;
    Json(json!({
        "status": "ok",
        "functions": rt.registry().len(),
        "cacheProvider": rt.cache().results.provider().name(),
        "connections": rt.delivery().map_or(0, DeliveryManager::connection_count),
        "realtime": {
            "enabled": realtime.enabled,
            "transport": realtime.transport,
            "fallback": realtime.fallback,
            "acknowledgments": realtime.reliability.acknowledgments,
            "clientStore": rt.config().cache.client.provider,
        },
    }))
}

async fn metrics_handler() -> Response {
    match metrics::render_metrics() {
        Some(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        None => ApiError::Unavailable("metrics are not initialized").into_response(),
    }
}

async fn list_functions<S: DataStore>(State(state): State<AppState<S>>) -> Json<Value> {
    let registry = state.runtime.registry();
    Json(json!({
        "functions": registry.metadata(),
        "stats": registry.stats(),
    }))
}

async fn call_function<S: DataStore>(
    State(state): State<AppState<S>>,
    Path(name): Path<String>,
    Json(input): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let output = state.runtime.call(&name, input).await?;
    Ok(Json(output))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsQuery {
    pub organization_id: Option<String>,
    pub last_event_id: Option<String>,
    /// Unix milliseconds or RFC 3339
    pub since: Option<String>,
}

impl EventsQuery {
    fn organization(&self) -> String {
        self.organization_id
            .as_deref()
            .filter(|org| !org.is_empty())
            .unwrap_or(GLOBAL_SCOPE)
            .to_string()
    }

    /// The query's cursor, then the `Last-Event-ID` header.
    fn cursor(&self, headers: &HeaderMap) -> Result<Option<ResumeCursor>, ApiError> {
        let header_id = headers
            .get(LAST_EVENT_ID)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if let Some(id) = self
            .last_event_id
            .clone()
            .or(header_id)
            .filter(|id| !id.is_empty())
        {
            return Ok(Some(ResumeCursor::EventId(id)));
        }
        match self.since.as_deref() {
            Some(since) if !since.is_empty() => parse_since(since).map(|t| Some(ResumeCursor::Timestamp(t))),
            _ => Ok(None),
        }
    }
}

fn parse_since(since: &str) -> Result<OffsetDateTime, ApiError> {
    if let Ok(millis) = since.parse::<i64>() {
        return OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
            .map_err(|e| ApiError::BadRequest(format!("since out of range: {e}")));
    }
    OffsetDateTime::parse(since, &Rfc3339)
        .map_err(|_| ApiError::BadRequest("since must be unix milliseconds or RFC 3339".into()))
}

fn delivery<S: DataStore>(state: &AppState<S>) -> Result<&DeliveryManager, ApiError> {
    state
        .runtime
        .delivery()
        .ok_or(ApiError::Unavailable("realtime delivery is disabled"))
}

fn sse_event(message: DeliveryMessage, organization_id: &str) -> Result<Event, Infallible> {
    let event = match message {
        DeliveryMessage::Invalidation(event) => Event::default()
            .event("invalidation")
            .id(event.event_id.clone())
            .data(serde_json::to_string(&event).unwrap_or_default()),
        DeliveryMessage::Resync { reason } => Event::default()
            .event("resync")
            .data(json!({ "reason": reason }).to_string()),
        DeliveryMessage::Ready {
            connection_id,
            replayed,
        } => Event::default().event("ready").data(
            json!({
                "connectionId": connection_id,
                "organizationId": organization_id,
                "replayed": replayed,
            })
            .to_string(),
        ),
    };
    Ok(event)
}

async fn subscribe_events<S: DataStore>(
    State(state): State<AppState<S>>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let delivery = delivery(&state)?;
    let cursor = query.cursor(&headers)?;
    let organization_id = query.organization();

    let subscription = delivery.subscribe(&organization_id, cursor);
    let stream = subscription.map(move |message| sse_event(message, &organization_id));

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(SSE_KEEP_ALIVE)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckRequest {
    pub event_id: String,
    #[serde(default)]
    pub connection_id: Option<String>,
}

async fn acknowledge_event<S: DataStore>(
    State(state): State<AppState<S>>,
    Json(request): Json<AckRequest>,
) -> Result<Json<Value>, ApiError> {
    if request.event_id.is_empty() {
        return Err(ApiError::BadRequest("eventId must not be empty".into()));
    }
    let delivery = delivery(&state)?;
    let Some(connection_id) = request.connection_id.as_deref() else {
        let acknowledged = delivery.acknowledge(&request.event_id);
        return Ok(Json(json!({ "eventId": request.event_id, "acknowledged": acknowledged })));
    };
    let acknowledged = delivery.acknowledge_connection(connection_id, &request.event_id)?;
    Ok(Json(json!({
        "eventId": request.event_id,
        "acknowledged": usize::from(acknowledged),
        "connectionId": connection_id,
        "lastAcknowledgedEventId": delivery.last_acknowledged(connection_id),
    })))
}

async fn poll_events<S: DataStore>(
    State(state): State<AppState<S>>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> Result<Json<PollResult>, ApiError> {
    let delivery = delivery(&state)?;
    if state.runtime.config().realtime.fallback == Fallback::None {
        return Err(ApiError::Unavailable("polling fallback is disabled"));
    }
    // Without a cursor the caller only learns where to start from
    let cursor = query
        .cursor(&headers)?
        .unwrap_or_else(|| ResumeCursor::Timestamp(OffsetDateTime::now_utc()));
    Ok(Json(delivery.events_since(&query.organization(), &cursor)))
}

pub struct RippleServer<S: DataStore> {
    addr: SocketAddr,
    app: Router,
    runtime: Arc<ReactiveRuntime<S>>,
}

pub struct ServerBuilder<S: DataStore> {
    config: AppConfig,
    runtime: Option<Arc<ReactiveRuntime<S>>>,
}

impl<S: DataStore> Default for ServerBuilder<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: DataStore> ServerBuilder<S> {
    pub fn new() -> Self {
        Self {
            config: AppConfig::default(),
            runtime: None,
        }
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.config = cfg;
        self
    }

    pub fn with_runtime(mut self, runtime: Arc<ReactiveRuntime<S>>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn build(self) -> anyhow::Result<RippleServer<S>> {
        let runtime = self
            .runtime
            .ok_or_else(|| anyhow::anyhow!("a reactive runtime is required"))?;
        let addr = self.config.addr();
        Ok(RippleServer {
            addr,
            app: build_app(runtime.clone()),
            runtime,
        })
    }
}

impl<S: DataStore> RippleServer<S> {
    pub async fn run(self) -> anyhow::Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let background = self.runtime.spawn_background(shutdown_rx);

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);
        let served = axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await;

        let _ = shutdown_tx.send(true);
        for handle in background {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "background task ended abnormally");
            }
        }
        served?;
        Ok(())
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
