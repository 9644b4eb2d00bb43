//! HTTP API: ticket intake, results, review, live updates, health and metrics

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use triage_lib::{
    health::{ComponentStatus, HealthRegistry},
    hub::BroadcastHub,
    ingest::{IngestError, TicketIngestor},
    review::{ReviewError, ReviewService},
    store::{StoreError, TicketStore},
    ReviewInput, Ticket, TicketStatus, TriageMetrics,
};
use uuid::Uuid;

const DEFAULT_LIST_LIMIT: usize = 20;
const MAX_LIST_LIMIT: usize = 200;

/// Shared application state
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub metrics: TriageMetrics,
    pub store: Arc<dyn TicketStore>,
    pub ingestor: TicketIngestor,
    pub reviews: ReviewService,
    pub hub: Arc<BroadcastHub>,
}

#[derive(Debug, Deserialize)]
pub struct CreateTicket {
    pub subject: String,
    pub description: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TicketAccepted {
    pub message: String,
    pub ticket_id: Uuid,
}

/// What a submitter polls for
#[derive(Debug, Serialize, Deserialize)]
pub struct TicketResult {
    pub ticket_id: Uuid,
    pub status: TicketStatus,
    pub predicted_category: Option<String>,
    pub predicted_priority: Option<String>,
    pub final_category: Option<String>,
    pub final_priority: Option<String>,
}

impl From<Ticket> for TicketResult {
    fn from(ticket: Ticket) -> Self {
        Self {
            ticket_id: ticket.ticket_id,
            status: ticket.status,
            predicted_category: ticket.predicted_category,
            predicted_priority: ticket.predicted_priority,
            final_category: ticket.final_category,
            final_priority: ticket.final_priority,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<usize>,
}

impl ListParams {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
    }
}

/// Error body is `{"detail": "..."}`
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Conflict(String),
    Unprocessable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::NotFound(d) => (StatusCode::NOT_FOUND, d),
            ApiError::Conflict(d) => (StatusCode::CONFLICT, d),
            ApiError::Unprocessable(d) => (StatusCode::UNPROCESSABLE_ENTITY, d),
            ApiError::Internal(d) => {
                error!(error = %d, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error".to_string())
            }
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => ApiError::NotFound(format!("Ticket {id} not found")),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<IngestError> for ApiError {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::EmptySubject => ApiError::Unprocessable(e.to_string()),
            IngestError::Queue(e) => {
                ApiError::Internal(format!("Failed to enqueue ticket for processing: {e}"))
            }
        }
    }
}

impl From<ReviewError> for ApiError {
    fn from(e: ReviewError) -> Self {
        match e {
            ReviewError::InvalidInput(_) => ApiError::Unprocessable(e.to_string()),
            ReviewError::NotFound(_) => ApiError::NotFound(e.to_string()),
            ReviewError::NotPendingReview { .. } => ApiError::Conflict(e.to_string()),
            ReviewError::Store(e) => ApiError::from(e),
        }
    }
}

async fn create_ticket(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateTicket>,
) -> Result<impl IntoResponse, ApiError> {
    let accepted = state.ingestor.submit(&body.subject, &body.description).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(TicketAccepted {
            message: "Ticket received for processing".to_string(),
            ticket_id: accepted.ticket_id,
        }),
    ))
}

async fn get_ticket(
    State(state): State<Arc<AppState>>,
    Path(ticket_id): Path<Uuid>,
) -> Result<Json<TicketResult>, ApiError> {
    let ticket = state
        .store
        .get_ticket(ticket_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Ticket {ticket_id} not found")))?;

    Ok(Json(ticket.into()))
}

async fn recent_tickets(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Ticket>>, ApiError> {
    Ok(Json(state.store.list_recent(params.limit()).await?))
}

async fn review_queue(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Ticket>>, ApiError> {
    Ok(Json(state.store.list_pending_review(params.limit()).await?))
}

async fn submit_review(
    State(state): State<Arc<AppState>>,
    Path(ticket_id): Path<Uuid>,
    Json(review): Json<ReviewInput>,
) -> Result<Json<Ticket>, ApiError> {
    let ticket = state
        .reviews
        .submit(ticket_id, &review.final_category, &review.final_priority)
        .await?;
    Ok(Json(ticket))
}

async fn stats(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.store.stats().await?))
}

async fn ticket_updates(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let hub = Arc::clone(&state.hub);
    ws.on_upgrade(move |socket| relay_updates(socket, hub))
}

/// Forward hub messages to one observer until either side goes away
async fn relay_updates(socket: WebSocket, hub: Arc<BroadcastHub>) {
    let mut connection = hub.connect().await;
    let (mut sender, mut receiver) = socket.split();
    debug!(connection = connection.id, "Observer connected");

    loop {
        tokio::select! {
            outgoing = connection.receiver.recv() => match outgoing {
                Some(update) => {
                    if sender.send(Message::Text(update)).await.is_err() {
                        break;
                    }
                }
                // The hub dropped this observer
                None => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                // Observers only listen
                Some(Ok(_)) => {}
            },
        }
    }

    hub.disconnect(connection.id).await;
    debug!(connection = connection.id, "Observer disconnected");
}

/// Health check response - returns 200 if healthy or degraded, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still operational
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Result<impl IntoResponse, ApiError> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok((
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    ))
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/tickets", post(create_ticket))
        .route("/tickets/recent", get(recent_tickets))
        .route("/tickets/:ticket_id", get(get_ticket))
        .route("/review-queue", get(review_queue))
        .route("/review/:ticket_id", post(submit_review))
        .route("/stats", get(stats))
        .route("/ws/ticket-updates", get(ticket_updates))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve the API until `cancel` fires
pub async fn serve(port: u16, state: Arc<AppState>, cancel: CancellationToken) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;

    Ok(())
}
