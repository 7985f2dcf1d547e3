use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, DefaultBodyLimit, Query, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use courier_shared::constants::MAX_FRAME_SIZE;
use courier_shared::{Identity, LocationId, MessageEnvelope};
use courier_store::KvStore;

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::hub::{HubHandle, LocationStats};
use crate::presence::PresenceTracker;
use crate::router::{DeliveryRouter, RouteOutcome};
use crate::session::{run_session, SessionContext};

#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    pub router: DeliveryRouter,
    pub presence: PresenceTracker,
    pub sessions: SessionContext,
    pub kv: Arc<dyn KvStore>,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws_upgrade))
        .route("/internal/route", post(route_message))
        .route("/presence", get(presence_status))
        .route("/hub/stats", get(hub_stats))
        .layer(DefaultBodyLimit::max(MAX_FRAME_SIZE))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    store: &'static str,
}

/// Identity and scope of a connection or presence lookup.
#[derive(Debug, Deserialize)]
struct ScopeQuery {
    location_id: Option<String>,
    user_id: Option<String>,
    contact_id: Option<String>,
}

impl ScopeQuery {
    fn location(&self) -> Result<LocationId, ServerError> {
        self.location_id
            .as_deref()
            .map(LocationId::from)
            .filter(|loc| !loc.is_empty())
            .ok_or_else(|| ServerError::BadRequest("location_id is required".into()))
    }
}

#[derive(Serialize)]
struct PresenceResponse {
    status: String,
}

#[derive(Serialize)]
struct HubStatsResponse {
    instance_id: uuid::Uuid,
    locations: Vec<LocationStats>,
}

async fn health_check(State(state): State<AppState>) -> Response {
    let (code, store) = match state.kv.ping().await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(e) => {
            debug!(error = %e, "Health check: store unreachable");
            (StatusCode::SERVICE_UNAVAILABLE, "unreachable")
        }
    };

    let body = HealthResponse {
        status: if code == StatusCode::OK { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        store,
    };
    (code, Json(body)).into_response()
}

async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<ScopeQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ServerError> {
    let location = query.location()?;
    let identity = Identity::from_parts(query.user_id.as_deref(), query.contact_id.as_deref())?;

    info!(identity = %identity, location = %location, "WebSocket upgrade");

    let ctx = state.sessions.clone();
    Ok(ws
        .max_message_size(MAX_FRAME_SIZE)
        .on_upgrade(move |socket| run_session(ctx, socket, identity, location)))
}

/// Entry point for the message API once a message is validated and stored.
async fn route_message(
    State(state): State<AppState>,
    Json(envelope): Json<MessageEnvelope>,
) -> Result<(StatusCode, Json<RouteOutcome>), ServerError> {
    let outcome = state.router.route(&envelope).await?;
    Ok((StatusCode::ACCEPTED, Json(outcome)))
}

async fn presence_status(
    State(state): State<AppState>,
    Query(query): Query<ScopeQuery>,
) -> Result<Json<PresenceResponse>, ServerError> {
    // Presence is per identity; the location only has to be present.
    query.location()?;
    let status = state
        .presence
        .status_of(query.user_id.as_deref(), query.contact_id.as_deref())
        .await?;
    Ok(Json(PresenceResponse {
        status: status.to_string(),
    }))
}

async fn hub_stats(State(state): State<AppState>) -> Result<Json<HubStatsResponse>, ServerError> {
    Ok(Json(HubStatsResponse {
        instance_id: state.config.instance_id,
        locations: state.hub.stats().await?,
    }))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
