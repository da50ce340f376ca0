use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        DefaultBodyLimit, Path, Query, State,
    },
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use parley_shared::{
    CallError, CallId, EventStream, JoinResponse, RoomId, RoomSnapshot, SignalingMessage, UserId,
};

use crate::config::ServerConfig;
use crate::coordinator::Coordinator;
use crate::error::ServerError;
use crate::recording_store::RecordingStore;

/// Event streams handed out by REST joins, waiting for their WebSocket.
/// Entries older than the liveness window are dropped on the next join.
type PendingStreams = Arc<Mutex<HashMap<(CallId, UserId), (Instant, EventStream)>>>;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Coordinator,
    pub recordings: Arc<RecordingStore>,
    pub config: Arc<ServerConfig>,
    pending: PendingStreams,
}

impl AppState {
    pub fn new(coordinator: Coordinator, recordings: RecordingStore, config: ServerConfig) -> Self {
        Self {
            coordinator,
            recordings: Arc::new(recordings),
            config: Arc::new(config),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/v1/rooms", post(open_room))
        .route("/v1/rooms/:room_id", get(room_snapshot))
        .route("/v1/rooms/:room_id/join", post(join_room))
        .route("/v1/calls/:call_id/leave", post(leave_call))
        .route("/v1/calls/:call_id/end", post(end_call))
        .route("/v1/calls/:call_id/signal", get(signal_socket))
        .route(
            "/v1/recordings/:call_id",
            put(upload_recording).get(download_recording),
        )
        .layer(DefaultBodyLimit::max(state.config.max_recording_size))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    rooms: usize,
}

#[derive(Deserialize)]
struct OpenRoomRequest {
    room_id: String,
}

#[derive(Serialize)]
struct OpenRoomResponse {
    room_id: RoomId,
    created: bool,
}

#[derive(Deserialize)]
struct UserRequest {
    user_id: String,
}

#[derive(Deserialize)]
struct SignalQuery {
    user_id: String,
}

#[derive(Deserialize)]
struct UploadQuery {
    /// Start of the uploaded segment, in milliseconds from the call start.
    #[serde(default)]
    offset_ms: u64,
}

#[derive(Serialize, Deserialize)]
pub struct UploadResponse {
    pub location: String,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        rooms: state.coordinator.list_rooms().await.len(),
    })
}

async fn open_room(
    State(state): State<AppState>,
    Json(req): Json<OpenRoomRequest>,
) -> Result<(StatusCode, Json<OpenRoomResponse>), ServerError> {
    let room_id = req.room_id.trim();
    if room_id.is_empty() {
        return Err(ServerError::BadRequest("room_id must not be empty".into()));
    }
    let room_id = RoomId::new(room_id);
    let created = state.coordinator.open_room(room_id.clone()).await;
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(OpenRoomResponse { room_id, created })))
}

async fn room_snapshot(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Result<Json<RoomSnapshot>, ServerError> {
    let snapshot = state.coordinator.snapshot(&RoomId::new(room_id)).await?;
    Ok(Json(snapshot))
}

async fn join_room(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Json(req): Json<UserRequest>,
) -> Result<Json<JoinResponse>, ServerError> {
    let user_id = parse_user(req.user_id)?;
    let room_id = RoomId::new(room_id);
    let (response, events) = state.coordinator.join(&room_id, &user_id).await?;

    let now = Instant::now();
    let mut pending = state.pending.lock().await;
    expire_pending(&mut pending, now, state.config.heartbeat_timeout);
    pending.insert((response.call_id, user_id.clone()), (now, events));
    drop(pending);

    info!(room = %room_id, call = %response.call_id, peer = %user_id, "Joined via API");
    Ok(Json(response))
}

/// Forget streams whose socket never arrived. The coordinator has removed
/// those users for silence by now.
fn expire_pending(
    pending: &mut HashMap<(CallId, UserId), (Instant, EventStream)>,
    now: Instant,
    ttl: Duration,
) {
    pending.retain(|(call_id, user_id), (joined_at, _)| {
        let keep = now.saturating_duration_since(*joined_at) <= ttl;
        if !keep {
            debug!(call = %call_id, peer = %user_id, "Signaling socket never opened, dropping stream");
        }
        keep
    });
}

async fn leave_call(
    State(state): State<AppState>,
    Path(call_id): Path<Uuid>,
    Json(req): Json<UserRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let user_id = parse_user(req.user_id)?;
    let call_id = CallId(call_id);
    state.coordinator.leave(&call_id, &user_id).await?;
    state.pending.lock().await.remove(&(call_id, user_id));
    Ok(Json(serde_json::json!({ "left": true })))
}

async fn end_call(
    State(state): State<AppState>,
    Path(call_id): Path<Uuid>,
    Json(req): Json<UserRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let user_id = parse_user(req.user_id)?;
    let call_id = CallId(call_id);
    state.coordinator.end(&call_id, &user_id).await?;
    state.pending.lock().await.retain(|(call, _), _| *call != call_id);
    Ok(Json(serde_json::json!({ "ended": true })))
}

async fn upload_recording(
    State(state): State<AppState>,
    Path(call_id): Path<Uuid>,
    Query(query): Query<UploadQuery>,
    body: Bytes,
) -> Result<Json<UploadResponse>, ServerError> {
    let call_id = CallId(call_id);
    if state.coordinator.room_of(&call_id).await.is_none() {
        return Err(CallError::CallNotFound(call_id).into());
    }
    let offset = Duration::from_millis(query.offset_ms);
    let location = state.recordings.put(&call_id, offset, &body).await?;
    info!(
        call = %call_id,
        offset_ms = query.offset_ms,
        size = body.len(),
        "Recording segment uploaded via API"
    );
    Ok(Json(UploadResponse { location }))
}

async fn download_recording(
    State(state): State<AppState>,
    Path(call_id): Path<Uuid>,
) -> Result<Response, ServerError> {
    let data = state.recordings.get(&CallId(call_id)).await?;
    Ok(([(header::CONTENT_TYPE, "audio/wav")], data).into_response())
}

fn parse_user(raw: String) -> Result<UserId, ServerError> {
    if raw.trim().is_empty() {
        return Err(ServerError::BadRequest("user_id must not be empty".into()));
    }
    Ok(UserId::new(raw))
}

// ---------------------------------------------------------------------------
// Signaling channel
// ---------------------------------------------------------------------------

async fn signal_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(call_id): Path<Uuid>,
    Query(query): Query<SignalQuery>,
) -> Result<Response, ServerError> {
    let call_id = CallId(call_id);
    let user_id = parse_user(query.user_id)?;
    let events = state
        .pending
        .lock()
        .await
        .remove(&(call_id, user_id.clone()))
        .map(|(_, events)| events)
        .ok_or_else(|| CallError::NotAParticipant(user_id.clone()))?;

    let coordinator = state.coordinator.clone();
    Ok(ws.on_upgrade(move |socket| {
        run_signal_socket(socket, coordinator, call_id, user_id, events)
    }))
}

/// Pump one participant's WebSocket: coordinator events out, envelopes in.
/// The socket closes once the coordinator drops the participant's stream.
async fn run_signal_socket(
    socket: WebSocket,
    coordinator: Coordinator,
    call_id: CallId,
    user_id: UserId,
    mut events: EventStream,
) {
    let (mut sink, mut stream) = socket.split();
    debug!(call = %call_id, peer = %user_id, "Signaling channel open");

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                };
                let text = match event.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode server event");
                        continue;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if !relay_inbound(&coordinator, call_id, &user_id, &text).await {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(peer = %user_id, error = %e, "Signaling socket error");
                    break;
                }
            }
        }
    }

    debug!(call = %call_id, peer = %user_id, "Signaling channel closed");
}

/// Returns false when the sender is no longer part of the call.
async fn relay_inbound(
    coordinator: &Coordinator,
    call_id: CallId,
    user_id: &UserId,
    text: &str,
) -> bool {
    let message = match SignalingMessage::from_json(text) {
        Ok(m) => m,
        Err(e) => {
            debug!(peer = %user_id, error = %e, "Dropping unparseable signaling frame");
            return true;
        }
    };
    if message.sender != *user_id || message.call_id != call_id {
        warn!(peer = %user_id, claimed = %message.sender, "Dropping envelope with mismatched identity");
        return true;
    }

    match coordinator.relay(message).await {
        Ok(_) => true,
        Err(CallError::NotAParticipant(_)) | Err(CallError::CallNotFound(_)) => false,
        Err(e) => {
            debug!(peer = %user_id, error = %e, "Relay rejected");
            true
        }
    }
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
