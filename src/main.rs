//! SyncRoom Server - Real-Time Collaborative Workspace
//!
//! A collaboration server using:
//! - Automerge CRDTs for conflict-free per-file document synchronization
//! - Sled embedded database for the per-room file tree
//! - Axum with WebSocket for communication
//! - Binary protocol for efficient sync message transfer

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info, warn};

mod exec;
mod store;
mod sync;

use exec::{ExecConfig, ExecError, ExecRequest, ExecService};
use store::{FileStore, RoomMeta, StoreConfig};
use sync::{
    protocol::{ClientMessage, ErrorKind, ServerMessage, WireCodec, PROTOCOL_VERSION},
    CollabServer, ServerConfig,
};

// ============================================================================
// APPLICATION STATE
// ============================================================================

/// Shared application state
pub struct AppState {
    /// Room and document coordinator
    server: Arc<CollabServer>,
    /// Code execution proxy
    exec: Arc<ExecService>,
    /// Server start time
    started_at: std::time::Instant,
}

impl AppState {
    pub fn new(store: Arc<FileStore>) -> Self {
        let server = Arc::new(CollabServer::new(store, ServerConfig::default()));

        let exec = match ExecConfig::from_env() {
            Ok(config) => {
                info!("Execution API configured: {}", config.api_url);
                Arc::new(ExecService::new(config))
            }
            Err(_) => {
                warn!("EXEC_API_URL not set - code execution will be disabled");
                Arc::new(ExecService::unconfigured())
            }
        };

        Self {
            server,
            exec,
            started_at: std::time::Instant::now(),
        }
    }
}

// ============================================================================
// API TYPES
// ============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    protocol_version: u8,
    uptime_seconds: u64,
    active_rooms: usize,
    active_peers: usize,
    live_sessions: usize,
}

#[derive(Debug, Deserialize)]
struct CreateRoomRequest {
    name: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateRoomResponse {
    room_id: String,
    name: String,
    ws_url: String,
}

#[derive(Debug, Serialize)]
struct RoomInfo {
    room_id: String,
    name: String,
    member_count: usize,
    created_at: i64,
}

#[derive(Debug, Serialize)]
struct RoomListResponse {
    rooms: Vec<RoomInfo>,
    total: usize,
}

#[derive(Debug, Deserialize)]
struct FileQuery {
    path: String,
}

// ============================================================================
// HTTP HANDLERS
// ============================================================================

/// Health check endpoint
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.server.stats();

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        protocol_version: PROTOCOL_VERSION,
        uptime_seconds: state.started_at.elapsed().as_secs(),
        active_rooms: stats.active_rooms,
        active_peers: stats.active_peers,
        live_sessions: stats.live_sessions,
    })
}

/// Create a new room
async fn create_room(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateRoomRequest>,
) -> Result<Json<CreateRoomResponse>, (StatusCode, String)> {
    let full_uuid = uuid::Uuid::new_v4().to_string();
    let room_id: String = full_uuid.chars().take(8).collect();

    let short_id: String = room_id.chars().take(4).collect();
    let name = payload.name.unwrap_or_else(|| format!("Room {}", short_id));

    let meta = RoomMeta::new(&room_id, &name);
    state
        .server
        .store()
        .save_room(&meta)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    info!("Created room: {} ({})", name, room_id);

    Ok(Json(CreateRoomResponse {
        ws_url: format!("/ws/{}", room_id),
        room_id,
        name,
    }))
}

/// List all rooms
async fn list_rooms(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.server.store().list_rooms() {
        Ok(metas) => {
            let rooms: Vec<RoomInfo> = metas
                .into_iter()
                .map(|meta| RoomInfo {
                    member_count: state.server.member_count(&meta.room_id),
                    room_id: meta.room_id,
                    name: meta.name,
                    created_at: meta.created_at,
                })
                .collect();
            let total = rooms.len();
            Json(RoomListResponse { rooms, total })
        }
        Err(e) => {
            error!("Failed to list rooms: {}", e);
            Json(RoomListResponse {
                rooms: vec![],
                total: 0,
            })
        }
    }
}

/// Fetch a file's persisted content as plain text. This serves the last
/// flushed state, which may trail the live document by the debounce window.
async fn get_file_content(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    Query(query): Query<FileQuery>,
) -> Result<String, StatusCode> {
    let record = state
        .server
        .store()
        .get_file(&room_id, &query.path)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;

    if record.is_folder() {
        return Err(StatusCode::BAD_REQUEST);
    }
    Ok(record.content)
}

/// Run a code snippet through the execution proxy
async fn execute_code(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ExecRequest>,
) -> Result<Json<exec::ExecResponse>, (StatusCode, String)> {
    match state.exec.run(&request).await {
        Ok(response) => Ok(Json(response)),
        Err(err @ ExecError::NotConfigured) => {
            Err((StatusCode::SERVICE_UNAVAILABLE, err.to_string()))
        }
        Err(err @ ExecError::UnsupportedLanguage(_)) => {
            Err((StatusCode::BAD_REQUEST, err.to_string()))
        }
        Err(err) => {
            error!("Execution request failed: {}", err);
            Err((StatusCode::BAD_GATEWAY, err.to_string()))
        }
    }
}

// ============================================================================
// WEBSOCKET HANDLER
// ============================================================================

/// WebSocket upgrade handler
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(room_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    info!("WebSocket upgrade request for room: {}", room_id);
    ws.on_upgrade(move |socket| handle_websocket(socket, room_id, state))
}

/// Handle WebSocket connection
async fn handle_websocket(socket: WebSocket, room_id: String, state: Arc<AppState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let peer_id = uuid::Uuid::new_v4().to_string();
    info!("New WebSocket connection: peer={}, room={}", peer_id, room_id);

    // Channel for sending messages to this peer
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    state.server.register_peer(&peer_id, tx.clone());

    // Send welcome message
    let welcome = ServerMessage::Welcome {
        protocol_version: PROTOCOL_VERSION,
        peer_id: peer_id.clone(),
        server_time: chrono::Utc::now().timestamp(),
    };
    if let Err(e) = send_server_message(&mut ws_sender, &welcome).await {
        error!("Failed to send welcome: {}", e);
        state.server.unregister_peer(&peer_id);
        return;
    }

    // The URL's room is joined immediately, mirroring connections that are
    // scoped to one room. JoinRoom messages can add more.
    if !room_id.trim().is_empty() {
        dispatch(
            ClientMessage::JoinRoom {
                room_id: room_id.clone(),
            },
            &peer_id,
            &state,
            &tx,
        );
    }

    let peer_id_recv = peer_id.clone();
    let peer_id_send = peer_id.clone();
    let state_recv = state.clone();

    // Task to forward messages from channel to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match WireCodec::encode_server(&msg) {
                Ok(bytes) => {
                    if ws_sender.send(Message::Binary(bytes.to_vec())).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to encode message: {}", e);
                }
            }
        }
        debug!("Send task ended for peer {}", peer_id_send);
    });

    // Task to handle incoming WebSocket messages
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Binary(data) => match WireCodec::decode_client(&data) {
                    Ok(client_msg) => {
                        dispatch(client_msg, &peer_id_recv, &state_recv, &tx);
                    }
                    Err(e) => {
                        warn!("Failed to decode binary message: {}", e);
                        let _ = tx.send(ServerMessage::error(
                            ErrorKind::DecodeFailure,
                            e.to_string(),
                            None,
                        ));
                    }
                },
                Message::Text(text) => {
                    // Also support JSON for compatibility/debugging
                    match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(client_msg) => {
                            dispatch(client_msg, &peer_id_recv, &state_recv, &tx);
                        }
                        Err(e) => {
                            warn!("Failed to decode text message: {}", e);
                            let _ = tx.send(ServerMessage::error(
                                ErrorKind::DecodeFailure,
                                e.to_string(),
                                None,
                            ));
                        }
                    }
                }
                Message::Ping(_) => {
                    // Pong is handled automatically
                }
                Message::Close(_) => {
                    info!("WebSocket closed by client: {}", peer_id_recv);
                    break;
                }
                _ => {}
            }
        }
        debug!("Receive task ended for peer {}", peer_id_recv);
    });

    // Wait for either task to complete
    tokio::select! {
        _ = send_task => {}
        _ = recv_task => {}
    }

    // Cleanup
    state.server.unregister_peer(&peer_id);
    info!("Peer {} disconnected", peer_id);
}

/// Route a decoded client message to the coordinator. Failures become wire
/// errors delivered only to this connection.
fn dispatch(
    msg: ClientMessage,
    peer_id: &str,
    state: &Arc<AppState>,
    tx: &mpsc::UnboundedSender<ServerMessage>,
) {
    match msg {
        ClientMessage::JoinRoom { room_id } => {
            reply(tx, Some(&room_id), state.server.join_room(peer_id, &room_id));
        }

        ClientMessage::ListFiles { room_id } => {
            reply(tx, Some(&room_id), state.server.list_files(peer_id, &room_id));
        }

        ClientMessage::DocInit { room_id, path } => {
            reply(
                tx,
                Some(&room_id),
                state.server.doc_init(peer_id, &room_id, &path),
            );
        }

        ClientMessage::DocUpdate {
            room_id,
            path,
            update,
        } => {
            if let Err(e) = state.server.doc_update(peer_id, &room_id, &path, update) {
                send_error(tx, Some(&room_id), e);
            }
        }

        ClientMessage::FileAdd {
            room_id,
            name,
            path,
            kind,
            parent,
        } => {
            reply(
                tx,
                Some(&room_id),
                state
                    .server
                    .file_add(peer_id, &room_id, &name, &path, kind, parent),
            );
        }

        ClientMessage::FileDelete { room_id, path } => {
            if let Err(e) = state.server.file_delete(peer_id, &room_id, &path) {
                send_error(tx, Some(&room_id), e);
            }
        }

        ClientMessage::FileRename {
            room_id,
            old_path,
            new_path,
            new_name,
        } => {
            if let Err(e) =
                state
                    .server
                    .file_rename(peer_id, &room_id, &old_path, &new_path, &new_name)
            {
                send_error(tx, Some(&room_id), e);
            }
        }

        ClientMessage::Ping { timestamp } => {
            let _ = tx.send(ServerMessage::Pong {
                timestamp,
                server_time: chrono::Utc::now().timestamp(),
            });
        }
    }
}

fn reply(
    tx: &mpsc::UnboundedSender<ServerMessage>,
    room_id: Option<&str>,
    result: sync::SyncResult<ServerMessage>,
) {
    match result {
        Ok(msg) => {
            let _ = tx.send(msg);
        }
        Err(e) => send_error(tx, room_id, e),
    }
}

fn send_error(
    tx: &mpsc::UnboundedSender<ServerMessage>,
    room_id: Option<&str>,
    err: sync::SyncError,
) {
    let _ = tx.send(ServerMessage::error(
        err.kind(),
        err.to_string(),
        room_id.map(|r| r.to_string()),
    ));
}

/// Send a server message over WebSocket
async fn send_server_message(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    msg: &ServerMessage,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let bytes = WireCodec::encode_server(msg)?;
    sender.send(Message::Binary(bytes.to_vec())).await?;
    Ok(())
}

// ============================================================================
// MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "syncroom_server=info,tower_http=info".into()),
        )
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize storage
    let storage_path =
        std::env::var("STORAGE_PATH").unwrap_or_else(|_| "./data/syncroom.sled".to_string());
    info!("Initializing storage at: {}", storage_path);

    let store = Arc::new(
        FileStore::open(StoreConfig::new(&storage_path)).expect("Failed to open storage"),
    );
    info!("Storage initialized successfully");

    // Create application state
    let state = Arc::new(AppState::new(store));

    // Start background tasks
    let server = state.server.clone();
    let _background_handles = server.clone().start_background_tasks();

    // Set up CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    // Build router
    let app = Router::new()
        // Health check
        .route("/health", get(health_check))
        // Room management
        .route("/api/rooms", get(list_rooms).post(create_room))
        .route("/api/rooms/:room_id/file", get(get_file_content))
        // Code execution proxy
        .route("/api/execute", post(execute_code))
        // WebSocket endpoint
        .route("/ws/:room_id", get(ws_handler))
        // Add state and middleware
        .with_state(state)
        .layer(cors);

    // Start server
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(5000);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!("SyncRoom server v{} starting", env!("CARGO_PKG_VERSION"));
    info!("   Protocol version: {}", PROTOCOL_VERSION);
    info!("   Listening on: http://{}", addr);
    info!("   WebSocket: ws://{}/ws/:room_id", addr);
    info!("   Health check: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
        .expect("Server error");

    // Flush every live document before exiting
    server.shutdown();
    info!("Shutdown complete");
}
