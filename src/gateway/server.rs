//! HTTP / WebSocket 入口
//!
//! - `GET /ws/:room_id`：观察者通道
//! - `/api/rooms/:room_id/...`：运维控制（暂停、注入事件、跳章、拍卖）
//! - `GET /rooms`、`GET /api/health`

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};

use crate::chat::events::ChatEvent;
use crate::chat::history::ChatMessage;
use crate::chat::scenario::ScenarioEvent;
use crate::core::{ChatError, ShutdownManager};
use crate::gateway::manager::RoomManager;
use crate::gateway::room::{Room, RoomStatus};

type ApiResult<T> = Result<T, (StatusCode, String)>;

fn api_error(e: ChatError) -> (StatusCode, String) {
    let code = match &e {
        ChatError::InvalidRoomId(_) | ChatError::InvalidEventIndex { .. } | ChatError::Protocol(_) => {
            StatusCode::BAD_REQUEST
        }
        ChatError::NoAgents | ChatError::Auction(_) => StatusCode::CONFLICT,
        ChatError::Llm(_) => StatusCode::BAD_GATEWAY,
        ChatError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (code, e.to_string())
}

async fn existing_room(manager: &RoomManager, room_id: &str) -> ApiResult<Arc<Room>> {
    manager
        .get(room_id)
        .await
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Room not found: {}", room_id)))
}

pub fn router(manager: Arc<RoomManager>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/rooms", get(list_rooms))
        .route("/api/health", get(|| async { "OK" }))
        .route("/ws/:room_id", get(websocket_handler))
        .route("/api/rooms/:room_id/pause", post(api_pause))
        .route("/api/rooms/:room_id/resume", post(api_resume))
        .route("/api/rooms/:room_id/inject", post(api_inject))
        .route("/api/rooms/:room_id/jump", post(api_jump))
        .route("/api/rooms/:room_id/scenario", put(api_scenario))
        .route("/api/rooms/:room_id/group-name", put(api_group_name))
        .route("/api/rooms/:room_id/history", get(api_history))
        .route("/api/rooms/:room_id/status", get(api_status))
        .route(
            "/api/rooms/:room_id/auction",
            post(api_auction_open).delete(api_auction_close),
        )
        .with_state(manager)
}

/// 启动服务；关闭被触发后先停止所有房间，再等待连接退出
pub async fn serve(
    listener: TcpListener,
    manager: Arc<RoomManager>,
    shutdown: Arc<ShutdownManager>,
) -> std::io::Result<()> {
    let rooms = manager.clone();
    axum::serve(listener, router(manager))
        .with_graceful_shutdown(async move {
            let reason = shutdown.wait_for_shutdown().await;
            tracing::info!("Shutting down ({:?}), stopping all rooms", reason);
            rooms.shutdown().await;
        })
        .await
}

async fn index() -> Json<serde_json::Value> {
    Json(json!({"status": "ok", "message": "Agora group chat server"}))
}

async fn list_rooms(State(manager): State<Arc<RoomManager>>) -> Json<serde_json::Value> {
    Json(json!({ "rooms": manager.list().await }))
}

// ========== 观察者通道 ==========

async fn websocket_handler(
    State(manager): State<Arc<RoomManager>>,
    Path(room_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    match manager.get_or_create(&room_id).await {
        Ok(room) => ws.on_upgrade(move |socket| handle_socket(socket, room)),
        Err(e) => api_error(e).into_response(),
    }
}

async fn send_event<S>(sink: &mut S, event: &ChatEvent) -> bool
where
    S: SinkExt<Message> + Unpin,
{
    match serde_json::to_string(event) {
        Ok(text) => sink.send(Message::Text(text)).await.is_ok(),
        Err(e) => {
            tracing::warn!("Failed to serialize event: {}", e);
            true
        }
    }
}

async fn handle_socket(socket: WebSocket, room: Arc<Room>) {
    let (mut sender, mut receiver) = socket.split();
    let (initial, mut events) = room.connect().await;
    let (direct_tx, mut direct_rx) = mpsc::channel::<ChatEvent>(64);
    tracing::info!("[{}] observer connected", room.id());

    // 写端：先发初始快照，之后合并“只回给本连接”的回复与房间广播
    let room_id = room.id().to_string();
    let writer = tokio::spawn(async move {
        for event in &initial {
            if !send_event(&mut sender, event).await {
                return;
            }
        }
        loop {
            let event = tokio::select! {
                direct = direct_rx.recv() => match direct {
                    Some(e) => e,
                    None => break,
                },
                shared = events.recv() => match shared {
                    Ok(e) => e,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("[{}] observer lagged, {} events dropped", room_id, n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };
            if !send_event(&mut sender, &event).await {
                break;
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                tracing::debug!("[{}] received: {}", room.id(), text);
                for reply in room.handle_text(&text).await {
                    if direct_tx.send(reply).await.is_err() {
                        break;
                    }
                }
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::warn!("[{}] websocket error: {}", room.id(), e);
                break;
            }
            _ => {}
        }
    }

    drop(direct_tx);
    writer.abort();
    room.disconnect();
    tracing::info!("[{}] observer disconnected", room.id());
}

// ========== 运维控制 ==========

async fn api_pause(
    State(manager): State<Arc<RoomManager>>,
    Path(room_id): Path<String>,
) -> ApiResult<StatusCode> {
    existing_room(&manager, &room_id).await?.session().pause().await;
    Ok(StatusCode::OK)
}

async fn api_resume(
    State(manager): State<Arc<RoomManager>>,
    Path(room_id): Path<String>,
) -> ApiResult<StatusCode> {
    existing_room(&manager, &room_id).await?.session().resume().await;
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
struct InjectRequest {
    content: String,
}

async fn api_inject(
    State(manager): State<Arc<RoomManager>>,
    Path(room_id): Path<String>,
    Json(req): Json<InjectRequest>,
) -> ApiResult<Json<ChatMessage>> {
    if req.content.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "content is empty".to_string()));
    }
    let room = existing_room(&manager, &room_id).await?;
    Ok(Json(room.session().inject_event(&req.content).await))
}

#[derive(Deserialize)]
struct JumpRequest {
    event_idx: usize,
}

async fn api_jump(
    State(manager): State<Arc<RoomManager>>,
    Path(room_id): Path<String>,
    Json(req): Json<JumpRequest>,
) -> ApiResult<StatusCode> {
    let room = existing_room(&manager, &room_id).await?;
    room.session().jump(req.event_idx).await.map_err(api_error)?;
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
struct ScenarioRequest {
    events: Vec<ScenarioEvent>,
}

async fn api_scenario(
    State(manager): State<Arc<RoomManager>>,
    Path(room_id): Path<String>,
    Json(req): Json<ScenarioRequest>,
) -> ApiResult<StatusCode> {
    let room = existing_room(&manager, &room_id).await?;
    room.session().replace_events(req.events).await;
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
struct GroupNameRequest {
    name: String,
}

async fn api_group_name(
    State(manager): State<Arc<RoomManager>>,
    Path(room_id): Path<String>,
    Json(req): Json<GroupNameRequest>,
) -> ApiResult<StatusCode> {
    if req.name.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "name is empty".to_string()));
    }
    let room = existing_room(&manager, &room_id).await?;
    room.set_group_name(&req.name).await.map_err(api_error)?;
    Ok(StatusCode::OK)
}

async fn api_history(
    State(manager): State<Arc<RoomManager>>,
    Path(room_id): Path<String>,
) -> ApiResult<Json<Vec<ChatMessage>>> {
    let room = existing_room(&manager, &room_id).await?;
    Ok(Json(room.session().history().await))
}

async fn api_status(
    State(manager): State<Arc<RoomManager>>,
    Path(room_id): Path<String>,
) -> ApiResult<Json<RoomStatus>> {
    let room = existing_room(&manager, &room_id).await?;
    Ok(Json(room.status().await))
}

#[derive(Deserialize)]
struct AuctionRequest {
    item: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    starting_price: f64,
    auctioneer: String,
}

async fn api_auction_open(
    State(manager): State<Arc<RoomManager>>,
    Path(room_id): Path<String>,
    Json(req): Json<AuctionRequest>,
) -> ApiResult<StatusCode> {
    let room = existing_room(&manager, &room_id).await?;
    room.session()
        .open_auction(&req.item, &req.description, req.starting_price, &req.auctioneer)
        .await
        .map_err(api_error)?;
    Ok(StatusCode::OK)
}

async fn api_auction_close(
    State(manager): State<Arc<RoomManager>>,
    Path(room_id): Path<String>,
) -> ApiResult<StatusCode> {
    let room = existing_room(&manager, &room_id).await?;
    room.session().close_auction().await.map_err(api_error)?;
    Ok(StatusCode::OK)
}
