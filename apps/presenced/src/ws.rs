//! Realtime transport adapter.
//!
//! The heavy lifting (state replication, matchmaking at scale) belongs to
//! the room framework; this adapter exposes just enough of it to drive the
//! core: a websocket join per room, JSON `{name, payload}` messages routed
//! into the room's handlers, and a lobby stream of listing events. Join
//! failures surface as a `JOIN_ERROR` event carrying the status code (and
//! the redirect room id for 410) before the socket closes.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use officeproto::messages::ClientMessage;
use officeproto::{JoinOptions, RoomType};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::room::{CreateRoomOptions, Room};
use crate::state::{new_id, Shared};

type AppState = Arc<Shared>;

pub fn router(shared: AppState) -> Router {
    Router::new()
        .route("/ws/rooms/:room_id", get(ws_join_by_id))
        .route("/ws/namespace/:slug", get(ws_join_by_namespace))
        .route("/ws/lobby", get(ws_lobby))
        .route("/matchmaker/create/:room_type", post(create_room))
        .route("/matchmaker/rooms", get(list_rooms))
        .with_state(shared)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRoomReq {
    name: String,
    #[serde(default)]
    namespace_slug: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

async fn create_room(
    State(shared): State<AppState>,
    Path(room_type): Path<String>,
    Json(req): Json<CreateRoomReq>,
) -> Response {
    let room_type = match room_type.to_uppercase().as_str() {
        "PUBLIC" => RoomType::Public,
        "CUSTOM" => RoomType::Custom,
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "success": false, "error": "unknown room type" })),
            )
                .into_response()
        }
    };
    match Room::create(
        &shared,
        CreateRoomOptions {
            room_type,
            name: req.name,
            namespace_slug: req.namespace_slug,
            password: req.password,
            description: req.description.unwrap_or_default(),
            ..Default::default()
        },
    )
    .await
    {
        Ok(room) => Json(json!({ "success": true, "roomId": room.room_id() })).into_response(),
        Err(e) => {
            warn!(err = %e, "matchmaker create failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "error": "room create failed" })),
            )
                .into_response()
        }
    }
}

async fn list_rooms(State(shared): State<AppState>) -> Response {
    Json(json!({ "success": true, "rooms": shared.matchmaker.all().await })).into_response()
}

async fn ws_join_by_id(
    ws: WebSocketUpgrade,
    State(shared): State<AppState>,
    Path(room_id): Path<String>,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        let room = shared.directory.get_by_room_id(&room_id).await;
        session_task(socket, room).await;
    })
}

async fn ws_join_by_namespace(
    ws: WebSocketUpgrade,
    State(shared): State<AppState>,
    Path(slug): Path<String>,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        let room = shared.directory.get_by_namespace(&slug).await;
        session_task(socket, room).await;
    })
}

/// One client session: expect a `JOIN` envelope, run the handshake, then
/// pump messages both ways until either side hangs up.
async fn session_task(socket: WebSocket, room: Option<Arc<Room>>) {
    let (mut ws_w, mut ws_r) = socket.split();

    let Some(room) = room else {
        let _ = ws_w
            .send(event_text("JOIN_ERROR", json!({ "status": 404, "reason": "Room not found" })))
            .await;
        let _ = ws_w.close().await;
        return;
    };

    // First frame must be the JOIN envelope.
    let options = loop {
        match ws_r.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(msg) if msg.name == "JOIN" => {
                    break serde_json::from_value::<JoinOptions>(msg.payload).unwrap_or_default()
                }
                _ => {
                    let _ = ws_w
                        .send(event_text(
                            "JOIN_ERROR",
                            json!({ "status": 400, "reason": "Expected JOIN message" }),
                        ))
                        .await;
                    let _ = ws_w.close().await;
                    return;
                }
            },
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            _ => return,
        }
    };

    let user_data = match room.on_auth(&options).await {
        Ok(ud) => ud,
        Err(e) => {
            let mut payload = json!({ "status": e.status, "reason": e.reason });
            if let Some(room_id) = e.room_id {
                payload["roomId"] = room_id.into();
            }
            let _ = ws_w.send(event_text("JOIN_ERROR", payload)).await;
            let _ = ws_w.close().await;
            return;
        }
    };

    let session_id = new_id();
    let (room_tx, mut room_rx) = mpsc::channel::<ClientMessage>(128);
    let (ws_tx, mut ws_rx) = mpsc::channel::<Message>(128);

    let writer = tokio::spawn(async move {
        while let Some(m) = ws_rx.recv().await {
            if ws_w.send(m).await.is_err() {
                break;
            }
        }
    });

    // Forward room events onto the socket.
    let ws_tx_room = ws_tx.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(msg) = room_rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(text) => {
                    if ws_tx_room.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(err = %e, "unserializable room event"),
            }
        }
    });

    room.on_join(&session_id, &options, user_data, room_tx).await;
    let _ = ws_tx
        .send(event_text(
            "JOINED",
            json!({ "sessionId": session_id, "roomId": room.room_id() }),
        ))
        .await;

    while let Some(frame) = ws_r.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(msg) => room.handle_message(&session_id, msg).await,
                Err(e) => debug!(err = %e, "bad client frame"),
            },
            Ok(Message::Ping(v)) => {
                let _ = ws_tx.send(Message::Pong(v)).await;
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    room.on_leave(&session_id).await;
    forwarder.abort();
    drop(ws_tx);
    let _ = writer.await;
}

/// Lobby stream: current listings, then add/remove events as they happen.
async fn ws_lobby(ws: WebSocketUpgrade, State(shared): State<AppState>) -> Response {
    ws.on_upgrade(move |mut socket| async move {
        let rooms = shared.matchmaker.all().await;
        let snapshot = event_text("LOBBY_ROOMS", json!({ "rooms": rooms }));
        if socket.send(snapshot).await.is_err() {
            return;
        }
        let mut events = shared.matchmaker.subscribe();
        loop {
            tokio::select! {
                ev = events.recv() => {
                    let Ok(ev) = ev else { break };
                    let text = match serde_json::to_string(&ev) {
                        Ok(t) => t,
                        Err(_) => continue,
                    };
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                frame = socket.recv() => {
                    match frame {
                        Some(Ok(Message::Ping(v))) => {
                            let _ = socket.send(Message::Pong(v)).await;
                        }
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                        _ => {}
                    }
                }
            }
        }
    })
}

fn event_text(name: &str, payload: serde_json::Value) -> Message {
    Message::Text(
        serde_json::to_string(&ClientMessage {
            name: name.to_string(),
            payload,
        })
        .unwrap_or_default(),
    )
}
