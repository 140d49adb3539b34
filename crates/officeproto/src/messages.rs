//! Realtime message names and payloads.
//!
//! Names match the browser client verbatim; payloads are camelCase JSON.

use serde::{Deserialize, Serialize};

pub const CONNECT_TO_COMPUTER: &str = "CONNECT_TO_COMPUTER";
pub const DISCONNECT_FROM_COMPUTER: &str = "DISCONNECT_FROM_COMPUTER";
pub const STOP_SCREEN_SHARE: &str = "STOP_SCREEN_SHARE";
pub const CONNECT_TO_WHITEBOARD: &str = "CONNECT_TO_WHITEBOARD";
pub const DISCONNECT_FROM_WHITEBOARD: &str = "DISCONNECT_FROM_WHITEBOARD";
pub const UPDATE_PLAYER: &str = "UPDATE_PLAYER";
pub const UPDATE_PLAYER_NAME: &str = "UPDATE_PLAYER_NAME";
pub const READY_TO_CONNECT: &str = "READY_TO_CONNECT";
pub const VIDEO_CONNECTED: &str = "VIDEO_CONNECTED";
pub const DISCONNECT_STREAM: &str = "DISCONNECT_STREAM";
pub const ADD_CHAT_MESSAGE: &str = "ADD_CHAT_MESSAGE";
pub const NEW_CHAT_MESSAGE: &str = "NEW_CHAT_MESSAGE";

/// Client -> server envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    pub name: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputerRef {
    pub computer_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhiteboardRef {
    pub whiteboard_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerUpdate {
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub anim: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerName {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamPeer {
    pub client_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatContent {
    pub content: String,
}

/// One entry of the replicated chat array.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub author: String,
    pub content: String,
    pub created_at: i64,
}
