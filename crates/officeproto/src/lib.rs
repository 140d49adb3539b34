//! `officeproto`: the wire contract shared by presenced and its clients.
//!
//! Realtime messages are JSON envelopes `{ "name": <string>, "payload": ... }`
//! delivered over the room transport. This crate owns the message names, the
//! payload shapes, the join options presented at handshake, and the manager
//! token payload. It knows nothing about rooms or transports; it only makes
//! the two ends agree on field names.

pub mod messages;
pub mod token;

use serde::{Deserialize, Serialize};

/// Options a client presents when joining a room.
///
/// Human clients send an optional `password`/`name`; agent clients send
/// `agentId` plus a manager token (either at the top level or nested under
/// `auth`, depending on the client library).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_slug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manager_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<JoinAuth>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinAuth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manager_token: Option<String>,
}

impl JoinOptions {
    /// The manager token, wherever the client put it.
    pub fn manager_token(&self) -> Option<&str> {
        self.auth
            .as_ref()
            .and_then(|a| a.manager_token.as_deref())
            .or(self.manager_token.as_deref())
    }
}

/// Room types exposed by the transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RoomType {
    Lobby,
    #[default]
    Public,
    Custom,
}

impl RoomType {
    pub fn as_str(self) -> &'static str {
        match self {
            RoomType::Lobby => "LOBBY",
            RoomType::Public => "PUBLIC",
            RoomType::Custom => "CUSTOM",
        }
    }
}
