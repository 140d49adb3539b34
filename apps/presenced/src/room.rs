//! Room instance: the authoritative shared-world state for one namespace.
//!
//! A room owns its players, the five computer seats, the three whiteboards
//! and the NPC assignment table. All mutation goes through the state mutex,
//! which gives message handlers, lifecycle hooks and admin calls one serial
//! order. The room writes through to the local store and pushes presence
//! telemetry to the Registry; both are best-effort, the in-memory state
//! stays authoritative.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use officeproto::messages::{self, ChatMessage, ClientMessage};
use officeproto::token::ManagerTokenPayload;
use officeproto::{JoinOptions, RoomType};
use officestore::{NpcRow, RoomRow};
use registry_client::{now_iso, AgentPatch};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::state::{new_id, Shared};
use crate::workstations;

pub const DEFAULT_AVATAR: &str = "adam";
const BCRYPT_COST: u32 = 10;

/// Session key under which an NPC's player entity lives.
pub fn npc_key(agent_id_lc: &str) -> String {
    format!("npc-{agent_id_lc}")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    pub x: f64,
    pub y: f64,
    pub anim: String,
    pub name: String,
    pub ready_to_connect: bool,
    pub video_connected: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Computer {
    pub id: String,
    pub connected_user: HashSet<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Whiteboard {
    pub id: String,
    /// Id of the backing whiteboard-service room, allocated per room.
    pub whiteboard_room_id: String,
    pub connected_user: HashSet<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NpcAssignment {
    pub agent_id: String,
    pub registry_agent_id: Option<String>,
    pub office_id: Option<String>,
    pub name: String,
    pub avatar_id: String,
    pub workstation_id: Option<String>,
    pub position: Position,
    pub role: String,
    pub computer_id: Option<String>,
    pub voice_agent_id: Option<String>,
    pub namespace_slug: String,
    pub room_id: String,
    pub assigned_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NpcUpsert {
    pub agent_id: String,
    #[serde(default)]
    pub registry_agent_id: Option<String>,
    #[serde(default)]
    pub office_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub avatar_id: Option<String>,
    #[serde(default)]
    pub workstation_id: Option<String>,
    #[serde(default)]
    pub position: Option<Position>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub computer_id: Option<String>,
    #[serde(default)]
    pub voice_agent_id: Option<String>,
    #[serde(default)]
    pub agent_metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UpsertFlags {
    pub skip_persistence: bool,
    pub skip_registry_sync: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NpcStateUpdate {
    #[serde(default)]
    pub position: Option<Position>,
    #[serde(default)]
    pub anim: Option<String>,
    #[serde(default)]
    pub posture: Option<String>,
    #[serde(default)]
    pub workstation_id: Option<String>,
    #[serde(default)]
    pub voice_agent_id: Option<String>,
}

impl NpcStateUpdate {
    pub fn is_empty(&self) -> bool {
        self.position.is_none()
            && self.anim.is_none()
            && self.posture.is_none()
            && self.workstation_id.is_none()
            && self.voice_agent_id.is_none()
    }
}

/// Handshake failure: a status code plus a short reason, and for namespace
/// redirects the id of the room the client should retry against.
#[derive(Debug, Clone)]
pub struct JoinError {
    pub status: u16,
    pub reason: String,
    pub room_id: Option<String>,
}

impl JoinError {
    fn new(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
            room_id: None,
        }
    }

    fn redirect(room_id: String) -> Self {
        Self {
            status: 410,
            reason: "Namespace is served by another room".to_string(),
            room_id: Some(room_id),
        }
    }
}

/// Attached to an authenticated NPC client's opaque user data.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NpcUserData {
    pub npc_agent_id: String,
    pub npc_key: String,
    pub manager_token_payload: ManagerTokenPayload,
    pub presence_secret_source: String,
}

pub type Outbound = mpsc::Sender<ClientMessage>;

struct ClientHandle {
    tx: Outbound,
    user_data: Option<NpcUserData>,
}

struct RoomState {
    metadata: serde_json::Map<String, serde_json::Value>,
    computers: Vec<Computer>,
    whiteboards: Vec<Whiteboard>,
    players: HashMap<String, Player>,
    npc_assignments: HashMap<String, NpcAssignment>,
    chat: Vec<ChatMessage>,
    clients: HashMap<String, ClientHandle>,
    rehydrated: bool,
    disposed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CreateRoomOptions {
    pub room_type: RoomType,
    pub name: String,
    pub namespace_slug: Option<String>,
    /// Plaintext, or an existing bcrypt hash (`$2...`).
    pub password: Option<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub description: String,
    pub auto_dispose: bool,
}

pub struct Room {
    room_id: String,
    name: String,
    namespace_slug: String,
    room_type: RoomType,
    password_hash: Option<String>,
    registry_backed: bool,
    shared: Arc<Shared>,
    state: Mutex<RoomState>,
}

pub fn normalize_slug(s: &str) -> String {
    s.trim().to_lowercase()
}

impl Room {
    pub async fn create(
        shared: &Arc<Shared>,
        opts: CreateRoomOptions,
    ) -> anyhow::Result<Arc<Room>> {
        let room_id = new_id();
        let namespace_slug = normalize_slug(
            opts.namespace_slug
                .as_deref()
                .unwrap_or(opts.name.as_str()),
        );

        let password_hash = match opts.password {
            Some(pw) if pw.starts_with("$2") => Some(pw),
            Some(pw) => Some(bcrypt::hash(pw, BCRYPT_COST)?),
            None => None,
        };

        let mut metadata = opts.metadata;
        let registry_backed = metadata
            .get("registryBacked")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        metadata.insert("registryBacked".into(), registry_backed.into());
        metadata.insert("hasPassword".into(), password_hash.is_some().into());
        metadata.insert("namespaceSlug".into(), namespace_slug.clone().into());

        let computers = (0..workstations::COMPUTER_SLOTS)
            .map(|i| Computer {
                id: i.to_string(),
                connected_user: HashSet::new(),
            })
            .collect();
        let whiteboards = (0..workstations::WHITEBOARD_SLOTS)
            .map(|i| Whiteboard {
                id: i.to_string(),
                whiteboard_room_id: new_id(),
                connected_user: HashSet::new(),
            })
            .collect();

        let room = Arc::new(Room {
            room_id: room_id.clone(),
            name: opts.name.clone(),
            namespace_slug: namespace_slug.clone(),
            room_type: opts.room_type,
            password_hash: password_hash.clone(),
            registry_backed,
            shared: shared.clone(),
            state: Mutex::new(RoomState {
                metadata,
                computers,
                whiteboards,
                players: HashMap::new(),
                npc_assignments: HashMap::new(),
                chat: Vec::new(),
                clients: HashMap::new(),
                rehydrated: false,
                disposed: false,
            }),
        });

        shared.directory.register(&room).await;

        if let Err(e) = shared.store.save_room(&RoomRow {
            name: opts.name.clone(),
            description: opts.description,
            password: password_hash,
            auto_dispose: opts.auto_dispose,
        }) {
            warn!(err = %e, room = %opts.name, "failed persisting room row");
        }

        {
            let st = room.state.lock().await;
            shared
                .matchmaker
                .upsert_listing(room.listing_locked(&st))
                .await;
        }

        if registry_backed {
            let office_id = {
                let st = room.state.lock().await;
                st.metadata
                    .get("registryOfficeId")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
            };
            if let Some(office_id) = office_id {
                let registry = shared.registry.clone();
                let world_id = room_id.clone();
                tokio::spawn(async move {
                    registry.patch_office_world(&office_id, &world_id).await;
                });
            }
        }

        info!(
            room_id = %room.room_id,
            slug = %room.namespace_slug,
            registry_backed,
            "room created"
        );
        Ok(room)
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace_slug(&self) -> &str {
        &self.namespace_slug
    }

    pub fn room_type(&self) -> RoomType {
        self.room_type
    }

    pub fn is_registry_backed(&self) -> bool {
        self.registry_backed
    }

    pub async fn metadata(&self) -> serde_json::Value {
        let st = self.state.lock().await;
        serde_json::Value::Object(st.metadata.clone())
    }

    pub async fn client_count(&self) -> usize {
        self.state.lock().await.clients.len()
    }

    pub async fn assignments(&self) -> Vec<NpcAssignment> {
        let st = self.state.lock().await;
        st.npc_assignments.values().cloned().collect()
    }

    pub async fn has_agent(&self, agent_id: &str) -> bool {
        let lc = agent_id.to_lowercase();
        self.state.lock().await.npc_assignments.contains_key(&lc)
    }

    fn listing_locked(&self, st: &RoomState) -> crate::matchmaker::RoomListing {
        crate::matchmaker::RoomListing {
            room_id: self.room_id.clone(),
            name: self.name.clone(),
            room_type: self.room_type,
            metadata: serde_json::Value::Object(st.metadata.clone()),
            clients: st.clients.len(),
        }
    }

    async fn refresh_online_counts(&self, st: &mut RoomState) {
        let humans = st
            .clients
            .values()
            .filter(|c| c.user_data.is_none())
            .count();
        let npcs = st.npc_assignments.len();
        st.metadata
            .insert("clientsOnlineCount".into(), humans.into());
        st.metadata.insert("npcOnlineCount".into(), npcs.into());
        st.metadata
            .insert("totalOnlineCount".into(), (humans + npcs).into());
        self.shared
            .matchmaker
            .update_listing(
                &self.room_id,
                serde_json::Value::Object(st.metadata.clone()),
                st.clients.len(),
            )
            .await;
    }

    // ---- handshake + lifecycle -------------------------------------------

    /// Authenticate a join request. `Ok(Some(_))` is an NPC handshake,
    /// `Ok(None)` a human one.
    pub async fn on_auth(
        &self,
        options: &JoinOptions,
    ) -> Result<Option<NpcUserData>, JoinError> {
        let requested_ns = options
            .namespace_slug
            .as_deref()
            .map(normalize_slug)
            .filter(|s| !s.is_empty());

        let Some(agent_id) = options.agent_id.as_deref() else {
            // Human join.
            if let Some(req) = requested_ns.as_deref() {
                if req != self.namespace_slug {
                    return Err(JoinError::new(403, "Namespace mismatch"));
                }
            }
            self.check_password(options)?;
            return Ok(None);
        };

        // NPC handshake.
        self.check_password(options)?;
        let Some(token) = options.manager_token() else {
            return Err(JoinError::new(403, "Manager token required"));
        };
        let agent_lc = agent_id.to_lowercase();

        let mut st = self.state.lock().await;
        self.ensure_rehydrated(&mut st);

        let assignment = st
            .npc_assignments
            .get(&agent_lc)
            .cloned()
            .ok_or_else(|| JoinError::new(404, "No NPC assignment for agent"))?;

        if let Some(req) = requested_ns.as_deref() {
            if req != self.namespace_slug {
                if let Some(other) = self.shared.directory.get_by_namespace(req).await {
                    return Err(JoinError::redirect(other.room_id().to_string()));
                }
                return Err(JoinError::new(403, "Namespace mismatch"));
            }
        }

        let secret = self
            .shared
            .secrets
            .resolve(&agent_lc, assignment.office_id.as_deref())
            .await
            .ok_or_else(|| JoinError::new(503, "Presence secret unavailable"))?;

        let payload = presence_auth::verify_manager_token(token, &secret.secret)
            .map_err(|e| JoinError::new(403, e.to_string()))?;

        if let Some(token_agent) = payload.agent_id.as_deref() {
            if token_agent.to_lowercase() != agent_lc {
                return Err(JoinError::new(403, "Token agent mismatch"));
            }
        } else {
            return Err(JoinError::new(403, "Token agent missing"));
        }
        if let Some(token_ns) = payload.namespace_claim() {
            if normalize_slug(token_ns) != self.namespace_slug {
                return Err(JoinError::new(403, "Token namespace mismatch"));
            }
        }
        if let Some(req) = requested_ns.as_deref() {
            if normalize_slug(&assignment.namespace_slug) != req {
                return Err(JoinError::new(403, "Assignment namespace mismatch"));
            }
        }

        Ok(Some(NpcUserData {
            npc_agent_id: agent_lc.clone(),
            npc_key: npc_key(&agent_lc),
            manager_token_payload: payload,
            presence_secret_source: secret.source.as_str().to_string(),
        }))
    }

    fn check_password(&self, options: &JoinOptions) -> Result<(), JoinError> {
        let Some(hash) = self.password_hash.as_deref() else {
            return Ok(());
        };
        let Some(pw) = options.password.as_deref() else {
            return Err(JoinError::new(403, "Password required"));
        };
        match bcrypt::verify(pw, hash) {
            Ok(true) => Ok(()),
            _ => Err(JoinError::new(403, "Invalid password")),
        }
    }

    /// Attach a connected client. NPC clients already have a player (their
    /// assignment owns it); humans get a fresh one under the raw session id.
    pub async fn on_join(
        &self,
        session_id: &str,
        options: &JoinOptions,
        user_data: Option<NpcUserData>,
        tx: Outbound,
    ) {
        let mut st = self.state.lock().await;
        if user_data.is_none() {
            st.players.insert(
                session_id.to_string(),
                Player {
                    x: 705.0,
                    y: 500.0,
                    anim: format!("{DEFAULT_AVATAR}_idle_down"),
                    name: options.name.clone().unwrap_or_default(),
                    ready_to_connect: false,
                    video_connected: false,
                },
            );
        }
        st.clients.insert(
            session_id.to_string(),
            ClientHandle {
                tx: tx.clone(),
                user_data,
            },
        );

        let snapshot = self.snapshot_locked(&st);
        let _ = tx
            .send(ClientMessage {
                name: "ROOM_STATE".to_string(),
                payload: snapshot,
            })
            .await;

        self.refresh_online_counts(&mut st).await;
    }

    pub async fn on_leave(&self, session_id: &str) {
        let mut st = self.state.lock().await;
        let Some(handle) = st.clients.remove(session_id) else {
            return;
        };
        if handle.user_data.is_none() {
            st.players.remove(session_id);
        }
        for c in &mut st.computers {
            c.connected_user.remove(session_id);
        }
        for w in &mut st.whiteboards {
            w.connected_user.remove(session_id);
        }
        self.refresh_online_counts(&mut st).await;
    }

    /// Tear the room down and drop it from the directory. The namespace
    /// index entry is only removed if it still points at this instance, so
    /// a replacement room created under the same slug survives the race.
    pub async fn dispose(self: &Arc<Self>) {
        {
            let mut st = self.state.lock().await;
            if st.disposed {
                return;
            }
            st.disposed = true;
            let whiteboard_rooms = st
                .whiteboards
                .iter()
                .map(|w| w.whiteboard_room_id.clone())
                .collect::<Vec<_>>();
            debug!(room_id = %self.room_id, whiteboards = whiteboard_rooms.len(), "releasing whiteboard rooms");
            for handle in st.clients.values() {
                let _ = handle.tx.try_send(ClientMessage {
                    name: "ROOM_DISPOSED".to_string(),
                    payload: serde_json::json!({ "roomId": self.room_id }),
                });
            }
            st.clients.clear();
        }

        self.shared.directory.unregister(self).await;
        self.shared.matchmaker.remove_listing(&self.room_id).await;
        info!(room_id = %self.room_id, slug = %self.namespace_slug, "room disposed");
    }

    fn snapshot_locked(&self, st: &RoomState) -> serde_json::Value {
        serde_json::json!({
            "roomId": self.room_id,
            "name": self.name,
            "namespaceSlug": self.namespace_slug,
            "metadata": st.metadata,
            "players": st.players,
            "computers": st.computers,
            "whiteboards": st.whiteboards,
            "chat": st.chat,
            "npcAssignments": st.npc_assignments,
        })
    }

    // ---- realtime messages -----------------------------------------------

    pub async fn handle_message(&self, session_id: &str, msg: ClientMessage) {
        let mut st = self.state.lock().await;
        if st.disposed {
            return;
        }
        let player_key = st
            .clients
            .get(session_id)
            .and_then(|c| c.user_data.as_ref())
            .map(|u| u.npc_key.clone())
            .unwrap_or_else(|| session_id.to_string());

        match msg.name.as_str() {
            messages::CONNECT_TO_COMPUTER => {
                if let Ok(p) = serde_json::from_value::<messages::ComputerRef>(msg.payload) {
                    if let Some(c) = st.computers.iter_mut().find(|c| c.id == p.computer_id) {
                        c.connected_user.insert(session_id.to_string());
                    }
                }
            }
            messages::DISCONNECT_FROM_COMPUTER => {
                if let Ok(p) = serde_json::from_value::<messages::ComputerRef>(msg.payload) {
                    if let Some(c) = st.computers.iter_mut().find(|c| c.id == p.computer_id) {
                        c.connected_user.remove(session_id);
                    }
                }
            }
            messages::STOP_SCREEN_SHARE => {
                if let Ok(p) = serde_json::from_value::<messages::ComputerRef>(msg.payload) {
                    if let Some(c) = st.computers.iter().find(|c| c.id == p.computer_id) {
                        let peers = c
                            .connected_user
                            .iter()
                            .filter(|s| s.as_str() != session_id)
                            .cloned()
                            .collect::<Vec<_>>();
                        for peer in peers {
                            self.send_to_locked(
                                &st,
                                &peer,
                                ClientMessage {
                                    name: messages::STOP_SCREEN_SHARE.to_string(),
                                    payload: serde_json::json!({ "clientId": session_id }),
                                },
                            );
                        }
                    }
                }
            }
            messages::CONNECT_TO_WHITEBOARD => {
                if let Ok(p) = serde_json::from_value::<messages::WhiteboardRef>(msg.payload) {
                    if let Some(w) = st.whiteboards.iter_mut().find(|w| w.id == p.whiteboard_id) {
                        w.connected_user.insert(session_id.to_string());
                    }
                }
            }
            messages::DISCONNECT_FROM_WHITEBOARD => {
                if let Ok(p) = serde_json::from_value::<messages::WhiteboardRef>(msg.payload) {
                    if let Some(w) = st.whiteboards.iter_mut().find(|w| w.id == p.whiteboard_id) {
                        w.connected_user.remove(session_id);
                    }
                }
            }
            messages::UPDATE_PLAYER => {
                if let Ok(p) = serde_json::from_value::<messages::PlayerUpdate>(msg.payload) {
                    if let Some(player) = st.players.get_mut(&player_key) {
                        player.x = p.x;
                        player.y = p.y;
                        if let Some(anim) = p.anim {
                            player.anim = anim;
                        }
                    }
                }
            }
            messages::UPDATE_PLAYER_NAME => {
                if let Ok(p) = serde_json::from_value::<messages::PlayerName>(msg.payload) {
                    if let Some(player) = st.players.get_mut(&player_key) {
                        player.name = p.name;
                    }
                }
            }
            messages::READY_TO_CONNECT => {
                if let Some(player) = st.players.get_mut(&player_key) {
                    player.ready_to_connect = true;
                }
            }
            messages::VIDEO_CONNECTED => {
                if let Some(player) = st.players.get_mut(&player_key) {
                    player.video_connected = true;
                }
            }
            messages::DISCONNECT_STREAM => {
                if let Ok(p) = serde_json::from_value::<messages::StreamPeer>(msg.payload) {
                    self.send_to_locked(
                        &st,
                        &p.client_id,
                        ClientMessage {
                            name: messages::DISCONNECT_STREAM.to_string(),
                            payload: serde_json::json!({ "clientId": session_id }),
                        },
                    );
                }
            }
            messages::ADD_CHAT_MESSAGE => {
                if let Ok(p) = serde_json::from_value::<messages::ChatContent>(msg.payload) {
                    let author = st
                        .players
                        .get(&player_key)
                        .map(|pl| pl.name.clone())
                        .unwrap_or_default();
                    let entry = ChatMessage {
                        author,
                        content: p.content,
                        created_at: chrono::Utc::now().timestamp_millis(),
                    };
                    st.chat.push(entry.clone());
                    let payload = serde_json::to_value(&entry).unwrap_or_default();
                    let peers = st
                        .clients
                        .keys()
                        .filter(|s| s.as_str() != session_id)
                        .cloned()
                        .collect::<Vec<_>>();
                    for peer in peers {
                        self.send_to_locked(
                            &st,
                            &peer,
                            ClientMessage {
                                name: messages::NEW_CHAT_MESSAGE.to_string(),
                                payload: payload.clone(),
                            },
                        );
                    }
                }
            }
            other => {
                debug!(room_id = %self.room_id, name = %other, "unhandled room message");
            }
        }
    }

    fn send_to_locked(&self, st: &RoomState, session_id: &str, msg: ClientMessage) {
        if let Some(handle) = st.clients.get(session_id) {
            if handle.tx.try_send(msg).is_err() {
                debug!(session = %session_id, "dropping message to slow client");
            }
        }
    }

    // ---- NPC operations --------------------------------------------------

    /// Create or update the NPC for `payload.agent_id`. Returns the stored
    /// assignment.
    pub async fn upsert_npc(&self, payload: NpcUpsert, flags: UpsertFlags) -> NpcAssignment {
        let mut st = self.state.lock().await;
        let assignment = self.upsert_npc_locked(&mut st, payload, flags);
        self.refresh_online_counts(&mut st).await;
        assignment
    }

    fn upsert_npc_locked(
        &self,
        st: &mut RoomState,
        payload: NpcUpsert,
        flags: UpsertFlags,
    ) -> NpcAssignment {
        let agent_lc = payload.agent_id.to_lowercase();
        let key = npc_key(&agent_lc);
        let avatar = payload
            .avatar_id
            .clone()
            .filter(|a| !a.is_empty())
            .unwrap_or_else(|| DEFAULT_AVATAR.to_string());
        let position = payload
            .position
            .or_else(|| st.npc_assignments.get(&agent_lc).map(|a| a.position))
            .unwrap_or(Position { x: 800.0, y: 200.0 });

        // Seat resolution: explicit computer id wins, else the workstation
        // table decides. Clear any previous seat before taking the new one.
        let seat = payload.computer_id.clone().or_else(|| {
            payload
                .workstation_id
                .as_deref()
                .and_then(workstations::computer_for)
                .map(|s| s.to_string())
        });
        for c in &mut st.computers {
            c.connected_user.remove(&key);
        }
        let mut seated = false;
        if let Some(seat_id) = seat.as_deref() {
            if let Some(c) = st.computers.iter_mut().find(|c| c.id == seat_id) {
                c.connected_user.insert(key.clone());
                seated = true;
            }
        }

        let anim = if seated || payload.computer_id.is_some() {
            format!("{avatar}_sit_down")
        } else {
            format!("{avatar}_idle_down")
        };

        st.players.insert(
            key.clone(),
            Player {
                x: position.x,
                y: position.y,
                anim,
                name: payload.name.clone(),
                ready_to_connect: true,
                video_connected: false,
            },
        );

        let assignment = NpcAssignment {
            agent_id: agent_lc.clone(),
            registry_agent_id: payload.registry_agent_id,
            office_id: payload.office_id,
            name: payload.name,
            avatar_id: avatar,
            workstation_id: payload.workstation_id,
            position,
            role: normalize_role(payload.role.as_deref()),
            computer_id: seat.filter(|_| seated).or(payload.computer_id),
            voice_agent_id: payload.voice_agent_id,
            namespace_slug: self.namespace_slug.clone(),
            room_id: self.room_id.clone(),
            assigned_at: now_iso(),
            agent_metadata: payload.agent_metadata,
        };
        st.npc_assignments
            .insert(agent_lc.clone(), assignment.clone());

        if !flags.skip_persistence {
            if let Err(e) = self.shared.store.save_npc(&self.npc_row(&assignment)) {
                warn!(err = %e, agent = %agent_lc, "failed persisting npc row");
            }
        }
        if !flags.skip_registry_sync {
            self.spawn_registry_sync(&assignment, true);
        }
        assignment
    }

    /// Drop the NPC, its player entity and any seat it held.
    pub async fn remove_npc(&self, agent_id: &str) -> Option<NpcAssignment> {
        let agent_lc = agent_id.to_lowercase();
        let key = npc_key(&agent_lc);

        let mut st = self.state.lock().await;
        let assignment = st.npc_assignments.remove(&agent_lc)?;
        st.players.remove(&key);
        for c in &mut st.computers {
            c.connected_user.remove(&key);
        }

        if let Err(e) = self.shared.store.remove_npc(&agent_lc) {
            warn!(err = %e, agent = %agent_lc, "failed deleting npc row");
        }
        self.spawn_registry_sync(&assignment, false);
        self.refresh_online_counts(&mut st).await;
        Some(assignment)
    }

    /// Mutate live NPC state (position, posture, seat, voice). Returns the
    /// updated assignment, or `None` when the agent is unknown here.
    pub async fn update_npc_state(
        &self,
        agent_id: &str,
        update: NpcStateUpdate,
    ) -> Option<NpcAssignment> {
        let agent_lc = agent_id.to_lowercase();
        let key = npc_key(&agent_lc);

        let mut st = self.state.lock().await;
        if !st.npc_assignments.contains_key(&agent_lc) {
            return None;
        }

        let avatar = st.npc_assignments[&agent_lc].avatar_id.clone();

        if let Some(pos) = update.position {
            if let Some(a) = st.npc_assignments.get_mut(&agent_lc) {
                a.position = pos;
            }
            if let Some(p) = st.players.get_mut(&key) {
                p.x = pos.x;
                p.y = pos.y;
            }
        }
        if let Some(ws) = update.workstation_id.as_deref() {
            let seat = workstations::computer_for(ws).map(|s| s.to_string());
            for c in &mut st.computers {
                c.connected_user.remove(&key);
            }
            let mut seated = false;
            if let Some(seat_id) = seat.as_deref() {
                if let Some(c) = st.computers.iter_mut().find(|c| c.id == seat_id) {
                    c.connected_user.insert(key.clone());
                    seated = true;
                }
            }
            if let Some(a) = st.npc_assignments.get_mut(&agent_lc) {
                a.workstation_id = Some(ws.to_string());
                a.computer_id = seat.filter(|_| seated);
            }
        }
        if let Some(v) = update.voice_agent_id.clone() {
            if let Some(a) = st.npc_assignments.get_mut(&agent_lc) {
                a.voice_agent_id = Some(v);
            }
        }
        let anim = match update.posture.as_deref() {
            Some("sit") => Some(format!("{avatar}_sit_down")),
            Some("stand") => Some(format!("{avatar}_idle_down")),
            _ => update.anim.clone(),
        };
        if let Some(anim) = anim {
            if let Some(p) = st.players.get_mut(&key) {
                p.anim = anim;
            }
        }

        let assignment = st.npc_assignments.get(&agent_lc).cloned()?;
        if let Err(e) = self.shared.store.save_npc(&self.npc_row(&assignment)) {
            warn!(err = %e, agent = %agent_lc, "failed persisting npc row");
        }
        self.spawn_registry_sync(&assignment, true);
        Some(assignment)
    }

    /// Re-run persisted assignments for this room's name. Called on the
    /// first handshake after startup, or on demand.
    pub async fn rehydrate(&self) {
        let mut st = self.state.lock().await;
        self.ensure_rehydrated(&mut st);
        self.refresh_online_counts(&mut st).await;
    }

    fn ensure_rehydrated(&self, st: &mut RoomState) {
        if st.rehydrated {
            return;
        }
        st.rehydrated = true;

        let rows = match self.shared.store.all_npcs() {
            Ok(rows) => rows,
            Err(e) => {
                warn!(err = %e, room = %self.name, "npc rehydration scan failed");
                return;
            }
        };
        let mut restored = 0usize;
        for row in rows.into_iter().filter(|r| r.room_name == self.name) {
            let payload = NpcUpsert {
                agent_id: row.agent_id,
                registry_agent_id: row.registry_agent_id,
                office_id: row.office_id,
                name: row.name,
                avatar_id: Some(row.avatar_id),
                workstation_id: row.workstation_id,
                position: Some(Position {
                    x: row.position_x,
                    y: row.position_y,
                }),
                role: Some(row.role),
                computer_id: row.computer_id,
                voice_agent_id: row.voice_agent_id,
                agent_metadata: row.agent_metadata,
            };
            self.upsert_npc_locked(
                st,
                payload,
                UpsertFlags {
                    skip_persistence: true,
                    skip_registry_sync: true,
                },
            );
            restored += 1;
        }
        if restored > 0 {
            info!(room = %self.name, restored, "rehydrated persisted NPCs");
        }
    }

    /// Write the assignment's row through to the local store. Used by the
    /// reconciler, which suppresses persistence inside `upsert_npc` and then
    /// writes the row itself.
    pub fn persist_assignment(&self, assignment: &NpcAssignment) {
        if let Err(e) = self.shared.store.save_npc(&self.npc_row(assignment)) {
            warn!(err = %e, agent = %assignment.agent_id, "failed persisting npc row");
        }
    }

    fn npc_row(&self, a: &NpcAssignment) -> NpcRow {
        NpcRow {
            agent_id: a.agent_id.clone(),
            registry_agent_id: a.registry_agent_id.clone(),
            office_id: a.office_id.clone(),
            name: a.name.clone(),
            avatar_id: a.avatar_id.clone(),
            workstation_id: a.workstation_id.clone(),
            position_x: a.position.x,
            position_y: a.position.y,
            role: a.role.clone(),
            computer_id: a.computer_id.clone(),
            room_name: self.name.clone(),
            voice_agent_id: a.voice_agent_id.clone(),
            namespace_slug: Some(a.namespace_slug.clone()),
            agent_metadata: a.agent_metadata.clone(),
        }
    }

    fn spawn_registry_sync(&self, assignment: &NpcAssignment, present: bool) {
        let Some(office_id) = assignment.office_id.clone() else {
            return;
        };
        let registry = self.shared.registry.clone();
        let target = assignment
            .registry_agent_id
            .clone()
            .unwrap_or_else(|| assignment.agent_id.clone());
        let patch = build_agent_patch(assignment, present);
        tokio::spawn(async move {
            registry.patch_agent(&office_id, &target, &patch).await;
        });
    }

    /// Exactly one seat may hold a given session key. Test hook.
    #[cfg(test)]
    async fn seats_of(&self, key: &str) -> Vec<String> {
        let st = self.state.lock().await;
        st.computers
            .iter()
            .filter(|c| c.connected_user.contains(key))
            .map(|c| c.id.clone())
            .collect()
    }

    #[cfg(test)]
    async fn player(&self, key: &str) -> Option<Player> {
        self.state.lock().await.players.get(key).cloned()
    }
}

fn normalize_role(role: Option<&str>) -> String {
    let r = role.unwrap_or("").trim();
    if r.is_empty() || r.eq_ignore_ascii_case("office secretary") {
        "GM".to_string()
    } else {
        r.to_string()
    }
}

/// Presence patch sent to the Registry on every NPC mutation. Removal
/// inverts the presence flag and nulls the spawn block.
fn build_agent_patch(a: &NpcAssignment, present: bool) -> AgentPatch {
    let mut metadata = match a.agent_metadata.clone() {
        Some(serde_json::Value::Object(m)) => m,
        _ => serde_json::Map::new(),
    };
    metadata.insert("positionX".into(), a.position.x.into());
    metadata.insert("positionY".into(), a.position.y.into());
    metadata.insert(
        "workstationId".into(),
        a.workstation_id.clone().map(Into::into).unwrap_or(serde_json::Value::Null),
    );
    metadata.insert(
        "voiceAgentId".into(),
        a.voice_agent_id.clone().map(Into::into).unwrap_or(serde_json::Value::Null),
    );
    metadata.insert("namespaceSlug".into(), a.namespace_slug.clone().into());
    metadata.insert(
        "spawn".into(),
        if present {
            serde_json::json!({
                "position": { "x": a.position.x, "y": a.position.y },
                "workstationId": a.workstation_id,
                "voiceAgentId": a.voice_agent_id,
            })
        } else {
            serde_json::Value::Null
        },
    );
    metadata.insert("isPresentInSkyOffice".into(), present.into());

    AgentPatch {
        last_seen_at: now_iso(),
        metadata: serde_json::Value::Object(metadata),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Shared;
    use crate::testutil::test_shared;
    use presence_auth::sign_manager_token;

    fn upsert(agent: &str) -> NpcUpsert {
        NpcUpsert {
            agent_id: agent.to_string(),
            name: "Ada".to_string(),
            avatar_id: Some("adam".to_string()),
            workstation_id: Some("design-studio".to_string()),
            position: Some(Position { x: 800.0, y: 200.0 }),
            office_id: Some("off_1".to_string()),
            ..Default::default()
        }
    }

    async fn public_room(shared: &Arc<Shared>) -> Arc<Room> {
        Room::create(
            shared,
            CreateRoomOptions {
                name: "public".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn upsert_seats_npc_and_remove_clears_everything() {
        let shared = test_shared().await;
        let room = public_room(&shared).await;
        let agent = "a.x.office.xyz";
        let key = npc_key(agent);

        let a = room
            .upsert_npc(upsert(agent), UpsertFlags::default())
            .await;
        assert_eq!(a.computer_id.as_deref(), Some("0"));
        assert_eq!(a.role, "GM");
        assert_eq!(room.seats_of(&key).await, vec!["0".to_string()]);

        let p = room.player(&key).await.unwrap();
        assert_eq!(p.anim, "adam_sit_down");
        assert!(p.ready_to_connect);
        assert!(!p.video_connected);

        // Player exists iff assignment exists; the DB row was written.
        assert!(room.has_agent(agent).await);
        assert_eq!(shared.store.all_npcs().unwrap().len(), 1);

        assert!(room.remove_npc(agent).await.is_some());
        assert!(room.player(&key).await.is_none());
        assert!(room.seats_of(&key).await.is_empty());
        assert!(!room.has_agent(agent).await);
        assert!(shared.store.all_npcs().unwrap().is_empty());
        // Removing twice is a no-op.
        assert!(room.remove_npc(agent).await.is_none());
    }

    #[tokio::test]
    async fn reseating_frees_the_previous_computer() {
        let shared = test_shared().await;
        let room = public_room(&shared).await;
        let key = npc_key("ada");

        room.upsert_npc(upsert("Ada"), UpsertFlags::default()).await;
        assert_eq!(room.seats_of(&key).await, vec!["0".to_string()]);

        let mut second = upsert("ADA");
        second.workstation_id = Some("ops-desk".to_string());
        let a = room.upsert_npc(second, UpsertFlags::default()).await;
        assert_eq!(a.computer_id.as_deref(), Some("2"));
        assert_eq!(room.seats_of(&key).await, vec!["2".to_string()]);
    }

    #[tokio::test]
    async fn unknown_workstation_leaves_npc_standing() {
        let shared = test_shared().await;
        let room = public_room(&shared).await;

        let mut payload = upsert("bob");
        payload.workstation_id = Some("broom-closet".to_string());
        let a = room.upsert_npc(payload, UpsertFlags::default()).await;
        assert_eq!(a.computer_id, None);
        let p = room.player(&npc_key("bob")).await.unwrap();
        assert_eq!(p.anim, "adam_idle_down");
    }

    #[tokio::test]
    async fn role_normalization() {
        let shared = test_shared().await;
        let room = public_room(&shared).await;

        let mut p = upsert("x");
        p.role = Some("Office Secretary".to_string());
        assert_eq!(room.upsert_npc(p, UpsertFlags::default()).await.role, "GM");

        let mut p = upsert("y");
        p.role = Some("   ".to_string());
        assert_eq!(room.upsert_npc(p, UpsertFlags::default()).await.role, "GM");

        let mut p = upsert("z");
        p.role = Some("Engineer".to_string());
        assert_eq!(
            room.upsert_npc(p, UpsertFlags::default()).await.role,
            "Engineer"
        );
    }

    #[tokio::test]
    async fn update_npc_state_posture_and_position() {
        let shared = test_shared().await;
        let room = public_room(&shared).await;
        room.upsert_npc(upsert("ada"), UpsertFlags::default()).await;

        let a = room
            .update_npc_state(
                "ADA",
                NpcStateUpdate {
                    position: Some(Position { x: 10.0, y: 20.0 }),
                    posture: Some("stand".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(a.position, Position { x: 10.0, y: 20.0 });
        let p = room.player(&npc_key("ada")).await.unwrap();
        assert_eq!((p.x, p.y), (10.0, 20.0));
        assert_eq!(p.anim, "adam_idle_down");

        assert!(room
            .update_npc_state("ghost", NpcStateUpdate::default())
            .await
            .is_none());
    }

    #[tokio::test]
    async fn human_join_and_leave_manage_player_and_counts() {
        let shared = test_shared().await;
        let room = public_room(&shared).await;
        let (tx, mut rx) = mpsc::channel(8);
        let options = JoinOptions {
            name: Some("Grace".to_string()),
            ..Default::default()
        };
        assert!(room.on_auth(&options).await.unwrap().is_none());
        room.on_join("sess1", &options, None, tx).await;

        // First event is the opening snapshot.
        let snap = rx.recv().await.unwrap();
        assert_eq!(snap.name, "ROOM_STATE");
        assert!(snap.payload.get("players").is_some());

        let meta = room.metadata().await;
        assert_eq!(meta.get("clientsOnlineCount").unwrap(), 1);
        assert_eq!(meta.get("totalOnlineCount").unwrap(), 1);

        room.on_leave("sess1").await;
        assert!(room.player("sess1").await.is_none());
        let meta = room.metadata().await;
        assert_eq!(meta.get("clientsOnlineCount").unwrap(), 0);
    }

    #[tokio::test]
    async fn password_room_requires_bcrypt_match() {
        let shared = test_shared().await;
        let room = Room::create(
            &shared,
            CreateRoomOptions {
                name: "secret-room".to_string(),
                password: Some("hunter22".to_string()),
                room_type: RoomType::Custom,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let meta = room.metadata().await;
        assert_eq!(meta.get("hasPassword").unwrap(), true);

        let err = room.on_auth(&JoinOptions::default()).await.unwrap_err();
        assert_eq!(err.status, 403);

        let err = room
            .on_auth(&JoinOptions {
                password: Some("wrong".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.status, 403);

        assert!(room
            .on_auth(&JoinOptions {
                password: Some("hunter22".to_string()),
                ..Default::default()
            })
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn npc_handshake_verifies_token_and_claims() {
        let shared = test_shared().await;
        let room = public_room(&shared).await;
        room.upsert_npc(upsert("ada.acme.office.xyz"), UpsertFlags::default())
            .await;

        std::env::set_var("SHARED_SECRET", "test-secret");
        let payload = ManagerTokenPayload {
            agent_id: Some("Ada.Acme.Office.Xyz".to_string()),
            namespace: Some("public".to_string()),
            ..Default::default()
        };
        let token = sign_manager_token(&payload, "test-secret");

        let options = JoinOptions {
            agent_id: Some("ada.acme.office.xyz".to_string()),
            manager_token: Some(token),
            namespace_slug: Some("public".to_string()),
            ..Default::default()
        };
        let ud = room.on_auth(&options).await.unwrap().unwrap();
        assert_eq!(ud.npc_key, "npc-ada.acme.office.xyz");
        assert_eq!(ud.presence_secret_source, "static");

        // Missing token.
        let err = room
            .on_auth(&JoinOptions {
                agent_id: Some("ada.acme.office.xyz".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.status, 403);

        // Unknown agent.
        let err = room
            .on_auth(&JoinOptions {
                agent_id: Some("ghost".to_string()),
                manager_token: Some("x.y.z".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.status, 404);

        // Token signed for another agent.
        let wrong = sign_manager_token(
            &ManagerTokenPayload {
                agent_id: Some("mallory".to_string()),
                ..Default::default()
            },
            "test-secret",
        );
        let err = room
            .on_auth(&JoinOptions {
                agent_id: Some("ada.acme.office.xyz".to_string()),
                manager_token: Some(wrong),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.status, 403);
        std::env::remove_var("SHARED_SECRET");
    }

    #[tokio::test]
    async fn namespace_mismatch_redirects_when_target_room_exists() {
        let shared = test_shared().await;
        let alpha = Room::create(
            &shared,
            CreateRoomOptions {
                name: "alpha".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let beta = Room::create(
            &shared,
            CreateRoomOptions {
                name: "beta".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        alpha
            .upsert_npc(upsert("wanderer"), UpsertFlags::default())
            .await;

        let err = alpha
            .on_auth(&JoinOptions {
                agent_id: Some("wanderer".to_string()),
                manager_token: Some("a.b.c".to_string()),
                namespace_slug: Some("beta".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.status, 410);
        assert_eq!(err.room_id.as_deref(), Some(beta.room_id()));

        // No such namespace anywhere: plain 403.
        let err = alpha
            .on_auth(&JoinOptions {
                agent_id: Some("wanderer".to_string()),
                manager_token: Some("a.b.c".to_string()),
                namespace_slug: Some("gamma".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.status, 403);
    }

    #[tokio::test]
    async fn rehydration_restores_persisted_assignments() {
        let shared = test_shared().await;
        shared
            .store
            .save_npc(&officestore::NpcRow {
                agent_id: "old.agent".to_string(),
                registry_agent_id: None,
                office_id: None,
                name: "Old".to_string(),
                avatar_id: "lucy".to_string(),
                workstation_id: Some("dev-loft".to_string()),
                position_x: 1.0,
                position_y: 2.0,
                role: "GM".to_string(),
                computer_id: None,
                room_name: "Public Lobby".to_string(),
                voice_agent_id: None,
                namespace_slug: Some("public lobby".to_string()),
                agent_metadata: None,
            })
            .unwrap();

        let room = Room::create(
            &shared,
            CreateRoomOptions {
                name: "Public Lobby".to_string(),
                namespace_slug: Some("public".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(!room.has_agent("old.agent").await);

        room.rehydrate().await;
        let assignments = room.assignments().await;
        assert_eq!(assignments.len(), 1);
        assert_eq!(assignments[0].agent_id, "old.agent");
        assert_eq!(assignments[0].workstation_id.as_deref(), Some("dev-loft"));
        assert_eq!(assignments[0].computer_id.as_deref(), Some("1"));
        assert!(room.player(&npc_key("old.agent")).await.is_some());

        // Rehydration is one-shot.
        room.rehydrate().await;
        assert_eq!(room.assignments().await.len(), 1);
    }

    #[tokio::test]
    async fn chat_broadcasts_to_everyone_but_the_sender() {
        let shared = test_shared().await;
        let room = public_room(&shared).await;
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        let opts = JoinOptions {
            name: Some("A".to_string()),
            ..Default::default()
        };
        room.on_join("s1", &opts, None, tx1).await;
        room.on_join("s2", &opts, None, tx2).await;
        // Drain snapshots.
        let _ = rx1.recv().await;
        let _ = rx2.recv().await;

        room.handle_message(
            "s1",
            ClientMessage {
                name: messages::ADD_CHAT_MESSAGE.to_string(),
                payload: serde_json::json!({ "content": "hello" }),
            },
        )
        .await;

        let got = rx2.recv().await.unwrap();
        assert_eq!(got.name, messages::NEW_CHAT_MESSAGE);
        assert_eq!(got.payload.get("content").unwrap(), "hello");
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn stop_screen_share_notifies_other_viewers() {
        let shared = test_shared().await;
        let room = public_room(&shared).await;
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        let opts = JoinOptions::default();
        room.on_join("s1", &opts, None, tx1).await;
        room.on_join("s2", &opts, None, tx2).await;
        let _ = rx1.recv().await;
        let _ = rx2.recv().await;

        for sid in ["s1", "s2"] {
            room.handle_message(
                sid,
                ClientMessage {
                    name: messages::CONNECT_TO_COMPUTER.to_string(),
                    payload: serde_json::json!({ "computerId": "1" }),
                },
            )
            .await;
        }
        room.handle_message(
            "s1",
            ClientMessage {
                name: messages::STOP_SCREEN_SHARE.to_string(),
                payload: serde_json::json!({ "computerId": "1" }),
            },
        )
        .await;

        let got = rx2.recv().await.unwrap();
        assert_eq!(got.name, messages::STOP_SCREEN_SHARE);
        assert_eq!(got.payload.get("clientId").unwrap(), "s1");
        assert!(rx1.try_recv().is_err());
    }
}
