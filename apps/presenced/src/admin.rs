//! Admin HTTP facade: the narrow operator surface over rooms, NPCs and the
//! pathfinder. Every response is a JSON envelope with a `success` flag.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::room::{NpcStateUpdate, NpcUpsert, Position, Room, UpsertFlags};
use crate::state::Shared;

type AppState = Arc<Shared>;

pub fn router(shared: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/deploy-character", post(deploy_character))
        .route("/api/npcs", get(list_npcs))
        .route("/api/npcs/:agent_id", delete(remove_npc_everywhere))
        .route("/api/npcs/:agent_id/persist", post(persist_npc))
        .route("/api/rooms/by-namespace/:slug", get(room_by_namespace))
        .route("/api/rooms/:slug", delete(destroy_room))
        .route("/api/offices/:office_id/agents", get(office_agents))
        .route("/api/pathfind", post(pathfind))
        .with_state(shared)
}

fn ok(body: serde_json::Value) -> Response {
    Json(body).into_response()
}

fn err(status: StatusCode, msg: &str) -> Response {
    (status, Json(json!({ "success": false, "error": msg }))).into_response()
}

async fn healthz(State(shared): State<AppState>) -> Response {
    ok(json!({
        "success": true,
        "uptime": shared.started.elapsed().as_secs(),
        "rooms": shared.directory.active_room_count().await,
        "timestamp": registry_client::now_iso(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeployCharacterReq {
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    avatar_id: Option<String>,
    #[serde(default)]
    workstation_id: Option<String>,
    #[serde(default)]
    position: Option<Position>,
    #[serde(default)]
    namespace_slug: Option<String>,
    #[serde(default)]
    room_id: Option<String>,
    #[serde(default)]
    registry_agent_id: Option<String>,
    #[serde(default)]
    office_id: Option<String>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    voice_agent_id: Option<String>,
    #[serde(default)]
    agent_metadata: Option<serde_json::Value>,
}

/// Zero and non-finite coordinates fall back to the lobby spawn point.
fn sanitize_position(pos: Option<Position>) -> Position {
    let p = pos.unwrap_or_default();
    Position {
        x: if p.x.is_finite() && p.x != 0.0 { p.x } else { 705.0 },
        y: if p.y.is_finite() && p.y != 0.0 { p.y } else { 500.0 },
    }
}

async fn resolve_target_room(
    shared: &AppState,
    namespace_slug: Option<&str>,
    room_id: Option<&str>,
) -> Option<Arc<Room>> {
    if let Some(slug) = namespace_slug {
        if let Some(room) = shared.directory.get_by_namespace(slug).await {
            return Some(room);
        }
        if let Some(listing) = shared.matchmaker.find_by_namespace(slug).await {
            if let Some(room) = shared.directory.get_by_room_id(&listing.room_id).await {
                return Some(room);
            }
        }
    }
    if let Some(id) = room_id {
        if let Some(room) = shared.directory.get_by_room_id(id).await {
            return Some(room);
        }
    }
    shared.directory.get_any_active_room().await
}

async fn deploy_character(
    State(shared): State<AppState>,
    Json(req): Json<DeployCharacterReq>,
) -> Response {
    let mut missing = Vec::new();
    if req.agent_id.as_deref().map_or(true, str::is_empty) {
        missing.push("agentId");
    }
    if req.name.as_deref().map_or(true, str::is_empty) {
        missing.push("name");
    }
    if req.avatar_id.as_deref().map_or(true, str::is_empty) {
        missing.push("avatarId");
    }
    if req.workstation_id.as_deref().map_or(true, str::is_empty) {
        missing.push("workstationId");
    }
    if req.position.is_none() {
        missing.push("position");
    }
    if !missing.is_empty() {
        return err(
            StatusCode::BAD_REQUEST,
            &format!("missing fields: {}", missing.join(", ")),
        );
    }

    let Some(room) = resolve_target_room(
        &shared,
        req.namespace_slug.as_deref(),
        req.room_id.as_deref(),
    )
    .await
    else {
        return err(StatusCode::SERVICE_UNAVAILABLE, "no active room");
    };

    let assignment = room
        .upsert_npc(
            NpcUpsert {
                agent_id: req.agent_id.unwrap_or_default(),
                registry_agent_id: req.registry_agent_id,
                office_id: req.office_id,
                name: req.name.unwrap_or_default(),
                avatar_id: req.avatar_id,
                workstation_id: req.workstation_id,
                position: Some(sanitize_position(req.position)),
                role: req.role,
                computer_id: None,
                voice_agent_id: req.voice_agent_id,
                agent_metadata: req.agent_metadata,
            },
            UpsertFlags::default(),
        )
        .await;

    ok(json!({
        "success": true,
        "roomId": room.room_id(),
        "assignment": assignment,
    }))
}

async fn list_npcs(State(shared): State<AppState>) -> Response {
    let npcs = shared.directory.list_npc_assignments().await;
    ok(json!({ "success": true, "npcs": npcs }))
}

async fn room_by_namespace(
    State(shared): State<AppState>,
    Path(slug): Path<String>,
) -> Response {
    if let Some(room) = shared.directory.get_by_namespace(&slug).await {
        return ok(json!({
            "success": true,
            "room": {
                "roomId": room.room_id(),
                "name": room.name(),
                "namespaceSlug": room.namespace_slug(),
                "metadata": room.metadata().await,
                "clients": room.client_count().await,
            },
        }));
    }
    if let Some(listing) = shared.matchmaker.find_by_namespace(&slug).await {
        return ok(json!({ "success": true, "room": listing }));
    }
    err(StatusCode::NOT_FOUND, "no room for namespace")
}

async fn office_agents(
    State(shared): State<AppState>,
    Path(office_id): Path<String>,
) -> Response {
    let mut agents = shared.registry.list_agents(&office_id).await;

    if agents.is_empty() {
        // The caller may have handed us a slug or a domain instead of the
        // office id; reconcile against the office list.
        let needle = office_id.trim().to_lowercase();
        let offices = shared.registry.list_offices().await;
        let matched = offices.iter().find(|o| {
            o.office_id().map(|v| v.eq_ignore_ascii_case(&needle)) == Some(true)
                || o.id.as_deref().map(|v| v.eq_ignore_ascii_case(&needle)) == Some(true)
                || o.slug().as_deref() == Some(needle.as_str())
                || o.domain.as_deref().map(|d| {
                    let d = d.to_lowercase();
                    d == needle
                        || d.ends_with(&format!(".{needle}"))
                        || needle.ends_with(&format!(".{d}"))
                }) == Some(true)
        });
        if let Some(office) = matched {
            if let Some(real_id) = office.office_id() {
                agents = shared.registry.list_agents(real_id).await;
            }
        }
    }

    if !agents.is_empty() {
        return ok(json!({ "success": true, "agents": agents }));
    }

    // Last resort: synthesize agents from what this process already knows.
    let needle = office_id.trim().to_lowercase();
    let fallback = shared
        .directory
        .list_npc_assignments()
        .await
        .into_iter()
        .filter(|a| {
            a.office_id
                .as_deref()
                .map(|o| o.eq_ignore_ascii_case(&needle))
                .unwrap_or(false)
                || a.namespace_slug == needle
        })
        .map(|a| {
            json!({
                "id": a.registry_agent_id.clone().unwrap_or_else(|| a.agent_id.clone()),
                "agentIdentifier": a.agent_id,
                "avatarId": a.avatar_id,
                "role": a.role,
                "metadata": {
                    "spawn": {
                        "position": { "x": a.position.x, "y": a.position.y },
                        "workstationId": a.workstation_id,
                        "voiceAgentId": a.voice_agent_id,
                    },
                },
                "synthesized": true,
            })
        })
        .collect::<Vec<_>>();
    ok(json!({ "success": true, "agents": fallback, "fallback": true }))
}

async fn destroy_room(State(shared): State<AppState>, Path(slug): Path<String>) -> Response {
    let result = shared.directory.destroy_namespace(&shared, &slug).await;

    // Fire-and-forget cache invalidation toward the chat bridge; never
    // blocks or fails the HTTP response.
    let bridge = shared.cfg.chat_bridge_url.trim_end_matches('/').to_string();
    let agent_ids = result.removed_agents.clone();
    let ns = slug.clone();
    tokio::spawn(async move {
        let url = format!("{bridge}/api/aladdin/cache/invalidate");
        let body = json!({ "agentIds": agent_ids, "namespaceSlug": ns });
        match reqwest::Client::new()
            .post(&url)
            .json(&body)
            .timeout(std::time::Duration::from_secs(5))
            .send()
            .await
        {
            Ok(resp) if !resp.status().is_success() => {
                warn!(status = %resp.status(), url = %url, "chat bridge invalidate rejected");
            }
            Err(e) => warn!(err = %e, url = %url, "chat bridge invalidate failed"),
            _ => {}
        }
    });

    ok(json!({
        "success": true,
        "removedRooms": result.removed_rooms,
        "removedAgents": result.removed_agents,
    }))
}

async fn remove_npc_everywhere(
    State(shared): State<AppState>,
    Path(agent_id): Path<String>,
) -> Response {
    // Advisory gate only; the removal below walks every room regardless.
    // TODO: drop this gate so persisted rows can be purged with zero rooms up.
    if shared.directory.get_any_active_room().await.is_none() {
        return err(StatusCode::SERVICE_UNAVAILABLE, "no active room");
    }

    let mut removed_from = Vec::new();
    for room in shared.directory.all_rooms().await {
        if room.remove_npc(&agent_id).await.is_some() {
            removed_from.push(room.room_id().to_string());
        }
    }
    let row_deleted = shared
        .store
        .remove_npc(&agent_id.to_lowercase())
        .unwrap_or(false);

    if removed_from.is_empty() && !row_deleted {
        return err(StatusCode::NOT_FOUND, "unknown agent");
    }
    ok(json!({
        "success": true,
        "agentId": agent_id.to_lowercase(),
        "removedFrom": removed_from,
    }))
}

#[derive(Debug, Deserialize)]
struct PathfindReq {
    start: Position,
    target: Position,
}

async fn pathfind(State(shared): State<AppState>, Json(req): Json<PathfindReq>) -> Response {
    if !req.start.x.is_finite()
        || !req.start.y.is_finite()
        || !req.target.x.is_finite()
        || !req.target.y.is_finite()
    {
        return err(StatusCode::BAD_REQUEST, "start/target must be numeric");
    }
    let Some(map) = shared.walkmap.clone() else {
        return err(StatusCode::SERVICE_UNAVAILABLE, "pathfinding unavailable");
    };

    // CPU-bound; keep it off the async workers.
    let start = (req.start.x, req.start.y);
    let target = (req.target.x, req.target.y);
    let path = tokio::task::spawn_blocking(move || map.find_path(start, target)).await;
    match path {
        Ok(Some(points)) => ok(json!({
            "success": true,
            "path": points
                .into_iter()
                .map(|(x, y)| json!({ "x": x, "y": y }))
                .collect::<Vec<_>>(),
        })),
        Ok(None) => err(StatusCode::NOT_FOUND, "Path not found"),
        Err(e) => {
            warn!(err = %e, "pathfind worker failed");
            err(StatusCode::INTERNAL_SERVER_ERROR, "pathfind failed")
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistNpcReq {
    #[serde(flatten)]
    update: NpcStateUpdate,
    #[serde(default)]
    namespace_slug: Option<String>,
}

async fn persist_npc(
    State(shared): State<AppState>,
    Path(agent_id): Path<String>,
    Json(req): Json<PersistNpcReq>,
) -> Response {
    let mut update = req.update;
    if update.is_empty() {
        return err(StatusCode::BAD_REQUEST, "no fields to persist");
    }
    if let Some(p) = update.position.as_mut() {
        if !p.x.is_finite() || !p.y.is_finite() {
            return err(StatusCode::BAD_REQUEST, "position must be numeric");
        }
        p.x = p.x.round();
        p.y = p.y.round();
    }

    let room = match req.namespace_slug.as_deref() {
        Some(slug) => shared.directory.get_by_namespace(slug).await,
        None => None,
    };
    let room = match room {
        Some(r) => Some(r),
        None => shared.directory.find_room_with_agent(&agent_id).await,
    };
    let room = match room {
        Some(r) => Some(r),
        None => shared.directory.get_any_active_room().await,
    };
    let Some(room) = room else {
        return err(StatusCode::SERVICE_UNAVAILABLE, "no active room");
    };

    match room.update_npc_state(&agent_id, update).await {
        Some(assignment) => ok(json!({ "success": true, "assignment": assignment })),
        None => err(StatusCode::NOT_FOUND, "unknown agent"),
    }
}
