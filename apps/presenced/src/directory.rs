//! Process-wide room indexes and namespace teardown.
//!
//! Two maps (`roomId -> Room`, `namespaceSlug -> Room`) behind one mutex.
//! `createRoom` and `dispose` race: a replacement room can be registered
//! under a slug before the old instance finishes disposing, so the
//! namespace entry is only evicted when it still points at the disposing
//! instance.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::room::{NpcAssignment, Room};
use crate::state::Shared;

#[derive(Default)]
struct DirInner {
    by_room_id: HashMap<String, Arc<Room>>,
    by_namespace: HashMap<String, Arc<Room>>,
}

#[derive(Default)]
pub struct RoomDirectory {
    inner: Mutex<DirInner>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DestroyResult {
    pub removed_rooms: Vec<String>,
    pub removed_agents: Vec<String>,
}

impl RoomDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, room: &Arc<Room>) {
        let mut inner = self.inner.lock().await;
        inner
            .by_room_id
            .insert(room.room_id().to_string(), room.clone());
        inner
            .by_namespace
            .insert(room.namespace_slug().to_string(), room.clone());
    }

    /// Compare-on-delete: the namespace entry is only dropped if it still
    /// maps to `room`.
    pub async fn unregister(&self, room: &Arc<Room>) {
        let mut inner = self.inner.lock().await;
        inner.by_room_id.remove(room.room_id());
        let still_ours = inner
            .by_namespace
            .get(room.namespace_slug())
            .map(|r| Arc::ptr_eq(r, room))
            .unwrap_or(false);
        if still_ours {
            inner.by_namespace.remove(room.namespace_slug());
        }
    }

    pub async fn get_by_room_id(&self, room_id: &str) -> Option<Arc<Room>> {
        self.inner.lock().await.by_room_id.get(room_id).cloned()
    }

    pub async fn get_by_namespace(&self, slug: &str) -> Option<Arc<Room>> {
        let slug = slug.trim().to_lowercase();
        self.inner.lock().await.by_namespace.get(&slug).cloned()
    }

    pub async fn get_any_active_room(&self) -> Option<Arc<Room>> {
        self.inner.lock().await.by_room_id.values().next().cloned()
    }

    pub async fn active_room_count(&self) -> usize {
        self.inner.lock().await.by_room_id.len()
    }

    pub async fn all_rooms(&self) -> Vec<Arc<Room>> {
        self.inner.lock().await.by_room_id.values().cloned().collect()
    }

    /// Linear scan for the room holding an assignment for `agent_id`.
    pub async fn find_room_with_agent(&self, agent_id: &str) -> Option<Arc<Room>> {
        let rooms = self.all_rooms().await;
        for room in rooms {
            if room.has_agent(agent_id).await {
                return Some(room);
            }
        }
        None
    }

    pub async fn list_npc_assignments(&self) -> Vec<NpcAssignment> {
        let rooms = self.all_rooms().await;
        let mut out = Vec::new();
        for room in rooms {
            out.extend(room.assignments().await);
        }
        out
    }

    /// Tear down every registry-backed room whose namespace (or its head
    /// segment) is no longer declared by the Registry.
    pub async fn prune_namespaces_not_in(
        &self,
        shared: &Arc<Shared>,
        valid: &HashSet<String>,
    ) -> Vec<DestroyResult> {
        let rooms = self.all_rooms().await;
        let mut results = Vec::new();
        for room in rooms {
            if !room.is_registry_backed() {
                continue;
            }
            let slug = room.namespace_slug().to_string();
            let head = slug.split('.').next().unwrap_or(&slug).to_string();
            if valid.contains(&slug) || valid.contains(&head) {
                continue;
            }
            info!(slug = %slug, "pruning namespace no longer declared by registry");
            results.push(self.destroy_namespace(shared, &slug).await);
        }
        results
    }

    /// Full namespace teardown: rooms, their NPCs, persisted rows and
    /// matchmaker listings. Best-effort throughout; sub-step failures are
    /// logged and the rest of the cleanup continues.
    pub async fn destroy_namespace(&self, shared: &Arc<Shared>, slug: &str) -> DestroyResult {
        let slug = slug.trim().to_lowercase();
        let head = slug.split('.').next().unwrap_or(&slug).to_string();
        let mut candidates: HashSet<String> = HashSet::new();
        candidates.insert(slug.clone());
        candidates.insert(head);
        candidates.insert(format!("{slug}.{}", shared.cfg.base_domain));

        let mut result = DestroyResult::default();

        // Rooms currently serving any candidate namespace.
        let mut rooms: Vec<Arc<Room>> = Vec::new();
        {
            let inner = self.inner.lock().await;
            for cand in &candidates {
                if let Some(room) = inner.by_namespace.get(cand) {
                    if !rooms.iter().any(|r| Arc::ptr_eq(r, room)) {
                        rooms.push(room.clone());
                    }
                }
            }
        }

        for room in rooms {
            for assignment in room.assignments().await {
                let ns = assignment.namespace_slug.to_lowercase();
                if candidates.contains(&ns) || ns == room.namespace_slug() {
                    if room.remove_npc(&assignment.agent_id).await.is_some() {
                        result.removed_agents.push(assignment.agent_id);
                    }
                }
            }
            room.dispose().await;
            if let Err(e) = shared.store.delete_room_by_name(room.name()) {
                warn!(err = %e, room = %room.name(), "failed deleting room row");
            }
            result.removed_rooms.push(room.room_id().to_string());
        }

        let removed_listings = shared.matchmaker.remove_matching(&candidates).await;
        for id in removed_listings {
            if !result.removed_rooms.contains(&id) {
                result.removed_rooms.push(id);
            }
        }

        // Residual persisted rows (rooms that never came up this process).
        match shared.store.all_npcs() {
            Ok(rows) => {
                for row in rows {
                    let ns = row
                        .namespace_slug
                        .as_deref()
                        .unwrap_or("")
                        .to_lowercase();
                    let room_name = row.room_name.to_lowercase();
                    if candidates.contains(&ns) || candidates.contains(&room_name) {
                        if let Err(e) = shared.store.remove_npc(&row.agent_id) {
                            warn!(err = %e, agent = %row.agent_id, "failed purging npc row");
                        } else if !result.removed_agents.contains(&row.agent_id) {
                            result.removed_agents.push(row.agent_id);
                        }
                    }
                }
            }
            Err(e) => warn!(err = %e, "failed scanning npc rows during namespace destroy"),
        }

        info!(
            slug = %slug,
            rooms = result.removed_rooms.len(),
            agents = result.removed_agents.len(),
            "namespace destroyed"
        );
        result
    }
}
