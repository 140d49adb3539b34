//! In-process matchmaker: the room listings clients discover rooms through.
//!
//! The transport's real matchmaker lives outside the core; this registry
//! keeps the same narrow surface (list, query, remove, lobby events) so the
//! reconciler and the admin API can speak to it.

use std::collections::{HashMap, HashSet};

use officeproto::RoomType;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomListing {
    pub room_id: String,
    pub name: String,
    pub room_type: RoomType,
    pub metadata: serde_json::Value,
    pub clients: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LobbyEvent {
    RoomListed { room_id: String },
    RoomRemoved { room_id: String },
}

pub struct Matchmaker {
    listings: Mutex<HashMap<String, RoomListing>>,
    lobby_tx: broadcast::Sender<LobbyEvent>,
}

impl Default for Matchmaker {
    fn default() -> Self {
        Self::new()
    }
}

impl Matchmaker {
    pub fn new() -> Self {
        let (lobby_tx, _) = broadcast::channel(64);
        Self {
            listings: Mutex::new(HashMap::new()),
            lobby_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LobbyEvent> {
        self.lobby_tx.subscribe()
    }

    pub async fn upsert_listing(&self, listing: RoomListing) {
        let room_id = listing.room_id.clone();
        self.listings.lock().await.insert(room_id.clone(), listing);
        let _ = self.lobby_tx.send(LobbyEvent::RoomListed { room_id });
    }

    pub async fn update_listing(&self, room_id: &str, metadata: serde_json::Value, clients: usize) {
        if let Some(l) = self.listings.lock().await.get_mut(room_id) {
            l.metadata = metadata;
            l.clients = clients;
        }
    }

    pub async fn remove_listing(&self, room_id: &str) -> bool {
        let removed = self.listings.lock().await.remove(room_id).is_some();
        if removed {
            let _ = self.lobby_tx.send(LobbyEvent::RoomRemoved {
                room_id: room_id.to_string(),
            });
        }
        removed
    }

    pub async fn all(&self) -> Vec<RoomListing> {
        self.listings.lock().await.values().cloned().collect()
    }

    /// Listing whose name or namespace metadata matches `slug`.
    pub async fn find_by_namespace(&self, slug: &str) -> Option<RoomListing> {
        let slug = slug.trim().to_lowercase();
        self.listings
            .lock()
            .await
            .values()
            .find(|l| listing_matches(l, &slug))
            .cloned()
    }

    /// Remove every listing touching any of the namespace candidates.
    /// Returns the removed room ids; each removal is announced to the lobby.
    pub async fn remove_matching(&self, candidates: &HashSet<String>) -> Vec<String> {
        let mut removed = Vec::new();
        {
            let mut listings = self.listings.lock().await;
            listings.retain(|room_id, l| {
                let hit = candidates.contains(&l.name.to_lowercase())
                    || candidates.contains(room_id)
                    || candidates.iter().any(|c| listing_matches(l, c));
                if hit {
                    removed.push(room_id.clone());
                }
                !hit
            });
        }
        for room_id in &removed {
            let _ = self.lobby_tx.send(LobbyEvent::RoomRemoved {
                room_id: room_id.clone(),
            });
        }
        removed
    }
}

fn listing_matches(l: &RoomListing, slug: &str) -> bool {
    if l.name.to_lowercase() == slug || l.room_id == slug {
        return true;
    }
    let meta_str = |key: &str| {
        l.metadata
            .get(key)
            .and_then(|v| v.as_str())
            .map(|s| s.to_lowercase())
    };
    meta_str("namespaceSlug").as_deref() == Some(slug)
        || meta_str("registryDomain").as_deref() == Some(slug)
        || meta_str("name").as_deref() == Some(slug)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(room_id: &str, name: &str, slug: &str) -> RoomListing {
        RoomListing {
            room_id: room_id.to_string(),
            name: name.to_string(),
            room_type: RoomType::Public,
            metadata: serde_json::json!({ "namespaceSlug": slug }),
            clients: 0,
        }
    }

    #[tokio::test]
    async fn find_by_namespace_matches_name_and_metadata() {
        let mm = Matchmaker::new();
        mm.upsert_listing(listing("r1", "acme", "acme")).await;
        mm.upsert_listing(listing("r2", "Public Lobby", "public")).await;

        assert_eq!(mm.find_by_namespace("ACME").await.unwrap().room_id, "r1");
        assert_eq!(mm.find_by_namespace("public").await.unwrap().room_id, "r2");
        assert!(mm.find_by_namespace("ghost").await.is_none());
    }

    #[tokio::test]
    async fn remove_matching_announces_to_lobby() {
        let mm = Matchmaker::new();
        let mut rx = mm.subscribe();
        mm.upsert_listing(listing("r1", "acme", "acme")).await;
        mm.upsert_listing(listing("r2", "beta", "beta")).await;
        // Drain the listing announcements.
        while rx.try_recv().is_ok() {}

        let candidates: HashSet<String> = ["acme".to_string()].into();
        let removed = mm.remove_matching(&candidates).await;
        assert_eq!(removed, vec!["r1".to_string()]);
        assert_eq!(mm.all().await.len(), 1);

        match rx.try_recv().unwrap() {
            LobbyEvent::RoomRemoved { room_id } => assert_eq!(room_id, "r1"),
            other => panic!("unexpected lobby event: {other:?}"),
        }
    }
}
