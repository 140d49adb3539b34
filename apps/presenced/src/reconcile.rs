//! Registry reconciliation: make the room directory converge toward the set
//! of offices the Registry declares.
//!
//! One pass fetches the offices, ensures a room per namespace, schedules a
//! per-office agent sync (room creation is asynchronous, so that sync polls
//! for the room with bounded backoff) and prunes registry-backed rooms whose
//! office disappeared. A boolean gate keeps passes from overlapping; every
//! failure is logged and retried by the next tick.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use registry_client::{RegistryAgent, RegistryOffice};
use tracing::{debug, info, warn};

use crate::room::{CreateRoomOptions, NpcUpsert, Position, Room, UpsertFlags};
use crate::state::Shared;

const AGENT_SYNC_MAX_ATTEMPTS: u64 = 8;

/// Bootstrap shape: wipe the persisted rooms/NPCs and rebuild from the
/// Registry in one pass.
pub async fn bootstrap(shared: &Arc<Shared>) {
    if let Err(e) = shared.store.clear_all_rooms() {
        warn!(err = %e, "bootstrap: failed truncating rooms");
    }
    if let Err(e) = shared.store.clear_all_npcs() {
        warn!(err = %e, "bootstrap: failed truncating npcs");
    }
    info!("bootstrap: persisted state truncated");
    ensure_registry_rooms(shared).await;
}

/// Periodic shape: run `ensure_registry_rooms` on an interval. The first
/// tick fires immediately.
pub fn spawn_periodic(shared: Arc<Shared>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_millis(shared.cfg.sync_interval_ms.max(1_000));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            ensure_registry_rooms(&shared).await;
        }
    })
}

pub async fn ensure_registry_rooms(shared: &Arc<Shared>) {
    // Only one pass in flight; overlapping ticks return immediately.
    if shared.sync_in_flight.swap(true, Ordering::SeqCst) {
        debug!("registry sync already in flight; skipping tick");
        return;
    }
    run_pass(shared).await;
    shared.sync_in_flight.store(false, Ordering::SeqCst);
}

async fn run_pass(shared: &Arc<Shared>) {
    if !shared.registry.configured() {
        return;
    }
    let offices = shared.registry.list_offices().await;
    // A failed fetch flattens to an empty list, so an outage prunes every
    // registry-backed room for one interval; the next successful tick
    // recreates them.
    let valid = valid_namespaces(&offices);

    for office in &offices {
        let Some(slug) = office.slug() else {
            continue;
        };
        if shared.directory.get_by_namespace(&slug).await.is_none() {
            let opts = CreateRoomOptions {
                name: slug.clone(),
                namespace_slug: Some(slug.clone()),
                metadata: registry_room_metadata(office, &slug),
                description: office
                    .display_name
                    .clone()
                    .unwrap_or_else(|| slug.clone()),
                ..Default::default()
            };
            if let Err(e) = Room::create(shared, opts).await {
                warn!(err = %e, slug = %slug, "failed creating registry room");
                continue;
            }
        }
        tokio::spawn(sync_office_agents(shared.clone(), office.clone()));
    }

    shared.directory.prune_namespaces_not_in(shared, &valid).await;
}

/// Namespaces the Registry still vouches for: every slug plus every office
/// domain and its head segment.
fn valid_namespaces(offices: &[RegistryOffice]) -> HashSet<String> {
    let mut valid = HashSet::new();
    for office in offices {
        if let Some(slug) = office.slug() {
            valid.insert(slug);
        }
        if let Some(domain) = office.domain.as_deref() {
            let domain = domain.trim().to_lowercase();
            if !domain.is_empty() {
                if let Some(head) = domain.split('.').next() {
                    valid.insert(head.to_string());
                }
                valid.insert(domain);
            }
        }
    }
    valid
}

fn registry_room_metadata(
    office: &RegistryOffice,
    slug: &str,
) -> serde_json::Map<String, serde_json::Value> {
    let mut m = serde_json::Map::new();
    m.insert("registryBacked".into(), true.into());
    m.insert(
        "registryOfficeId".into(),
        office.office_id().map(Into::into).unwrap_or(serde_json::Value::Null),
    );
    m.insert(
        "registryId".into(),
        office.id.clone().map(Into::into).unwrap_or(serde_json::Value::Null),
    );
    m.insert(
        "registryDomain".into(),
        office
            .domain
            .as_deref()
            .map(|d| d.to_lowercase().into())
            .unwrap_or(serde_json::Value::Null),
    );
    m.insert(
        "registryStatus".into(),
        office.status.clone().map(Into::into).unwrap_or(serde_json::Value::Null),
    );
    m.insert("namespaceSlug".into(), slug.into());
    m.insert(
        "displayName".into(),
        office
            .display_name
            .clone()
            .map(Into::into)
            .unwrap_or(serde_json::Value::Null),
    );
    m.insert(
        "registryMetadata".into(),
        office.metadata.clone().unwrap_or(serde_json::Value::Null),
    );
    m
}

/// Upsert every registry agent into the office's room. Room creation is
/// asynchronous, so poll for the room with `min(500*attempt, 3000)` ms
/// backoff before giving up.
async fn sync_office_agents(shared: Arc<Shared>, office: RegistryOffice) {
    let Some(slug) = office.slug() else {
        return;
    };
    let mut room = None;
    for attempt in 0..AGENT_SYNC_MAX_ATTEMPTS {
        if let Some(r) = shared.directory.get_by_namespace(&slug).await {
            room = Some(r);
            break;
        }
        tokio::time::sleep(Duration::from_millis((500 * attempt).min(3_000))).await;
    }
    let Some(room) = room else {
        warn!(slug = %slug, "room never appeared; skipping agent sync");
        return;
    };
    let Some(office_id) = office.office_id() else {
        return;
    };

    let agents = shared.registry.list_agents(office_id).await;
    for agent in &agents {
        let payload = npc_payload(&shared, &office, agent);
        // Persistence is suppressed here and the row written directly
        // below; the registry patch is not, so every pass re-patches every
        // agent.
        // TODO: diff against the previous assignment and skip the registry
        // patch when nothing changed.
        let assignment = room
            .upsert_npc(
                payload,
                UpsertFlags {
                    skip_persistence: true,
                    skip_registry_sync: false,
                },
            )
            .await;
        room.persist_assignment(&assignment);
    }
    if !agents.is_empty() {
        debug!(slug = %slug, agents = agents.len(), "office agents synced");
    }
}

/// Stable, DNS-ish identity for an agent. Prefers domains the registry
/// already declares; otherwise composes `label.slug.base_domain`.
pub fn derive_agent_identifier(
    office: &RegistryOffice,
    agent: &RegistryAgent,
    base_domain: &str,
) -> String {
    let meta_str = |key: &str| {
        agent
            .metadata
            .as_ref()
            .and_then(|m| m.get(key))
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
    };

    let candidate = meta_str("defaultAgentDomain")
        .or_else(|| meta_str("agentDomain"))
        .or_else(|| meta_str("domain"))
        .or_else(|| {
            agent
                .agent_identifier
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
        })
        .or_else(|| meta_str("defaultAgentId"))
        .or_else(|| meta_str("agentIdentifier"))
        .unwrap_or_else(|| agent.id.clone());

    if candidate.contains('.') {
        return candidate.to_lowercase();
    }

    let label = sanitize_label(&candidate);
    if let Some(domain) = office
        .domain
        .as_deref()
        .map(str::trim)
        .filter(|d| !d.is_empty())
    {
        return format!("{label}.{}", domain.to_lowercase());
    }
    let slug = office.slug().unwrap_or_else(|| "office".to_string());
    format!("{label}.{slug}.{base_domain}")
}

/// `[^a-z0-9-]` becomes `-`, runs collapse, edges trim, empty falls back to
/// "agent".
fn sanitize_label(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut pending_dash = false;
    for c in s.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c);
        } else {
            pending_dash = true;
        }
    }
    if out.is_empty() {
        "agent".to_string()
    } else {
        out
    }
}

/// Build the room upsert for a registry agent from its spawn config,
/// enriching the carried metadata with identity stamps.
fn npc_payload(shared: &Shared, office: &RegistryOffice, agent: &RegistryAgent) -> NpcUpsert {
    let identifier = derive_agent_identifier(office, agent, &shared.cfg.base_domain);
    let meta = agent.metadata.clone().unwrap_or(serde_json::Value::Null);
    let spawn = meta
        .get("spawn")
        .filter(|v| v.is_object())
        .or_else(|| meta.get("spawnConfig").filter(|v| v.is_object()))
        .unwrap_or(&meta);

    let position = spawn
        .get("position")
        .map(|p| Position {
            x: p.get("x").and_then(|v| v.as_f64()).unwrap_or(800.0),
            y: p.get("y").and_then(|v| v.as_f64()).unwrap_or(200.0),
        })
        .unwrap_or(Position { x: 800.0, y: 200.0 });
    let workstation_id = spawn
        .get("workstationId")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("design-studio")
        .to_string();
    let voice_agent_id = spawn
        .get("voiceAgentId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .or_else(|| agent.agent_email.clone())
        .unwrap_or_else(|| shared.cfg.default_voice_agent_id.clone());
    let avatar_id = spawn
        .get("avatarId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .or_else(|| agent.avatar_id.clone());

    let display_name = meta
        .get("displayName")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .or_else(|| agent.agent_identifier.clone())
        .unwrap_or_else(|| identifier.clone());

    let nickname = meta
        .get("nickname")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .or_else(|| {
            spawn
                .get("aliases")
                .and_then(|v| v.as_array())
                .and_then(|a| a.first())
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        })
        .unwrap_or_else(|| display_name.clone());

    let office_default_id = office
        .metadata
        .as_ref()
        .and_then(|m| m.get("defaultAgentId"))
        .and_then(|v| v.as_str());
    let is_default = office_default_id == Some(agent.id.as_str())
        || meta.get("default").and_then(|v| v.as_bool()).unwrap_or(false);

    let mut enriched = match meta {
        serde_json::Value::Object(m) => m,
        _ => serde_json::Map::new(),
    };
    enriched.insert("displayName".into(), display_name.clone().into());
    enriched.insert("nickname".into(), nickname.into());
    enriched.insert(
        "defaultAgentEmail".into(),
        agent
            .agent_email
            .clone()
            .map(Into::into)
            .unwrap_or(serde_json::Value::Null),
    );
    if is_default {
        enriched.insert("default".into(), true.into());
        enriched.insert("defaultAgentId".into(), agent.id.clone().into());
        enriched.insert("defaultAgentDomain".into(), identifier.clone().into());
        enriched.insert("agentDomain".into(), identifier.clone().into());
    }

    NpcUpsert {
        agent_id: identifier,
        registry_agent_id: Some(agent.id.clone()),
        office_id: office.office_id().map(|s| s.to_string()),
        name: display_name,
        avatar_id,
        workstation_id: Some(workstation_id),
        position: Some(position),
        role: agent.role.clone(),
        computer_id: None,
        voice_agent_id: Some(voice_agent_id),
        agent_metadata: Some(serde_json::Value::Object(enriched)),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use axum::extract::{Path as UrlPath, State};
    use axum::routing::get;
    use axum::Json;
    use registry_client::RegistryClient;

    use super::*;
    use crate::testutil::{test_shared, test_shared_with_registry};

    fn office(slug: &str, domain: Option<&str>) -> RegistryOffice {
        serde_json::from_value(serde_json::json!({
            "officeId": "off_1",
            "namespaceSlug": slug,
            "domain": domain,
            "metadata": { "defaultAgentId": "agent_default" },
        }))
        .unwrap()
    }

    fn agent(id: &str, identifier: Option<&str>, metadata: serde_json::Value) -> RegistryAgent {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "agentIdentifier": identifier,
            "agentEmail": "ada@acme.test",
            "role": "Engineer",
            "metadata": metadata,
        }))
        .unwrap()
    }

    #[test]
    fn valid_namespaces_include_domains_and_heads() {
        let offices = vec![
            office("acme", Some("Acme.Example.Com")),
            office("beta", None),
        ];
        let valid = valid_namespaces(&offices);
        assert!(valid.contains("acme"));
        assert!(valid.contains("beta"));
        assert!(valid.contains("acme.example.com"));
        // Head segment of the domain.
        assert!(valid.contains("acme"));
        assert_eq!(valid.len(), 3);
    }

    #[test]
    fn identifier_prefers_declared_domains() {
        let o = office("acme", None);
        let a = agent(
            "agent_1",
            Some("Ada"),
            serde_json::json!({ "defaultAgentDomain": "Ada.Custom.Dev" }),
        );
        assert_eq!(derive_agent_identifier(&o, &a, "office.xyz"), "ada.custom.dev");
    }

    #[test]
    fn identifier_composes_from_label_and_slug() {
        let o = office("acme", None);
        let a = agent("agent_1", Some("Ada Lovelace!"), serde_json::json!({}));
        assert_eq!(
            derive_agent_identifier(&o, &a, "office.xyz"),
            "ada-lovelace.acme.office.xyz"
        );
    }

    #[test]
    fn identifier_uses_office_domain_when_present() {
        let o = office("acme", Some("acme.example.com"));
        let a = agent("agent_1", Some("Ada"), serde_json::json!({}));
        assert_eq!(
            derive_agent_identifier(&o, &a, "office.xyz"),
            "ada.acme.example.com"
        );
    }

    #[test]
    fn identifier_falls_back_to_agent_id() {
        let o = office("acme", None);
        let a = agent("!!", None, serde_json::json!({}));
        assert_eq!(
            derive_agent_identifier(&o, &a, "office.xyz"),
            "agent.acme.office.xyz"
        );
    }

    #[test]
    fn sanitize_label_collapses_runs_and_trims() {
        assert_eq!(sanitize_label("Ada  Lovelace"), "ada-lovelace");
        assert_eq!(sanitize_label("--x--"), "x");
        assert_eq!(sanitize_label("A__B"), "a-b");
        assert_eq!(sanitize_label("###"), "agent");
    }

    #[tokio::test]
    async fn npc_payload_applies_spawn_and_defaults() {
        let shared = test_shared().await;
        let o = office("acme", None);
        let a = agent(
            "agent_default",
            Some("Ada"),
            serde_json::json!({
                "spawn": {
                    "position": { "x": 10, "y": 20 },
                    "workstationId": "ops-desk",
                    "aliases": ["adabot"],
                },
            }),
        );
        let p = npc_payload(&shared, &o, &a);
        assert_eq!(p.agent_id, "ada.acme.office.xyz");
        assert_eq!(p.registry_agent_id.as_deref(), Some("agent_default"));
        assert_eq!(p.office_id.as_deref(), Some("off_1"));
        assert_eq!(p.workstation_id.as_deref(), Some("ops-desk"));
        assert_eq!(p.position, Some(Position { x: 10.0, y: 20.0 }));
        // Email beats the configured default voice id.
        assert_eq!(p.voice_agent_id.as_deref(), Some("ada@acme.test"));
        assert_eq!(p.role.as_deref(), Some("Engineer"));

        let meta = p.agent_metadata.unwrap();
        assert_eq!(meta.get("nickname").unwrap(), "adabot");
        assert_eq!(meta.get("defaultAgentEmail").unwrap(), "ada@acme.test");
        // This agent is the office default.
        assert_eq!(meta.get("default").unwrap(), true);
        assert_eq!(meta.get("defaultAgentId").unwrap(), "agent_default");
        assert_eq!(meta.get("agentDomain").unwrap(), "ada.acme.office.xyz");
    }

    #[tokio::test]
    async fn npc_payload_defaults_without_spawn_config() {
        let shared = test_shared().await;
        let o = office("acme", None);
        let mut a = agent("agent_2", Some("Bob"), serde_json::json!({}));
        a.agent_email = None;
        let p = npc_payload(&shared, &o, &a);
        assert_eq!(p.workstation_id.as_deref(), Some("design-studio"));
        assert_eq!(p.position, Some(Position { x: 800.0, y: 200.0 }));
        assert_eq!(p.voice_agent_id.as_deref(), Some("agent_test_voice"));
        let meta = p.agent_metadata.unwrap();
        assert!(meta.get("default").is_none());
    }

    #[tokio::test]
    async fn gate_blocks_overlapping_passes() {
        let shared = test_shared().await;
        shared.sync_in_flight.store(true, Ordering::SeqCst);
        // Returns immediately instead of running a pass (the unconfigured
        // registry would make a real pass a no-op anyway, but the gate must
        // stay set for the in-flight owner).
        ensure_registry_rooms(&shared).await;
        assert!(shared.sync_in_flight.load(Ordering::SeqCst));
        shared.sync_in_flight.store(false, Ordering::SeqCst);
    }

    // ---- end-to-end passes against a stub Registry -----------------------

    type StubState = (Arc<StdMutex<serde_json::Value>>, serde_json::Value);

    async fn offices_route(State((offices, _)): State<StubState>) -> Json<serde_json::Value> {
        Json(offices.lock().unwrap().clone())
    }

    async fn agents_route(
        UrlPath(_office_id): UrlPath<String>,
        State((_, agents)): State<StubState>,
    ) -> Json<serde_json::Value> {
        Json(agents)
    }

    /// Serve `/offices` and `/offices/:id/agents` with canned JSON on an
    /// ephemeral port. The offices fixture stays mutable so a test can
    /// change the Registry's answer between ticks.
    async fn spawn_registry_stub(
        offices: serde_json::Value,
        agents: serde_json::Value,
    ) -> (String, Arc<StdMutex<serde_json::Value>>) {
        let offices = Arc::new(StdMutex::new(offices));
        let app = axum::Router::new()
            .route("/offices", get(offices_route))
            .route("/offices/:office_id/agents", get(agents_route))
            .with_state((offices.clone(), agents));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (format!("http://{addr}"), offices)
    }

    fn registry_backed_opts(name: &str) -> CreateRoomOptions {
        let mut metadata = serde_json::Map::new();
        metadata.insert("registryBacked".into(), true.into());
        CreateRoomOptions {
            name: name.to_string(),
            metadata,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn ensure_pass_creates_syncs_and_prunes_through_the_registry() {
        let (base, _offices) = spawn_registry_stub(
            serde_json::json!([{ "officeId": "off_alpha", "namespaceSlug": "alpha" }]),
            serde_json::json!([{ "id": "agent_1", "agentIdentifier": "Ada", "avatarId": "adam" }]),
        )
        .await;
        let shared = test_shared_with_registry(RegistryClient::new(Some(base), None)).await;

        // A stale registry-backed room the Registry no longer declares.
        Room::create(&shared, registry_backed_opts("beta")).await.unwrap();

        ensure_registry_rooms(&shared).await;

        let alpha = shared
            .directory
            .get_by_namespace("alpha")
            .await
            .expect("alpha room created");
        assert!(alpha.is_registry_backed());
        assert!(shared.directory.get_by_namespace("beta").await.is_none());
        assert!(!shared.sync_in_flight.load(Ordering::SeqCst));

        // Agent sync runs as a background task; poll for its upsert.
        let mut synced = false;
        for _ in 0..100 {
            if alpha.has_agent("ada.alpha.office.xyz").await {
                synced = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(synced, "registry agent never upserted into alpha");
        assert!(shared
            .store
            .all_npcs()
            .unwrap()
            .iter()
            .any(|r| r.agent_id == "ada.alpha.office.xyz" && r.room_name == "alpha"));
    }

    #[tokio::test]
    async fn empty_offices_answer_prunes_and_next_tick_recovers() {
        let (base, offices) = spawn_registry_stub(
            serde_json::json!([]),
            serde_json::json!([]),
        )
        .await;
        let shared = test_shared_with_registry(RegistryClient::new(Some(base), None)).await;

        Room::create(&shared, registry_backed_opts("alpha")).await.unwrap();
        Room::create(
            &shared,
            CreateRoomOptions {
                name: "Public Lobby".to_string(),
                namespace_slug: Some("public".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        // The prune is unconditional: a zero-office answer (or a failed
        // fetch, which the client flattens to one) tears registry-backed
        // rooms down within the tick. Human rooms are untouched.
        ensure_registry_rooms(&shared).await;
        assert!(shared.directory.get_by_namespace("alpha").await.is_none());
        assert!(shared.directory.get_by_namespace("public").await.is_some());

        // The next tick that sees the office again recreates its room.
        *offices.lock().unwrap() =
            serde_json::json!([{ "officeId": "off_alpha", "namespaceSlug": "alpha" }]);
        ensure_registry_rooms(&shared).await;
        let alpha = shared
            .directory
            .get_by_namespace("alpha")
            .await
            .expect("alpha recreated after recovery tick");
        assert!(alpha.is_registry_backed());
    }
}
