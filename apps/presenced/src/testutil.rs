//! Shared fixtures for the in-crate tests.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use officestore::Store;
use presence_auth::{SecretResolver, SecretStore, DEFAULT_SECRET_TTL};
use registry_client::RegistryClient;

use crate::directory::RoomDirectory;
use crate::matchmaker::Matchmaker;
use crate::state::{Config, Shared};

pub async fn test_shared() -> Arc<Shared> {
    test_shared_with_registry(RegistryClient::new(None, None)).await
}

/// Like [`test_shared`], but wired to a real (usually stubbed) Registry
/// endpoint, mirroring the production wiring where the secret resolver
/// shares the reconciler's client.
pub async fn test_shared_with_registry(registry: RegistryClient) -> Arc<Shared> {
    Arc::new(Shared {
        cfg: Config {
            bind: "127.0.0.1:0".parse().unwrap(),
            data_dir: ".".into(),
            map_path: None,
            grid_sidecar_path: None,
            base_domain: "office.xyz".to_string(),
            default_voice_agent_id: "agent_test_voice".to_string(),
            sync_interval_ms: 60_000,
            chat_bridge_url: "http://localhost:3020".to_string(),
            bootstrap: false,
        },
        started: Instant::now(),
        store: Store::open_in_memory().unwrap(),
        registry: registry.clone(),
        secrets: Arc::new(SecretResolver::new(
            registry,
            SecretStore::Disabled,
            DEFAULT_SECRET_TTL,
        )),
        directory: RoomDirectory::new(),
        matchmaker: Matchmaker::new(),
        walkmap: None,
        sync_in_flight: AtomicBool::new(false),
    })
}
