//! Presence-secret resolution.
//!
//! Order of tiers (first hit wins), cached per `(officeId, agentId)`:
//! 1. static env secret,
//! 2. the office's `shared:skyoffice-server` tenant key, dereferenced
//!    through the secret store,
//! 3. a per-agent credential minted by the Registry.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use registry_client::RegistryClient;
use tokio::sync::Mutex;
use tracing::{info, warn};

const STATIC_SECRET_ENVS: &[&str] = &[
    "SKYOFFICE_PRESENCE_SHARED_SECRET",
    "SKYOFFICE_PRESENCE_SECRET",
    "PRESENCE_SHARED_SECRET",
    "SHARED_SECRET",
];

/// Keys recognised inside a tenant secret blob, in priority order.
const TENANT_SECRET_KEYS: &[&str] = &[
    "SKYOFFICE_PRESENCE_SHARED_SECRET",
    "SKYOFFICE_PRESENCE_SECRET",
    "PRESENCE_SHARED_SECRET",
    "sharedSecret",
    "shared_secret",
];

const OFFICE_ID_ENVS: &[&str] = &["REGISTRY_OFFICE_ID", "OFFICE_ID", "SKYOFFICE_OFFICE_ID"];

const TENANT_KEY_TYPE: &str = "shared:skyoffice-server";

pub const DEFAULT_SECRET_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretSource {
    Static,
    TenantKeys,
    Registry,
}

impl SecretSource {
    pub fn as_str(self) -> &'static str {
        match self {
            SecretSource::Static => "static",
            SecretSource::TenantKeys => "tenant-keys",
            SecretSource::Registry => "registry",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedSecret {
    pub secret: String,
    pub source: SecretSource,
}

/// Where tenant secret blobs live.
pub enum SecretStore {
    Aws(aws_sdk_secretsmanager::Client),
    /// Test double.
    Memory(HashMap<String, String>),
    Disabled,
}

impl SecretStore {
    pub async fn from_env() -> Self {
        let cfg = aws_config::load_from_env().await;
        Self::Aws(aws_sdk_secretsmanager::Client::new(&cfg))
    }

    async fn fetch(&self, path: &str) -> Option<String> {
        match self {
            SecretStore::Aws(client) => match client
                .get_secret_value()
                .secret_id(path)
                .send()
                .await
            {
                Ok(out) => out.secret_string().map(|s| s.to_string()),
                Err(e) => {
                    warn!(err = %e, path = %path, "secret store fetch failed");
                    None
                }
            },
            SecretStore::Memory(map) => map.get(path).cloned(),
            SecretStore::Disabled => None,
        }
    }
}

struct CachedSecret {
    value: ResolvedSecret,
    expires: Instant,
}

struct CachedBlob {
    value: String,
    expires: Instant,
}

pub struct SecretResolver {
    registry: RegistryClient,
    store: SecretStore,
    ttl: Duration,
    cache: Mutex<HashMap<String, CachedSecret>>,
    blob_cache: Mutex<HashMap<String, CachedBlob>>,
    /// Secret paths already announced in logs.
    announced: Mutex<HashSet<String>>,
}

impl SecretResolver {
    pub fn new(registry: RegistryClient, store: SecretStore, ttl: Duration) -> Self {
        Self {
            registry,
            store,
            ttl,
            cache: Mutex::new(HashMap::new()),
            blob_cache: Mutex::new(HashMap::new()),
            announced: Mutex::new(HashSet::new()),
        }
    }

    /// Resolve the verification secret for `(agent_id, office_id)`. The
    /// office id falls back through the configured env chain when absent.
    pub async fn resolve(
        &self,
        agent_id: &str,
        office_id: Option<&str>,
    ) -> Option<ResolvedSecret> {
        let office = office_id
            .map(|s| s.to_string())
            .or_else(|| registry_client::first_env(OFFICE_ID_ENVS));
        let cache_key = format!(
            "{}:{}",
            office.as_deref().unwrap_or("-"),
            agent_id.to_lowercase()
        );

        {
            let cache = self.cache.lock().await;
            if let Some(hit) = cache.get(&cache_key) {
                if hit.expires > Instant::now() {
                    return Some(hit.value.clone());
                }
            }
        }

        let resolved = self.resolve_uncached(agent_id, office.as_deref()).await?;
        self.cache.lock().await.insert(
            cache_key,
            CachedSecret {
                value: resolved.clone(),
                expires: Instant::now() + self.ttl,
            },
        );
        Some(resolved)
    }

    async fn resolve_uncached(
        &self,
        agent_id: &str,
        office_id: Option<&str>,
    ) -> Option<ResolvedSecret> {
        if let Some(secret) = registry_client::first_env(STATIC_SECRET_ENVS) {
            return Some(ResolvedSecret {
                secret,
                source: SecretSource::Static,
            });
        }

        let office_id = office_id?;

        if let Some(secret) = self.from_tenant_keys(office_id).await {
            return Some(ResolvedSecret {
                secret,
                source: SecretSource::TenantKeys,
            });
        }

        let secret = self.registry.agent_credential(office_id, agent_id).await?;
        Some(ResolvedSecret {
            secret,
            source: SecretSource::Registry,
        })
    }

    async fn from_tenant_keys(&self, office_id: &str) -> Option<String> {
        let keys = self.registry.tenant_keys(office_id).await;
        let key = keys.iter().find(|k| {
            k.key_type
                .as_deref()
                .map(|t| t.to_lowercase() == TENANT_KEY_TYPE)
                .unwrap_or(false)
        })?;
        let path = key.first_secret_path()?;
        let blob = self.fetch_blob(&path).await?;
        let secret = pick_tenant_secret(&blob);
        if secret.is_none() {
            warn!(path = %path, "tenant secret blob has no recognised secret key");
        }
        secret
    }

    async fn fetch_blob(&self, path: &str) -> Option<String> {
        {
            let cache = self.blob_cache.lock().await;
            if let Some(hit) = cache.get(path) {
                if hit.expires > Instant::now() {
                    return Some(hit.value.clone());
                }
            }
        }

        let blob = self.store.fetch(path).await?;
        if self.announced.lock().await.insert(path.to_string()) {
            info!(path = %path, "tenant secret loaded");
        }
        self.blob_cache.lock().await.insert(
            path.to_string(),
            CachedBlob {
                value: blob.clone(),
                expires: Instant::now() + self.ttl,
            },
        );
        Some(blob)
    }
}

/// A tenant secret blob is either a JSON object or `KEY=VALUE` lines
/// (`#` starts a comment). The first non-empty recognised key wins.
fn pick_tenant_secret(blob: &str) -> Option<String> {
    if let Ok(serde_json::Value::Object(map)) = serde_json::from_str(blob) {
        for key in TENANT_SECRET_KEYS {
            if let Some(v) = map.get(*key).and_then(|v| v.as_str()) {
                if !v.is_empty() {
                    return Some(v.to_string());
                }
            }
        }
        return None;
    }

    let mut values: HashMap<&str, &str> = HashMap::new();
    for raw in blob.lines() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let Some((k, v)) = line.split_once('=') else {
            continue;
        };
        values.entry(k.trim()).or_insert_with(|| v.trim());
    }
    for key in TENANT_SECRET_KEYS {
        if let Some(v) = values.get(*key) {
            if !v.is_empty() {
                return Some((*v).to_string());
            }
        }
    }
    None
}
