//! `registry_client`: typed HTTP client for the external Registry service.
//!
//! The Registry declares which offices exist and which agents belong to
//! each. Everything we send it back (presence telemetry, world-id links) is
//! advisory: reconciliation re-runs on the next tick, so GET/PATCH failures
//! are logged and swallowed rather than propagated. Only the per-agent
//! credential lookup distinguishes "no" from "unavailable", and it does so
//! with `None`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

const BASE_URL_ENVS: &[&str] = &[
    "REGISTRY_SERVICE_URL",
    "REGISTRY_SERVICE_ORIGIN",
    "REGISTRY_SERVICE_BASE_URL",
    "REGISTRY_API_URL",
];

const TOKEN_ENVS: &[&str] = &["REGISTRY_SERVICE_TOKEN", "REGISTRY_API_TOKEN"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryOffice {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub office_id: Option<String>,
    #[serde(default)]
    pub namespace_slug: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl RegistryOffice {
    /// Offices are keyed by `officeId` with `id` as the legacy alias.
    pub fn office_id(&self) -> Option<&str> {
        self.office_id.as_deref().or(self.id.as_deref())
    }

    pub fn slug(&self) -> Option<String> {
        self.namespace_slug
            .as_deref()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryAgent {
    pub id: String,
    #[serde(default)]
    pub agent_identifier: Option<String>,
    #[serde(default)]
    pub avatar_id: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub agent_email: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantKey {
    #[serde(default)]
    pub key_type: Option<String>,
    #[serde(default)]
    pub secrets_path: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl TenantKey {
    /// First secret-store path this key points at: `metadata.paths[0]`,
    /// falling back to the flat `secretsPath`.
    pub fn first_secret_path(&self) -> Option<String> {
        let from_meta = self
            .metadata
            .as_ref()
            .and_then(|m| m.get("paths"))
            .and_then(|p| p.as_array())
            .and_then(|a| a.first())
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        from_meta.or_else(|| self.secrets_path.clone())
    }
}

/// Body for `PATCH /offices/{id}/agents/{aid}`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentPatch {
    pub last_seen_at: String,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
struct CredentialResponse {
    #[serde(default, rename = "sharedSecret")]
    shared_secret_camel: Option<String>,
    #[serde(default)]
    shared_secret: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RegistryClient {
    http: reqwest::Client,
    base_url: Option<String>,
    token: Option<String>,
}

impl RegistryClient {
    pub fn new(base_url: Option<String>, token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url
                .map(|u| u.trim_end_matches('/').to_string())
                .filter(|u| !u.is_empty()),
            token: token.filter(|t| !t.is_empty()),
        }
    }

    pub fn from_env() -> Self {
        Self::new(first_env(BASE_URL_ENVS), first_env(TOKEN_ENVS))
    }

    pub fn configured(&self) -> bool {
        self.base_url.is_some()
    }

    fn url(&self, path: &str) -> Option<String> {
        self.base_url.as_ref().map(|b| format!("{b}{path}"))
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        let mut req = self
            .http
            .request(method, url)
            .header(reqwest::header::ACCEPT, "application/json")
            .timeout(REQUEST_TIMEOUT);
        if let Some(t) = self.token.as_deref() {
            req = req.bearer_auth(t).header("X-Registry-Service-Token", t);
        }
        req
    }

    pub async fn list_offices(&self) -> Vec<RegistryOffice> {
        let Some(url) = self.url("/offices") else {
            return Vec::new();
        };
        match self.get_json::<Vec<RegistryOffice>>(&url).await {
            Ok(v) => v,
            Err(e) => {
                warn!(err = %e, "registry list offices failed");
                Vec::new()
            }
        }
    }

    pub async fn list_agents(&self, office_id: &str) -> Vec<RegistryAgent> {
        let Some(url) = self.url(&format!("/offices/{office_id}/agents")) else {
            return Vec::new();
        };
        match self.get_json::<Vec<RegistryAgent>>(&url).await {
            Ok(v) => v,
            Err(e) => {
                warn!(err = %e, office_id = %office_id, "registry list agents failed");
                Vec::new()
            }
        }
    }

    pub async fn tenant_keys(&self, office_id: &str) -> Vec<TenantKey> {
        let Some(url) = self.url(&format!("/offices/{office_id}/tenant-keys")) else {
            return Vec::new();
        };
        match self.get_json::<Vec<TenantKey>>(&url).await {
            Ok(v) => v,
            Err(e) => {
                warn!(err = %e, office_id = %office_id, "registry tenant keys failed");
                Vec::new()
            }
        }
    }

    /// Presence telemetry for one agent. Advisory; failures are swallowed.
    pub async fn patch_agent(&self, office_id: &str, agent_id: &str, body: &AgentPatch) {
        let Some(url) = self.url(&format!("/offices/{office_id}/agents/{agent_id}")) else {
            return;
        };
        if let Err(e) = self.send_expect_2xx(self.request(reqwest::Method::PATCH, url).json(body)).await {
            warn!(err = %e, office_id = %office_id, agent_id = %agent_id, "registry agent patch failed");
        }
    }

    /// Link the live room id to its office. Advisory.
    pub async fn patch_office_world(&self, office_id: &str, world_id: &str) {
        let Some(url) = self.url(&format!("/offices/{office_id}")) else {
            return;
        };
        let body = serde_json::json!({ "skyofficeWorldId": world_id });
        if let Err(e) = self.send_expect_2xx(self.request(reqwest::Method::PATCH, url).json(&body)).await {
            warn!(err = %e, office_id = %office_id, "registry office patch failed");
        }
    }

    /// Mint-or-fetch the per-agent presence secret. `None` when the Registry
    /// is unreachable or says no.
    pub async fn agent_credential(&self, office_id: &str, agent_id: &str) -> Option<String> {
        let url = self.url(&format!(
            "/offices/{office_id}/presence/agents/{agent_id}/credential"
        ))?;
        let resp = match self.request(reqwest::Method::POST, url).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(err = %e, agent_id = %agent_id, "registry credential request failed");
                return None;
            }
        };
        if !resp.status().is_success() {
            warn!(status = %resp.status(), agent_id = %agent_id, "registry credential request rejected");
            return None;
        }
        let cred: CredentialResponse = match resp.json().await {
            Ok(v) => v,
            Err(e) => {
                warn!(err = %e, agent_id = %agent_id, "registry credential response unreadable");
                return None;
            }
        };
        cred.shared_secret_camel
            .or(cred.shared_secret)
            .filter(|s| !s.is_empty())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> anyhow::Result<T> {
        let resp = self.request(reqwest::Method::GET, url.to_string()).send().await?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("http={}", status.as_u16());
        }
        Ok(resp.json::<T>().await?)
    }

    async fn send_expect_2xx(&self, req: reqwest::RequestBuilder) -> anyhow::Result<()> {
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("http={}", status.as_u16());
        }
        Ok(())
    }
}

pub fn first_env(names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|n| std::env::var(n).ok())
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
}

/// Now, ISO-8601 UTC, for `lastSeenAt`/`assignedAt` stamps.
pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
