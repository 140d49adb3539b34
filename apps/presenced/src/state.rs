//! Process-wide configuration and shared services.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use officestore::Store;
use presence_auth::SecretResolver;
use registry_client::RegistryClient;
use walkmap::WalkableMap;

use crate::directory::RoomDirectory;
use crate::matchmaker::Matchmaker;

pub const DEFAULT_BASE_DOMAIN: &str = "office.xyz";
pub const DEFAULT_VOICE_AGENT_ID: &str = "agent_4901k6k9xg9qf4paratx1d9rkmwx";

#[derive(Clone, Debug)]
pub struct Config {
    pub bind: SocketAddr,
    pub data_dir: PathBuf,
    pub map_path: Option<PathBuf>,
    pub grid_sidecar_path: Option<PathBuf>,
    pub base_domain: String,
    pub default_voice_agent_id: String,
    pub sync_interval_ms: u64,
    pub chat_bridge_url: String,
    /// Truncate persisted rooms/NPCs and run one reconcile pass at startup.
    pub bootstrap: bool,
}

pub fn usage_and_exit() -> ! {
    eprintln!(
        "presenced (presence & room orchestrator)\n\n\
USAGE:\n  presenced [--bind HOST:PORT] [--data-dir PATH] [--bootstrap]\n\n\
ENV:\n  PORT                        default 3010 (bound on 0.0.0.0)\n  SKYOFFICE_DATA_DIR          default data (holds rooms.db)\n  SKYOFFICE_MAP_PATH          optional; tile-map json for pathfinding\n  SKYOFFICE_GRID_PATH         optional; precomputed grid sidecar\n  OFFICE_BASE_DOMAIN          default office.xyz\n  DEFAULT_AGENT_VOICE_ID      default agent_4901k6k9xg9qf4paratx1d9rkmwx\n  REGISTRY_SERVICE_URL        registry base url (aliases: _ORIGIN, _BASE_URL, REGISTRY_API_URL)\n  REGISTRY_SERVICE_TOKEN      registry service token (alias: REGISTRY_API_TOKEN)\n  REGISTRY_SYNC_INTERVAL_MS   default 60000\n  CHAT_BRIDGE_URL             default http://localhost:3020\n  SKYOFFICE_PRESENCE_SHARED_SECRET  static presence secret (aliases per docs)\n  REGISTRY_OFFICE_ID          fallback office id (aliases: OFFICE_ID, SKYOFFICE_OFFICE_ID)\n  AWS_REGION                  secret store region (plus the usual credentials)\n"
    );
    std::process::exit(2);
}

pub fn parse_args() -> Config {
    let port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "3010".to_string())
        .parse()
        .unwrap_or_else(|_| usage_and_exit());
    let mut bind: SocketAddr = SocketAddr::from(([0, 0, 0, 0], port));

    let mut data_dir: PathBuf = std::env::var("SKYOFFICE_DATA_DIR")
        .unwrap_or_else(|_| "data".to_string())
        .into();
    let map_path = std::env::var("SKYOFFICE_MAP_PATH").ok().map(PathBuf::from);
    let grid_sidecar_path = std::env::var("SKYOFFICE_GRID_PATH").ok().map(PathBuf::from);

    let base_domain = std::env::var("OFFICE_BASE_DOMAIN")
        .ok()
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| DEFAULT_BASE_DOMAIN.to_string());

    let default_voice_agent_id = std::env::var("DEFAULT_AGENT_VOICE_ID")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| DEFAULT_VOICE_AGENT_ID.to_string());

    let sync_interval_ms = std::env::var("REGISTRY_SYNC_INTERVAL_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(60_000);

    let chat_bridge_url = std::env::var("CHAT_BRIDGE_URL")
        .unwrap_or_else(|_| "http://localhost:3020".to_string());

    let mut bootstrap = std::env::var("REGISTRY_BOOTSTRAP")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--bind" => {
                let v = it.next().unwrap_or_else(|| usage_and_exit());
                bind = v.parse().unwrap_or_else(|_| usage_and_exit());
            }
            "--data-dir" => {
                let v = it.next().unwrap_or_else(|| usage_and_exit());
                data_dir = v.into();
            }
            "--bootstrap" => bootstrap = true,
            "-h" | "--help" => usage_and_exit(),
            _ => usage_and_exit(),
        }
    }

    Config {
        bind,
        data_dir,
        map_path,
        grid_sidecar_path,
        base_domain,
        default_voice_agent_id,
        sync_interval_ms,
        chat_bridge_url,
        bootstrap,
    }
}

/// Everything the rooms, the reconciler and the HTTP layer share.
pub struct Shared {
    pub cfg: Config,
    pub started: Instant,
    pub store: Store,
    pub registry: RegistryClient,
    pub secrets: Arc<SecretResolver>,
    pub directory: RoomDirectory,
    pub matchmaker: Matchmaker,
    pub walkmap: Option<Arc<WalkableMap>>,
    /// Reconciler re-entrancy gate.
    pub sync_in_flight: AtomicBool,
}

pub fn new_id() -> String {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    let mut b = [0u8; 9];
    getrandom::getrandom(&mut b).expect("getrandom");
    URL_SAFE_NO_PAD.encode(b)
}
