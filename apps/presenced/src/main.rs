use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use officestore::Store;
use presence_auth::{SecretResolver, SecretStore, DEFAULT_SECRET_TTL};
use registry_client::RegistryClient;
use tower_http::trace::TraceLayer;
use tracing::{info, warn, Level};
use walkmap::{PrecomputedGrid, WalkableMap};

mod admin;
mod directory;
mod matchmaker;
mod reconcile;
mod room;
mod state;
#[cfg(test)]
mod testutil;
mod workstations;
mod ws;

use crate::directory::RoomDirectory;
use crate::matchmaker::Matchmaker;
use crate::room::{CreateRoomOptions, Room};
use crate::state::{parse_args, Config, Shared};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,presenced=info,tower_http=info".into()),
        )
        .with_target(false)
        .with_max_level(Level::INFO)
        .init();

    let cfg = parse_args();

    std::fs::create_dir_all(&cfg.data_dir)
        .with_context(|| format!("create data dir {}", cfg.data_dir.display()))?;
    let store = Store::open(&cfg.data_dir.join("rooms.db"))
        .context("open rooms.db")?;

    let registry = RegistryClient::from_env();
    if !registry.configured() {
        warn!("no registry url configured; running standalone");
    }

    let secret_store = if std::env::var("AWS_REGION").is_ok() {
        SecretStore::from_env().await
    } else {
        SecretStore::Disabled
    };
    let secrets = Arc::new(SecretResolver::new(
        registry.clone(),
        secret_store,
        DEFAULT_SECRET_TTL,
    ));

    let walkable = load_walkmap(&cfg);

    let shared = Arc::new(Shared {
        cfg: cfg.clone(),
        started: Instant::now(),
        store,
        registry,
        secrets,
        directory: RoomDirectory::new(),
        matchmaker: Matchmaker::new(),
        walkmap: walkable,
        sync_in_flight: AtomicBool::new(false),
    });

    if cfg.bootstrap {
        reconcile::bootstrap(&shared).await;
    }

    // The always-on public room humans land in without a namespace.
    Room::create(
        &shared,
        CreateRoomOptions {
            name: "Public Lobby".to_string(),
            namespace_slug: Some("public".to_string()),
            description: "Open office floor".to_string(),
            ..Default::default()
        },
    )
    .await
    .context("create public lobby")?;

    let _reconciler = reconcile::spawn_periodic(shared.clone());

    let app = admin::router(shared.clone())
        .merge(ws::router(shared.clone()))
        .layer(TraceLayer::new_for_http());

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(true);
        info!("shutdown signal received");
    });

    let listener = tokio::net::TcpListener::bind(cfg.bind)
        .await
        .with_context(|| format!("bind {}", cfg.bind))?;
    info!(
        bind = %cfg.bind,
        data_dir = %cfg.data_dir.display(),
        sync_interval_ms = cfg.sync_interval_ms,
        "presenced listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown(shutdown_rx))
        .await
        .context("http server failed")?;
    Ok(())
}

async fn wait_for_shutdown(mut rx: tokio::sync::watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Load the walkable map: precomputed sidecar if it validates, else build
/// from the tile map, else run without pathfinding.
fn load_walkmap(cfg: &Config) -> Option<Arc<WalkableMap>> {
    let map_path = cfg.map_path.as_ref()?;
    let bytes = match std::fs::read(map_path) {
        Ok(b) => b,
        Err(e) => {
            warn!(err = %e, path = %map_path.display(), "cannot read tile map; pathfinding disabled");
            return None;
        }
    };

    if let Some(grid_path) = cfg.grid_sidecar_path.as_ref() {
        match std::fs::read(grid_path)
            .map_err(anyhow::Error::from)
            .and_then(|raw| Ok(serde_json::from_slice::<PrecomputedGrid>(&raw)?))
        {
            Ok(pre) => match WalkableMap::from_precomputed(&pre, &bytes) {
                Ok(map) => {
                    info!(path = %grid_path.display(), "precomputed walk grid loaded");
                    return Some(Arc::new(map));
                }
                Err(e) => {
                    warn!(err = %e, path = %grid_path.display(), "precomputed grid rejected; rebuilding from map");
                }
            },
            Err(e) => {
                warn!(err = %e, path = %grid_path.display(), "cannot read grid sidecar; rebuilding from map");
            }
        }
    }

    match WalkableMap::from_map_bytes(&bytes) {
        Ok(map) => {
            info!(path = %map_path.display(), "walk grid built from tile map");
            Some(Arc::new(map))
        }
        Err(e) => {
            warn!(err = %e, path = %map_path.display(), "tile map unusable; pathfinding disabled");
            None
        }
    }
}
