//! `officestore`: durable rows for rooms and NPC assignments.
//!
//! One SQLite file, one connection, two tables. Writes are idempotent
//! insert-or-replace so the reconciler can re-run them freely. The `npcs`
//! schema grows additively: migration replays `ALTER TABLE ADD COLUMN` and
//! shrugs at "duplicate column name", so databases written by older builds
//! upgrade in place.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq)]
pub struct RoomRow {
    pub name: String,
    pub description: String,
    /// bcrypt hash, never plaintext.
    pub password: Option<String>,
    pub auto_dispose: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NpcRow {
    pub agent_id: String,
    pub registry_agent_id: Option<String>,
    pub office_id: Option<String>,
    pub name: String,
    pub avatar_id: String,
    pub workstation_id: Option<String>,
    pub position_x: f64,
    pub position_y: f64,
    pub role: String,
    pub computer_id: Option<String>,
    pub room_name: String,
    pub voice_agent_id: Option<String>,
    pub namespace_slug: Option<String>,
    pub agent_metadata: Option<serde_json::Value>,
}

/// Columns added after the first released schema. Replayed tolerantly on
/// every open.
const NPC_ADDITIVE_COLUMNS: &[(&str, &str)] = &[
    ("computerId", "TEXT"),
    ("voiceAgentId", "TEXT"),
    ("namespaceSlug", "TEXT"),
    ("agentMetadata", "TEXT"),
];

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> StoreResult<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS rooms (
                name TEXT PRIMARY KEY,
                description TEXT NOT NULL DEFAULT '',
                password TEXT,
                autoDispose INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS npcs (
                agentId TEXT PRIMARY KEY,
                registryAgentId TEXT,
                officeId TEXT,
                name TEXT NOT NULL DEFAULT '',
                avatarId TEXT NOT NULL DEFAULT '',
                workstationId TEXT,
                positionX REAL NOT NULL DEFAULT 0,
                positionY REAL NOT NULL DEFAULT 0,
                role TEXT NOT NULL DEFAULT '',
                roomName TEXT NOT NULL DEFAULT '',
                computerId TEXT,
                voiceAgentId TEXT,
                namespaceSlug TEXT,
                agentMetadata TEXT
            )",
            [],
        )?;

        for (name, ty) in NPC_ADDITIVE_COLUMNS {
            match conn.execute(&format!("ALTER TABLE npcs ADD COLUMN {name} {ty}"), []) {
                Ok(_) => {}
                Err(e) if e.to_string().contains("duplicate column name") => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub fn save_room(&self, row: &RoomRow) -> StoreResult<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "INSERT OR REPLACE INTO rooms (name, description, password, autoDispose)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                row.name,
                row.description,
                row.password,
                i64::from(row.auto_dispose)
            ],
        )?;
        Ok(())
    }

    pub fn delete_room_by_name(&self, name: &str) -> StoreResult<bool> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let n = conn.execute("DELETE FROM rooms WHERE name = ?1", params![name])?;
        Ok(n > 0)
    }

    pub fn all_rooms(&self) -> StoreResult<Vec<RoomRow>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt =
            conn.prepare("SELECT name, description, password, autoDispose FROM rooms")?;
        let rows = stmt
            .query_map([], |r| {
                Ok(RoomRow {
                    name: r.get(0)?,
                    description: r.get(1)?,
                    password: r.get(2)?,
                    auto_dispose: r.get::<_, i64>(3)? != 0,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn clear_all_rooms(&self) -> StoreResult<usize> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        Ok(conn.execute("DELETE FROM rooms", [])?)
    }

    pub fn save_npc(&self, row: &NpcRow) -> StoreResult<()> {
        let metadata = row
            .agent_metadata
            .as_ref()
            .map(|v| v.to_string());
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "INSERT OR REPLACE INTO npcs (
                agentId, registryAgentId, officeId, name, avatarId, workstationId,
                positionX, positionY, role, roomName, computerId, voiceAgentId,
                namespaceSlug, agentMetadata
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                row.agent_id,
                row.registry_agent_id,
                row.office_id,
                row.name,
                row.avatar_id,
                row.workstation_id,
                row.position_x,
                row.position_y,
                row.role,
                row.room_name,
                row.computer_id,
                row.voice_agent_id,
                row.namespace_slug,
                metadata,
            ],
        )?;
        Ok(())
    }

    pub fn remove_npc(&self, agent_id: &str) -> StoreResult<bool> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let n = conn.execute("DELETE FROM npcs WHERE agentId = ?1", params![agent_id])?;
        Ok(n > 0)
    }

    pub fn all_npcs(&self) -> StoreResult<Vec<NpcRow>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT agentId, registryAgentId, officeId, name, avatarId, workstationId,
                    positionX, positionY, role, roomName, computerId, voiceAgentId,
                    namespaceSlug, agentMetadata
             FROM npcs",
        )?;
        let rows = stmt
            .query_map([], |r| {
                let metadata_raw: Option<String> = r.get(13)?;
                Ok(NpcRow {
                    agent_id: r.get(0)?,
                    registry_agent_id: r.get(1)?,
                    office_id: r.get(2)?,
                    name: r.get(3)?,
                    avatar_id: r.get(4)?,
                    workstation_id: r.get(5)?,
                    position_x: r.get(6)?,
                    position_y: r.get(7)?,
                    role: r.get(8)?,
                    room_name: r.get(9)?,
                    computer_id: r.get(10)?,
                    voice_agent_id: r.get(11)?,
                    namespace_slug: r.get(12)?,
                    agent_metadata: metadata_raw.and_then(|s| parse_metadata(&s)),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn clear_all_npcs(&self) -> StoreResult<usize> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        Ok(conn.execute("DELETE FROM npcs", [])?)
    }
}

fn parse_metadata(raw: &str) -> Option<serde_json::Value> {
    match serde_json::from_str(raw) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(err = %e, "stored agentMetadata is not valid JSON; dropping");
            None
        }
    }
}
