use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::state::{CallRole, CallType};

pub(crate) const DB_FILE: &str = "medcall.sqlite3";
const ACTIVE_MARKER: &str = "active";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS kv (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
";

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, alias = "avatar")]
    pub avatar_url: Option<String>,
}

/// Credentials and metadata for the call the user is in, persisted so a killed or
/// backgrounded app can rejoin (or offer to) later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSession {
    pub call_id: String,
    pub channel_name: String,
    pub access_token: String,
    pub participant_id: u32,
    pub app_id: String,
    pub role: CallRole,
    pub call_type: CallType,
    #[serde(default)]
    pub started_at: Option<i64>,
    #[serde(default)]
    pub appointment_id: Option<String>,
    #[serde(default)]
    pub other_participant: Option<ParticipantInfo>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("session store sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("session encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

pub(crate) struct SessionStore {
    conn: Connection,
    session_key: String,
    active_key: String,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("session_key", &self.session_key)
            .finish()
    }
}

impl SessionStore {
    pub fn open(data_dir: &str, key_prefix: &str) -> Result<Self, StoreError> {
        let path = std::path::Path::new(data_dir).join(DB_FILE);
        let conn = Connection::open(&path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn,
            session_key: format!("{key_prefix}call_session"),
            active_key: format!("{key_prefix}call_active"),
        })
    }

    /// Writes the session and the active marker together, replacing any previous record.
    pub fn save(&mut self, session: &CallSession) -> Result<(), StoreError> {
        let payload = serde_json::to_string(session)?;
        let tx = self.conn.transaction()?;
        for (key, value) in [
            (self.session_key.as_str(), payload.as_str()),
            (self.active_key.as_str(), ACTIVE_MARKER),
        ] {
            tx.execute(
                "INSERT INTO kv (key, value)
                 VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                [key, value],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load(&self) -> Option<CallSession> {
        let marker = self.get(&self.active_key)?;
        if marker != ACTIVE_MARKER {
            return None;
        }
        let payload = self.get(&self.session_key)?;
        match serde_json::from_str::<CallSession>(&payload) {
            Ok(session) => Some(session),
            Err(e) => {
                tracing::warn!(%e, "persisted call session is corrupt, ignoring");
                None
            }
        }
    }

    pub fn clear(&mut self) -> Result<(), StoreError> {
        self.conn.execute(
            "DELETE FROM kv WHERE key IN (?1, ?2)",
            [self.session_key.as_str(), self.active_key.as_str()],
        )?;
        Ok(())
    }

    fn get(&self, key: &str) -> Option<String> {
        match self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| {
                row.get::<_, String>(0)
            })
            .optional()
        {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(%e, key, "session store read failed");
                None
            }
        }
    }

    #[cfg(test)]
    fn put_raw(&self, key: &str, value: &str) {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
                [key, value],
            )
            .unwrap();
    }
}
