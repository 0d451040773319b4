use std::path::Path;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::debug;

use teachback_core::{Scope, StateStore, TbResult, TeachbackError};

use crate::schema::init_db;

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn new(path: &Path) -> TbResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| TeachbackError::Storage(format!("cannot create db directory: {e}")))?;
        }
        let conn = Connection::open(path)
            .map_err(|e| TeachbackError::Storage(format!("cannot open database: {e}")))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(|e| TeachbackError::Storage(e.to_string()))?;
        init_db(&conn)?;
        Ok(Self { conn })
    }

    pub fn in_memory() -> TbResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| TeachbackError::Storage(format!("cannot open in-memory db: {e}")))?;
        init_db(&conn)?;
        Ok(Self { conn })
    }
}

fn decode(raw: String) -> TbResult<Value> {
    Ok(serde_json::from_str(&raw)?)
}

const UPSERT: &str = "INSERT INTO state (participant, scope, key, value, updated_at)
                      VALUES (?1, ?2, ?3, ?4, ?5)
                      ON CONFLICT(participant, scope, key)
                      DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at";

// ---------------------------------------------------------------------------
// StateStore impl
// ---------------------------------------------------------------------------

impl StateStore for SqliteStore {
    fn get(&self, participant: &str, scope: Scope, key: &str) -> TbResult<Option<Value>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM state WHERE participant = ?1 AND scope = ?2 AND key = ?3",
                params![participant, scope.to_string(), key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| TeachbackError::Storage(e.to_string()))?;
        raw.map(decode).transpose()
    }

    fn set(&self, participant: &str, scope: Scope, key: &str, value: Value) -> TbResult<()> {
        let json = serde_json::to_string(&value)?;
        self.conn
            .execute(
                UPSERT,
                params![
                    participant,
                    scope.to_string(),
                    key,
                    json,
                    Utc::now().to_rfc3339()
                ],
            )
            .map_err(|e| TeachbackError::Storage(e.to_string()))?;
        Ok(())
    }

    fn set_many(
        &self,
        participant: &str,
        scope: Scope,
        entries: Vec<(String, Value)>,
    ) -> TbResult<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(|e| TeachbackError::Storage(e.to_string()))?;
        let now = Utc::now().to_rfc3339();
        let scope_str = scope.to_string();
        let count = entries.len();
        {
            let mut stmt = tx
                .prepare_cached(UPSERT)
                .map_err(|e| TeachbackError::Storage(e.to_string()))?;
            for (key, value) in entries {
                let json = serde_json::to_string(&value)?;
                stmt.execute(params![participant, scope_str, key, json, now])
                    .map_err(|e| TeachbackError::Storage(e.to_string()))?;
            }
        }
        tx.commit()
            .map_err(|e| TeachbackError::Storage(e.to_string()))?;
        debug!(participant, scope = %scope, count, "batch committed");
        Ok(())
    }

    fn entries(&self, participant: &str, scope: Scope) -> TbResult<Vec<(String, Value)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, value FROM state WHERE participant = ?1 AND scope = ?2 ORDER BY key")
            .map_err(|e| TeachbackError::Storage(e.to_string()))?;
        let rows = stmt
            .query_map(params![participant, scope.to_string()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| TeachbackError::Storage(e.to_string()))?;

        let mut out = Vec::new();
        for row in rows {
            let (key, raw) = row.map_err(|e| TeachbackError::Storage(e.to_string()))?;
            out.push((key, decode(raw)?));
        }
        Ok(out)
    }

    fn participants(&self) -> TbResult<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT participant FROM state ORDER BY participant")
            .map_err(|e| TeachbackError::Storage(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| row.get(0))
            .map_err(|e| TeachbackError::Storage(e.to_string()))?;
        rows.collect::<Result<Vec<String>, _>>()
            .map_err(|e| TeachbackError::Storage(e.to_string()))
    }
}
