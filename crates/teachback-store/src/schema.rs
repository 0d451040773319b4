use rusqlite::Connection;

use teachback_core::TeachbackError;

pub fn init_db(conn: &Connection) -> Result<(), TeachbackError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS state (
            participant TEXT NOT NULL,
            scope TEXT NOT NULL,       -- game | player | stage:<kind>
            key TEXT NOT NULL,
            value TEXT NOT NULL,       -- JSON
            updated_at TEXT NOT NULL,
            PRIMARY KEY (participant, scope, key)
        );

        CREATE INDEX IF NOT EXISTS idx_state_participant ON state(participant);
        ",
    )
    .map_err(|e| TeachbackError::Storage(e.to_string()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_db() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        // Second call should be idempotent
        init_db(&conn).unwrap();
    }

    #[test]
    fn test_state_table_exists() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();

        let tables: Vec<String> = {
            let mut stmt = conn
                .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .unwrap();
            stmt.query_map([], |row| row.get(0))
                .unwrap()
                .map(|r| r.unwrap())
                .collect()
        };
        assert_eq!(tables, vec!["state".to_string()]);
    }
}
