use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use tokio::sync::broadcast;

use flagsync_core::{FlagCategory, FlagRecord, InstanceId, Timestamp};

use crate::error::StorageError;
use crate::traits::{FlagStore, KeyValueStore, StorageEvent};

const EVENT_CAPACITY: usize = 256;

const FLAG_COLUMNS: &str = "key, name, description, enabled, category, created_at, updated_at";

fn read_flag(row: &rusqlite::Row) -> Result<FlagRecord, StorageError> {
    let category: String = row.get(4)?;
    Ok(FlagRecord {
        key: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        enabled: row.get(3)?,
        category: FlagCategory::parse(&category)?,
        is_static: false,
        created_at: Timestamp::from_millis(row.get(5)?),
        updated_at: Timestamp::from_millis(row.get(6)?),
    })
}

pub struct SqliteFlagStore {
    conn: Connection,
}

impl SqliteFlagStore {
    pub fn open(path: &str) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }
}

impl FlagStore for SqliteFlagStore {
    fn list_flags(&self) -> Result<Vec<FlagRecord>, StorageError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {FLAG_COLUMNS} FROM feature_flags ORDER BY category, name"
        ))?;
        let mut rows = stmt.query([])?;
        let mut flags = Vec::new();
        while let Some(row) = rows.next()? {
            flags.push(read_flag(row)?);
        }
        Ok(flags)
    }

    fn get_flag(&self, key: &str) -> Result<Option<FlagRecord>, StorageError> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {FLAG_COLUMNS} FROM feature_flags WHERE key = ?1"))?;
        let mut rows = stmt.query(rusqlite::params![key])?;
        match rows.next()? {
            Some(row) => Ok(Some(read_flag(row)?)),
            None => Ok(None),
        }
    }

    fn insert_flag(&mut self, record: &FlagRecord) -> Result<(), StorageError> {
        let result = self.conn.execute(
            &format!("INSERT INTO feature_flags ({FLAG_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
            rusqlite::params![
                record.key,
                record.name,
                record.description,
                record.enabled,
                record.category.as_str(),
                record.created_at.as_millis(),
                record.updated_at.as_millis(),
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StorageError::DuplicateKey(record.key.clone()))
            }
            Err(e) => Err(StorageError::Sqlite(e)),
        }
    }

    fn update_enabled(
        &mut self,
        key: &str,
        enabled: bool,
        updated_at: Timestamp,
    ) -> Result<FlagRecord, StorageError> {
        let tx = self.conn.transaction()?;
        let previous: Option<i64> = tx
            .query_row(
                "SELECT updated_at FROM feature_flags WHERE key = ?1",
                rusqlite::params![key],
                |row| row.get(0),
            )
            .optional()?;
        let Some(previous) = previous else {
            return Err(StorageError::NotFound(key.to_string()));
        };
        // updated_at never moves backwards, even if the caller's clock does
        let updated_at = updated_at.as_millis().max(previous + 1);
        tx.execute(
            "UPDATE feature_flags SET enabled = ?1, updated_at = ?2 WHERE key = ?3",
            rusqlite::params![enabled, updated_at, key],
        )?;
        tx.commit()?;

        self.get_flag(key)?
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    fn delete_flag(&mut self, key: &str) -> Result<bool, StorageError> {
        let removed = self
            .conn
            .execute("DELETE FROM feature_flags WHERE key = ?1", rusqlite::params![key])?;
        Ok(removed > 0)
    }
}

/// `KeyValueStore` over a single SQLite connection. All instances of an
/// origin share one `SqliteKeyStore` (behind an `Arc`) and see each other's
/// writes through `subscribe()`.
pub struct SqliteKeyStore {
    conn: Mutex<Connection>,
    events: broadcast::Sender<StorageEvent>,
}

impl SqliteKeyStore {
    pub fn open(path: &str) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        crate::schema::init_schema(&conn)?;
        Ok(Self::with_connection(conn))
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        crate::schema::init_schema(&conn)?;
        Ok(Self::with_connection(conn))
    }

    fn with_connection(conn: Connection) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            conn: Mutex::new(conn),
            events,
        }
    }

    fn emit(&self, event: StorageEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }
}

impl KeyValueStore for SqliteKeyStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?1",
                rusqlite::params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str, writer: InstanceId) -> Result<(), StorageError> {
        let changed = {
            let conn = self.conn.lock();
            conn.execute(
                "INSERT INTO kv_store (key, value) VALUES (?1, ?2)
                 ON CONFLICT (key) DO UPDATE SET value = excluded.value,
                     written_at = CAST(unixepoch('now','subsec') * 1000 AS INTEGER)
                 WHERE kv_store.value IS NOT excluded.value",
                rusqlite::params![key, value],
            )?
        };
        if changed > 0 {
            self.emit(StorageEvent {
                key: key.to_string(),
                new_value: Some(value.to_string()),
                writer,
            });
        }
        Ok(())
    }

    fn remove_if(&self, key: &str, expected: &str, writer: InstanceId) -> Result<bool, StorageError> {
        let removed = {
            let conn = self.conn.lock();
            conn.execute(
                "DELETE FROM kv_store WHERE key = ?1 AND value = ?2",
                rusqlite::params![key, expected],
            )?
        };
        if removed > 0 {
            self.emit(StorageEvent {
                key: key.to_string(),
                new_value: None,
                writer,
            });
        }
        Ok(removed > 0)
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }
}
