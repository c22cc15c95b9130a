use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OpenFlags};
use std::sync::Mutex;

/// Event to persist once its recording has completed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewEvent {
    pub camera_id: String,
    pub occurred_on_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventRecord {
    pub id: i64,
    pub camera_id: String,
    pub occurred_on_ms: u64,
}

pub trait EventStore: Send + Sync {
    /// Persist an event and return its id.
    fn create(&self, event: &NewEvent) -> Result<i64>;
}

/// SQLite-backed event store.
pub struct SqliteEventStore {
    conn: Mutex<Connection>,
}

impl SqliteEventStore {
    /// Opens (creating if needed) the database at `db_path`. `file:` URIs are
    /// opened in URI mode.
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = if db_path.starts_with("file:") {
            Connection::open_with_flags(
                db_path,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_URI,
            )
        } else {
            Connection::open(db_path)
        }
        .with_context(|| format!("open event database {}", db_path))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS events (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              camera_id TEXT NOT NULL,
              occurred_on_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS events_camera_time
              ON events (camera_id, occurred_on_ms);
            "#,
        )
        .context("create events schema")?;
        Ok(())
    }

    /// Most recent events for a camera, newest first.
    pub fn recent(&self, camera_id: &str, limit: usize) -> Result<Vec<EventRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, camera_id, occurred_on_ms FROM events
             WHERE camera_id = ?1 ORDER BY occurred_on_ms DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![camera_id, limit as i64], |row| {
            let occurred: i64 = row.get(2)?;
            Ok(EventRecord {
                id: row.get(0)?,
                camera_id: row.get(1)?,
                occurred_on_ms: occurred.max(0) as u64,
            })
        })?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("event database lock poisoned"))
    }
}

impl EventStore for SqliteEventStore {
    fn create(&self, event: &NewEvent) -> Result<i64> {
        let occurred = i64::try_from(event.occurred_on_ms).context("event timestamp out of range")?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO events (camera_id, occurred_on_ms) VALUES (?1, ?2)",
            params![event.camera_id, occurred],
        )
        .with_context(|| format!("[{}] insert event", event.camera_id))?;
        Ok(conn.last_insert_rowid())
    }
}

/// Volatile store for tests and dry runs.
#[derive(Default)]
pub struct InMemoryEventStore {
    events: Mutex<Vec<EventRecord>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<EventRecord> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl EventStore for InMemoryEventStore {
    fn create(&self, event: &NewEvent) -> Result<i64> {
        let mut events = self
            .events
            .lock()
            .map_err(|_| anyhow!("event store lock poisoned"))?;
        let id = events.len() as i64 + 1;
        events.push(EventRecord {
            id,
            camera_id: event.camera_id.clone(),
            occurred_on_ms: event.occurred_on_ms,
        });
        Ok(id)
    }
}
