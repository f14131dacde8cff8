use crate::snapshot::{MetricKind, MetricSnapshot, UnknownMetricKind};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_metrics_timestamp ON metrics(timestamp);
CREATE INDEX IF NOT EXISTS idx_metrics_kind ON metrics(kind);
";

const SECONDS_PER_DAY: u64 = 86_400;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("хранилище метрик не инициализировано")]
    NotInitialized,
    #[error("ошибка SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("ошибка сериализации метрики: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("в хранилище {0}")]
    UnknownKind(#[from] UnknownMetricKind),
    #[error("не удалось создать каталог {path}: {source}")]
    CreateDir {
        path: String,
        source: std::io::Error,
    },
    #[error("фоновая задача хранилища завершилась с ошибкой: {0}")]
    Task(String),
}

// RFC 3339 UTC with millis, so lexical order is chronological.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub id: i64,
    pub timestamp: String,
    pub kind: MetricKind,
    pub payload: String,
}

impl StoredRecord {
    pub fn snapshot(&self) -> Result<MetricSnapshot, StoreError> {
        Ok(MetricSnapshot::from_payload(self.kind, &self.payload)?)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecordQuery {
    pub kind: Option<MetricKind>,
    pub limit: Option<usize>,
    pub from: Option<SystemTime>,
    pub to: Option<SystemTime>,
}

#[derive(Debug, Clone, Default)]
pub struct Store {
    conn: Arc<Mutex<Option<Connection>>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn open(&self, location: &Path) -> Result<(), StoreError> {
        let location = location.to_path_buf();
        let conn = tokio::task::spawn_blocking(move || open_connection(&location))
            .await
            .map_err(|err| StoreError::Task(err.to_string()))??;
        *lock(&self.conn) = Some(conn);
        Ok(())
    }

    pub fn close(&self) {
        if lock(&self.conn).take().is_some() {
            debug!("хранилище метрик закрыто");
        }
    }

    pub fn is_open(&self) -> bool {
        lock(&self.conn).is_some()
    }

    pub async fn insert(&self, snapshot: &MetricSnapshot) -> Result<i64, StoreError> {
        self.insert_at(snapshot, SystemTime::now()).await
    }

    pub async fn insert_at(
        &self,
        snapshot: &MetricSnapshot,
        captured_at: SystemTime,
    ) -> Result<i64, StoreError> {
        let kind = snapshot.kind();
        let payload = snapshot.payload_json()?;
        let timestamp = format_timestamp(captured_at);
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO metrics (timestamp, kind, payload) VALUES (?1, ?2, ?3)",
                params![timestamp, kind.as_str(), payload],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn query(&self, filter: RecordQuery) -> Result<Vec<StoredRecord>, StoreError> {
        self.with_conn(move |conn| {
            let mut sql = String::from("SELECT id, timestamp, kind, payload FROM metrics WHERE 1 = 1");
            let mut values: Vec<Value> = Vec::new();
            if let Some(kind) = filter.kind {
                sql.push_str(" AND kind = ?");
                values.push(Value::Text(kind.as_str().to_string()));
            }
            if let Some(from) = filter.from {
                sql.push_str(" AND timestamp >= ?");
                values.push(Value::Text(format_timestamp(from)));
            }
            if let Some(to) = filter.to {
                sql.push_str(" AND timestamp <= ?");
                values.push(Value::Text(format_timestamp(to)));
            }
            sql.push_str(" ORDER BY timestamp DESC, id DESC");
            if let Some(limit) = filter.limit {
                sql.push_str(" LIMIT ?");
                values.push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
            }

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(values.iter()), |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?;

            let mut records = Vec::new();
            for row in rows {
                let (id, timestamp, kind, payload) = row?;
                records.push(StoredRecord {
                    id,
                    timestamp,
                    kind: kind.parse()?,
                    payload,
                });
            }
            Ok(records)
        })
        .await
    }

    pub async fn latest(&self, kind: MetricKind) -> Result<Option<StoredRecord>, StoreError> {
        let records = self
            .query(RecordQuery {
                kind: Some(kind),
                limit: Some(1),
                ..RecordQuery::default()
            })
            .await?;
        Ok(records.into_iter().next())
    }

    pub async fn count(&self, kind: Option<MetricKind>) -> Result<u64, StoreError> {
        self.with_conn(move |conn| {
            let count: i64 = match kind {
                Some(kind) => conn.query_row(
                    "SELECT COUNT(*) FROM metrics WHERE kind = ?1",
                    params![kind.as_str()],
                    |row| row.get(0),
                )?,
                None => conn.query_row("SELECT COUNT(*) FROM metrics", [], |row| row.get(0))?,
            };
            Ok(count.max(0) as u64)
        })
        .await
    }

    pub async fn delete_older_than(&self, days: u64) -> Result<usize, StoreError> {
        let age = Duration::from_secs(days.saturating_mul(SECONDS_PER_DAY));
        let cutoff = SystemTime::now().checked_sub(age).unwrap_or(UNIX_EPOCH);
        let cutoff = format_timestamp(cutoff);
        self.with_conn(move |conn| {
            let deleted = conn.execute("DELETE FROM metrics WHERE timestamp < ?1", params![cutoff])?;
            Ok(deleted)
        })
        .await
    }

    async fn with_conn<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let shared = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = lock(&shared);
            let conn = guard.as_ref().ok_or(StoreError::NotInitialized)?;
            op(conn)
        })
        .await
        .map_err(|err| StoreError::Task(err.to_string()))?
    }
}

fn open_connection(location: &Path) -> Result<Connection, StoreError> {
    if location.as_os_str() == ":memory:" {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        return Ok(conn);
    }

    if let Some(parent) = location.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
            path: parent.display().to_string(),
            source,
        })?;
    }
    let conn = Connection::open(location)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
    conn.execute_batch(SCHEMA)?;
    info!(path = %location.display(), "хранилище метрик открыто");
    Ok(conn)
}

fn format_timestamp(at: SystemTime) -> String {
    humantime::format_rfc3339_millis(at.max(UNIX_EPOCH)).to_string()
}

fn lock(conn: &Mutex<Option<Connection>>) -> MutexGuard<'_, Option<Connection>> {
    match conn.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
