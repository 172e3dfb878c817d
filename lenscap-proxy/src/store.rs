//! # Traffic Store
//!
//! SQLite-backed capture of completed exchanges. Inserts are atomic and
//! evict beyond the retention cap inside the same transaction; a coalesced
//! watch channel announces new records. Persistence failures are logged and
//! the record dropped; capture must never stall the relay path.

use std::{
  path::{Path, PathBuf},
  sync::{Arc, Mutex},
};

use chrono::DateTime;
use lenscap_core::records::{Protocol, TrafficRecord};
use rusqlite::{params, params_from_iter, types::Value, Connection, OptionalExtension};
use tokio::sync::watch;
use tracing::warn;
use uuid::Uuid;

use crate::errors::ProxyError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS traffic (
  id TEXT PRIMARY KEY,
  timestamp REAL NOT NULL,
  protocol TEXT NOT NULL,
  method TEXT,
  url TEXT,
  host TEXT NOT NULL,
  port INTEGER NOT NULL,
  path TEXT,
  status_code INTEGER,
  request_headers TEXT,
  request_body BLOB,
  response_headers TEXT,
  response_body BLOB,
  response_content_type TEXT,
  duration REAL,
  error TEXT,
  connection_id TEXT
);
CREATE INDEX IF NOT EXISTS traffic_timestamp ON traffic (timestamp DESC);
CREATE INDEX IF NOT EXISTS traffic_host ON traffic (host);
";

const COLUMNS: &str = "id, timestamp, protocol, method, url, host, port, path, status_code, \
                       request_headers, request_body, response_headers, response_body, \
                       response_content_type, duration, error, connection_id";

/// Optional constraints for [`TrafficStore::list`].
#[derive(Debug, Default, Clone)]
pub struct RecordFilter {
  pub protocol: Option<Protocol>,
  pub host:     Option<String>,
  /// Free-text match over host, url, and path
  pub search:   Option<String>,
  pub limit:    Option<usize>,
}

pub struct TrafficStore {
  conn:        Arc<Mutex<Connection>>,
  max_records: usize,
  changes:     watch::Sender<u64>,
}

impl TrafficStore {
  /// Opens (or creates) the store. `None` keeps it in memory.
  pub fn open(path: Option<&Path>, max_records: usize) -> Result<Self, ProxyError> {
    let conn = match path {
      Some(path) => Connection::open(path),
      None => Connection::open_in_memory(),
    }
    .map_err(|e| ProxyError::Persistence(e.to_string()))?;
    conn.execute_batch(SCHEMA).map_err(|e| ProxyError::Persistence(e.to_string()))?;
    let (changes, _) = watch::channel(0u64);
    Ok(Self { conn: Arc::new(Mutex::new(conn)), max_records, changes })
  }

  /// Convenience for the engine: `traffic.db` under the state directory.
  pub fn open_in(state_dir: &Path, max_records: usize) -> Result<Self, ProxyError> {
    let path: PathBuf = state_dir.join("traffic.db");
    Self::open(Some(&path), max_records)
  }

  /// Receiver that wakes after inserts; multiple inserts within one poll
  /// interval coalesce into a single observation.
  pub fn subscribe(&self) -> watch::Receiver<u64> { self.changes.subscribe() }

  /// Inserts one record, evicting the oldest rows beyond the cap. Errors are
  /// logged and swallowed.
  pub async fn insert(&self, record: TrafficRecord) {
    let conn = self.conn.clone();
    let max_records = self.max_records;
    let outcome =
      tokio::task::spawn_blocking(move || insert_blocking(&conn, &record, max_records)).await;
    match outcome {
      Ok(Ok(())) => {
        self.changes.send_modify(|n| *n += 1);
      },
      Ok(Err(e)) => warn!("dropping traffic record: {e}"),
      Err(e) => warn!("traffic store task failed: {e}"),
    }
  }

  /// Newest-first listing with optional filters.
  pub async fn list(&self, filter: RecordFilter) -> Result<Vec<TrafficRecord>, ProxyError> {
    let conn = self.conn.clone();
    tokio::task::spawn_blocking(move || list_blocking(&conn, &filter))
      .await
      .map_err(|e| ProxyError::Persistence(e.to_string()))?
      .map_err(|e| ProxyError::Persistence(e.to_string()))
  }

  pub async fn get(&self, id: Uuid) -> Result<Option<TrafficRecord>, ProxyError> {
    let conn = self.conn.clone();
    tokio::task::spawn_blocking(move || {
      let conn = conn.lock().unwrap();
      conn
        .query_row(
          &format!("SELECT {COLUMNS} FROM traffic WHERE id = ?"),
          params![id.to_string()],
          row_to_record,
        )
        .optional()
    })
    .await
    .map_err(|e| ProxyError::Persistence(e.to_string()))?
    .map_err(|e| ProxyError::Persistence(e.to_string()))
  }

  pub async fn count(&self) -> Result<usize, ProxyError> {
    let conn = self.conn.clone();
    tokio::task::spawn_blocking(move || {
      let conn = conn.lock().unwrap();
      conn.query_row("SELECT COUNT(*) FROM traffic", [], |row| row.get::<_, i64>(0))
    })
    .await
    .map_err(|e| ProxyError::Persistence(e.to_string()))?
    .map(|n| n as usize)
    .map_err(|e| ProxyError::Persistence(e.to_string()))
  }

  pub async fn clear(&self) -> Result<(), ProxyError> {
    let conn = self.conn.clone();
    tokio::task::spawn_blocking(move || {
      let conn = conn.lock().unwrap();
      conn.execute("DELETE FROM traffic", [])
    })
    .await
    .map_err(|e| ProxyError::Persistence(e.to_string()))?
    .map_err(|e| ProxyError::Persistence(e.to_string()))?;
    Ok(())
  }
}

fn insert_blocking(
  conn: &Arc<Mutex<Connection>>,
  record: &TrafficRecord,
  max_records: usize,
) -> rusqlite::Result<()> {
  let mut conn = conn.lock().unwrap();
  let tx = conn.transaction()?;
  tx.execute(
    &format!(
      "INSERT INTO traffic ({COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, \
       ?)"
    ),
    params![
      record.id.to_string(),
      record.timestamp.timestamp_micros() as f64 / 1e6,
      record.protocol.as_str(),
      record.method,
      record.url,
      record.host,
      record.port as i64,
      record.path,
      record.status.map(|s| s as i64),
      record.request_headers.to_string(),
      record.request_body,
      record.response_headers.to_string(),
      record.response_body,
      record.response_content_type,
      record.duration,
      record.error,
      record.connection_id.to_string(),
    ],
  )?;
  tx.execute(
    "DELETE FROM traffic WHERE id NOT IN (SELECT id FROM traffic ORDER BY timestamp DESC, rowid \
     DESC LIMIT ?)",
    params![max_records as i64],
  )?;
  tx.commit()
}

fn list_blocking(
  conn: &Arc<Mutex<Connection>>,
  filter: &RecordFilter,
) -> rusqlite::Result<Vec<TrafficRecord>> {
  let mut clauses: Vec<&str> = Vec::new();
  let mut bindings: Vec<Value> = Vec::new();
  if let Some(protocol) = filter.protocol {
    clauses.push("protocol = ?");
    bindings.push(Value::Text(protocol.as_str().to_string()));
  }
  if let Some(host) = &filter.host {
    clauses.push("host = ?");
    bindings.push(Value::Text(host.clone()));
  }
  if let Some(search) = &filter.search {
    clauses.push("(host LIKE ? OR url LIKE ? OR path LIKE ?)");
    let needle = format!("%{search}%");
    bindings.push(Value::Text(needle.clone()));
    bindings.push(Value::Text(needle.clone()));
    bindings.push(Value::Text(needle));
  }

  let mut sql = format!("SELECT {COLUMNS} FROM traffic");
  if !clauses.is_empty() {
    sql.push_str(" WHERE ");
    sql.push_str(&clauses.join(" AND "));
  }
  sql.push_str(" ORDER BY timestamp DESC, rowid DESC");
  if let Some(limit) = filter.limit {
    sql.push_str(" LIMIT ?");
    bindings.push(Value::Integer(limit as i64));
  }

  let conn = conn.lock().unwrap();
  let mut stmt = conn.prepare(&sql)?;
  let rows = stmt.query_map(params_from_iter(bindings), row_to_record)?;
  rows.collect()
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<TrafficRecord> {
  fn bad(index: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(e))
  }

  let id: String = row.get(0)?;
  let timestamp: f64 = row.get(1)?;
  let protocol: String = row.get(2)?;
  let request_headers: Option<String> = row.get(9)?;
  let response_headers: Option<String> = row.get(11)?;
  let connection_id: String = row.get(16)?;

  Ok(TrafficRecord {
    id: Uuid::parse_str(&id).map_err(|e| bad(0, e))?,
    timestamp: DateTime::from_timestamp_micros((timestamp * 1e6).round() as i64)
      .ok_or_else(|| rusqlite::Error::IntegralValueOutOfRange(1, timestamp as i64))?,
    protocol: Protocol::from_str(&protocol).ok_or_else(|| {
      bad(2, std::io::Error::new(std::io::ErrorKind::InvalidData, "unknown protocol"))
    })?,
    method: row.get(3)?,
    url: row.get(4)?,
    host: row.get(5)?,
    port: row.get::<_, i64>(6)? as u16,
    path: row.get(7)?,
    status: row.get::<_, Option<i64>>(8)?.map(|s| s as u16),
    request_headers: parse_headers_json(request_headers),
    request_body: row.get(10)?,
    response_headers: parse_headers_json(response_headers),
    response_body: row.get(12)?,
    response_content_type: row.get(13)?,
    duration: row.get(14)?,
    error: row.get(15)?,
    connection_id: Uuid::parse_str(&connection_id).map_err(|e| bad(16, e))?,
  })
}

fn parse_headers_json(text: Option<String>) -> serde_json::Value {
  text
    .and_then(|t| serde_json::from_str(&t).ok())
    .unwrap_or(serde_json::Value::Object(Default::default()))
}

#[cfg(test)]
mod tests {
  use chrono::{Duration, Utc};
  use serde_json::json;

  use super::*;

  fn record(host: &str, n: i64) -> TrafficRecord {
    // Microsecond precision, matching what a REAL column round-trips.
    let now = DateTime::from_timestamp_micros(Utc::now().timestamp_micros()).unwrap();
    TrafficRecord {
      id: Uuid::new_v4(),
      timestamp: now + Duration::milliseconds(n),
      protocol: Protocol::Http,
      method: Some("GET".to_string()),
      url: Some(format!("http://{host}/item/{n}")),
      host: host.to_string(),
      port: 80,
      path: Some(format!("/item/{n}")),
      status: Some(200),
      request_headers: json!({"Host": host}),
      request_body: Vec::new(),
      response_headers: json!({"Content-Type": "text/plain"}),
      response_body: b"ok".to_vec(),
      response_content_type: Some("text/plain".to_string()),
      duration: Some(0.01),
      error: None,
      connection_id: Uuid::new_v4(),
    }
  }

  fn store(cap: usize) -> TrafficStore { TrafficStore::open(None, cap).unwrap() }

  #[tokio::test]
  async fn test_insert_and_get_round_trip() {
    let store = store(10);
    let record = record("example.com", 0);
    store.insert(record.clone()).await;

    let loaded = store.get(record.id).await.unwrap().unwrap();
    assert_eq!(loaded, record);
    assert!(store.get(Uuid::new_v4()).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_list_is_newest_first() {
    let store = store(10);
    for n in 0..4 {
      store.insert(record("example.com", n)).await;
    }
    let listed = store.list(RecordFilter::default()).await.unwrap();
    assert_eq!(listed.len(), 4);
    assert_eq!(listed[0].path.as_deref(), Some("/item/3"));
    assert_eq!(listed[3].path.as_deref(), Some("/item/0"));
  }

  #[tokio::test]
  async fn test_retention_cap_evicts_oldest() {
    let store = store(3);
    for n in 0..5 {
      store.insert(record("example.com", n)).await;
    }
    assert_eq!(store.count().await.unwrap(), 3);
    let listed = store.list(RecordFilter::default()).await.unwrap();
    assert_eq!(listed[listed.len() - 1].path.as_deref(), Some("/item/2"));
  }

  #[tokio::test]
  async fn test_filters_and_search() {
    let store = store(10);
    store.insert(record("alpha.test", 0)).await;
    store.insert(record("beta.test", 1)).await;
    let mut wss = record("gamma.test", 2);
    wss.protocol = Protocol::Wss;
    store.insert(wss).await;

    let by_host = store
      .list(RecordFilter { host: Some("alpha.test".to_string()), ..Default::default() })
      .await
      .unwrap();
    assert_eq!(by_host.len(), 1);

    let by_protocol = store
      .list(RecordFilter { protocol: Some(Protocol::Wss), ..Default::default() })
      .await
      .unwrap();
    assert_eq!(by_protocol.len(), 1);
    assert_eq!(by_protocol[0].host, "gamma.test");

    let by_search = store
      .list(RecordFilter { search: Some("beta".to_string()), ..Default::default() })
      .await
      .unwrap();
    assert_eq!(by_search.len(), 1);

    let limited =
      store.list(RecordFilter { limit: Some(2), ..Default::default() }).await.unwrap();
    assert_eq!(limited.len(), 2);
  }

  #[tokio::test]
  async fn test_change_signal_fires_on_insert() {
    let store = store(10);
    let mut changes = store.subscribe();
    store.insert(record("example.com", 0)).await;
    changes.changed().await.unwrap();
    assert_eq!(*changes.borrow_and_update(), 1);
  }

  #[tokio::test]
  async fn test_clear() {
    let store = store(10);
    store.insert(record("example.com", 0)).await;
    store.clear().await.unwrap();
    assert_eq!(store.count().await.unwrap(), 0);
  }
}
