//! Generation-tagged cache store backed by SQLite.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::Path;
use std::sync::Mutex;

use super::key::RequestKey;

/// A cached response payload as fetched from the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
  pub status: u16,
  pub content_type: Option<String>,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl CachedResponse {
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn body_text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}

/// A single cache entry together with its storage metadata.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub response: CachedResponse,
  /// Generation this entry belongs to
  pub generation: String,
  /// When the entry was written
  pub fetched_at: DateTime<Utc>,
}

/// Versioned key-value cache for request/response pairs.
///
/// Every entry is tagged with the generation (cache version) it belongs to.
/// A store handle is bound to one generation; lookups and writes only ever see
/// that generation. Cutover to a new generation is committed explicitly, and
/// older generations are evicted wholesale afterwards - entries are never
/// migrated between generations.
pub struct CacheStore {
  conn: Mutex<Connection>,
  generation: String,
}

impl CacheStore {
  /// Open the store for the given generation.
  ///
  /// Idempotent: opening an existing generation is a no-op beyond binding the
  /// handle to it.
  pub fn open_at(path: &Path, generation: &str) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn, generation)
  }

  /// Open an in-memory store. Contents do not survive the process.
  pub fn open_in_memory(generation: &str) -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory cache: {}", e))?;
    Self::from_connection(conn, generation)
  }

  fn from_connection(conn: Connection, generation: &str) -> Result<Self> {
    let store = Self {
      conn: Mutex::new(conn),
      generation: generation.to_string(),
    };
    store.run_migrations()?;
    Ok(store)
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  /// The generation this handle is bound to.
  pub fn generation(&self) -> &str {
    &self.generation
  }

  /// Fetch every asset and store all of them in this generation.
  ///
  /// All-or-nothing: if any asset fails to fetch (network error or non-2xx
  /// status), nothing is written and the error names the failing URL. The
  /// caller must not activate this generation on failure.
  pub async fn populate<F, Fut>(&self, assets: &[RequestKey], fetch: F) -> Result<usize>
  where
    F: Fn(RequestKey) -> Fut,
    Fut: Future<Output = Result<CachedResponse>>,
  {
    // Fetch everything before touching the database so a late failure cannot
    // leave a partially-written generation behind.
    let mut fetched: Vec<(RequestKey, CachedResponse)> = Vec::with_capacity(assets.len());

    for key in assets {
      let response = fetch(key.clone())
        .await
        .map_err(|e| eyre!("Failed to fetch asset {}: {}", key.description(), e))?;

      if !response.is_success() {
        return Err(eyre!(
          "Asset {} returned status {}",
          key.description(),
          response.status
        ));
      }

      fetched.push((key.clone(), response));
    }

    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("BEGIN TRANSACTION", [])
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    for (key, response) in &fetched {
      if let Err(e) = insert_entry(&conn, &self.generation, key, response) {
        let _ = conn.execute("ROLLBACK", []);
        return Err(e);
      }
    }

    conn
      .execute("COMMIT", [])
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(fetched.len())
  }

  /// Look up a cached response for this generation.
  pub fn lookup(&self, key: &RequestKey) -> Result<Option<CacheEntry>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(
        "SELECT status, content_type, headers, body, fetched_at FROM cache_entry
         WHERE generation = ? AND request_hash = ?",
      )
      .map_err(|e| eyre!("Failed to prepare lookup: {}", e))?;

    let row: Option<(u16, Option<String>, String, Vec<u8>, String)> = stmt
      .query_row(params![self.generation, key.cache_hash()], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
        ))
      })
      .ok();

    match row {
      Some((status, content_type, headers_json, body, fetched_at_str)) => {
        let headers: Vec<(String, String)> = serde_json::from_str(&headers_json)
          .map_err(|e| eyre!("Failed to parse cached headers: {}", e))?;
        let fetched_at = parse_datetime(&fetched_at_str)?;

        Ok(Some(CacheEntry {
          response: CachedResponse {
            status,
            content_type,
            headers,
            body,
          },
          generation: self.generation.clone(),
          fetched_at,
        }))
      }
      None => Ok(None),
    }
  }

  /// Insert or overwrite a cached response in this generation.
  ///
  /// Concurrent puts to the same key are last-write-wins; entries are
  /// re-derivable from the network, so no locking beyond the connection.
  pub fn put(&self, key: &RequestKey, response: &CachedResponse) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    insert_entry(&conn, &self.generation, key, response)
  }

  /// Record this generation as the current one.
  ///
  /// Must happen before eviction so a crash between the two leaves a store
  /// that serves the new generation with the old ones still intact.
  pub fn commit_cutover(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES ('current_generation', ?)",
        params![self.generation],
      )
      .map_err(|e| eyre!("Failed to commit cutover: {}", e))?;

    Ok(())
  }

  /// The generation recorded by the last committed cutover, if any.
  pub fn current_generation(&self) -> Result<Option<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT value FROM meta WHERE key = 'current_generation'")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    Ok(stmt.query_row([], |row| row.get(0)).ok())
  }

  /// Delete every entry whose generation differs from this handle's.
  ///
  /// Strictly name-inequality: an "older-looking" generation is deleted, never
  /// upgraded in place. Only called during activation, after cutover.
  pub fn evict_other_generations(&self) -> Result<usize> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let deleted = conn
      .execute(
        "DELETE FROM cache_entry WHERE generation != ?",
        params![self.generation],
      )
      .map_err(|e| eyre!("Failed to evict old generations: {}", e))?;

    Ok(deleted)
  }

  /// Distinct generation names currently present in the store.
  pub fn generations(&self) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT DISTINCT generation FROM cache_entry ORDER BY generation")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names: Vec<String> = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list generations: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(names)
  }

  /// Rebind this handle to a different generation in place.
  ///
  /// Used when an install fails and the handle falls back to the previously
  /// committed generation.
  pub fn rebind(&mut self, generation: &str) {
    self.generation = generation.to_string();
  }

  /// Rebind this handle to a different generation, by value.
  pub fn with_generation(mut self, generation: &str) -> Self {
    self.rebind(generation);
    self
  }
}

fn insert_entry(
  conn: &Connection,
  generation: &str,
  key: &RequestKey,
  response: &CachedResponse,
) -> Result<()> {
  let headers_json = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entry
       (generation, request_hash, request_desc, status, content_type, headers, body, fetched_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        generation,
        key.cache_hash(),
        key.description(),
        response.status,
        response.content_type,
        headers_json,
        response.body,
      ],
    )
    .map_err(|e| eyre!("Failed to store entry {}: {}", key.description(), e))?;

  Ok(())
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Request/response cache, one row per (generation, request)
CREATE TABLE IF NOT EXISTS cache_entry (
    generation TEXT NOT NULL,
    request_hash TEXT NOT NULL,
    request_desc TEXT NOT NULL,
    status INTEGER NOT NULL,
    content_type TEXT,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    fetched_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (generation, request_hash)
);

CREATE INDEX IF NOT EXISTS idx_cache_entry_generation
    ON cache_entry(generation);

-- Store-level markers (current_generation)
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
