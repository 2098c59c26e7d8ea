//! Boundary traits for the external collaborators this proxy reads from and
//! writes to: the inventory store maintained by the fleet poller, the user
//! store maintained by the auth subsystem, and the append-only request log.
//!
//! Each trait has a file-backed default implementation so the proxy runs
//! standalone; tests substitute in-memory implementations.

use crate::fleet::BackendId;
use anyhow::anyhow;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// One poller observation of a backend. The store may hold several records
/// per backend; readers take the most recent one (highest `polled_at`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryRecord {
    pub backend_id: BackendId,
    #[serde(default)]
    pub is_online: bool,
    /// Administrative kill switch. A disabled backend is never routed to,
    /// online or not.
    #[serde(default)]
    pub is_disabled: bool,
    #[serde(default)]
    pub loaded_models: Vec<String>,
    #[serde(default)]
    pub available_models: Vec<String>,
    /// Bytes. May transiently exceed declared capacity under stale data.
    #[serde(default)]
    pub total_vram_used: u64,
    /// Unix millis of the poll that produced this record.
    #[serde(default)]
    pub polled_at: u64,
}

#[async_trait]
pub trait InventoryStore: Send + Sync + std::fmt::Debug {
    /// Returns at most one record per backend id, most recent wins. Backends
    /// without a record are treated as offline by the snapshot layer.
    async fn fetch(&self) -> Result<Vec<InventoryRecord>, anyhow::Error>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: i64,
    pub username: String,
    pub api_key: String,
}

#[async_trait]
pub trait UserStore: Send + Sync + std::fmt::Debug {
    async fn fetch_users(&self) -> Result<Vec<UserRecord>, anyhow::Error>;
}

/// One line of traffic history, written after each routed or aggregate
/// request. Best-effort: a failed write never affects the client response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLogRecord {
    pub source: String,
    pub user_id: Option<i64>,
    pub model: Option<String>,
    pub endpoint: String,
    pub method: String,
    pub target_backend_id: Option<BackendId>,
    pub target_host: Option<String>,
    pub status_code: Option<u16>,
    pub duration_ms: u64,
    pub routing_reason: Option<String>,
}

#[async_trait]
pub trait RequestLogSink: Send + Sync + std::fmt::Debug {
    async fn append(&self, record: RequestLogRecord) -> Result<(), anyhow::Error>;
}

async fn ensure_parent(path: &Path) -> Result<(), anyhow::Error> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| anyhow!("Failed to create {}: {}", parent.display(), e))?;
    }
    Ok(())
}

/// Inventory store backed by a JSON array the poller rewrites on each cycle.
#[derive(Debug, Clone)]
pub struct JsonInventoryFile {
    path: PathBuf,
}

impl JsonInventoryFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Creates the file (and parents) if missing. Must run before the
    /// listener starts accepting connections.
    pub async fn prepare(&self) -> Result<(), anyhow::Error> {
        ensure_parent(&self.path).await?;
        if tokio::fs::try_exists(&self.path).await? {
            return Ok(());
        }
        tokio::fs::write(&self.path, b"[]")
            .await
            .map_err(|e| anyhow!("Failed to create {}: {}", self.path.display(), e))
    }
}

#[async_trait]
impl InventoryStore for JsonInventoryFile {
    async fn fetch(&self) -> Result<Vec<InventoryRecord>, anyhow::Error> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            // A missing store is the same as an empty one: every backend is
            // simply offline until the poller writes something.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(anyhow!(
                    "Failed to read inventory {}: {}",
                    self.path.display(),
                    e
                ));
            }
        };

        let records: Vec<InventoryRecord> = serde_json::from_str(&contents).map_err(|e| {
            anyhow!(
                "Failed to parse inventory {}: {}",
                self.path.display(),
                e
            )
        })?;

        // Collapse to the most recent record per backend.
        let mut latest: HashMap<BackendId, InventoryRecord> = HashMap::new();
        for record in records {
            match latest.get(&record.backend_id) {
                Some(existing) if existing.polled_at >= record.polled_at => {}
                _ => {
                    latest.insert(record.backend_id, record);
                }
            }
        }
        Ok(latest.into_values().collect())
    }
}

/// User store backed by a JSON array written by the auth subsystem.
#[derive(Debug, Clone)]
pub struct JsonUsersFile {
    path: PathBuf,
}

impl JsonUsersFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn prepare(&self) -> Result<(), anyhow::Error> {
        ensure_parent(&self.path).await?;
        if tokio::fs::try_exists(&self.path).await? {
            return Ok(());
        }
        tokio::fs::write(&self.path, b"[]")
            .await
            .map_err(|e| anyhow!("Failed to create {}: {}", self.path.display(), e))
    }
}

#[async_trait]
impl UserStore for JsonUsersFile {
    async fn fetch_users(&self) -> Result<Vec<UserRecord>, anyhow::Error> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(anyhow!("Failed to read users {}: {}", self.path.display(), e));
            }
        };
        serde_json::from_str(&contents)
            .map_err(|e| anyhow!("Failed to parse users {}: {}", self.path.display(), e))
    }
}

/// Append-only request log, one JSON object per line.
#[derive(Debug, Clone)]
pub struct JsonlRequestLog {
    path: PathBuf,
}

impl JsonlRequestLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn prepare(&self) -> Result<(), anyhow::Error> {
        ensure_parent(&self.path).await?;
        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| anyhow!("Failed to open {}: {}", self.path.display(), e))?;
        Ok(())
    }
}

#[async_trait]
impl RequestLogSink for JsonlRequestLog {
    async fn append(&self, record: RequestLogRecord) -> Result<(), anyhow::Error> {
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn inventory_fetch_keeps_most_recent_record_per_backend() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inventory.json");
        let records = serde_json::json!([
            {"backend_id": 1, "is_online": false, "polled_at": 100},
            {"backend_id": 1, "is_online": true, "polled_at": 200},
            {"backend_id": 2, "is_online": true, "polled_at": 50}
        ]);
        tokio::fs::write(&path, records.to_string()).await.unwrap();

        let store = JsonInventoryFile::new(&path);
        let mut fetched = store.fetch().await.unwrap();
        fetched.sort_by_key(|r| r.backend_id);

        assert_eq!(fetched.len(), 2);
        assert!(fetched[0].is_online, "later record should win");
        assert_eq!(fetched[0].polled_at, 200);
        assert_eq!(fetched[1].backend_id, 2);
    }

    #[tokio::test]
    async fn inventory_fetch_treats_missing_file_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonInventoryFile::new(dir.path().join("nope.json"));
        assert!(store.fetch().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn prepare_creates_missing_files_and_parents() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonInventoryFile::new(dir.path().join("nested/inventory.json"));
        store.prepare().await.unwrap();
        assert!(store.fetch().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn request_log_appends_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("requests.jsonl");
        let sink = JsonlRequestLog::new(&path);
        sink.prepare().await.unwrap();

        for status in [200u16, 502] {
            sink.append(RequestLogRecord {
                source: "tester".into(),
                user_id: None,
                model: Some("llama3".into()),
                endpoint: "/api/generate".into(),
                method: "POST".into(),
                target_backend_id: Some(1),
                target_host: Some("10.0.0.1:11434".into()),
                status_code: Some(status),
                duration_ms: 12,
                routing_reason: Some("model_loaded".into()),
            })
            .await
            .unwrap();
        }

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: RequestLogRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.status_code, Some(200));
    }
}
