//! Point-in-time view of each backend, built by joining the static fleet
//! config with the poller's most recent inventory record, cached behind a
//! short TTL so per-request routing never amplifies into store reads.

use crate::fleet::{BackendConfig, BackendId, BackendKind};
use crate::store::{InventoryRecord, InventoryStore};
use bon::Builder;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

pub const BYTES_PER_GB: i64 = 1024 * 1024 * 1024;

/// Everything the routing algorithm knows about one backend. Rows are
/// replaced wholesale on each refresh; nothing mutates them in place.
#[derive(Debug, Clone, Builder)]
pub struct BackendSnapshot {
    pub id: BackendId,
    pub name: String,
    pub host: String,
    pub total_ram_gb: u32,
    #[builder(default)]
    pub total_vram_used: u64,
    #[builder(default)]
    pub is_online: bool,
    #[builder(default)]
    pub is_disabled: bool,
    #[builder(default)]
    pub kind: BackendKind,
    #[builder(default = 1)]
    pub max_concurrent: u32,
    #[builder(default)]
    pub loaded_models: Vec<String>,
    #[builder(default)]
    pub available_models: Vec<String>,
}

impl BackendSnapshot {
    pub fn has_loaded(&self, model: &str) -> bool {
        self.loaded_models.iter().any(|m| m == model)
    }

    pub fn has_available(&self, model: &str) -> bool {
        self.available_models.iter().any(|m| m == model)
    }
}

/// Free VRAM in bytes. Diagnostic only; routing tie-breaks on declared RAM so
/// decisions stay reproducible. Negative when the poller reports more usage
/// than declared capacity (stale data, not clamped).
pub fn free_vram(snapshot: &BackendSnapshot) -> i64 {
    snapshot.total_ram_gb as i64 * BYTES_PER_GB - snapshot.total_vram_used as i64
}

#[derive(Debug)]
struct CacheInner {
    fetched_at: Option<Instant>,
    snapshots: Arc<Vec<BackendSnapshot>>,
}

/// TTL cache over the inventory store. The TTL (3s by default) sits well
/// under the poller's ~10s cadence, so a routing decision is never more than
/// one TTL plus one poll interval stale.
#[derive(Debug)]
pub struct SnapshotCache {
    backends: Vec<BackendConfig>,
    store: Arc<dyn InventoryStore>,
    ttl: Duration,
    inner: tokio::sync::Mutex<CacheInner>,
}

impl SnapshotCache {
    pub fn new(backends: Vec<BackendConfig>, store: Arc<dyn InventoryStore>, ttl: Duration) -> Self {
        Self {
            backends,
            store,
            ttl,
            inner: tokio::sync::Mutex::new(CacheInner {
                fetched_at: None,
                snapshots: Arc::new(Vec::new()),
            }),
        }
    }

    /// Current fleet view, refreshed from the store when the TTL has lapsed.
    /// A failed fetch keeps serving the previous view (or an all-offline one
    /// on cold start); it never propagates to the request path.
    pub async fn snapshots(&self) -> Arc<Vec<BackendSnapshot>> {
        let mut inner = self.inner.lock().await;
        if let Some(fetched_at) = inner.fetched_at
            && fetched_at.elapsed() < self.ttl
        {
            return Arc::clone(&inner.snapshots);
        }

        match self.store.fetch().await {
            Ok(records) => {
                inner.snapshots = Arc::new(build_snapshots(&self.backends, records));
            }
            Err(e) => {
                warn!("Inventory fetch failed, serving cached fleet view: {}", e);
                if inner.fetched_at.is_none() {
                    inner.snapshots = Arc::new(build_snapshots(&self.backends, Vec::new()));
                }
            }
        }
        // Set even on error so a broken store is retried at the TTL cadence,
        // not once per request.
        inner.fetched_at = Some(Instant::now());
        Arc::clone(&inner.snapshots)
    }
}

fn build_snapshots(
    backends: &[BackendConfig],
    records: Vec<InventoryRecord>,
) -> Vec<BackendSnapshot> {
    let mut by_id: HashMap<BackendId, InventoryRecord> = records
        .into_iter()
        .map(|record| (record.backend_id, record))
        .collect();

    backends
        .iter()
        .map(|backend| {
            let record = by_id.remove(&backend.id);
            match record {
                Some(record) => BackendSnapshot {
                    id: backend.id,
                    name: backend.name.clone(),
                    host: backend.host.clone(),
                    total_ram_gb: backend.total_ram_gb,
                    total_vram_used: record.total_vram_used,
                    is_online: record.is_online,
                    is_disabled: record.is_disabled,
                    kind: backend.kind,
                    max_concurrent: backend.max_concurrent,
                    loaded_models: record.loaded_models,
                    available_models: record.available_models,
                },
                // No record yet: offline, no models.
                None => BackendSnapshot {
                    id: backend.id,
                    name: backend.name.clone(),
                    host: backend.host.clone(),
                    total_ram_gb: backend.total_ram_gb,
                    total_vram_used: 0,
                    is_online: false,
                    is_disabled: false,
                    kind: backend.kind,
                    max_concurrent: backend.max_concurrent,
                    loaded_models: Vec::new(),
                    available_models: Vec::new(),
                },
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct CountingStore {
        records: Vec<InventoryRecord>,
        fetches: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl InventoryStore for CountingStore {
        async fn fetch(&self) -> Result<Vec<InventoryRecord>, anyhow::Error> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("store down");
            }
            Ok(self.records.clone())
        }
    }

    fn config(id: BackendId, ram: u32) -> BackendConfig {
        BackendConfig::builder()
            .id(id)
            .name(format!("node-{id}"))
            .host(format!("10.0.0.{id}:11434"))
            .total_ram_gb(ram)
            .build()
    }

    fn online_record(id: BackendId) -> InventoryRecord {
        InventoryRecord {
            backend_id: id,
            is_online: true,
            is_disabled: false,
            loaded_models: vec!["llama3".into()],
            available_models: vec!["mistral".into()],
            total_vram_used: 4 * BYTES_PER_GB as u64,
            polled_at: 1,
        }
    }

    #[tokio::test]
    async fn joins_config_with_records() {
        let store = Arc::new(CountingStore {
            records: vec![online_record(1)],
            fetches: AtomicUsize::new(0),
            fail: false,
        });
        let cache = SnapshotCache::new(
            vec![config(1, 128), config(2, 64)],
            store,
            Duration::from_secs(3),
        );

        let snaps = cache.snapshots().await;
        assert_eq!(snaps.len(), 2);
        assert!(snaps[0].is_online);
        assert!(snaps[0].has_loaded("llama3"));
        assert!(snaps[0].has_available("mistral"));
        // No record: offline with empty model sets.
        assert!(!snaps[1].is_online);
        assert!(snaps[1].loaded_models.is_empty());
    }

    #[tokio::test]
    async fn ttl_bounds_store_reads() {
        let store = Arc::new(CountingStore {
            records: vec![online_record(1)],
            fetches: AtomicUsize::new(0),
            fail: false,
        });
        let cache = SnapshotCache::new(vec![config(1, 64)], store.clone(), Duration::from_secs(60));

        for _ in 0..10 {
            cache.snapshots().await;
        }
        assert_eq!(store.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fetch_failure_yields_offline_fleet_not_error() {
        let store = Arc::new(CountingStore {
            records: Vec::new(),
            fetches: AtomicUsize::new(0),
            fail: true,
        });
        let cache = SnapshotCache::new(vec![config(1, 64)], store, Duration::from_secs(3));

        let snaps = cache.snapshots().await;
        assert_eq!(snaps.len(), 1);
        assert!(!snaps[0].is_online);
    }

    #[test]
    fn free_vram_goes_negative_under_stale_data() {
        let snapshot = BackendSnapshot::builder()
            .id(1)
            .name("node".to_string())
            .host("h:1".to_string())
            .total_ram_gb(1)
            .total_vram_used(2 * BYTES_PER_GB as u64)
            .build();
        assert_eq!(free_vram(&snapshot), -BYTES_PER_GB);
    }
}
