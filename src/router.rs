//! Impure wrapper around the routing algorithm: owns the snapshot cache, the
//! busy tracker and the reconciliation maps, and applies the side effects the
//! pure function deliberately leaves to its caller.

use crate::busy::BusyTracker;
use crate::fleet::BackendId;
use crate::routing::{RouteReason, SelectRouteParams, select_route};
use crate::snapshot::{BackendSnapshot, SnapshotCache};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Belief that a model is now resident on a backend, recorded right after a
/// routing decision and held until the poller confirms it or the TTL lapses.
/// Bridges the gap between routing and the next poll so anti-churn does not
/// kick in on back-to-back requests for the same model.
#[derive(Debug, Clone, Copy)]
struct OptimisticLoad {
    backend_id: BackendId,
    at: Instant,
}

/// An owned routing outcome handed to the data plane.
#[derive(Debug, Clone)]
pub struct Routed {
    pub backend_id: BackendId,
    pub name: String,
    pub host: String,
    pub reason: RouteReason,
}

impl Routed {
    fn from_snapshot(snapshot: &BackendSnapshot, reason: RouteReason) -> Self {
        Self {
            backend_id: snapshot.id,
            name: snapshot.name.clone(),
            host: snapshot.host.clone(),
            reason,
        }
    }
}

#[derive(Debug)]
pub struct FleetRouter {
    snapshots: SnapshotCache,
    busy: Arc<BusyTracker>,
    last_routed: DashMap<String, BackendId>,
    optimistic_loads: DashMap<String, OptimisticLoad>,
    round_robin: AtomicU64,
    optimistic_ttl: Duration,
}

impl FleetRouter {
    pub fn new(snapshots: SnapshotCache, busy: Arc<BusyTracker>, optimistic_ttl: Duration) -> Self {
        Self {
            snapshots,
            busy,
            last_routed: DashMap::new(),
            optimistic_loads: DashMap::new(),
            round_robin: AtomicU64::new(0),
            optimistic_ttl,
        }
    }

    pub fn busy(&self) -> &Arc<BusyTracker> {
        &self.busy
    }

    /// Refreshed fleet view, with the optimistic map reconciled against it:
    /// confirmed loads hand over to poller data, expired beliefs are dropped.
    async fn fleet_view(&self) -> Arc<Vec<BackendSnapshot>> {
        let snapshots = self.snapshots.snapshots().await;
        self.optimistic_loads.retain(|model, entry| {
            if entry.at.elapsed() > self.optimistic_ttl {
                return false;
            }
            let confirmed = snapshots
                .iter()
                .any(|s| s.id == entry.backend_id && s.has_loaded(model));
            !confirmed
        });
        snapshots
    }

    /// Pick the best backend for a model request and record the decision in
    /// the reconciliation maps. `None` means no online backend can serve this
    /// endpoint family.
    pub async fn route_model(&self, model: &str, endpoint_path: Option<&str>) -> Option<Routed> {
        let snapshots = self.fleet_view().await;
        let online: Vec<BackendSnapshot> = snapshots
            .iter()
            .filter(|s| s.is_online && !s.is_disabled)
            .cloned()
            .collect();
        if online.is_empty() {
            return None;
        }

        let limits: HashMap<BackendId, u32> =
            online.iter().map(|s| (s.id, s.max_concurrent)).collect();
        let busy_ids: HashSet<BackendId> =
            self.busy.full_backend_ids(&limits).into_iter().collect();

        let optimistic_id = self.optimistic_loads.get(model).and_then(|entry| {
            (entry.at.elapsed() <= self.optimistic_ttl).then_some(entry.backend_id)
        });
        let last_routed_id = self.last_routed.get(model).map(|id| *id);
        let counter = self.round_robin.load(Ordering::Relaxed);

        let decision = select_route(&SelectRouteParams {
            backends: &online,
            model,
            optimistic_id,
            last_routed_id,
            round_robin_counter: counter,
            busy_ids: &busy_ids,
            endpoint_path,
        })?;

        self.round_robin
            .store(decision.round_robin_counter, Ordering::Relaxed);
        self.last_routed
            .insert(model.to_string(), decision.backend.id);
        self.optimistic_loads.insert(
            model.to_string(),
            OptimisticLoad {
                backend_id: decision.backend.id,
                at: Instant::now(),
            },
        );

        debug!(
            model,
            backend = %decision.backend.name,
            reason = %decision.reason,
            "routed model request"
        );
        Some(Routed::from_snapshot(decision.backend, decision.reason))
    }

    /// Any online backend, for model-less endpoints.
    pub async fn pick_any(&self) -> Option<Routed> {
        let snapshots = self.fleet_view().await;
        snapshots
            .iter()
            .find(|s| s.is_online && !s.is_disabled)
            .map(|s| Routed::from_snapshot(s, RouteReason::AnyOnline))
    }

    /// Resolve a pin header to an online backend, case-insensitively. `None`
    /// lets the caller fall through to normal routing.
    pub async fn resolve_by_name(&self, name: &str) -> Option<Routed> {
        let snapshots = self.fleet_view().await;
        snapshots
            .iter()
            .find(|s| s.is_online && !s.is_disabled && s.name.eq_ignore_ascii_case(name))
            .map(|s| Routed::from_snapshot(s, RouteReason::PinnedByHeader))
    }

    /// Online backends able to serve `path`, for aggregate fan-out.
    pub async fn online_backends(&self, path: &str) -> Vec<BackendSnapshot> {
        let snapshots = self.fleet_view().await;
        snapshots
            .iter()
            .filter(|s| s.is_online && !s.is_disabled && s.kind.supports_path(path))
            .cloned()
            .collect()
    }
}
