//! Pure routing selection: picks the backend most likely to serve a model
//! fastest, given the current fleet view and routing history. No I/O and no
//! mutable captured state; all side effects belong to the caller.
//!
//! Priority: model loaded in memory > model on disk (with anti-churn
//! rotation) > highest-capacity fallback. Within each tier: highest-RAM
//! backend first, round-robin among ties.

use crate::fleet::BackendId;
use crate::snapshot::BackendSnapshot;
use std::collections::HashSet;
use std::fmt;

/// Why a backend was chosen. Internal diagnostic, never returned to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteReason {
    /// Repeat traffic for an already-resident, idle model stays put.
    ModelLoadedSticky,
    ModelLoaded,
    /// Every backend with the model resident is busy; an idle backend that
    /// must cold-load it is faster than queueing.
    ModelAvailableBusyRedirect,
    /// Queueing on a backend that already holds the model beats forcing a
    /// reload elsewhere.
    ModelLoadedBusy,
    ModelAvailable,
    /// Skipped the backend that last served this model; it likely evicted the
    /// model under VRAM pressure.
    ModelAvailableAntiChurn,
    /// Nobody has the model; the chosen backend will need to pull it.
    FallbackMostVram,
    /// Model-less request, any online backend will do.
    AnyOnline,
    /// Explicit pin header bypassed routing.
    PinnedByHeader,
}

impl RouteReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteReason::ModelLoadedSticky => "model_loaded_sticky",
            RouteReason::ModelLoaded => "model_loaded",
            RouteReason::ModelAvailableBusyRedirect => "model_available_busy_redirect",
            RouteReason::ModelLoadedBusy => "model_loaded_busy",
            RouteReason::ModelAvailable => "model_available",
            RouteReason::ModelAvailableAntiChurn => "model_available_anti_churn",
            RouteReason::FallbackMostVram => "fallback_most_vram",
            RouteReason::AnyOnline => "any_online",
            RouteReason::PinnedByHeader => "pinned_by_header",
        }
    }
}

impl fmt::Display for RouteReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub struct RouteDecision<'a> {
    pub backend: &'a BackendSnapshot,
    pub reason: RouteReason,
    pub round_robin_counter: u64,
}

pub struct SelectRouteParams<'a> {
    /// Online, non-disabled backends; the caller filters those upstream.
    pub backends: &'a [BackendSnapshot],
    pub model: &'a str,
    /// Backend optimistically believed to hold the model after a recent
    /// routing decision, ahead of poller confirmation.
    pub optimistic_id: Option<BackendId>,
    /// Backend that most recently served this model (sticky affinity and
    /// anti-churn).
    pub last_routed_id: Option<BackendId>,
    pub round_robin_counter: u64,
    /// Backends at their concurrency limit.
    pub busy_ids: &'a HashSet<BackendId>,
    /// When present, backends whose kind cannot serve this endpoint family
    /// are excluded. Absent for model-less and aggregate calls.
    pub endpoint_path: Option<&'a str>,
}

/// Pick by RAM tier: highest declared capacity wins, round-robin among ties.
/// Deliberately keyed on declared RAM rather than live free VRAM so the
/// choice is deterministic and reproducible in tests.
pub fn pick_by_priority<'a>(
    candidates: &[&'a BackendSnapshot],
    counter: u64,
) -> Option<(&'a BackendSnapshot, u64)> {
    let top_ram = candidates.iter().map(|b| b.total_ram_gb).max()?;
    let tied: Vec<&BackendSnapshot> = candidates
        .iter()
        .copied()
        .filter(|b| b.total_ram_gb == top_ram)
        .collect();
    let backend = tied[(counter % tied.len() as u64) as usize];
    Some((backend, counter + 1))
}

/// Pure routing decision. Returns `None` only when the compatibility filter
/// leaves no candidates; total over all other inputs.
pub fn select_route<'a>(params: &SelectRouteParams<'a>) -> Option<RouteDecision<'a>> {
    let counter = params.round_robin_counter;

    let candidates: Vec<&BackendSnapshot> = params
        .backends
        .iter()
        .filter(|b| match params.endpoint_path {
            Some(path) => b.kind.supports_path(path),
            None => true,
        })
        .collect();
    if candidates.is_empty() {
        return None;
    }

    // Backends with the model resident (poller data or optimistic belief).
    let loaded: Vec<&BackendSnapshot> = candidates
        .iter()
        .copied()
        .filter(|b| b.has_loaded(params.model) || Some(b.id) == params.optimistic_id)
        .collect();

    if !loaded.is_empty() {
        // Sticky hit: the backend that last served this model still holds it
        // and is idle. Counter untouched; no rotation for repeat traffic.
        if let Some(last) = params.last_routed_id
            && !params.busy_ids.contains(&last)
            && let Some(backend) = loaded.iter().find(|b| b.id == last)
        {
            return Some(RouteDecision {
                backend,
                reason: RouteReason::ModelLoadedSticky,
                round_robin_counter: counter,
            });
        }

        let free: Vec<&BackendSnapshot> = loaded
            .iter()
            .copied()
            .filter(|b| !params.busy_ids.contains(&b.id))
            .collect();
        if !free.is_empty() {
            let (backend, next) = pick_by_priority(&free, counter)?;
            return Some(RouteDecision {
                backend,
                reason: RouteReason::ModelLoaded,
                round_robin_counter: next,
            });
        }

        // Every loaded backend is busy; prefer an idle backend with the
        // model on disk over queueing.
        let idle_available: Vec<&BackendSnapshot> = candidates
            .iter()
            .copied()
            .filter(|b| !params.busy_ids.contains(&b.id) && b.has_available(params.model))
            .collect();
        if !idle_available.is_empty() {
            let (backend, next) = pick_by_priority(&idle_available, counter)?;
            return Some(RouteDecision {
                backend,
                reason: RouteReason::ModelAvailableBusyRedirect,
                round_robin_counter: next,
            });
        }

        let (backend, next) = pick_by_priority(&loaded, counter)?;
        return Some(RouteDecision {
            backend,
            reason: RouteReason::ModelLoadedBusy,
            round_robin_counter: next,
        });
    }

    // Nobody has the model resident; look for it on disk.
    let available: Vec<&BackendSnapshot> = candidates
        .iter()
        .copied()
        .filter(|b| b.has_available(params.model))
        .collect();

    if !available.is_empty() {
        let mut pool = available;
        let mut reason = RouteReason::ModelAvailable;

        // Anti-churn: the backend that last ran this model evicted it, so it
        // is under VRAM pressure; try a different one when possible.
        if let Some(last) = params.last_routed_id
            && pool.len() > 1
            && pool.iter().any(|b| b.id == last)
        {
            pool.retain(|b| b.id != last);
            reason = RouteReason::ModelAvailableAntiChurn;
        }

        let (backend, next) = pick_by_priority(&pool, counter)?;
        return Some(RouteDecision {
            backend,
            reason,
            round_robin_counter: next,
        });
    }

    let (backend, next) = pick_by_priority(&candidates, counter)?;
    Some(RouteDecision {
        backend,
        reason: RouteReason::FallbackMostVram,
        round_robin_counter: next,
    })
}
