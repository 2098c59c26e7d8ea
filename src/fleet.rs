//! The fleet is the static, ordered list of serving backends this proxy can
//! route to, read once at startup from a JSON config file. Liveness and model
//! inventory for each backend come from the external poller via the inventory
//! store; the fleet file only declares identity, capacity and kind.

use anyhow::anyhow;
use bon::Builder;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::Path};
use tracing::info;

/// Stable identifier for a backend, shared with the inventory store and the
/// request log.
pub type BackendId = i64;

/// What API surface a backend speaks. Kind gates which endpoint families a
/// backend can be routed to: native backends serve both the legacy `/api/...`
/// endpoints and the OpenAI-style `/v1/...` ones, openai backends serve only
/// `/v1/...`, and generic backends are monitored but never routed to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Native,
    Openai,
    Generic,
}

impl BackendKind {
    pub fn supports_path(&self, path: &str) -> bool {
        match self {
            BackendKind::Native => path.starts_with("/api/") || path.starts_with("/v1/"),
            BackendKind::Openai => path.starts_with("/v1/"),
            BackendKind::Generic => false,
        }
    }
}

/// A single configured backend.
#[derive(Debug, Clone, Serialize, Deserialize, Builder)]
pub struct BackendConfig {
    pub id: BackendId,
    pub name: String,
    /// `host:port` of the backend's HTTP listener.
    pub host: String,
    /// Declared memory capacity in GB. The routing tie-break key.
    pub total_ram_gb: u32,
    #[serde(default)]
    #[builder(default)]
    pub kind: BackendKind,
    /// How many requests the backend can serve concurrently before it counts
    /// as full.
    #[serde(default = "default_max_concurrent")]
    #[builder(default = 1)]
    pub max_concurrent: u32,
}

fn default_max_concurrent() -> u32 {
    1
}

/// The fleet config file: backends plus an optional static IP -> friendly
/// name map used for source identification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fleet {
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub source_names: HashMap<String, String>,
}

impl Fleet {
    pub async fn from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read fleet config {}: {}", path.display(), e))?;

        let fleet: Fleet = serde_json::from_str(&contents)
            .map_err(|e| anyhow!("Failed to parse fleet config {}: {}", path.display(), e))?;

        fleet.validate()?;
        info!(
            "Loaded {} backends from {}",
            fleet.backends.len(),
            path.display()
        );
        Ok(fleet)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        let mut seen = std::collections::HashSet::new();
        for backend in &self.backends {
            if backend.host.is_empty() {
                return Err(anyhow!("Backend '{}' has an empty host", backend.name));
            }
            if backend.total_ram_gb == 0 {
                return Err(anyhow!("Backend '{}' declares 0 GB of RAM", backend.name));
            }
            if backend.max_concurrent == 0 {
                return Err(anyhow!(
                    "Backend '{}' has max_concurrent 0; minimum is 1",
                    backend.name
                ));
            }
            if !seen.insert(backend.id) {
                return Err(anyhow!("Duplicate backend id {}", backend.id));
            }
        }
        Ok(())
    }
}
