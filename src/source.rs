//! Source identification: who sent this request?
//!
//! Resolution order: API key header (user identification), explicit
//! self-identification header, static IP -> name mapping, raw client IP.
//! Resolution always succeeds; the raw IP is the floor.

use crate::store::UserStore;
use axum::http::HeaderMap;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;
use tracing::warn;

pub const API_KEY_HEADER: &str = "x-ollama-api-key";
pub const SOURCE_HEADER: &str = "x-ollama-source";

/// String wrapper whose equality runs in constant time, so API key lookup
/// timing leaks nothing about key prefixes.
#[derive(Clone, Debug)]
pub struct ConstantTimeString(String);

impl From<String> for ConstantTimeString {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl PartialEq for ConstantTimeString {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_bytes().ct_eq(other.0.as_bytes()).into()
    }
}

impl Eq for ConstantTimeString {}

#[derive(Debug, Clone)]
struct KeyEntry {
    key: ConstantTimeString,
    user_id: i64,
    username: String,
}

#[derive(Debug)]
struct KeyCacheInner {
    refreshed_at: Option<Instant>,
    entries: Arc<Vec<KeyEntry>>,
}

/// TTL-cached bulk read of the user store. Staleness up to one TTL is
/// acceptable; a failed refresh keeps the previous entries.
#[derive(Debug)]
pub struct ApiKeyCache {
    store: Arc<dyn UserStore>,
    ttl: Duration,
    inner: tokio::sync::Mutex<KeyCacheInner>,
}

impl ApiKeyCache {
    pub fn new(store: Arc<dyn UserStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            inner: tokio::sync::Mutex::new(KeyCacheInner {
                refreshed_at: None,
                entries: Arc::new(Vec::new()),
            }),
        }
    }

    async fn entries(&self) -> Arc<Vec<KeyEntry>> {
        let mut inner = self.inner.lock().await;
        let stale = match inner.refreshed_at {
            Some(at) => at.elapsed() >= self.ttl,
            None => true,
        };
        if stale {
            match self.store.fetch_users().await {
                Ok(users) => {
                    inner.entries = Arc::new(
                        users
                            .into_iter()
                            .map(|u| KeyEntry {
                                key: ConstantTimeString::from(u.api_key),
                                user_id: u.id,
                                username: u.username,
                            })
                            .collect(),
                    );
                    inner.refreshed_at = Some(Instant::now());
                }
                Err(e) => {
                    warn!("User store refresh failed, keeping cached keys: {}", e);
                    inner.refreshed_at = Some(Instant::now());
                }
            }
        }
        Arc::clone(&inner.entries)
    }

    pub async fn lookup(&self, key: &str) -> Option<(i64, String)> {
        let probe = ConstantTimeString::from(key.to_string());
        let entries = self.entries().await;
        entries
            .iter()
            .find(|entry| entry.key == probe)
            .map(|entry| (entry.user_id, entry.username.clone()))
    }
}

#[derive(Debug, Clone)]
pub struct SourceIdentity {
    pub source: String,
    pub user_id: Option<i64>,
}

#[derive(Debug)]
pub struct SourceResolver {
    keys: ApiKeyCache,
    names: HashMap<String, String>,
}

impl SourceResolver {
    pub fn new(store: Arc<dyn UserStore>, names: HashMap<String, String>, key_ttl: Duration) -> Self {
        Self {
            keys: ApiKeyCache::new(store, key_ttl),
            names,
        }
    }

    pub async fn resolve(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> SourceIdentity {
        // 1. API key header. An unknown key falls through rather than 401ing;
        // identification here is attribution, not access control.
        if let Some(key) = header_value(headers, API_KEY_HEADER)
            && let Some((user_id, username)) = self.keys.lookup(key).await
        {
            return SourceIdentity {
                source: username,
                user_id: Some(user_id),
            };
        }

        // 2. Services can self-identify.
        if let Some(source) = header_value(headers, SOURCE_HEADER) {
            return SourceIdentity {
                source: source.to_string(),
                user_id: None,
            };
        }

        let ip = client_ip(headers, peer);

        // 3. Static name mapping for known hosts.
        if let Some(name) = self.names.get(&ip) {
            return SourceIdentity {
                source: name.clone(),
                user_id: None,
            };
        }

        // 4. The cleaned IP is the floor.
        SourceIdentity {
            source: ip,
            user_id: None,
        }
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// First X-Forwarded-For entry, else the peer address, with the `::ffff:`
/// IPv4-mapped prefix stripped.
fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let raw = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string());

    raw.strip_prefix("::ffff:").unwrap_or(&raw).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::UserRecord;
    use async_trait::async_trait;
    use axum::http::HeaderValue;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct StaticUsers {
        users: Vec<UserRecord>,
        fetches: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl UserStore for StaticUsers {
        async fn fetch_users(&self) -> Result<Vec<UserRecord>, anyhow::Error> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("auth db down");
            }
            Ok(self.users.clone())
        }
    }

    fn alice() -> UserRecord {
        UserRecord {
            id: 7,
            username: "alice".into(),
            api_key: "sk-alice".into(),
        }
    }

    fn resolver(store: StaticUsers, names: HashMap<String, String>) -> SourceResolver {
        SourceResolver::new(Arc::new(store), names, Duration::from_secs(30))
    }

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(
                axum::http::HeaderName::try_from(*k).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        map
    }

    fn peer(ip: &str) -> Option<SocketAddr> {
        Some(format!("{ip}:55000").parse().unwrap())
    }

    #[tokio::test]
    async fn api_key_resolves_to_user() {
        let r = resolver(
            StaticUsers {
                users: vec![alice()],
                fetches: AtomicUsize::new(0),
                fail: false,
            },
            HashMap::new(),
        );
        let identity = r
            .resolve(&headers(&[(API_KEY_HEADER, "sk-alice")]), peer("1.2.3.4"))
            .await;
        assert_eq!(identity.source, "alice");
        assert_eq!(identity.user_id, Some(7));
    }

    #[tokio::test]
    async fn unknown_key_falls_through_to_source_header() {
        let r = resolver(
            StaticUsers {
                users: vec![alice()],
                fetches: AtomicUsize::new(0),
                fail: false,
            },
            HashMap::new(),
        );
        let identity = r
            .resolve(
                &headers(&[(API_KEY_HEADER, "sk-wrong"), (SOURCE_HEADER, "batch-job")]),
                peer("1.2.3.4"),
            )
            .await;
        assert_eq!(identity.source, "batch-job");
        assert_eq!(identity.user_id, None);
    }

    #[tokio::test]
    async fn static_mapping_names_known_ips() {
        let r = resolver(
            StaticUsers {
                users: vec![],
                fetches: AtomicUsize::new(0),
                fail: false,
            },
            HashMap::from([("10.1.0.5".to_string(), "ci-runner".to_string())]),
        );
        let identity = r.resolve(&HeaderMap::new(), peer("10.1.0.5")).await;
        assert_eq!(identity.source, "ci-runner");
    }

    #[tokio::test]
    async fn falls_back_to_ip_with_mapped_prefix_stripped() {
        let r = resolver(
            StaticUsers {
                users: vec![],
                fetches: AtomicUsize::new(0),
                fail: false,
            },
            HashMap::new(),
        );
        let identity = r
            .resolve(
                &headers(&[("x-forwarded-for", "::ffff:192.168.1.9, 10.0.0.1")]),
                None,
            )
            .await;
        assert_eq!(identity.source, "192.168.1.9");
    }

    #[tokio::test]
    async fn key_cache_refresh_is_ttl_bounded() {
        let store = Arc::new(StaticUsers {
            users: vec![alice()],
            fetches: AtomicUsize::new(0),
            fail: false,
        });
        let cache = ApiKeyCache::new(
            Arc::clone(&store) as Arc<dyn UserStore>,
            Duration::from_secs(60),
        );
        for _ in 0..5 {
            assert!(cache.lookup("sk-alice").await.is_some());
        }
        assert_eq!(store.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_serving_nothing_but_does_not_panic() {
        let cache = ApiKeyCache::new(
            Arc::new(StaticUsers {
                users: vec![],
                fetches: AtomicUsize::new(0),
                fail: true,
            }),
            Duration::from_secs(60),
        );
        assert!(cache.lookup("sk-alice").await.is_none());
    }
}
