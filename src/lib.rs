//! Shoal - a routing reverse proxy for a fleet of LLM serving backends
//!
//! This library provides the core functionality for presenting many serving
//! backends as one endpoint: snapshot-cached fleet state, in-flight request
//! accounting, model-affine route selection, and a streaming forward path.

use axum::Router;
use axum::routing::{any, get};
use axum_prometheus::{
    GenericMetricLayer, Handle, PrometheusMetricLayerBuilder,
    metrics_exporter_prometheus::PrometheusHandle,
};
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

pub mod busy;
pub mod client;
pub mod fleet;
pub mod handlers;
pub mod models;
pub mod router;
pub mod routing;
pub mod snapshot;
pub mod source;
pub mod store;
pub mod stream;

use client::{HttpClient, HyperClient, create_hyper_client};
use handlers::{aggregate_openai_models, aggregate_ps, aggregate_tags, health, proxy_handler};
use router::FleetRouter;
use source::SourceResolver;
use store::RequestLogSink;

/// Shared state for the proxy.
#[derive(Debug, Clone)]
pub struct AppState<T: HttpClient> {
    pub http_client: T,
    pub router: Arc<FleetRouter>,
    pub sources: Arc<SourceResolver>,
    pub log: Arc<dyn RequestLogSink>,
    /// Ceiling on waiting for the upstream response head. Generation can
    /// legitimately take minutes, so this is generous by default.
    pub upstream_timeout: Duration,
}

impl AppState<HyperClient> {
    /// Create a new AppState with the default pooled Hyper client.
    pub fn new(
        router: Arc<FleetRouter>,
        sources: Arc<SourceResolver>,
        log: Arc<dyn RequestLogSink>,
        upstream_timeout: Duration,
    ) -> Self {
        Self {
            http_client: create_hyper_client(100, 90),
            router,
            sources,
            log,
            upstream_timeout,
        }
    }
}

impl<T: HttpClient> AppState<T> {
    pub fn with_client(
        http_client: T,
        router: Arc<FleetRouter>,
        sources: Arc<SourceResolver>,
        log: Arc<dyn RequestLogSink>,
        upstream_timeout: Duration,
    ) -> Self {
        Self {
            http_client,
            router,
            sources,
            log,
            upstream_timeout,
        }
    }
}

/// Builds the main proxy router.
///
/// This creates routes for:
/// - `/` - Health probe, answering like a single native backend
/// - `/api/tags`, `/api/ps`, `/v1/models` - Fleet-wide aggregate listings
/// - `/{*path}` - Routes and forwards everything else to a chosen backend
#[instrument(skip(state))]
pub fn build_router<T: HttpClient + Clone + Send + Sync + 'static>(state: AppState<T>) -> Router {
    info!("Building router");
    Router::new()
        .route("/", get(health))
        .route("/api/tags", get(aggregate_tags))
        .route("/api/ps", get(aggregate_ps))
        .route("/v1/models", get(aggregate_openai_models))
        .route("/{*path}", any(proxy_handler))
        .with_state(state)
}

/// Builds a router for the metrics endpoint.
#[instrument(skip(handle))]
pub fn build_metrics_router(handle: PrometheusHandle) -> Router {
    info!("Building metrics router");
    Router::new().route(
        "/metrics",
        axum::routing::get(move || async move { handle.render() }),
    )
}

type MetricsLayerAndHandle = (
    GenericMetricLayer<'static, PrometheusHandle, Handle>,
    PrometheusHandle,
);

/// Builds a layer and handle for prometheus metrics collection.
///
/// # Parameters
/// - `prefix`: A string prefix for the metrics, which can be either a string literal or an owned string.
///   This parameter uses `impl Into<Cow<'static, str>>` to allow flexibility in passing either borrowed
///   or owned strings. The `'static` lifetime ensures that the prefix is valid for the entire duration
///   of the program, as required by the Prometheus metrics layer.
pub fn build_metrics_layer_and_handle(
    prefix: impl Into<Cow<'static, str>>,
) -> MetricsLayerAndHandle {
    info!("Building metrics layer");
    PrometheusMetricLayerBuilder::new()
        .with_prefix(prefix)
        .enable_response_body_size(true)
        .with_endpoint_label_type(axum_prometheus::EndpointLabel::Exact)
        .with_default_metrics()
        .build_pair()
}

/// Test doubles shared by the unit tests and the integration suite. Nothing
/// in the production path touches this module.
pub mod test_utils {
    use super::*;
    use crate::store::{InventoryRecord, InventoryStore, RequestLogRecord, UserRecord, UserStore};
    use async_trait::async_trait;
    use axum::http::StatusCode;
    use std::sync::{Arc, Mutex};

    type Responder =
        dyn Fn(&MockRequest) -> Result<axum::response::Response, String> + Send + Sync;

    pub struct MockHttpClient {
        pub requests: Arc<Mutex<Vec<MockRequest>>>,
        responder: Arc<Responder>,
        delay: Option<Duration>,
    }

    #[derive(Debug, Clone)]
    pub struct MockRequest {
        pub method: String,
        pub uri: String,
        pub headers: Vec<(String, String)>,
        pub body: Vec<u8>,
    }

    impl MockHttpClient {
        pub fn new(status: StatusCode, body: &str) -> Self {
            let body = body.to_string();
            Self::with_responder(move |_| {
                Ok(axum::response::Response::builder()
                    .status(status)
                    .body(axum::body::Body::from(body.clone()))
                    .unwrap())
            })
        }

        pub fn new_streaming(status: StatusCode, chunks: Vec<String>) -> Self {
            Self::with_responder(move |_| {
                use axum::body::Body;
                use futures_util::stream;

                let stream = stream::iter(
                    chunks
                        .clone()
                        .into_iter()
                        .map(|chunk| Ok::<_, std::io::Error>(chunk.into_bytes())),
                );

                Ok(axum::response::Response::builder()
                    .status(status)
                    .header("content-type", "application/x-ndjson")
                    .body(Body::from_stream(stream))
                    .unwrap())
            })
        }

        /// Every request fails as if the upstream were unreachable.
        pub fn failing(message: &str) -> Self {
            let message = message.to_string();
            Self::with_responder(move |_| Err(message.clone()))
        }

        pub fn with_responder<F>(responder: F) -> Self
        where
            F: Fn(&MockRequest) -> Result<axum::response::Response, String>
                + Send
                + Sync
                + 'static,
        {
            Self {
                requests: Arc::new(Mutex::new(Vec::new())),
                responder: Arc::new(responder),
                delay: None,
            }
        }

        /// Sleep this long before answering, to exercise timeout handling.
        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn get_requests(&self) -> Vec<MockRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl std::fmt::Debug for MockHttpClient {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("MockHttpClient")
                .field("requests", &self.requests)
                .field("responder", &"<closure>")
                .field("delay", &self.delay)
                .finish()
        }
    }

    impl Clone for MockHttpClient {
        fn clone(&self) -> Self {
            Self {
                requests: Arc::clone(&self.requests),
                responder: Arc::clone(&self.responder),
                delay: self.delay,
            }
        }
    }

    #[async_trait]
    impl HttpClient for MockHttpClient {
        async fn request(
            &self,
            req: axum::extract::Request,
        ) -> Result<axum::response::Response, Box<dyn std::error::Error + Send + Sync>> {
            let method = req.method().to_string();
            let uri = req.uri().to_string();
            let headers = req
                .headers()
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
                .collect();

            let body = axum::body::to_bytes(req.into_body(), usize::MAX)
                .await
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)?
                .to_vec();

            let mock_request = MockRequest {
                method,
                uri,
                headers,
                body,
            };
            self.requests.lock().unwrap().push(mock_request.clone());

            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            (self.responder)(&mock_request)
                .map_err(|e| -> Box<dyn std::error::Error + Send + Sync> { e.into() })
        }
    }

    /// Inventory store serving a fixed record set.
    #[derive(Debug, Clone)]
    pub struct StaticInventory(pub Vec<InventoryRecord>);

    #[async_trait]
    impl InventoryStore for StaticInventory {
        async fn fetch(&self) -> Result<Vec<InventoryRecord>, anyhow::Error> {
            Ok(self.0.clone())
        }
    }

    /// User store serving a fixed user set.
    #[derive(Debug, Clone)]
    pub struct StaticUsers(pub Vec<UserRecord>);

    #[async_trait]
    impl UserStore for StaticUsers {
        async fn fetch_users(&self) -> Result<Vec<UserRecord>, anyhow::Error> {
            Ok(self.0.clone())
        }
    }

    /// Request log captured in memory for assertions.
    #[derive(Debug, Clone, Default)]
    pub struct MemoryLogSink {
        pub records: Arc<Mutex<Vec<RequestLogRecord>>>,
    }

    impl MemoryLogSink {
        pub fn records(&self) -> Vec<RequestLogRecord> {
            self.records.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RequestLogSink for MemoryLogSink {
        async fn append(&self, record: RequestLogRecord) -> Result<(), anyhow::Error> {
            self.records.lock().unwrap().push(record);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::busy::BusyTracker;
    use crate::fleet::BackendConfig;
    use crate::snapshot::SnapshotCache;
    use crate::store::InventoryRecord;
    use crate::test_utils::{MemoryLogSink, MockHttpClient, StaticInventory, StaticUsers};
    use axum::http::StatusCode;
    use axum_test::TestServer;
    use std::collections::HashMap;

    fn state(
        configs: Vec<BackendConfig>,
        records: Vec<InventoryRecord>,
        client: MockHttpClient,
    ) -> AppState<MockHttpClient> {
        let cache = SnapshotCache::new(
            configs,
            Arc::new(StaticInventory(records)),
            Duration::from_secs(3),
        );
        let fleet_router = Arc::new(FleetRouter::new(
            cache,
            Arc::new(BusyTracker::default()),
            Duration::from_secs(30),
        ));
        let sources = Arc::new(SourceResolver::new(
            Arc::new(StaticUsers(Vec::new())),
            HashMap::new(),
            Duration::from_secs(30),
        ));
        AppState::with_client(
            client,
            fleet_router,
            sources,
            Arc::new(MemoryLogSink::default()),
            Duration::from_secs(300),
        )
    }

    fn backend(id: i64) -> BackendConfig {
        BackendConfig::builder()
            .id(id)
            .name(format!("node-{id}"))
            .host(format!("10.0.0.{id}:11434"))
            .total_ram_gb(64)
            .build()
    }

    fn online(id: i64, loaded: &[&str]) -> InventoryRecord {
        InventoryRecord {
            backend_id: id,
            is_online: true,
            is_disabled: false,
            loaded_models: loaded.iter().map(|m| m.to_string()).collect(),
            available_models: Vec::new(),
            total_vram_used: 0,
            polled_at: 1,
        }
    }

    #[tokio::test]
    async fn health_answers_like_a_single_backend() {
        let state = state(vec![], vec![], MockHttpClient::new(StatusCode::OK, "{}"));
        let server = TestServer::new(build_router(state)).unwrap();

        let response = server.get("/").await;
        response.assert_status_ok();
        response.assert_text("Ollama is running");
    }

    #[tokio::test]
    async fn model_request_with_no_backends_is_503() {
        let state = state(vec![], vec![], MockHttpClient::new(StatusCode::OK, "{}"));
        let server = TestServer::new(build_router(state)).unwrap();

        let response = server
            .post("/api/generate")
            .json(&serde_json::json!({"model": "llama3", "prompt": "hi"}))
            .await;
        response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn model_request_is_forwarded_to_the_loaded_backend() {
        let client = MockHttpClient::new(StatusCode::OK, r#"{"done": true}"#);
        let state = state(
            vec![backend(1), backend(2)],
            vec![online(1, &[]), online(2, &["llama3"])],
            client.clone(),
        );
        let server = TestServer::new(build_router(state)).unwrap();

        let response = server
            .post("/api/generate")
            .json(&serde_json::json!({"model": "llama3", "prompt": "hi"}))
            .await;
        response.assert_status_ok();

        let requests = client.get_requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].uri.contains("10.0.0.2:11434"));
    }

    mod metrics {
        use super::*;
        use rstest::*;

        /// Fixture to create a shared metrics server and main server.
        /// axum-prometheus uses a global Prometheus registry that maintains state across test executions within the same
        /// process. Even with unique prefixes and serial execution, the library prevents creating multiple metric
        /// registries with overlapping metric names. So we use a shared metrics server for all metrics tests.
        #[fixture]
        #[once]
        fn shared_metrics_servers() -> (TestServer, TestServer) {
            let (prometheus_layer, handle) = build_metrics_layer_and_handle("shoal");

            let metrics_router = build_metrics_router(handle);
            let metrics_server = TestServer::new(metrics_router).unwrap();

            let app_state = state(vec![], vec![], MockHttpClient::new(StatusCode::OK, "{}"));
            let router = build_router(app_state).layer(prometheus_layer);
            let server = TestServer::new(router).unwrap();

            (server, metrics_server)
        }

        #[rstest]
        #[tokio::test]
        async fn requests_show_up_in_the_metrics_export(
            shared_metrics_servers: &(TestServer, TestServer),
        ) {
            let (server, metrics_server) = shared_metrics_servers;

            server.get("/").await.assert_status_ok();

            let metrics = metrics_server.get("/metrics").await;
            metrics.assert_status_ok();
            assert!(metrics.text().contains("shoal_http_requests_total"));
        }
    }
}
