//! Axum handlers for the proxy data plane: health, aggregate fan-out, and
//! the streaming route-and-forward path.

use crate::AppState;
use crate::busy::BusyGuard;
use crate::client::HttpClient;
use crate::models::{ModelList, OpenAiModelList, extract_model};
use crate::router::Routed;
use crate::routing::RouteReason;
use crate::snapshot::BackendSnapshot;
use crate::source::SourceIdentity;
use crate::store::RequestLogRecord;
use axum::{
    Json,
    body::{Body, Bytes},
    extract::{ConnectInfo, Request, State},
    http::{Method, StatusCode, Uri, header, request::Parts},
    response::{IntoResponse, Response},
};
use futures_util::future::join_all;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Names an online backend to bypass routing. Unresolvable pins fall through
/// silently; services that set this know which backend they want.
pub const PIN_HEADER: &str = "x-ollama-pin-server";

/// Endpoints whose request body carries the model that drives routing.
const MODEL_ENDPOINTS: &[&str] = &[
    "/api/generate",
    "/api/chat",
    "/api/embed",
    "/api/embeddings",
    "/api/show",
    "/api/pull",
    "/api/delete",
    "/api/copy",
    "/api/create",
    "/v1/chat/completions",
    "/v1/completions",
    "/v1/embeddings",
];

/// Cap on a single backend's contribution to an aggregate response.
const AGGREGATE_BODY_LIMIT: usize = 16 * 1024 * 1024;

/// Health root. Clients probe for this exact body, so it mirrors what a
/// single native backend would answer.
pub async fn health() -> &'static str {
    "Ollama is running"
}

async fn identify<T: HttpClient>(
    state: &AppState<T>,
    headers: &axum::http::HeaderMap,
    extensions: &axum::http::Extensions,
) -> SourceIdentity {
    let peer = extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    state.sources.resolve(headers, peer).await
}

/// GET each compatible online backend's `path` concurrently. A backend that
/// fails or answers garbage is silently omitted; one bad node never poisons
/// the aggregate.
async fn fan_out<T>(state: &AppState<T>, path: &str) -> Vec<(BackendSnapshot, Value)>
where
    T: HttpClient + Clone + Send + Sync,
{
    let backends = state.router.online_backends(path).await;
    let fetches = backends.into_iter().map(|backend| {
        let client = &state.http_client;
        async move {
            let uri: Uri = format!("http://{}{}", backend.host, path).parse().ok()?;
            let mut request = Request::new(Body::empty());
            *request.method_mut() = Method::GET;
            *request.uri_mut() = uri;
            let response = client.request(request).await.ok()?;
            if !response.status().is_success() {
                debug!(backend = %backend.name, status = %response.status(), "aggregate fetch rejected");
                return None;
            }
            let bytes = axum::body::to_bytes(response.into_body(), AGGREGATE_BODY_LIMIT)
                .await
                .ok()?;
            let value: Value = serde_json::from_slice(&bytes).ok()?;
            Some((backend, value))
        }
    });
    join_all(fetches).await.into_iter().flatten().collect()
}

fn models_of(value: &Value, field: &str) -> Vec<Value> {
    value
        .get(field)
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

/// `GET /api/tags`: union of every backend's model list, deduplicated by
/// model name.
#[instrument(skip(state, req))]
pub async fn aggregate_tags<T>(State(state): State<AppState<T>>, req: Request) -> Response
where
    T: HttpClient + Clone + Send + Sync + 'static,
{
    let started = Instant::now();
    let identity = identify(&state, req.headers(), req.extensions()).await;

    let mut seen = HashSet::new();
    let mut models = Vec::new();
    for (_, value) in fan_out(&state, "/api/tags").await {
        for model in models_of(&value, "models") {
            match model.get("name").and_then(Value::as_str) {
                Some(name) => {
                    if seen.insert(name.to_string()) {
                        models.push(model);
                    }
                }
                None => models.push(model),
            }
        }
    }

    log_request(
        &state,
        &identity,
        None,
        "/api/tags",
        "GET",
        None,
        Some(StatusCode::OK),
        started,
        None,
    );
    Json(ModelList { models }).into_response()
}

/// `GET /api/ps`: running models across the fleet, each entry tagged with
/// the backend it came from.
#[instrument(skip(state, req))]
pub async fn aggregate_ps<T>(State(state): State<AppState<T>>, req: Request) -> Response
where
    T: HttpClient + Clone + Send + Sync + 'static,
{
    let started = Instant::now();
    let identity = identify(&state, req.headers(), req.extensions()).await;

    let mut models = Vec::new();
    for (backend, value) in fan_out(&state, "/api/ps").await {
        for mut model in models_of(&value, "models") {
            if let Some(entry) = model.as_object_mut() {
                entry.insert("_server".to_string(), json!(backend.name));
                entry.insert("_host".to_string(), json!(backend.host));
            }
            models.push(model);
        }
    }

    log_request(
        &state,
        &identity,
        None,
        "/api/ps",
        "GET",
        None,
        Some(StatusCode::OK),
        started,
        None,
    );
    Json(ModelList { models }).into_response()
}

/// `GET /v1/models`: OpenAI-style listing, deduplicated by model id.
#[instrument(skip(state, req))]
pub async fn aggregate_openai_models<T>(State(state): State<AppState<T>>, req: Request) -> Response
where
    T: HttpClient + Clone + Send + Sync + 'static,
{
    let started = Instant::now();
    let identity = identify(&state, req.headers(), req.extensions()).await;

    let mut seen = HashSet::new();
    let mut data = Vec::new();
    for (_, value) in fan_out(&state, "/v1/models").await {
        for model in models_of(&value, "data") {
            match model.get("id").and_then(Value::as_str) {
                Some(id) => {
                    if seen.insert(id.to_string()) {
                        data.push(model);
                    }
                }
                None => data.push(model),
            }
        }
    }

    log_request(
        &state,
        &identity,
        None,
        "/v1/models",
        "GET",
        None,
        Some(StatusCode::OK),
        started,
        None,
    );
    Json(OpenAiModelList::new(data)).into_response()
}

/// The route-and-forward path for everything that is not health or an
/// aggregate. Buffers the request body (the model field inside it decides
/// routing), picks a backend, and streams the upstream response back without
/// buffering it.
#[instrument(skip(state, req))]
pub async fn proxy_handler<T>(State(state): State<AppState<T>>, req: Request) -> Response
where
    T: HttpClient + Clone + Send + Sync + 'static,
{
    let started = Instant::now();
    let (parts, body) = req.into_parts();
    let peer = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let identity = state.sources.resolve(&parts.headers, peer).await;
    let path = parts.uri.path().to_string();
    let method = parts.method.to_string();

    let body_bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(_) => {
            log_request(
                &state,
                &identity,
                None,
                &path,
                &method,
                None,
                Some(StatusCode::BAD_REQUEST),
                started,
                None,
            );
            return error_response(StatusCode::BAD_REQUEST, "failed to read request body");
        }
    };

    // A missing or unparseable model is not an error: the request routes via
    // the any-online fallback instead.
    let model = if MODEL_ENDPOINTS.contains(&path.as_str()) {
        extract_model(&body_bytes)
    } else {
        None
    };

    let pin = parts
        .headers
        .get(PIN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty());

    let mut route: Option<Routed> = None;
    if let Some(name) = pin {
        route = state.router.resolve_by_name(name).await;
        if route.is_none() {
            debug!(pin = name, "pin header did not resolve, routing normally");
        }
    }
    if route.is_none()
        && let Some(model_name) = &model
    {
        route = state.router.route_model(model_name, Some(&path)).await;
    }
    if route.is_none() && model.is_none() {
        route = state.router.pick_any().await;
    }

    let Some(route) = route else {
        log_request(
            &state,
            &identity,
            model.as_deref(),
            &path,
            &method,
            None,
            Some(StatusCode::SERVICE_UNAVAILABLE),
            started,
            None,
        );
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "no online backend available");
    };

    info!(
        source = %identity.source,
        backend = %route.name,
        host = %route.host,
        method = %method,
        path = %path,
        model = model.as_deref().unwrap_or("-"),
        reason = %route.reason,
        "forwarding"
    );

    let upstream = match build_upstream_request(&parts, &route.host, body_bytes) {
        Ok(request) => request,
        Err(status) => {
            log_request(
                &state,
                &identity,
                model.as_deref(),
                &path,
                &method,
                Some(&route),
                Some(status),
                started,
                Some(route.reason),
            );
            return error_response(status, "failed to build upstream request");
        }
    };

    // The slot is taken before the forward and released only when the
    // response stream is done, so error paths and disconnects all balance.
    let slot = BusyGuard::acquire(Arc::clone(state.router.busy()), route.backend_id);

    match tokio::time::timeout(state.upstream_timeout, state.http_client.request(upstream)).await {
        Err(_) => {
            drop(slot);
            warn!(backend = %route.name, host = %route.host, "upstream timed out");
            log_request(
                &state,
                &identity,
                model.as_deref(),
                &path,
                &method,
                Some(&route),
                Some(StatusCode::GATEWAY_TIMEOUT),
                started,
                Some(route.reason),
            );
            error_response(StatusCode::GATEWAY_TIMEOUT, "upstream timeout")
        }
        Ok(Err(e)) => {
            drop(slot);
            error!(backend = %route.name, host = %route.host, "upstream request failed: {}", e);
            log_request(
                &state,
                &identity,
                model.as_deref(),
                &path,
                &method,
                Some(&route),
                Some(StatusCode::BAD_GATEWAY),
                started,
                Some(route.reason),
            );
            error_response(StatusCode::BAD_GATEWAY, "upstream unreachable")
        }
        Ok(Ok(response)) => {
            log_request(
                &state,
                &identity,
                model.as_deref(),
                &path,
                &method,
                Some(&route),
                Some(response.status()),
                started,
                Some(route.reason),
            );
            let (head, body) = response.into_parts();
            let stream = crate::stream::TrackedBody::new(body.into_data_stream(), slot);
            Response::from_parts(head, Body::from_stream(stream))
        }
    }
}

/// Rebuild the inbound request against the chosen backend: same method,
/// path, query and body; headers copied verbatim except `Host` and
/// `Content-Length`, which are rewritten for the new destination.
fn build_upstream_request(parts: &Parts, host: &str, body: Bytes) -> Result<Request, StatusCode> {
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| parts.uri.path());
    let uri: Uri = format!("http://{host}{path_and_query}")
        .parse()
        .map_err(|_| StatusCode::BAD_GATEWAY)?;

    let content_length = body.len();
    let mut request = Request::new(Body::from(body));
    *request.method_mut() = parts.method.clone();
    *request.uri_mut() = uri;
    *request.headers_mut() = parts.headers.clone();

    // Rewrite Host for the new destination; backends reject mismatches.
    request.headers_mut().insert(
        header::HOST,
        host.parse().map_err(|_| StatusCode::BAD_GATEWAY)?,
    );
    request
        .headers_mut()
        .insert(header::CONTENT_LENGTH, content_length.into());

    Ok(request)
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

/// Fire-and-forget write to the log sink; the client response never waits on
/// it and a failed write is discarded after an operational log line.
#[allow(clippy::too_many_arguments)]
fn log_request<T: HttpClient>(
    state: &AppState<T>,
    identity: &SourceIdentity,
    model: Option<&str>,
    endpoint: &str,
    method: &str,
    target: Option<&Routed>,
    status: Option<StatusCode>,
    started: Instant,
    reason: Option<RouteReason>,
) {
    let record = RequestLogRecord {
        source: identity.source.clone(),
        user_id: identity.user_id,
        model: model.map(str::to_string),
        endpoint: endpoint.to_string(),
        method: method.to_string(),
        target_backend_id: target.map(|t| t.backend_id),
        target_host: target.map(|t| t.host.clone()),
        status_code: status.map(|s| s.as_u16()),
        duration_ms: started.elapsed().as_millis() as u64,
        routing_reason: reason.map(|r| r.as_str().to_string()),
    };
    let sink = Arc::clone(&state.log);
    tokio::spawn(async move {
        if let Err(e) = sink.append(record).await {
            error!("Failed to write request log: {}", e);
        }
    });
}
