//! REST API surface: route dispatch over the relationship/registration
//! stores, API-key auth, CORS, and per-key rate limiting.
//!
//! Request pipeline, in order: URL parse (so the websocket upgrade path
//! passes through untouched) → CORS headers / OPTIONS short-circuit →
//! public routes skip auth → `X-API-Key` lookup and constant-time
//! verification → per-key token-bucket limit → dispatch.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::api::keys::{ApiKeyStore, PermissionLevel};
use crate::api::openapi;
use crate::api::rate_limit::RateLimiter;
use crate::audit::{AuditCategory, AuditJournal};
use crate::broker::HandshakeBroker;
use crate::config::{ApiConfig, OrganizationConfig, WebsocketConfig};
use crate::error::RegistrationError;
use crate::registration::RegistrationController;
use crate::relationships::{ListFilter, RelationshipStatus, RelationshipStore};
use crate::storage::StorageEngine;

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub struct AppState {
    pub storage: Arc<StorageEngine>,
    pub audit: Arc<AuditJournal>,
    pub registration: Arc<RegistrationController>,
    pub broker: Arc<HandshakeBroker>,
    pub organization: OrganizationConfig,
    pub websocket: WebsocketConfig,
    pub api: ApiConfig,
    pub rate_limiter: RateLimiter,
    pub openapi_doc: String,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        storage: Arc<StorageEngine>,
        audit: Arc<AuditJournal>,
        registration: Arc<RegistrationController>,
        broker: Arc<HandshakeBroker>,
        organization: OrganizationConfig,
        websocket: WebsocketConfig,
        api: ApiConfig,
    ) -> Self {
        Self {
            rate_limiter: RateLimiter::new(api.rate_limit.clone()),
            openapi_doc: openapi::build(),
            storage,
            audit,
            registration,
            broker,
            organization,
            websocket,
            api,
            started_at: Instant::now(),
        }
    }
}

/// Serves the REST surface and the websocket upgrade on one listener, per
/// the configuration's `server.host`/`server.port`.
pub async fn run(state: Arc<AppState>, bind_addr: &str) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    info!("REST/WS listener bound at {bind_addr}");

    loop {
        let (stream, addr) = listener.accept().await?;
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| {
                let state = Arc::clone(&state);
                async move { handle_request(state, addr, req).await }
            });

            if let Err(err) = http1::Builder::new()
                .serve_connection(io, service)
                .with_upgrades()
                .await
            {
                warn!("connection from {addr} ended with error: {err}");
            }
        });
    }
}

fn to_boxed(resp: Response<Full<Bytes>>) -> Response<BoxBody> {
    resp.map(|body| body.map_err(|never| match never {}).boxed())
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

fn error_response(status: StatusCode, code: &str) -> Response<Full<Bytes>> {
    json_response(status, json!({ "error": code }))
}

fn apply_cors(mut resp: Response<Full<Bytes>>, origin: Option<&str>, allowed: &[String]) -> Response<Full<Bytes>> {
    let allow = if allowed.iter().any(|o| o == "*") {
        Some("*".to_string())
    } else {
        origin.filter(|o| allowed.iter().any(|a| a == o)).map(|o| o.to_string())
    };
    if let Some(allow_origin) = allow {
        if let Ok(value) = allow_origin.parse() {
            resp.headers_mut().insert("Access-Control-Allow-Origin", value);
        }
    }
    resp
}

fn preflight_response() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
        .header("Access-Control-Allow-Headers", "X-API-Key, Content-Type")
        .body(Full::new(Bytes::new()))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

/// Minimal `a=b&c=d` query parser; values here are enum tags, uuids, and
/// small integers, none of which need percent-decoding.
fn parse_query(query: Option<&str>) -> std::collections::HashMap<String, String> {
    let mut map = std::collections::HashMap::new();
    if let Some(q) = query {
        for pair in q.split('&') {
            if let Some((k, v)) = pair.split_once('=') {
                map.insert(k.to_string(), v.to_string());
            }
        }
    }
    map
}

fn pagination(params: &std::collections::HashMap<String, String>) -> (u32, u32) {
    let limit = params
        .get("limit")
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(20)
        .clamp(1, 100);
    let offset = params.get("offset").and_then(|s| s.parse::<u32>().ok()).unwrap_or(0);
    (limit, offset)
}

async fn handle_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> Result<Response<BoxBody>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let origin = req
        .headers()
        .get("origin")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    // 1. URL parse: the websocket path is handled by the broker, not this
    //    router, and never passes through auth/rate-limiting below.
    if path == state.websocket.path {
        if hyper_tungstenite::is_upgrade_request(&req) {
            return Ok(handle_websocket_upgrade(state, req, addr).await);
        }
        return Ok(to_boxed(error_response(StatusCode::BAD_REQUEST, "websocket_upgrade_required")));
    }

    // 2. CORS.
    if method == Method::OPTIONS {
        return Ok(to_boxed(apply_cors(
            preflight_response(),
            origin.as_deref(),
            &state.api.cors.allowed_origins,
        )));
    }

    let query_params = parse_query(req.uri().query());
    let is_public = matches!(path.as_str(), "/health" | "/openapi.json");

    // 3/4. Auth, unless this is a public route.
    let mut permission: Option<PermissionLevel> = None;
    if !is_public {
        let api_key_header = req
            .headers()
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let Some(raw_key) = api_key_header else {
            let _ = state.audit.append(
                AuditCategory::ApiAuth,
                "auth_failure",
                "anonymous",
                [("reason".to_string(), json!("missing_key"))].into_iter().collect(),
            );
            return Ok(to_boxed(apply_cors(
                error_response(StatusCode::UNAUTHORIZED, "missing_key"),
                origin.as_deref(),
                &state.api.cors.allowed_origins,
            )));
        };

        let verify_result = ApiKeyStore::new(&state.storage).verify(&raw_key);
        let verified = match verify_result {
            Ok(v) => v,
            Err(_) => None,
        };
        match verified {
            Some((key_id, level)) => permission = Some(level),
            None => {
                let _ = state.audit.append(
                    AuditCategory::ApiAuth,
                    "auth_failure",
                    "anonymous",
                    [("reason".to_string(), json!("invalid_key"))].into_iter().collect(),
                );
                return Ok(to_boxed(apply_cors(
                    error_response(StatusCode::UNAUTHORIZED, "invalid_key"),
                    origin.as_deref(),
                    &state.api.cors.allowed_origins,
                )));
            }
        }

        // 5. Rate limit, keyed by the presented raw key.
        let decision = state.rate_limiter.check(&raw_key);
        if !decision.allowed {
            let _ = state.audit.append(
                AuditCategory::ApiAuth,
                "rate_limited",
                "anonymous",
                Default::default(),
            );
            let mut resp = error_response(StatusCode::TOO_MANY_REQUESTS, "rate_limited");
            if let Ok(value) = decision.retry_after_secs.to_string().parse() {
                resp.headers_mut().insert("Retry-After", value);
            }
            return Ok(to_boxed(apply_cors(resp, origin.as_deref(), &state.api.cors.allowed_origins)));
        }
    }

    // 6. Dispatch.
    let response = dispatch(Arc::clone(&state), &method, &path, &query_params, permission, req).await;
    Ok(to_boxed(apply_cors(response, origin.as_deref(), &state.api.cors.allowed_origins)))
}

async fn handle_websocket_upgrade(
    state: Arc<AppState>,
    req: Request<Incoming>,
    addr: SocketAddr,
) -> Response<BoxBody> {
    match hyper_tungstenite::upgrade(req, None) {
        Ok((response, websocket)) => {
            tokio::spawn(async move {
                match websocket.await {
                    Ok(ws) => state.broker.handle_upgrade(ws, addr).await,
                    Err(err) => error!("websocket upgrade failed: {err}"),
                }
            });
            let (parts, _) = response.into_parts();
            Response::from_parts(parts, Full::new(Bytes::new()).map_err(|never| match never {}).boxed())
        }
        Err(err) => {
            error!("websocket upgrade error: {err}");
            to_boxed(error_response(StatusCode::BAD_REQUEST, "bad_encoding"))
        }
    }
}

#[derive(Deserialize)]
struct CreateRegistrationRequest {
    provider_npi: String,
    provider_name: Option<String>,
    provider_types: Option<Vec<String>>,
    specialty: Option<String>,
}

async fn dispatch(
    state: Arc<AppState>,
    method: &Method,
    path: &str,
    query: &std::collections::HashMap<String, String>,
    permission: Option<PermissionLevel>,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    match (method, segments.as_slice()) {
        (&Method::GET, ["health"]) => json_response(
            StatusCode::OK,
            json!({
                "status": "ok",
                "uptime_secs": state.started_at.elapsed().as_secs(),
                "commit": option_env!("GIT_COMMIT_SHORT").unwrap_or("unknown"),
                "build_time": option_env!("BUILD_TIMESTAMP").unwrap_or("unknown"),
            }),
        ),
        (&Method::GET, ["openapi.json"]) => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(state.openapi_doc.clone())))
            .unwrap_or_else(|_| Response::new(Full::new(Bytes::new()))),

        (&Method::GET, ["v1", "organization"]) => handle_get_organization(&state),
        (&Method::GET, ["v1", "relationships"]) => handle_list_relationships(&state, query),
        (&Method::GET, ["v1", "relationships", id]) => handle_get_relationship(&state, id),
        (&Method::GET, ["v1", "registrations"]) => handle_list_registrations(&state),
        (&Method::GET, ["v1", "registrations", npi]) => handle_get_registration(&state, npi),
        (&Method::POST, ["v1", "registrations"]) => {
            if permission != Some(PermissionLevel::Admin) {
                return error_response(StatusCode::UNAUTHORIZED, "invalid_key");
            }
            handle_create_registration(&state, req).await
        }
        (&Method::GET, ["v1", "consent", "status", relationship_id]) => {
            handle_consent_status(&state, relationship_id)
        }
        (&Method::GET, ["v1", "status"]) => handle_status(&state),

        _ => error_response(StatusCode::NOT_FOUND, "not_found"),
    }
}

fn handle_get_organization(state: &AppState) -> Response<Full<Bytes>> {
    json_response(
        StatusCode::OK,
        json!({
            "npi": state.organization.npi,
            "name": state.organization.name,
            "type": state.organization.org_type,
        }),
    )
}

fn handle_list_relationships(state: &AppState, query: &std::collections::HashMap<String, String>) -> Response<Full<Bytes>> {
    let (limit, offset) = pagination(query);
    let status = query.get("status").map(|s| match s.as_str() {
        "pending" => RelationshipStatus::Pending,
        "active" => RelationshipStatus::Active,
        "suspended" => RelationshipStatus::Suspended,
        _ => RelationshipStatus::Terminated,
    });

    let store = RelationshipStore::new(&state.storage);
    match store.list(ListFilter { status, limit, offset }) {
        Ok(result) => json_response(
            StatusCode::OK,
            json!({
                "items": result.items,
                "total": result.total,
                "offset": result.offset,
                "limit": result.limit,
            }),
        ),
        Err(_) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
    }
}

fn handle_get_relationship(state: &AppState, id: &str) -> Response<Full<Bytes>> {
    let Ok(uuid) = Uuid::parse_str(id) else {
        return error_response(StatusCode::NOT_FOUND, "not_found");
    };
    let store = RelationshipStore::new(&state.storage);
    match store.get(uuid) {
        Ok(Some(rel)) => json_response(StatusCode::OK, json!(rel)),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "not_found"),
        Err(_) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
    }
}

fn handle_list_registrations(state: &AppState) -> Response<Full<Bytes>> {
    match state.registration.list_providers() {
        Ok(providers) => json_response(StatusCode::OK, json!({ "items": providers })),
        Err(_) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
    }
}

fn handle_get_registration(state: &AppState, npi: &str) -> Response<Full<Bytes>> {
    match state.registration.list_providers() {
        Ok(providers) => match providers.into_iter().find(|p| p.provider_npi == npi) {
            Some(provider) => json_response(StatusCode::OK, json!(provider)),
            None => error_response(StatusCode::NOT_FOUND, "not_found"),
        },
        Err(_) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
    }
}

async fn handle_create_registration(state: &AppState, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let bytes = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "schema_violation"),
    };
    let payload: CreateRegistrationRequest = match serde_json::from_slice(&bytes) {
        Ok(payload) => payload,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "schema_violation"),
    };

    match state.registration.list_providers() {
        Ok(existing) if existing.iter().any(|p| p.provider_npi == payload.provider_npi) => {
            return error_response(StatusCode::CONFLICT, "conflict");
        }
        Err(_) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        _ => {}
    }

    match state
        .registration
        .add_provider(payload.provider_npi, payload.provider_name, payload.provider_types, payload.specialty)
        .await
    {
        Ok(provider) => json_response(StatusCode::OK, json!(provider)),
        Err(RegistrationError::InvalidNpi(_)) => error_response(StatusCode::BAD_REQUEST, "schema_violation"),
        Err(_) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
    }
}

fn handle_consent_status(state: &AppState, relationship_id: &str) -> Response<Full<Bytes>> {
    let Ok(uuid) = Uuid::parse_str(relationship_id) else {
        return error_response(StatusCode::NOT_FOUND, "not_found");
    };
    let store = RelationshipStore::new(&state.storage);
    match store.get(uuid) {
        Ok(Some(rel)) => json_response(
            StatusCode::OK,
            json!({
                "relationship_id": rel.relationship_id,
                "status": rel.status,
                "consented_actions": rel.consented_actions,
            }),
        ),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "not_found"),
        Err(_) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
    }
}

fn handle_status(state: &AppState) -> Response<Full<Bytes>> {
    let axon_status = state
        .registration
        .current_status()
        .ok()
        .flatten()
        .map(|s| serde_json::to_value(s).unwrap_or(json!("unregistered")))
        .unwrap_or(json!("unregistered"));

    json_response(
        StatusCode::OK,
        json!({
            "uptime_secs": state.started_at.elapsed().as_secs(),
            "axon": { "status": axon_status },
            "broker": { "active_sessions": state.broker.active_sessions() },
        }),
    )
}
