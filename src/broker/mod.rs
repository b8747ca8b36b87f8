//! Handshake broker: the hardest subsystem. Accepts WebSocket connections,
//! admits them into bounded work, drives the per-session handshake state
//! machine, exchanges a single address envelope, and disconnects — never
//! acting as a message relay.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{AuditCategory, AuditJournal};
use crate::config::WebsocketConfig;
use crate::consent::{ConsentEnvelope, ConsentVerifier};
use crate::error::BrokerError;
use crate::relationships::{NewRelationship, RelationshipStatus, RelationshipStore};
use crate::storage::StorageEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    AwaitingAuth,
    Verifying,
    Resolving,
    Exchanging,
    Closed,
}

#[derive(Debug, Deserialize)]
struct ConsentToken {
    payload_b64url: String,
    signature_b64url: String,
    public_key_b64url: String,
}

#[derive(Debug, Deserialize)]
struct HandshakeRequest {
    consent_token: ConsentToken,
    provider_npi: String,
    #[serde(default)]
    #[allow(dead_code)]
    address_hint: Option<String>,
}

#[derive(Debug, Serialize)]
struct HandshakeOk {
    relationship_id: Uuid,
    provider_address: String,
    consented_actions: Vec<String>,
}

#[derive(Debug, Serialize)]
struct HandshakeErr {
    error: &'static str,
    code: &'static str,
}

struct BrokerInner {
    storage: Arc<StorageEngine>,
    audit: Arc<AuditJournal>,
    verifier: Arc<ConsentVerifier>,
    config: WebsocketConfig,
    endpoint_url: String,
    admission: Arc<Semaphore>,
    active_sessions: AtomicUsize,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
}

/// The handshake broker. `maxConcurrentHandshakes` bounds the number of
/// sessions simultaneously past `connected`; beyond that ceiling sessions
/// queue (via the admission semaphore's own FIFO waiters) rather than
/// being rejected.
pub struct HandshakeBroker {
    inner: Arc<BrokerInner>,
    sessions: Mutex<JoinSet<()>>,
}

impl HandshakeBroker {
    pub fn new(
        storage: Arc<StorageEngine>,
        audit: Arc<AuditJournal>,
        verifier: Arc<ConsentVerifier>,
        config: WebsocketConfig,
        endpoint_url: String,
    ) -> Self {
        let admission = Arc::new(Semaphore::new(config.max_concurrent_handshakes));
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(BrokerInner {
                storage,
                audit,
                verifier,
                config,
                endpoint_url,
                admission,
                active_sessions: AtomicUsize::new(0),
                running: AtomicBool::new(false),
                shutdown,
            }),
            sessions: Mutex::new(JoinSet::new()),
        }
    }

    pub fn start(&self) {
        self.inner.running.store(true, Ordering::SeqCst);
        info!("handshake broker started");
    }

    /// Closes the listener to new connections, drains queued and
    /// in-flight sessions, bounded by a hard deadline.
    pub async fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        let _ = self.inner.shutdown.send(true);
        let deadline = Duration::from_millis(self.inner.config.auth_timeout_ms.max(self.inner.config.queue_timeout_ms))
            + Duration::from_secs(1);

        let mut sessions = self.sessions.lock().await;
        let _ = tokio::time::timeout(deadline, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;
    }

    pub fn active_sessions(&self) -> usize {
        self.inner.active_sessions.load(Ordering::SeqCst)
    }

    /// Accepts an upgraded WebSocket connection and spawns its session
    /// task. Called by the REST API surface when a request matches the
    /// configured websocket path.
    pub async fn handle_upgrade<S>(&self, stream: WebSocketStream<S>, remote_addr: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if !self.inner.running.load(Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let mut sessions = self.sessions.lock().await;
        sessions.spawn(run_session(inner, stream, remote_addr));
    }
}

/// Decrements the active-session counter on every exit path, including a
/// panic unwinding through the session task.
struct ActiveSessionGuard<'a> {
    inner: &'a BrokerInner,
}

impl<'a> ActiveSessionGuard<'a> {
    fn new(inner: &'a BrokerInner) -> Self {
        inner.active_sessions.fetch_add(1, Ordering::SeqCst);
        Self { inner }
    }
}

impl Drop for ActiveSessionGuard<'_> {
    fn drop(&mut self) {
        self.inner.active_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn run_session<S>(inner: Arc<BrokerInner>, mut ws: WebSocketStream<S>, remote_addr: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let session_id = Uuid::new_v4();

    // connected: admit into bounded work, queueing (not rejecting) past the ceiling,
    // but closed with `shutdown` rather than left to time out if the broker stops
    // while this session is still waiting on the semaphore.
    let mut shutdown_rx = inner.shutdown.subscribe();
    if *shutdown_rx.borrow() {
        close_with_error(&mut ws, BrokerError::Shutdown).await;
        audit_close(&inner, session_id, "anonymous", BrokerError::Shutdown);
        return;
    }

    let permit = tokio::select! {
        acquired = Arc::clone(&inner.admission).acquire_owned() => {
            match acquired {
                Ok(permit) => permit,
                Err(_) => {
                    close_with_error(&mut ws, BrokerError::Shutdown).await;
                    audit_close(&inner, session_id, "anonymous", BrokerError::Shutdown);
                    return;
                }
            }
        }
        _ = tokio::time::sleep(Duration::from_millis(inner.config.queue_timeout_ms)) => {
            close_with_error(&mut ws, BrokerError::QueueTimeout).await;
            audit_close(&inner, session_id, "anonymous", BrokerError::QueueTimeout);
            return;
        }
        _ = shutdown_rx.changed() => {
            close_with_error(&mut ws, BrokerError::Shutdown).await;
            audit_close(&inner, session_id, "anonymous", BrokerError::Shutdown);
            return;
        }
    };

    let _active_guard = ActiveSessionGuard::new(&inner);
    let result = drive_session(&inner, &mut ws).await;
    drop(permit);

    let actor = result.as_ref().ok().map(|(agent_id, _)| agent_id.clone()).unwrap_or_else(|| "anonymous".into());

    match result {
        Ok(_) => {
            let _ = inner.audit.append(
                AuditCategory::Handshake,
                "handshake_completed",
                &actor,
                Default::default(),
            );
        }
        Err(err) => {
            close_with_error(&mut ws, err.clone()).await;
            audit_close(&inner, session_id, &actor, err);
        }
    }

    let _ = ws.close(None).await;
    let _ = remote_addr;
}

/// Drives `awaiting_auth` through `exchanging`, returning the patient
/// agent id on success for auditing.
async fn drive_session<S>(inner: &Arc<BrokerInner>, ws: &mut WebSocketStream<S>) -> Result<(String, ()), BrokerError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    // awaiting_auth
    let message = tokio::time::timeout(Duration::from_millis(inner.config.auth_timeout_ms), ws.next())
        .await
        .map_err(|_| BrokerError::AuthTimeout)?
        .ok_or(BrokerError::AuthTimeout)?
        .map_err(|_| BrokerError::InternalError)?;

    let text = match message {
        Message::Text(text) => text,
        Message::Binary(bytes) => String::from_utf8(bytes).map_err(|_| BrokerError::InternalError)?,
        Message::Close(_) => return Err(BrokerError::Shutdown),
        _ => return Err(BrokerError::InternalError),
    };

    if text.len() > inner.config.max_payload_bytes {
        return Err(BrokerError::PayloadTooLarge);
    }

    let request: HandshakeRequest =
        serde_json::from_str(&text).map_err(|_| BrokerError::Consent(crate::error::ConsentError::SchemaViolation))?;

    // verifying
    let envelope = ConsentEnvelope {
        payload_b64url: request.consent_token.payload_b64url,
        signature_b64url: request.consent_token.signature_b64url,
    };
    let claims = inner
        .verifier
        .verify(&envelope, &request.consent_token.public_key_b64url)?;

    // resolving
    let store = RelationshipStore::new(&inner.storage);
    let pubkey = request.consent_token.public_key_b64url.clone();
    let existing = store
        .find_by_pair(&pubkey, &request.provider_npi, None)
        .map_err(|_| BrokerError::InternalError)?;

    let relationship = match existing {
        Some(rel) if rel.status == RelationshipStatus::Terminated => {
            return Err(BrokerError::RelationshipTerminated)
        }
        Some(rel) if rel.status == RelationshipStatus::Suspended => return Err(BrokerError::Suspended),
        Some(rel) => {
            store
                .update_status(rel.relationship_id, RelationshipStatus::Active)
                .map_err(|_| BrokerError::InternalError)?;
            rel
        }
        None => store
            .create(NewRelationship {
                patient_agent_id: claims.patient_agent_id.clone(),
                patient_public_key: pubkey,
                provider_npi: request.provider_npi.clone(),
                consented_actions: claims.consented_actions.clone(),
            })
            .map_err(|_| BrokerError::InternalError)?,
    };

    // exchanging: a single response frame, then the broker steps out of the message path.
    let response = HandshakeOk {
        relationship_id: relationship.relationship_id,
        provider_address: format!("{}/{}", inner.endpoint_url, claims.patient_agent_id),
        consented_actions: relationship.consented_actions.clone(),
    };
    let body = serde_json::to_string(&response).map_err(|_| BrokerError::InternalError)?;
    ws.send(Message::Text(body)).await.map_err(|_| BrokerError::InternalError)?;

    Ok((claims.patient_agent_id, ()))
}

async fn close_with_error<S>(ws: &mut WebSocketStream<S>, err: BrokerError)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let body = serde_json::to_string(&HandshakeErr {
        error: "handshake failed",
        code: err.code(),
    })
    .unwrap_or_else(|_| "{}".into());
    let _ = ws.send(Message::Text(body)).await;
}

fn audit_close(inner: &Arc<BrokerInner>, session_id: Uuid, actor: &str, err: BrokerError) {
    let mut details = std::collections::BTreeMap::new();
    details.insert("session_id".to_string(), serde_json::json!(session_id.to_string()));
    details.insert("code".to_string(), serde_json::json!(err.code()));
    let _ = inner.audit.append(AuditCategory::Handshake, "handshake_closed", actor, details);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_state_ordering_is_linear_by_construction() {
        // States are only reachable in the order connected -> awaiting_auth ->
        // verifying -> resolving -> exchanging -> closed, enforced by
        // `drive_session`'s straight-line control flow rather than a
        // separate state field that could be set out of order.
        let states = [
            SessionState::Connected,
            SessionState::AwaitingAuth,
            SessionState::Verifying,
            SessionState::Resolving,
            SessionState::Exchanging,
            SessionState::Closed,
        ];
        assert_eq!(states.len(), 6);
    }
}
