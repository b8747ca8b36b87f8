//! Lifecycle orchestrator: brings every collaborator up in dependency
//! order, waits for a shutdown signal, then tears them down in reverse —
//! each step idempotent, the whole drain bounded by a hard deadline.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::api::server::{self, AppState};
use crate::audit::AuditJournal;
use crate::broker::HandshakeBroker;
use crate::config::AppConfig;
use crate::consent::ConsentVerifier;
use crate::discovery::{DiscoveryAdvertiser, MdnsDiscovery};
use crate::error::NeuronError;
use crate::ipc::{socket_path, IpcServer};
use crate::registration::directory_client::HttpDirectoryClient;
use crate::registration::RegistrationController;
use crate::storage::StorageEngine;

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(15);
const NONCE_CACHE_CAPACITY: usize = 10_000;

/// Owns every collaborator and the order they start/stop in. Built once
/// at process startup from the loaded [`AppConfig`].
pub struct Orchestrator {
    storage: Arc<StorageEngine>,
    audit: Arc<AuditJournal>,
    registration: Arc<RegistrationController>,
    broker: Arc<HandshakeBroker>,
    api_state: Arc<AppState>,
    ipc: Arc<IpcServer>,
    discovery: MdnsDiscovery,
    discovery_record: crate::discovery::ServiceTxtRecord,
    bind_addr: String,

    api_handle: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    ipc_handle: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Orchestrator {
    /// Wires every collaborator from configuration without starting any
    /// of them.
    pub fn build(config: AppConfig) -> Result<Self, NeuronError> {
        let storage = Arc::new(StorageEngine::open(&config.storage.path)?);
        let audit = Arc::new(if config.audit.enabled {
            AuditJournal::open(&config.audit.path)?
        } else {
            AuditJournal::disabled()
        });

        let directory = Arc::new(HttpDirectoryClient::default());
        let health_file_path = storage.data_dir().join("health.json");
        let registration = Arc::new(RegistrationController::new(
            Arc::clone(&storage),
            Arc::clone(&audit),
            directory,
            config.organization.clone(),
            config.axon.clone(),
            config.heartbeat.clone(),
            health_file_path,
        ));

        let verifier = Arc::new(ConsentVerifier::new(NONCE_CACHE_CAPACITY));
        let broker = Arc::new(HandshakeBroker::new(
            Arc::clone(&storage),
            Arc::clone(&audit),
            verifier,
            config.websocket.clone(),
            config.axon.endpoint_url.clone(),
        ));

        let api_state = Arc::new(AppState::new(
            Arc::clone(&storage),
            Arc::clone(&audit),
            Arc::clone(&registration),
            Arc::clone(&broker),
            config.organization.clone(),
            config.websocket.clone(),
            config.api.clone(),
        ));

        let socket = socket_path(&storage.data_dir());
        let ipc = Arc::new(IpcServer::new(socket, Arc::clone(&registration)));

        let (discovery, discovery_record) =
            MdnsDiscovery::from_config(&config.organization, &config.server, &config.local_network);

        Ok(Self {
            storage,
            audit,
            registration,
            broker,
            api_state,
            ipc,
            discovery,
            discovery_record,
            bind_addr: config.server.bind_addr(),
            api_handle: tokio::sync::Mutex::new(None),
            ipc_handle: tokio::sync::Mutex::new(None),
        })
    }

    /// Starts every collaborator in dependency order: storage is already
    /// open and migrated by the time `build` returns, so this begins at
    /// the audit journal's consumers.
    pub async fn start(&self) -> Result<(), NeuronError> {
        info!("starting neuron broker");

        self.registration.start().await?;

        self.broker.start();

        let api_state = Arc::clone(&self.api_state);
        let bind_addr = self.bind_addr.clone();
        let api_handle = tokio::spawn(async move {
            if let Err(err) = server::run(api_state, &bind_addr).await {
                error!("REST/WS listener exited: {err}");
            }
        });
        *self.api_handle.lock().await = Some(api_handle);

        let ipc_handle = Arc::clone(&self.ipc).start().await.map_err(NeuronError::Io)?;
        *self.ipc_handle.lock().await = Some(ipc_handle);

        if let Err(err) = self.discovery.start(self.discovery_record.clone()) {
            warn!("discovery advertiser failed to start: {err}");
        }

        info!("neuron broker started");
        Ok(())
    }

    /// Reverses startup order, each step idempotent, bounded overall by
    /// [`SHUTDOWN_DEADLINE`].
    pub async fn stop(&self) {
        info!("stopping neuron broker");
        let _ = tokio::time::timeout(SHUTDOWN_DEADLINE, self.drain()).await;
        info!("neuron broker stopped");
    }

    async fn drain(&self) {
        self.discovery.stop();

        self.ipc.stop();
        if let Some(handle) = self.ipc_handle.lock().await.take() {
            handle.abort();
        }

        if let Some(handle) = self.api_handle.lock().await.take() {
            handle.abort();
        }

        self.broker.stop().await;
        self.registration.stop().await;
    }

    /// Blocks until SIGINT or SIGTERM, then drains. Intended as the
    /// tail of `main`.
    pub async fn run_until_signal(&self) -> Result<(), NeuronError> {
        self.start().await?;
        wait_for_shutdown_signal().await;
        self.stop().await;
        Ok(())
    }

    pub fn storage(&self) -> &Arc<StorageEngine> {
        &self.storage
    }

    pub fn audit(&self) -> &Arc<AuditJournal> {
        &self.audit
    }

    pub fn registration(&self) -> &Arc<RegistrationController> {
        &self.registration
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("received ctrl-c");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        ApiConfig, AuditConfig, AxonConfig, CorsConfig, HeartbeatConfig, LocalNetworkConfig, OrganizationConfig,
        OrganizationType, RateLimitConfig, ServerConfig, StorageConfig, WebsocketConfig,
    };
    use tempfile::tempdir;

    fn test_config(dir: &std::path::Path) -> AppConfig {
        AppConfig {
            organization: OrganizationConfig { npi: "1234567893".into(), name: "Test Clinic".into(), org_type: OrganizationType::Clinic },
            server: ServerConfig { host: "127.0.0.1".into(), port: 0 },
            websocket: WebsocketConfig {
                path: "/ws/handshake".into(),
                max_concurrent_handshakes: 10,
                auth_timeout_ms: 10_000,
                queue_timeout_ms: 30_000,
                max_payload_bytes: 65_536,
            },
            storage: StorageConfig { path: dir.join("neuron.db").to_string_lossy().into_owned() },
            audit: AuditConfig { path: dir.join("audit.jsonl").to_string_lossy().into_owned(), enabled: true },
            local_network: LocalNetworkConfig { enabled: false },
            heartbeat: HeartbeatConfig { interval_ms: 60_000 },
            axon: AxonConfig { registry_url: "http://localhost:9".into(), endpoint_url: "ws://127.0.0.1:4000".into(), backoff_ceiling_ms: 300_000 },
            api: ApiConfig {
                rate_limit: RateLimitConfig { max_requests: 100, window_ms: 60_000 },
                cors: CorsConfig { allowed_origins: vec!["*".into()] },
            },
        }
    }

    #[tokio::test]
    async fn start_then_stop_is_clean_and_idempotent() {
        let dir = tempdir().unwrap();
        let orchestrator = Orchestrator::build(test_config(dir.path())).unwrap();

        orchestrator.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        orchestrator.stop().await;
        orchestrator.stop().await;
    }
}
