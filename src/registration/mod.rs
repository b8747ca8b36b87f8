//! Registration & heartbeat controller: a self-healing state machine that
//! registers with the directory and maintains reachable status with
//! exponential backoff and graceful degradation.

pub mod backoff;
pub mod directory_client;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::audit::{AuditCategory, AuditJournal};
use crate::config::{AxonConfig, HeartbeatConfig, OrganizationConfig};
use crate::error::{RegistrationError, StorageError};
use crate::storage::StorageEngine;
use directory_client::{DirectoryClient, RegisterNeuronRequest, RegisterProviderRequest};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationStatus {
    Unregistered,
    Registering,
    Registered,
    Degraded,
}

impl RegistrationStatus {
    fn as_str(self) -> &'static str {
        match self {
            RegistrationStatus::Unregistered => "unregistered",
            RegistrationStatus::Registering => "registering",
            RegistrationStatus::Registered => "registered",
            RegistrationStatus::Degraded => "degraded",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "registering" => RegistrationStatus::Registering,
            "registered" => RegistrationStatus::Registered,
            "degraded" => RegistrationStatus::Degraded,
            _ => RegistrationStatus::Unregistered,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NeuronRegistrationRow {
    pub organization_npi: String,
    pub organization_name: String,
    pub organization_type: String,
    pub registry_url: String,
    pub endpoint_url: String,
    pub registration_id: Option<String>,
    pub bearer_token: Option<String>,
    pub status: RegistrationStatus,
    pub first_registered_at: Option<String>,
    pub last_heartbeat_at: Option<String>,
    pub last_response_at: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderStatus {
    Pending,
    Registered,
    Failed,
}

impl ProviderStatus {
    fn as_str(self) -> &'static str {
        match self {
            ProviderStatus::Pending => "pending",
            ProviderStatus::Registered => "registered",
            ProviderStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderRegistration {
    pub provider_npi: String,
    pub provider_name: Option<String>,
    pub provider_types: Option<Vec<String>>,
    pub specialty: Option<String>,
    pub directory_id: Option<String>,
    pub status: ProviderStatus,
}

#[derive(Serialize)]
struct HealthSnapshot {
    status: &'static str,
    last_heartbeat_at: Option<String>,
    updated_at: String,
}

struct Inner {
    storage: Arc<StorageEngine>,
    audit: Arc<AuditJournal>,
    directory: Arc<dyn DirectoryClient>,
    organization: OrganizationConfig,
    axon: AxonConfig,
    heartbeat: HeartbeatConfig,
    health_file_path: PathBuf,
    attempt: AtomicU32,
    shutdown: Notify,
    stopped: std::sync::atomic::AtomicBool,
}

/// Registration controller. Exactly one heartbeat timer exists for the
/// lifetime of the controller; `start` and `stop` are both idempotent.
pub struct RegistrationController {
    inner: Arc<Inner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RegistrationController {
    pub fn new(
        storage: Arc<StorageEngine>,
        audit: Arc<AuditJournal>,
        directory: Arc<dyn DirectoryClient>,
        organization: OrganizationConfig,
        axon: AxonConfig,
        heartbeat: HeartbeatConfig,
        health_file_path: PathBuf,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                storage,
                audit,
                directory,
                organization,
                axon,
                heartbeat,
                health_file_path,
                attempt: AtomicU32::new(0),
                shutdown: Notify::new(),
                stopped: std::sync::atomic::AtomicBool::new(false),
            }),
            task: Mutex::new(None),
        }
    }

    fn load_row(storage: &StorageEngine) -> Result<Option<NeuronRegistrationRow>, StorageError> {
        storage.get(
            "SELECT organization_npi, organization_name, organization_type, registry_url, endpoint_url, \
             registration_id, bearer_token, status, first_registered_at, last_heartbeat_at, last_response_at \
             FROM neuron_registration WHERE id = 1",
            &[],
            |row| {
                Ok(NeuronRegistrationRow {
                    organization_npi: row.get(0)?,
                    organization_name: row.get(1)?,
                    organization_type: row.get(2)?,
                    registry_url: row.get(3)?,
                    endpoint_url: row.get(4)?,
                    registration_id: row.get(5)?,
                    bearer_token: row.get(6)?,
                    status: RegistrationStatus::parse(&row.get::<_, String>(7)?),
                    first_registered_at: row.get(8)?,
                    last_heartbeat_at: row.get(9)?,
                    last_response_at: row.get(10)?,
                })
            },
        )
    }

    fn upsert_row(storage: &StorageEngine, row: &NeuronRegistrationRow) -> Result<(), StorageError> {
        storage.run(
            "INSERT INTO neuron_registration (id, organization_npi, organization_name, organization_type, \
             registry_url, endpoint_url, registration_id, bearer_token, status, first_registered_at, \
             last_heartbeat_at, last_response_at) VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
             ON CONFLICT(id) DO UPDATE SET organization_npi=excluded.organization_npi, \
             organization_name=excluded.organization_name, organization_type=excluded.organization_type, \
             registry_url=excluded.registry_url, endpoint_url=excluded.endpoint_url, \
             registration_id=excluded.registration_id, bearer_token=excluded.bearer_token, \
             status=excluded.status, first_registered_at=excluded.first_registered_at, \
             last_heartbeat_at=excluded.last_heartbeat_at, last_response_at=excluded.last_response_at",
            &[
                &row.organization_npi,
                &row.organization_name,
                &row.organization_type,
                &row.registry_url,
                &row.endpoint_url,
                &row.registration_id,
                &row.bearer_token,
                &row.status.as_str(),
                &row.first_registered_at,
                &row.last_heartbeat_at,
                &row.last_response_at,
            ],
        )?;
        Ok(())
    }

    fn write_health_file(path: &PathBuf, status: RegistrationStatus, last_heartbeat_at: Option<String>) {
        let snapshot = HealthSnapshot {
            status: status.as_str(),
            last_heartbeat_at,
            updated_at: Utc::now().to_rfc3339(),
        };
        if let Ok(json) = serde_json::to_string_pretty(&snapshot) {
            let tmp = path.with_extension("tmp");
            if std::fs::write(&tmp, json).and_then(|_| std::fs::rename(&tmp, path)).is_err() {
                warn!("failed to write health file at {}", path.display());
            }
        }
    }

    /// Starts the controller: loads the persisted row (creating the
    /// default one on first run), skips re-registration if already
    /// `registered`, and spawns the single heartbeat task.
    pub async fn start(&self) -> Result<(), RegistrationError> {
        let inner = Arc::clone(&self.inner);

        let row = Self::load_row(&inner.storage)?.unwrap_or_else(|| NeuronRegistrationRow {
            organization_npi: inner.organization.npi.clone(),
            organization_name: inner.organization.name.clone(),
            organization_type: format!("{:?}", inner.organization.org_type).to_lowercase(),
            registry_url: inner.axon.registry_url.clone(),
            endpoint_url: inner.axon.endpoint_url.clone(),
            registration_id: None,
            bearer_token: None,
            status: RegistrationStatus::Unregistered,
            first_registered_at: None,
            last_heartbeat_at: None,
            last_response_at: None,
        });
        Self::upsert_row(&inner.storage, &row)?;

        let already_registered = row.status == RegistrationStatus::Registered && row.registration_id.is_some();

        let handle = tokio::spawn(heartbeat_loop(Arc::clone(&inner), already_registered));
        *self.task.lock().expect("task mutex poisoned") = Some(handle);

        if already_registered {
            info!("registration controller resuming with persisted registration, skipping re-registration");
        }

        Ok(())
    }

    /// Idempotent; waits for any in-flight beat to complete.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.notify_waiters();
        let handle = self.task.lock().expect("task mutex poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Adds a provider, persisting it and forwarding to the directory
    /// when currently registered. Failure marks this provider `failed`
    /// without affecting any other provider.
    pub async fn add_provider(
        &self,
        provider_npi: String,
        provider_name: Option<String>,
        provider_types: Option<Vec<String>>,
        specialty: Option<String>,
    ) -> Result<ProviderRegistration, RegistrationError> {
        if !crate::npi::is_valid(&provider_npi) {
            return Err(RegistrationError::InvalidNpi(provider_npi));
        }

        let now = Utc::now().to_rfc3339();
        self.inner.storage.run(
            "INSERT INTO provider_registrations (provider_npi, provider_name, provider_types, specialty, \
             directory_id, status, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, NULL, 'pending', ?5, ?5) \
             ON CONFLICT(provider_npi) DO UPDATE SET provider_name=excluded.provider_name, \
             provider_types=excluded.provider_types, specialty=excluded.specialty, updated_at=excluded.updated_at",
            &[
                &provider_npi,
                &provider_name,
                &provider_types.as_ref().map(|v| serde_json::to_string(v).unwrap_or_default()),
                &specialty,
                &now,
            ],
        )?;

        let row = Self::load_row(&self.inner.storage)?;
        let mut status = ProviderStatus::Pending;
        let mut directory_id = None;

        if let Some(row) = row {
            if row.status == RegistrationStatus::Registered {
                if let Some(token) = &row.bearer_token {
                    match self
                        .inner
                        .directory
                        .register_provider(
                            &row.registry_url,
                            token,
                            RegisterProviderRequest {
                                provider_npi: provider_npi.clone(),
                                provider_name: provider_name.clone(),
                                provider_types: provider_types.clone(),
                                specialty: specialty.clone(),
                            },
                        )
                        .await
                    {
                        Ok(response) => {
                            status = ProviderStatus::Registered;
                            directory_id = Some(response.directory_id);
                        }
                        Err(err) => {
                            warn!("provider registration failed for {provider_npi}: {err}");
                            status = ProviderStatus::Failed;
                        }
                    }
                }
            }
        }

        self.inner.storage.run(
            "UPDATE provider_registrations SET status = ?1, directory_id = ?2, updated_at = ?3 WHERE provider_npi = ?4",
            &[&status.as_str(), &directory_id, &Utc::now().to_rfc3339(), &provider_npi],
        )?;

        Ok(ProviderRegistration {
            provider_npi,
            provider_name,
            provider_types,
            specialty,
            directory_id,
            status,
        })
    }

    pub fn remove_provider_local(&self, provider_npi: &str) -> Result<(), RegistrationError> {
        self.inner.storage.run(
            "DELETE FROM provider_registrations WHERE provider_npi = ?1",
            &[&provider_npi],
        )?;
        Ok(())
    }

    pub fn list_providers(&self) -> Result<Vec<ProviderRegistration>, RegistrationError> {
        let rows = self.inner.storage.all(
            "SELECT provider_npi, provider_name, provider_types, specialty, directory_id, status \
             FROM provider_registrations ORDER BY provider_npi",
            &[],
            |row| {
                let types_json: Option<String> = row.get(2)?;
                Ok(ProviderRegistration {
                    provider_npi: row.get(0)?,
                    provider_name: row.get(1)?,
                    provider_types: types_json.and_then(|j| serde_json::from_str(&j).ok()),
                    specialty: row.get(3)?,
                    directory_id: row.get(4)?,
                    status: match row.get::<_, String>(5)?.as_str() {
                        "registered" => ProviderStatus::Registered,
                        "failed" => ProviderStatus::Failed,
                        _ => ProviderStatus::Pending,
                    },
                })
            },
        )?;
        Ok(rows)
    }

    pub fn current_status(&self) -> Result<Option<RegistrationStatus>, RegistrationError> {
        Ok(Self::load_row(&self.inner.storage)?.map(|r| r.status))
    }
}

async fn heartbeat_loop(inner: Arc<Inner>, mut already_registered: bool) {
    loop {
        let row = match RegistrationController::load_row(&inner.storage) {
            Ok(Some(row)) => row,
            _ => return,
        };

        if !already_registered && row.status != RegistrationStatus::Registered {
            match inner
                .directory
                .register_neuron(
                    &row.registry_url,
                    row.bearer_token.as_deref(),
                    RegisterNeuronRequest {
                        organization_npi: row.organization_npi.clone(),
                        organization_name: row.organization_name.clone(),
                        organization_type: row.organization_type.clone(),
                        endpoint_url: row.endpoint_url.clone(),
                    },
                )
                .await
            {
                Ok(response) => {
                    let now = Utc::now().to_rfc3339();
                    let mut updated = row.clone();
                    updated.registration_id = Some(response.registration_id);
                    updated.bearer_token = response.bearer_token;
                    updated.status = RegistrationStatus::Registered;
                    updated.first_registered_at = Some(now.clone());
                    updated.last_response_at = Some(now);
                    let _ = RegistrationController::upsert_row(&inner.storage, &updated);
                    inner.attempt.store(0, Ordering::SeqCst);
                    let _ = inner.audit.append(
                        AuditCategory::Registration,
                        "neuron_registered",
                        &row.organization_npi,
                        Default::default(),
                    );
                    info!("registered with directory");
                }
                Err(err) => {
                    handle_failure(&inner, &row, &err);
                }
            }
        } else {
            already_registered = false;
            let now = Utc::now().to_rfc3339();
            RegistrationController::write_health_file(
                &inner.health_file_path,
                RegistrationStatus::Registered,
                Some(now.clone()),
            );
            let mut updated = row.clone();
            updated.last_heartbeat_at = Some(now.clone());
            updated.last_response_at = Some(now);
            let _ = RegistrationController::upsert_row(&inner.storage, &updated);
            inner.attempt.store(0, Ordering::SeqCst);
        }

        let delay = if inner.attempt.load(Ordering::SeqCst) == 0 {
            std::time::Duration::from_millis(inner.heartbeat.interval_ms)
        } else {
            let attempt = inner.attempt.load(Ordering::SeqCst);
            backoff::backoff_with_jitter(attempt, inner.axon.backoff_ceiling_ms)
        };

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = inner.shutdown.notified() => return,
        }

        if inner.stopped.load(Ordering::SeqCst) {
            return;
        }
    }
}

fn handle_failure(inner: &Arc<Inner>, row: &NeuronRegistrationRow, err: &RegistrationError) {
    warn!("directory call failed: {err}");
    let attempt = inner.attempt.fetch_add(1, Ordering::SeqCst) + 1;
    let now = Utc::now().to_rfc3339();

    let mut updated = row.clone();
    updated.status = RegistrationStatus::Degraded;
    updated.last_response_at = Some(now.clone());
    let _ = RegistrationController::upsert_row(&inner.storage, &updated);

    RegistrationController::write_health_file(&inner.health_file_path, RegistrationStatus::Degraded, row.last_heartbeat_at.clone());

    let _ = inner.audit.append(
        AuditCategory::Registration,
        "registry_unreachable",
        &row.organization_npi,
        [("attempt".to_string(), serde_json::json!(attempt))].into_iter().collect(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditJournal;
    use crate::config::OrganizationType;
    use async_trait::async_trait;
    use directory_client::{RegisterNeuronResponse, RegisterProviderResponse};
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    struct FakeDirectory {
        register_calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl DirectoryClient for FakeDirectory {
        async fn register_neuron(
            &self,
            _registry_url: &str,
            _bearer_token: Option<&str>,
            _request: RegisterNeuronRequest,
        ) -> Result<RegisterNeuronResponse, RegistrationError> {
            self.register_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(RegistrationError::Unreachable("offline".into()));
            }
            Ok(RegisterNeuronResponse {
                registration_id: "reg-1".into(),
                bearer_token: Some("token-1".into()),
            })
        }

        async fn update_endpoint(
            &self,
            _registry_url: &str,
            _bearer_token: &str,
            _registration_id: &str,
            _endpoint_url: &str,
        ) -> Result<(), RegistrationError> {
            Ok(())
        }

        async fn register_provider(
            &self,
            _registry_url: &str,
            _bearer_token: &str,
            request: RegisterProviderRequest,
        ) -> Result<RegisterProviderResponse, RegistrationError> {
            Ok(RegisterProviderResponse {
                directory_id: format!("dir-{}", request.provider_npi),
            })
        }

        async fn remove_provider(
            &self,
            _registry_url: &str,
            _bearer_token: &str,
            _provider_npi: &str,
        ) -> Result<(), RegistrationError> {
            Ok(())
        }
    }

    fn controller(storage: Arc<StorageEngine>, directory: Arc<dyn DirectoryClient>, dir: &std::path::Path) -> RegistrationController {
        let audit = Arc::new(AuditJournal::open(dir.join("audit.jsonl")).unwrap());
        RegistrationController::new(
            storage,
            audit,
            directory,
            OrganizationConfig {
                npi: "1234567893".into(),
                name: "Test Clinic".into(),
                org_type: OrganizationType::Clinic,
            },
            AxonConfig {
                registry_url: "http://localhost:9".into(),
                endpoint_url: "ws://localhost:4000".into(),
                backoff_ceiling_ms: 300_000,
            },
            HeartbeatConfig { interval_ms: 60_000 },
            dir.join("health.json"),
        )
    }

    #[tokio::test]
    async fn restart_with_registered_status_skips_registration() {
        let dir = tempdir().unwrap();
        let storage = Arc::new(StorageEngine::open_in_memory().unwrap());
        storage
            .run(
                "INSERT INTO neuron_registration (id, organization_npi, organization_name, organization_type, \
                 registry_url, endpoint_url, registration_id, bearer_token, status, first_registered_at, \
                 last_heartbeat_at, last_response_at) VALUES (1, '1234567893', 'Test Clinic', 'clinic', \
                 'http://localhost:9', 'ws://localhost:4000', 'reg-1', 'token-1', 'registered', '2026-01-01T00:00:00Z', NULL, NULL)",
                &[],
            )
            .unwrap();

        let fake = Arc::new(FakeDirectory { register_calls: AtomicUsize::new(0), fail: false });
        let ctl = controller(storage, fake.clone(), dir.path());
        ctl.start().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        ctl.stop().await;

        assert_eq!(fake.register_calls.load(Ordering::SeqCst), 0);
    }
}
