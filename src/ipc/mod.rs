//! Local administrative IPC control plane: a Unix domain socket at a path
//! derived from the storage directory, speaking one JSON object per line
//! in both directions. Lets an operator mutate the provider set without
//! restarting the daemon.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::error::IpcError;
use crate::registration::RegistrationController;

const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Derives the control-socket path from the directory holding the
/// storage engine's database file.
pub fn socket_path(data_dir: &Path) -> PathBuf {
    data_dir.join("neuron.sock")
}

#[derive(Debug, Deserialize)]
#[serde(tag = "command", content = "args", rename_all = "snake_case")]
enum Command {
    #[serde(rename = "provider.add")]
    ProviderAdd {
        npi: String,
        name: Option<String>,
        types: Option<Vec<String>>,
        specialty: Option<String>,
    },
    #[serde(rename = "provider.remove")]
    ProviderRemove { npi: String },
    #[serde(rename = "provider.list")]
    ProviderList {},
    Status {},
}

#[derive(Serialize)]
struct OkResponse<T: Serialize> {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

#[derive(Serialize)]
struct ErrResponse {
    ok: bool,
    error: String,
}

fn ok<T: Serialize>(data: T) -> String {
    serde_json::to_string(&OkResponse { ok: true, data: Some(data) }).unwrap_or_else(|_| "{\"ok\":true}".into())
}

fn ok_empty() -> String {
    "{\"ok\":true}".to_string()
}

fn err(message: impl Into<String>) -> String {
    serde_json::to_string(&ErrResponse { ok: false, error: message.into() }).unwrap_or_else(|_| "{\"ok\":false}".into())
}

pub struct IpcServer {
    path: PathBuf,
    registration: Arc<RegistrationController>,
    shutdown: Notify,
}

impl IpcServer {
    pub fn new(path: PathBuf, registration: Arc<RegistrationController>) -> Self {
        Self {
            path,
            registration,
            shutdown: Notify::new(),
        }
    }

    /// Unlinks any stale socket file, binds, and serves connections until
    /// `stop` is called.
    pub async fn start(self: Arc<Self>) -> std::io::Result<tokio::task::JoinHandle<()>> {
        if self.path.exists() {
            let _ = std::fs::remove_file(&self.path);
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(&self.path)?;
        info!("IPC control plane listening at {}", self.path.display());

        let server = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, _addr)) => {
                                let server = Arc::clone(&server);
                                tokio::spawn(async move { server.serve_connection(stream).await; });
                            }
                            Err(err) => warn!("IPC accept error: {err}"),
                        }
                    }
                    _ = server.shutdown.notified() => {
                        break;
                    }
                }
            }
        });

        Ok(handle)
    }

    pub fn stop(&self) {
        self.shutdown.notify_waiters();
        let _ = std::fs::remove_file(&self.path);
    }

    async fn serve_connection(&self, stream: UnixStream) {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return,
                Err(err) => {
                    error!("IPC read error: {err}");
                    return;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let response = self.dispatch(&line).await;
            if writer.write_all(response.as_bytes()).await.is_err() {
                return;
            }
            if writer.write_all(b"\n").await.is_err() {
                return;
            }
        }
    }

    async fn dispatch(&self, line: &str) -> String {
        let command: Command = match serde_json::from_str(line) {
            Ok(command) => command,
            Err(e) => return err(format!("malformed request: {e}")),
        };

        match command {
            Command::ProviderAdd { npi, name, types, specialty } => {
                match self.registration.add_provider(npi, name, types, specialty).await {
                    Ok(provider) => ok(provider),
                    Err(e) => err(e.to_string()),
                }
            }
            Command::ProviderRemove { npi } => match self.registration.remove_provider_local(&npi) {
                Ok(()) => ok_empty(),
                Err(e) => err(e.to_string()),
            },
            Command::ProviderList {} => match self.registration.list_providers() {
                Ok(providers) => ok(providers),
                Err(e) => err(e.to_string()),
            },
            Command::Status {} => match self.registration.current_status() {
                Ok(status) => ok(serde_json::json!({ "status": status })),
                Err(e) => err(e.to_string()),
            },
        }
    }
}

/// Thin client used by the CLI to reach a running daemon.
pub struct IpcClient {
    stream: BufReader<UnixStream>,
}

impl IpcClient {
    pub async fn connect(path: &Path) -> Result<Self, IpcError> {
        let stream = tokio::time::timeout(CLIENT_TIMEOUT, UnixStream::connect(path))
            .await
            .map_err(|_| IpcError::DaemonNotRunning)?
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused => IpcError::DaemonNotRunning,
                _ => IpcError::Io(e),
            })?;
        Ok(Self { stream: BufReader::new(stream) })
    }

    pub async fn call(&mut self, request: serde_json::Value) -> Result<serde_json::Value, IpcError> {
        let mut line = request.to_string();
        line.push('\n');
        self.stream.get_mut().write_all(line.as_bytes()).await?;

        let mut response = String::new();
        tokio::time::timeout(CLIENT_TIMEOUT, self.stream.read_line(&mut response))
            .await
            .map_err(|_| IpcError::DaemonNotRunning)??;

        serde_json::from_str(response.trim()).map_err(|e| IpcError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditJournal;
    use crate::config::{AxonConfig, HeartbeatConfig, OrganizationConfig, OrganizationType};
    use crate::registration::directory_client::{
        DirectoryClient, RegisterNeuronRequest, RegisterNeuronResponse, RegisterProviderRequest, RegisterProviderResponse,
    };
    use crate::storage::StorageEngine;
    use async_trait::async_trait;
    use tempfile::tempdir;

    struct FakeDirectory;

    #[async_trait]
    impl DirectoryClient for FakeDirectory {
        async fn register_neuron(
            &self,
            _registry_url: &str,
            _bearer_token: Option<&str>,
            _request: RegisterNeuronRequest,
        ) -> Result<RegisterNeuronResponse, crate::error::RegistrationError> {
            Ok(RegisterNeuronResponse { registration_id: "reg-1".into(), bearer_token: None })
        }
        async fn update_endpoint(
            &self,
            _registry_url: &str,
            _bearer_token: &str,
            _registration_id: &str,
            _endpoint_url: &str,
        ) -> Result<(), crate::error::RegistrationError> {
            Ok(())
        }
        async fn register_provider(
            &self,
            _registry_url: &str,
            _bearer_token: &str,
            request: RegisterProviderRequest,
        ) -> Result<RegisterProviderResponse, crate::error::RegistrationError> {
            Ok(RegisterProviderResponse { directory_id: format!("dir-{}", request.provider_npi) })
        }
        async fn remove_provider(
            &self,
            _registry_url: &str,
            _bearer_token: &str,
            _provider_npi: &str,
        ) -> Result<(), crate::error::RegistrationError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn k_well_formed_commands_yield_k_responses_in_order() {
        let dir = tempdir().unwrap();
        let storage = Arc::new(StorageEngine::open_in_memory().unwrap());
        let audit = Arc::new(AuditJournal::open(dir.path().join("audit.jsonl")).unwrap());
        let registration = Arc::new(RegistrationController::new(
            storage,
            audit,
            Arc::new(FakeDirectory),
            OrganizationConfig { npi: "1234567893".into(), name: "Test".into(), org_type: OrganizationType::Clinic },
            AxonConfig { registry_url: "http://localhost:9".into(), endpoint_url: "ws://localhost:4000".into(), backoff_ceiling_ms: 1000 },
            HeartbeatConfig { interval_ms: 60_000 },
            dir.path().join("health.json"),
        ));

        let socket = socket_path(dir.path());
        let server = Arc::new(IpcServer::new(socket.clone(), registration));
        let handle = Arc::clone(&server).start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut client = IpcClient::connect(&socket).await.unwrap();

        let r1 = client.call(serde_json::json!({"command": "status", "args": {}})).await.unwrap();
        assert_eq!(r1["ok"], true);
        let r2 = client
            .call(serde_json::json!({"command": "provider.add", "args": {"npi": "1234567897"}}))
            .await
            .unwrap();
        assert_eq!(r2["ok"], true);
        let r3 = client.call(serde_json::json!({"command": "provider.list", "args": {}})).await.unwrap();
        assert_eq!(r3["ok"], true);

        server.stop();
        handle.abort();
    }
}
