//! neuron-broker - organizational trust broker for the care agent network.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use neuron_broker::api::{ApiKeyStore, PermissionLevel};
use neuron_broker::audit::AuditJournal;
use neuron_broker::config::AppConfig;
use neuron_broker::ipc::{socket_path, IpcClient};
use neuron_broker::storage::StorageEngine;
use neuron_broker::{logging, Orchestrator};

const ENV_PREFIX: &str = "NEURON";

#[derive(Parser)]
#[command(name = "neuron-broker", about = "Organizational trust broker for the care agent network")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the storage and audit files at their configured paths, without starting the daemon.
    Init,
    /// Start the daemon in the foreground: storage, audit, registration, broker, REST, IPC, discovery.
    Start,
    /// Ask a running daemon to stop (not yet wired to a supervisor; use signals against the running process).
    Stop,
    /// Query a running daemon's status over the IPC socket.
    Status,
    /// Manage providers registered with the directory.
    Provider {
        #[command(subcommand)]
        action: ProviderAction,
    },
    /// Manage REST API keys.
    ApiKey {
        #[command(subcommand)]
        action: ApiKeyAction,
    },
    /// Verify the audit journal's hash chain from the beginning.
    VerifyAudit,
}

#[derive(Subcommand)]
enum ProviderAction {
    Add {
        npi: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long, value_delimiter = ',')]
        types: Option<Vec<String>>,
        #[arg(long)]
        specialty: Option<String>,
    },
    Remove {
        npi: String,
    },
    List,
}

#[derive(Subcommand)]
enum ApiKeyAction {
    Create {
        name: String,
        #[arg(long, default_value = "read-only")]
        permission: PermissionArg,
    },
    Revoke {
        key_id: uuid::Uuid,
    },
    List,
}

#[derive(Clone, clap::ValueEnum)]
enum PermissionArg {
    ReadOnly,
    Admin,
}

impl From<PermissionArg> for PermissionLevel {
    fn from(value: PermissionArg) -> Self {
        match value {
            PermissionArg::ReadOnly => PermissionLevel::ReadOnly,
            PermissionArg::Admin => PermissionLevel::Admin,
        }
    }
}

const EXIT_SUCCESS: u8 = 0;
const EXIT_FAILURE: u8 = 1;
const EXIT_MISCONFIGURED: u8 = 2;
const EXIT_DAEMON_UNREACHABLE: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    logging::init();

    let cli = Cli::parse();

    let config = match AppConfig::load(ENV_PREFIX) {
        Ok(config) => config,
        Err(err) => {
            error!("configuration error: {err}");
            return ExitCode::from(EXIT_MISCONFIGURED);
        }
    };
    if let Err(err) = config.validate() {
        error!("configuration error: {err}");
        return ExitCode::from(EXIT_MISCONFIGURED);
    }

    let code = match cli.command {
        Command::Init => run_init(&config),
        Command::Start => run_start(config).await,
        Command::Stop => run_stop(&config).await,
        Command::Status => run_status(&config).await,
        Command::Provider { action } => run_provider(&config, action).await,
        Command::ApiKey { action } => run_api_key(&config, action),
        Command::VerifyAudit => run_verify_audit(&config),
    };

    ExitCode::from(code)
}

fn run_init(config: &AppConfig) -> u8 {
    info!("initializing storage at {}", config.storage.path);
    if let Err(err) = StorageEngine::open(&config.storage.path) {
        error!("failed to initialize storage: {err}");
        return EXIT_FAILURE;
    }
    if config.audit.enabled {
        info!("initializing audit journal at {}", config.audit.path);
        if let Err(err) = AuditJournal::open(&config.audit.path) {
            error!("failed to initialize audit journal: {err}");
            return EXIT_FAILURE;
        }
    }
    info!("initialization complete");
    EXIT_SUCCESS
}

async fn run_start(config: AppConfig) -> u8 {
    info!("======================================");
    info!("  neuron-broker");
    info!("======================================");
    info!("organization: {} ({})", config.organization.name, config.organization.npi);
    info!("listening on: {}", config.server.bind_addr());
    info!("websocket path: {}", config.websocket.path);
    info!("directory: {}", config.axon.registry_url);
    info!("======================================");

    let orchestrator = match Orchestrator::build(config) {
        Ok(orchestrator) => orchestrator,
        Err(err) => {
            error!("failed to assemble daemon: {err}");
            return EXIT_FAILURE;
        }
    };

    if let Err(err) = orchestrator.run_until_signal().await {
        error!("daemon exited with error: {err}");
        return EXIT_FAILURE;
    }
    EXIT_SUCCESS
}

async fn run_stop(config: &AppConfig) -> u8 {
    // Graceful stop is signal-driven (SIGINT/SIGTERM) against the running
    // process; the IPC plane has no remote-shutdown command, matching the
    // orchestrator's own lifecycle boundary.
    match ipc_client(config).await {
        Ok(_) => {
            info!("daemon is running; send SIGTERM to its process to stop it");
            EXIT_SUCCESS
        }
        Err(err) => {
            error!("{err}");
            EXIT_DAEMON_UNREACHABLE
        }
    }
}

async fn run_status(config: &AppConfig) -> u8 {
    let mut client = match ipc_client(config).await {
        Ok(client) => client,
        Err(err) => {
            error!("{err}");
            return EXIT_DAEMON_UNREACHABLE;
        }
    };

    match client.call(serde_json::json!({"command": "status", "args": {}})).await {
        Ok(response) => {
            println!("{}", serde_json::to_string_pretty(&response).unwrap_or_default());
            EXIT_SUCCESS
        }
        Err(err) => {
            error!("status request failed: {err}");
            EXIT_DAEMON_UNREACHABLE
        }
    }
}

async fn run_provider(config: &AppConfig, action: ProviderAction) -> u8 {
    let mut client = match ipc_client(config).await {
        Ok(client) => client,
        Err(err) => {
            error!("{err}");
            return EXIT_DAEMON_UNREACHABLE;
        }
    };

    let request = match action {
        ProviderAction::Add { npi, name, types, specialty } => serde_json::json!({
            "command": "provider.add",
            "args": { "npi": npi, "name": name, "types": types, "specialty": specialty },
        }),
        ProviderAction::Remove { npi } => serde_json::json!({
            "command": "provider.remove",
            "args": { "npi": npi },
        }),
        ProviderAction::List => serde_json::json!({ "command": "provider.list", "args": {} }),
    };

    match client.call(request).await {
        Ok(response) => {
            println!("{}", serde_json::to_string_pretty(&response).unwrap_or_default());
            if response["ok"] == false {
                EXIT_FAILURE
            } else {
                EXIT_SUCCESS
            }
        }
        Err(err) => {
            error!("provider command failed: {err}");
            EXIT_DAEMON_UNREACHABLE
        }
    }
}

fn run_api_key(config: &AppConfig, action: ApiKeyAction) -> u8 {
    let storage = match StorageEngine::open(&config.storage.path) {
        Ok(storage) => storage,
        Err(err) => {
            error!("failed to open storage: {err}");
            return EXIT_FAILURE;
        }
    };
    let store = ApiKeyStore::new(&storage);

    match action {
        ApiKeyAction::Create { name, permission } => match store.create(&name, permission.into()) {
            Ok(created) => {
                println!("key_id: {}", created.summary.key_id);
                println!("raw_key: {}", created.raw_key);
                println!("(the raw key is shown once; it cannot be recovered)");
                EXIT_SUCCESS
            }
            Err(err) => {
                error!("failed to create API key: {err}");
                EXIT_FAILURE
            }
        },
        ApiKeyAction::Revoke { key_id } => match store.revoke(key_id) {
            Ok(true) => {
                info!("revoked key {key_id}");
                EXIT_SUCCESS
            }
            Ok(false) => {
                error!("no active key with id {key_id}");
                EXIT_FAILURE
            }
            Err(err) => {
                error!("failed to revoke key: {err}");
                EXIT_FAILURE
            }
        },
        ApiKeyAction::List => match store.list() {
            Ok(keys) => {
                println!("{}", serde_json::to_string_pretty(&keys).unwrap_or_default());
                EXIT_SUCCESS
            }
            Err(err) => {
                error!("failed to list keys: {err}");
                EXIT_FAILURE
            }
        },
    }
}

fn run_verify_audit(config: &AppConfig) -> u8 {
    if !config.audit.enabled {
        info!("audit journal disabled; nothing to verify");
        return EXIT_SUCCESS;
    }
    let journal = match AuditJournal::open(&config.audit.path) {
        Ok(journal) => journal,
        Err(err) => {
            error!("failed to open audit journal: {err}");
            return EXIT_FAILURE;
        }
    };
    match journal.verify(0) {
        Ok(report) if report.ok => {
            info!("audit chain verified clean: {} entries checked", report.entries_checked);
            EXIT_SUCCESS
        }
        Ok(report) => {
            error!(
                "audit chain broken at offset {:?}: expected {:?}, got {:?}",
                report.broken_at, report.expected_hash, report.actual_hash
            );
            EXIT_FAILURE
        }
        Err(err) => {
            error!("failed to verify audit journal: {err}");
            EXIT_FAILURE
        }
    }
}

async fn ipc_client(config: &AppConfig) -> Result<IpcClient, String> {
    let data_dir = PathBuf::from(&config.storage.path)
        .parent()
        .map(PathBuf::from)
        .unwrap_or_default();
    let socket = socket_path(&data_dir);
    IpcClient::connect(&socket)
        .await
        .map_err(|_| "daemon not running".to_string())
}
