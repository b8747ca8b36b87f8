//! Nested configuration, loaded from defaults, an optional JSON file in the
//! working directory, then environment variables prefixed `NEURON` with
//! `__` as the nested-key separator (e.g. `NEURON_SERVER__PORT`).
//!
//! The loaded value is immutable once built: the orchestrator holds it by
//! reference and hands collaborators the sub-struct they need, never a
//! mutable handle into the whole tree.

mod api;
mod audit;
mod axon;
mod heartbeat;
mod local_network;
mod organization;
mod server;
mod storage;
mod websocket;

pub use api::{ApiConfig, CorsConfig, RateLimitConfig};
pub use audit::AuditConfig;
pub use axon::AxonConfig;
pub use heartbeat::HeartbeatConfig;
pub use local_network::LocalNetworkConfig;
pub use organization::{OrganizationConfig, OrganizationType};
pub use server::ServerConfig;
pub use storage::StorageConfig;
pub use websocket::WebsocketConfig;

use config::builder::BuilderState;
use config::{Config, ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};

/// Implemented by every config section so the root loader can register its
/// defaults under a dotted prefix before any source is layered on top.
pub(crate) trait ConfigDefaults {
    fn set_defaults<T: BuilderState>(builder: ConfigBuilder<T>, prefix: &str) -> ConfigBuilder<T>;
}

/// The fully loaded, immutable application configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub organization: OrganizationConfig,
    pub server: ServerConfig,
    pub websocket: WebsocketConfig,
    pub storage: StorageConfig,
    pub audit: AuditConfig,
    #[serde(rename = "localNetwork")]
    pub local_network: LocalNetworkConfig,
    pub heartbeat: HeartbeatConfig,
    pub axon: AxonConfig,
    pub api: ApiConfig,
}

impl AppConfig {
    /// Loads configuration from `<env_prefix>.json` in the working
    /// directory (if present) layered under environment overrides.
    pub fn load(env_prefix: &str) -> Result<Self, config::ConfigError> {
        let mut builder = Config::builder();
        builder = OrganizationConfig::set_defaults(builder, "organization");
        builder = ServerConfig::set_defaults(builder, "server");
        builder = WebsocketConfig::set_defaults(builder, "websocket");
        builder = StorageConfig::set_defaults(builder, "storage");
        builder = AuditConfig::set_defaults(builder, "audit");
        builder = LocalNetworkConfig::set_defaults(builder, "localNetwork");
        builder = HeartbeatConfig::set_defaults(builder, "heartbeat");
        builder = AxonConfig::set_defaults(builder, "axon");
        builder = ApiConfig::set_defaults(builder, "api");

        let filename = format!("{}.json", env_prefix.to_lowercase());
        let config_path = std::env::current_dir()
            .map(|dir| dir.join(&filename))
            .unwrap_or_else(|_| filename.clone().into());

        let built = builder
            .add_source(File::from(config_path).required(false))
            .add_source(
                Environment::with_prefix(env_prefix)
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(","),
            )
            .build()?;

        built.try_deserialize()
    }

    /// Checks for misconfiguration that `load` itself can't reject
    /// (e.g. the default empty NPI is a valid deserialization target but
    /// not a valid organization identity). Intended to run once at
    /// startup, after `load` succeeds.
    pub fn validate(&self) -> Result<(), String> {
        self.organization.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_defaults_when_no_file_or_env_present() {
        // Isolate from any NEURON_* variables set in the test process environment.
        for (key, _) in std::env::vars() {
            if key.starts_with("NEURON_TEST_DEFAULTS_ONLY") {
                std::env::remove_var(key);
            }
        }
        let cfg = AppConfig::load("NEURON_TEST_DEFAULTS_ONLY").expect("defaults must be self-sufficient");
        assert_eq!(cfg.server.port, 3000);
        assert_eq!(cfg.websocket.max_concurrent_handshakes, 10);
        assert_eq!(cfg.axon.backoff_ceiling_ms, 300_000);
    }

    #[test]
    fn env_override_with_double_underscore_separator() {
        std::env::set_var("NEURON_TEST_OVERRIDE__SERVER__PORT", "4000");
        let cfg = AppConfig::load("NEURON_TEST_OVERRIDE").expect("load must succeed");
        assert_eq!(cfg.server.port, 4000);
        std::env::remove_var("NEURON_TEST_OVERRIDE__SERVER__PORT");
    }
}
