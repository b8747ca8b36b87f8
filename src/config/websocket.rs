use config::builder::BuilderState;
use config::ConfigBuilder;
use serde::{Deserialize, Serialize};

use super::ConfigDefaults;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebsocketConfig {
    pub path: String,
    #[serde(rename = "maxConcurrentHandshakes")]
    pub max_concurrent_handshakes: usize,
    #[serde(rename = "authTimeoutMs")]
    pub auth_timeout_ms: u64,
    #[serde(rename = "queueTimeoutMs")]
    pub queue_timeout_ms: u64,
    #[serde(rename = "maxPayloadBytes")]
    pub max_payload_bytes: usize,
}

impl ConfigDefaults for WebsocketConfig {
    fn set_defaults<T: BuilderState>(builder: ConfigBuilder<T>, prefix: &str) -> ConfigBuilder<T> {
        builder
            .set_default(format!("{prefix}.path"), "/ws/handshake")
            .unwrap()
            .set_default(format!("{prefix}.maxConcurrentHandshakes"), 10)
            .unwrap()
            .set_default(format!("{prefix}.authTimeoutMs"), 10_000)
            .unwrap()
            .set_default(format!("{prefix}.queueTimeoutMs"), 30_000)
            .unwrap()
            .set_default(format!("{prefix}.maxPayloadBytes"), 65_536)
            .unwrap()
    }
}
