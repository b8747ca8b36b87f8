use config::builder::BuilderState;
use config::ConfigBuilder;
use serde::{Deserialize, Serialize};

use super::ConfigDefaults;

/// Configuration for the directory (registry) collaborator, named `axon`
/// after the wire vocabulary this daemon speaks to reach it.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AxonConfig {
    #[serde(rename = "registryUrl")]
    pub registry_url: String,
    #[serde(rename = "endpointUrl")]
    pub endpoint_url: String,
    #[serde(rename = "backoffCeilingMs")]
    pub backoff_ceiling_ms: u64,
}

impl ConfigDefaults for AxonConfig {
    fn set_defaults<T: BuilderState>(builder: ConfigBuilder<T>, prefix: &str) -> ConfigBuilder<T> {
        builder
            .set_default(format!("{prefix}.registryUrl"), "")
            .unwrap()
            .set_default(format!("{prefix}.endpointUrl"), "")
            .unwrap()
            .set_default(format!("{prefix}.backoffCeilingMs"), 300_000)
            .unwrap()
    }
}
