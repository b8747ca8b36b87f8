use config::builder::BuilderState;
use config::ConfigBuilder;
use serde::{Deserialize, Serialize};

use super::ConfigDefaults;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HeartbeatConfig {
    #[serde(rename = "intervalMs")]
    pub interval_ms: u64,
}

impl ConfigDefaults for HeartbeatConfig {
    fn set_defaults<T: BuilderState>(builder: ConfigBuilder<T>, prefix: &str) -> ConfigBuilder<T> {
        builder
            .set_default(format!("{prefix}.intervalMs"), 60_000)
            .unwrap()
    }
}
