use config::builder::BuilderState;
use config::ConfigBuilder;
use serde::{Deserialize, Serialize};

use super::ConfigDefaults;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuditConfig {
    pub path: String,
    pub enabled: bool,
}

impl ConfigDefaults for AuditConfig {
    fn set_defaults<T: BuilderState>(builder: ConfigBuilder<T>, prefix: &str) -> ConfigBuilder<T> {
        builder
            .set_default(format!("{prefix}.path"), "./data/audit.jsonl")
            .unwrap()
            .set_default(format!("{prefix}.enabled"), true)
            .unwrap()
    }
}
