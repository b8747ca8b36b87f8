use config::builder::BuilderState;
use config::ConfigBuilder;
use serde::{Deserialize, Serialize};

use super::ConfigDefaults;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LocalNetworkConfig {
    pub enabled: bool,
}

impl ConfigDefaults for LocalNetworkConfig {
    fn set_defaults<T: BuilderState>(builder: ConfigBuilder<T>, prefix: &str) -> ConfigBuilder<T> {
        builder.set_default(format!("{prefix}.enabled"), false).unwrap()
    }
}
