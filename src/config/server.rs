use config::builder::BuilderState;
use config::ConfigBuilder;
use serde::{Deserialize, Serialize};

use super::ConfigDefaults;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

impl ConfigDefaults for ServerConfig {
    fn set_defaults<T: BuilderState>(builder: ConfigBuilder<T>, prefix: &str) -> ConfigBuilder<T> {
        builder
            .set_default(format!("{prefix}.port"), 3000)
            .unwrap()
            .set_default(format!("{prefix}.host"), "0.0.0.0")
            .unwrap()
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
