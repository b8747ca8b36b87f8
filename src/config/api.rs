use config::builder::BuilderState;
use config::ConfigBuilder;
use serde::{Deserialize, Serialize};

use super::ConfigDefaults;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    #[serde(rename = "maxRequests")]
    pub max_requests: u32,
    #[serde(rename = "windowMs")]
    pub window_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CorsConfig {
    #[serde(rename = "allowedOrigins")]
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    #[serde(rename = "rateLimit")]
    pub rate_limit: RateLimitConfig,
    pub cors: CorsConfig,
}

impl ConfigDefaults for ApiConfig {
    fn set_defaults<T: BuilderState>(builder: ConfigBuilder<T>, prefix: &str) -> ConfigBuilder<T> {
        builder
            .set_default(format!("{prefix}.rateLimit.maxRequests"), 100)
            .unwrap()
            .set_default(format!("{prefix}.rateLimit.windowMs"), 60_000)
            .unwrap()
            .set_default(format!("{prefix}.cors.allowedOrigins"), Vec::<String>::new())
            .unwrap()
    }
}
