//! The national directory, treated as an opaque collaborator with four
//! operations. Its own HTTP schema is out of scope; only the shape of
//! these calls and their error taxonomy (`registry_unreachable` for
//! network/5xx, `registry_rejected` for 4xx) matters here.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RegistrationError;

#[derive(Debug, Clone, Serialize)]
pub struct RegisterNeuronRequest {
    pub organization_npi: String,
    pub organization_name: String,
    pub organization_type: String,
    pub endpoint_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterNeuronResponse {
    pub registration_id: String,
    pub bearer_token: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterProviderRequest {
    pub provider_npi: String,
    pub provider_name: Option<String>,
    pub provider_types: Option<Vec<String>>,
    pub specialty: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterProviderResponse {
    pub directory_id: String,
}

/// The four operations the core consumes from the directory. Implemented
/// over `reqwest` in production and with an in-memory fake in tests.
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    async fn register_neuron(
        &self,
        registry_url: &str,
        bearer_token: Option<&str>,
        request: RegisterNeuronRequest,
    ) -> Result<RegisterNeuronResponse, RegistrationError>;

    async fn update_endpoint(
        &self,
        registry_url: &str,
        bearer_token: &str,
        registration_id: &str,
        endpoint_url: &str,
    ) -> Result<(), RegistrationError>;

    async fn register_provider(
        &self,
        registry_url: &str,
        bearer_token: &str,
        request: RegisterProviderRequest,
    ) -> Result<RegisterProviderResponse, RegistrationError>;

    async fn remove_provider(
        &self,
        registry_url: &str,
        bearer_token: &str,
        provider_npi: &str,
    ) -> Result<(), RegistrationError>;
}

/// Production implementation over `reqwest`.
pub struct HttpDirectoryClient {
    client: reqwest::Client,
}

impl Default for HttpDirectoryClient {
    fn default() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

fn map_status(err: reqwest::Error) -> RegistrationError {
    if let Some(status) = err.status() {
        if status.is_client_error() {
            return RegistrationError::Rejected(format!("directory returned {status}"));
        }
    }
    RegistrationError::Unreachable(err.to_string())
}

#[async_trait]
impl DirectoryClient for HttpDirectoryClient {
    async fn register_neuron(
        &self,
        registry_url: &str,
        bearer_token: Option<&str>,
        request: RegisterNeuronRequest,
    ) -> Result<RegisterNeuronResponse, RegistrationError> {
        let mut req = self.client.post(format!("{registry_url}/neurons")).json(&request);
        if let Some(token) = bearer_token {
            req = req.bearer_auth(token);
        }
        let response = req.send().await.map_err(map_status)?;
        let response = response.error_for_status().map_err(map_status)?;
        response
            .json()
            .await
            .map_err(|e| RegistrationError::Unreachable(e.to_string()))
    }

    async fn update_endpoint(
        &self,
        registry_url: &str,
        bearer_token: &str,
        registration_id: &str,
        endpoint_url: &str,
    ) -> Result<(), RegistrationError> {
        self.client
            .patch(format!("{registry_url}/neurons/{registration_id}"))
            .bearer_auth(bearer_token)
            .json(&serde_json::json!({ "endpoint_url": endpoint_url }))
            .send()
            .await
            .map_err(map_status)?
            .error_for_status()
            .map_err(map_status)?;
        Ok(())
    }

    async fn register_provider(
        &self,
        registry_url: &str,
        bearer_token: &str,
        request: RegisterProviderRequest,
    ) -> Result<RegisterProviderResponse, RegistrationError> {
        let response = self
            .client
            .post(format!("{registry_url}/providers"))
            .bearer_auth(bearer_token)
            .json(&request)
            .send()
            .await
            .map_err(map_status)?
            .error_for_status()
            .map_err(map_status)?;
        response
            .json()
            .await
            .map_err(|e| RegistrationError::Unreachable(e.to_string()))
    }

    async fn remove_provider(
        &self,
        registry_url: &str,
        bearer_token: &str,
        provider_npi: &str,
    ) -> Result<(), RegistrationError> {
        self.client
            .delete(format!("{registry_url}/providers/{provider_npi}"))
            .bearer_auth(bearer_token)
            .send()
            .await
            .map_err(map_status)?
            .error_for_status()
            .map_err(map_status)?;
        Ok(())
    }
}
