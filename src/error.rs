//! Crate-wide error types.

use thiserror::Error;

/// Storage-layer failures: the embedded database and its migrations.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("migration {0} failed: {1}")]
    Migration(i32, String),

    #[error("row not found")]
    NotFound,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audit journal failures.
#[derive(Error, Debug)]
pub enum AuditError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("chain broken at entry {entry_id}, offset {offset}: expected {expected}, got {actual}")]
    ChainBroken {
        entry_id: String,
        offset: u64,
        expected: String,
        actual: String,
    },

    #[error("malformed journal line at offset {0}")]
    Malformed(u64),
}

/// Consent envelope verification failures, per the taxonomy in the consent policy.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentError {
    #[error("bad_encoding")]
    BadEncoding,
    #[error("bad_signature")]
    BadSignature,
    #[error("schema_violation")]
    SchemaViolation,
    #[error("expired")]
    Expired,
    #[error("lifetime_exceeded")]
    LifetimeExceeded,
    #[error("replay_detected")]
    ReplayDetected,
}

impl ConsentError {
    /// The taxonomy code surfaced to callers and audited.
    pub fn code(self) -> &'static str {
        match self {
            ConsentError::BadEncoding => "bad_encoding",
            ConsentError::BadSignature => "bad_signature",
            ConsentError::SchemaViolation => "schema_violation",
            ConsentError::Expired => "expired",
            ConsentError::LifetimeExceeded => "lifetime_exceeded",
            ConsentError::ReplayDetected => "replay_detected",
        }
    }
}

/// Registration controller failures against the directory collaborator.
#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error("registry_unreachable: {0}")]
    Unreachable(String),

    #[error("registry_rejected: {0}")]
    Rejected(String),

    #[error("invalid_npi: '{0}' is not a Luhn-valid 10-digit NPI")]
    InvalidNpi(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Handshake broker failures, closing a session with a taxonomy code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("queue_timeout")]
    QueueTimeout,
    #[error("auth_timeout")]
    AuthTimeout,
    #[error("payload_too_large")]
    PayloadTooLarge,
    #[error("relationship_terminated")]
    RelationshipTerminated,
    #[error("suspended")]
    Suspended,
    #[error("shutdown")]
    Shutdown,
    #[error("internal_error")]
    InternalError,
    #[error("consent rejected: {0}")]
    Consent(#[from] ConsentError),
}

impl BrokerError {
    pub fn code(&self) -> &'static str {
        match self {
            BrokerError::QueueTimeout => "queue_timeout",
            BrokerError::AuthTimeout => "auth_timeout",
            BrokerError::PayloadTooLarge => "payload_too_large",
            BrokerError::RelationshipTerminated => "relationship_terminated",
            BrokerError::Suspended => "suspended",
            BrokerError::Shutdown => "shutdown",
            BrokerError::InternalError => "internal_error",
            BrokerError::Consent(e) => e.code(),
        }
    }
}

/// REST API failures, mapped to status codes at the handler boundary.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("missing_key")]
    MissingKey,
    #[error("invalid_key")]
    InvalidKey,
    #[error("rate_limited")]
    RateLimited { retry_after_secs: u64 },
    #[error("not_found")]
    NotFound,
    #[error("conflict")]
    Conflict,
    #[error("schema_violation: {0}")]
    SchemaViolation(String),
    #[error("internal_error")]
    Internal(#[from] StorageError),
}

impl ApiError {
    pub fn status(&self) -> u16 {
        match self {
            ApiError::MissingKey | ApiError::InvalidKey => 401,
            ApiError::RateLimited { .. } => 429,
            ApiError::NotFound => 404,
            ApiError::Conflict => 409,
            ApiError::SchemaViolation(_) => 400,
            ApiError::Internal(_) => 500,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::MissingKey => "missing_key",
            ApiError::InvalidKey => "invalid_key",
            ApiError::RateLimited { .. } => "rate_limited",
            ApiError::NotFound => "not_found",
            ApiError::Conflict => "conflict",
            ApiError::SchemaViolation(_) => "schema_violation",
            ApiError::Internal(_) => "internal_error",
        }
    }
}

/// IPC control plane failures.
#[derive(Error, Debug)]
pub enum IpcError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("registration error: {0}")]
    Registration(#[from] RegistrationError),
    #[error("daemon not running")]
    DaemonNotRunning,
}

/// Top-level error used by the orchestrator and anything crossing a
/// component boundary without a more specific type.
#[derive(Error, Debug)]
pub enum NeuronError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Audit(#[from] AuditError),
    #[error(transparent)]
    Registration(#[from] RegistrationError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, NeuronError>;
