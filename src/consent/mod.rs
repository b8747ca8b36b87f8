//! Consent verifier: Ed25519 signature and claims validation, expiration
//! and replay policy. Stateless per connection except for the nonce
//! cache, which is monotone (inserts only) and capacity-bounded.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use lru::LruCache;
use serde::Deserialize;

use crate::error::ConsentError;

const CLOCK_SKEW: chrono::Duration = chrono::Duration::seconds(30);
const MAX_LIFETIME: chrono::Duration = chrono::Duration::hours(24);
const DEFAULT_NONCE_CACHE_CAPACITY: usize = 10_000;

/// The envelope as received over the wire, before the payload bytes are
/// parsed as claims.
#[derive(Debug, Deserialize)]
pub struct ConsentEnvelope {
    pub payload_b64url: String,
    pub signature_b64url: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConsentClaims {
    pub patient_agent_id: String,
    pub provider_npi: String,
    pub consented_actions: Vec<String>,
    pub iat: i64,
    pub exp: i64,
    #[serde(default)]
    pub nonce: Option<String>,
}

pub struct ConsentVerifier {
    nonce_cache: Mutex<LruCache<(String, String), ()>>,
}

impl ConsentVerifier {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(DEFAULT_NONCE_CACHE_CAPACITY);
        Self {
            nonce_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).expect("capacity must be nonzero"),
            )),
        }
    }

    /// Runs the six-step verification policy and returns the validated
    /// claims on success.
    pub fn verify(
        &self,
        envelope: &ConsentEnvelope,
        public_key_b64url: &str,
    ) -> Result<ConsentClaims, ConsentError> {
        self.verify_at(envelope, public_key_b64url, Utc::now())
    }

    fn verify_at(
        &self,
        envelope: &ConsentEnvelope,
        public_key_b64url: &str,
        now: DateTime<Utc>,
    ) -> Result<ConsentClaims, ConsentError> {
        // 1. Decode payload and signature.
        let payload_bytes = URL_SAFE_NO_PAD
            .decode(&envelope.payload_b64url)
            .map_err(|_| ConsentError::BadEncoding)?;
        let signature_bytes = URL_SAFE_NO_PAD
            .decode(&envelope.signature_b64url)
            .map_err(|_| ConsentError::BadEncoding)?;
        let pubkey_bytes = URL_SAFE_NO_PAD
            .decode(public_key_b64url)
            .map_err(|_| ConsentError::BadEncoding)?;

        let pubkey_array: [u8; 32] = pubkey_bytes.as_slice().try_into().map_err(|_| ConsentError::BadEncoding)?;
        let sig_array: [u8; 64] = signature_bytes.as_slice().try_into().map_err(|_| ConsentError::BadEncoding)?;

        let verifying_key = VerifyingKey::from_bytes(&pubkey_array).map_err(|_| ConsentError::BadEncoding)?;
        let signature = Signature::from_bytes(&sig_array);

        // 2. Recompute the Ed25519 signature over the raw decoded payload bytes.
        verifying_key
            .verify(&payload_bytes, &signature)
            .map_err(|_| ConsentError::BadSignature)?;

        // 3. Parse JSON, rejecting unknown top-level keys.
        let claims: ConsentClaims =
            serde_json::from_slice(&payload_bytes).map_err(|_| ConsentError::SchemaViolation)?;

        if claims.consented_actions.is_empty() {
            return Err(ConsentError::SchemaViolation);
        }

        // 4. Clock skew tolerance.
        let iat = DateTime::<Utc>::from_timestamp(claims.iat, 0).ok_or(ConsentError::SchemaViolation)?;
        let exp = DateTime::<Utc>::from_timestamp(claims.exp, 0).ok_or(ConsentError::SchemaViolation)?;
        if now < iat - CLOCK_SKEW || now > exp + CLOCK_SKEW {
            return Err(ConsentError::Expired);
        }

        // 5. Lifetime cap.
        if exp - iat > MAX_LIFETIME {
            return Err(ConsentError::LifetimeExceeded);
        }

        // 6. Replay check, only if a nonce is present.
        if let Some(nonce) = &claims.nonce {
            let key = (public_key_b64url.to_string(), nonce.clone());
            let mut cache = self.nonce_cache.lock().expect("nonce cache mutex poisoned");
            if cache.contains(&key) {
                return Err(ConsentError::ReplayDetected);
            }
            cache.put(key, ());
        }

        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};
    use rand::rngs::OsRng;
    use serde_json::json;

    fn sign(signing_key: &SigningKey, claims: &serde_json::Value) -> ConsentEnvelope {
        let payload = serde_json::to_vec(claims).unwrap();
        let signature = signing_key.sign(&payload);
        ConsentEnvelope {
            payload_b64url: URL_SAFE_NO_PAD.encode(&payload),
            signature_b64url: URL_SAFE_NO_PAD.encode(signature.to_bytes()),
        }
    }

    #[test]
    fn valid_token_verifies() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let pubkey_b64 = URL_SAFE_NO_PAD.encode(signing_key.verifying_key().to_bytes());
        let now = Utc::now().timestamp();
        let claims = json!({
            "patient_agent_id": "p1",
            "provider_npi": "1234567893",
            "consented_actions": ["office_visit"],
            "iat": now,
            "exp": now + 3600,
        });
        let envelope = sign(&signing_key, &claims);

        let verifier = ConsentVerifier::new(10_000);
        let verified = verifier.verify(&envelope, &pubkey_b64).unwrap();
        assert_eq!(verified.provider_npi, "1234567893");
    }

    #[test]
    fn tampered_payload_fails_signature() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let pubkey_b64 = URL_SAFE_NO_PAD.encode(signing_key.verifying_key().to_bytes());
        let now = Utc::now().timestamp();
        let claims = json!({
            "patient_agent_id": "p1",
            "provider_npi": "1234567893",
            "consented_actions": ["office_visit"],
            "iat": now,
            "exp": now + 3600,
        });
        let mut envelope = sign(&signing_key, &claims);
        envelope.payload_b64url = URL_SAFE_NO_PAD.encode(b"{\"tampered\":true}");

        let verifier = ConsentVerifier::new(10_000);
        let err = verifier.verify(&envelope, &pubkey_b64).unwrap_err();
        assert_eq!(err, ConsentError::BadSignature);
    }

    #[test]
    fn lifetime_exceeding_24_hours_is_rejected() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let pubkey_b64 = URL_SAFE_NO_PAD.encode(signing_key.verifying_key().to_bytes());
        let now = Utc::now().timestamp();
        let claims = json!({
            "patient_agent_id": "p1",
            "provider_npi": "1234567893",
            "consented_actions": ["office_visit"],
            "iat": now,
            "exp": now + 25 * 3600,
        });
        let envelope = sign(&signing_key, &claims);

        let verifier = ConsentVerifier::new(10_000);
        let err = verifier.verify(&envelope, &pubkey_b64).unwrap_err();
        assert_eq!(err, ConsentError::LifetimeExceeded);
    }

    #[test]
    fn replayed_nonce_is_rejected_on_second_use() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let pubkey_b64 = URL_SAFE_NO_PAD.encode(signing_key.verifying_key().to_bytes());
        let now = Utc::now().timestamp();
        let claims = json!({
            "patient_agent_id": "p1",
            "provider_npi": "1234567893",
            "consented_actions": ["office_visit"],
            "iat": now,
            "exp": now + 3600,
            "nonce": "abc123",
        });
        let envelope = sign(&signing_key, &claims);

        let verifier = ConsentVerifier::new(10_000);
        verifier.verify(&envelope, &pubkey_b64).unwrap();
        let err = verifier.verify(&envelope, &pubkey_b64).unwrap_err();
        assert_eq!(err, ConsentError::ReplayDetected);
    }

    #[test]
    fn unknown_top_level_key_is_schema_violation() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let pubkey_b64 = URL_SAFE_NO_PAD.encode(signing_key.verifying_key().to_bytes());
        let now = Utc::now().timestamp();
        let claims = json!({
            "patient_agent_id": "p1",
            "provider_npi": "1234567893",
            "consented_actions": ["office_visit"],
            "iat": now,
            "exp": now + 3600,
            "unexpected_field": "oops",
        });
        let envelope = sign(&signing_key, &claims);

        let verifier = ConsentVerifier::new(10_000);
        let err = verifier.verify(&envelope, &pubkey_b64).unwrap_err();
        assert_eq!(err, ConsentError::SchemaViolation);
    }
}
