//! Static OpenAPI document, assembled once at startup from per-entity
//! JSON-schema fragments rather than hand-maintained by a second, parallel
//! definition. The handshake envelope is intentionally absent — it is
//! documented in the design notes, not this REST surface.

use serde_json::{json, Value};

fn relationship_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "relationship_id": {"type": "string", "format": "uuid"},
            "patient_agent_id": {"type": "string"},
            "provider_npi": {"type": "string"},
            "status": {"type": "string", "enum": ["pending", "active", "suspended", "terminated"]},
            "consented_actions": {"type": "array", "items": {"type": "string"}},
            "created_at": {"type": "string", "format": "date-time"},
            "updated_at": {"type": "string", "format": "date-time"}
        },
        "required": ["relationship_id", "patient_agent_id", "provider_npi", "status", "consented_actions"]
    })
}

fn provider_registration_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "provider_npi": {"type": "string"},
            "provider_name": {"type": "string", "nullable": true},
            "provider_types": {"type": "array", "items": {"type": "string"}, "nullable": true},
            "specialty": {"type": "string", "nullable": true},
            "directory_id": {"type": "string", "nullable": true},
            "status": {"type": "string", "enum": ["pending", "registered", "failed"]}
        },
        "required": ["provider_npi", "status"]
    })
}

fn error_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "error": {"type": "string"},
            "details": {"type": "array", "items": {}, "nullable": true}
        },
        "required": ["error"]
    })
}

/// Assembles the document served at `GET /openapi.json`.
pub fn build() -> String {
    let doc = json!({
        "openapi": "3.0.3",
        "info": {
            "title": "Neuron Trust Broker API",
            "version": "1.0.0"
        },
        "components": {
            "schemas": {
                "Relationship": relationship_schema(),
                "ProviderRegistration": provider_registration_schema(),
                "Error": error_schema()
            },
            "securitySchemes": {
                "ApiKeyAuth": {
                    "type": "apiKey",
                    "in": "header",
                    "name": "X-API-Key"
                }
            }
        },
        "security": [{"ApiKeyAuth": []}],
        "paths": {
            "/health": {"get": {"summary": "Liveness probe", "security": []}},
            "/openapi.json": {"get": {"summary": "This document", "security": []}},
            "/v1/organization": {"get": {"summary": "Organization identity"}},
            "/v1/relationships": {"get": {"summary": "List relationships", "parameters": [
                {"name": "status", "in": "query", "schema": {"type": "string"}},
                {"name": "limit", "in": "query", "schema": {"type": "integer", "maximum": 100}},
                {"name": "offset", "in": "query", "schema": {"type": "integer", "minimum": 0}}
            ]}},
            "/v1/relationships/{id}": {"get": {"summary": "Get a relationship"}},
            "/v1/registrations": {
                "get": {"summary": "List provider registrations"},
                "post": {"summary": "Create a provider registration", "security": [{"ApiKeyAuth": ["admin"]}]}
            },
            "/v1/registrations/{id}": {"get": {"summary": "Get a provider registration"}},
            "/v1/consent/status/{relationship_id}": {"get": {"summary": "Consent status for a relationship"}},
            "/v1/status": {"get": {"summary": "Overall daemon status"}}
        }
    });

    serde_json::to_string_pretty(&doc).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_is_well_formed_json() {
        let doc = build();
        let parsed: Value = serde_json::from_str(&doc).unwrap();
        assert_eq!(parsed["openapi"], "3.0.3");
        assert!(parsed["paths"]["/v1/relationships"].is_object());
    }
}
