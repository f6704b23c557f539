// Handoff payload validation

//! Validation separates **errors**, which block a handoff, from **warnings**,
//! which only lower its quality score. Errors: missing execution id, empty
//! payload, non-object payload. Warnings: oversized payload, poorly compatible
//! agent pair, null fields, a payload that reports an error of its own.

use uuid::Uuid;

use crate::config::ProtocolConfig;
use crate::engine::registry::CapabilityRegistry;
use crate::models::{AgentKind, HandoffValidation};

const NULL_FIELD_PENALTY: f64 = 0.05;
const MAX_NULL_PENALTY: f64 = 0.2;
const EMBEDDED_ERROR_PENALTY: f64 = 0.1;

fn json_type(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Validate a candidate payload travelling from `from` to `to`
pub fn validate_payload(
    config: &ProtocolConfig,
    registry: &CapabilityRegistry,
    execution_id: Uuid,
    from: AgentKind,
    to: AgentKind,
    payload: &serde_json::Value,
    payload_bytes: usize,
) -> HandoffValidation {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let mut suggestions = Vec::new();
    let mut score: f64 = 1.0;

    if execution_id.is_nil() {
        errors.push("missing execution identifier".to_string());
    }

    match payload {
        serde_json::Value::Null => errors.push("payload is empty".to_string()),
        serde_json::Value::Object(map) if map.is_empty() => errors.push("payload is empty".to_string()),
        serde_json::Value::Object(map) => {
            let nulls = map.values().filter(|v| v.is_null()).count();
            if nulls > 0 {
                warnings.push(format!("{} payload field(s) are null", nulls));
                score -= (NULL_FIELD_PENALTY * nulls as f64).min(MAX_NULL_PENALTY);
            }
            if map.contains_key("error") {
                warnings.push("payload carries an 'error' field".to_string());
                score -= EMBEDDED_ERROR_PENALTY;
            }
        }
        other => errors.push(format!("payload must be an object, got {}", json_type(other))),
    }

    if payload_bytes > config.max_payload_bytes {
        warnings.push(format!(
            "payload is {} bytes, above the {} byte limit",
            payload_bytes, config.max_payload_bytes
        ));
        suggestions.push("pass large artifacts by reference instead of inline".to_string());
        score -= config.size_penalty;
    }

    let compatibility = registry.pair_compatibility(from, to);
    if compatibility < config.compatibility_warning_threshold {
        warnings.push(format!(
            "low compatibility between {} and {} ({:.2})",
            from, to, compatibility
        ));
        suggestions.push(format!("add a data transform from {} output to {} input", from, to));
        score -= config.compatibility_warning_threshold - compatibility;
    }

    let valid = errors.is_empty();
    HandoffValidation {
        valid,
        quality_score: if valid { score.clamp(0.0, 1.0) } else { 0.0 },
        errors,
        warnings,
        suggestions,
    }
}
