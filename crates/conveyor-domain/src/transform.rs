use serde_json::Value;

use crate::error::{Rejection, RejectionReason};
use crate::types::{NormalizedRecord, RawMessage};

/// Pure mapping from a raw message to a normalized record, or a rejection.
///
/// Implementations must be deterministic and side-effect-free: re-transforming
/// the same raw message always yields the same identity, which is what keeps
/// retried upserts idempotent.
#[cfg_attr(test, mockall::automock)]
pub trait Transform: Send + Sync {
    fn transform(&self, raw: &RawMessage) -> Result<NormalizedRecord, Rejection>;
}

/// Order lifecycle states accepted on the wire.
const KNOWN_STATUSES: [&str; 6] = [
    "CREATED",
    "PROCESSING",
    "DELIVERED",
    "PAID",
    "RETURNED",
    "EXPIRED",
];

/// Normalizes sale-order event payloads.
///
/// Expects a JSON object with at least `code` (the order identity) and
/// `customer`. An absent `status` defaults to CREATED; an unknown one is a
/// rejection. All other fields pass through untouched.
#[derive(Debug, Default, Clone)]
pub struct SaleOrderTransform;

impl SaleOrderTransform {
    pub fn new() -> Self {
        Self
    }
}

impl Transform for SaleOrderTransform {
    fn transform(&self, raw: &RawMessage) -> Result<NormalizedRecord, Rejection> {
        let value: Value = serde_json::from_slice(&raw.payload)
            .map_err(|e| Rejection::unidentified(RejectionReason::MalformedPayload(e.to_string())))?;

        let mut fields = match value {
            Value::Object(map) => map,
            other => {
                return Err(Rejection::unidentified(RejectionReason::MalformedPayload(
                    format!("expected a JSON object, got {}", json_type_name(&other)),
                )))
            }
        };

        // Rejections past this point carry the identity for the audit trail
        let identity = mandatory_string(&fields, "code").map_err(Rejection::unidentified)?;
        mandatory_string(&fields, "customer")
            .map_err(|reason| Rejection::identified(&identity, reason))?;

        match fields.get("status") {
            None | Some(Value::Null) => {
                fields.insert("status".to_string(), Value::String("CREATED".to_string()));
            }
            Some(Value::String(status)) if KNOWN_STATUSES.contains(&status.as_str()) => {}
            Some(other) => {
                return Err(Rejection::identified(
                    &identity,
                    RejectionReason::InvalidField {
                        field: "status".to_string(),
                        detail: format!("unknown order status {}", other),
                    },
                ))
            }
        }

        Ok(NormalizedRecord { identity, fields })
    }
}

fn mandatory_string(
    fields: &serde_json::Map<String, Value>,
    name: &str,
) -> Result<String, RejectionReason> {
    match fields.get(name) {
        None | Some(Value::Null) => Err(RejectionReason::MissingField(name.to_string())),
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::String(_)) => Err(RejectionReason::InvalidField {
            field: name.to_string(),
            detail: "must not be empty".to_string(),
        }),
        Some(other) => Err(RejectionReason::InvalidField {
            field: name.to_string(),
            detail: format!("expected a string, got {}", json_type_name(other)),
        }),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
