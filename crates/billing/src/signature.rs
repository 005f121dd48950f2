//! Gateway request/notification signing
//!
//! Every request sent to the gateway and every notification received from it
//! carries a `Token` field computed over the remaining top-level parameters:
//!
//! 1. drop the `Token` field itself and any nested (object/array) or null value
//! 2. render each remaining pair as `key=value`
//! 3. sort the pairs lexicographically by key and join them with `&`
//! 4. append the shared secret and take the hex SHA-256 digest
//!
//! Everything here is pure so it can be checked against fixed vectors.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use subtle::ConstantTimeEq;

/// Name of the signature field in gateway payloads
pub const SIGNATURE_FIELD: &str = "Token";

/// Flattened, sorted parameter set that takes part in signing
pub type SignedParams = BTreeMap<String, String>;

/// Build the canonical `k=v&k=v` string (signature field excluded)
pub fn canonical_string(params: &SignedParams) -> String {
    params
        .iter()
        .filter(|(key, _)| key.as_str() != SIGNATURE_FIELD)
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join("&")
}

/// Compute the signature for a parameter set
pub fn sign(params: &SignedParams, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_string(params).as_bytes());
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// Check a provided signature in constant time.
/// Hex case is ignored.
pub fn verify(params: &SignedParams, secret: &str, provided: &str) -> bool {
    let expected = sign(params, secret);
    let provided = provided.trim().to_ascii_lowercase();
    if provided.len() != expected.len() {
        return false;
    }
    expected.as_bytes().ct_eq(provided.as_bytes()).into()
}

/// Flatten the top-level scalar fields of a JSON object into signing params.
///
/// Strings are used verbatim, numbers and booleans in their JSON rendering.
/// Nested values and nulls never take part in the signature.
pub fn params_from_json(value: &serde_json::Value) -> SignedParams {
    let mut params = SignedParams::new();
    if let Some(object) = value.as_object() {
        for (key, field) in object {
            if key == SIGNATURE_FIELD {
                continue;
            }
            let rendered = match field {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::Bool(b) => b.to_string(),
                serde_json::Value::Null
                | serde_json::Value::Array(_)
                | serde_json::Value::Object(_) => continue,
            };
            params.insert(key.clone(), rendered);
        }
    }
    params
}

/// Extract the signature carried by a JSON payload, if any
pub fn signature_from_json(value: &serde_json::Value) -> Option<&str> {
    value.get(SIGNATURE_FIELD).and_then(|v| v.as_str())
}

/// Sign a JSON request body in place by inserting the `Token` field
pub fn sign_json(body: &mut serde_json::Value, secret: &str) {
    let token = sign(&params_from_json(body), secret);
    if let Some(object) = body.as_object_mut() {
        object.insert(
            SIGNATURE_FIELD.to_string(),
            serde_json::Value::String(token),
        );
    }
}
