use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Wrap several messages into one batch envelope to amortize XADDs.
pub fn wrap_batch(items: Vec<Value>) -> Value {
    serde_json::json!({ "batch": true, "items": items })
}

/// Split a stream payload into its constituent messages. Producers may wrap
/// several messages in `{"batch": true, "items": [...]}` to amortize XADDs;
/// items come back in array order.
pub fn unwrap_batch(data: &Value) -> Vec<Value> {
    if let Some(obj) = data.as_object() {
        if obj.get("batch").and_then(Value::as_bool) == Some(true) {
            if let Some(items) = obj.get("items").and_then(Value::as_array) {
                return items.clone();
            }
        }
    }
    vec![data.clone()]
}

/// Persisted value plus its MAC. Any state written for another instance to
/// read goes through this wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedEnvelope {
    pub value: Value,
    pub mac: String,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum EnvelopeError {
    #[error("envelope MAC verification failed")]
    BadMac,
    #[error("malformed envelope: {0}")]
    Malformed(String),
}

fn mac_bytes(value: &Value, key: &[u8]) -> Vec<u8> {
    // serde_json serialization is deterministic for a given Value, which is
    // all the MAC needs: sign and verify see the same bytes.
    let serialized = serde_json::to_vec(value).expect("Value is always serializable");
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(&serialized);
    mac.finalize().into_bytes().to_vec()
}

/// Wrap `value` with an HMAC-SHA256 over its serialized form.
pub fn sign_envelope(value: &Value, key: &[u8]) -> SignedEnvelope {
    SignedEnvelope {
        value: value.clone(),
        mac: hex::encode(mac_bytes(value, key)),
    }
}

/// Verify and unwrap a signed envelope. Comparison is constant-time.
pub fn open_signed(envelope: &SignedEnvelope, key: &[u8]) -> Result<Value, EnvelopeError> {
    let expected =
        hex::decode(&envelope.mac).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
    let serialized =
        serde_json::to_vec(&envelope.value).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(&serialized);
    mac.verify_slice(&expected)
        .map_err(|_| EnvelopeError::BadMac)?;
    Ok(envelope.value.clone())
}
