//! Envelope encoding, decoding and canonicalization
//!
//! [`MessageCodec`] turns [`Envelope`]s into wire text and back. Every
//! envelope must satisfy the envelope invariant: it is either a call
//! (`method` present, no `result`/`error`) or a response (exactly one of
//! `result` or `error`, no `method`). Encoding a violating envelope fails
//! with [`CapwireError::Encoding`]; decoding one fails with
//! [`CapwireError::Decode`].
//!
//! A single transport message (a [`Frame`]) carries either one envelope or
//! a non-empty JSON array of envelopes (a batch).
//!
//! The codec also canonicalizes parameter maps (recursive key ordering) so
//! that logically identical calls produce identical [`fingerprint`]s.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CapwireError, Result};
use crate::types::{CapabilityKind, JSONRPC_VERSION};

/// Correlation identifier: the wire allows numbers or strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    String(String),
}

impl RequestId {
    /// Numeric view of the id. String ids that parse as integers are
    /// accepted because some providers echo ids back as strings.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            RequestId::Number(n) => Some(*n),
            RequestId::String(s) => s.parse().ok(),
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s:?}"),
        }
    }
}

/// A JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

impl From<RpcError> for CapwireError {
    fn from(e: RpcError) -> Self {
        CapwireError::Remote {
            code: e.code,
            message: e.message,
            data: e.data,
        }
    }
}

/// JSON-RPC "method not found".
pub const ERROR_METHOD_NOT_FOUND: i64 = -32601;

/// Deserialize a present field as `Some`, even when its value is `null`.
///
/// Without this a `"result": null` response would be indistinguishable
/// from a message with no `result` at all.
fn present<'de, D>(deserializer: D) -> std::result::Result<Option<serde_json::Value>, D::Error>
where
    D: Deserializer<'de>,
{
    serde_json::Value::deserialize(deserializer).map(Some)
}

/// The structured message exchanged over a transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version tag; always `"2.0"` on valid messages.
    pub jsonrpc: String,
    /// Correlation id; absent (or null) on notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

/// Which side of the conversation an envelope belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    /// A call that expects a response.
    Request,
    /// A call with no id; no response expected.
    Notification,
    /// A result or error for an earlier request.
    Response,
}

impl Envelope {
    /// Build a request envelope.
    pub fn request(id: u64, method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(RequestId::Number(id)),
            method: Some(method.into()),
            params: Some(params),
            result: None,
            error: None,
        }
    }

    /// Build a notification envelope.
    pub fn notification(method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: Some(method.into()),
            params: Some(params),
            result: None,
            error: None,
        }
    }

    /// Build a success response envelope.
    pub fn success(id: Option<RequestId>, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: None,
            params: None,
            result: Some(result),
            error: None,
        }
    }

    /// Build an error response envelope.
    pub fn failure(id: Option<RequestId>, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: None,
            params: None,
            result: None,
            error: Some(error),
        }
    }

    /// Check the envelope invariant and return the envelope kind.
    ///
    /// # Errors
    ///
    /// Returns a plain message describing the violation; callers wrap it in
    /// the error kind appropriate for their direction.
    pub fn check(&self) -> std::result::Result<EnvelopeKind, String> {
        match (&self.method, &self.result, &self.error) {
            (Some(_), None, None) => Ok(if self.id.is_some() {
                EnvelopeKind::Request
            } else {
                EnvelopeKind::Notification
            }),
            (None, Some(_), None) | (None, None, Some(_)) => Ok(EnvelopeKind::Response),
            (Some(_), _, _) => Err("envelope carries both a method and a result/error".to_string()),
            (None, Some(_), Some(_)) => {
                Err("response carries both a result and an error".to_string())
            }
            (None, None, None) => {
                Err("envelope carries neither a method nor a result/error".to_string())
            }
        }
    }

    /// Envelope kind, assuming the invariant already holds.
    pub fn kind(&self) -> EnvelopeKind {
        if self.method.is_none() {
            EnvelopeKind::Response
        } else if self.id.is_some() {
            EnvelopeKind::Request
        } else {
            EnvelopeKind::Notification
        }
    }
}

/// One transport message: a single envelope or a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Single(Envelope),
    Batch(Vec<Envelope>),
}

impl Frame {
    /// Flatten the frame, preserving batch order.
    pub fn into_envelopes(self) -> Vec<Envelope> {
        match self {
            Frame::Single(e) => vec![e],
            Frame::Batch(es) => es,
        }
    }
}

/// Encoder/decoder for wire envelopes.
#[derive(Debug, Clone, Default)]
pub struct MessageCodec;

impl MessageCodec {
    pub fn new() -> Self {
        Self
    }

    /// Serialize one envelope.
    ///
    /// # Errors
    ///
    /// Returns [`CapwireError::Encoding`] if the envelope invariant is
    /// violated.
    pub fn encode(&self, envelope: &Envelope) -> Result<String> {
        envelope.check().map_err(CapwireError::Encoding)?;
        Ok(serde_json::to_string(envelope).map_err(|e| CapwireError::Encoding(e.to_string()))?)
    }

    /// Serialize several envelopes as one transmission.
    ///
    /// A single envelope is written as a bare object; two or more become a
    /// JSON array in the given order.
    ///
    /// # Errors
    ///
    /// Returns [`CapwireError::Encoding`] for an empty batch or if any
    /// envelope violates the invariant.
    pub fn encode_batch(&self, envelopes: &[Envelope]) -> Result<String> {
        match envelopes {
            [] => Err(CapwireError::Encoding("cannot encode an empty batch".to_string()).into()),
            [single] => self.encode(single),
            many => {
                for envelope in many {
                    envelope.check().map_err(CapwireError::Encoding)?;
                }
                Ok(serde_json::to_string(many)
                    .map_err(|e| CapwireError::Encoding(e.to_string()))?)
            }
        }
    }

    /// Parse one transport message.
    ///
    /// # Errors
    ///
    /// Returns [`CapwireError::Decode`] for malformed JSON, non-object
    /// entries, empty batches, or envelopes violating the invariant.
    /// Returns [`CapwireError::ProtocolVersionMismatch`] if any envelope
    /// carries a version tag other than `"2.0"`.
    pub fn decode(&self, raw: &str) -> Result<Frame> {
        let (entries, batched) = self.split(raw)?;
        let mut envelopes = entries
            .into_iter()
            .map(|item| self.decode_value(item))
            .collect::<Result<Vec<_>>>()?;
        if batched {
            return Ok(Frame::Batch(envelopes));
        }
        envelopes
            .pop()
            .map(Frame::Single)
            .ok_or_else(|| CapwireError::Decode("empty message".to_string()).into())
    }

    /// Parse one transport message, decoding each batch entry on its own.
    ///
    /// The outer `Err` is reserved for messages that cannot be split into
    /// entries at all (malformed JSON, an empty batch, a scalar). A bad entry
    /// only fails its own slot, in batch order.
    pub fn decode_entries(&self, raw: &str) -> Result<Vec<Result<Envelope>>> {
        let (entries, _) = self.split(raw)?;
        Ok(entries
            .into_iter()
            .map(|item| self.decode_value(item))
            .collect())
    }

    fn split(&self, raw: &str) -> Result<(Vec<serde_json::Value>, bool)> {
        let value: serde_json::Value = serde_json::from_str(raw.trim())
            .map_err(|e| CapwireError::Decode(format!("invalid JSON: {e}")))?;

        match value {
            serde_json::Value::Array(items) if items.is_empty() => {
                Err(CapwireError::Decode("empty batch".to_string()).into())
            }
            serde_json::Value::Array(items) => Ok((items, true)),
            serde_json::Value::Object(_) => Ok((vec![value], false)),
            other => Err(CapwireError::Decode(format!(
                "expected an object or array, got {}",
                json_type_name(&other)
            ))
            .into()),
        }
    }

    fn decode_value(&self, value: serde_json::Value) -> Result<Envelope> {
        if !value.is_object() {
            return Err(CapwireError::Decode(format!(
                "batch entry is {}, not an object",
                json_type_name(&value)
            ))
            .into());
        }
        match value.get("jsonrpc") {
            Some(serde_json::Value::String(v)) if v == JSONRPC_VERSION => {}
            Some(serde_json::Value::String(v)) => {
                return Err(CapwireError::ProtocolVersionMismatch {
                    expected: vec![JSONRPC_VERSION.to_string()],
                    got: v.clone(),
                }
                .into());
            }
            Some(other) => {
                return Err(CapwireError::Decode(format!(
                    "version tag must be a string, got {}",
                    json_type_name(other)
                ))
                .into());
            }
            None => return Err(CapwireError::Decode("missing version tag".to_string()).into()),
        }

        let envelope: Envelope = serde_json::from_value(value)
            .map_err(|e| CapwireError::Decode(format!("malformed envelope: {e}")))?;
        envelope.check().map_err(CapwireError::Decode)?;
        Ok(envelope)
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

/// Return a copy of `value` with every object's keys in sorted order.
pub fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = serde_json::Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            serde_json::Value::Object(sorted)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(canonicalize).collect())
        }
        other => other.clone(),
    }
}

/// Canonical text form of a parameter value. `null` and `{}` are treated
/// as the same empty parameter set.
pub fn canonical_string(value: &serde_json::Value) -> String {
    if value.is_null() {
        return "{}".to_string();
    }
    canonicalize(value).to_string()
}

/// Cache key for a capability call: hex sha256 of kind, name and the
/// canonical parameters.
pub fn fingerprint(kind: CapabilityKind, name: &str, params: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(name.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical_string(params).as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::classify;
    use serde_json::json;

    fn codec() -> MessageCodec {
        MessageCodec::new()
    }

    #[test]
    fn test_encode_request_has_method_and_id() {
        let raw = codec()
            .encode(&Envelope::request(7, "ping", json!({})))
            .unwrap();
        let v: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(v["jsonrpc"], "2.0");
        assert_eq!(v["id"], 7);
        assert_eq!(v["method"], "ping");
        assert!(v.get("result").is_none());
    }

    #[test]
    fn test_encode_rejects_method_plus_result() {
        let mut envelope = Envelope::request(1, "ping", json!({}));
        envelope.result = Some(json!({}));
        let err = codec().encode(&envelope).unwrap_err();
        assert!(matches!(classify(&err), Some(CapwireError::Encoding(_))));
    }

    #[test]
    fn test_encode_rejects_result_plus_error() {
        let mut envelope = Envelope::success(Some(RequestId::Number(1)), json!(1));
        envelope.error = Some(RpcError {
            code: -1,
            message: "x".into(),
            data: None,
        });
        assert!(codec().encode(&envelope).is_err());
    }

    #[test]
    fn test_encode_rejects_empty_envelope() {
        let envelope = Envelope {
            jsonrpc: "2.0".into(),
            id: Some(RequestId::Number(1)),
            method: None,
            params: None,
            result: None,
            error: None,
        };
        assert!(codec().encode(&envelope).is_err());
    }

    #[test]
    fn test_encode_batch_single_is_bare_object() {
        let raw = codec()
            .encode_batch(&[Envelope::request(1, "ping", json!({}))])
            .unwrap();
        assert!(raw.starts_with('{'));
    }

    #[test]
    fn test_encode_batch_preserves_order() {
        let batch: Vec<Envelope> = (1..=3)
            .map(|i| Envelope::request(i, "ping", json!({})))
            .collect();
        let raw = codec().encode_batch(&batch).unwrap();
        let v: Vec<serde_json::Value> = serde_json::from_str(&raw).unwrap();
        let ids: Vec<u64> = v.iter().map(|e| e["id"].as_u64().unwrap()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_encode_empty_batch_fails() {
        assert!(codec().encode_batch(&[]).is_err());
    }

    #[test]
    fn test_decode_success_response() {
        let frame = codec()
            .decode(r#"{"jsonrpc":"2.0","id":3,"result":{"ok":true}}"#)
            .unwrap();
        let Frame::Single(envelope) = frame else {
            panic!("expected a single envelope");
        };
        assert_eq!(envelope.kind(), EnvelopeKind::Response);
        assert_eq!(envelope.id, Some(RequestId::Number(3)));
    }

    #[test]
    fn test_decode_null_result_is_a_response() {
        let frame = codec()
            .decode(r#"{"jsonrpc":"2.0","id":3,"result":null}"#)
            .unwrap();
        let envelope = frame.into_envelopes().remove(0);
        assert_eq!(envelope.result, Some(serde_json::Value::Null));
    }

    #[test]
    fn test_decode_rejects_neither_method_nor_result() {
        let err = codec().decode(r#"{"jsonrpc":"2.0","id":3}"#).unwrap_err();
        assert!(matches!(classify(&err), Some(CapwireError::Decode(_))));
    }

    #[test]
    fn test_decode_rejects_method_and_error() {
        let err = codec()
            .decode(r#"{"jsonrpc":"2.0","id":3,"method":"x","error":{"code":1,"message":"m"}}"#)
            .unwrap_err();
        assert!(matches!(classify(&err), Some(CapwireError::Decode(_))));
    }

    #[test]
    fn test_decode_rejects_unsupported_version() {
        let err = codec()
            .decode(r#"{"jsonrpc":"1.0","id":3,"result":{}}"#)
            .unwrap_err();
        assert!(matches!(
            classify(&err),
            Some(CapwireError::ProtocolVersionMismatch { got, .. }) if got == "1.0"
        ));
    }

    #[test]
    fn test_decode_rejects_missing_version() {
        let err = codec().decode(r#"{"id":3,"result":{}}"#).unwrap_err();
        assert!(matches!(classify(&err), Some(CapwireError::Decode(_))));
    }

    #[test]
    fn test_decode_batch_keeps_order() {
        let frame = codec()
            .decode(
                r#"[{"jsonrpc":"2.0","id":2,"result":1},{"jsonrpc":"2.0","id":1,"result":2}]"#,
            )
            .unwrap();
        let ids: Vec<_> = frame
            .into_envelopes()
            .into_iter()
            .map(|e| e.id.unwrap())
            .collect();
        assert_eq!(ids, vec![RequestId::Number(2), RequestId::Number(1)]);
    }

    #[test]
    fn test_decode_rejects_empty_batch_and_scalars() {
        assert!(codec().decode("[]").is_err());
        assert!(codec().decode("42").is_err());
        assert!(codec().decode("not json").is_err());
        assert!(codec().decode(r#"[{"jsonrpc":"2.0","id":1,"result":1}, 3]"#).is_err());
    }

    #[test]
    fn test_decode_entries_isolates_bad_entry() {
        let entries = codec()
            .decode_entries(
                r#"[{"jsonrpc":"2.0","id":1,"result":{"ok":true}},
                    {"jsonrpc":"2.0","id":2,"result":1,"error":{"code":1,"message":"m"}},
                    7]"#,
            )
            .unwrap();

        assert_eq!(entries.len(), 3);
        assert_eq!(
            entries[0].as_ref().unwrap().id,
            Some(RequestId::Number(1))
        );
        assert!(entries[1].is_err());
        assert!(entries[2].is_err());
        assert!(codec().decode_entries("[]").is_err());
    }

    #[test]
    fn test_decode_notification_kind() {
        let envelope = codec()
            .decode(r#"{"jsonrpc":"2.0","method":"notifications/tools/list_changed"}"#)
            .unwrap()
            .into_envelopes()
            .remove(0);
        assert_eq!(envelope.kind(), EnvelopeKind::Notification);
    }

    #[test]
    fn test_string_id_parses_as_number() {
        assert_eq!(RequestId::String("12".into()).as_u64(), Some(12));
        assert_eq!(RequestId::String("abc".into()).as_u64(), None);
    }

    #[test]
    fn test_fingerprint_ignores_key_order() {
        let a = json!({ "b": 1, "a": { "y": [1, 2], "x": null } });
        let b = json!({ "a": { "x": null, "y": [1, 2] }, "b": 1 });
        assert_eq!(
            fingerprint(CapabilityKind::Resource, "file:///a", &a),
            fingerprint(CapabilityKind::Resource, "file:///a", &b)
        );
    }

    #[test]
    fn test_fingerprint_distinguishes_kind_name_and_params() {
        let p = json!({ "q": 1 });
        let base = fingerprint(CapabilityKind::Operation, "x", &p);
        assert_ne!(base, fingerprint(CapabilityKind::Resource, "x", &p));
        assert_ne!(base, fingerprint(CapabilityKind::Operation, "y", &p));
        assert_ne!(base, fingerprint(CapabilityKind::Operation, "x", &json!({ "q": 2 })));
    }

    #[test]
    fn test_null_and_empty_params_fingerprint_identically() {
        assert_eq!(
            fingerprint(CapabilityKind::Resource, "r", &serde_json::Value::Null),
            fingerprint(CapabilityKind::Resource, "r", &json!({}))
        );
    }
}
