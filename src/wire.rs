//! Wire envelope carried inside every broker message
//!
//! The broker payload is a JSON object wrapping the opaque business payload
//! (base64) together with the publisher's tenant identity, so workers can
//! rebuild the tenant scope without the originating request.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::context::TenantContext;
use crate::error::{EventError, Result};

/// Header carrying the publisher-assigned message id
pub const MSG_ID_HEADER: &str = "Nats-Msg-Id";

/// JSON form of a published message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    /// Base64-encoded business payload
    pub payload: String,

    /// Tenant resource path
    #[serde(default)]
    pub resource_path: String,

    /// Acting user id, empty for system events
    #[serde(default)]
    pub user_id: String,

    /// Trace id of the publishing request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl WireMessage {
    /// Wrap a payload with the publisher's tenant identity
    pub fn new(tenant: &TenantContext, payload: &[u8]) -> Self {
        Self {
            payload: BASE64.encode(payload),
            resource_path: tenant.resource_path().to_string(),
            user_id: tenant.user_id().unwrap_or_default().to_string(),
            trace_id: tenant.trace_id().map(str::to_string),
        }
    }

    /// Serialize for the broker
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Parse a broker payload
    pub fn decode(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| EventError::Decode(format!("invalid wire message: {}", e)))
    }

    /// Decode the embedded business payload
    pub fn payload_bytes(&self) -> Result<Bytes> {
        BASE64
            .decode(self.payload.as_bytes())
            .map(Bytes::from)
            .map_err(|e| EventError::Decode(format!("invalid payload encoding: {}", e)))
    }

    /// Acting user id, `None` when empty
    pub fn acting_user(&self) -> Option<&str> {
        if self.user_id.is_empty() {
            None
        } else {
            Some(&self.user_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_message_carries_identity() {
        let tenant = TenantContext::new("-2147483648").with_user("user-1");
        let wire = WireMessage::new(&tenant, b"\x08\x01binary");

        let bytes = wire.encode().unwrap();
        let json = std::str::from_utf8(&bytes).unwrap();
        assert!(json.contains("\"resourcePath\":\"-2147483648\""));
        assert!(json.contains("\"userId\":\"user-1\""));
        assert!(!json.contains("traceId"));

        let parsed = WireMessage::decode(&bytes).unwrap();
        assert_eq!(parsed.payload_bytes().unwrap().as_ref(), b"\x08\x01binary");
        assert_eq!(parsed.acting_user(), Some("user-1"));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = WireMessage::decode(b"not json").unwrap_err();
        assert!(matches!(err, EventError::Decode(_)));
    }

    #[test]
    fn test_bad_payload_encoding() {
        let wire = WireMessage {
            payload: "***".to_string(),
            resource_path: "1".to_string(),
            user_id: String::new(),
            trace_id: None,
        };
        assert!(matches!(wire.payload_bytes(), Err(EventError::Decode(_))));
        assert_eq!(wire.acting_user(), None);
    }

    #[test]
    fn test_missing_identity_defaults() {
        let parsed = WireMessage::decode(br#"{"payload":"e30="}"#).unwrap();
        assert_eq!(parsed.resource_path, "");
        assert_eq!(parsed.payload_bytes().unwrap().as_ref(), b"{}");
    }
}
