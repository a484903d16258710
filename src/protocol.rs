//! Wire protocol for the trelay control channel.
//!
//! The control channel carries newline-delimited JSON records: the
//! registration handshake once per session, then [`ControlMessage`]s in both
//! directions. Byte payloads inside `data` messages travel as base64 strings.

use serde::{Deserialize, Serialize};

/// Initial request from a tunnel client to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationRequest {
    pub local_host: String,
    pub local_port: u16,
}

/// The relay's answer to a registration request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RegistrationResponse {
    /// Builds a success response carrying the assigned public port.
    pub fn granted(public_port: u16) -> Self {
        Self {
            success: true,
            public_port: Some(public_port),
            error: None,
        }
    }

    /// Builds a rejection response carrying a human-readable reason.
    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            public_port: None,
            error: Some(error.into()),
        }
    }
}

/// Messages exchanged on the control channel after the handshake.
///
/// Records with an unrecognized `type` tag decode to [`Unknown`] and are
/// ignored by both dispatchers; a missing required field is a decode error
/// and tears the control channel down.
///
/// [`Unknown`]: ControlMessage::Unknown
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    /// A new external user arrived on the public port (server to client).
    Connect { user_id: String },
    /// Raw tunnel bytes belonging to one user session (both directions).
    Data {
        user_id: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    /// Close one user session; without a `user_id` (client to server) it
    /// signals whole-tunnel shutdown.
    Disconnect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
    /// Keepalive (client to server).
    Ping,
    /// Keepalive response (server to client).
    Pong,
    /// Catch-all for record types this version does not know.
    #[serde(other)]
    Unknown,
}

/// Serde adapter encoding byte blobs as standard padded base64 strings.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_request_field_names() {
        let req = RegistrationRequest {
            local_host: "localhost".to_string(),
            local_port: 3000,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"local_host":"localhost","local_port":3000}"#);
    }

    #[test]
    fn registration_response_success_omits_error() {
        let json = serde_json::to_string(&RegistrationResponse::granted(10000)).unwrap();
        assert_eq!(json, r#"{"success":true,"public_port":10000}"#);
    }

    #[test]
    fn registration_response_rejection_omits_port() {
        let json =
            serde_json::to_string(&RegistrationResponse::rejected("no available ports")).unwrap();
        assert_eq!(json, r#"{"success":false,"error":"no available ports"}"#);
    }

    #[test]
    fn ping_pong_encoding() {
        assert_eq!(
            serde_json::to_string(&ControlMessage::Ping).unwrap(),
            r#"{"type":"ping"}"#
        );
        assert_eq!(
            serde_json::to_string(&ControlMessage::Pong).unwrap(),
            r#"{"type":"pong"}"#
        );
    }

    #[test]
    fn connect_roundtrip() {
        let msg = ControlMessage::Connect {
            user_id: "127.0.0.1:50000-123456789".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(
            json,
            r#"{"type":"connect","user_id":"127.0.0.1:50000-123456789"}"#
        );
        assert_eq!(serde_json::from_str::<ControlMessage>(&json).unwrap(), msg);
    }

    #[test]
    fn data_payload_is_base64() {
        let msg = ControlMessage::Data {
            user_id: "u1".to_string(),
            data: b"hello".to_vec(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"data","user_id":"u1","data":"aGVsbG8="}"#);
    }

    #[test]
    fn data_roundtrips_raw_binary() {
        let payload: Vec<u8> = (0u8..=255).collect();
        let msg = ControlMessage::Data {
            user_id: "u1".to_string(),
            data: payload.clone(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        match serde_json::from_str::<ControlMessage>(&json).unwrap() {
            ControlMessage::Data { data, .. } => assert_eq!(data, payload),
            other => panic!("expected data message, got {:?}", other),
        }
    }

    #[test]
    fn disconnect_without_user_id() {
        let msg = ControlMessage::Disconnect { user_id: None };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"disconnect"}"#);
        assert_eq!(serde_json::from_str::<ControlMessage>(&json).unwrap(), msg);
    }

    #[test]
    fn disconnect_with_user_id() {
        let decoded: ControlMessage =
            serde_json::from_str(r#"{"type":"disconnect","user_id":"u7"}"#).unwrap();
        assert_eq!(
            decoded,
            ControlMessage::Disconnect {
                user_id: Some("u7".to_string())
            }
        );
    }

    #[test]
    fn unknown_type_is_tolerated() {
        let decoded: ControlMessage =
            serde_json::from_str(r#"{"type":"resize","user_id":"u1"}"#).unwrap();
        assert_eq!(decoded, ControlMessage::Unknown);
    }

    #[test]
    fn missing_required_field_is_an_error() {
        assert!(serde_json::from_str::<ControlMessage>(r#"{"type":"connect"}"#).is_err());
        assert!(serde_json::from_str::<ControlMessage>(r#"{"type":"data","user_id":"u1"}"#).is_err());
    }

    #[test]
    fn invalid_base64_is_an_error() {
        let result =
            serde_json::from_str::<ControlMessage>(r#"{"type":"data","user_id":"u1","data":"!!"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn empty_data_payload_roundtrip() {
        let msg = ControlMessage::Data {
            user_id: "u1".to_string(),
            data: Vec::new(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"data","user_id":"u1","data":""}"#);
        assert_eq!(serde_json::from_str::<ControlMessage>(&json).unwrap(), msg);
    }
}
