//! Rust struct definitions that ser/de to/from JSON-RPC wire messages.
//!
//! The envelope fields (`jsonrpc`, `method`, the error object) are parsed
//! into typed form; everything whose shape belongs to the application
//! (`params`, `result`, `error.data`, `id`) is carried as raw JSON.  That
//! keeps number formatting intact, so a peer that sends `"id": 1.50` gets
//! exactly `1.50` echoed back, and avoids re-encoding payloads the core
//! never looks inside.
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::value::{RawValue, to_raw_value};

use crate::error::{ErrorCode, Result, RpcError};
pub use serde_json::Value as JsonValue;

/// The version marker required on JSON-RPC 2.0 messages.
pub const VERSION: &str = "2.0";

/// Deserialize a field as raw JSON, keeping an explicit `null` as the raw
/// token instead of collapsing it into `None`.
///
/// `Option<Box<RawValue>>` on its own treats `"id": null` the same as a
/// missing `id`, but on the wire those are different things: the first is a
/// call whose id is the JSON value null, the second is a notification.
fn raw_present<'de, D>(deserializer: D) -> std::result::Result<Option<Box<RawValue>>, D::Error>
where
    D: Deserializer<'de>,
{
    Box::<RawValue>::deserialize(deserializer).map(Some)
}

/// A JSON-RPC request or notification as it appears on the wire.
///
/// A request without an `id` field is a notification.  `method` defaults to
/// the empty string when missing so that shape problems are reported per
/// request rather than poisoning a whole batch.  Unknown fields are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    #[serde(
        default,
        deserialize_with = "raw_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<Box<RawValue>>,
    #[serde(default)]
    pub method: String,
    #[serde(
        default,
        deserialize_with = "raw_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub params: Option<Box<RawValue>>,
}

impl Request {
    /// Create an outbound request (or, with `id` `None`, a notification).
    pub fn new(
        id: Option<Box<RawValue>>,
        method: impl Into<String>,
        params: Option<Box<RawValue>>,
    ) -> Self {
        Self {
            jsonrpc: Some(VERSION.to_string()),
            id,
            method: method.into(),
            params,
        }
    }

    /// A request with no `id` is a notification and must not be answered.
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Wire text of the request id, if present.
    pub fn id_text(&self) -> Option<&str> {
        self.id.as_deref().map(RawValue::get)
    }
}

/// A JSON-RPC response as it appears on the wire.
///
/// Exactly one of `result` and `error` is set by the constructors.  The `id`
/// echoes the request's id and serializes as JSON `null` when the id could
/// not be recovered (parse and batch-shape failures).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    #[serde(default, deserialize_with = "raw_present")]
    pub id: Option<Box<RawValue>>,
    #[serde(
        default,
        deserialize_with = "raw_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Box<RawValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl Response {
    /// Create a successful response.
    pub fn success(id: Option<Box<RawValue>>, result: Box<RawValue>) -> Self {
        Self {
            jsonrpc: Some(VERSION.to_string()),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response.
    pub fn error(id: Option<Box<RawValue>>, error: ErrorObject) -> Self {
        Self {
            jsonrpc: Some(VERSION.to_string()),
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Wire text of the response id, if present.
    pub fn id_text(&self) -> Option<&str> {
        self.id.as_deref().map(RawValue::get)
    }

    /// Decode the result into a concrete type.  An absent result decodes as
    /// JSON `null`.
    pub fn result_as<T: DeserializeOwned>(&self) -> Result<T> {
        let text = self.result.as_deref().map_or("null", RawValue::get);
        serde_json::from_str(text).map_err(|e| RpcError::DeserializeResult {
            source: e,
            type_name: std::any::type_name::<T>(),
        })
    }
}

/// Wire error object: `{code, message, data?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: ErrorCode,
    pub message: String,
    #[serde(
        default,
        deserialize_with = "raw_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub data: Option<Box<RawValue>>,
}

impl ErrorObject {
    pub fn new(
        code: ErrorCode,
        message: impl Into<String>,
        data: impl Into<Option<Box<RawValue>>>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            data: data.into(),
        }
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ParseError, message, None)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message, None)
    }

    pub fn method_not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::MethodNotFound, message, None)
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidParams, message, None)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message, None)
    }
}

/// Serialize a value into raw JSON suitable for the `params` field of a
/// request.
pub fn to_params<T: Serialize>(value: &T) -> Result<Option<Box<RawValue>>> {
    to_raw_value(value).map(Some).map_err(|e| RpcError::Serialize {
        source: e,
        type_name: std::any::type_name::<T>(),
    })
}

/// A frame whose first non-whitespace byte is `[` is a batch; anything else
/// is decoded as a singleton.
pub(crate) fn is_batch_frame(frame: &[u8]) -> bool {
    frame
        .iter()
        .copied()
        .find(|b| !matches!(b, b' ' | b'\t' | b'\n' | b'\r'))
        == Some(b'[')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn raw(text: &str) -> Box<RawValue> {
        RawValue::from_string(text.to_string()).unwrap()
    }

    #[test]
    fn test_request_serialization() {
        // Known-good JSON-RPC request string in the format defined by the spec
        let known_good_json = r#"{"jsonrpc":"2.0","id":1,"method":"test_method","params":[1,"test",true]}"#;
        let known_good_value: Value = serde_json::from_str(known_good_json).unwrap();

        let our_request = Request::new(Some(raw("1")), "test_method", Some(raw(r#"[1,"test",true]"#)));
        let our_value: Value = serde_json::to_value(&our_request).unwrap();
        assert_eq!(known_good_value, our_value);

        let deserialized: Request = serde_json::from_str(known_good_json).unwrap();
        assert_eq!(deserialized.method, "test_method");
        assert_eq!(deserialized.id_text(), Some("1"));
        assert_eq!(deserialized.jsonrpc.as_deref(), Some("2.0"));
        assert!(!deserialized.is_notification());
    }

    #[test]
    fn test_notification_has_no_id() {
        let json = r#"{"jsonrpc":"2.0","method":"update","params":[1,2,3]}"#;
        let request: Request = serde_json::from_str(json).unwrap();
        assert!(request.is_notification());

        // A literal null id is *not* a notification; the raw token is preserved.
        let json = r#"{"jsonrpc":"2.0","id":null,"method":"update"}"#;
        let request: Request = serde_json::from_str(json).unwrap();
        assert!(!request.is_notification());
        assert_eq!(request.id_text(), Some("null"));
    }

    #[test]
    fn test_id_fidelity() {
        for id in ["1", "\"x\"", "null", "1.50", "9007199254740993"] {
            let json = format!(r#"{{"jsonrpc":"2.0","id":{id},"method":"m"}}"#);
            let request: Request = serde_json::from_str(&json).unwrap();
            assert_eq!(request.id_text(), Some(id));

            // The echo in a response keeps the exact bytes.
            let response = Response::success(request.id.clone(), raw("true"));
            let text = serde_json::to_string(&response).unwrap();
            assert!(text.contains(&format!("\"id\":{id}")), "{text}");
        }
    }

    #[test]
    fn test_missing_method_decodes_as_empty() {
        let json = r#"{"jsonrpc":"2.0","id":3}"#;
        let request: Request = serde_json::from_str(json).unwrap();
        assert_eq!(request.method, "");
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let json = r#"{"jsonrpc":"2.0","id":1,"method":"m","surprise":{"a":1}}"#;
        let request: Request = serde_json::from_str(json).unwrap();
        assert_eq!(request.method, "m");
    }

    #[test]
    fn test_success_response_serialization() {
        let known_good_json = r#"{"jsonrpc":"2.0","id":42,"result":{"status":"success"}}"#;
        let known_good_value: Value = serde_json::from_str(known_good_json).unwrap();

        let our_response = Response::success(Some(raw("42")), raw(r#"{"status":"success"}"#));
        let our_value: Value = serde_json::to_value(&our_response).unwrap();
        assert_eq!(known_good_value, our_value);

        let deserialized: Response = serde_json::from_str(known_good_json).unwrap();
        assert!(!deserialized.is_error());
        assert_eq!(deserialized.result_as::<Value>().unwrap(), json!({"status": "success"}));
    }

    #[test]
    fn test_error_response_serialization() {
        let known_good_json = concat!(
            r#"{"jsonrpc":"2.0","id":"error-id","error":{"code":-32600,"#,
            r#""message":"Invalid request","data":{"details":"error details"}}}"#
        );
        let known_good_value: Value = serde_json::from_str(known_good_json).unwrap();

        let our_response = Response::error(
            Some(raw("\"error-id\"")),
            ErrorObject::new(
                ErrorCode::InvalidRequest,
                "Invalid request",
                Some(raw(r#"{"details":"error details"}"#)),
            ),
        );
        let our_value: Value = serde_json::to_value(&our_response).unwrap();
        assert_eq!(known_good_value, our_value);

        let deserialized: Response = serde_json::from_str(known_good_json).unwrap();
        assert_eq!(deserialized.error.unwrap().code, ErrorCode::InvalidRequest);
    }

    #[test]
    fn test_null_id_serializes_as_null() {
        let response = Response::error(None, ErrorObject::parse_error("invalid JSON request message"));
        let value: Value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["id"], Value::Null);
    }

    #[test]
    fn test_html_is_not_escaped() {
        let response = Response::success(Some(raw("1")), raw(r#""<a href=\"x\">&</a>""#));
        let text = serde_json::to_string(&response).unwrap();
        assert!(text.contains("<a href="), "{text}");
        assert!(text.contains('&'), "{text}");
    }

    #[test]
    fn test_batch_detection() {
        assert!(is_batch_frame(b"[{}]"));
        assert!(is_batch_frame(b"  \r\n\t[1]"));
        assert!(!is_batch_frame(b"{\"a\":[]}"));
        assert!(!is_batch_frame(b""));
        assert!(!is_batch_frame(b"   "));
    }

    #[test]
    fn test_to_params() {
        let params = to_params(&json!([2, 3])).unwrap().unwrap();
        assert_eq!(params.get(), "[2,3]");
    }
}
