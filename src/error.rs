use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::channel::FrameError;
use crate::types::ErrorObject;

pub type Result<T, E = RpcError> = std::result::Result<T, E>;

/// The stable JSON-RPC 2.0 error codes, plus pass-through for anything else.
///
/// Application codes outside the reserved range `[-32768, -32000]` travel
/// verbatim as [`ErrorCode::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// -32700: the message was not parseable as JSON.
    ParseError,
    /// -32600: the wire shape, id, or method of the request was invalid.
    InvalidRequest,
    /// -32601: the assigner had no handler for the method.
    MethodNotFound,
    /// -32602: the handler rejected the shape of the parameters.
    InvalidParams,
    /// -32603: unclassified handler failure.
    InternalError,
    /// Any other code, passed through unchanged.
    Other(i32),
}

impl ErrorCode {
    /// The numeric code as it appears on the wire.
    pub const fn code(self) -> i32 {
        match self {
            ErrorCode::ParseError => -32700,
            ErrorCode::InvalidRequest => -32600,
            ErrorCode::MethodNotFound => -32601,
            ErrorCode::InvalidParams => -32602,
            ErrorCode::InternalError => -32603,
            ErrorCode::Other(code) => code,
        }
    }

    /// Canonical message for the code.
    pub const fn message(self) -> &'static str {
        match self {
            ErrorCode::ParseError => "Parse error",
            ErrorCode::InvalidRequest => "Invalid request",
            ErrorCode::MethodNotFound => "Method not found",
            ErrorCode::InvalidParams => "Invalid params",
            ErrorCode::InternalError => "Internal error",
            ErrorCode::Other(_) => "Server error",
        }
    }
}

impl From<i32> for ErrorCode {
    fn from(code: i32) -> Self {
        match code {
            -32700 => ErrorCode::ParseError,
            -32600 => ErrorCode::InvalidRequest,
            -32601 => ErrorCode::MethodNotFound,
            -32602 => ErrorCode::InvalidParams,
            -32603 => ErrorCode::InternalError,
            other => ErrorCode::Other(other),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message(), self.code())
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i32(self.code())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        i32::deserialize(deserializer).map(ErrorCode::from)
    }
}

/// Errors surfaced by the client and server endpoints.
///
/// Wire-level error *responses* are not represented here; those are carried
/// inside [`crate::Response`] as an [`ErrorObject`]. This enum is for
/// failures of the endpoint itself: the framing layer, the JSON codec, and
/// the connection lifecycle.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Frame-level failure on the byte stream. Always tears the connection down.
    #[error("channel framing error")]
    Frame {
        #[from]
        source: FrameError,
    },

    #[error("error parsing JSON message")]
    ParseJson { source: serde_json::Error },

    #[error("error serializing {type_name} to JSON")]
    Serialize {
        source: serde_json::Error,
        type_name: &'static str,
    },

    #[error("error deserializing result into {type_name}")]
    DeserializeResult {
        source: serde_json::Error,
        type_name: &'static str,
    },

    /// A call completed with a JSON-RPC error payload. Produced only by the
    /// typed call helpers; the raw call surface hands back the whole response.
    #[error("the method '{method}' failed with error {}: {}", error.code.code(), error.message)]
    Method { method: String, error: ErrorObject },

    #[error("server is already started")]
    AlreadyStarted,

    /// The sentinel recorded when [`crate::Server::stop`] shuts a healthy
    /// connection down.
    #[error("the server was stopped")]
    ServerStopped,

    #[error("connection closed before a response was received")]
    ConnectionClosed,

    #[error("unknown channel framing {0:?}")]
    UnknownFraming(String),
}

/// Error returned by a method handler.
///
/// The dispatcher turns each variant into a wire error object differently: a
/// structured error carries its own code, message, and data; a bare code gets
/// the code's canonical message; anything else becomes an internal error
/// quoting the display form.
#[derive(Debug, Clone)]
pub enum HandlerError {
    /// A structured JSON-RPC error with explicit code, message, and data.
    Error(ErrorObject),
    /// A bare error code.
    Code(ErrorCode),
    /// Any other failure.
    Other(String),
}

impl HandlerError {
    pub(crate) fn into_error_object(self) -> ErrorObject {
        match self {
            HandlerError::Error(error) => error,
            HandlerError::Code(code) => ErrorObject::new(code, code.message(), None),
            HandlerError::Other(message) => ErrorObject::new(
                ErrorCode::InternalError,
                format!("internal error: {message}"),
                None,
            ),
        }
    }
}

impl From<ErrorObject> for HandlerError {
    fn from(error: ErrorObject) -> Self {
        HandlerError::Error(error)
    }
}

impl From<ErrorCode> for HandlerError {
    fn from(code: ErrorCode) -> Self {
        HandlerError::Code(code)
    }
}

impl From<i32> for HandlerError {
    fn from(code: i32) -> Self {
        HandlerError::Code(code.into())
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerError::Error(error) => write!(f, "{} ({})", error.message, error.code.code()),
            HandlerError::Code(code) => write!(f, "{code}"),
            HandlerError::Other(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for HandlerError {}

/// Try to make something useful from a panic payload for error reporting.
///
/// Only `String` and `&'static str` payloads carry a message; anything else
/// is reported by type name.
pub(crate) fn panic_to_string(err: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = err.downcast_ref::<&'static str>() {
        s.to_string()
    } else if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else {
        format!("panic of type {}", std::any::type_name_of_val(&*err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(ErrorCode::ParseError.code(), -32700);
        assert_eq!(ErrorCode::InvalidRequest.code(), -32600);
        assert_eq!(ErrorCode::MethodNotFound.code(), -32601);
        assert_eq!(ErrorCode::InvalidParams.code(), -32602);
        assert_eq!(ErrorCode::InternalError.code(), -32603);
        assert_eq!(ErrorCode::Other(-32000).code(), -32000);

        assert_eq!(ErrorCode::from(-32601), ErrorCode::MethodNotFound);
        assert_eq!(ErrorCode::from(1234), ErrorCode::Other(1234));
    }

    #[test]
    fn test_error_code_wire_form() {
        let json = serde_json::to_string(&ErrorCode::MethodNotFound).unwrap();
        assert_eq!(json, "-32601");

        let code: ErrorCode = serde_json::from_str("-32700").unwrap();
        assert_eq!(code, ErrorCode::ParseError);

        let code: ErrorCode = serde_json::from_str("42").unwrap();
        assert_eq!(code, ErrorCode::Other(42));
    }

    #[test]
    fn test_handler_error_mapping() {
        let structured = HandlerError::Error(ErrorObject::new(
            ErrorCode::Other(-32000),
            "too busy",
            None,
        ));
        let obj = structured.into_error_object();
        assert_eq!(obj.code, ErrorCode::Other(-32000));
        assert_eq!(obj.message, "too busy");

        let bare = HandlerError::from(ErrorCode::InvalidParams);
        let obj = bare.into_error_object();
        assert_eq!(obj.code, ErrorCode::InvalidParams);
        assert_eq!(obj.message, "Invalid params");

        let other = HandlerError::Other("the disk caught fire".to_string());
        let obj = other.into_error_object();
        assert_eq!(obj.code, ErrorCode::InternalError);
        assert_eq!(obj.message, "internal error: the disk caught fire");
    }

    #[test]
    fn test_panic_to_string() {
        assert_eq!(panic_to_string(Box::new("static str")), "static str");
        assert_eq!(panic_to_string(Box::new("owned".to_string())), "owned");
        assert!(panic_to_string(Box::new(42u32)).contains("u32"));
    }
}
