//! Error types and result definitions for the rustmiio crate.
//! Includes the device error-code table and conversion from standard IO/JSON errors.

use thiserror::Error;

/// Represents all possible errors that can occur when talking to a miIO device.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MiioError {
    /// Standard IO error (socket send, file access, ...)
    #[error("IO error: {0}")]
    Io(String),

    /// JSON serialization or deserialization error
    #[error("JSON error: {0}")]
    Json(String),

    /// The datagram is not a valid miIO frame
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    /// Checksum or padding did not verify (wrong token or corrupt ciphertext)
    #[error("Decryption failed")]
    DecryptFailure,

    /// A data frame was requested while no token is set
    #[error("No token available to encode request")]
    NoToken,

    /// The token of the device is unknown
    #[error("{0}")]
    MissingToken(String),

    /// The device has not reported an identifier yet
    #[error("Device has no identifier yet, handshake needed")]
    NoIdentifier,

    /// No handshake reply arrived in time
    #[error("Could not connect to device, handshake timeout")]
    HandshakeTimeout,

    /// Every attempt of a call went unanswered
    #[error("Call to device timed out")]
    CallTimeout,

    /// Identification failed although a token was present
    #[error("{0}")]
    ConnectionFailure(String),

    /// The device answered with a JSON-RPC error
    #[error("{message}")]
    Remote { code: i64, message: String },

    /// A token string could not be decoded
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// Configuration could not be loaded or is inconsistent
    #[error("Configuration error: {0}")]
    Config(String),
}

/// A specialized Result type for miIO operations.
pub type Result<T> = std::result::Result<T, MiioError>;

impl From<std::io::Error> for MiioError {
    fn from(err: std::io::Error) -> Self {
        MiioError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for MiioError {
    fn from(err: serde_json::Error) -> Self {
        MiioError::Json(err.to_string())
    }
}

impl MiioError {
    /// Short, stable code for branching on an error kind.
    pub fn code(&self) -> &'static str {
        match self {
            MiioError::Io(_) => "io",
            MiioError::Json(_) => "json",
            MiioError::MalformedPacket(_) => "malformed-packet",
            MiioError::DecryptFailure => "decrypt-failure",
            MiioError::NoToken | MiioError::MissingToken(_) => "missing-token",
            MiioError::NoIdentifier => "no-identifier",
            MiioError::HandshakeTimeout | MiioError::CallTimeout => "timeout",
            MiioError::ConnectionFailure(_) => "connection-failure",
            MiioError::Remote { .. } => "remote",
            MiioError::InvalidToken(_) => "invalid-token",
            MiioError::Config(_) => "config",
        }
    }

    pub(crate) fn missing_token() -> Self {
        MiioError::MissingToken(
            "Could not connect to device, token needs to be specified".to_string(),
        )
    }

    /// Builds the error for a JSON-RPC `error` object returned by a device.
    ///
    /// Known codes are translated to readable messages, anything else keeps
    /// the message the device sent.
    pub fn remote(code: i64, message: &str, method: &str) -> Self {
        let message = match code {
            ERR_INVALID_ARG if message == "invalid_arg" => "Invalid argument".to_string(),
            ERR_PARAMS if message == "params error" => "Invalid argument".to_string(),
            ERR_METHOD_NOT_SUPPORTED => format!("Method `{}` is not supported", method),
            _ if message.is_empty() => code_description(code)
                .map(str::to_string)
                .unwrap_or_else(|| format!("Unknown error code: {}", code)),
            _ => message.to_string(),
        };
        MiioError::Remote { code, message }
    }
}

// miIO JSON-RPC error codes
define_error_codes! {
    ERR_INVALID_ARG = -5001 => "Invalid argument",
    ERR_PARAMS = -5005 => "Invalid parameters",
    ERR_METHOD_NOT_SUPPORTED = -10000 => "Method not supported",
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_are_translated() {
        let e = MiioError::remote(-5001, "invalid_arg", "set_power");
        assert_eq!(e.to_string(), "Invalid argument");

        let e = MiioError::remote(-5005, "params error", "set_bright");
        assert_eq!(e.to_string(), "Invalid argument");

        let e = MiioError::remote(-10000, "method not found", "get_fancy");
        assert_eq!(e.to_string(), "Method `get_fancy` is not supported");
    }

    #[test]
    fn unknown_codes_keep_device_message() {
        let e = MiioError::remote(-9999, "user ack timeout", "set_power");
        assert_eq!(e.to_string(), "user ack timeout");
        assert_eq!(e.code(), "remote");

        // -5001 with another message is passed through as well
        let e = MiioError::remote(-5001, "busy", "set_power");
        assert_eq!(e.to_string(), "busy");
    }

    #[test]
    fn timeouts_share_a_code() {
        assert_eq!(MiioError::HandshakeTimeout.code(), "timeout");
        assert_eq!(MiioError::CallTimeout.code(), "timeout");
        assert_eq!(MiioError::missing_token().code(), "missing-token");
    }
}
