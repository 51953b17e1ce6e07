//! Error types and result definitions for the tuya-vacuum crate.
//! Includes Tuya-specific error codes and conversion from standard IO/JSON errors.

use thiserror::Error;

/// Represents all possible errors that can occur when talking to a vacuum.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TuyaError {
    /// Standard IO error (network, socket shutdown, etc.)
    #[error("IO error: {0}")]
    Io(String),

    /// JSON serialization or deserialization error
    #[error("JSON error: {0}")]
    Json(String),

    /// TCP connection could not be established
    #[error("Socket connection failed")]
    ConnectionFailed,

    /// The session dropped while a request was in flight
    #[error("Connection lost")]
    ConnectionLost,

    /// The frame did not start with the expected prefix magic
    #[error("Invalid header")]
    InvalidHeader,

    /// The frame was structurally malformed (length, suffix, payload layout)
    #[error("Decode error: {0}")]
    DecodeError(String),

    /// CRC check failed for the received frame
    #[error("CRC mismatch")]
    CrcMismatch,

    /// Failed to decrypt a payload (usually a wrong local key)
    #[error("Decryption failed")]
    DecryptionFailed,

    /// Failed to encrypt a payload for the device
    #[error("Encryption failed")]
    EncryptionFailed,

    /// Protocol 3.1 MD5 signature did not match the payload
    #[error("Signature mismatch")]
    SignatureMismatch,

    /// Request timed out
    #[error("Timeout waiting for device")]
    Timeout,

    /// The device answered with a non-zero return code
    #[error("Device rejected command (code {0})")]
    DeviceRejected(u32),

    /// Device is currently unreachable or disconnected
    #[error("Device offline")]
    Offline,

    /// The controller was torn down or the session was recycled
    #[error("Request cancelled")]
    Cancelled,

    /// Persistent decryption failures: wrong local key or protocol version
    #[error("Check device key or version (Error 914)")]
    KeyOrVersionError,

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The logical command has no entry in the data-point mapping
    #[error("Command '{0}' is not supported by this device")]
    UnsupportedCommand(String),

    /// The value is not one of the configured choices
    #[error("Value '{0}' is out of range")]
    UnsupportedValue(String),
}

/// A specialized Result type for Tuya operations.
pub type Result<T> = std::result::Result<T, TuyaError>;

impl From<std::io::Error> for TuyaError {
    fn from(err: std::io::Error) -> Self {
        TuyaError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for TuyaError {
    fn from(err: serde_json::Error) -> Self {
        TuyaError::Json(err.to_string())
    }
}

impl From<std::convert::Infallible> for TuyaError {
    fn from(err: std::convert::Infallible) -> Self {
        match err {}
    }
}

impl TuyaError {
    pub fn code(&self) -> u32 {
        match self {
            TuyaError::Io(_) => ERR_CONNECT,
            TuyaError::Json(_) => ERR_JSON,
            TuyaError::ConnectionFailed => ERR_CONNECT,
            TuyaError::ConnectionLost => ERR_OFFLINE,
            TuyaError::InvalidHeader => ERR_PAYLOAD,
            TuyaError::DecodeError(_) => ERR_PAYLOAD,
            TuyaError::CrcMismatch => ERR_PAYLOAD,
            TuyaError::DecryptionFailed => ERR_KEY_OR_VER,
            TuyaError::EncryptionFailed => ERR_KEY_OR_VER,
            TuyaError::SignatureMismatch => ERR_KEY_OR_VER,
            TuyaError::Timeout => ERR_TIMEOUT,
            TuyaError::DeviceRejected(_) => ERR_STATE,
            TuyaError::Offline => ERR_OFFLINE,
            TuyaError::Cancelled => ERR_CANCELLED,
            TuyaError::KeyOrVersionError => ERR_KEY_OR_VER,
            TuyaError::InvalidConfig(_) => ERR_PARAMS,
            TuyaError::UnsupportedCommand(_) => ERR_FUNCTION,
            TuyaError::UnsupportedValue(_) => ERR_RANGE,
        }
    }

    /// Errors that point at the local key rather than at transient corruption.
    pub fn is_crypto_error(&self) -> bool {
        matches!(
            self,
            TuyaError::DecryptionFailed | TuyaError::SignatureMismatch
        )
    }
}

// TinyTuya Error Response Codes
define_error_codes! {
    ERR_JSON = 900 => "Invalid JSON Response from Device",
    ERR_CONNECT = 901 => "Network Error: Unable to Connect",
    ERR_TIMEOUT = 902 => "Timeout Waiting for Device",
    ERR_RANGE = 903 => "Specified Value Out of Range",
    ERR_PAYLOAD = 904 => "Unexpected Payload from Device",
    ERR_OFFLINE = 905 => "Network Error: Device Unreachable",
    ERR_STATE = 906 => "Device in Unknown State",
    ERR_FUNCTION = 907 => "Function Not Supported by Device",
    ERR_PARAMS = 912 => "Missing Function Parameters",
    ERR_KEY_OR_VER = 914 => "Check device key or version",
    ERR_CANCELLED = 916 => "Request Cancelled",
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(TuyaError::Timeout.code(), ERR_TIMEOUT);
        assert_eq!(TuyaError::KeyOrVersionError.code(), ERR_KEY_OR_VER);
        assert_eq!(TuyaError::SignatureMismatch.code(), ERR_KEY_OR_VER);
        assert_eq!(TuyaError::DeviceRejected(1).code(), ERR_STATE);
        assert_eq!(TuyaError::Cancelled.code(), ERR_CANCELLED);
        assert_eq!(get_error_message(ERR_TIMEOUT), "Timeout Waiting for Device");
        assert_eq!(get_error_message(12345), "Unknown Error");
    }

    #[test]
    fn test_crypto_error_classification() {
        assert!(TuyaError::DecryptionFailed.is_crypto_error());
        assert!(TuyaError::SignatureMismatch.is_crypto_error());
        assert!(!TuyaError::CrcMismatch.is_crypto_error());
        assert!(!TuyaError::DeviceRejected(1).is_crypto_error());
    }
}
