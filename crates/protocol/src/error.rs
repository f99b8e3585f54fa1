//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Handshake errors
    /// Key exchange failed before a session could be established.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The nonce echoed by the device does not match the one sent.
    #[error("handshake failed: nonce mismatch")]
    NonceMismatch,

    /// No public key is stored or presented for the device.
    #[error("no public key found for device")]
    NoDeviceKey,

    // Cryptographic errors
    /// Encryption operation failed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Decryption operation failed.
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// Invalid or malformed public key material.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// An empty chunk was handed to the stream cipher.
    #[error("empty chunk passed to cipher transform")]
    EmptyChunk,

    // Frame errors
    /// Frame exceeds the 2-byte length prefix ceiling.
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Actual frame size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    // Packet errors
    /// Inbound bytes did not parse as a packet.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// A numbered packet arrived out of sequence.
    #[error("bad counter: expected {expected}, got {got}")]
    BadCounter {
        /// The receive counter the session expected.
        expected: u16,
        /// The message id actually carried by the packet.
        got: u16,
    },

    /// A token was issued while still correlated to an in-flight request.
    #[error("token already in use: {0}")]
    TokenInUse(u8),

    // Session errors
    /// Operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// The session is exclusively owned by another caller.
    #[error("session is owned by another flow")]
    OwnershipConflict,

    /// Connection was closed while an operation was outstanding.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// The device never declared the requested function or variable.
    #[error("device does not expose {kind} \"{name}\"")]
    UnknownCapability {
        /// Capability class ("function" or "variable").
        kind: &'static str,
        /// The undeclared name.
        name: String,
    },

    /// The device answered an operation with a failure code.
    #[error("{what} failed on device with code {code}")]
    DeviceError {
        /// The operation that failed.
        what: &'static str,
        /// The decimal code the device reported.
        code: String,
    },

    // Transfer errors
    /// Firmware transfer failed.
    #[error("transfer failed: {0}")]
    TransferFailed(String),

    // Key store errors
    /// Key material could not be loaded or persisted.
    #[error("key store error: {0}")]
    KeyStore(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

// Conversions from underlying crate errors

impl From<rsa::Error> for ProtocolError {
    fn from(err: rsa::Error) -> Self {
        ProtocolError::Decryption(err.to_string())
    }
}

impl From<rsa::pkcs8::Error> for ProtocolError {
    fn from(err: rsa::pkcs8::Error) -> Self {
        ProtocolError::InvalidPublicKey(err.to_string())
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::MalformedPacket(format!("bad description payload: {}", err))
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(err.to_string()),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => ProtocolError::ConnectionClosed(err.to_string()),
            _ => ProtocolError::TransferFailed(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_error_display() {
        let err = ProtocolError::Handshake("rsa decrypt failed".to_string());
        assert_eq!(err.to_string(), "handshake failed: rsa decrypt failed");
    }

    #[test]
    fn test_nonce_mismatch_display() {
        assert_eq!(
            ProtocolError::NonceMismatch.to_string(),
            "handshake failed: nonce mismatch"
        );
    }

    #[test]
    fn test_no_device_key_display() {
        assert_eq!(
            ProtocolError::NoDeviceKey.to_string(),
            "no public key found for device"
        );
    }

    #[test]
    fn test_frame_too_large_display() {
        let err = ProtocolError::FrameTooLarge {
            size: 100_000,
            max: 65_535,
        };
        assert_eq!(
            err.to_string(),
            "frame too large: 100000 bytes exceeds maximum of 65535 bytes"
        );
    }

    #[test]
    fn test_bad_counter_display() {
        let err = ProtocolError::BadCounter {
            expected: 5,
            got: 6,
        };
        assert_eq!(err.to_string(), "bad counter: expected 5, got 6");
    }

    #[test]
    fn test_token_in_use_display() {
        assert_eq!(
            ProtocolError::TokenInUse(17).to_string(),
            "token already in use: 17"
        );
    }

    #[test]
    fn test_unknown_capability_display() {
        let err = ProtocolError::UnknownCapability {
            kind: "function",
            name: "reboot".to_string(),
        };
        assert_eq!(err.to_string(), "device does not expose function \"reboot\"");
    }

    #[test]
    fn test_from_io_error_timeout() {
        let io_err = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        let protocol_err: ProtocolError = io_err.into();
        assert!(matches!(protocol_err, ProtocolError::Timeout(_)));
    }

    #[test]
    fn test_from_io_error_connection_closed() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let protocol_err: ProtocolError = io_err.into();
        assert!(matches!(protocol_err, ProtocolError::ConnectionClosed(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ProtocolError>();
    }
}
