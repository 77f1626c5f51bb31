use std::time::Duration;

use thiserror::Error;

/// Why a connection attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectErrorKind {
    /// Dialling or the handshake did not finish in time.
    Timeout,
    /// Nothing is listening at the address.
    Refused,
    /// The TLS session could not be established.
    Tls,
    /// The server answered the handshake with a failure.
    HandshakeRejected,
    /// Any other transport failure while connecting.
    Io,
}

impl std::fmt::Display for ConnectErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectErrorKind::Timeout => write!(f, "timeout"),
            ConnectErrorKind::Refused => write!(f, "refused"),
            ConnectErrorKind::Tls => write!(f, "tls"),
            ConnectErrorKind::HandshakeRejected => write!(f, "handshake rejected"),
            ConnectErrorKind::Io => write!(f, "io"),
        }
    }
}

/// Wire framing failures. Any of these leaves the connection unusable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Declared message length {declared} does not match {actual} available bytes")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Unknown opcode {0}")]
    UnknownOpcode(u32),

    #[error("Malformed section: {0}")]
    MalformedSection(String),

    #[error("Unknown required bit set in flags {0:#010x}")]
    InvalidFlags(u32),

    #[error("Checksum mismatch: expected {expected:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { expected: u32, computed: u32 },

    #[error("Message of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },

    #[error("Unsupported compressor id {0}")]
    UnknownCompressor(u8),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Document codec error: {0}")]
    Document(String),
}

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Failed to connect to {address} ({kind}): {message}")]
    Connect {
        address: String,
        kind: ConnectErrorKind,
        message: String,
    },

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Connection {connection_id} lost: {reason}")]
    ConnectionLost { connection_id: u64, reason: String },

    #[error("Connection pool exhausted after waiting {waited:?}")]
    PoolExhausted { waited: Duration },

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Command failed with code {code} ({code_name}): {message}")]
    Command {
        code: i32,
        code_name: String,
        message: String,
    },

    #[error("Invalid reply: {0}")]
    InvalidReply(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type DriverResult<T> = Result<T, DriverError>;

impl DriverError {
    pub(crate) fn connect(
        address: impl ToString,
        kind: ConnectErrorKind,
        message: impl ToString,
    ) -> Self {
        DriverError::Connect {
            address: address.to_string(),
            kind,
            message: message.to_string(),
        }
    }

    /// The connect failure kind, when this is a connection attempt failure.
    pub fn connect_kind(&self) -> Option<ConnectErrorKind> {
        match self {
            DriverError::Connect { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, DriverError::Timeout { .. })
    }

    pub fn is_connection_lost(&self) -> bool {
        matches!(self, DriverError::ConnectionLost { .. })
    }

    /// Errors after which the connection that produced them must not be reused.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self,
            DriverError::ConnectionLost { .. } | DriverError::Frame(_) | DriverError::Io(_)
        )
    }
}

impl From<bson::ser::Error> for FrameError {
    fn from(err: bson::ser::Error) -> Self {
        FrameError::Document(err.to_string())
    }
}

impl From<bson::de::Error> for FrameError {
    fn from(err: bson::de::Error) -> Self {
        FrameError::Document(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = DriverError::connect("localhost:1", ConnectErrorKind::Refused, "no listener");
        assert_eq!(
            err.to_string(),
            "Failed to connect to localhost:1 (refused): no listener"
        );

        let err = DriverError::Frame(FrameError::UnknownOpcode(2004));
        assert_eq!(err.to_string(), "Frame error: Unknown opcode 2004");

        let err = DriverError::ConnectionLost {
            connection_id: 3,
            reason: "peer closed".to_string(),
        };
        assert_eq!(err.to_string(), "Connection 3 lost: peer closed");

        let err = DriverError::Command {
            code: 26,
            code_name: "NamespaceNotFound".to_string(),
            message: "ns not found".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Command failed with code 26 (NamespaceNotFound): ns not found"
        );
    }

    #[test]
    fn test_error_classification() {
        let err = DriverError::connect("a:1", ConnectErrorKind::Timeout, "slow");
        assert_eq!(err.connect_kind(), Some(ConnectErrorKind::Timeout));
        assert!(!err.is_timeout());

        let err = DriverError::Timeout {
            operation: "checkout",
            after: Duration::from_millis(5),
        };
        assert!(err.is_timeout());
        assert!(!err.is_fatal_to_connection());

        let err = DriverError::Frame(FrameError::InvalidFlags(1 << 5));
        assert!(err.is_fatal_to_connection());
        assert!(DriverError::PoolClosed.connect_kind().is_none());
    }
}
