// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Crate-wide error type.
//!
//! Only transport initialization is fatal: it surfaces as an `Err` from the
//! constructor. Everything that can go wrong on the reception path is
//! recovered locally (logged, counted, dropped) and never reaches here.

/// Errors surfaced by the public API.
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Construction
    // ========================================================================
    /// Transport endpoints could not be initialized (fatal at construction).
    InitFailed(String),
    /// Failed to bind a socket to an address.
    Bind(String),
    /// Underlying I/O error.
    Io(std::io::Error),

    // ========================================================================
    // Data
    // ========================================================================
    /// Message could not be encoded.
    Serialization(String),
    /// Payload bytes could not be decoded into the expected type.
    Deserialization(String),
    /// Handler expected one message type, the wire carried another.
    TypeMismatch {
        /// Type the handler was registered for.
        expected: String,
        /// Type tag carried by the message.
        received: String,
    },
    /// A wire message arrived with the wrong number of frames.
    MalformedFrame(&'static str),
    /// Topic name is empty or contains illegal characters.
    InvalidTopic(String),

    // ========================================================================
    // Service calls
    // ========================================================================
    /// No replier is registered for the requested service.
    NoReplier(String),
    /// The remote replier reported a failure.
    ServiceFailure,
    /// The pending request reached its deadline.
    Timeout,
    /// The pending request was cancelled before completing.
    Cancelled,

    // ========================================================================
    // Lifecycle
    // ========================================================================
    /// The discovery layer is not running; the operation had no effect.
    DiscoveryUnavailable,
    /// The core is shutting down; the operation failed fast.
    Shutdown,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InitFailed(msg) => write!(f, "Transport initialization failed: {}", msg),
            Error::Bind(msg) => write!(f, "Bind failed: {}", msg),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Serialization(msg) => write!(f, "Serialization failed: {}", msg),
            Error::Deserialization(msg) => write!(f, "Deserialization failed: {}", msg),
            Error::TypeMismatch { expected, received } => {
                write!(f, "Type mismatch: expected {}, received {}", expected, received)
            }
            Error::MalformedFrame(what) => write!(f, "Malformed wire message: {}", what),
            Error::InvalidTopic(topic) => write!(f, "Invalid topic name: {:?}", topic),
            Error::NoReplier(topic) => write!(f, "No replier for service {}", topic),
            Error::ServiceFailure => write!(f, "Service call failed on the remote side"),
            Error::Timeout => write!(f, "Request timed out"),
            Error::Cancelled => write!(f, "Request cancelled"),
            Error::DiscoveryUnavailable => write!(f, "Discovery is not available"),
            Error::Shutdown => write!(f, "Core is shutting down"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_mentions_types_on_mismatch() {
        let e = Error::TypeMismatch {
            expected: "string".into(),
            received: "bytes".into(),
        };
        let s = e.to_string();
        assert!(s.contains("string") && s.contains("bytes"));
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::AddrInUse, "busy");
        let e: Error = io.into();
        assert!(matches!(e, Error::Io(_)));
    }
}
