// src/io/error.rs
//
// Typed errors for the transport layer. Every variant carries the endpoint
// string (device path or tcp:// address) it relates to.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IoError {
    /// Backend could not be created (device open, configure, resolve)
    #[error("{device}: unavailable: {reason}")]
    Unavailable { device: String, reason: String },

    /// Serial write buffer has no room for the request
    #[error("{device}: write buffer full ({requested} bytes requested, {available} available)")]
    BufferFull {
        device: String,
        requested: usize,
        available: usize,
    },

    /// TCP write attempted while not connected
    #[error("{device}: not connected")]
    NotConnected { device: String },

    /// Descriptor close failed during cleanup; the handle is released anyway
    #[error("{device}: close failed: {source}")]
    CloseFailed {
        device: String,
        #[source]
        source: std::io::Error,
    },

    /// Fatal I/O error
    #[error("{device}: {op}: {source}")]
    Io {
        device: String,
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// Settings could not be read or parsed
    #[error("config: {0}")]
    Config(String),
}

impl IoError {
    pub fn unavailable(device: &str, reason: impl Into<String>) -> Self {
        IoError::Unavailable {
            device: device.to_string(),
            reason: reason.into(),
        }
    }

    pub fn not_connected(device: &str) -> Self {
        IoError::NotConnected {
            device: device.to_string(),
        }
    }

    pub fn io(device: &str, op: &'static str, source: std::io::Error) -> Self {
        IoError::Io {
            device: device.to_string(),
            op,
            source,
        }
    }
}

impl From<IoError> for String {
    fn from(e: IoError) -> Self {
        e.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_device() {
        let e = IoError::unavailable("/dev/ttyUSB0", "no such file");
        assert_eq!(e.to_string(), "/dev/ttyUSB0: unavailable: no such file");

        let e = IoError::BufferFull {
            device: "/dev/ttyS1".into(),
            requested: 10,
            available: 4,
        };
        assert!(e.to_string().contains("10 bytes requested, 4 available"));
    }

    #[test]
    fn test_into_string() {
        let s: String = IoError::not_connected("tcp://radio:4000").into();
        assert_eq!(s, "tcp://radio:4000: not connected");
    }
}
