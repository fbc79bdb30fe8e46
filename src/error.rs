//! # Error Types Module
//!
//! Centralized error handling for the coaching engine.
//! Each concern gets its own error enum with a human-readable `Display`, because
//! escalations leave the core as a status plus reason string rather than as
//! errors crossing component boundaries.
//!
//! ## Error Types
//! - `ConnectionError`: Bluetooth link failures, including the reconnect timeout
//! - `ScanError`: Bluetooth device scanning errors
//! - `ConfigError`: Configuration file I/O and parsing errors
//! - `StoreError`: Session persistence failures
//! - `CueError`: Audio cue playback failures (logged, never escalated)
//!
//! ## Recovery
//! - `PermissionDenied` and `ScanFailed` are surfaced, the user retries manually
//! - Transient link loss never becomes an error, it drives the backoff loop
//! - `ReconnectTimeout` is terminal for the session until an explicit restart

use std::fmt;

/// Errors that can occur during connection management
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionError {
    /// Failed to create Tokio runtime
    #[cfg_attr(not(feature = "ble"), allow(dead_code))]
    RuntimeCreation(String),
    /// Bluetooth adapter not found or not available
    NoAdapter,
    /// Connect permission was not granted
    #[cfg_attr(not(feature = "ble"), allow(dead_code))]
    PermissionDenied,
    /// Failed to connect to specific device
    #[cfg_attr(not(feature = "ble"), allow(dead_code))]
    DeviceConnection { device_id: String, reason: String },
    /// Device connected but does not expose the heart rate service
    ServiceMissing { device_id: String },
    /// Reconnect loop ran longer than the allowed window
    ReconnectTimeout { seconds: u64 },
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::RuntimeCreation(msg) => {
                write!(f, "Failed to create async runtime: {}", msg)
            }
            ConnectionError::NoAdapter => {
                write!(f, "No Bluetooth adapter found. Please ensure Bluetooth is enabled.")
            }
            ConnectionError::PermissionDenied => {
                write!(f, "Bluetooth connect permission missing")
            }
            ConnectionError::DeviceConnection { device_id, reason } => {
                write!(f, "Failed to connect to device {}: {}", device_id, reason)
            }
            ConnectionError::ServiceMissing { device_id } => {
                write!(f, "Device {} does not expose a heart rate service", device_id)
            }
            ConnectionError::ReconnectTimeout { seconds } => {
                write!(f, "Reconnect timeout ({}m)", seconds / 60)
            }
        }
    }
}

impl std::error::Error for ConnectionError {}

/// Errors that can occur during configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read config file
    ReadFailed(std::io::Error),
    /// Failed to write config file
    WriteFailed(std::io::Error),
    /// Failed to parse config file
    ParseFailed(toml::de::Error),
    /// Failed to serialize config
    SerializeFailed(toml::ser::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ReadFailed(e) => {
                write!(f, "Failed to read config file: {}", e)
            }
            ConfigError::WriteFailed(e) => {
                write!(f, "Failed to write config file: {}", e)
            }
            ConfigError::ParseFailed(e) => {
                write!(f, "Failed to parse config file: {}", e)
            }
            ConfigError::SerializeFailed(e) => {
                write!(f, "Failed to serialize config: {}", e)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::ReadFailed(e) => Some(e),
            ConfigError::WriteFailed(e) => Some(e),
            ConfigError::ParseFailed(e) => Some(e),
            ConfigError::SerializeFailed(e) => Some(e),
        }
    }
}

/// Errors that can occur during device scanning
#[derive(Debug, Clone, PartialEq)]
pub enum ScanError {
    /// No Bluetooth adapters available
    NoAdapters,
    /// Scan permission was not granted
    #[cfg_attr(not(feature = "ble"), allow(dead_code))]
    PermissionDenied,
    /// Scanning is rejected while a device is connected
    AlreadyConnected,
    /// Scan operation failed with a platform-reported code or message
    ScanFailed(String),
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanError::NoAdapters => {
                write!(f, "No Bluetooth adapters found")
            }
            ScanError::PermissionDenied => {
                write!(f, "Permission Missing")
            }
            ScanError::AlreadyConnected => {
                write!(f, "Already connected, scan ignored")
            }
            ScanError::ScanFailed(msg) => {
                write!(f, "Scan Failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ScanError {}

/// Errors raised by session persistence
#[derive(Debug)]
pub enum StoreError {
    /// Filesystem failure in a file-backed store
    Io(std::io::Error),
    /// Record could not be encoded or decoded
    Serialize(serde_json::Error),
    /// No session with this id exists
    UnknownSession(i64),
    /// The writer thread is gone and cannot take more work
    WriterUnavailable,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "Session store I/O failed: {}", e),
            StoreError::Serialize(e) => write!(f, "Failed to encode session data: {}", e),
            StoreError::UnknownSession(id) => write!(f, "Unknown session id {}", id),
            StoreError::WriterUnavailable => write!(f, "Session writer thread is not running"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Io(e) => Some(e),
            StoreError::Serialize(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialize(e)
    }
}

/// Errors from the audio cue sink
#[derive(Debug, Clone, PartialEq)]
pub enum CueError {
    /// Speech output is not available
    Unavailable(String),
}

impl fmt::Display for CueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CueError::Unavailable(msg) => write!(f, "Speech output unavailable: {}", msg),
        }
    }
}

impl std::error::Error for CueError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_display() {
        let err = ConnectionError::NoAdapter;
        assert!(err.to_string().contains("Bluetooth"));
    }

    #[test]
    fn test_reconnect_timeout_reason() {
        let err = ConnectionError::ReconnectTimeout { seconds: 120 };
        assert_eq!(err.to_string(), "Reconnect timeout (2m)");
    }

    #[test]
    fn test_config_error_chain() {
        use std::error::Error;
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = ConfigError::ReadFailed(io_err);
        assert!(err.source().is_some());
    }

    #[test]
    fn test_store_error_from_io() {
        use std::error::Error;
        let err: StoreError = std::io::Error::new(std::io::ErrorKind::Other, "disk full").into();
        assert!(err.to_string().contains("disk full"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_scan_failed_carries_code() {
        assert_eq!(ScanError::ScanFailed("2".into()).to_string(), "Scan Failed: 2");
    }
}
