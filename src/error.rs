//! Error types for containment operations

use std::fmt;

use thiserror::Error;

/// Result type for containment operations
pub type Result<T> = std::result::Result<T, ContainmentError>;

/// The OS reported that the supplied buffer was too small for the answer.
pub const ERROR_MORE_DATA: u32 = 234;

/// Raw error code reported by an OS call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OsError {
    pub code: u32,
}

impl OsError {
    pub fn new(code: u32) -> Self {
        Self { code }
    }

    /// Capture the calling thread's last OS error
    pub fn last() -> Self {
        let code = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        Self { code: code as u32 }
    }

    pub fn is_more_data(&self) -> bool {
        self.code == ERROR_MORE_DATA
    }
}

impl fmt::Display for OsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OS error code {}", self.code)
    }
}

impl std::error::Error for OsError {}

/// Errors surfaced by the resource group, host channel, process supervisor,
/// network isolation and container layers
#[derive(Debug, Error)]
pub enum ContainmentError {
    #[error("Unable to create resource group: {0}")]
    ResourceGroupCreationFailed(#[source] OsError),

    #[error("{0} has been disposed")]
    ObjectDisposed(&'static str),

    #[error("{name} must be between {min} and {max}, got {value}")]
    ArgumentOutOfRange {
        name: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    #[error("{operation} failed: {source}")]
    Os {
        operation: &'static str,
        #[source]
        source: OsError,
    },

    #[error("Host communication failed: {0}")]
    HostCommunicationFailed(String),

    #[error("Host rejected request ({code}): {message}")]
    HostRejected { code: i32, message: String },

    #[error("Host channel is closed")]
    ChannelClosed,

    #[error("Error reserving port '{port}' for user '{principal}'")]
    PortReservationFailed {
        port: u16,
        principal: String,
        #[source]
        source: Box<ContainmentError>,
    },

    #[error("Error provisioning firewall rule for user '{principal}'")]
    FirewallRuleFailed {
        principal: String,
        #[source]
        source: Box<ContainmentError>,
    },

    #[error("{command} exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ContainmentError {
    /// Wrap an OS failure with the name of the operation that produced it
    pub fn os(operation: &'static str, source: OsError) -> Self {
        ContainmentError::Os { operation, source }
    }

    /// OS error code carried by this error, if any
    pub fn os_code(&self) -> Option<u32> {
        match self {
            ContainmentError::ResourceGroupCreationFailed(e) => Some(e.code),
            ContainmentError::Os { source, .. } => Some(source.code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_error_display_carries_operation_and_code() {
        let err = ContainmentError::os("SetInformationJobObject", OsError::new(5));
        assert_eq!(
            err.to_string(),
            "SetInformationJobObject failed: OS error code 5"
        );
        assert_eq!(err.os_code(), Some(5));
    }

    #[test]
    fn test_more_data_detection() {
        assert!(OsError::new(ERROR_MORE_DATA).is_more_data());
        assert!(!OsError::new(5).is_more_data());
    }

    #[test]
    fn test_port_reservation_failure_keeps_source() {
        let err = ContainmentError::PortReservationFailed {
            port: 8080,
            principal: "c_user".to_string(),
            source: Box::new(ContainmentError::InvalidArgument("boom".to_string())),
        };
        assert_eq!(
            err.to_string(),
            "Error reserving port '8080' for user 'c_user'"
        );
        assert!(std::error::Error::source(&err).is_some());
    }
}
