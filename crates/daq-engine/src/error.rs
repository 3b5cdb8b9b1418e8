//! Error types for engine operations.
//!
//! Every session, buffer and coordinator call returns one specific member of
//! [`EngineError`], so callers can tell "stop and report" conditions
//! ([`EngineError::is_fatal`]) from "retry is reasonable" ones
//! ([`EngineError::is_retryable`]).

use std::time::Duration;

use thiserror::Error;

use crate::device::SubsystemKind;
use crate::session::SessionState;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur while configuring or running a session.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Invalid channel list, rate, buffer sizing or other configuration value
    #[error("Invalid configuration: {message}")]
    Configuration { message: String },

    /// Malformed codec metadata (resolution, range, packing layout)
    #[error("Codec error: {message}")]
    Codec { message: String },

    /// Subsystem already claimed by another session
    #[error("Subsystem {kind} is busy (already claimed by another session)")]
    DeviceBusy { kind: SubsystemKind },

    /// Operation not legal from the session's current state
    #[error("Cannot {operation} a session in state {state}")]
    InvalidTransition {
        operation: &'static str,
        state: SessionState,
    },

    /// Acquisition data was overwritten before the consumer handled it
    #[error("Buffer overrun on {kind}: {message}")]
    BufferOverrun { kind: SubsystemKind, message: String },

    /// Buffer bookkeeping failure reported by the device (overrun/underrun)
    #[error("Buffer error on {kind}: {message}")]
    BufferError { kind: SubsystemKind, message: String },

    /// Hardware halted unexpectedly
    #[error("Subsystem {kind} stopped unexpectedly")]
    Stopped { kind: SubsystemKind },

    /// No event of interest arrived within the timeout
    #[error("Timed out after {timeout:?} waiting for {waiting_for}")]
    Timeout {
        waiting_for: &'static str,
        timeout: Duration,
    },

    /// Coordinator was stopped while the caller was waiting
    #[error("Operation aborted: coordinator is shutting down")]
    Aborted,

    /// Failure reported by the device collaborator
    #[error("Device error: {message}")]
    Device { message: String },
}

impl EngineError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub(crate) fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Check if the caller may reasonably retry the failed wait.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if the error is fatal to the affected session.
    ///
    /// A fatal error must be followed by `stop()`; the session refuses to be
    /// restarted until it has been torn down.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::BufferOverrun { .. } | Self::BufferError { .. } | Self::Stopped { .. }
        )
    }

    /// Check if this is a configuration-time failure.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. } | Self::Codec { .. })
    }

    /// Check if the subsystem is busy.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::DeviceBusy { .. })
    }
}

impl From<figment::Error> for EngineError {
    fn from(err: figment::Error) -> Self {
        Self::config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::DeviceBusy {
            kind: SubsystemKind::AnalogInput,
        };
        assert!(err.to_string().contains("Analog Input"));

        let err = EngineError::InvalidTransition {
            operation: "start",
            state: SessionState::Unconfigured,
        };
        assert_eq!(err.to_string(), "Cannot start a session in state unconfigured");
    }

    #[test]
    fn test_classification() {
        let timeout = EngineError::Timeout {
            waiting_for: "frame",
            timeout: Duration::from_millis(10),
        };
        assert!(timeout.is_retryable());
        assert!(!timeout.is_fatal());

        let overrun = EngineError::BufferOverrun {
            kind: SubsystemKind::AnalogInput,
            message: "frame 3 overwritten".to_string(),
        };
        assert!(overrun.is_fatal());
        assert!(!overrun.is_retryable());

        assert!(EngineError::codec("zero resolution").is_configuration());
        assert!(EngineError::config("no channels").is_configuration());
        assert!(!EngineError::Aborted.is_configuration());
    }
}
