//! ==============================================================================
//! error.rs - failure taxonomy for the bridge
//! ==============================================================================
//!
//! purpose:
//!     one error type per failure domain so the bridge loop can decide what to
//!     do: drop a frame, skip an iteration, stop, or report to the operator.
//!
//!     ConnectError    -> fatal to one connect attempt, shown to the operator
//!     FrameError      -> bad bytes on the wire, frame dropped, loop continues
//!     ValidationError -> valid json that is not a reading, frame dropped
//!     ServiceError    -> upstream call failed, logged, loop continues
//!     ControllerError -> connect/disconnect requests that cannot be honoured
//!
//! "timeout" and "closed" are not errors here; they are outcomes of
//! `session::ReadOutcome`.
//!
//! ==============================================================================

use thiserror::Error;

/// Opening the device failed.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("failed to open {port}: {reason}")]
    Open { port: String, reason: String },

    #[error("{port} did not settle after opening: {reason}")]
    Unstable { port: String, reason: String },
}

/// A complete line from the device could not be turned into a json value.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is not valid utf-8 (bytes: {preview})")]
    Utf8 { preview: String },

    #[error("frame is not valid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame exceeded {limit} bytes without a delimiter ({len} buffered)")]
    Oversized { len: usize, limit: usize },
}

/// A frame decoded fine but is not a usable sensor reading.
#[derive(Debug, Error)]
#[error("invalid sensor reading: {0}")]
pub struct ValidationError(pub String);

/// Broad class of a service failure, used for logging and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Timeout,
    Network,
    ClientError,
    ServerError,
    Decode,
}

impl std::fmt::Display for StatusClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StatusClass::Timeout => "timeout",
            StatusClass::Network => "network",
            StatusClass::ClientError => "4xx",
            StatusClass::ServerError => "5xx",
            StatusClass::Decode => "decode",
        };
        f.write_str(s)
    }
}

/// A data-service call failed.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("request timed out after {attempts} attempt(s)")]
    Timeout { attempts: u32 },

    #[error("network error: {0}")]
    Network(String),

    #[error("service answered {status}: {message}")]
    Status { status: u16, message: String },

    #[error("unexpected response body: {0}")]
    Decode(String),
}

impl ServiceError {
    pub fn class(&self) -> StatusClass {
        match self {
            ServiceError::Timeout { .. } => StatusClass::Timeout,
            ServiceError::Network(_) => StatusClass::Network,
            ServiceError::Status { status, .. } if *status < 500 => StatusClass::ClientError,
            ServiceError::Status { .. } => StatusClass::ServerError,
            ServiceError::Decode(_) => StatusClass::Decode,
        }
    }
}

/// Lifecycle requests the controller refuses.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("already connected to {0}; disconnect first")]
    AlreadyConnected(String),

    #[error(transparent)]
    Connect(#[from] ConnectError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_class_splits_client_and_server_errors() {
        let bad_request = ServiceError::Status { status: 400, message: "missing".into() };
        let crashed = ServiceError::Status { status: 503, message: "down".into() };
        assert_eq!(bad_request.class(), StatusClass::ClientError);
        assert_eq!(crashed.class(), StatusClass::ServerError);
        assert_eq!(ServiceError::Timeout { attempts: 2 }.class(), StatusClass::Timeout);
    }

    #[test]
    fn already_connected_names_the_port() {
        let err = ControllerError::AlreadyConnected("/dev/ttyACM0".into());
        assert!(err.to_string().contains("/dev/ttyACM0"));
    }
}
