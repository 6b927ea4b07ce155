//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the hardware and
//! camera layers. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the kinds of errors a Basler camera can produce,
//! from transport-layer lookups to GenICam node access and grab failures.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment`, typically file parsing or type
//!   mismatches in the configuration.
//! - **`Configuration`**: Semantic errors in the configuration that pass parsing but
//!   are logically incorrect (e.g. a binning factor the viewer does not offer).
//! - **`Io`**: Wraps standard `std::io::Error`.
//! - **`CameraNotFound`** / **`CameraNotOpen`** / **`CameraRemoved`**: device lifecycle.
//! - **`NodeNotAvailable`** / **`NodeOutOfRange`** / **`NodeLocked`** /
//!   **`NodeTypeMismatch`**: GenICam feature access, mirroring the exceptions the
//!   Pylon SDK raises.
//! - **`Timeout`** / **`GrabFailed`**: frame acquisition.
//! - **`FeatureNotEnabled`**: functionality (like the real Pylon backend) that was
//!   not included at compile time via feature flags.
//!
//! Actor handlers and the binary convert these into `anyhow::Error` with `?`.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Errors raised by the camera stack.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Configuration could not be loaded or parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration loaded but failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No device with this name is known to the transport layer.
    #[error("Camera with name {0} not found anymore.")]
    CameraNotFound(String),

    /// The handle does not refer to an opened device.
    #[error("Camera not open: {0}")]
    CameraNotOpen(String),

    /// The device disappeared from the bus.
    #[error("Camera {0} has been removed")]
    CameraRemoved(String),

    /// The controller has not been initialized yet.
    #[error("Camera not initialized")]
    NotInitialized,

    /// The camera does not expose this GenICam node.
    #[error("Node '{0}' is not available on this camera")]
    NodeNotAvailable(String),

    /// The value is outside the node's range or off its increment grid.
    #[error("Value {value} out of range for node '{node}' ({constraint})")]
    NodeOutOfRange {
        /// Node name.
        node: String,
        /// Rejected value, formatted.
        value: String,
        /// Human-readable description of the violated constraint.
        constraint: String,
    },

    /// The node cannot be written while the camera is grabbing.
    #[error("Node '{0}' is locked while grabbing")]
    NodeLocked(String),

    /// The value type does not match the node type.
    #[error("Node '{node}' expects a {expected} value")]
    NodeTypeMismatch {
        /// Node name.
        node: String,
        /// Expected node kind.
        expected: &'static str,
    },

    /// A grab did not complete in time.
    #[error("Grabbing exceeded timeout of {0} ms")]
    Timeout(u64),

    /// The SDK reported an unsuccessful grab result.
    #[error("Grab failed with code {code}, {description}.")]
    GrabFailed {
        /// SDK error code.
        code: u32,
        /// SDK error description.
        description: String,
    },

    /// Acquisition state does not allow this operation.
    #[error("Acquisition error: {0}")]
    Acquisition(String),

    /// Data export or processing failure.
    #[error("Data processing error: {0}")]
    Processing(String),

    /// Vendor SDK failure not covered by a more specific variant.
    #[error("Pylon error: {0}")]
    Pylon(String),

    /// Functionality compiled out.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

impl From<arrow::error::ArrowError> for DaqError {
    fn from(err: arrow::error::ArrowError) -> Self {
        DaqError::Processing(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::CameraNotFound("Basler daA1280-54um (40123456)".to_string());
        assert_eq!(
            err.to_string(),
            "Camera with name Basler daA1280-54um (40123456) not found anymore."
        );
    }

    #[test]
    fn test_grab_failed_display() {
        let err = DaqError::GrabFailed {
            code: 3774873620,
            description: "The buffer was incompletely grabbed".into(),
        };
        assert_eq!(
            err.to_string(),
            "Grab failed with code 3774873620, The buffer was incompletely grabbed."
        );
    }

    #[test]
    fn test_node_out_of_range_display() {
        let err = DaqError::NodeOutOfRange {
            node: "Width".into(),
            value: "5000".into(),
            constraint: "max 1280".into(),
        };
        assert!(err.to_string().contains("Width"));
        assert!(err.to_string().contains("max 1280"));
    }
}
