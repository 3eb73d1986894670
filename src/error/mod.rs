//! Error types for integrator code export

use thiserror::Error;

use crate::integrator::{IntegratorKind, SensitivityMode};

/// Errors reported by the code generation core.
///
/// All conditions are detected synchronously at the point of the offending
/// call. Generation is deterministic: retrying with the same input produces
/// the same outcome.
#[derive(Debug, Error)]
pub enum CodegenError {
    /// Illegal operator or shape combination in an arithmetic statement
    #[error("unsupported statement shape: {0}")]
    UnsupportedStatementShape(String),

    /// Declared partition sizes and supplied matrix shapes disagree
    #[error(
        "inconsistent dimensions for the {partition} partition: \
         expected {expected}, got {got}"
    )]
    InconsistentPartitionDimensions {
        partition: &'static str,
        expected: String,
        got: String,
    },

    /// `setup()` called with no right-hand side configured
    #[error("no model assigned: configure a right-hand side before setup()")]
    ModelNotAssigned,

    /// Registry lookup miss
    #[error("no such integrator: {0:?} is not registered")]
    UnknownIntegratorType(IntegratorKind),

    /// An integrator tag was registered twice
    #[error("integrator {0:?} is already registered")]
    AlreadyRegistered(IntegratorKind),

    /// Setter invoked after `setup()`, or emission invoked before it
    #[error("invalid state transition: {0}")]
    InvalidStateTransition(String),

    /// The requested sensitivity mode is not generated by this scheme
    #[error("sensitivity mode {0:?} is not supported by this integrator")]
    UnsupportedSensitivityMode(SensitivityMode),

    /// A configuration that no code can be generated for
    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    /// Malformed integration grid
    #[error("invalid grid: {0}")]
    InvalidGrid(String),

    /// Writing into the caller-supplied output target failed
    #[error("failed to write exported code: {0}")]
    Format(#[from] std::fmt::Error),
}
