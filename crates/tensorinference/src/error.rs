//! Error types for tensor-network inference.

use thiserror::Error;

/// Errors that can occur while building or querying a model.
#[derive(Error, Debug)]
pub enum InferenceError {
    /// A factor's tensor dimension disagrees with the declared variable cardinality
    #[error("Cardinality mismatch for variable {var}: expected {expected}, got {got}")]
    CardinalityMismatch {
        var: usize,
        expected: usize,
        got: usize,
    },

    /// Shape mismatch in tensor operations
    #[error("Dimension mismatch: expected {expected:?}, got {got:?}")]
    DimensionMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// Variable is not part of the model
    #[error("Variable {0} not found")]
    VariableNotFound(usize),

    /// Factor violates its construction invariants
    #[error("Invalid factor: {0}")]
    InvalidFactor(String),

    /// Evidence is out of range or overlaps marginalized variables
    #[error("Invalid evidence: {0}")]
    InvalidEvidence(String),

    /// A configuration passed to a query does not match the model variables
    #[error("Domain error: {0}")]
    Domain(String),

    /// The contraction plan does not describe the tensor network
    #[error("Invalid contraction plan: {0}")]
    InvalidPlan(String),

    /// Cluster partition for marginal-MAP is inconsistent
    #[error("Invalid cluster: {0}")]
    InvalidCluster(String),

    /// An intermediate tensor exceeds the configured size limit
    #[error("Contraction needs a tensor of {requested} elements, limit is {limit}")]
    ResourceExhausted { requested: u128, limit: usize },

    /// Malformed model file
    #[error("Parse error in {source_name}: {message}")]
    Parse {
        source_name: String,
        message: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl InferenceError {
    /// Convenience constructor for parse errors.
    pub fn parse(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            source_name: source_name.into(),
            message: message.into(),
        }
    }
}

/// Result type for inference operations.
pub type Result<T> = std::result::Result<T, InferenceError>;
